//! The per-branch state machine.
//!
//! Each `BranchEngine` is a single-consumer worker: operations submitted
//! to it run strictly sequentially on a dedicated thread, which is the
//! entire basis for the at-most-one-process invariant.
//! Callers either block on an operation's result (`submit`) or read the
//! current [`BranchSnapshot`] without touching the worker at all
//! (`snapshot`).

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, Receiver, Sender};

pub use crate::command::ExitCode;

use crate::command::{CommandRunner, CommandSpec, ContainerContext, RunningProcess};
use crate::config::{DockerConfig, ProjectConfig};
use crate::docker;
use crate::git::{GitStatus, Repository};
use crate::makefile::{self, ParsedMakefile};
use crate::metadata::{MetadataRow, MetadataStore};

#[derive(Debug)]
pub enum EngineError {
    Git(crate::git::GitError),
    Docker(docker::DockerError),
    Metadata(crate::metadata::MetadataError),
    WorkerGone,
    UnknownGitAction(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Git(e) => write!(f, "{e}"),
            EngineError::Docker(e) => write!(f, "{e}"),
            EngineError::Metadata(e) => write!(f, "{e}"),
            EngineError::WorkerGone => write!(f, "branch engine worker is no longer running"),
            EngineError::UnknownGitAction(key) => write!(f, "unknown git action '{key}'"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<crate::git::GitError> for EngineError {
    fn from(e: crate::git::GitError) -> Self {
        EngineError::Git(e)
    }
}
impl From<docker::DockerError> for EngineError {
    fn from(e: docker::DockerError) -> Self {
        EngineError::Docker(e)
    }
}
impl From<crate::metadata::MetadataError> for EngineError {
    fn from(e: crate::metadata::MetadataError) -> Self {
        EngineError::Metadata(e)
    }
}

/// The branch engine's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum State {
    Idle,
    Preparing,
    Running,
    Cancelling,
    Deleted,
}

/// Public, read-only projection of one branch engine's state
///.
#[derive(Debug, Clone)]
pub struct BranchSnapshot {
    pub project: String,
    pub name: String,
    pub state: State,
    pub action: String,
    pub command: String,
    pub exit_code: ExitCode,
    pub start_time: Option<i64>,
    pub run_time_ms: Option<u64>,
    pub cancelled: bool,
    pub git_status: GitStatus,
    pub makefile: Option<ParsedMakefile>,
    pub console: String,
}

impl BranchSnapshot {
    fn new(project: &str, name: &str) -> Self {
        Self {
            project: project.to_string(),
            name: name.to_string(),
            state: State::Idle,
            action: String::new(),
            command: String::new(),
            exit_code: ExitCode::Pending,
            start_time: None,
            run_time_ms: None,
            cancelled: false,
            git_status: GitStatus::default(),
            makefile: None,
            console: String::new(),
        }
    }
}

/// Operations the branch engine accepts.
#[derive(Debug, Clone)]
pub enum Operation {
    Refresh,
    RunMake { target: String },
    RunGit { key: String, commit_message: Option<String> },
    RunView { path: String, query: String },
    Cancel,
    RebuildContainer,
    StoreCreds { credentials_line: String },
    RemoveCreds,
    CheckoutRemote { branch: String, remote_url: String },
    CreateLocal { name: String, base: String, remote_url: String },
    DeleteLocal { make_clean: bool },
}

/// Everything a branch engine needs to own for the lifetime of one
/// (project, branch) pair.
pub struct EngineContext {
    pub project: String,
    pub branch: String,
    pub project_config: ProjectConfig,
    pub workspace_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub console_path: PathBuf,
    pub metadata: Arc<MetadataStore>,
    pub default_command_timeout: Duration,
    /// `user.name`/`user.email` for commits and `git config`, from the
    /// top-level `github-user-name`/`github-user-email` config keys —
    /// not per-project, since every branch workspace commits as the same
    /// configured identity.
    pub github_user_name: Option<String>,
    pub github_user_email: Option<String>,
}

/// A running branch engine: a dedicated worker thread plus a shared,
/// lock-guarded snapshot callers can read without enqueueing anything.
pub struct BranchEngine {
    op_tx: Sender<(Operation, Sender<BranchSnapshot>)>,
    snapshot: Arc<Mutex<BranchSnapshot>>,
    _worker: JoinHandle<()>,
}

impl BranchEngine {
    pub fn spawn(ctx: EngineContext) -> Self {
        let snapshot = Arc::new(Mutex::new(BranchSnapshot::new(&ctx.project, &ctx.branch)));
        let (op_tx, op_rx): (Sender<(Operation, Sender<BranchSnapshot>)>, Receiver<_>) =
            bounded(64);

        if let Ok(Some(seed)) = ctx.metadata.get(&ctx.project, &ctx.branch) {
            let mut guard = snapshot.lock().expect("snapshot mutex poisoned");
            guard.action = seed.action;
            guard.command = seed.command;
            guard.cancelled = seed.cancelled;
            guard.exit_code = seed
                .exit_code
                .map(ExitCode::Resolved)
                .unwrap_or(ExitCode::Pending);
            guard.start_time = Some(seed.start_time);
        }

        let worker_snapshot = Arc::clone(&snapshot);
        let worker = std::thread::spawn(move || {
            let mut worker = Worker::new(ctx, worker_snapshot);
            while let Ok((op, reply)) = op_rx.recv() {
                let result = worker.handle(op);
                let _ = reply.send(result);
            }
        });

        Self {
            op_tx,
            snapshot,
            _worker: worker,
        }
    }

    /// Read the current state without enqueueing an operation.
    pub fn snapshot(&self) -> BranchSnapshot {
        self.snapshot.lock().expect("snapshot mutex poisoned").clone()
    }

    /// Enqueue `op` and block until the worker has processed it,
    /// returning the resulting snapshot. Operations on one engine run
    /// strictly in submission order.
    pub fn submit(&self, op: Operation) -> Result<BranchSnapshot, EngineError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.op_tx
            .send((op, reply_tx))
            .map_err(|_| EngineError::WorkerGone)?;
        reply_rx.recv().map_err(|_| EngineError::WorkerGone)
    }
}

/// Internal, mutable worker state. Only ever touched from the worker
/// thread.
struct Worker {
    project: String,
    branch: String,
    project_config: ProjectConfig,
    workspace_dir: PathBuf,
    temp_dir: PathBuf,
    console_path: PathBuf,
    metadata: Arc<MetadataStore>,
    default_command_timeout: Duration,
    github_user_name: Option<String>,
    github_user_email: Option<String>,
    repo: Repository,
    container_name: String,
    process: Option<RunningProcess>,
    snapshot: Arc<Mutex<BranchSnapshot>>,
}

impl Worker {
    fn new(ctx: EngineContext, snapshot: Arc<Mutex<BranchSnapshot>>) -> Self {
        let repo = Repository::at(ctx.workspace_dir.clone());
        let container_name = docker::container_name(&ctx.project, &ctx.branch);
        Self {
            project: ctx.project,
            branch: ctx.branch,
            project_config: ctx.project_config,
            workspace_dir: ctx.workspace_dir,
            temp_dir: ctx.temp_dir,
            console_path: ctx.console_path,
            metadata: ctx.metadata,
            default_command_timeout: ctx.default_command_timeout,
            github_user_name: ctx.github_user_name,
            github_user_email: ctx.github_user_email,
            repo,
            container_name,
            process: None,
            snapshot,
        }
    }

    fn docker_config(&self) -> Option<&DockerConfig> {
        self.project_config
            .docker
            .as_ref()
            .filter(|d| !d.disabled)
    }

    fn handle(&mut self, op: Operation) -> BranchSnapshot {
        match op {
            Operation::Refresh => self.refresh(),
            Operation::RunMake { target } => self.run_make(&target),
            Operation::RunGit { key, commit_message } => self.run_git(&key, commit_message),
            Operation::RunView { path, query } => self.run_view(&path, &query),
            Operation::Cancel => self.cancel(),
            Operation::RebuildContainer => self.rebuild_container(),
            Operation::StoreCreds { credentials_line } => self.store_creds(&credentials_line),
            Operation::RemoveCreds => self.remove_creds(),
            Operation::CheckoutRemote { branch, remote_url } => {
                self.checkout_remote(&branch, &remote_url)
            }
            Operation::CreateLocal { name, base, remote_url } => {
                self.create_local(&name, &base, &remote_url)
            }
            Operation::DeleteLocal { make_clean } => self.delete_local(make_clean),
        }
    }

    fn update_snapshot(&self, f: impl FnOnce(&mut BranchSnapshot)) -> BranchSnapshot {
        let mut guard = self.snapshot.lock().expect("snapshot mutex poisoned");
        let previous_state = guard.state;
        f(&mut guard);
        if guard.state != previous_state {
            log::info!(
                "{}/{}: {previous_state} -> {}",
                guard.project, guard.name, guard.state
            );
        }
        let persisted = MetadataRow {
            project_name: guard.project.clone(),
            branch_name: guard.name.clone(),
            action: guard.action.clone(),
            cancelled: guard.cancelled,
            command: guard.command.clone(),
            exit_code: match guard.exit_code {
                ExitCode::Resolved(code) => Some(code),
                ExitCode::Timeout => Some(1),
                ExitCode::Pending => None,
            },
            start_time: guard.start_time.unwrap_or(0),
        };
        // Invariant guard observed: persist before returning the
        // snapshot to the caller of this operation. A
        // failure here is logged, not fatal — the store is only
        // authoritative across restarts.
        if let Err(e) = self.metadata.upsert(&persisted) {
            log::warn!("failed to persist metadata for {}/{}: {e}", guard.project, guard.name);
        }
        guard.clone()
    }

    fn now_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Re-read the Makefile (if its mtime changed), git status, and
    /// console file; update run-time if a process is live.
    fn refresh(&mut self) -> BranchSnapshot {
        let makefile_path = self.workspace_dir.join(&self.project_config.makefile_path);
        let makefile = makefile::parse(&makefile_path).ok().flatten();
        let git_status = self.repo.status().unwrap_or_default();
        let console = std::fs::read_to_string(&self.console_path).unwrap_or_default();

        let resolved_exit_code = self.process.as_ref().map(|p| p.wait());
        if let Some(exit_code) = resolved_exit_code {
            if !matches!(exit_code, ExitCode::Pending) {
                // The process has exited; drop it so a later `cancel`
                // sees an idle branch (no-op) instead of re-killing and
                // re-cancelling an already-finished process.
                self.process = None;
            }
        }

        self.update_snapshot(|snapshot| {
            snapshot.makefile = makefile;
            snapshot.git_status = git_status;
            snapshot.console = console;
            if let Some(exit_code) = resolved_exit_code {
                snapshot.exit_code = exit_code;
                if !matches!(exit_code, ExitCode::Pending) {
                    snapshot.state = State::Idle;
                }
            }
            if let (Some(start), ExitCode::Pending) = (snapshot.start_time, snapshot.exit_code) {
                snapshot.run_time_ms = Some((Self::now_ms() - start).max(0) as u64);
            }
        })
    }

    /// The branch/HEAD consistency guard: substitute an
    /// echo-and-fail command when the workspace's HEAD doesn't name this
    /// engine's branch.
    fn guarded_spec(&self, argv: Vec<String>) -> CommandSpec {
        match self.repo.head_matches_branch(&self.branch) {
            Ok(true) => CommandSpec::new(argv)
                .with_dir(self.workspace_dir.clone())
                .with_timeout(self.default_command_timeout),
            Ok(false) | Err(_) => {
                let message = format!(
                    "Refusing to run command: workspace HEAD does not match the HEAD of branch '{}'",
                    self.branch
                );
                CommandSpec::new(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("echo {message:?} 1>&2; exit 1"),
                ])
            }
        }
    }

    /// Make sure the branch's container is running before a command is
    /// wrapped for it. Tolerates both cases left open by startup, which
    /// never builds or starts containers itself: if the container
    /// already exists, `docker start` is
    /// enough; if it was never created (first run after a fresh
    /// checkout, or after `reset-all`), create it on demand.
    fn ensure_container(&self, docker: &DockerConfig) {
        match docker::start(&self.container_name) {
            Ok(()) => {}
            Err(docker::DockerError::CommandFailed { stderr, .. })
                if docker::is_no_such_container(&stderr) =>
            {
                match docker::create_and_start(
                    &self.container_name,
                    docker,
                    &self.workspace_dir,
                    &self.temp_dir,
                ) {
                    Ok(output) => self.append_console(&output),
                    Err(e) => log::warn!("failed to create container {}: {e}", self.container_name),
                }
            }
            Err(e) => log::warn!("failed to start container {}: {e}", self.container_name),
        }
    }

    /// Append text to the branch's console file, as plain container
    /// creation output (not wrapped through `CommandRunner`, which owns
    /// the console for user-visible command output).
    fn append_console(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        use std::io::Write;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.console_path);
        match file {
            Ok(mut file) => {
                let _ = writeln!(file, "{text}");
            }
            Err(e) => log::warn!("failed to append container output to console for {}/{}: {e}", self.project, self.branch),
        }
    }

    fn launch(&mut self, action: &str, display_command: &str, spec: CommandSpec) -> BranchSnapshot {
        self.kill_current_process();

        if let Some(docker) = self.docker_config() {
            self.ensure_container(docker);
        }

        let container_ctx = self.docker_config().map(|docker| ContainerContext {
            container: self.container_name.as_str(),
            docker,
            host_workspace: self.workspace_dir.as_path(),
            host_temp: self.temp_dir.as_path(),
        });

        let process = CommandRunner::spawn(&spec, container_ctx.as_ref(), &self.console_path);
        let start_time = Self::now_ms();
        self.process = Some(process);

        self.update_snapshot(|snapshot| {
            snapshot.state = State::Running;
            snapshot.action = action.to_string();
            snapshot.command = display_command.to_string();
            snapshot.exit_code = ExitCode::Pending;
            snapshot.start_time = Some(start_time);
            snapshot.run_time_ms = Some(0);
            snapshot.cancelled = false;
        })
    }

    fn run_make(&mut self, target: &str) -> BranchSnapshot {
        let makefile_path = self.workspace_dir.join(&self.project_config.makefile_path);
        let makefile = makefile::parse(&makefile_path).ok().flatten();
        let known = makefile
            .as_ref()
            .map(|m| m.general_actions().iter().any(|t| *t == target))
            .unwrap_or(false);
        if !known {
            log::warn!("run-make: unknown target '{target}' on {}/{}", self.project, self.branch);
            return self.snapshot.lock().expect("snapshot mutex poisoned").clone();
        }

        let argv = vec!["make".to_string(), target.to_string()];
        let display = format!("make {target}");
        let spec = self.guarded_spec(argv);
        self.launch(target, &display, spec)
    }

    fn run_git(&mut self, key: &str, commit_message: Option<String>) -> BranchSnapshot {
        let Some(action) = makefile::git_action_by_key(key) else {
            log::warn!("run-git: unknown action '{key}' on {}/{}", self.project, self.branch);
            return self.snapshot.lock().expect("snapshot mutex poisoned").clone();
        };

        let command = match (key, commit_message) {
            ("git-commit" | "git-amend", Some(ref msg)) if !msg.trim().is_empty() => {
                let mut rendered = action.command_template.replacen("<msg>", msg, 1);
                if key == "git-commit" {
                    let name = self
                        .github_user_name
                        .as_deref()
                        .unwrap_or("droid-bot");
                    let email = self
                        .github_user_email
                        .as_deref()
                        .unwrap_or("droid-bot@users.noreply.github.com");
                    rendered = rendered.replacen("<name>", name, 1).replacen("<email>", email, 1);
                }
                rendered
            }
            ("git-commit" | "git-amend", _) => {
                log::warn!("run-git: empty commit message for {key} on {}/{}", self.project, self.branch);
                return self.snapshot.lock().expect("snapshot mutex poisoned").clone();
            }
            _ => action.command_template.to_string(),
        };

        // Run through a shell: commit/amend templates carry quoted
        // `<msg>`/`<name>`/`<email>` substitutions that a naive
        // whitespace split would mangle.
        let argv = vec!["sh".to_string(), "-c".to_string(), command.clone()];
        let spec = self.guarded_spec(argv);
        self.launch(key, &command, spec)
    }

    fn run_view(&mut self, path: &str, query: &str) -> BranchSnapshot {
        let makefile_path = self.workspace_dir.join(&self.project_config.makefile_path);
        let makefile = makefile::parse(&makefile_path).ok().flatten();

        let is_exec = makefile
            .as_ref()
            .map(|m| m.exec_views().iter().any(|p| *p == path))
            .unwrap_or(false);

        let (argv, display) = if is_exec {
            let mut argv = vec![format!("./{path}")];
            if !query.is_empty() {
                argv.extend(query.split_whitespace().map(str::to_string));
            }
            (argv.clone(), argv.join(" "))
        } else {
            (
                vec!["make".to_string(), path.to_string()],
                format!("make {path}"),
            )
        };

        let spec = self.guarded_spec(argv);
        self.launch(path, &display, spec)
    }

    /// The cancellation protocol.
    fn cancel(&mut self) -> BranchSnapshot {
        let Some(process) = self.process.as_ref() else {
            return self.snapshot.lock().expect("snapshot mutex poisoned").clone();
        };

        self.update_snapshot(|snapshot| snapshot.state = State::Cancelling);

        if self.docker_config().is_some() {
            let command = self.snapshot.lock().expect("snapshot mutex poisoned").command.clone();
            if let Err(e) = docker::kill_matching_process(&self.container_name, &command) {
                log::info!(
                    "cancel: no in-container process matched on {}/{} ({e}); falling through to host-side kill",
                    self.project, self.branch
                );
            }
        }

        process.kill();
        self.process = None;

        self.update_snapshot(|snapshot| {
            snapshot.cancelled = true;
            snapshot.state = State::Idle;
            if matches!(snapshot.exit_code, ExitCode::Pending) {
                snapshot.exit_code = ExitCode::Resolved(1);
            }
        })
    }

    fn kill_current_process(&mut self) {
        if self.process.is_some() {
            self.cancel();
        }
    }

    /// Remove the container, then build (if a Dockerfile exists) or
    /// pull, then create and start.
    fn rebuild_container(&mut self) -> BranchSnapshot {
        let Some(docker) = self.docker_config().cloned() else {
            log::info!("rebuild-container: docker disabled for {}", self.project);
            return self.snapshot.lock().expect("snapshot mutex poisoned").clone();
        };

        self.kill_current_process();
        self.update_snapshot(|snapshot| snapshot.state = State::Preparing);

        if let Err(e) = docker::remove(&self.container_name) {
            log::warn!("rebuild-container: failed to remove {}: {e}", self.container_name);
        }

        let dockerfile = self.workspace_dir.join("Dockerfile");
        let build_result = if dockerfile.exists() {
            docker::build(&docker.image, &self.workspace_dir)
        } else {
            docker::pull(&docker.image)
        };
        if let Err(e) = build_result {
            log::warn!("rebuild-container: failed to prepare image for {}: {e}", self.container_name);
        }

        match docker::create_and_start(&self.container_name, &docker, &self.workspace_dir, &self.temp_dir) {
            Ok(output) => self.append_console(&output),
            Err(e) => log::warn!("rebuild-container: failed to start {}: {e}", self.container_name),
        }

        self.update_snapshot(|snapshot| snapshot.state = State::Idle)
    }

    fn store_creds(&mut self, credentials_line: &str) -> BranchSnapshot {
        if let Err(e) = self.repo.write_credentials(credentials_line) {
            log::warn!("store-creds failed for {}/{}: {e}", self.project, self.branch);
        }
        self.snapshot.lock().expect("snapshot mutex poisoned").clone()
    }

    fn remove_creds(&mut self) -> BranchSnapshot {
        if let Err(e) = self.repo.remove_credentials() {
            log::warn!("remove-creds failed for {}/{}: {e}", self.project, self.branch);
        }
        self.snapshot.lock().expect("snapshot mutex poisoned").clone()
    }

    /// `git clone --branch <name>`; ignore-gitignore patch; credential
    /// and identity config; `git fetch`. On any failure, delete the
    /// partial directory and return the previous state unchanged
    ///.
    fn checkout_remote(&mut self, branch: &str, remote_url: &str) -> BranchSnapshot {
        if !crate::git::is_valid_branch_name(branch) {
            log::warn!("checkout-remote: rejected unsafe branch name '{branch}' for {}", self.project);
            return self.snapshot.lock().expect("snapshot mutex poisoned").clone();
        }

        let outcome = (|| -> Result<(), crate::git::GitError> {
            self.repo.clone_branch(remote_url, branch, true)?;
            self.repo.ignore_git_credentials()?;
            if let (Some(name), Some(email)) =
                (self.github_user_name.as_deref(), self.github_user_email.as_deref())
            {
                self.repo.configure_identity(name, email)?;
            }
            self.repo.fetch()?;
            Ok(())
        })();

        if let Err(e) = outcome {
            log::warn!("checkout-remote failed for {}/{branch}: {e}", self.project);
            let _ = std::fs::remove_dir_all(&self.workspace_dir);
        }

        self.snapshot.lock().expect("snapshot mutex poisoned").clone()
    }

    /// Clone base, checkout a new branch, push it upstream, then remove
    /// credentials. On failure, clean up and return the previous state
    ///.
    fn create_local(&mut self, name: &str, base: &str, remote_url: &str) -> BranchSnapshot {
        if !crate::git::is_valid_branch_name(name) {
            log::warn!("create-local: rejected unsafe branch name '{name}' for {}", self.project);
            return self.snapshot.lock().expect("snapshot mutex poisoned").clone();
        }

        let outcome = (|| -> Result<(), crate::git::GitError> {
            self.repo.clone_branch(remote_url, base, false)?;
            self.repo.ignore_git_credentials()?;
            self.repo.checkout_new_branch(name)?;
            self.repo.push_set_upstream(name)?;
            self.repo.fetch()?;
            self.repo.remove_credentials()?;
            Ok(())
        })();

        if let Err(e) = outcome {
            log::warn!("create-local failed for {}/{name}: {e}", self.project);
            let _ = std::fs::remove_dir_all(&self.workspace_dir);
        }

        self.snapshot.lock().expect("snapshot mutex poisoned").clone()
    }

    /// Optionally `make -i -k clean`, remove the container, delete the
    /// workspace/temp directories.
    fn delete_local(&mut self, make_clean: bool) -> BranchSnapshot {
        self.kill_current_process();

        if make_clean {
            let makefile_path = self.workspace_dir.join(&self.project_config.makefile_path);
            let _ = CommandRunner::run_commands(&[CommandSpec::new(vec![
                "make".to_string(),
                "-i".to_string(),
                "-k".to_string(),
                "-f".to_string(),
                makefile_path.to_string_lossy().into_owned(),
                "clean".to_string(),
            ])]);
        }

        if self.docker_config().is_some() {
            if let Err(e) = docker::remove(&self.container_name) {
                log::warn!("delete-local: failed to remove container {}: {e}", self.container_name);
            }
        }

        let _ = std::fs::remove_dir_all(&self.workspace_dir);
        let _ = std::fs::remove_dir_all(&self.temp_dir);

        self.update_snapshot(|snapshot| snapshot.state = State::Deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn make_ctx(workspace_dir: PathBuf, temp_dir: PathBuf) -> EngineContext {
        std::fs::create_dir_all(&workspace_dir).unwrap();
        std::fs::create_dir_all(&temp_dir).unwrap();
        EngineContext {
            project: "widgets".to_string(),
            branch: "main".to_string(),
            project_config: ProjectConfig {
                github: "acme/widgets".to_string(),
                makefile_path: "Makefile".to_string(),
                env: BTreeMap::new(),
                docker: None,
                title: None,
                description: None,
            },
            workspace_dir,
            temp_dir: temp_dir.clone(),
            console_path: temp_dir.join("console.txt"),
            metadata: Arc::new(MetadataStore::open_in_memory().unwrap()),
            default_command_timeout: Duration::from_secs(5),
            github_user_name: None,
            github_user_email: None,
        }
    }

    #[test]
    fn cancel_on_idle_branch_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = make_ctx(dir.path().join("workspace"), dir.path().join("temp"));
        let engine = BranchEngine::spawn(ctx);
        let before = engine.snapshot();
        let after = engine.submit(Operation::Cancel).unwrap();
        assert_eq!(before.state, after.state);
        assert!(!after.cancelled);
    }

    #[test]
    fn unknown_make_target_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");
        let temp = dir.path().join("temp");
        let ctx = make_ctx(workspace.clone(), temp);
        std::fs::write(
            workspace.join("Makefile"),
            ".PHONY: clean\n### Workflow\n# [Clean](clean)\n",
        )
        .unwrap();
        let engine = BranchEngine::spawn(ctx);
        let snapshot = engine.submit(Operation::RunMake { target: "nonexistent".to_string() }).unwrap();
        assert_eq!(snapshot.state, State::Idle);
        assert!(snapshot.action.is_empty());
    }

    #[test]
    fn cancel_after_refresh_resolves_finished_process_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");
        let temp = dir.path().join("temp");
        let ctx = make_ctx(workspace.clone(), temp);
        std::fs::write(
            workspace.join("Makefile"),
            ".PHONY: clean\n### Workflow\n# [Clean](clean)\n",
        )
        .unwrap();
        let engine = BranchEngine::spawn(ctx);
        let running = engine.submit(Operation::RunMake { target: "clean".to_string() }).unwrap();
        assert_eq!(running.state, State::Running);

        // No `.git` dir exists, so the HEAD guard substitutes a fast
        // echo-and-fail command; give it time to exit.
        std::thread::sleep(Duration::from_millis(300));
        let refreshed = engine.submit(Operation::Refresh).unwrap();
        assert_eq!(refreshed.state, State::Idle);

        let after = engine.submit(Operation::Cancel).unwrap();
        assert_eq!(after.state, State::Idle);
        assert!(!after.cancelled);
    }

    #[test]
    fn seeds_from_prior_metadata_row() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");
        let temp = dir.path().join("temp");
        let mut ctx = make_ctx(workspace, temp);
        ctx.metadata
            .upsert(&MetadataRow {
                project_name: "widgets".to_string(),
                branch_name: "main".to_string(),
                action: "update".to_string(),
                cancelled: false,
                command: "make update".to_string(),
                exit_code: Some(0),
                start_time: 1000,
            })
            .unwrap();
        let engine = BranchEngine::spawn(ctx);
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.action, "update");
        assert_eq!(snapshot.command, "make update");
        assert_eq!(snapshot.exit_code, ExitCode::Resolved(0));
    }
}
