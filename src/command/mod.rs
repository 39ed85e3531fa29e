//! Uniform subprocess execution, with optional Docker-exec wrapping.
//!
//! Every user-visible command the branch engine launches — a Make
//! target, a git action, a view — goes through [`CommandRunner`]. It
//! never blocks on spawn; the caller polls or blocks on the returned
//! [`ExitCode`] handle, which also carries a timeout.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use wait_timeout::ChildExt;

use crate::config::DockerConfig;
use crate::docker;

/// A command to run, independent of whether it ends up wrapped for
/// Docker exec.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            dir: None,
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Context that scopes a command to a branch's Docker container, if any.
#[derive(Debug, Clone)]
pub struct ContainerContext<'a> {
    pub container: &'a str,
    pub docker: &'a DockerConfig,
    pub host_workspace: &'a Path,
    pub host_temp: &'a Path,
}

/// The sentinel a timed-out process resolves to, distinct from any real
/// exit code.
pub const TIMEOUT_EXIT_CODE: &str = "timeout";

/// Lazy exit-code value: pending while the process runs, then resolved
/// to either an integer status or the `timeout` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Pending,
    Resolved(i32),
    Timeout,
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCode::Pending => write!(f, "pending"),
            ExitCode::Resolved(code) => write!(f, "{code}"),
            ExitCode::Timeout => write!(f, "{TIMEOUT_EXIT_CODE}"),
        }
    }
}

/// A spawned process plus the running state the engine's worker needs to
/// observe and, eventually, resolve to a final [`ExitCode`].
pub struct RunningProcess {
    child: Arc<Mutex<Child>>,
    pub start_time: Instant,
    timeout: Option<Duration>,
    console_writers: Vec<std::thread::JoinHandle<()>>,
}

impl RunningProcess {
    /// The OS PID of the host-side process (the `docker exec` process
    /// itself, when Docker-wrapped — not the in-container PID).
    pub fn pid(&self) -> Option<u32> {
        self.child.lock().ok().map(|c| c.id())
    }

    /// Block until the process exits or `timeout` elapses, returning the
    /// resolved [`ExitCode`]. Races a blocking wait against a deadline
    /// using `wait_timeout`.
    pub fn wait(&self) -> ExitCode {
        let mut child = match self.child.lock() {
            Ok(guard) => guard,
            Err(_) => return ExitCode::Resolved(-1),
        };

        let result = match self.timeout {
            Some(timeout) => child.wait_timeout(timeout),
            None => child.wait().map(Some),
        };

        match result {
            Ok(Some(status)) => ExitCode::Resolved(status.code().unwrap_or(-1)),
            Ok(None) => ExitCode::Timeout,
            Err(_) => ExitCode::Resolved(-1),
        }
    }

    /// Destroy the host-side process. Part of the cancellation protocol
    /// — the container-side kill happens separately via
    /// [`docker::kill_matching_process`].
    ///
    /// On unix, the child was placed in its own process group at spawn
    /// time (see [`CommandRunner::spawn`]); killing the whole group
    /// catches children a wrapping shell (`sh -c ...`) may have spawned,
    /// not just the shell itself.
    pub fn kill(&self) {
        if let Ok(mut child) = self.child.lock() {
            #[cfg(unix)]
            Self::killpg(child.id());
            let _ = child.kill();
            let _ = child.wait();
        }
        // Each console writer thread exits on its own once its pipe end
        // closes (child killed/reaped above), no explicit join needed.
        let _ = &self.console_writers;
    }

    #[cfg(unix)]
    fn killpg(pid: u32) {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;
        // Negative pid targets the whole process group; spawn() put the
        // child in its own group so this reaches any grandchildren too.
        let _ = signal::kill(Pid::from_raw(-(pid as i32)), Signal::SIGTERM);
    }
}

/// Uniform subprocess execution, with Docker-exec wrapping and a console
/// capture sink.
pub struct CommandRunner;

impl CommandRunner {
    /// Spawn `spec`, optionally wrapped for execution inside
    /// `container`. Output is streamed to `console_path` (the branch's
    /// combined stdout+stderr capture file). Never fails to produce a
    /// process: if spawning itself errors, substitutes an
    /// echo-to-stderr command so the caller's (process, exit-code)
    /// contract holds and the failure is visible in the console.
    pub fn spawn(
        spec: &CommandSpec,
        container: Option<&ContainerContext<'_>>,
        console_path: &Path,
    ) -> RunningProcess {
        let (program, args, dir, env) = Self::build(spec, container);

        let mut command = Command::new(&program);
        command
            .args(&args)
            .current_dir(dir.as_deref().unwrap_or_else(|| Path::new(".")))
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // New process group per child, so `cancel` can kill a wrapping
        // shell's grandchildren via `killpg` instead of only the direct
        // child (spec.md §9 open question 3's "sturdier marker").
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let spawned = command.spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(e) => Self::spawn_failure_echo(&e.to_string()),
        };

        Self::attach(child, spec.timeout, console_path)
    }

    /// Run each command in `specs` sequentially to completion, failing
    /// fast on the first non-zero exit. Used
    /// for short chains of `git` invocations only.
    pub fn run_commands(specs: &[CommandSpec]) -> Result<(), String> {
        for spec in specs {
            let output = Command::new(&spec.argv[0])
                .args(&spec.argv[1..])
                .envs(&spec.env)
                .current_dir(spec.dir.as_deref().unwrap_or_else(|| Path::new(".")))
                .stdin(Stdio::null())
                .output()
                .map_err(|e| e.to_string())?;
            if !output.status.success() {
                return Err(String::from_utf8_lossy(&output.stderr).into_owned());
            }
        }
        Ok(())
    }

    fn build(
        spec: &CommandSpec,
        container: Option<&ContainerContext<'_>>,
    ) -> (String, Vec<String>, Option<PathBuf>, BTreeMap<String, String>) {
        let mut env = container.map(|c| c.docker.env.clone()).unwrap_or_default();
        env.extend(spec.env.clone());

        match container {
            Some(ctx) => {
                let working_dir = spec
                    .dir
                    .as_ref()
                    .map(|d| {
                        docker::translate_path(
                            &d.to_string_lossy(),
                            ctx.host_workspace,
                            ctx.host_temp,
                            ctx.docker,
                        )
                    })
                    .or_else(|| ctx.docker.default_working_dir.clone());

                let wrapped = docker::wrap_exec(
                    ctx.container,
                    &spec.argv,
                    working_dir.as_deref(),
                    &env,
                );
                ("docker".to_string(), wrapped, None, env)
            }
            None => {
                let (program, rest) = spec
                    .argv
                    .split_first()
                    .map(|(p, r)| (p.clone(), r.to_vec()))
                    .unwrap_or_default();
                (program, rest, spec.dir.clone(), env)
            }
        }
    }

    fn spawn_failure_echo(message: &str) -> Child {
        let escaped = shell_escape::escape(std::borrow::Cow::Borrowed(message));
        Command::new("sh")
            .arg("-c")
            .arg(format!("echo {escaped} 1>&2; exit 127"))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("sh must be available to run the spawn-failure fallback")
    }

    /// Stream stdout and stderr to `console_path` on their own threads.
    /// A single drain-stdout-then-stderr loop deadlocks as soon as a
    /// long-running command (an ordinary `make` build) fills the other
    /// pipe's OS buffer while this thread is blocked reading the first —
    /// the child then blocks on its own write and never reaches EOF on
    /// either stream. Separate threads share one file handle behind a
    /// mutex so the interleaved writes never tear a chunk in half.
    fn attach(mut child: Child, timeout: Option<Duration>, console_path: &Path) -> RunningProcess {
        let console = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(console_path)
            .ok()
            .map(|file| Arc::new(Mutex::new(file)));

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let mut console_writers = Vec::new();
        if let Some(console) = console {
            if let Some(out) = stdout {
                console_writers.push(Self::spawn_stream_writer(out, Arc::clone(&console)));
            }
            if let Some(err) = stderr {
                console_writers.push(Self::spawn_stream_writer(err, console));
            }
        }

        RunningProcess {
            child: Arc::new(Mutex::new(child)),
            start_time: Instant::now(),
            timeout,
            console_writers,
        }
    }

    fn spawn_stream_writer(
        mut reader: impl Read + Send + 'static,
        file: Arc<Mutex<std::fs::File>>,
    ) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let mut file = file.lock().expect("console file mutex poisoned");
                        if file.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn runs_a_simple_command_and_resolves_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let console = dir.path().join("console.txt");
        let spec = CommandSpec::new(vec!["true".to_string()]);
        let process = CommandRunner::spawn(&spec, None, &console);
        assert_eq!(process.wait(), ExitCode::Resolved(0));
    }

    #[test]
    fn nonzero_exit_is_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let console = dir.path().join("console.txt");
        let spec = CommandSpec::new(vec!["false".to_string()]);
        let process = CommandRunner::spawn(&spec, None, &console);
        assert_eq!(process.wait(), ExitCode::Resolved(1));
    }

    #[test]
    fn timeout_resolves_to_timeout_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let console = dir.path().join("console.txt");
        let spec = CommandSpec::new(vec!["sleep".to_string(), "5".to_string()])
            .with_timeout(Duration::from_millis(50));
        let process = CommandRunner::spawn(&spec, None, &console);
        let result = process.wait();
        assert_eq!(result, ExitCode::Timeout);
        process.kill();
    }

    #[test]
    fn failed_spawn_falls_back_to_echo() {
        let dir = tempfile::tempdir().unwrap();
        let console = dir.path().join("console.txt");
        let spec = CommandSpec::new(vec!["definitely-not-a-real-binary-xyz".to_string()]);
        let process = CommandRunner::spawn(&spec, None, &console);
        // the real spawn fails, but spawn() still returns a live process
        let result = process.wait();
        assert!(matches!(result, ExitCode::Resolved(_)));
    }

    #[test]
    fn docker_wrapping_passes_env_by_name() {
        let mut env = BTreeMap::new();
        env.insert("SECRET".to_string(), "hunter2".to_string());
        let docker = DockerConfig {
            disabled: false,
            image: "acme/widgets:latest".to_string(),
            workspace_dir: "/workspace".to_string(),
            temp_dir: "/tmp/droid".to_string(),
            default_working_dir: Some("/workspace".to_string()),
            shell: vec!["sleep".to_string(), "infinity".to_string()],
            extra_volumes: vec![],
            env,
        };
        let spec = CommandSpec::new(vec!["make".to_string(), "update".to_string()]);
        let ctx = ContainerContext {
            container: "widgets-main",
            docker: &docker,
            host_workspace: Path::new("/srv/widgets/workspace/main"),
            host_temp: Path::new("/srv/widgets/temp/main"),
        };
        let (program, args, _, _) = CommandRunner::build(&spec, Some(&ctx));
        assert_eq!(program, "docker");
        assert!(args.contains(&"widgets-main".to_string()));
        assert!(!args.iter().any(|a| a.contains("hunter2")));
    }
}
