//! Docker container lifecycle for one branch's isolated workspace.
//!
//! A container is named `{project}-{branch}` and is 1:1 with a branch
//! engine once Docker is enabled for the project.
//! This module owns container create/start/remove/pause, the
//! `docker exec` command-wrapping the command runner delegates to, and
//! the container-side half of the cancellation protocol (§4.2.2).

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use regex::Regex;

use crate::config::DockerConfig;

#[derive(Debug)]
pub enum DockerError {
    CommandFailed { command: String, stderr: String },
    Io(std::io::Error),
    NoMatchingProcess,
}

impl fmt::Display for DockerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DockerError::CommandFailed { command, stderr } => {
                write!(f, "`{command}` failed: {}", stderr.trim())
            }
            DockerError::Io(e) => write!(f, "failed to run docker: {e}"),
            DockerError::NoMatchingProcess => {
                write!(f, "no in-container process matched the recorded command")
            }
        }
    }
}

impl std::error::Error for DockerError {}

impl From<std::io::Error> for DockerError {
    fn from(e: std::io::Error) -> Self {
        DockerError::Io(e)
    }
}

/// `{project}-{branch}`.
pub fn container_name(project: &str, branch: &str) -> String {
    format!("{project}-{branch}")
}

/// Does "no such container" appear in this docker stderr? Used to
/// downgrade missing-container failures to info logs.
pub fn is_no_such_container(stderr: &str) -> bool {
    stderr.to_lowercase().contains("no such container")
}

fn run(args: &[&str]) -> Result<Output, DockerError> {
    Command::new("docker")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(DockerError::Io)
}

fn ensure_success(args: &[&str], output: &Output) -> Result<(), DockerError> {
    if !output.status.success() {
        return Err(DockerError::CommandFailed {
            command: format!("docker {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

/// Create and start a container bound to the workspace and temp mounts,
/// plus any configured extra volumes.: `--interactive
/// --tty --volume host-workspace:docker-workspace --volume
/// host-temp:docker-temp [--volume X:X …] <image> <shell-command>`.
pub fn create_and_start(
    name: &str,
    docker: &DockerConfig,
    host_workspace: &Path,
    host_temp: &Path,
) -> Result<String, DockerError> {
    let mut args: Vec<String> = vec![
        "create".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--interactive".to_string(),
        "--tty".to_string(),
        "--volume".to_string(),
        format!(
            "{}:{}",
            host_workspace.display(),
            docker.workspace_dir
        ),
        "--volume".to_string(),
        format!("{}:{}", host_temp.display(), docker.temp_dir),
    ];

    for (host, container) in &docker.extra_volumes {
        args.push("--volume".to_string());
        args.push(format!("{host}:{container}"));
    }

    for (key, value) in &docker.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }

    args.push(docker.image.clone());
    args.extend(docker.shell.iter().cloned());

    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let create_output = run(&arg_refs)?;
    ensure_success(&arg_refs, &create_output)?;

    let start_output = run(&["start", name])?;
    ensure_success(&["start", name], &start_output)?;

    // Concatenated stdout of `create` (the new container id) and
    // `start`; the caller appends this to the branch's console.
    let mut combined = String::from_utf8_lossy(&create_output.stdout).trim().to_string();
    let start_stdout = String::from_utf8_lossy(&start_output.stdout);
    let start_stdout = start_stdout.trim();
    if !start_stdout.is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(start_stdout);
    }
    Ok(combined)
}

pub fn build(image: &str, dockerfile_dir: &Path) -> Result<(), DockerError> {
    let dir = dockerfile_dir.to_string_lossy().into_owned();
    let args = ["build", "-t", image, &dir];
    let output = run(&args)?;
    ensure_success(&args, &output)
}

pub fn pull(image: &str) -> Result<(), DockerError> {
    let args = ["pull", image];
    let output = run(&args)?;
    ensure_success(&args, &output)
}

/// Remove a container, downgrading "no such container" to `Ok(())` so
/// callers can treat removal as idempotent.
pub fn remove(name: &str) -> Result<(), DockerError> {
    let args = ["rm", "-f", name];
    let output = run(&args)?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if is_no_such_container(&stderr) {
        return Ok(());
    }
    Err(DockerError::CommandFailed {
        command: format!("docker {}", args.join(" ")),
        stderr,
    })
}

/// Start an existing, stopped container. Returns a plain `CommandFailed`
/// (not downgraded) so callers can distinguish "already running"/"no
/// such container" and decide whether to create it.
pub fn start(name: &str) -> Result<(), DockerError> {
    let args = ["start", name];
    let output = run(&args)?;
    ensure_success(&args, &output)
}

pub fn pause(name: &str) -> Result<(), DockerError> {
    let args = ["pause", name];
    let output = run(&args)?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if is_no_such_container(&stderr) {
        return Ok(());
    }
    Err(DockerError::CommandFailed {
        command: format!("docker {}", args.join(" ")),
        stderr,
    })
}

pub fn unpause(name: &str) -> Result<(), DockerError> {
    let args = ["unpause", name];
    let output = run(&args)?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if is_no_such_container(&stderr) {
        return Ok(());
    }
    Err(DockerError::CommandFailed {
        command: format!("docker {}", args.join(" ")),
        stderr,
    })
}

/// Translate host workspace/temp paths embedded in a string (e.g. a
/// working directory or an argv element) to their in-container
/// counterparts.
pub fn translate_path(
    value: &str,
    host_workspace: &Path,
    host_temp: &Path,
    docker: &DockerConfig,
) -> String {
    let mut translated = value.to_string();
    if let Some(host) = host_workspace.to_str() {
        translated = translated.replace(host, &docker.workspace_dir);
    }
    if let Some(host) = host_temp.to_str() {
        translated = translated.replace(host, &docker.temp_dir);
    }
    translated
}

/// Build the `docker exec` argv that wraps `argv` for execution inside
/// `container`.1. Env values are passed by name (`-e
/// VAR`) rather than inlined, so secrets never appear in `ps` output.
pub fn wrap_exec<'a>(
    container: &'a str,
    argv: &'a [String],
    working_dir: Option<&str>,
    env: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut wrapped = vec!["exec".to_string()];
    if let Some(dir) = working_dir {
        wrapped.push("--workdir".to_string());
        wrapped.push(dir.to_string());
    }
    for key in env.keys() {
        wrapped.push("-e".to_string());
        wrapped.push(key.clone());
    }
    wrapped.push(container.to_string());
    wrapped.extend(argv.iter().cloned());
    wrapped
}

/// Container-side half of the cancellation protocol:
/// find the PID inside `container` whose `args` matches `command`
/// (regex) and kill it. Returns `Ok(())` whether or not a match was
/// found — the caller logs and falls through to destroying the
/// host-side process either way; only a failure of `ps` itself is an
/// error.
pub fn kill_matching_process(container: &str, command: &str) -> Result<(), DockerError> {
    let ps_args = ["exec", container, "ps", "-o", "pid,args"];
    let output = run(&ps_args)?;
    if !output.status.success() {
        return Err(DockerError::CommandFailed {
            command: format!("docker {}", ps_args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let pattern = match Regex::new(&regex::escape(command)) {
        Ok(re) => re,
        Err(_) => return Err(DockerError::NoMatchingProcess),
    };

    let pid = stdout.lines().skip(1).find_map(|line| {
        let line = line.trim();
        let (pid, args) = line.split_once(char::is_whitespace)?;
        pattern.is_match(args).then(|| pid.to_string())
    });

    let Some(pid) = pid else {
        return Err(DockerError::NoMatchingProcess);
    };

    let kill_args = ["exec", container, "kill", &pid];
    let output = run(&kill_args)?;
    ensure_success(&kill_args, &output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_joins_project_and_branch() {
        assert_eq!(container_name("widgets", "feature-x"), "widgets-feature-x");
    }

    #[test]
    fn no_such_container_is_case_insensitive() {
        assert!(is_no_such_container("Error: No such container: widgets-main"));
        assert!(!is_no_such_container("permission denied"));
    }

    #[test]
    fn wrap_exec_passes_env_by_name_only() {
        let mut env = BTreeMap::new();
        env.insert("SECRET".to_string(), "top-secret-value".to_string());
        let argv = vec!["make".to_string(), "update".to_string()];
        let wrapped = wrap_exec("widgets-main", &argv, Some("/workspace"), &env);
        assert!(wrapped.contains(&"SECRET".to_string()));
        assert!(!wrapped.iter().any(|a| a.contains("top-secret-value")));
        assert!(wrapped.contains(&"--workdir".to_string()));
    }

    #[test]
    fn translate_path_rewrites_host_paths() {
        let docker = DockerConfig {
            disabled: false,
            image: "acme/widgets:latest".to_string(),
            workspace_dir: "/workspace".to_string(),
            temp_dir: "/tmp/droid".to_string(),
            default_working_dir: None,
            shell: vec!["sleep".to_string(), "infinity".to_string()],
            extra_volumes: vec![],
            env: BTreeMap::new(),
        };
        let host_workspace = Path::new("/srv/droid/widgets/workspace/main");
        let host_temp = Path::new("/srv/droid/widgets/temp/main");
        let translated = translate_path(
            "/srv/droid/widgets/workspace/main/build/out.txt",
            host_workspace,
            host_temp,
            &docker,
        );
        assert_eq!(translated, "/workspace/build/out.txt");
    }
}
