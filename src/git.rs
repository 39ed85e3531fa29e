//! Git repository operations for one branch's workspace directory.
//!
//! This is the thin wrapper the branch engine uses for every git
//! invocation that isn't itself the user-visible command (`run-git`): HEAD
//! inspection for the consistency guard, porcelain status for
//! [`GitStatus`], and the clone/push/fetch sequences behind
//! `checkout-remote`/`create-local`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use once_cell::sync::Lazy;
use regex::Regex;

/// Conservative charset for branch names accepted from `checkout-remote`/
/// `create-local` requests: no leading dash (would be read as a flag by
/// the `git` binary), no whitespace, no `..`/`~`/`^`/`:` (git refname
/// syntax), no path separators outside a single interior `/`.
static VALID_BRANCH_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/-]*$").expect("branch name pattern is valid")
});

/// Does `name` look like a safe git branch name? Used before
/// `checkout-remote`/`create-local` act on a caller-supplied name —
/// rejects anything that could be misread as a flag or a `..`-style
/// path escape once embedded in a container name or argv.
pub fn is_valid_branch_name(name: &str) -> bool {
    !name.is_empty() && !name.contains("..") && VALID_BRANCH_NAME.is_match(name)
}

#[derive(Debug)]
pub enum GitError {
    CommandFailed { command: String, stderr: String },
    Io(std::io::Error),
    ParseError(String),
}

impl fmt::Display for GitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitError::CommandFailed { command, stderr } => {
                write!(f, "`{command}` failed: {}", stderr.trim())
            }
            GitError::Io(e) => write!(f, "failed to run git: {e}"),
            GitError::ParseError(msg) => write!(f, "failed to parse git output: {msg}"),
        }
    }
}

impl std::error::Error for GitError {}

impl From<std::io::Error> for GitError {
    fn from(e: std::io::Error) -> Self {
        GitError::Io(e)
    }
}

/// A git repository rooted at a branch's workspace directory.
#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
}

impl Repository {
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run a git subcommand in this repository, returning stdout on
    /// success. Used for every non-user-visible git query (HEAD, status,
    /// rev-parse, ...).
    pub fn run_command(&self, args: &[&str]) -> Result<String, GitError> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .stdin(Stdio::null())
            .output()?;

        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: format!("git {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// The ref named by `.git/HEAD`, e.g. `"refs/heads/main"`, or `None` if
    /// HEAD is detached.
    pub fn head_ref(&self) -> Result<Option<String>, GitError> {
        let head_path = self.root.join(".git").join("HEAD");
        let contents = std::fs::read_to_string(&head_path).map_err(GitError::Io)?;
        let trimmed = contents.trim();
        Ok(trimmed.strip_prefix("ref: ").map(|r| r.to_string()))
    }

    /// The consistency guard: does `.git/HEAD` name this branch?
    ///
    /// Callers must check this before launching any command other than
    /// the docker build/pull.
    pub fn head_matches_branch(&self, branch: &str) -> Result<bool, GitError> {
        Ok(self.head_ref()?.as_deref() == Some(&format!("refs/heads/{branch}")))
    }

    /// Parsed `git status --short --branch --porcelain`.
    pub fn status(&self) -> Result<GitStatus, GitError> {
        let raw = self.run_command(&["status", "--short", "--branch", "--porcelain"])?;
        GitStatus::parse(&raw)
    }

    pub fn clone_branch(
        &self,
        remote_url: &str,
        branch: &str,
        single_branch: bool,
    ) -> Result<(), GitError> {
        if let Some(parent) = self.root.parent() {
            std::fs::create_dir_all(parent).map_err(GitError::Io)?;
        }
        let mut args = vec!["clone", "--branch", branch];
        if single_branch {
            args.push("--single-branch");
        }
        args.push(remote_url);
        let root_str = self.root.to_string_lossy().into_owned();
        args.push(&root_str);

        let output = Command::new("git")
            .args(&args)
            .stdin(Stdio::null())
            .output()?;
        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: format!("git {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    pub fn fetch(&self) -> Result<(), GitError> {
        self.run_command(&["fetch"]).map(|_| ())
    }

    pub fn checkout_new_branch(&self, branch: &str) -> Result<(), GitError> {
        self.run_command(&["checkout", "-b", branch]).map(|_| ())
    }

    pub fn push_set_upstream(&self, branch: &str) -> Result<(), GitError> {
        self.run_command(&["push", "--set-upstream", "origin", branch])
            .map(|_| ())
    }

    pub fn configure_identity(&self, name: &str, email: &str) -> Result<(), GitError> {
        self.run_command(&["config", "user.name", name])?;
        self.run_command(&["config", "user.email", email])?;
        self.run_command(&["config", "color.ui", "always"])?;
        self.run_command(&["config", "credential.helper", "store"])?;
        Ok(())
    }

    /// Append `.git-credentials` to `.gitignore`, creating the file if
    /// needed. Idempotent.
    pub fn ignore_git_credentials(&self) -> Result<(), GitError> {
        let gitignore = self.root.join(".gitignore");
        let existing = std::fs::read_to_string(&gitignore).unwrap_or_default();
        if existing.lines().any(|l| l.trim() == ".git-credentials") {
            return Ok(());
        }
        let mut contents = existing;
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(".git-credentials\n");
        std::fs::write(&gitignore, contents).map_err(GitError::Io)
    }

    pub fn write_credentials(&self, credentials_line: &str) -> Result<(), GitError> {
        let path = self.root.join(".git-credentials");
        std::fs::write(&path, format!("{credentials_line}\n")).map_err(GitError::Io)
    }

    pub fn remove_credentials(&self) -> Result<(), GitError> {
        let path = self.root.join(".git-credentials");
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GitError::Io(e)),
        }
    }
}

/// Parsed `git status --short --branch --porcelain`.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct GitStatus {
    pub raw: String,
    pub local: Option<String>,
    pub remote: Option<String>,
    pub ahead: u32,
    pub behind: u32,
    pub uncommitted: bool,
}

impl GitStatus {
    /// Parse the `## local...remote [ahead N, behind M]` header line plus
    /// the uncommitted-files body of `git status --short --branch --porcelain`.
    fn parse(raw: &str) -> Result<Self, GitError> {
        let mut status = GitStatus {
            raw: raw.to_string(),
            ..Default::default()
        };

        let mut lines = raw.lines();
        let Some(header) = lines.next() else {
            return Ok(status);
        };
        let header = header
            .strip_prefix("## ")
            .ok_or_else(|| GitError::ParseError("missing branch header".to_string()))?;

        // "main...origin/main [ahead 1, behind 2]" or "main" (no upstream)
        // or "HEAD (no branch)" in detached state.
        if header.starts_with("HEAD ") {
            status.local = None;
        } else {
            let (branches, tracking) = match header.split_once(' ') {
                Some((b, t)) => (b, Some(t)),
                None => (header, None),
            };
            let (local, remote) = match branches.split_once("...") {
                Some((l, r)) => (l.to_string(), Some(r.to_string())),
                None => (branches.to_string(), None),
            };
            status.local = Some(local);
            status.remote = remote;

            if let Some(tracking) = tracking {
                let inner = tracking.trim_start_matches('[').trim_end_matches(']');
                for part in inner.split(", ") {
                    if let Some(n) = part.strip_prefix("ahead ") {
                        status.ahead = n.parse().unwrap_or(0);
                    } else if let Some(n) = part.strip_prefix("behind ") {
                        status.behind = n.parse().unwrap_or(0);
                    }
                }
            }
        }

        status.uncommitted = lines.next().is_some();
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_branch_with_upstream() {
        let status = GitStatus::parse("## main...origin/main\n").unwrap();
        assert_eq!(status.local.as_deref(), Some("main"));
        assert_eq!(status.remote.as_deref(), Some("origin/main"));
        assert_eq!(status.ahead, 0);
        assert_eq!(status.behind, 0);
        assert!(!status.uncommitted);
    }

    #[test]
    fn parses_ahead_and_behind() {
        let status =
            GitStatus::parse("## feature...origin/feature [ahead 1, behind 2]\n M foo.rs\n")
                .unwrap();
        assert_eq!(status.ahead, 1);
        assert_eq!(status.behind, 2);
        assert!(status.uncommitted);
    }

    #[test]
    fn parses_branch_with_no_upstream() {
        let status = GitStatus::parse("## main\n").unwrap();
        assert_eq!(status.local.as_deref(), Some("main"));
        assert_eq!(status.remote, None);
    }

    #[test]
    fn parses_detached_head() {
        let status = GitStatus::parse("## HEAD (no branch)\n").unwrap();
        assert_eq!(status.local, None);
    }

    #[test]
    fn empty_output_yields_default() {
        let status = GitStatus::parse("").unwrap();
        assert_eq!(status, GitStatus::default());
    }

    #[test]
    fn valid_branch_names_accepted() {
        assert!(is_valid_branch_name("main"));
        assert!(is_valid_branch_name("feature/add-thing"));
        assert!(is_valid_branch_name("release-1.2"));
    }

    #[test]
    fn dangerous_branch_names_rejected() {
        assert!(!is_valid_branch_name(""));
        assert!(!is_valid_branch_name("-oops"));
        assert!(!is_valid_branch_name("../escape"));
        assert!(!is_valid_branch_name("has space"));
        assert!(!is_valid_branch_name("weird^ref"));
    }
}
