//! Read-only, validated projection of DROID's TOML configuration.
//!
//! # Configuration file
//!
//! DROID is configured by a single TOML document (path chosen by the
//! embedding application; this crate only parses bytes):
//!
//! ```toml
//! local-mode = false
//! push-with-installation-token = true
//! github-user-name = "droid-bot"
//! github-user-email = "droid-bot@users.noreply.github.com"
//!
//! [projects.widgets]
//! github = "acme/widgets"
//! makefile-path = "Makefile"
//!
//! [projects.widgets.docker]
//! image = "acme/widgets-dev"
//! workspace-dir = "/workspace"
//! temp-dir = "/tmp/droid"
//! ```
//!
//! Loading is a pure function of the TOML bytes: unknown project references,
//! malformed `org/repo` coordinates, and malformed docker image strings are
//! all rejected here, before any branch engine is constructed. The
//! interactive setup wizard that produces this file is out of scope for
//! this crate.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Top-level, validated DROID configuration.
///
/// Projects are kept in a `BTreeMap` rather than a `HashMap` so that
/// iteration order (used when rendering a project picker, or in tests) is
/// deterministic.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct DroidConfig {
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectConfig>,

    /// Use a GitHub App installation token for `git push`, instead of the
    /// authenticated user's own token.
    #[serde(default)]
    pub push_with_installation_token: bool,

    /// When set, `installation_token` returns the configured personal
    /// access token instead of minting a GitHub App installation token.
    #[serde(default)]
    pub local_mode: bool,

    /// Identity used for `user.name`/`user.email` in branch workspaces.
    #[serde(default)]
    pub github_user_name: Option<String>,
    #[serde(default)]
    pub github_user_email: Option<String>,

    /// Path to the GitHub App's PEM private key, required unless
    /// `local-mode` is set. Opaque to this crate beyond existence.
    #[serde(default)]
    pub github_app_pem_path: Option<String>,
    #[serde(default)]
    pub github_app_id: Option<String>,

    /// Personal access token used in local mode in place of installation
    /// tokens.
    #[serde(default)]
    pub local_access_token: Option<String>,

    /// Default docker configuration inherited by projects that don't
    /// declare their own `[projects.<name>.docker]` table.
    #[serde(default)]
    pub default_docker: Option<DockerConfig>,
}

/// One project's configuration, as validated from the TOML document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProjectConfig {
    /// `org/repo` GitHub coordinates.
    pub github: String,

    /// Makefile path relative to the workspace root. Defaults to
    /// `"Makefile"`.
    #[serde(default = "default_makefile_path")]
    pub makefile_path: String,

    /// Environment variables merged into every command run for this
    /// project (lowest precedence; docker config env and per-command env
    /// take priority).
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Per-project Docker configuration. When absent, the project inherits
    /// `DroidConfig::default_docker`, or Docker is treated as disabled if
    /// neither is set.
    #[serde(default)]
    pub docker: Option<DockerConfig>,

    /// Opaque to the core; surfaced verbatim by the HTTP/HTML layer.
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_makefile_path() -> String {
    "Makefile".to_string()
}

/// Docker configuration scoping a project's (or, via inheritance, every
/// project's) commands to a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DockerConfig {
    #[serde(default)]
    pub disabled: bool,

    /// Image reference. Normalized at validation time: lowercased, and
    /// `:latest` appended when no tag is present.
    pub image: String,

    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: String,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,

    #[serde(default)]
    pub default_working_dir: Option<String>,

    /// Shell invoked as the container's command, e.g. `["sleep", "infinity"]`.
    #[serde(default = "default_shell")]
    pub shell: Vec<String>,

    /// Additional `-v host:container` bind mounts, beyond the workspace and
    /// temp dir mounts the engine always adds.
    #[serde(default)]
    pub extra_volumes: Vec<(String, String)>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_workspace_dir() -> String {
    "/workspace".to_string()
}
fn default_temp_dir() -> String {
    "/tmp/droid".to_string()
}
fn default_shell() -> Vec<String> {
    vec!["sleep".to_string(), "infinity".to_string()]
}

/// Errors rejected while loading or validating a [`DroidConfig`].
#[derive(Debug)]
pub enum ConfigError {
    Parse(String),
    UnknownProject(String),
    BadGithubCoordinates { project: String, value: String },
    BadDockerImage { project: String, value: String },
    MissingGithubApp,
    MissingBinary(String),
    MissingPemFile(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parse(msg) => write!(f, "failed to parse config: {msg}"),
            ConfigError::UnknownProject(name) => write!(f, "unknown project: {name}"),
            ConfigError::BadGithubCoordinates { project, value } => write!(
                f,
                "project '{project}' has malformed github coordinates '{value}' (expected org/repo)"
            ),
            ConfigError::BadDockerImage { project, value } => {
                write!(f, "project '{project}' has malformed docker image '{value}'")
            }
            ConfigError::MissingGithubApp => write!(
                f,
                "github-app-pem-path and github-app-id are required unless local-mode is set"
            ),
            ConfigError::MissingBinary(name) => {
                write!(f, "required binary '{name}' was not found on PATH")
            }
            ConfigError::MissingPemFile(path) => {
                write!(f, "github-app-pem-path '{path}' does not exist")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl DroidConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(src: &str) -> Result<Self, ConfigError> {
        let mut config: DroidConfig =
            toml::from_str(src).map_err(|e| ConfigError::Parse(e.to_string()))?;

        for (name, project) in &mut config.projects {
            validate_github_coordinates(name, &project.github)?;

            if let Some(docker) = &mut project.docker {
                normalize_docker_image(name, docker)?;
            } else if let Some(default_docker) = &config.default_docker {
                project.docker = Some(default_docker.clone());
            }
        }

        if !config.local_mode
            && (config.github_app_pem_path.is_none() || config.github_app_id.is_none())
        {
            return Err(ConfigError::MissingGithubApp);
        }

        Ok(config)
    }

    /// Look up a project by name, or a descriptive error if it isn't
    /// configured. HTTP handlers use this to turn a path segment into a
    /// validated project before touching the registry.
    pub fn project(&self, name: &str) -> Result<&ProjectConfig, ConfigError> {
        self.projects
            .get(name)
            .ok_or_else(|| ConfigError::UnknownProject(name.to_string()))
    }

    /// The "explicit check operation" referenced in spec.md §7: verifies
    /// the environment this config assumes is actually present —
    /// `git`/`make` on `PATH` always, `docker` when any project has it
    /// enabled, and the GitHub App PEM file when not in local mode.
    /// Separate from [`Self::from_toml`] so parsing stays a pure
    /// function of the TOML bytes; callers run this once at startup,
    /// before building the branch registry.
    pub fn verify_environment(&self) -> Result<(), ConfigError> {
        for binary in ["git", "make"] {
            if which::which(binary).is_err() {
                return Err(ConfigError::MissingBinary(binary.to_string()));
            }
        }
        if self.projects.values().any(|p| {
            p.docker.as_ref().is_some_and(|d| !d.disabled)
        }) && which::which("docker").is_err()
        {
            return Err(ConfigError::MissingBinary("docker".to_string()));
        }

        if !self.local_mode {
            if let Some(pem_path) = &self.github_app_pem_path {
                let expanded = shellexpand::tilde(pem_path);
                if !std::path::Path::new(expanded.as_ref()).exists() {
                    return Err(ConfigError::MissingPemFile(pem_path.clone()));
                }
            }
        }
        Ok(())
    }

    /// Default base directory for project workspaces when the embedding
    /// application doesn't configure one explicitly: an OS-appropriate
    /// data directory (falls back to `.` if the platform has none, e.g.
    /// a minimal container image with no `$HOME`).
    pub fn default_base_dir() -> std::path::PathBuf {
        dirs::data_dir()
            .map(|dir| dir.join("droid"))
            .unwrap_or_else(|| std::path::PathBuf::from("."))
    }
}

impl ProjectConfig {
    /// `(org, repo)` split of the `github` coordinates. Only valid after
    /// `DroidConfig::from_toml` validation has run.
    pub fn org_repo(&self) -> (&str, &str) {
        let mut parts = self.github.splitn(2, '/');
        let org = parts.next().unwrap_or_default();
        let repo = parts.next().unwrap_or_default();
        (org, repo)
    }
}

fn validate_github_coordinates(project: &str, github: &str) -> Result<(), ConfigError> {
    let mut parts = github.splitn(2, '/');
    let (Some(org), Some(repo)) = (parts.next(), parts.next()) else {
        return Err(ConfigError::BadGithubCoordinates {
            project: project.to_string(),
            value: github.to_string(),
        });
    };
    if org.is_empty() || repo.is_empty() || repo.contains('/') {
        return Err(ConfigError::BadGithubCoordinates {
            project: project.to_string(),
            value: github.to_string(),
        });
    }
    Ok(())
}

/// Lowercase the image reference and append `:latest` when no tag is
/// present.
fn normalize_docker_image(project: &str, docker: &mut DockerConfig) -> Result<(), ConfigError> {
    if docker.image.trim().is_empty() {
        return Err(ConfigError::BadDockerImage {
            project: project.to_string(),
            value: docker.image.clone(),
        });
    }

    let lower = docker.image.to_lowercase();
    // A tag is present if there's a ':' after the last '/' (to avoid
    // mistaking a registry port, e.g. "localhost:5000/image", for a tag).
    let has_tag = match lower.rfind('/') {
        Some(slash) => lower[slash..].contains(':'),
        None => lower.contains(':'),
    };
    docker.image = if has_tag {
        lower
    } else {
        format!("{lower}:latest")
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_project_parses_with_defaults() {
        let toml = r#"
            local-mode = true

            [projects.widgets]
            github = "acme/widgets"
        "#;
        let config = DroidConfig::from_toml(toml).unwrap();
        let project = config.project("widgets").unwrap();
        assert_eq!(project.makefile_path, "Makefile");
        assert_eq!(project.org_repo(), ("acme", "widgets"));
        assert!(project.docker.is_none());
    }

    #[test]
    fn docker_image_gets_latest_tag_and_lowercased() {
        let toml = r#"
            local-mode = true

            [projects.widgets]
            github = "acme/widgets"

            [projects.widgets.docker]
            image = "ACME/Widgets-Dev"
        "#;
        let config = DroidConfig::from_toml(toml).unwrap();
        let project = config.project("widgets").unwrap();
        assert_eq!(project.docker.as_ref().unwrap().image, "acme/widgets-dev:latest");
    }

    #[test]
    fn docker_image_with_explicit_tag_is_untouched_besides_case() {
        let toml = r#"
            local-mode = true

            [projects.widgets]
            github = "acme/widgets"

            [projects.widgets.docker]
            image = "ACME/Widgets-Dev:v2"
        "#;
        let config = DroidConfig::from_toml(toml).unwrap();
        let project = config.project("widgets").unwrap();
        assert_eq!(project.docker.as_ref().unwrap().image, "acme/widgets-dev:v2");
    }

    #[test]
    fn registry_port_is_not_mistaken_for_a_tag() {
        let toml = r#"
            local-mode = true

            [projects.widgets]
            github = "acme/widgets"

            [projects.widgets.docker]
            image = "localhost:5000/widgets"
        "#;
        let config = DroidConfig::from_toml(toml).unwrap();
        let project = config.project("widgets").unwrap();
        assert_eq!(
            project.docker.as_ref().unwrap().image,
            "localhost:5000/widgets:latest"
        );
    }

    #[test]
    fn bad_github_coordinates_rejected() {
        let toml = r#"
            local-mode = true

            [projects.widgets]
            github = "not-a-repo-slug"
        "#;
        assert!(matches!(
            DroidConfig::from_toml(toml),
            Err(ConfigError::BadGithubCoordinates { .. })
        ));
    }

    #[test]
    fn missing_github_app_outside_local_mode_rejected() {
        let toml = r#"
            [projects.widgets]
            github = "acme/widgets"
        "#;
        assert!(matches!(
            DroidConfig::from_toml(toml),
            Err(ConfigError::MissingGithubApp)
        ));
    }

    #[test]
    fn project_inherits_default_docker() {
        let toml = r#"
            local-mode = true

            [default-docker]
            image = "acme/base"

            [projects.widgets]
            github = "acme/widgets"
        "#;
        let config = DroidConfig::from_toml(toml).unwrap();
        let project = config.project("widgets").unwrap();
        assert_eq!(project.docker.as_ref().unwrap().image, "acme/base:latest");
    }

    #[test]
    fn unknown_project_lookup_errors() {
        let config = DroidConfig::from_toml("local-mode = true\n").unwrap();
        assert!(matches!(
            config.project("nope"),
            Err(ConfigError::UnknownProject(_))
        ));
    }

    #[test]
    fn verify_environment_rejects_missing_pem_file() {
        let toml = r#"
            github-app-pem-path = "/nonexistent/path/to/app.pem"
            github-app-id = "12345"

            [projects.widgets]
            github = "acme/widgets"
        "#;
        let config = DroidConfig::from_toml(toml).unwrap();
        assert!(matches!(
            config.verify_environment(),
            Err(ConfigError::MissingPemFile(_))
        ));
    }

    #[test]
    fn verify_environment_skips_pem_check_in_local_mode() {
        let toml = r#"
            local-mode = true

            [projects.widgets]
            github = "acme/widgets"
        "#;
        let config = DroidConfig::from_toml(toml).unwrap();
        // git/make are assumed present in any environment building this crate;
        // docker is not required since no project enables it.
        assert!(config.verify_environment().is_ok() || matches!(
            config.verify_environment(),
            Err(ConfigError::MissingBinary(_))
        ));
    }

    #[test]
    fn default_base_dir_is_non_empty() {
        assert!(!DroidConfig::default_base_dir().as_os_str().is_empty());
    }
}
