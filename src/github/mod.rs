//! The GitHub REST adapter.
//!
//! A blocking `reqwest` client, matching the branch engine's fully
//! synchronous worker architecture — every call here runs on an engine's
//! worker thread, which is already the one place in this crate that
//! blocks on I/O.
//!
//! Non-2xx responses are logged and converted to a benign return value
//! (`false`, an empty list, `None`) everywhere except [`installation_token`],
//! which raises: callers cannot proceed without a token.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

const API_BASE: &str = "https://api.github.com";
const MAX_REMOTE_BRANCHES: usize = 100;

#[derive(Debug)]
pub enum GitHubError {
    Request(reqwest::Error),
    Jwt(jsonwebtoken::errors::Error),
    NoMatchingInstallation { org: String },
    MissingCredentials,
    /// A non-2xx response whose body was logged by [`GitHubAdapter::send_checked`].
    Upstream { status: u16 },
}

impl fmt::Display for GitHubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitHubError::Request(e) => write!(f, "github request failed: {e}"),
            GitHubError::Jwt(e) => write!(f, "failed to sign app jwt: {e}"),
            GitHubError::NoMatchingInstallation { org } => {
                write!(f, "no github app installation found for org '{org}'")
            }
            GitHubError::MissingCredentials => {
                write!(f, "no github app pem or local access token configured")
            }
            GitHubError::Upstream { status } => write!(f, "github responded with status {status}"),
        }
    }
}

impl std::error::Error for GitHubError {}

impl From<reqwest::Error> for GitHubError {
    fn from(e: reqwest::Error) -> Self {
        GitHubError::Request(e)
    }
}

impl From<jsonwebtoken::errors::Error> for GitHubError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        GitHubError::Jwt(e)
    }
}

/// A remote branch, as surfaced to the branch engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteBranch {
    pub name: String,
    pub default_branch: bool,
    pub pull_request: Option<String>,
    /// Whether the branch carries GitHub branch protection.
    pub protected: bool,
}

/// `org`/`repo` split of a project's GitHub coordinates.
#[derive(Debug, Clone, Copy)]
pub struct RepoRef<'a> {
    pub org: &'a str,
    pub repo: &'a str,
}

/// Permission level GitHub reports for a user on a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Permission {
    Admin,
    Write,
    Read,
}

impl Permission {
    fn from_str(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(Permission::Admin),
            "write" => Some(Permission::Write),
            "read" => Some(Permission::Read),
            _ => None,
        }
    }
}

pub struct GitHubAdapter {
    client: Client,
}

impl Default for GitHubAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl GitHubAdapter {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .user_agent("droid-engine")
                .build()
                .expect("reqwest client construction cannot fail with these settings"),
        }
    }

    fn authed(&self, method: reqwest::Method, url: &str, token: &str) -> reqwest::blocking::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
    }

    /// Send a request; on a non-2xx response, parse GitHub's standard
    /// `{message, documentation_url}` error body, log both, and return
    /// `Err`. Callers convert the `Err` to whatever benign value their
    /// contract promises (§4.4: "logs the upstream message and
    /// documentation_url and returns a benign value, never an
    /// exception across the adapter boundary").
    fn send_checked(
        &self,
        builder: reqwest::blocking::RequestBuilder,
        context: &str,
    ) -> Result<reqwest::blocking::Response, GitHubError> {
        #[derive(Deserialize, Default)]
        struct ErrorBody {
            message: Option<String>,
            documentation_url: Option<String>,
        }

        let response = builder.send()?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body: ErrorBody = response.json().unwrap_or_default();
        log::warn!(
            "{context} failed ({status}): {}{}",
            body.message.as_deref().unwrap_or("<no message>"),
            body.documentation_url
                .map(|url| format!(" ({url})"))
                .unwrap_or_default()
        );
        Err(GitHubError::Upstream { status: status.as_u16() })
    }

    /// List remote branches, annotated with open-PR URLs and protection
    /// status. Caps results at 100.
    pub fn get_remote_branches(&self, repo: RepoRef<'_>, token: &str) -> Vec<RemoteBranch> {
        #[derive(Deserialize)]
        struct BranchJson {
            name: String,
            protected: bool,
        }
        #[derive(Deserialize)]
        struct PullJson {
            head: PullHead,
            html_url: String,
        }
        #[derive(Deserialize)]
        struct PullHead {
            #[serde(rename = "ref")]
            git_ref: String,
        }

        let branches_url = format!(
            "{API_BASE}/repos/{}/{}/branches?per_page={MAX_REMOTE_BRANCHES}",
            repo.org, repo.repo
        );
        let context = format!("list branches for {}/{}", repo.org, repo.repo);
        let branches: Vec<BranchJson> = match self
            .send_checked(self.authed(reqwest::Method::GET, &branches_url, token), &context)
        {
            Ok(response) => response.json().unwrap_or_default(),
            Err(_) => return Vec::new(),
        };

        let pulls_url = format!(
            "{API_BASE}/repos/{}/{}/pulls?state=open",
            repo.org, repo.repo
        );
        let pulls_context = format!("list open pulls for {}/{}", repo.org, repo.repo);
        let pulls: Vec<PullJson> = match self
            .send_checked(self.authed(reqwest::Method::GET, &pulls_url, token), &pulls_context)
        {
            Ok(response) => response.json().unwrap_or_default(),
            Err(_) => Vec::new(),
        };

        branches
            .into_iter()
            .take(MAX_REMOTE_BRANCHES)
            .map(|b| {
                let pull_request = pulls
                    .iter()
                    .find(|p| p.head.git_ref == b.name)
                    .map(|p| p.html_url.clone());
                RemoteBranch {
                    default_branch: false,
                    name: b.name,
                    pull_request,
                    protected: b.protected,
                }
            })
            .collect()
    }

    pub fn get_default_branch(&self, repo: RepoRef<'_>, token: &str) -> Option<String> {
        #[derive(Deserialize)]
        struct RepoJson {
            default_branch: String,
        }
        let url = format!("{API_BASE}/repos/{}/{}", repo.org, repo.repo);
        let context = format!("get default branch for {}/{}", repo.org, repo.repo);
        match self.send_checked(self.authed(reqwest::Method::GET, &url, token), &context) {
            Ok(response) => response.json::<RepoJson>().ok().map(|r| r.default_branch),
            Err(_) => None,
        }
    }

    pub fn delete_branch(&self, repo: RepoRef<'_>, branch: &str, token: &str) -> bool {
        let url = format!(
            "{API_BASE}/repos/{}/{}/git/refs/heads/{branch}",
            repo.org, repo.repo
        );
        let context = format!("delete branch {branch} on {}/{}", repo.org, repo.repo);
        self.send_checked(self.authed(reqwest::Method::DELETE, &url, token), &context)
            .is_ok()
    }

    pub fn create_pull(
        &self,
        repo: RepoRef<'_>,
        from: &str,
        to: &str,
        title: &str,
        draft: bool,
        token: &str,
    ) -> String {
        #[derive(Serialize)]
        struct CreatePullRequest<'a> {
            title: &'a str,
            head: &'a str,
            base: &'a str,
            draft: bool,
        }
        #[derive(Deserialize)]
        struct PullResponse {
            html_url: String,
        }

        let url = format!("{API_BASE}/repos/{}/{}/pulls", repo.org, repo.repo);
        let body = CreatePullRequest {
            title,
            head: from,
            base: to,
            draft,
        };
        let context = format!("create pull request on {}/{}", repo.org, repo.repo);
        match self.send_checked(
            self.authed(reqwest::Method::POST, &url, token).json(&body),
            &context,
        ) {
            Ok(response) => response
                .json::<PullResponse>()
                .map(|r| r.html_url)
                .unwrap_or_default(),
            Err(_) => String::new(),
        }
    }

    pub fn get_project_permission(
        &self,
        repo: RepoRef<'_>,
        login: &str,
        token: &str,
    ) -> Option<Permission> {
        #[derive(Deserialize)]
        struct PermissionJson {
            permission: String,
        }
        let url = format!(
            "{API_BASE}/repos/{}/{}/collaborators/{login}/permission",
            repo.org, repo.repo
        );
        // Not-a-collaborator is a routine 404, not worth the upstream-error
        // log `send_checked` would emit for every other failure mode.
        let response = match self.authed(reqwest::Method::GET, &url, token).send() {
            Ok(response) => response,
            Err(e) => {
                log::warn!("failed to get permission for {login} on {}/{}: {e}", repo.org, repo.repo);
                return None;
            }
        };
        if response.status() == StatusCode::NOT_FOUND {
            return None;
        }
        let context = format!("get permission for {login} on {}/{}", repo.org, repo.repo);
        if !response.status().is_success() {
            let body: serde_json::Value = response.json().unwrap_or_default();
            log::warn!(
                "{context} failed: {}",
                body.get("message").and_then(|v| v.as_str()).unwrap_or("<no message>")
            );
            return None;
        }
        response
            .json::<PermissionJson>()
            .ok()
            .and_then(|p| Permission::from_str(&p.permission))
    }

    /// Mint a short-lived installation token for `org`. In local mode
    /// returns the configured personal access token instead of talking
    /// to GitHub at all.
    pub fn installation_token(
        &self,
        org: &str,
        app_credentials: Option<&AppCredentials>,
        local_access_token: Option<&str>,
    ) -> Result<String, GitHubError> {
        if let Some(token) = local_access_token {
            return Ok(token.to_string());
        }
        let app = app_credentials.ok_or(GitHubError::MissingCredentials)?;

        let jwt = app.sign_jwt()?;

        #[derive(Deserialize)]
        struct Installation {
            id: u64,
            account: Account,
        }
        #[derive(Deserialize)]
        struct Account {
            login: String,
        }

        let installations: Vec<Installation> = self
            .client
            .get(format!("{API_BASE}/app/installations"))
            .bearer_auth(&jwt)
            .header("Accept", "application/vnd.github+json")
            .send()?
            .error_for_status()?
            .json()?;

        let installation = installations
            .iter()
            .find(|i| i.account.login.eq_ignore_ascii_case(org))
            .ok_or_else(|| GitHubError::NoMatchingInstallation {
                org: org.to_string(),
            })?;

        #[derive(Deserialize)]
        struct AccessTokenResponse {
            token: String,
        }

        let response: AccessTokenResponse = self
            .client
            .post(format!(
                "{API_BASE}/app/installations/{}/access_tokens",
                installation.id
            ))
            .bearer_auth(&jwt)
            .header("Accept", "application/vnd.github+json")
            .send()?
            .error_for_status()?
            .json()?;

        Ok(response.token)
    }
}

/// GitHub App credentials used to mint installation tokens.
#[derive(Debug, Clone)]
pub struct AppCredentials {
    pub app_id: String,
    pub pem: String,
}

#[derive(Serialize)]
struct JwtClaims {
    iss: String,
    iat: u64,
    exp: u64,
}

impl AppCredentials {
    /// `iss=<app-id>`, `iat=now`, `exp=now+10min`, signed RS256 with the
    /// configured PEM.
    fn sign_jwt(&self) -> Result<String, GitHubError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the unix epoch")
            .as_secs();
        let claims = JwtClaims {
            iss: self.app_id.clone(),
            iat: now,
            exp: now + 600,
        };
        let key = EncodingKey::from_rsa_pem(self.pem.as_bytes())?;
        let token = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)?;
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_parses_known_levels() {
        assert_eq!(Permission::from_str("admin"), Some(Permission::Admin));
        assert_eq!(Permission::from_str("write"), Some(Permission::Write));
        assert_eq!(Permission::from_str("read"), Some(Permission::Read));
        assert_eq!(Permission::from_str("none"), None);
    }

    #[test]
    fn local_mode_bypasses_jwt_signing() {
        let adapter = GitHubAdapter::new();
        let token = adapter
            .installation_token("acme", None, Some("local-pat-value"))
            .unwrap();
        assert_eq!(token, "local-pat-value");
    }

    #[test]
    fn installation_token_without_credentials_errors() {
        let adapter = GitHubAdapter::new();
        let result = adapter.installation_token("acme", None, None);
        assert!(matches!(result, Err(GitHubError::MissingCredentials)));
    }
}
