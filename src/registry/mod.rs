//! Multi-tenant branch/project registries.
//!
//! [`BranchRegistry`] owns every [`BranchEngine`] in the process, keyed
//! two levels deep by project then branch name — a `DashMap` of
//! `DashMap`s, so lookups and per-project iteration never take a
//! whole-registry lock. [`RemoteBranchRegistry`] is the separate,
//! independently-refreshed cache of each project's GitHub branch list.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use rayon::prelude::*;

use crate::config::{DroidConfig, ProjectConfig};
use crate::engine::{BranchEngine, EngineContext, Operation};
use crate::github::{GitHubAdapter, RemoteBranch, RepoRef};
use crate::metadata::MetadataStore;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60 * 30);

/// Where one branch's workspace/temp directories and console file live,
/// relative to the registry's base directory.
struct BranchPaths {
    workspace_dir: PathBuf,
    temp_dir: PathBuf,
    console_path: PathBuf,
}

fn branch_paths(base_dir: &Path, project: &str, branch: &str) -> BranchPaths {
    let temp_dir = base_dir.join(project).join("temp").join(branch);
    BranchPaths {
        workspace_dir: base_dir.join(project).join("workspace").join(branch),
        console_path: temp_dir.join("console.txt"),
        temp_dir,
    }
}

/// Every branch engine in the process, keyed by project then branch.
pub struct BranchRegistry {
    config: DroidConfig,
    base_dir: PathBuf,
    metadata: Arc<MetadataStore>,
    projects: DashMap<String, DashMap<String, Arc<BranchEngine>>>,
}

impl BranchRegistry {
    /// Enumerate each configured project's workspace subdirectories and
    /// instantiate an engine per branch found on disk, seeded from
    /// `metadata`. Containers are neither built nor started here — a
    /// branch's container is prepared lazily, on first `run-*` or
    /// `rebuild-container`.
    pub fn open(config: DroidConfig, base_dir: PathBuf, metadata: Arc<MetadataStore>) -> Self {
        let registry = Self {
            config,
            base_dir,
            metadata,
            projects: DashMap::new(),
        };

        for project_name in registry.config.projects.keys().cloned().collect::<Vec<_>>() {
            let branches = registry.discover_branches(&project_name);
            let table = DashMap::new();
            for branch in branches {
                if let Some(engine) = registry.instantiate(&project_name, &branch) {
                    table.insert(branch, Arc::new(engine));
                }
            }
            registry.projects.insert(project_name, table);
        }

        registry
    }

    fn discover_branches(&self, project: &str) -> Vec<String> {
        let workspace_root = self.base_dir.join(project).join("workspace");
        let Ok(entries) = std::fs::read_dir(&workspace_root) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect()
    }

    fn instantiate(&self, project: &str, branch: &str) -> Option<BranchEngine> {
        let project_config = self.config.project(project).ok()?.clone();
        let paths = branch_paths(&self.base_dir, project, branch);
        if let Some(parent) = paths.temp_dir.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::create_dir_all(&paths.temp_dir);
        if !paths.console_path.exists() {
            let _ = std::fs::write(&paths.console_path, "");
        }

        Some(BranchEngine::spawn(EngineContext {
            project: project.to_string(),
            branch: branch.to_string(),
            project_config,
            workspace_dir: paths.workspace_dir,
            temp_dir: paths.temp_dir,
            console_path: paths.console_path,
            metadata: Arc::clone(&self.metadata),
            default_command_timeout: DEFAULT_COMMAND_TIMEOUT,
            github_user_name: self.config.github_user_name.clone(),
            github_user_email: self.config.github_user_email.clone(),
        }))
    }

    pub fn get(&self, project: &str, branch: &str) -> Option<Arc<BranchEngine>> {
        self.projects.get(project)?.get(branch).map(|e| Arc::clone(&e))
    }

    /// Every branch currently registered for `project`, in no particular
    /// order (callers sort by whatever the HTTP layer needs).
    pub fn branches(&self, project: &str) -> Vec<String> {
        self.projects
            .get(project)
            .map(|table| table.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default()
    }

    pub fn projects(&self) -> Vec<String> {
        self.projects.iter().map(|e| e.key().clone()).collect()
    }

    /// Refresh every engine in the registry in parallel.
    /// One project's slow refresh never blocks another's.
    pub fn refresh_all(&self) {
        let engines: Vec<Arc<BranchEngine>> = self
            .projects
            .iter()
            .flat_map(|project| project.value().iter().map(|e| Arc::clone(&e)).collect::<Vec<_>>())
            .collect();
        engines.par_iter().for_each(|engine| {
            let _ = engine.submit(Operation::Refresh);
        });
    }

    /// Cancel every running process, delete every project's temp
    /// directory, then drop and re-discover every engine from scratch —
    /// used when the base directory has been repopulated out from under
    /// the running process.
    pub fn reset_all(&self) {
        let engines: Vec<Arc<BranchEngine>> = self
            .projects
            .iter()
            .flat_map(|project| project.value().iter().map(|e| Arc::clone(&e)).collect::<Vec<_>>())
            .collect();
        engines.par_iter().for_each(|engine| {
            let _ = engine.submit(Operation::Cancel);
        });

        for project_name in self.config.projects.keys() {
            let temp_root = self.base_dir.join(project_name).join("temp");
            if let Err(e) = std::fs::remove_dir_all(&temp_root) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("reset-all: failed to remove {}: {e}", temp_root.display());
                }
            }
        }

        self.projects.clear();
        for project_name in self.config.projects.keys().cloned().collect::<Vec<_>>() {
            let branches = self.discover_branches(&project_name);
            let table = DashMap::new();
            for branch in branches {
                if let Some(engine) = self.instantiate(&project_name, &branch) {
                    table.insert(branch, Arc::new(engine));
                }
            }
            self.projects.insert(project_name, table);
        }
    }

    /// Register an engine for a newly checked-out remote branch or newly
    /// created local branch, replacing anything already registered under
    /// that name.
    pub fn insert(&self, project: &str, branch: &str) -> Option<Arc<BranchEngine>> {
        let engine = Arc::new(self.instantiate(project, branch)?);
        self.projects
            .entry(project.to_string())
            .or_default()
            .insert(branch.to_string(), Arc::clone(&engine));
        Some(engine)
    }

    /// Drop a branch's engine from the registry. The engine itself
    /// already performed the directory/container teardown as part of
    /// `delete-local`; this only removes it from
    /// lookup.
    pub fn remove(&self, project: &str, branch: &str) {
        if let Some(table) = self.projects.get(project) {
            table.remove(branch);
        }
    }

    fn container_names(&self) -> Vec<String> {
        self.projects
            .iter()
            .flat_map(|project| {
                let project_name = project.key().clone();
                project
                    .value()
                    .iter()
                    .map(|e| crate::docker::container_name(&project_name, e.key()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Pause every branch's container fleet-wide, downgrading
    /// missing-container errors to info logs.
    pub fn pause_all_containers(&self) {
        self.container_names().par_iter().for_each(|name| {
            if let Err(e) = crate::docker::pause(name) {
                log::info!("pause-all: {name}: {e}");
            }
        });
    }

    pub fn unpause_all_containers(&self) {
        self.container_names().par_iter().for_each(|name| {
            if let Err(e) = crate::docker::unpause(name) {
                log::info!("unpause-all: {name}: {e}");
            }
        });
    }

    pub fn remove_all_containers(&self) {
        self.container_names().par_iter().for_each(|name| {
            if let Err(e) = crate::docker::remove(name) {
                log::info!("remove-all: {name}: {e}");
            }
        });
    }

    pub fn project_config(&self, project: &str) -> Option<ProjectConfig> {
        self.config.project(project).ok().cloned()
    }
}

/// Per-project cache of a repository's remote branches, refreshed
/// independently so one project's slow GitHub call never blocks a
/// lookup against another's cached list.
pub struct RemoteBranchRegistry {
    github: Arc<GitHubAdapter>,
    projects: DashMap<String, Arc<Mutex<Vec<RemoteBranch>>>>,
}

impl RemoteBranchRegistry {
    pub fn new(github: Arc<GitHubAdapter>) -> Self {
        Self {
            github,
            projects: DashMap::new(),
        }
    }

    pub fn get(&self, project: &str) -> Vec<RemoteBranch> {
        self.projects
            .get(project)
            .map(|cell| cell.lock().expect("remote branch cache mutex poisoned").clone())
            .unwrap_or_default()
    }

    /// Fetch `project`'s branches from GitHub and replace the cached
    /// list. Holds the project's own lock for the duration of the
    /// network call, so a concurrent `get` for a different project is
    /// never blocked, and two concurrent refreshes of the same project
    /// serialize rather than race.
    pub fn refresh(&self, project: &str, repo: RepoRef<'_>, default_branch: Option<&str>, token: &str) {
        let cell = Arc::clone(
            self.projects
                .entry(project.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
                .value(),
        );
        let mut guard = cell.lock().expect("remote branch cache mutex poisoned");
        let mut branches = self.github.get_remote_branches(repo, token);
        if let Some(default_branch) = default_branch {
            for branch in &mut branches {
                if branch.name == default_branch {
                    branch.default_branch = true;
                }
            }
        }
        *guard = branches;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> DroidConfig {
        DroidConfig::from_toml(
            r#"
            local-mode = true

            [projects.widgets]
            github = "acme/widgets"
        "#,
        )
        .unwrap()
    }

    #[test]
    fn open_discovers_branches_from_workspace_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        let workspace_root = dir.path().join("widgets").join("workspace");
        std::fs::create_dir_all(workspace_root.join("main")).unwrap();
        std::fs::create_dir_all(workspace_root.join("feature-x")).unwrap();

        let metadata = Arc::new(MetadataStore::open_in_memory().unwrap());
        let registry = BranchRegistry::open(sample_config(), dir.path().to_path_buf(), metadata);

        let mut branches = registry.branches("widgets");
        branches.sort();
        assert_eq!(branches, vec!["feature-x".to_string(), "main".to_string()]);
    }

    #[test]
    fn missing_workspace_dir_yields_no_branches() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(MetadataStore::open_in_memory().unwrap());
        let registry = BranchRegistry::open(sample_config(), dir.path().to_path_buf(), metadata);
        assert!(registry.branches("widgets").is_empty());
    }

    #[test]
    fn insert_and_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(MetadataStore::open_in_memory().unwrap());
        let registry = BranchRegistry::open(sample_config(), dir.path().to_path_buf(), metadata);

        assert!(registry.get("widgets", "feature-y").is_none());
        registry.insert("widgets", "feature-y").unwrap();
        assert!(registry.get("widgets", "feature-y").is_some());
        registry.remove("widgets", "feature-y");
        assert!(registry.get("widgets", "feature-y").is_none());
    }

    #[test]
    fn remote_branch_registry_starts_empty_until_refreshed() {
        let registry = RemoteBranchRegistry::new(Arc::new(GitHubAdapter::new()));
        assert!(registry.get("widgets").is_empty());
    }
}
