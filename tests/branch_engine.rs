//! Cross-module scenarios driven through the public
//! `BranchEngine`/`BranchRegistry` surface rather than any one module's
//! internals.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use droid_engine::config::ProjectConfig;
use droid_engine::engine::{BranchEngine, EngineContext, ExitCode, Operation, State};
use droid_engine::metadata::MetadataStore;

fn project_config() -> ProjectConfig {
    ProjectConfig {
        github: "acme/widgets".to_string(),
        makefile_path: "Makefile".to_string(),
        env: Default::default(),
        docker: None,
        title: None,
        description: None,
    }
}

fn spawn_engine(workspace: &Path, temp: &Path, metadata: Arc<MetadataStore>) -> BranchEngine {
    BranchEngine::spawn(EngineContext {
        project: "widgets".to_string(),
        branch: "main".to_string(),
        project_config: project_config(),
        workspace_dir: workspace.to_path_buf(),
        temp_dir: temp.to_path_buf(),
        console_path: temp.join("console.txt"),
        metadata,
        default_command_timeout: Duration::from_secs(10),
        github_user_name: None,
        github_user_email: None,
    })
}

fn write_head(workspace: &Path, ref_name: &str) {
    let git_dir = workspace.join(".git");
    fs::create_dir_all(&git_dir).unwrap();
    fs::write(git_dir.join("HEAD"), format!("ref: {ref_name}\n")).unwrap();
}

/// A workspace whose HEAD names a different branch refuses to run
/// anything; the console shows why, and no real `make` ever runs.
#[test]
fn head_mismatch_refuses_run_make_without_invoking_make() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = dir.path().join("workspace");
    let temp = dir.path().join("temp");
    fs::create_dir_all(&workspace).unwrap();
    fs::create_dir_all(&temp).unwrap();
    write_head(&workspace, "refs/heads/other");
    fs::write(
        workspace.join("Makefile"),
        ".PHONY: clean\n### Workflow\n# [Clean](clean)\n",
    )
    .unwrap();

    let metadata = Arc::new(MetadataStore::open_in_memory().unwrap());
    let engine = spawn_engine(&workspace, &temp, metadata);

    let snapshot = engine.submit(Operation::RunMake { target: "clean".to_string() }).unwrap();
    assert_eq!(snapshot.action, "clean");

    // Give the substituted echo command a moment to finish and the
    // console writer thread to flush.
    std::thread::sleep(Duration::from_millis(200));
    let refreshed = engine.submit(Operation::Refresh).unwrap();

    assert_eq!(refreshed.exit_code, ExitCode::Resolved(1));
    assert!(
        refreshed.console.contains("does not match the HEAD"),
        "console was: {:?}",
        refreshed.console
    );
}

/// `cancel` on an Idle branch returns the snapshot unchanged.
#[test]
fn cancel_on_freshly_spawned_branch_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = dir.path().join("workspace");
    let temp = dir.path().join("temp");
    fs::create_dir_all(&workspace).unwrap();
    fs::create_dir_all(&temp).unwrap();

    let metadata = Arc::new(MetadataStore::open_in_memory().unwrap());
    let engine = spawn_engine(&workspace, &temp, metadata);

    let before = engine.snapshot();
    let after = engine.submit(Operation::Cancel).unwrap();
    assert_eq!(before.state, after.state);
    assert_eq!(after.state, State::Idle);
    assert!(!after.cancelled);
}

/// A seeded metadata row surfaces on the engine's very first snapshot,
/// before any operation runs.
#[test]
fn restart_recovery_seeds_snapshot_from_metadata() {
    use droid_engine::metadata::MetadataRow;

    let dir = tempfile::tempdir().unwrap();
    let workspace = dir.path().join("workspace");
    let temp = dir.path().join("temp");
    fs::create_dir_all(&workspace).unwrap();
    fs::create_dir_all(&temp).unwrap();

    let metadata = Arc::new(MetadataStore::open_in_memory().unwrap());
    metadata
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

    let engine = spawn_engine(&workspace, &temp, metadata);
    let snapshot = engine.snapshot();

    assert_eq!(snapshot.action, "update");
    assert_eq!(snapshot.command, "make update");
    assert_eq!(snapshot.exit_code, ExitCode::Resolved(0));
    assert!(!snapshot.cancelled);
}
