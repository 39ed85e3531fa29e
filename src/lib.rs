//! The DROID branch-lifecycle engine.
//!
//! This crate is the core of a multi-tenant build frontend: for each
//! `(project, branch)` pair it owns a workspace directory, an optional
//! Docker container, the current subprocess (if any), and the branch's
//! parsed Makefile. Everything above this layer — HTTP handlers, HTML
//! rendering, session/auth middleware, the config-file setup wizard — is a
//! pure adapter that consumes the types exported here.

pub mod command;
pub mod config;
pub mod docker;
pub mod engine;
pub mod git;
pub mod github;
pub mod makefile;
pub mod metadata;
pub mod registry;

pub use config::{DockerConfig, DroidConfig, ProjectConfig};
pub use engine::{BranchEngine, BranchSnapshot, EngineError, ExitCode, State};
pub use registry::{BranchRegistry, RemoteBranchRegistry};
