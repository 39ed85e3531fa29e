//! Makefile parsing: `.PHONY` extraction, the `### Workflow` markdown
//! block, and classification of referenced targets into the action
//! catalogue the HTTP layer renders as buttons.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::time::SystemTime;

use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};

#[derive(Debug)]
pub enum MakefileError {
    Io(std::io::Error),
}

impl fmt::Display for MakefileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MakefileError::Io(e) => write!(f, "failed to read makefile: {e}"),
        }
    }
}

impl std::error::Error for MakefileError {}

/// One entry in the git-action table, shared by the
/// command runner and this parser.
#[derive(Debug, Clone, Copy)]
pub struct GitAction {
    pub key: &'static str,
    pub command_template: &'static str,
    pub label: &'static str,
    pub style: &'static str,
    pub confirm: bool,
}

pub const GIT_ACTION_TABLE: &[GitAction] = &[
    GitAction { key: "git-status", command_template: "git status", label: "Status", style: "success", confirm: false },
    GitAction { key: "git-diff", command_template: "git diff", label: "Diff", style: "success", confirm: false },
    GitAction { key: "git-fetch", command_template: "git fetch", label: "Fetch", style: "success", confirm: false },
    GitAction { key: "git-pull", command_template: "git pull", label: "Pull", style: "warning", confirm: false },
    GitAction { key: "git-push", command_template: "git push", label: "Push", style: "danger", confirm: true },
    GitAction { key: "git-reset-hard", command_template: "git reset --hard", label: "Reset", style: "danger", confirm: true },
    GitAction { key: "git-commit", command_template: "git commit --all -m \"<msg>\" --author \"<name> <email>\"", label: "Commit", style: "warning", confirm: false },
    GitAction { key: "git-amend", command_template: "git commit --all --amend -m \"<msg>\"", label: "Amend", style: "warning", confirm: false },
];

pub fn git_action_by_key(key: &str) -> Option<&'static GitAction> {
    GIT_ACTION_TABLE.iter().find(|a| a.key == key)
}

/// Look up the table entry whose `command_template` is exactly
/// `"git <subcommand>"`. Matching the full template (not just its first
/// word) is what lets multi-word subcommands like `reset --hard` map to
/// their canonical key (`git-reset-hard`) instead of a mechanical
/// space-to-dash rewrite of the subcommand, which would produce
/// `git-reset---hard` and never match.
fn git_action_for_subcommand(subcommand: &str) -> Option<&'static GitAction> {
    let full = format!("git {subcommand}");
    GIT_ACTION_TABLE.iter().find(|a| a.command_template == full)
}

/// A single classified reference found in the workflow markdown
///.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    GeneralAction { target: String },
    GitAction { key: String },
    FileView { path: String },
    DirView { path: String },
    ExecView { path: String, query: String, label: String },
    External { url: String },
}

/// A parsed Makefile, as exposed to the branch engine.
#[derive(Debug, Clone)]
pub struct ParsedMakefile {
    pub name: String,
    pub modified: SystemTime,
    pub markdown: String,
    pub phony_targets: BTreeSet<String>,
    pub actions: Vec<ActionKind>,
    pub html: String,
}

impl ParsedMakefile {
    pub fn general_actions(&self) -> Vec<&str> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                ActionKind::GeneralAction { target } => Some(target.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn git_actions(&self) -> Vec<&str> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                ActionKind::GitAction { key } => Some(key.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn file_views(&self) -> Vec<&str> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                ActionKind::FileView { path } => Some(path.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn dir_views(&self) -> Vec<&str> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                ActionKind::DirView { path } => Some(path.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn exec_views(&self) -> Vec<&str> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                ActionKind::ExecView { path, .. } => Some(path.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Parse the Makefile at `path`. Returns `Ok(None)` if the file doesn't
/// exist — a warning, not an error.3.
pub fn parse(path: &Path) -> Result<Option<ParsedMakefile>, MakefileError> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read_to_string(path).map_err(MakefileError::Io)?;
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(MakefileError::Io)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(Some(parse_str(&name, &bytes, modified)))
}

/// Pure-function core: parsing is a function only of the file bytes,
/// name, and the static git-action table.
pub fn parse_str(name: &str, contents: &str, modified: SystemTime) -> ParsedMakefile {
    let phony_targets = extract_phony_targets(contents);
    let markdown = extract_workflow_markdown(contents);
    let html = render_markdown(&markdown);
    let actions = classify_links(&markdown, &phony_targets);

    ParsedMakefile {
        name: name.to_string(),
        modified,
        markdown,
        phony_targets,
        actions,
        html,
    }
}

fn extract_phony_targets(contents: &str) -> BTreeSet<String> {
    let mut targets = BTreeSet::new();
    for line in contents.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix(".PHONY:") {
            for name in rest.split_whitespace() {
                targets.insert(name.to_string());
            }
        }
    }
    targets
}

fn extract_workflow_markdown(contents: &str) -> String {
    let mut lines = contents.lines();
    while let Some(line) = lines.next() {
        if line.trim_end() == "### Workflow" {
            let mut buffer = Vec::new();
            for comment_line in lines.by_ref() {
                let stripped = if let Some(rest) = comment_line.strip_prefix("# ") {
                    rest
                } else if let Some(rest) = comment_line.strip_prefix('#') {
                    rest
                } else {
                    break;
                };
                buffer.push(stripped.to_string());
            }
            return buffer.join("\n");
        }
    }
    String::new()
}

fn render_markdown(markdown: &str) -> String {
    if markdown.is_empty() {
        return String::new();
    }
    let parser = Parser::new_ext(markdown, Options::ENABLE_TABLES);
    let mut html = String::new();
    pulldown_cmark::html::push_html(&mut html, parser);
    html
}

/// Walk the rendered markdown's links and inline code spans, classifying
/// each into the action catalogue.
fn classify_links(markdown: &str, phony_targets: &BTreeSet<String>) -> Vec<ActionKind> {
    if markdown.is_empty() {
        return Vec::new();
    }

    let parser = Parser::new_ext(markdown, Options::ENABLE_TABLES);
    let mut actions = Vec::new();
    let mut in_link: Option<String> = None;

    for event in parser {
        match event {
            Event::Start(Tag::Link { dest_url, .. }) => {
                in_link = Some(dest_url.into_string());
            }
            Event::End(TagEnd::Link) => {
                if let Some(dest) = in_link.take() {
                    if let Some(action) = classify_target(&dest, phony_targets) {
                        actions.push(action);
                    }
                }
            }
            Event::Code(code) => {
                if in_link.is_none() {
                    if let Some(action) = classify_target(&code, phony_targets) {
                        actions.push(action);
                    }
                }
            }
            _ => {}
        }
    }

    actions
}

/// Classify one target/path string.3:
/// - `make <target>` or a bare phony name → general-action
/// - `git <subcommand>` (known) → git-action
/// - path ending `/` → dir-view
/// - path starting `./` → exec-view
/// - otherwise → file-view
/// URIs with an authority pass through unchanged.
fn classify_target(raw: &str, phony_targets: &BTreeSet<String>) -> Option<ActionKind> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if raw.contains("://") {
        return Some(ActionKind::External {
            url: raw.to_string(),
        });
    }

    if let Some(target) = raw.strip_prefix("make ") {
        return Some(ActionKind::GeneralAction {
            target: target.trim().to_string(),
        });
    }

    if let Some(subcommand) = raw.strip_prefix("git ") {
        let subcommand = subcommand.trim();
        if let Some(action) = git_action_for_subcommand(subcommand) {
            return Some(ActionKind::GitAction {
                key: action.key.to_string(),
            });
        }
    }

    if phony_targets.contains(raw) {
        return Some(ActionKind::GeneralAction {
            target: raw.to_string(),
        });
    }

    if let Some(rest) = raw.strip_prefix("./") {
        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
        let label = Path::new(path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());
        return Some(ActionKind::ExecView {
            path: path.to_string(),
            query: query.to_string(),
            label,
        });
    }

    if raw.ends_with('/') {
        return Some(ActionKind::DirView {
            path: raw.to_string(),
        });
    }

    Some(ActionKind::FileView {
        path: raw.to_string(),
    })
}

/// Rewrite a view path for the HTML layer's link, encoding `../` as
/// `PREV_DIR/`.3 step 4.
pub fn encode_view_path(path: &str) -> String {
    let replaced = path.replace("../", "PREV_DIR/");
    urlencoding::encode(&replaced).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> SystemTime {
        SystemTime::UNIX_EPOCH
    }

    #[test]
    fn parses_minimal_makefile_scenario() {
        let contents = ".PHONY: clean update\n### Workflow\n# 1. [Clean](clean)\n# 2. [Update](update)\n# 3. [Build](build/update.txt)\n";
        let parsed = parse_str("Makefile", contents, now());

        assert_eq!(
            parsed.phony_targets,
            BTreeSet::from(["clean".to_string(), "update".to_string()])
        );
        assert_eq!(
            parsed.markdown,
            "1. [Clean](clean)\n2. [Update](update)\n3. [Build](build/update.txt)"
        );
        assert_eq!(
            parsed.general_actions().into_iter().collect::<BTreeSet<_>>(),
            BTreeSet::from(["clean", "update"])
        );
        assert_eq!(parsed.file_views(), vec!["build/update.txt"]);
    }

    #[test]
    fn no_workflow_block_yields_empty_markdown_but_full_phony_targets() {
        let contents = ".PHONY: clean update\nclean:\n\trm -rf build\n";
        let parsed = parse_str("Makefile", contents, now());
        assert!(parsed.markdown.is_empty());
        assert!(parsed.html.is_empty());
        assert!(parsed.actions.is_empty());
        assert_eq!(parsed.phony_targets.len(), 2);
    }

    #[test]
    fn classifies_git_action_links() {
        let contents = "### Workflow\n# [Push](git push)\n";
        let parsed = parse_str("Makefile", contents, now());
        assert_eq!(parsed.git_actions(), vec!["git-push"]);
    }

    #[test]
    fn classifies_multi_word_git_subcommand_to_its_canonical_key() {
        let contents = "### Workflow\n# [Reset](git reset --hard)\n";
        let parsed = parse_str("Makefile", contents, now());
        assert_eq!(parsed.git_actions(), vec!["git-reset-hard"]);
    }

    #[test]
    fn classifies_exec_view_with_query_and_label() {
        let contents = "### Workflow\n# [Run](./scripts/report.sh?fast=1)\n";
        let parsed = parse_str("Makefile", contents, now());
        assert_eq!(parsed.exec_views(), vec!["scripts/report.sh"]);
        assert!(matches!(
            &parsed.actions[0],
            ActionKind::ExecView { query, label, .. }
                if query == "fast=1" && label == "report"
        ));
    }

    #[test]
    fn classifies_dir_view() {
        let contents = "### Workflow\n# [Artifacts](build/artifacts/)\n";
        let parsed = parse_str("Makefile", contents, now());
        assert_eq!(parsed.dir_views(), vec!["build/artifacts/"]);
    }

    #[test]
    fn external_links_pass_through() {
        let contents = "### Workflow\n# [Docs](https://example.com/docs)\n";
        let parsed = parse_str("Makefile", contents, now());
        assert!(parsed.actions.is_empty() == false);
        assert!(matches!(&parsed.actions[0], ActionKind::External { url } if url == "https://example.com/docs"));
    }

    #[test]
    fn encode_view_path_handles_parent_dir() {
        assert_eq!(encode_view_path("../logs/out.txt"), "PREV_DIR%2Flogs%2Fout.txt");
    }

    #[test]
    fn parsing_is_deterministic() {
        let contents = ".PHONY: build\n### Workflow\n# [Build](make build)\n";
        let a = parse_str("Makefile", contents, now());
        let b = parse_str("Makefile", contents, now());
        assert_eq!(a.markdown, b.markdown);
        assert_eq!(a.phony_targets, b.phony_targets);
        assert_eq!(a.actions, b.actions);
        assert_eq!(a.html, b.html);
    }
}
