//! Per-task workspace directories.
//!
//! Each task runs inside `<base>/<task_id>_<timestamp>` with an `input/`
//! tree for descriptor files, an `output/` tree the tool writes results to,
//! and `logs/` for capture files. A hidden `.zephyr/settings.json` carries
//! the back-end settings the external tool picks up. The workspace is
//! exclusively owned by its task; reclamation failures are logged and never
//! propagate.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;
use serde_json::json;

use crate::error::WorkspaceError;
use crate::task::Artifact;

/// Files below this size with a known suffix get their content inlined.
const INLINE_MAX_BYTES: u64 = 100_000;

/// Suffixes treated as text-like for inlining.
const INLINE_SUFFIXES: [&str; 4] = [".txt", ".json", ".md", ".log"];

/// Summary of an existing workspace directory.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceInfo {
    pub path: PathBuf,
    pub name: String,
    #[serde(skip)]
    pub created: SystemTime,
    pub size_bytes: u64,
}

pub struct WorkspaceManager {
    base: PathBuf,
    /// Back-end settings document written into each workspace.
    settings: serde_json::Value,
}

impl WorkspaceManager {
    pub fn new(base: impl Into<PathBuf>, settings: serde_json::Value) -> Self {
        Self {
            base: base.into(),
            settings,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Create `<base>/<task_id>_<timestamp>` with its standard subtrees.
    pub fn create(&self, task_id: &str) -> Result<PathBuf, WorkspaceError> {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let workspace = self.base.join(format!("{task_id}_{timestamp}"));

        std::fs::create_dir_all(&workspace).map_err(WorkspaceError::Create)?;
        for subdir in ["input", "output", "logs"] {
            std::fs::create_dir_all(workspace.join(subdir)).map_err(WorkspaceError::Create)?;
        }

        let hidden = workspace.join(".zephyr");
        std::fs::create_dir_all(&hidden).map_err(WorkspaceError::Create)?;
        let settings = serde_json::to_string_pretty(&self.settings).unwrap_or_else(|_| "{}".into());
        std::fs::write(hidden.join("settings.json"), settings)?;

        tracing::debug!("created workspace {}", workspace.display());
        Ok(workspace)
    }

    /// Materialise descriptor files under `input/` and the context into
    /// `task_context.json` at the workspace root.
    pub fn populate(
        &self,
        workspace: &Path,
        files: &std::collections::BTreeMap<String, String>,
        context: &std::collections::BTreeMap<String, serde_json::Value>,
    ) -> Result<(), WorkspaceError> {
        let input_dir = workspace.join("input");

        for (relative, content) in files {
            let path = input_dir.join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|source| WorkspaceError::WriteInput {
                    path: relative.clone(),
                    source,
                })?;
            }
            std::fs::write(&path, content).map_err(|source| WorkspaceError::WriteInput {
                path: relative.clone(),
                source,
            })?;
        }

        if !context.is_empty() {
            let context_json =
                serde_json::to_string_pretty(&json!(context)).unwrap_or_else(|_| "{}".into());
            std::fs::write(workspace.join("task_context.json"), context_json)?;
        }

        Ok(())
    }

    /// Walk `output/` and describe every regular file found.
    ///
    /// Small text-like files additionally carry their content inline;
    /// decode failures silently drop the inline content.
    pub fn collect_artifacts(&self, workspace: &Path) -> Vec<Artifact> {
        let output_dir = workspace.join("output");
        if !output_dir.is_dir() {
            return Vec::new();
        }

        let mut artifacts = Vec::new();
        collect_from(&output_dir, &output_dir, &mut artifacts);
        artifacts.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        tracing::info!(
            "collected {} artifact(s) from {}",
            artifacts.len(),
            output_dir.display()
        );
        artifacts
    }

    /// Remove the entire workspace tree. Failures are logged only.
    pub fn destroy(&self, workspace: &Path) {
        match std::fs::remove_dir_all(workspace) {
            Ok(()) => tracing::info!("cleaned up workspace {}", workspace.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!("failed to clean up workspace {}: {e}", workspace.display()),
        }
    }

    /// List existing workspaces with their creation time and total size.
    pub fn list(&self) -> Vec<WorkspaceInfo> {
        let entries = match std::fs::read_dir(&self.base) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut workspaces = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let created = entry
                .metadata()
                .and_then(|m| m.created().or_else(|_| m.modified()))
                .unwrap_or(SystemTime::UNIX_EPOCH);
            workspaces.push(WorkspaceInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                size_bytes: tree_size(&path),
                path,
                created,
            });
        }
        workspaces
    }

    /// Remove workspaces created more than `hours` hours ago. Returns the
    /// number removed.
    pub fn reap_older_than(&self, hours: u64) -> usize {
        let max_age = std::time::Duration::from_secs(hours * 3600);
        let now = SystemTime::now();
        let mut removed = 0;

        for info in self.list() {
            let age = match now.duration_since(info.created) {
                Ok(age) => age,
                Err(_) => continue,
            };
            if age > max_age {
                self.destroy(&info.path);
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!("reaped {removed} old workspace(s)");
        }
        removed
    }
}

fn collect_from(root: &Path, dir: &Path, artifacts: &mut Vec<Artifact>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!("error walking {}: {e}", dir.display());
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_from(root, &path, artifacts);
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }

        let relative = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();
        let type_hint = path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_else(|| "unknown".into());

        let inline_content = if metadata.len() < INLINE_MAX_BYTES
            && INLINE_SUFFIXES.contains(&type_hint.as_str())
        {
            std::fs::read(&path)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        } else {
            None
        };

        artifacts.push(Artifact {
            name: entry.file_name().to_string_lossy().into_owned(),
            relative_path: relative,
            size_bytes: metadata.len(),
            type_hint,
            inline_content,
        });
    }
}

fn tree_size(dir: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                total += tree_size(&path);
            } else if let Ok(metadata) = entry.metadata() {
                total += metadata.len();
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn manager(dir: &Path) -> WorkspaceManager {
        WorkspaceManager::new(dir, json!({"model": "claude-sonnet-4", "max_tokens": 4096}))
    }

    #[test]
    fn create_lays_out_standard_subtrees() {
        let dir = tempdir().unwrap();
        let workspace = manager(dir.path()).create("t1").unwrap();

        assert!(workspace.join("input").is_dir());
        assert!(workspace.join("output").is_dir());
        assert!(workspace.join("logs").is_dir());
        assert!(workspace.join(".zephyr/settings.json").is_file());
        assert!(
            workspace
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("t1_")
        );
    }

    #[test]
    fn populate_roundtrips_file_content() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let workspace = mgr.create("t2").unwrap();

        let mut files = BTreeMap::new();
        files.insert("in.txt".to_string(), "x".to_string());
        files.insert("nested/deep/data.json".to_string(), "{\"a\":1}".to_string());
        let mut context = BTreeMap::new();
        context.insert("lang".to_string(), json!("en"));

        mgr.populate(&workspace, &files, &context).unwrap();

        for (relative, content) in &files {
            let read = std::fs::read_to_string(workspace.join("input").join(relative)).unwrap();
            assert_eq!(&read, content);
        }
        let context_doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(workspace.join("task_context.json")).unwrap())
                .unwrap();
        assert_eq!(context_doc["lang"], "en");
    }

    #[test]
    fn empty_files_still_creates_subtrees() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let workspace = mgr.create("t3").unwrap();
        mgr.populate(&workspace, &BTreeMap::new(), &BTreeMap::new())
            .unwrap();

        assert!(workspace.join("input").is_dir());
        assert!(workspace.join("output").is_dir());
        assert!(workspace.join("logs").is_dir());
        assert!(!workspace.join("task_context.json").exists());
    }

    #[test]
    fn artifact_inlining_respects_size_and_suffix() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let workspace = mgr.create("t4").unwrap();
        let output = workspace.join("output");

        std::fs::write(output.join("result.md"), "done").unwrap();
        std::fs::write(output.join("image.bin"), [0u8, 1, 2]).unwrap();
        std::fs::write(output.join("big.txt"), "a".repeat(100_001)).unwrap();
        std::fs::create_dir_all(output.join("sub")).unwrap();
        std::fs::write(output.join("sub/notes.log"), "line\n").unwrap();

        let artifacts = mgr.collect_artifacts(&workspace);
        assert_eq!(artifacts.len(), 4);

        let by_name = |name: &str| artifacts.iter().find(|a| a.name == name).unwrap();
        assert_eq!(by_name("result.md").inline_content.as_deref(), Some("done"));
        assert_eq!(by_name("result.md").type_hint, ".md");
        assert!(by_name("image.bin").inline_content.is_none());
        assert!(by_name("big.txt").inline_content.is_none());
        assert_eq!(by_name("big.txt").size_bytes, 100_001);
        assert_eq!(by_name("notes.log").relative_path, "sub/notes.log");
        assert_eq!(by_name("notes.log").inline_content.as_deref(), Some("line\n"));
    }

    #[test]
    fn destroy_and_reap_remove_trees() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());

        let w1 = mgr.create("t5").unwrap();
        mgr.destroy(&w1);
        assert!(!w1.exists());
        // Idempotent on a missing tree.
        mgr.destroy(&w1);

        let w2 = mgr.create("t6").unwrap();
        // Everything is older than a zero-hour horizon.
        let removed = mgr.reap_older_than(0);
        assert_eq!(removed, 1);
        assert!(!w2.exists());
        assert_eq!(mgr.reap_older_than(24), 0);
    }
}
