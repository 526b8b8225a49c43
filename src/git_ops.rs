//! The `GitOps` trait (§1 out-of-scope collaborator) and a concrete
//! `git`-CLI-backed implementation used by the control socket's
//! `GIT_FOLLOW_REQUEST` handling (§4.H).
//!
//! This is the only Git surface the rest of the crate depends on; HTTP
//! routing, hook script contents, and the external event sink are left to
//! the caller.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::errors::GitError;

/// Repository-local git config key for worktree-based follow mode (§4.H,
/// §9). Authoritative over the legacy [`FOLLOW_BRANCH_CONFIG_KEY`].
pub const FOLLOW_WORKTREE_CONFIG_KEY: &str = "vibetunnel.followWorktree";

/// Legacy repository-local git config key, cleared whenever follow mode is
/// disabled alongside [`FOLLOW_WORKTREE_CONFIG_KEY`] (§9 open question).
pub const FOLLOW_BRANCH_CONFIG_KEY: &str = "vibetunnel.followBranch";

/// One entry from `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    /// Absolute path to the worktree.
    pub path: PathBuf,
    /// Checked-out branch, or `None` if detached.
    pub branch: Option<String>,
}

/// The external Git capability this crate depends on (§1, §4.H).
///
/// Implementors own process spawning and hook script contents; this trait
/// only fixes the operations the control socket needs.
#[async_trait]
pub trait GitOps: Send + Sync {
    /// Install VibeTunnel's hooks in `repo_path`.
    async fn install_hooks(&self, repo_path: &Path) -> Result<(), GitError>;

    /// Remove VibeTunnel's hooks from `repo_path`.
    async fn uninstall_hooks(&self, repo_path: &Path) -> Result<(), GitError>;

    /// List worktrees known to the repository at `repo_path`.
    async fn worktree_list(&self, repo_path: &Path) -> Result<Vec<WorktreeEntry>, GitError>;

    /// The branch checked out at `repo_path`. `Err` on detached HEAD is not
    /// required; detached HEAD is reported as `Ok(None)` and callers decide
    /// whether that is fatal (§4.H: detached HEAD is fatal during
    /// recursive current-branch resolution).
    async fn current_branch(&self, repo_path: &Path) -> Result<Option<String>, GitError>;

    /// Set a repository-local git config key.
    async fn set_config(&self, repo_path: &Path, key: &str, value: &str) -> Result<(), GitError>;

    /// Unset a repository-local git config key. Not an error if the key is
    /// already absent.
    async fn unset_config(&self, repo_path: &Path, key: &str) -> Result<(), GitError>;

    /// Read a repository-local git config key, `Ok(None)` if unset.
    async fn get_config(&self, repo_path: &Path, key: &str) -> Result<Option<String>, GitError>;
}

/// `GitOps` backed by shelling out to the `git` binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct CliGitOps;

impl CliGitOps {
    /// Construct a CLI-backed `GitOps`.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    async fn run(&self, repo_path: &Path, args: &[&str]) -> Result<String, GitError> {
        let output = Command::new("git")
            .current_dir(repo_path)
            .args(args)
            .output()
            .await
            .map_err(|e| GitError {
                repo_path: repo_path.to_path_buf(),
                operation: "spawn",
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(GitError {
                repo_path: repo_path.to_path_buf(),
                operation: "exec",
                message: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl GitOps for CliGitOps {
    async fn install_hooks(&self, repo_path: &Path) -> Result<(), GitError> {
        let hooks_dir = repo_path.join(".git").join("hooks");
        tokio::fs::create_dir_all(&hooks_dir).await.map_err(|e| GitError {
            repo_path: repo_path.to_path_buf(),
            operation: "install_hooks",
            message: e.to_string(),
        })?;
        for hook in ["post-checkout", "post-merge", "post-commit", "post-rewrite"] {
            let path = hooks_dir.join(hook);
            let script = "#!/bin/sh\n# installed by vibetunnel follow mode\nexit 0\n";
            tokio::fs::write(&path, script).await.map_err(|e| GitError {
                repo_path: repo_path.to_path_buf(),
                operation: "install_hooks",
                message: e.to_string(),
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o755);
                tokio::fs::set_permissions(&path, perms).await.map_err(|e| GitError {
                    repo_path: repo_path.to_path_buf(),
                    operation: "install_hooks",
                    message: e.to_string(),
                })?;
            }
        }
        Ok(())
    }

    async fn uninstall_hooks(&self, repo_path: &Path) -> Result<(), GitError> {
        let hooks_dir = repo_path.join(".git").join("hooks");
        for hook in ["post-checkout", "post-merge", "post-commit", "post-rewrite"] {
            let path = hooks_dir.join(hook);
            if path.exists() {
                tokio::fs::remove_file(&path).await.map_err(|e| GitError {
                    repo_path: repo_path.to_path_buf(),
                    operation: "uninstall_hooks",
                    message: e.to_string(),
                })?;
            }
        }
        Ok(())
    }

    async fn worktree_list(&self, repo_path: &Path) -> Result<Vec<WorktreeEntry>, GitError> {
        let raw = self
            .run(repo_path, &["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_worktree_list(&raw))
    }

    async fn current_branch(&self, repo_path: &Path) -> Result<Option<String>, GitError> {
        let raw = self
            .run(repo_path, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        let branch = raw.trim();
        if branch == "HEAD" {
            Ok(None)
        } else {
            Ok(Some(branch.to_owned()))
        }
    }

    async fn set_config(&self, repo_path: &Path, key: &str, value: &str) -> Result<(), GitError> {
        self.run(repo_path, &["config", "--local", key, value]).await?;
        Ok(())
    }

    async fn unset_config(&self, repo_path: &Path, key: &str) -> Result<(), GitError> {
        match self.run(repo_path, &["config", "--local", "--unset", key]).await {
            Ok(_) => Ok(()),
            Err(err) if err.message.contains("not set") => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn get_config(&self, repo_path: &Path, key: &str) -> Result<Option<String>, GitError> {
        match self.run(repo_path, &["config", "--local", "--get", key]).await {
            Ok(value) => Ok(Some(value.trim().to_owned())),
            // `git config --get` on an unset key exits non-zero with empty
            // stderr; any actual failure (not a repo, bad key) has a message.
            Err(err) if err.operation == "exec" && err.message.trim().is_empty() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

fn parse_worktree_list(raw: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_branch: Option<String> = None;

    for line in raw.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(path) = current_path.take() {
                entries.push(WorktreeEntry {
                    path,
                    branch: current_branch.take(),
                });
            }
            current_path = Some(PathBuf::from(path));
        } else if let Some(branch_ref) = line.strip_prefix("branch ") {
            current_branch = branch_ref
                .strip_prefix("refs/heads/")
                .map(ToOwned::to_owned)
                .or_else(|| Some(branch_ref.to_owned()));
        }
    }
    if let Some(path) = current_path {
        entries.push(WorktreeEntry {
            path,
            branch: current_branch,
        });
    }

    entries
}

/// Resolve which worktree a `GIT_FOLLOW_REQUEST` should follow (§4.H):
/// explicit `worktree_path`, else the worktree for `branch` (via
/// `worktree_list`), else the current branch, recursively.
///
/// # Errors
///
/// Returns a [`GitError`]-carrying message via the final `Err(String)` arm
/// if HEAD is detached and no explicit target was given — detached HEAD is
/// fatal per §4.H.
pub async fn resolve_follow_target(
    git: &dyn GitOps,
    repo_path: &Path,
    branch: Option<&str>,
    worktree_path: Option<&Path>,
) -> Result<PathBuf, String> {
    if let Some(path) = worktree_path {
        return Ok(path.to_path_buf());
    }

    if let Some(branch) = branch {
        let worktrees = git
            .worktree_list(repo_path)
            .await
            .map_err(|e| e.to_string())?;
        if let Some(entry) = worktrees.into_iter().find(|w| w.branch.as_deref() == Some(branch)) {
            return Ok(entry.path);
        }
    }

    match git.current_branch(repo_path).await {
        Ok(Some(_)) => Ok(repo_path.to_path_buf()),
        Ok(None) => Err(format!("{}: HEAD is detached", repo_path.display())),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_porcelain_worktree_list() {
        let raw = "worktree /repo\nHEAD abc123\nbranch refs/heads/main\n\nworktree /repo-dev\nHEAD def456\nbranch refs/heads/dev\n";
        let entries = parse_worktree_list(raw);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, PathBuf::from("/repo"));
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert_eq!(entries[1].branch.as_deref(), Some("dev"));
    }

    #[test]
    fn parses_detached_worktree_entry() {
        let raw = "worktree /repo\nHEAD abc123\ndetached\n";
        let entries = parse_worktree_list(raw);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].branch, None);
    }
}
