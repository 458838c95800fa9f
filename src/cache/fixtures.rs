//! Local git repositories for tests that need a real remote.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use git2::{BranchType, Oid, Repository, RepositoryInitOptions, Signature};

/// Tests that shell out to git skip themselves when it isn't installed.
pub fn require_git() -> bool {
    let available = Command::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|output| output.status.success());
    if !available {
        eprintln!("skipping git test (git binary not found)");
    }
    available
}

/// A non-bare repository on disk with `main` as its initial branch.
pub struct SourceRepo {
    repo: Repository,
    path: PathBuf,
}

impl SourceRepo {
    pub fn create(path: &Path) -> Self {
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(path, &opts).unwrap();
        Self {
            repo,
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn url(&self) -> String {
        format!("file://{}", self.path.display())
    }

    /// Write `files` into the worktree and commit them on HEAD.
    pub fn commit(&self, files: &[(&str, &[u8])], message: &str) -> Oid {
        let mut index = self.repo.index().unwrap();
        for (name, contents) in files {
            let full = self.path.join(name);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(&full, contents).unwrap();
            index.add_path(Path::new(name)).unwrap();
        }
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = self.repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("Test", "test@example.com").unwrap();

        let parent = self
            .repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok());
        let parents: Vec<_> = parent.iter().collect();
        self.repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .unwrap()
    }

    pub fn branch(&self, name: &str, at: Oid) {
        let commit = self.repo.find_commit(at).unwrap();
        self.repo.branch(name, &commit, true).unwrap();
    }

    pub fn delete_branch(&self, name: &str) {
        self.repo
            .find_branch(name, BranchType::Local)
            .unwrap()
            .delete()
            .unwrap();
    }
}
