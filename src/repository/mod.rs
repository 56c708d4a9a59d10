//! Git checkout management.
//!
//! A [`Repository`] is one local checkout bound to a remote URL. All
//! operations shell out to `git` with the checkout as working directory.

use anyhow::{Context, Result};
use log::{debug, info};
use std::path::{Path, PathBuf};

use crate::runtime::{CommandLine, Runtime};

/// Branch merged on pull and checked out when no tag is requested.
pub const DEFAULT_BRANCH: &str = "master";

pub struct Repository<'a, R: Runtime> {
    runtime: &'a R,
    url: String,
    branch: String,
    path: PathBuf,
}

impl<'a, R: Runtime> Repository<'a, R> {
    /// Create a repository for `url`, checked out in the current directory
    /// until the owner assigns a path.
    pub fn new(runtime: &'a R, url: impl Into<String>) -> Self {
        Self {
            runtime,
            url: url.into(),
            branch: DEFAULT_BRANCH.to_string(),
            path: PathBuf::from("."),
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    fn git(&self) -> CommandLine {
        CommandLine::new("git").current_dir(&self.path)
    }

    /// Whether `path` holds a git work tree whose origin is `url`.
    #[tracing::instrument(skip(self), fields(path = ?self.path))]
    pub fn is_valid(&self) -> bool {
        if !self.runtime.exists(&self.path) {
            debug!("{:?} does not exist", self.path);
            return false;
        }
        if !self.runtime.exists(&self.path.join(".git")) {
            debug!("{:?} has no .git directory", self.path);
            return false;
        }

        let inside = self
            .runtime
            .capture(&self.git().args(["rev-parse", "--is-inside-work-tree"]));
        match inside {
            Ok(out) if out.trim() == "true" => {}
            Ok(out) => {
                debug!("{:?} is not a work tree: {}", self.path, out.trim());
                return false;
            }
            Err(e) => {
                debug!("Failed to query work tree at {:?}: {}", self.path, e);
                return false;
            }
        }

        match self.runtime.capture(&self.git().args(["ls-remote", "--get-url"])) {
            Ok(out) if out.trim() == self.url => true,
            Ok(out) => {
                debug!("Remote {} does not match {}", out.trim(), self.url);
                false
            }
            Err(e) => {
                debug!("Failed to query remote url at {:?}: {}", self.path, e);
                false
            }
        }
    }

    /// Delete the checkout, if any.
    pub fn remove(&self) -> Result<()> {
        info!("Removing {}", self.path.display());
        if self.runtime.exists(&self.path) {
            self.runtime
                .remove_dir_all(&self.path)
                .with_context(|| format!("Failed to remove {:?}", self.path))?;
        }
        Ok(())
    }

    /// Discard local modifications to tracked files.
    pub fn reset(&self) -> Result<()> {
        self.runtime.run(&self.git().args(["checkout", "."]))
    }

    pub fn clone(&self) -> Result<()> {
        info!("Cloning {} to {}", self.url, self.path.display());
        let cmd = CommandLine::new("git")
            .arg("clone")
            .arg(self.url.as_str())
            .arg(self.path.to_string_lossy());
        self.runtime.run(&cmd)
    }

    /// Greatest tag by plain string ordering, so `v1.9.0` beats `v1.10.0`.
    pub fn latest_tag(&self) -> Result<Option<String>> {
        let output = self
            .runtime
            .capture(&self.git().arg("tag"))
            .with_context(|| format!("Failed to list tags in {:?}", self.path))?;
        let mut tags: Vec<&str> = output
            .lines()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();
        tags.sort_unstable();
        Ok(tags.last().map(|t| t.to_string()))
    }

    pub fn fetch(&self) -> Result<()> {
        info!("Fetching origin/tags for {}", self.path.display());
        self.runtime.run(&self.git().args(["fetch", "origin"]))?;
        self.runtime.run(&self.git().args(["fetch", "origin", "--tags"]))
    }

    pub fn pull(&self) -> Result<()> {
        self.runtime
            .run(&self.git().args(["pull", "origin", self.branch.as_str()]))
    }

    /// Check out `tag` when given, otherwise `branch`.
    pub fn checkout(&self, branch: &str, tag: Option<&str>) -> Result<()> {
        let target = match tag {
            Some(tag) => {
                info!("Checking out tag {}", tag);
                tag
            }
            None => {
                info!("Checking out branch {}", branch);
                branch
            }
        };
        self.runtime.run(&self.git().args(["checkout", target]))
    }

    /// Write `<archive_path>/<name>-<tag>.tar` holding the tree at `tag`
    /// under a `<name>-<tag>/` prefix.
    pub fn archive(&self, name: &str, tag: &str, archive_path: &Path) -> Result<PathBuf> {
        info!("Archiving {}", self.path.display());
        self.runtime
            .create_dir_all(archive_path)
            .with_context(|| format!("Failed to create {:?}", archive_path))?;

        let stem = format!("{}-{}", name, tag);
        let output = archive_path.join(format!("{}.tar", stem));
        let cmd = self
            .git()
            .arg("archive")
            .arg(format!("--prefix={}/", stem))
            .arg("-o")
            .arg(output.to_string_lossy())
            .arg(tag);
        self.runtime.run(&cmd)?;
        Ok(output)
    }
}
