//! Buildable, publishable packages.
//!
//! A [`Package`] owns the checkout of its source repository and drives the
//! three release stages: `pull` (refresh the checkout and snapshot the
//! release tag), `build` (build and convert the conda recipe of that
//! snapshot) and `upload` (publish the built packages).

mod conda;
mod recipe;
mod upload;
mod version;

use anyhow::{Context, Result, bail};
use log::{debug, error, info, warn};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::archive::TarExtractor;
use crate::repository::Repository;
use crate::runtime::Runtime;

pub use conda::{Conda, DEFAULT_PLATFORMS};
pub use recipe::{
    META_FILE, Pin, RECIPE_CANDIDATES, find_recipe_dir, rewrite_meta, update_meta_file,
};
pub use upload::{ArtifactOutcome, UploadOptions, UploadReport, UploadStatus, artifact_name};
pub use version::{PythonVersion, version_from_tag};

/// Print a progress line for a package.
fn step(name: &str, action: impl std::fmt::Display) {
    println!("[{}] {}", name, action);
}

pub struct Package<'a, R: Runtime> {
    runtime: &'a R,
    name: String,
    cachedir: PathBuf,
    repo: Repository<'a, R>,
    dependencies: Vec<String>,
    supported_versions: BTreeSet<PythonVersion>,
    tag: Option<String>,
}

impl<'a, R: Runtime> Package<'a, R> {
    /// Create a package whose checkout lives at `<cachedir>/pull/<name>`.
    pub fn new(
        runtime: &'a R,
        name: impl Into<String>,
        mut repo: Repository<'a, R>,
        cachedir: impl Into<PathBuf>,
        supported_versions: impl IntoIterator<Item = PythonVersion>,
        dependencies: Vec<String>,
    ) -> Self {
        let name = name.into();
        let cachedir = cachedir.into();
        repo.set_path(cachedir.join("pull").join(&name));
        Self {
            runtime,
            name,
            cachedir,
            repo,
            dependencies,
            supported_versions: supported_versions.into_iter().collect(),
            tag: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn repo(&self) -> &Repository<'a, R> {
        &self.repo
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn supported_versions(&self) -> &BTreeSet<PythonVersion> {
        &self.supported_versions
    }

    pub fn cachedir(&self) -> &Path {
        &self.cachedir
    }

    pub fn pull_cachedir(&self) -> PathBuf {
        self.cachedir.join("pull")
    }

    pub fn build_cachedir(&self) -> PathBuf {
        self.cachedir.join("build")
    }

    /// The release tag, if already resolved or overridden.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Override the release tag instead of using the latest one.
    pub fn set_tag(&mut self, tag: impl Into<String>) {
        self.tag = Some(tag.into());
    }

    /// The release tag, looking up the latest tag of the checkout on first use.
    pub fn resolve_tag(&mut self) -> Result<String> {
        if let Some(tag) = &self.tag {
            return Ok(tag.clone());
        }
        let tag = self
            .repo
            .latest_tag()?
            .with_context(|| format!("No tags found in the {} repository", self.name))?;
        info!("Resolved {} release tag {}", self.name, tag);
        self.tag = Some(tag.clone());
        Ok(tag)
    }

    /// Supported versions that were also requested, in ascending order.
    pub fn versions_to_build<'v>(
        &'v self,
        requested: &'v [PythonVersion],
    ) -> impl Iterator<Item = &'v PythonVersion> {
        self.supported_versions
            .iter()
            .filter(move |v| requested.contains(*v))
    }

    /// Refresh the checkout, check out the release tag and archive it into
    /// the build cache.
    #[tracing::instrument(skip(self), fields(package = %self.name))]
    pub fn pull(&mut self) -> Result<()> {
        if self.repo.is_valid() {
            step(&self.name, "resetting");
            self.repo.reset()?;
            step(&self.name, "pulling");
            self.repo.pull()?;
        } else {
            step(&self.name, "removing");
            self.repo.remove()?;
            step(&self.name, "cloning");
            self.repo.clone()?;
        }

        step(&self.name, "fetching");
        self.repo.fetch()?;

        let tag = self.resolve_tag()?;

        step(&self.name, format!("checking-out {}", tag));
        self.repo.checkout(self.repo.branch(), Some(&tag))?;

        step(&self.name, "archiving");
        self.repo.archive(&self.name, &tag, &self.build_cachedir())?;
        Ok(())
    }

    /// Build the archived release for every requested Python version this
    /// package supports, then convert each build to the other platforms.
    ///
    /// `pins` must hold a resolved tag for every dependency.
    #[tracing::instrument(skip(self, conda, pins), fields(package = %self.name))]
    pub fn build(
        &mut self,
        conda: &Conda<'_, R>,
        channel: &str,
        py_versions: &[PythonVersion],
        pins: &[Pin],
    ) -> Result<()> {
        let tag = self.resolve_tag()?;
        let dependency_pins = self.dependency_pins(pins)?;

        let build_cachedir = self.build_cachedir();
        let stem = format!("{}-{}", self.name, tag);
        let archive = build_cachedir.join(format!("{}.tar", stem));
        let source_dir = build_cachedir.join(&stem);
        if self.runtime.exists(&source_dir) {
            debug!("Removing previous extraction {:?}", source_dir);
            self.runtime
                .remove_dir_all(&source_dir)
                .with_context(|| format!("Failed to remove {:?}", source_dir))?;
        }
        TarExtractor
            .extract(self.runtime, &archive, &build_cachedir)
            .with_context(|| format!("Failed to extract {:?}", archive))?;

        let recipe = find_recipe_dir(self.runtime, &source_dir)?;
        update_meta_file(
            self.runtime,
            &source_dir.join(&recipe),
            version_from_tag(&tag),
            &dependency_pins,
        )?;

        let versions: Vec<PythonVersion> = self.versions_to_build(py_versions).cloned().collect();
        if versions.is_empty() {
            warn!(
                "{} supports none of the requested Python versions",
                self.name
            );
        }

        for python in &versions {
            step(&self.name, format!("building {}", python));
            conda.build(&source_dir, &recipe, channel, python)?;

            let artifact = conda.output_path(&source_dir, &recipe, python)?;
            info!("Built {}", artifact.display());
            conda.convert(&artifact, |platform| {
                step(&self.name, format!("converting-to {}", platform))
            })?;
        }
        Ok(())
    }

    /// Pins for this package's dependencies, in declaration order.
    fn dependency_pins(&self, pins: &[Pin]) -> Result<Vec<Pin>> {
        let mut out = Vec::with_capacity(self.dependencies.len());
        for dep in &self.dependencies {
            match pins.iter().find(|p| &p.name == dep) {
                Some(pin) => out.push(pin.clone()),
                None => bail!(
                    "Dependency {} of {} has no resolved release tag",
                    dep,
                    self.name
                ),
            }
        }
        Ok(out)
    }

    /// Upload every built platform/version package. Individual upload
    /// failures are recorded in the report and never stop the loop.
    #[tracing::instrument(skip(self, conda, options), fields(package = %self.name))]
    pub fn upload(
        &mut self,
        conda: &Conda<'_, R>,
        options: &UploadOptions,
        py_versions: &[PythonVersion],
    ) -> Result<UploadReport> {
        options.log_config();

        let tag = self.resolve_tag()?;
        let version = version_from_tag(&tag);
        let build_root = conda.build_root()?;
        let versions: Vec<PythonVersion> = self.versions_to_build(py_versions).cloned().collect();

        let mut report = UploadReport::new(self.name.as_str());
        for platform in conda.platforms() {
            step(&self.name, format!("uploading {} packages", platform));
            for python in &versions {
                let artifact = build_root
                    .join(platform)
                    .join(artifact_name(&self.name, version, &python.compact()));

                if !self.runtime.exists(&artifact) {
                    warn!("Skipping {}: no such package was built", artifact.display());
                    report.record(artifact, UploadStatus::Missing);
                    continue;
                }

                info!("uploading {}", artifact.display());
                let status = match self.runtime.run(&options.command(&artifact)) {
                    Ok(()) => UploadStatus::Uploaded,
                    Err(e) => {
                        let status = UploadStatus::from_error(&e);
                        match &status {
                            UploadStatus::AlreadyExists => error!(
                                "Failed on anaconda upload of {} likely because version already exists - continuing",
                                artifact.display()
                            ),
                            _ => error!(
                                "Failed on anaconda upload of {}: {:#} - continuing",
                                artifact.display(),
                                e
                            ),
                        }
                        status
                    }
                };
                report.record(artifact, status);
            }
        }
        Ok(report)
    }
}
