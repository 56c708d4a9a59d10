//! Release pipeline - drives the packages of a manifest in dependency order.
//!
//! The pipeline coordinates:
//! - Building the package graph from a [`Manifest`]
//! - Selecting packages by name while keeping dependency order
//! - Tag overrides and dependency pins
//! - Aggregating upload outcomes into one result

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use log::{debug, info};

use crate::config::Manifest;
use crate::package::{
    Conda, Package, Pin, PythonVersion, UploadOptions, UploadReport, UploadStatus,
};
use crate::repository::Repository;
use crate::runtime::Runtime;

/// One package as the pipeline will process it.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanEntry {
    pub name: String,
    pub url: String,
    pub branch: String,
    pub versions: Vec<PythonVersion>,
    pub dependencies: Vec<String>,
    pub checkout: PathBuf,
    /// Tag given on the command line, if any
    pub tag: Option<String>,
}

impl fmt::Display for PlanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let versions: Vec<&str> = self.versions.iter().map(|v| v.as_str()).collect();
        write!(f, "{} {} ({})", self.name, self.url, self.branch)?;
        write!(f, "\n    python: {}", versions.join(", "))?;
        if !self.dependencies.is_empty() {
            write!(f, "\n    depends on: {}", self.dependencies.join(", "))?;
        }
        if let Some(tag) = &self.tag {
            write!(f, "\n    tag: {}", tag)?;
        }
        write!(f, "\n    checkout: {}", self.checkout.display())
    }
}

pub struct Pipeline<'a, R: Runtime> {
    runtime: &'a R,
    cachedir: PathBuf,
    packages: Vec<Package<'a, R>>,
    conda: Conda<'a, R>,
}

impl<'a, R: Runtime> Pipeline<'a, R> {
    /// Create the packages of `manifest`, dependencies first.
    pub fn new(
        runtime: &'a R,
        manifest: &Manifest,
        cachedir: impl Into<PathBuf>,
        conda_bld: Option<PathBuf>,
    ) -> Result<Self> {
        let cachedir = cachedir.into();
        let packages = manifest
            .release_order()?
            .into_iter()
            .map(|spec| {
                Package::new(
                    runtime,
                    spec.name.as_str(),
                    Repository::new(runtime, spec.url.as_str()).with_branch(spec.branch.as_str()),
                    cachedir.as_path(),
                    spec.python.iter().cloned(),
                    spec.dependencies.clone(),
                )
            })
            .collect();
        let conda = Conda::new(runtime)
            .with_platforms(manifest.platforms())
            .with_build_root(conda_bld);

        Ok(Self {
            runtime,
            cachedir,
            packages,
            conda,
        })
    }

    pub fn cachedir(&self) -> &Path {
        &self.cachedir
    }

    pub fn plan(&self) -> Vec<PlanEntry> {
        self.packages
            .iter()
            .map(|pkg| PlanEntry {
                name: pkg.name().to_string(),
                url: pkg.repo().url().to_string(),
                branch: pkg.repo().branch().to_string(),
                versions: pkg.supported_versions().iter().cloned().collect(),
                dependencies: pkg.dependencies().to_vec(),
                checkout: pkg.repo().path().to_path_buf(),
                tag: pkg.tag().map(str::to_string),
            })
            .collect()
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        match self.packages.iter().position(|p| p.name() == name) {
            Some(idx) => Ok(idx),
            None => {
                let known: Vec<&str> = self.packages.iter().map(|p| p.name()).collect();
                bail!("Unknown package {} (known: {})", name, known.join(", "))
            }
        }
    }

    /// Release `name` at `tag` instead of its latest tag.
    pub fn set_tag(&mut self, name: &str, tag: &str) -> Result<()> {
        let idx = self.index_of(name)?;
        debug!("Overriding {} release tag with {}", name, tag);
        self.packages[idx].set_tag(tag);
        Ok(())
    }

    /// Indices of the named packages in release order. No names selects all.
    pub fn select(&self, names: &[String]) -> Result<Vec<usize>> {
        if names.is_empty() {
            return Ok((0..self.packages.len()).collect());
        }
        let mut selected = BTreeSet::new();
        for name in names {
            selected.insert(self.index_of(name)?);
        }
        Ok(selected.into_iter().collect())
    }

    /// The requested versions, or every version a selected package supports.
    pub fn requested_versions(
        &self,
        selected: &[usize],
        requested: &[PythonVersion],
    ) -> Vec<PythonVersion> {
        if !requested.is_empty() {
            return requested.to_vec();
        }
        selected
            .iter()
            .flat_map(|&idx| self.packages[idx].supported_versions().iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Pins for the dependencies of `name`, resolving their tags if needed.
    pub fn pins_for(&mut self, name: &str) -> Result<Vec<Pin>> {
        let idx = self.index_of(name)?;
        self.pins_at(idx)
    }

    fn pins_at(&mut self, idx: usize) -> Result<Vec<Pin>> {
        let deps = self.packages[idx].dependencies().to_vec();
        let mut pins = Vec::with_capacity(deps.len());
        for dep in deps {
            let dep_idx = self.index_of(&dep)?;
            let tag = self.packages[dep_idx].resolve_tag()?;
            pins.push(Pin::new(dep, tag));
        }
        Ok(pins)
    }

    #[tracing::instrument(skip(self))]
    pub fn pull(&mut self, names: &[String]) -> Result<()> {
        for idx in self.select(names)? {
            self.packages[idx].pull()?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub fn build(
        &mut self,
        names: &[String],
        channel: &str,
        versions: &[PythonVersion],
    ) -> Result<()> {
        let selected = self.select(names)?;
        let versions = self.requested_versions(&selected, versions);
        for idx in selected {
            self.build_at(idx, channel, &versions)?;
        }
        Ok(())
    }

    fn build_at(&mut self, idx: usize, channel: &str, versions: &[PythonVersion]) -> Result<()> {
        let pins = self.pins_at(idx)?;
        self.packages[idx].build(&self.conda, channel, versions, &pins)
    }

    /// Upload every selected package, then fail if any upload failed for a
    /// reason other than a duplicate or a missing build.
    #[tracing::instrument(skip(self, options))]
    pub fn upload(
        &mut self,
        names: &[String],
        options: &UploadOptions,
        versions: &[PythonVersion],
    ) -> Result<Vec<UploadReport>> {
        let selected = self.select(names)?;
        let versions = self.requested_versions(&selected, versions);
        let mut reports = Vec::with_capacity(selected.len());
        for idx in selected {
            reports.push(self.packages[idx].upload(&self.conda, options, &versions)?);
        }
        finish_uploads(&reports)?;
        Ok(reports)
    }

    /// Pull, build and (unless `upload` is `None`) upload each selected
    /// package before moving on to the next one.
    #[tracing::instrument(skip(self, upload))]
    pub fn release(
        &mut self,
        names: &[String],
        channel: &str,
        versions: &[PythonVersion],
        upload: Option<&UploadOptions>,
    ) -> Result<Vec<UploadReport>> {
        let selected = self.select(names)?;
        let versions = self.requested_versions(&selected, versions);
        let mut reports = Vec::new();
        let result = self.release_each(&selected, channel, &versions, upload, &mut reports);

        // Uploads that already happened are reported even when a later
        // package stops the run.
        match (result, finish_uploads(&reports)) {
            (Ok(()), summary) => summary.map(|_| reports),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(upload_err)) => Err(e.context(upload_err.to_string())),
        }
    }

    fn release_each(
        &mut self,
        selected: &[usize],
        channel: &str,
        versions: &[PythonVersion],
        upload: Option<&UploadOptions>,
        reports: &mut Vec<UploadReport>,
    ) -> Result<()> {
        for &idx in selected {
            self.packages[idx].pull()?;
            self.build_at(idx, channel, versions)?;
            if let Some(options) = upload {
                reports.push(self.packages[idx].upload(&self.conda, options, versions)?);
            }
        }
        Ok(())
    }

    /// Remove the whole cache directory.
    #[tracing::instrument(skip(self))]
    pub fn clean(&self) -> Result<()> {
        if !self.runtime.exists(&self.cachedir) {
            println!("Nothing to clean at {}", self.cachedir.display());
            return Ok(());
        }
        info!("Removing cache directory {}", self.cachedir.display());
        self.runtime.remove_dir_all(&self.cachedir)?;
        println!("Removed {}", self.cachedir.display());
        Ok(())
    }
}

fn finish_uploads(reports: &[UploadReport]) -> Result<()> {
    for report in reports {
        println!("{}", report);
    }
    let failures: Vec<String> = reports
        .iter()
        .flat_map(|r| r.failures())
        .map(|o| match &o.status {
            UploadStatus::Failed(reason) => {
                format!("  {}: {}", o.artifact.display(), reason)
            }
            _ => format!("  {}", o.artifact.display()),
        })
        .collect();
    if !failures.is_empty() {
        bail!(
            "{} upload(s) failed:\n{}",
            failures.len(),
            failures.join("\n")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{CommandError, MockRuntime};
    use crate::test_utils::{commands, delegate_fs_to_real, record_runs, test_cachedir};
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    fn py(s: &str) -> PythonVersion {
        s.parse().unwrap()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn manifest(json: &str) -> Manifest {
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        manifest.validate().unwrap();
        manifest
    }

    #[test]
    fn test_plan_lists_builtin_packages_in_order() {
        let runtime = MockRuntime::new();
        let mut pipeline =
            Pipeline::new(&runtime, &Manifest::builtin(), test_cachedir(), None).unwrap();
        pipeline.set_tag("btax", "0.2.2").unwrap();

        let plan = pipeline.plan();
        let order: Vec<&str> = plan.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(order, vec!["taxcalc", "btax", "ogusa"]);
        assert_eq!(plan[0].checkout, test_cachedir().join("pull").join("taxcalc"));
        assert_eq!(plan[1].tag.as_deref(), Some("0.2.2"));
        assert_eq!(plan[1].dependencies, vec!["taxcalc"]);
        assert_eq!(plan[2].versions, vec![py("2.7"), py("3.5"), py("3.6")]);

        let text = plan[1].to_string();
        assert!(text.starts_with("btax https://github.com/open-source-economics/B-Tax (master)"));
        assert!(text.contains("python: 2.7, 3.5, 3.6"));
        assert!(text.contains("depends on: taxcalc"));
    }

    #[test]
    fn test_select_keeps_release_order() {
        let runtime = MockRuntime::new();
        let pipeline = Pipeline::new(
            &runtime,
            &manifest(
                r#"{"packages": [
                    {"name": "app", "url": "u", "python": ["3.6"], "dependencies": ["base"]},
                    {"name": "base", "url": "u", "python": ["3.6"]}
                ]}"#,
            ),
            test_cachedir(),
            None,
        )
        .unwrap();

        assert_eq!(pipeline.select(&[]).unwrap(), vec![0, 1]);
        assert_eq!(pipeline.select(&names(&["app", "base", "app"])).unwrap(), vec![0, 1]);
        assert_eq!(pipeline.plan()[0].name, "base");
    }

    #[test]
    fn test_unknown_package_names_are_errors() {
        let runtime = MockRuntime::new();
        let mut pipeline =
            Pipeline::new(&runtime, &Manifest::builtin(), test_cachedir(), None).unwrap();

        let err = pipeline.select(&names(&["taxbrain"])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unknown package taxbrain (known: taxcalc, btax, ogusa)"
        );
        assert!(pipeline.set_tag("taxbrain", "1.0").is_err());
    }

    #[test]
    fn test_requested_versions_default_to_union() {
        let runtime = MockRuntime::new();
        let pipeline = Pipeline::new(
            &runtime,
            &manifest(
                r#"{"packages": [
                    {"name": "a", "url": "u", "python": ["3.6", "2.7"]},
                    {"name": "b", "url": "u", "python": ["3.10", "3.6"]}
                ]}"#,
            ),
            test_cachedir(),
            None,
        )
        .unwrap();

        let all = pipeline.requested_versions(&[0, 1], &[]);
        assert_eq!(all, vec![py("2.7"), py("3.6"), py("3.10")]);
        assert_eq!(pipeline.requested_versions(&[0], &[py("3.5")]), vec![py("3.5")]);
    }

    #[test]
    fn test_pins_resolve_dependency_tags_once() {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_capture()
            .withf(|cmd| {
                cmd.to_string() == "git tag"
                    && cmd
                        .cwd()
                        .is_some_and(|p| p.ends_with("taxcalc"))
            })
            .times(1)
            .returning(|_| Ok("0.12.0\n0.13.0\n".to_string()));

        let mut pipeline =
            Pipeline::new(&runtime, &Manifest::builtin(), test_cachedir(), None).unwrap();

        assert!(pipeline.pins_for("taxcalc").unwrap().is_empty());
        assert_eq!(
            pipeline.pins_for("btax").unwrap(),
            vec![Pin::new("taxcalc", "0.13.0")]
        );
        assert_eq!(
            pipeline.pins_for("ogusa").unwrap(),
            vec![Pin::new("taxcalc", "0.13.0")]
        );
    }

    #[test]
    fn test_pull_selected_packages_in_dependency_order() {
        let mut runtime = MockRuntime::new();
        runtime.expect_exists().returning(|_| false);
        runtime.expect_create_dir_all().returning(|_| Ok(()));
        let log = record_runs(&mut runtime);

        let mut pipeline =
            Pipeline::new(&runtime, &Manifest::builtin(), test_cachedir(), None).unwrap();
        pipeline.set_tag("taxcalc", "0.13.0").unwrap();
        pipeline.set_tag("ogusa", "0.5.8").unwrap();
        pipeline.pull(&names(&["ogusa", "taxcalc"])).unwrap();

        let clones: Vec<String> = commands(&log)
            .into_iter()
            .filter(|c| c.starts_with("git clone"))
            .collect();
        assert_eq!(clones.len(), 2);
        assert!(clones[0].contains("Tax-Calculator"));
        assert!(clones[1].contains("OG-USA"));
    }

    fn failing_upload_runtime(fail_on: &'static str) -> (MockRuntime, Arc<Mutex<usize>>) {
        let mut runtime = MockRuntime::new();
        runtime.expect_exists().returning(|_| true);
        let uploads = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&uploads);
        runtime.expect_run().returning(move |cmd| {
            *counter.lock().unwrap() += 1;
            if cmd.to_string().contains(fail_on) {
                Err(CommandError {
                    command: cmd.to_string(),
                    status: Some(1),
                    stderr: "401 Unauthorized".into(),
                }
                .into())
            } else {
                Ok(())
            }
        });
        (runtime, uploads)
    }

    #[test_log::test]
    fn test_upload_reports_failures_after_every_package() {
        let (runtime, uploads) = failing_upload_runtime("linux-64/btax-");
        let mut pipeline = Pipeline::new(
            &runtime,
            &Manifest::builtin(),
            test_cachedir(),
            Some(PathBuf::from("/bld")),
        )
        .unwrap();
        for (name, tag) in [("taxcalc", "0.13.0"), ("btax", "0.2.2"), ("ogusa", "0.5.8")] {
            pipeline.set_tag(name, tag).unwrap();
        }

        let err = pipeline
            .upload(&[], &UploadOptions::default(), &[py("3.6")])
            .unwrap_err();

        // 3 packages x 4 platforms, none skipped
        assert_eq!(*uploads.lock().unwrap(), 12);
        let msg = err.to_string();
        assert!(msg.starts_with("1 upload(s) failed:"));
        assert!(msg.contains("btax-0.2.2-py36_0.tar.bz2"));
        assert!(msg.contains("401 Unauthorized"));
    }

    #[test]
    fn test_upload_succeeds_with_duplicates() {
        let mut runtime = MockRuntime::new();
        runtime.expect_exists().returning(|_| true);
        runtime.expect_run().returning(|cmd| {
            Err(CommandError {
                command: cmd.to_string(),
                status: Some(1),
                stderr: "Distribution already exists".into(),
            }
            .into())
        });
        let mut pipeline = Pipeline::new(
            &runtime,
            &Manifest::builtin(),
            test_cachedir(),
            Some(PathBuf::from("/bld")),
        )
        .unwrap();
        pipeline.set_tag("taxcalc", "0.13.0").unwrap();

        let reports = pipeline
            .upload(&names(&["taxcalc"]), &UploadOptions::default(), &[])
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcomes.len(), 12);
    }

    #[test]
    fn test_release_without_upload_never_calls_anaconda() {
        let mut runtime = MockRuntime::new();
        runtime.expect_exists().returning(|_| false);
        runtime.expect_create_dir_all().returning(|_| Ok(()));
        runtime
            .expect_open()
            .returning(|p| Err(anyhow::anyhow!("no archive at {:?}", p)));
        let log = record_runs(&mut runtime);

        let mut pipeline =
            Pipeline::new(&runtime, &Manifest::builtin(), test_cachedir(), None).unwrap();
        pipeline.set_tag("taxcalc", "0.13.0").unwrap();

        // The mocked git never produces an archive, so the build step fails
        let err = pipeline
            .release(&names(&["taxcalc"]), "ospc", &[], None)
            .unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to extract"));
        assert!(commands(&log).iter().all(|c| !c.starts_with("anaconda")));
        assert!(commands(&log).iter().any(|c| c.starts_with("git archive")));
    }

    #[test_log::test]
    fn test_release_reports_earlier_upload_failures_when_a_later_build_fails() {
        let dir = tempdir().unwrap();
        let cachedir = dir.path().join("cache");
        let bld = dir.path().join("bld");

        // Snapshot for "core" only; "app" has nothing to extract
        let build_dir = cachedir.join("build");
        std::fs::create_dir_all(&build_dir).unwrap();
        let file = std::fs::File::create(build_dir.join("core-1.0.tar")).unwrap();
        let mut tar = tar::Builder::new(file);
        let meta = "package:\n  version: 0.1\n";
        let mut header = tar::Header::new_gnu();
        header.set_path("core-1.0/conda.recipe/meta.yaml").unwrap();
        header.set_size(meta.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append(&header, meta.as_bytes()).unwrap();
        tar.finish().unwrap();

        let artifact = bld.join("linux-64").join("core-1.0-py36_0.tar.bz2");
        std::fs::create_dir_all(artifact.parent().unwrap()).unwrap();
        std::fs::write(&artifact, b"").unwrap();

        let mut runtime = MockRuntime::new();
        delegate_fs_to_real(&mut runtime);
        let output = format!("{}\n", artifact.display());
        runtime.expect_capture().returning(move |cmd| {
            let rendered = cmd.to_string();
            if rendered == "conda build -V" {
                Ok("conda-build 3.0.1\n".to_string())
            } else if rendered.ends_with("--output") {
                Ok(output.clone())
            } else {
                panic!("unexpected capture {}", rendered)
            }
        });
        runtime.expect_run().returning(|cmd| {
            if cmd.program() == "anaconda" {
                Err(CommandError {
                    command: cmd.to_string(),
                    status: Some(1),
                    stderr: "401 Unauthorized".into(),
                }
                .into())
            } else {
                Ok(())
            }
        });

        let mut pipeline = Pipeline::new(
            &runtime,
            &manifest(
                r#"{"platforms": ["linux-64"], "packages": [
                    {"name": "core", "url": "u", "python": ["3.6"]},
                    {"name": "app", "url": "u", "python": ["3.6"], "dependencies": ["core"]}
                ]}"#,
            ),
            &cachedir,
            Some(bld),
        )
        .unwrap();
        pipeline.set_tag("core", "1.0").unwrap();
        pipeline.set_tag("app", "2.0").unwrap();

        let err = pipeline
            .release(&[], "ospc", &[], Some(&UploadOptions::default()))
            .unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.starts_with("1 upload(s) failed:"));
        assert!(msg.contains("401 Unauthorized"));
        assert!(msg.contains("Failed to extract"));
    }

    #[test]
    fn test_clean_removes_cachedir() {
        let dir = tempdir().unwrap();
        let cachedir = dir.path().join("cache");
        std::fs::create_dir_all(cachedir.join("pull/taxcalc")).unwrap();

        let mut runtime = MockRuntime::new();
        delegate_fs_to_real(&mut runtime);
        let pipeline = Pipeline::new(&runtime, &Manifest::builtin(), &cachedir, None).unwrap();

        pipeline.clean().unwrap();
        assert!(!cachedir.exists());
        // Cleaning twice is fine
        pipeline.clean().unwrap();
    }
}
