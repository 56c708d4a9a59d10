//! `conda build` / `conda convert` invocation.

use anyhow::{Context, Result, anyhow};
use log::{debug, info};
use std::cell::OnceCell;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use crate::runtime::{CommandLine, Runtime};

use super::version::PythonVersion;

/// Platforms every package is converted to and uploaded for.
pub const DEFAULT_PLATFORMS: &[&str] = &["osx-64", "linux-64", "win-32", "win-64"];

/// conda-build 3 changed the default build string; this keeps `py36_0`.
const OLD_BUILD_STRING: &str = "--old-build-string";

pub struct Conda<'a, R: Runtime> {
    runtime: &'a R,
    platforms: Vec<String>,
    build_root: Option<PathBuf>,
    build_args: OnceCell<Vec<String>>,
}

impl<'a, R: Runtime> Conda<'a, R> {
    pub fn new(runtime: &'a R) -> Self {
        Self {
            runtime,
            platforms: DEFAULT_PLATFORMS.iter().map(|p| p.to_string()).collect(),
            build_root: None,
            build_args: OnceCell::new(),
        }
    }

    pub fn with_platforms(mut self, platforms: Vec<String>) -> Self {
        self.platforms = platforms;
        self
    }

    /// Use `root` as the `conda-bld` directory instead of locating it.
    pub fn with_build_root(mut self, root: Option<PathBuf>) -> Self {
        self.build_root = root;
        self
    }

    pub fn platforms(&self) -> &[String] {
        &self.platforms
    }

    /// Arguments that start every `conda build` call. Detected once.
    fn build_args(&self) -> Result<&[String]> {
        if let Some(args) = self.build_args.get() {
            return Ok(args);
        }

        let output = self
            .runtime
            .capture(&CommandLine::new("conda").args(["build", "-V"]))
            .context("Failed to query the conda-build version")?;
        let major = conda_build_major_version(&output)?;
        debug!("Detected conda-build major version {}", major);

        let mut args = vec!["build".to_string()];
        if major >= 3 {
            args.push(OLD_BUILD_STRING.to_string());
        }
        Ok(self.build_args.get_or_init(|| args))
    }

    fn conda_build(&self, source_dir: &Path) -> Result<CommandLine> {
        Ok(CommandLine::new("conda")
            .args(self.build_args()?.iter().cloned())
            .current_dir(source_dir))
    }

    /// Build `recipe` (relative to `source_dir`) for one Python version.
    pub fn build(
        &self,
        source_dir: &Path,
        recipe: &Path,
        channel: &str,
        python: &PythonVersion,
    ) -> Result<()> {
        let cmd = self
            .conda_build(source_dir)?
            .args(["-c", channel, "--no-anaconda-upload", "--python", python.as_str()])
            .arg(recipe.to_string_lossy());
        self.runtime.run(&cmd)
    }

    /// Path of the package `build` produces for `recipe` and `python`.
    pub fn output_path(
        &self,
        source_dir: &Path,
        recipe: &Path,
        python: &PythonVersion,
    ) -> Result<PathBuf> {
        let cmd = self
            .conda_build(source_dir)?
            .args(["--python", python.as_str()])
            .arg(recipe.to_string_lossy())
            .arg("--output");
        let output = self.runtime.capture(&cmd)?;
        output
            .split_whitespace()
            .last()
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("`{}` printed no output path", cmd))
    }

    /// Convert a built package to every other platform. Converted packages
    /// land in sibling platform directories.
    pub fn convert(
        &self,
        artifact: &Path,
        mut on_platform: impl FnMut(&str),
    ) -> Result<()> {
        let build_dir = artifact
            .parent()
            .with_context(|| format!("Built package {:?} has no parent directory", artifact))?;
        let current_platform = file_name(build_dir)?;
        let package = file_name(artifact)?;

        for platform in &self.platforms {
            if *platform == current_platform {
                continue;
            }
            on_platform(platform);
            let cmd = CommandLine::new("conda")
                .args(["convert", "--platform", platform.as_str(), package.as_str()])
                .args(["-o", "../"])
                .current_dir(build_dir);
            self.runtime.run(&cmd)?;
        }
        Ok(())
    }

    /// The `conda-bld` directory of the conda installation on `PATH`.
    pub fn build_root(&self) -> Result<PathBuf> {
        if let Some(root) = &self.build_root {
            return Ok(root.clone());
        }

        let conda = match self.runtime.env_var("CONDA_EXE") {
            Ok(exe) if !exe.trim().is_empty() => exe,
            _ => self
                .runtime
                .capture(&CommandLine::new("which").arg("conda"))
                .context("Failed to locate conda")?,
        };
        let root = build_root_for(Path::new(conda.trim()))?;
        info!("Using conda build directory {}", root.display());
        Ok(root)
    }
}

/// `conda-build 3.10.5` -> 3
fn conda_build_major_version(output: &str) -> Result<u32> {
    let last = output
        .split_whitespace()
        .last()
        .ok_or_else(|| anyhow!("Empty conda-build version output"))?;
    last.split('.')
        .next()
        .unwrap_or_default()
        .parse::<u32>()
        .with_context(|| format!("Unrecognized conda-build version '{}'", output.trim()))
}

/// `<prefix>/bin/conda` -> `<prefix>/conda-bld`, stepping out of
/// `<prefix>/envs/<env>` when conda runs from an environment.
fn build_root_for(conda: &Path) -> Result<PathBuf> {
    let mut prefix = conda
        .parent()
        .and_then(Path::parent)
        .with_context(|| format!("Unexpected conda location {:?}", conda))?;

    if prefix
        .components()
        .any(|c| c == Component::Normal(OsStr::new("envs")))
    {
        prefix = prefix
            .parent()
            .and_then(Path::parent)
            .with_context(|| format!("Unexpected conda environment location {:?}", prefix))?;
    }
    Ok(prefix.join("conda-bld"))
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("{:?} has no file name", path))
}
