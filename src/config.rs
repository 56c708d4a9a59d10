//! Package manifest and cache directory configuration.

use anyhow::{Context, Result, bail};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::package::{DEFAULT_PLATFORMS, PythonVersion};
use crate::repository::DEFAULT_BRANCH;
use crate::runtime::Runtime;

/// Directory name used under the user cache directory.
const CACHE_DIR_NAME: &str = "conda-release";

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

/// One package of the release set.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PackageSpec {
    pub name: String,
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Python versions the package can be built against
    #[serde(alias = "supported_versions")]
    pub python: Vec<PythonVersion>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// The set of packages released together, and the platforms they ship for.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platforms: Option<Vec<String>>,
    pub packages: Vec<PackageSpec>,
}

impl Manifest {
    /// The Policy Brain model packages.
    pub fn builtin() -> Self {
        let versions = || {
            ["2.7", "3.5", "3.6"]
                .iter()
                .filter_map(|v| v.parse().ok())
                .collect::<Vec<PythonVersion>>()
        };
        let spec = |name: &str, repo: &str, deps: &[&str]| PackageSpec {
            name: name.to_string(),
            url: format!("https://github.com/open-source-economics/{}", repo),
            branch: default_branch(),
            python: versions(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        };

        Manifest {
            platforms: None,
            packages: vec![
                spec("taxcalc", "Tax-Calculator", &[]),
                spec("btax", "B-Tax", &["taxcalc"]),
                spec("ogusa", "OG-USA", &["taxcalc"]),
            ],
        }
    }

    #[tracing::instrument(skip(runtime))]
    pub fn load<R: Runtime>(runtime: &R, path: &Path) -> Result<Self> {
        let content = runtime
            .read_to_string(path)
            .with_context(|| format!("Failed to read manifest {:?}", path))?;
        let manifest: Manifest = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest {:?}", path))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load `path` if given, otherwise use the built-in package set.
    pub fn load_or_builtin<R: Runtime>(runtime: &R, path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(runtime, path),
            None => {
                debug!("No manifest given, using the built-in package set");
                Ok(Self::builtin())
            }
        }
    }

    pub fn platforms(&self) -> Vec<String> {
        match &self.platforms {
            Some(platforms) => platforms.clone(),
            None => DEFAULT_PLATFORMS.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.packages.is_empty() {
            bail!("Manifest declares no packages");
        }
        if let Some(platforms) = &self.platforms
            && platforms.is_empty()
        {
            bail!("Manifest declares an empty platform list");
        }

        let mut names = HashSet::new();
        for pkg in &self.packages {
            if pkg.name.trim().is_empty() {
                bail!("Package with url {} has an empty name", pkg.url);
            }
            if !names.insert(pkg.name.as_str()) {
                bail!("Package {} is declared more than once", pkg.name);
            }
            if pkg.python.is_empty() {
                bail!("Package {} supports no Python versions", pkg.name);
            }
        }
        for pkg in &self.packages {
            for dep in &pkg.dependencies {
                if !names.contains(dep.as_str()) {
                    bail!("Package {} depends on unknown package {}", pkg.name, dep);
                }
            }
        }
        self.release_order().map(|_| ())
    }

    /// Packages with every dependency ahead of its dependants; otherwise in
    /// declaration order.
    pub fn release_order(&self) -> Result<Vec<&PackageSpec>> {
        let by_name: HashMap<&str, &PackageSpec> = self
            .packages
            .iter()
            .map(|p| (p.name.as_str(), p))
            .collect();

        let mut ordered = Vec::with_capacity(self.packages.len());
        let mut done = HashSet::new();
        let mut visiting = Vec::new();
        for pkg in &self.packages {
            visit(pkg, &by_name, &mut done, &mut visiting, &mut ordered)?;
        }
        Ok(ordered)
    }
}

fn visit<'m>(
    pkg: &'m PackageSpec,
    by_name: &HashMap<&str, &'m PackageSpec>,
    done: &mut HashSet<&'m str>,
    visiting: &mut Vec<&'m str>,
    ordered: &mut Vec<&'m PackageSpec>,
) -> Result<()> {
    if done.contains(pkg.name.as_str()) {
        return Ok(());
    }
    if visiting.contains(&pkg.name.as_str()) {
        visiting.push(&pkg.name);
        bail!("Dependency cycle: {}", visiting.join(" -> "));
    }

    visiting.push(&pkg.name);
    for dep in &pkg.dependencies {
        let dep_spec = by_name
            .get(dep.as_str())
            .with_context(|| format!("Package {} depends on unknown package {}", pkg.name, dep))?;
        visit(dep_spec, by_name, done, visiting, ordered)?;
    }
    visiting.pop();

    done.insert(&pkg.name);
    ordered.push(pkg);
    Ok(())
}

/// The cache root: `explicit` made absolute, or a per-user cache directory.
#[tracing::instrument(skip(runtime))]
pub fn resolve_cachedir<R: Runtime>(runtime: &R, explicit: Option<PathBuf>) -> Result<PathBuf> {
    let dir = match explicit {
        Some(dir) => dir,
        None => match runtime.cache_dir() {
            Some(cache) => cache.join(CACHE_DIR_NAME),
            None => runtime
                .home_dir()
                .context("Could not find a cache or home directory")?
                .join(format!(".{}", CACHE_DIR_NAME)),
        },
    };

    if dir.is_absolute() {
        Ok(dir)
    } else {
        Ok(runtime.current_dir()?.join(dir))
    }
}
