//! Conda recipe discovery and `meta.yaml` rewriting.
//!
//! The recipe file is treated as text: fields are replaced with line regexes
//! rather than parsed, since recipes carry Jinja and selectors a YAML parser
//! would not accept.

use anyhow::{Context, Result, bail};
use log::debug;
use regex::{NoExpand, Regex};
use std::path::{Path, PathBuf};

use crate::runtime::Runtime;

use super::version::version_from_tag;

/// Recipe directories tried in order, relative to the source tree root.
pub const RECIPE_CANDIDATES: &[&str] = &["conda.recipe", "Python/conda.recipe"];

pub const META_FILE: &str = "meta.yaml";

/// A dependency's resolved release, written as a lower bound pin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pin {
    pub name: String,
    pub tag: String,
}

impl Pin {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }

    /// The requirement line, e.g. `- taxcalc >=0.13.0`.
    pub fn requirement(&self) -> String {
        format!("- {} >={}", self.name, version_from_tag(&self.tag))
    }
}

/// First recipe candidate that exists under `source_dir`, relative to it.
pub fn find_recipe_dir<R: Runtime>(runtime: &R, source_dir: &Path) -> Result<PathBuf> {
    for candidate in RECIPE_CANDIDATES {
        let path = source_dir.join(candidate);
        if runtime.is_dir(&path) {
            debug!("Using recipe directory {:?}", path);
            return Ok(PathBuf::from(candidate));
        }
    }
    bail!(
        "No conda recipe found in {}: tried {}",
        source_dir.display(),
        RECIPE_CANDIDATES.join(", ")
    )
}

/// Set the version field to `version` and turn every pin line of the given
/// dependencies into a lower bound on their release.
pub fn rewrite_meta(content: &str, version: &str, pins: &[Pin]) -> Result<String> {
    let version_re = Regex::new(r"version: .*").context("Invalid version pattern")?;
    let mut out = version_re
        .replace_all(content, NoExpand(&format!("version: {}", version)))
        .into_owned();

    for pin in pins {
        let pattern = format!(r"- {}.*", regex::escape(&pin.name));
        let pin_re = Regex::new(&pattern)
            .with_context(|| format!("Invalid pin pattern for {}", pin.name))?;
        out = pin_re
            .replace_all(&out, NoExpand(&pin.requirement()))
            .into_owned();
    }
    Ok(out)
}

/// Rewrite the recipe's `meta.yaml` in place.
#[tracing::instrument(skip(runtime, pins))]
pub fn update_meta_file<R: Runtime>(
    runtime: &R,
    recipe_dir: &Path,
    version: &str,
    pins: &[Pin],
) -> Result<()> {
    let meta_path = recipe_dir.join(META_FILE);
    let content = runtime
        .read_to_string(&meta_path)
        .with_context(|| format!("Failed to read recipe metadata {:?}", meta_path))?;
    let updated = rewrite_meta(&content, version, pins)?;
    runtime
        .write(&meta_path, updated.as_bytes())
        .with_context(|| format!("Failed to update recipe metadata {:?}", meta_path))
}
