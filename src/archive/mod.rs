//! Source snapshot extraction.
//!
//! `git archive` produces a plain tarball whose entries all live under a
//! single `<name>-<tag>/` prefix. Extracting it into the build cache yields
//! the tree the recipe is built from.

use anyhow::{Context, Result, bail};
use log::{debug, info};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};

use crate::runtime::Runtime;

/// Extractor for uncompressed `.tar` archives
pub struct TarExtractor;

impl TarExtractor {
    pub fn can_handle(&self, archive_path: &Path) -> bool {
        let name = archive_path.to_string_lossy().to_lowercase();
        name.ends_with(".tar")
    }

    /// Unpack `archive_path` into `extract_to`, keeping the paths stored in
    /// the archive.
    #[tracing::instrument(skip(self, runtime))]
    pub fn extract<R: Runtime>(
        &self,
        runtime: &R,
        archive_path: &Path,
        extract_to: &Path,
    ) -> Result<()> {
        if !self.can_handle(archive_path) {
            bail!("Unsupported archive format: {}", archive_path.display());
        }

        debug!("Extracting {:?} to {:?}...", archive_path, extract_to);
        let file = runtime
            .open(archive_path)
            .with_context(|| format!("Failed to open archive at {:?}", archive_path))?;
        runtime.create_dir_all(extract_to)?;

        let mut archive = Archive::new(file);
        let entries = archive
            .entries()
            .with_context(|| format!("Failed to read archive {:?}", archive_path))?;

        for entry in entries {
            let mut entry = entry.context("Failed to read tar entry")?;
            let entry_path = entry.path().context("Invalid tar entry path")?.into_owned();

            let relative = match enclosed_path(&entry_path) {
                Some(path) => path,
                None => {
                    debug!("Skipping entry with unsafe path {:?}", entry_path);
                    continue;
                }
            };
            let full_path = extract_to.join(&relative);

            match entry.header().entry_type() {
                EntryType::Directory => {
                    runtime.create_dir_all(&full_path)?;
                }
                EntryType::Regular | EntryType::Continuous => {
                    if let Some(parent) = full_path.parent() {
                        runtime.create_dir_all(parent)?;
                    }
                    let mut dest_file = runtime.create_file(&full_path)?;
                    std::io::copy(&mut entry, &mut dest_file)
                        .with_context(|| format!("Failed to extract file {:?}", full_path))?;
                    drop(dest_file);

                    #[cfg(unix)]
                    if let Ok(mode) = entry.header().mode()
                        && let Err(e) = runtime.set_permissions(&full_path, mode)
                    {
                        debug!("Failed to set permissions on {:?}: {}", full_path, e);
                    }
                }
                EntryType::Symlink => {
                    let target = entry
                        .link_name()
                        .context("Invalid symlink target")?
                        .context("Symlink entry without a target")?
                        .into_owned();
                    if let Some(parent) = full_path.parent() {
                        runtime.create_dir_all(parent)?;
                    }
                    runtime.symlink(&target, &full_path)?;
                }
                other => {
                    // git archive writes a pax global header carrying the commit id
                    debug!("Skipping {:?} entry {:?}", other, entry_path);
                }
            }
        }

        info!("Extraction complete.");
        Ok(())
    }
}

/// Path of an archive entry relative to the extraction root, or `None` if it
/// would escape it.
fn enclosed_path(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RealRuntime;
    use std::fs::{self, File};
    use tar::Builder;
    use tempfile::tempdir;

    fn create_test_archive(path: &Path, files: &[(&str, &str)]) -> Result<()> {
        let file = File::create(path)?;
        let mut tar = Builder::new(file);

        let mut dir_header = tar::Header::new_gnu();
        dir_header.set_entry_type(EntryType::Directory);
        dir_header.set_path("taxcalc-0.13.0/")?;
        dir_header.set_size(0);
        dir_header.set_mode(0o755);
        dir_header.set_cksum();
        tar.append(&dir_header, std::io::empty())?;

        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_path(name)?;
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append(&header, content.as_bytes())?;
        }

        tar.finish()?;
        Ok(())
    }

    #[test]
    fn test_can_handle_tar() {
        let extractor = TarExtractor;
        assert!(extractor.can_handle(Path::new("taxcalc-0.13.0.tar")));
        assert!(extractor.can_handle(Path::new("TAXCALC.TAR")));
        assert!(!extractor.can_handle(Path::new("file.zip")));
        assert!(!extractor.can_handle(Path::new("file.tar.bz2")));
    }

    #[test]
    fn test_extract_keeps_prefix_directory() -> Result<()> {
        let dir = tempdir()?;
        let archive_path = dir.path().join("taxcalc-0.13.0.tar");
        let extract_path = dir.path().join("build");

        create_test_archive(
            &archive_path,
            &[
                ("taxcalc-0.13.0/conda.recipe/meta.yaml", "version: 0.1\n"),
                ("taxcalc-0.13.0/setup.py", "print('hi')\n"),
            ],
        )?;

        TarExtractor.extract(&RealRuntime, &archive_path, &extract_path)?;

        let meta = extract_path.join("taxcalc-0.13.0/conda.recipe/meta.yaml");
        assert_eq!(fs::read_to_string(meta)?, "version: 0.1\n");
        assert!(extract_path.join("taxcalc-0.13.0/setup.py").exists());
        Ok(())
    }

    #[test]
    fn test_extract_overwrites_previous_extraction() -> Result<()> {
        let dir = tempdir()?;
        let archive_path = dir.path().join("taxcalc-0.13.0.tar");
        let extract_path = dir.path().join("build");
        create_test_archive(
            &archive_path,
            &[("taxcalc-0.13.0/conda.recipe/meta.yaml", "version: 0.1\n")],
        )?;

        let meta = extract_path.join("taxcalc-0.13.0/conda.recipe/meta.yaml");
        fs::create_dir_all(meta.parent().unwrap())?;
        fs::write(&meta, "version: 0.13.0\n")?;

        TarExtractor.extract(&RealRuntime, &archive_path, &extract_path)?;
        assert_eq!(fs::read_to_string(meta)?, "version: 0.1\n");
        Ok(())
    }

    #[test]
    fn test_extract_unsupported_format() {
        let result = TarExtractor.extract(
            &RealRuntime,
            Path::new("/tmp/file.unknown"),
            Path::new("/tmp/out"),
        );
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Unsupported archive format")
        );
    }

    #[test]
    fn test_extract_missing_archive() {
        let dir = tempdir().unwrap();
        let result = TarExtractor.extract(
            &RealRuntime,
            &dir.path().join("missing.tar"),
            &dir.path().join("out"),
        );
        assert!(result.unwrap_err().to_string().contains("Failed to open archive"));
    }

    #[test]
    fn test_enclosed_path() {
        assert_eq!(
            enclosed_path(Path::new("./a/b")),
            Some(PathBuf::from("a/b"))
        );
        assert_eq!(enclosed_path(Path::new("../etc/passwd")), None);
        assert_eq!(enclosed_path(Path::new("/etc/passwd")), None);
        assert_eq!(enclosed_path(Path::new(".")), None);
    }
}
