//! `anaconda upload` invocation and per-artifact outcome tracking.

use log::info;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::runtime::{CommandError, CommandLine};

/// Settings shared by every upload in a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadOptions {
    pub token: Option<String>,
    pub label: Option<String>,
    pub user: Option<String>,
    pub force: bool,
}

impl UploadOptions {
    /// `anaconda [--token T] upload -t conda --no-progress [--force]
    /// [--label L] [--user U] <artifact>`
    pub fn command(&self, artifact: &Path) -> CommandLine {
        let mut cmd = CommandLine::new("anaconda");
        if let Some(token) = &self.token {
            cmd = cmd.arg("--token").secret_arg(token.as_str());
        }
        cmd = cmd.args(["upload", "-t", "conda", "--no-progress"]);
        if self.force {
            cmd = cmd.arg("--force");
        }
        if let Some(label) = &self.label {
            cmd = cmd.args(["--label", label.as_str()]);
        }
        if let Some(user) = &self.user {
            cmd = cmd.args(["--user", user.as_str()]);
        }
        cmd.arg(artifact.to_string_lossy())
    }

    pub fn log_config(&self) {
        if self.token.is_some() {
            info!("config for anaconda upload: token was provided");
        } else {
            info!("config for anaconda upload: token was not provided");
        }
        if self.force {
            info!("config for anaconda upload: force is enabled");
        } else {
            info!("config for anaconda upload: force is disabled");
        }
        info!("config for anaconda upload: label={:?}", self.label);
        info!("config for anaconda upload: user={:?}", self.user);
    }
}

/// File name conda-build gives a package: `<name>-<version>-py<NN>_0.tar.bz2`.
pub fn artifact_name(name: &str, version: &str, python_compact: &str) -> String {
    format!("{}-{}-py{}_0.tar.bz2", name, version, python_compact)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStatus {
    Uploaded,
    /// The service already has this version
    AlreadyExists,
    /// Nothing was built for this platform/version
    Missing,
    /// Any other rejection (authentication, network, ...)
    Failed(String),
}

impl UploadStatus {
    /// Classify a failed upload. Only conflicts with an existing upload are
    /// expected; everything else is a real failure.
    pub fn from_error(err: &anyhow::Error) -> Self {
        if let Some(cmd_err) = err.downcast_ref::<CommandError>() {
            let stderr = cmd_err.stderr.to_lowercase();
            if stderr.contains("already exists") || stderr.contains("conflict") {
                return UploadStatus::AlreadyExists;
            }
        }
        UploadStatus::Failed(format!("{:#}", err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactOutcome {
    pub artifact: PathBuf,
    pub status: UploadStatus,
}

/// What happened to every artifact of one package's upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub package: String,
    pub outcomes: Vec<ArtifactOutcome>,
}

impl UploadReport {
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            outcomes: Vec::new(),
        }
    }

    pub fn record(&mut self, artifact: PathBuf, status: UploadStatus) {
        self.outcomes.push(ArtifactOutcome { artifact, status });
    }

    pub fn count(&self, status: &UploadStatus) -> usize {
        self.outcomes.iter().filter(|o| &o.status == status).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ArtifactOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, UploadStatus::Failed(_)))
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }
}

impl fmt::Display for UploadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} uploaded, {} already present, {} missing, {} failed",
            self.package,
            self.count(&UploadStatus::Uploaded),
            self.count(&UploadStatus::AlreadyExists),
            self.count(&UploadStatus::Missing),
            self.failures().count()
        )
    }
}
