use anyhow::{Context, Result};
use clap::Parser;
use conda_release::config::{Manifest, resolve_cachedir};
use conda_release::package::{PythonVersion, UploadOptions};
use conda_release::pipeline::Pipeline;
use conda_release::runtime::{RealRuntime, Runtime};
use std::path::PathBuf;

/// conda-release - build and publish conda packages from git release tags
///
/// Pulls each package's repository, builds its conda recipe at the latest
/// release tag for every supported Python version, converts the builds to
/// the other platforms and uploads them to Anaconda Cloud. Packages are
/// processed with their dependencies first.
///
/// Examples:
///   conda-release plan
///   conda-release release --channel ospc --python 3.6
///   conda-release build btax --channel ospc --tag taxcalc=0.13.0
#[derive(Parser, Debug)]
#[command(author, version = env!("CONDA_RELEASE_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Package manifest (JSON); the built-in package set is used otherwise
    #[arg(
        long = "config",
        short = 'c',
        env = "CONDA_RELEASE_CONFIG",
        value_name = "FILE",
        global = true
    )]
    pub config: Option<PathBuf>,

    /// Cache directory for checkouts and source snapshots
    #[arg(
        long = "cachedir",
        env = "CONDA_RELEASE_CACHEDIR",
        value_name = "DIR",
        global = true
    )]
    pub cachedir: Option<PathBuf>,

    /// conda-bld directory holding built packages (located from conda otherwise)
    #[arg(long = "conda-bld", value_name = "DIR", global = true)]
    pub conda_bld: Option<PathBuf>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Show the packages in release order
    Plan,

    /// Refresh checkouts and snapshot the release tags
    Pull(PullArgs),

    /// Build the snapshots with conda-build
    Build(BuildArgs),

    /// Upload built packages to Anaconda Cloud
    Upload(UploadArgs),

    /// Pull, build and upload each package in turn
    Release(ReleaseArgs),

    /// Remove the cache directory
    Clean,
}

#[derive(clap::Args, Debug)]
pub struct SelectArgs {
    /// Packages to process (all when omitted)
    #[arg(value_name = "PACKAGE")]
    pub packages: Vec<String>,

    /// Use TAG instead of the latest tag of NAME
    #[arg(long = "tag", value_name = "NAME=TAG", value_parser = parse_tag_override)]
    pub tags: Vec<(String, String)>,
}

#[derive(clap::Args, Debug)]
pub struct BuildOptions {
    /// Channel to resolve build dependencies from
    #[arg(long, value_name = "CHANNEL")]
    pub channel: String,

    /// Python versions to build, repeated or comma separated (default: all supported)
    #[arg(long = "python", value_name = "VERSION", value_delimiter = ',')]
    pub python: Vec<PythonVersion>,
}

#[derive(clap::Args, Debug)]
pub struct UploadFlags {
    /// Anaconda Cloud token
    #[arg(long, env = "ANACONDA_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Label to upload under
    #[arg(long)]
    pub label: Option<String>,

    /// User or organization to upload to
    #[arg(long)]
    pub user: Option<String>,

    /// Replace packages that already exist
    #[arg(long)]
    pub force: bool,
}

impl From<UploadFlags> for UploadOptions {
    fn from(flags: UploadFlags) -> Self {
        UploadOptions {
            token: flags.token,
            label: flags.label,
            user: flags.user,
            force: flags.force,
        }
    }
}

#[derive(clap::Args, Debug)]
pub struct PullArgs {
    #[command(flatten)]
    pub select: SelectArgs,
}

#[derive(clap::Args, Debug)]
pub struct BuildArgs {
    #[command(flatten)]
    pub select: SelectArgs,

    #[command(flatten)]
    pub build: BuildOptions,
}

#[derive(clap::Args, Debug)]
pub struct UploadArgs {
    #[command(flatten)]
    pub select: SelectArgs,

    /// Python versions to upload, repeated or comma separated (default: all supported)
    #[arg(long = "python", value_name = "VERSION", value_delimiter = ',')]
    pub python: Vec<PythonVersion>,

    #[command(flatten)]
    pub upload: UploadFlags,
}

#[derive(clap::Args, Debug)]
pub struct ReleaseArgs {
    #[command(flatten)]
    pub select: SelectArgs,

    #[command(flatten)]
    pub build: BuildOptions,

    #[command(flatten)]
    pub upload: UploadFlags,

    /// Stop after building
    #[arg(long)]
    pub skip_upload: bool,
}

/// Parse `NAME=TAG`.
fn parse_tag_override(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, tag)) if !name.trim().is_empty() && !tag.trim().is_empty() => {
            Ok((name.trim().to_string(), tag.trim().to_string()))
        }
        _ => Err(format!("expected NAME=TAG, got '{}'", s)),
    }
}

fn build_pipeline<'a, R: Runtime>(runtime: &'a R, cli: &Cli) -> Result<Pipeline<'a, R>> {
    let manifest = Manifest::load_or_builtin(runtime, cli.config.as_deref())?;
    let cachedir = resolve_cachedir(runtime, cli.cachedir.clone())?;
    Pipeline::new(runtime, &manifest, cachedir, cli.conda_bld.clone())
        .context("Failed to set up the release pipeline")
}

fn apply_tags<R: Runtime>(pipeline: &mut Pipeline<'_, R>, select: &SelectArgs) -> Result<()> {
    for (name, tag) in &select.tags {
        pipeline.set_tag(name, tag)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let runtime = RealRuntime;
    let mut pipeline = build_pipeline(&runtime, &cli)?;

    match cli.command {
        Commands::Plan => {
            println!("Cache directory: {}", pipeline.cachedir().display());
            for entry in pipeline.plan() {
                println!("{}", entry);
            }
        }
        Commands::Pull(args) => {
            apply_tags(&mut pipeline, &args.select)?;
            pipeline.pull(&args.select.packages)?;
        }
        Commands::Build(args) => {
            apply_tags(&mut pipeline, &args.select)?;
            pipeline.build(&args.select.packages, &args.build.channel, &args.build.python)?;
        }
        Commands::Upload(args) => {
            apply_tags(&mut pipeline, &args.select)?;
            let options = UploadOptions::from(args.upload);
            pipeline.upload(&args.select.packages, &options, &args.python)?;
        }
        Commands::Release(args) => {
            apply_tags(&mut pipeline, &args.select)?;
            let options = UploadOptions::from(args.upload);
            let upload = (!args.skip_upload).then_some(&options);
            pipeline.release(
                &args.select.packages,
                &args.build.channel,
                &args.build.python,
                upload,
            )?;
        }
        Commands::Clean => pipeline.clean()?,
    }
    Ok(())
}
