use std::path::PathBuf;

use clap::Parser;

const DEFAULT_IMAGES_SERVER: &str = "https://gha-self-hosted-images.infra.rust-lang.org";

/// Per-VM executor: provisions one disposable VM from an instance spec,
/// registers a one-shot runner against the job-dispatch provider, and
/// supervises the VM until the job completes or is shut down.
#[derive(Debug, Parser)]
#[command(
    name = "gha-vm-executor",
    version,
    about = "Provisions and supervises one disposable CI virtual machine."
)]
pub struct Cli {
    /// Path to the instance-spec JSON file describing the VM to run.
    #[arg(value_name = "INSTANCE_SPEC")]
    pub instance_spec: PathBuf,

    /// GitHub App client id used to mint the installation token.
    #[arg(long, value_name = "ID")]
    pub github_client_id: String,

    /// Path to the GitHub App's RSA private key (PEM).
    #[arg(long, value_name = "PATH")]
    pub github_private_key: PathBuf,

    /// Organization the runner is registered against.
    #[arg(long, value_name = "ORG")]
    pub github_org: String,

    /// Runner group the one-shot runner is registered into.
    #[arg(long, value_name = "ID")]
    pub runner_group_id: u64,

    /// Base URL of the image server.
    #[arg(long, value_name = "URL", default_value = DEFAULT_IMAGES_SERVER)]
    pub images_server: String,

    /// Directory used to cache downloaded images. Defaults to a fresh
    /// per-invocation tempdir when absent.
    #[arg(long, value_name = "PATH")]
    pub images_cache_dir: Option<PathBuf>,

    /// Host port to forward to the guest's SSH port, for debugging.
    #[arg(long, value_name = "PORT")]
    pub ssh_port: Option<u16>,

    /// Debug flag: tell the guest not to shut itself down after the job.
    #[arg(long)]
    pub no_shutdown_after_job: bool,
}
