//! CLI configuration and argument parsing.

use std::path::PathBuf;

use clap::Parser;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Resumable installer for Kubernetes control-plane landscapes.
///
/// Reads landscape values, migrates the persisted installation state to the
/// target release and deploys every step in order. Re-running after a failure
/// continues from the persisted state.
#[derive(Parser, Debug, Clone)]
#[command(name = "lsi")]
#[command(about = "Resumable installer for Kubernetes control-plane landscapes")]
#[command(version = const_format::formatcp!(
    "{} (commit: {}, build date: {})",
    VERSION, COMMIT, BUILD_DATE
))]
pub struct Args {
    /// Landscape values file, may be repeated (later files win)
    #[arg(short = 'f', long = "values", value_name = "FILE", env = "LSI_VALUES", value_delimiter = ',')]
    pub values: Vec<PathBuf>,

    /// Override a single value (format: path.to.key=VALUE)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub set: Vec<String>,

    /// Landscape version to install (defaults to `version` from the values)
    #[arg(short = 't', long, env = "LSI_TARGET_VERSION")]
    pub target_version: Option<String>,

    /// Render everything locally without touching the cluster
    #[arg(long, default_value = "false", env = "LSI_DRY_RUN")]
    pub dry_run: bool,

    /// Namespace for state secrets and releases without a namespace
    #[arg(short, long, default_value = "garden", env = "LSI_NAMESPACE")]
    pub namespace: String,

    /// Directory for local state files
    #[arg(long, default_value = "state", env = "LSI_STATE_DIR")]
    pub state_dir: PathBuf,

    /// Directory for generated values files and rendered charts
    #[arg(long, default_value = "gen", env = "LSI_GEN_DIR")]
    pub gen_dir: PathBuf,

    /// Helm executable used to install releases
    #[arg(long, default_value = "helm", env = "LSI_HELM_BINARY")]
    pub helm_binary: String,

    /// Kubeconfig of the host cluster (defaults to the standard lookup)
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long, env = "LSI_KUBE_CONTEXT")]
    pub context: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LSI_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (json, text)
    #[arg(long, default_value = "text", env = "LSI_LOG_FORMAT")]
    pub log_format: String,
}

/// Application configuration derived from CLI args.
#[derive(Debug, Clone)]
pub struct Config {
    pub value_files: Vec<PathBuf>,
    pub overrides: Vec<String>,
    pub target_version: Option<String>,
    pub dry_run: bool,
    pub namespace: String,
    pub state_dir: PathBuf,
    pub gen_dir: PathBuf,
    pub helm_binary: String,
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    pub log_level: String,
    pub log_format: String,
}

impl Config {
    /// Create config from CLI arguments.
    pub fn from_args(args: Args) -> Self {
        // KUBECONFIG may hold a path list; only a single file is passed on
        let kubeconfig = args
            .kubeconfig
            .filter(|p| !p.as_os_str().is_empty() && !p.to_string_lossy().contains(':'));

        Self {
            value_files: args.values,
            overrides: args.set,
            target_version: args.target_version.filter(|v| !v.trim().is_empty()),
            dry_run: args.dry_run,
            namespace: args.namespace,
            state_dir: args.state_dir,
            gen_dir: args.gen_dir,
            helm_binary: args.helm_binary,
            kubeconfig,
            context: args.context,
            log_level: args.log_level,
            log_format: args.log_format,
        }
    }
}
