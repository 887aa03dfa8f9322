//! lsi - landscape installer.
//!
//! Installs and upgrades a multi-component control-plane landscape onto a host
//! cluster:
//! - Persisted installation state migrated release line by release line
//! - Components upgraded through every minor and migration patch in order
//! - Helm releases and raw manifests as resumable flow steps
//! - Dry runs rendered locally without touching the cluster

#[cfg(test)]
mod api_server;
mod component;
mod config;
mod error;
mod flow;
mod helm;
mod installation;
mod kube_apply;
mod landscape;
mod logging;
mod retry;
mod state;
mod values;
mod version;

use clap::Parser;
use tracing::{debug, error, warn};

use config::{Args, BUILD_DATE, COMMIT, Config, VERSION};
use error::{ErrorKind, kind_of};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = Config::from_args(args);

    if let Err(e) = logging::init(&config.log_format, &config.log_level) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    debug!(
        version = VERSION,
        commit = COMMIT,
        build_date = BUILD_DATE,
        "Starting lsi"
    );

    if let Err(e) = landscape::run(&config).await {
        let kind = kind_of(&e);
        error!(kind = %kind, "{:#}", e);
        if kind == ErrorKind::Transient {
            warn!("Cluster state is left as-is, re-run to resume the installation");
        }
        std::process::exit(1);
    }
}
