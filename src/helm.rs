//! Helm releases as flow tasks.
//!
//! Charts render a [`Release`] from the landscape values; a [`ReleaseSink`]
//! installs it. The shipped sink shells out to the `helm` binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::LsiError;
use crate::flow::Task;
use crate::state::SharedKeyValueState;
use crate::values::deep_merge;

/// Location of a chart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChartRef {
    /// Chart directory or packaged archive on local disk.
    Path { path: String },
    /// Chart fetched by name and version, optionally from a repository URL.
    Remote {
        name: String,
        version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repository: Option<String>,
    },
}

impl ChartRef {
    fn args(&self) -> Vec<String> {
        match self {
            Self::Path { path } => vec![path.clone()],
            Self::Remote {
                name,
                version,
                repository,
            } => {
                let mut args = vec![name.clone(), "--version".to_string(), version.clone()];
                if let Some(repo) = repository {
                    args.extend(["--repo".to_string(), repo.clone()]);
                }
                args
            }
        }
    }
}

/// A fully rendered release, ready to be installed.
#[derive(Debug, Clone, PartialEq)]
pub struct Release {
    pub name: String,
    pub chart: ChartRef,
    pub namespace: Option<String>,
    pub values: Option<Value>,
}

/// Renders a release from landscape values.
pub trait Chart: Send + Sync {
    fn release_name(&self) -> &str;

    fn release(&self, values: &Value) -> Result<Release>;
}

/// Chart whose release values are a top-level landscape value, merged over
/// the chart defaults. The value is named after the release unless another
/// key is set.
#[derive(Debug, Clone)]
pub struct ValuesChart {
    release_name: String,
    values_key: Option<String>,
    chart: ChartRef,
    namespace: Option<String>,
    defaults: Value,
}

impl ValuesChart {
    pub fn new(release_name: impl Into<String>, chart: ChartRef) -> Self {
        Self {
            release_name: release_name.into(),
            values_key: None,
            chart,
            namespace: None,
            defaults: Value::Null,
        }
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    #[must_use]
    pub fn with_defaults(mut self, defaults: Value) -> Self {
        self.defaults = defaults;
        self
    }

    #[must_use]
    pub fn with_values_key(mut self, key: impl Into<String>) -> Self {
        self.values_key = Some(key.into());
        self
    }
}

impl Chart for ValuesChart {
    fn release_name(&self) -> &str {
        &self.release_name
    }

    fn release(&self, values: &Value) -> Result<Release> {
        let mut release_values = self.defaults.clone();
        let key = self.values_key.as_deref().unwrap_or(&self.release_name);
        if let Some(overrides) = values.get(key) {
            deep_merge(&mut release_values, overrides.clone());
        }
        Ok(Release {
            name: self.release_name.clone(),
            chart: self.chart.clone(),
            namespace: self.namespace.clone(),
            values: (!release_values.is_null()).then_some(release_values),
        })
    }
}

/// Record of a release installed by this tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledRelease {
    pub name: String,
    pub namespace: String,
    pub chart: ChartRef,
    pub installed_at: DateTime<Utc>,
}

/// Installs releases.
#[async_trait]
pub trait ReleaseSink: Send + Sync {
    async fn create_or_update(&self, release: &Release, kubeconfig: Option<&Path>) -> Result<()>;
}

/// Sink backed by the `helm` CLI.
pub struct Helm {
    binary: String,
    gen_dir: PathBuf,
    state: SharedKeyValueState<InstalledRelease>,
    dry_run: bool,
    default_namespace: String,
}

impl Helm {
    pub fn new(
        gen_dir: impl Into<PathBuf>,
        state: SharedKeyValueState<InstalledRelease>,
        dry_run: bool,
        default_namespace: impl Into<String>,
    ) -> Self {
        Self {
            binary: "helm".to_string(),
            gen_dir: gen_dir.into(),
            state,
            dry_run,
            default_namespace: default_namespace.into(),
        }
    }

    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn release_dir(&self, release: &str) -> PathBuf {
        self.gen_dir.join(release)
    }

    /// Arguments for the helm invocation of `release`.
    pub fn args(
        &self,
        release: &Release,
        namespace: &str,
        values_file: Option<&Path>,
        kubeconfig: Option<&Path>,
    ) -> Vec<String> {
        let mut args: Vec<String> = if self.dry_run {
            vec!["template".to_string(), release.name.clone()]
        } else {
            vec![
                "upgrade".to_string(),
                "--install".to_string(),
                "--create-namespace".to_string(),
                "--wait".to_string(),
                release.name.clone(),
            ]
        };
        args.extend(release.chart.args());
        args.extend(["--namespace".to_string(), namespace.to_string()]);
        if let Some(file) = values_file {
            args.extend(["-f".to_string(), file.display().to_string()]);
        }
        if let Some(path) = kubeconfig {
            args.extend(["--kubeconfig".to_string(), path.display().to_string()]);
        }
        args
    }

    async fn write_values_file(&self, release: &str, values: &Value) -> Result<PathBuf> {
        let dir = self.release_dir(release);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join("values.yaml");
        tokio::fs::write(&path, serde_yaml::to_string(values)?)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    async fn run(&self, args: &[String]) -> Result<Vec<u8>> {
        debug!(command = %self.binary, args = ?args, "Executing helm");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", self.binary))?;

        if !output.status.success() {
            return Err(LsiError::CommandFailed {
                command: format!("{} {}", self.binary, args.join(" ")),
                details: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl ReleaseSink for Helm {
    async fn create_or_update(&self, release: &Release, kubeconfig: Option<&Path>) -> Result<()> {
        let namespace = release
            .namespace
            .clone()
            .unwrap_or_else(|| self.default_namespace.clone());
        info!(release = %release.name, namespace = %namespace, "Deploying Helm chart");

        let values_file = match &release.values {
            Some(values) => Some(self.write_values_file(&release.name, values).await?),
            None => None,
        };
        let args = self.args(release, &namespace, values_file.as_deref(), kubeconfig);
        let stdout = self.run(&args).await?;

        if self.dry_run {
            let rendered = self.release_dir(&release.name).join("manifest.yaml");
            tokio::fs::create_dir_all(self.release_dir(&release.name)).await?;
            tokio::fs::write(&rendered, &stdout)
                .await
                .with_context(|| format!("Failed to write {}", rendered.display()))?;
            info!(release = %release.name, path = %rendered.display(), "Rendered Helm chart");
        }

        self.state
            .store(
                &release.name,
                &InstalledRelease {
                    name: release.name.clone(),
                    namespace: namespace.clone(),
                    chart: release.chart.clone(),
                    installed_at: Utc::now(),
                },
            )
            .await?;
        info!(release = %release.name, namespace = %namespace, "Successfully deployed Helm chart");
        Ok(())
    }
}

/// Installs one chart as a flow task.
pub struct ReleaseTask {
    chart: Arc<dyn Chart>,
    values: Arc<Value>,
    sink: Arc<dyn ReleaseSink>,
    kubeconfig: Option<PathBuf>,
}

impl ReleaseTask {
    pub fn new(
        chart: Arc<dyn Chart>,
        values: Arc<Value>,
        sink: Arc<dyn ReleaseSink>,
        kubeconfig: Option<PathBuf>,
    ) -> Self {
        Self {
            chart,
            values,
            sink,
            kubeconfig,
        }
    }
}

#[async_trait]
impl Task for ReleaseTask {
    fn name(&self) -> &str {
        self.chart.release_name()
    }

    async fn run(&self) -> Result<()> {
        let release = self.chart.release(&self.values)?;
        self.sink
            .create_or_update(&release, self.kubeconfig.as_deref())
            .await
    }
}
