//! Landscape entrypoint: values, backends, installation and flow wiring.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::component::{InstallationTask, StepFactory, VersionedComponent};
use crate::config::Config;
use crate::error::LsiError;
use crate::flow::{Flow, Step};
use crate::helm::{ChartRef, Helm, ReleaseSink, ReleaseTask, ValuesChart};
use crate::installation::{InstallationRegistry, StepRenderer, VersionedState};
use crate::kube_apply::{
    KubeApply, KubeApplyTask, LocalManifest, Manifest, RawManifest, parse_objects,
};
use crate::state::namespaced::NamespacedKeyValueState;
use crate::state::{SharedKeyValueState, StateBackend, names};
use crate::values::{apply_overrides, read_value_files};
use crate::version::{CatalogVersion, display_version, parse_version};

/// Merged landscape values. Everything besides `version` and `steps` is
/// handed to the installation as input.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LandscapeValues {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

impl LandscapeValues {
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| LsiError::InvalidValues(format!("landscape values: {e}")).into())
    }
}

/// One deployment step of the landscape, in installation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StepSpec {
    /// Multi-document YAML file applied with server-side apply, into the
    /// cluster of `kubeconfig` when given.
    Manifest {
        name: String,
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kubeconfig: Option<PathBuf>,
    },
    /// Objects given inline, applied like a manifest file.
    Objects {
        name: String,
        objects: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kubeconfig: Option<PathBuf>,
    },
    /// Helm release whose values are the top-level value named `name`,
    /// merged over `values`. The virtual cluster release takes the
    /// `apiserver` section instead and is rolled through every skipped minor.
    Release {
        name: String,
        chart: ChartRef,
        #[serde(default)]
        namespace: Option<String>,
        #[serde(default)]
        values: Value,
        #[serde(default, rename = "virtualCluster")]
        virtual_cluster: bool,
    },
    /// Helm release upgraded version by version through its catalog.
    Component(ComponentSpec),
}

impl StepSpec {
    pub fn name(&self) -> &str {
        match self {
            Self::Manifest { name, .. } | Self::Objects { name, .. } | Self::Release { name, .. } => {
                name
            }
            Self::Component(spec) => &spec.name,
        }
    }

    /// Kubeconfig of the cluster a manifest step applies to.
    pub fn kubeconfig(&self) -> Option<&Path> {
        match self {
            Self::Manifest { kubeconfig, .. } | Self::Objects { kubeconfig, .. } => {
                kubeconfig.as_deref()
            }
            Self::Release { .. } | Self::Component(_) => None,
        }
    }

    const fn is_virtual_cluster(&self) -> bool {
        matches!(self, Self::Release { virtual_cluster: true, .. })
    }
}

/// Remote chart installed through every version a component must pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub versions: Vec<ComponentVersion>,
    pub chart: String,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub values: Value,
}

/// Catalog entry of a component, optionally installed from its own chart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentVersion {
    #[serde(flatten)]
    pub catalog: CatalogVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<ChartRef>,
}

/// Builds the landscape steps from rendered state.
pub struct LandscapeRenderer {
    steps: Vec<StepSpec>,
    helm: Arc<dyn ReleaseSink>,
    kube_apply: Arc<KubeApply>,
    components: SharedKeyValueState<String>,
    kubeconfig: Option<PathBuf>,
    target_clients: HashMap<PathBuf, kube::Client>,
}

impl LandscapeRenderer {
    pub fn new(
        steps: Vec<StepSpec>,
        helm: Arc<dyn ReleaseSink>,
        kube_apply: Arc<KubeApply>,
        components: SharedKeyValueState<String>,
        kubeconfig: Option<PathBuf>,
    ) -> Self {
        Self {
            steps,
            helm,
            kube_apply,
            components,
            kubeconfig,
            target_clients: HashMap::new(),
        }
    }

    /// Clients for the kubeconfigs named by manifest steps. Steps whose
    /// kubeconfig has no client apply through the host sink.
    #[must_use]
    pub fn with_target_clients(mut self, clients: HashMap<PathBuf, kube::Client>) -> Self {
        self.target_clients = clients;
        self
    }

    fn apply_step(&self, manifest: Arc<dyn Manifest>, kubeconfig: Option<&Path>) -> Step {
        let mut task = KubeApplyTask::new(manifest, self.kube_apply.clone());
        if let Some(client) = kubeconfig.and_then(|path| self.target_clients.get(path)) {
            task = task.with_client(client.clone());
        }
        Step::task(task)
    }

    fn release_step(&self, chart: ValuesChart, values: &Arc<Value>) -> Step {
        Step::task(ReleaseTask::new(
            Arc::new(chart),
            values.clone(),
            self.helm.clone(),
            self.kubeconfig.clone(),
        ))
    }

    /// Factory for the release of `spec` at a given version.
    fn release_factory<C>(&self, spec: &ComponentSpec, chart_for: C, values: &Arc<Value>) -> StepFactory
    where
        C: Fn(&Version) -> ChartRef + Send + Sync + 'static,
    {
        let (name, namespace, defaults) = (spec.name.clone(), spec.namespace.clone(), spec.values.clone());
        let (values, sink, kubeconfig) = (values.clone(), self.helm.clone(), self.kubeconfig.clone());
        Box::new(move |version: &Version| {
            let chart = ValuesChart::new(name.clone(), chart_for(version))
                .with_namespace(namespace.clone())
                .with_defaults(defaults.clone());
            Ok(Step::task(ReleaseTask::new(
                Arc::new(chart),
                values.clone(),
                sink.clone(),
                kubeconfig.clone(),
            )))
        })
    }

    fn component_step(&self, spec: &ComponentSpec, values: &Arc<Value>) -> Result<Step> {
        let target = parse_version(&spec.version)
            .with_context(|| format!("Invalid target version of component {}", spec.name))?;

        let mut component = VersionedComponent::new(&spec.name, target, self.components.clone());
        for entry in &spec.versions {
            component = match &entry.chart {
                Some(chart) => {
                    let chart = chart.clone();
                    let factory = self.release_factory(spec, move |_| chart.clone(), values);
                    component.with_version_factory(entry.catalog.clone(), factory)
                }
                None => component.with_versions([entry.catalog.clone()]),
            };
        }

        let (chart, repository) = (spec.chart.clone(), spec.repository.clone());
        let remote = move |version: &Version| ChartRef::Remote {
            name: chart.clone(),
            version: version.to_string(),
            repository: repository.clone(),
        };
        let component = component.with_default_factory(self.release_factory(spec, remote, values));
        Ok(Step::task(InstallationTask::new(Arc::new(component))))
    }
}

/// `values` with the virtual cluster pinned to `version`.
fn with_apiserver_version(values: &Value, version: &Version) -> Value {
    let mut staged = values.clone();
    if let Some(apiserver) = staged.get_mut("apiserver").and_then(Value::as_object_mut) {
        apiserver.insert("version".to_string(), Value::String(display_version(version)));
    }
    staged
}

impl StepRenderer for LandscapeRenderer {
    fn render(&self, state: &VersionedState, apiserver_upgrades: &[Version]) -> Result<Vec<Step>> {
        if !apiserver_upgrades.is_empty() && !self.steps.iter().any(StepSpec::is_virtual_cluster) {
            warn!(
                skipped = ?apiserver_upgrades.iter().map(display_version).collect::<Vec<_>>(),
                "No virtual cluster release configured, intermediate versions are not rolled out"
            );
        }

        let values = Arc::new(state.to_value());
        let mut steps = Vec::with_capacity(self.steps.len() + apiserver_upgrades.len());
        for spec in &self.steps {
            match spec {
                StepSpec::Manifest {
                    name,
                    path,
                    kubeconfig,
                } => steps.push(self.apply_step(
                    Arc::new(LocalManifest::new(name.clone(), path.clone())),
                    kubeconfig.as_deref(),
                )),
                StepSpec::Objects {
                    name,
                    objects,
                    kubeconfig,
                } => {
                    let objects = parse_objects(objects.clone())
                        .with_context(|| format!("Invalid objects in step {name}"))?;
                    steps.push(self.apply_step(
                        Arc::new(RawManifest::new(name.clone(), objects)),
                        kubeconfig.as_deref(),
                    ));
                }
                StepSpec::Release {
                    name,
                    chart,
                    namespace,
                    values: defaults,
                    virtual_cluster,
                } => {
                    let mut chart = ValuesChart::new(name.clone(), chart.clone())
                        .with_namespace(namespace.clone())
                        .with_defaults(defaults.clone());
                    if *virtual_cluster {
                        chart = chart.with_values_key("apiserver");
                        for version in apiserver_upgrades {
                            let staged = Arc::new(with_apiserver_version(&values, version));
                            let mut step = self.release_step(chart.clone(), &staged);
                            step.rename(format!("{name}-{}", display_version(version)));
                            steps.push(step);
                        }
                    }
                    steps.push(self.release_step(chart, &values));
                }
                StepSpec::Component(spec) => steps.push(self.component_step(spec, &values)?),
            }
        }
        Ok(steps)
    }
}

/// Build a Kubernetes client from an explicit kubeconfig file, a context of
/// the default kubeconfig, or the inferred in-cluster/default configuration.
pub async fn build_client(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<kube::Client> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };
    let config = match (kubeconfig, context) {
        (Some(path), _) => {
            debug!(path = %path.display(), "Using kubeconfig file");
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| LsiError::KubernetesApi(format!("kubeconfig {}: {e}", path.display())))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| LsiError::KubernetesApi(format!("kubeconfig {}: {e}", path.display())))?
        }
        (None, Some(ctx)) => {
            debug!("Using kubeconfig context: {}", ctx);
            kube::Config::from_kubeconfig(&options)
                .await
                .map_err(|e| LsiError::KubernetesApi(format!("context '{ctx}': {e}")))?
        }
        (None, None) => {
            debug!("Using default kubeconfig context");
            kube::Config::infer()
                .await
                .map_err(|e| LsiError::KubernetesApi(e.to_string()))?
        }
    };

    kube::Client::try_from(config)
        .map_err(|e| LsiError::KubernetesApi(format!("client: {e}")).into())
}

/// Target version from the command line, else from the values.
fn resolve_target(flag: Option<&str>, values: &LandscapeValues) -> Result<Version> {
    let raw = flag
        .or(values.version.as_deref())
        .ok_or_else(|| LsiError::MissingValue("version".to_string()))?;
    parse_version(raw)
}

/// Install or upgrade the landscape described by `config`.
pub async fn run(config: &Config) -> Result<()> {
    let mut merged = read_value_files(&config.value_files).await?;
    apply_overrides(&mut merged, &config.overrides)?;
    let values = LandscapeValues::from_value(merged)?;
    let target = resolve_target(config.target_version.as_deref(), &values)?;

    let registry = InstallationRegistry::default();
    debug!(
        lines = ?registry.lines().map(display_version).collect::<Vec<_>>(),
        "Known release lines"
    );
    let installation = registry.get(&target)?;

    let client = if config.dry_run {
        None
    } else {
        Some(build_client(config.kubeconfig.as_deref(), config.context.as_deref()).await?)
    };
    let backend = StateBackend::select(
        config.dry_run,
        config.state_dir.clone(),
        client.clone(),
        &config.namespace,
    );
    info!(
        target = %display_version(&target),
        line = %display_version(installation.line()),
        dry_run = config.dry_run,
        state = %backend.describe(),
        "Installing landscape"
    );

    let helm = Arc::new(
        Helm::new(
            &config.gen_dir,
            backend.key_value(names::HELM),
            config.dry_run,
            &config.namespace,
        )
        .with_binary(&config.helm_binary),
    );
    let kube_apply = Arc::new(KubeApply::new(
        client,
        backend.key_value(names::KUBE_APPLY),
        config.dry_run,
        &config.namespace,
    ));
    let components: SharedKeyValueState<String> = Arc::new(NamespacedKeyValueState::new(
        backend.key_value(names::COMPONENT),
        &config.namespace,
    ));
    let step_names: Vec<&str> = values.steps.iter().map(StepSpec::name).collect();
    debug!(steps = ?step_names, "Landscape steps");

    let mut target_clients = HashMap::new();
    if !config.dry_run {
        for path in values.steps.iter().filter_map(StepSpec::kubeconfig) {
            if !target_clients.contains_key(path) {
                let client = build_client(Some(path), None).await?;
                target_clients.insert(path.to_path_buf(), client);
            }
        }
    }

    let renderer = LandscapeRenderer::new(
        values.steps.clone(),
        helm,
        kube_apply,
        components,
        config.kubeconfig.clone(),
    )
    .with_target_clients(target_clients);

    let state = backend.state::<VersionedState>(names::STATE);
    let mut flow = Flow::new("landscape");
    installation
        .install(&mut flow, state.as_ref(), &target, values.values, &renderer)
        .await?;

    if flow.is_empty() {
        info!("No landscape steps configured");
    }
    let plan = flow.step_info();
    if config.dry_run {
        print!("{}", serde_yaml::to_string(&plan)?);
    } else {
        info!(steps = flow.len(), "Execution plan:\n{}", plan.render().trim_end());
    }

    flow.execute(&()).await?;
    info!(version = %display_version(&target), "Landscape installed");
    Ok(())
}
