//! Raw Kubernetes manifests as flow tasks.
//!
//! Objects are applied with server-side apply through the dynamic API, so any
//! kind can be managed without compiled-in types.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::Api;
use kube::api::{ApiResource, DynamicObject, Patch, PatchParams};
use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::LsiError;
use crate::flow::Task;
use crate::retry::{BackoffConfig, retry_with_backoff};
use crate::state::SharedKeyValueState;

const FIELD_MANAGER: &str = "lsi";

/// Kinds that are not namespaced.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "APIService",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "MutatingWebhookConfiguration",
    "Namespace",
    "Node",
    "PersistentVolume",
    "PriorityClass",
    "StorageClass",
    "ValidatingWebhookConfiguration",
];

/// A named set of Kubernetes objects.
#[async_trait]
pub trait Manifest: Send + Sync {
    fn name(&self) -> &str;

    async fn manifests(&self) -> Result<Vec<DynamicObject>>;
}

/// Parse a multi-document YAML stream. Empty documents are skipped.
pub fn parse_manifests(content: &str) -> Result<Vec<DynamicObject>> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = Value::deserialize(document).context("Failed to parse manifest YAML")?;
        if !value.is_null() {
            documents.push(value);
        }
    }
    parse_objects(documents)
}

/// Convert raw documents into objects that carry `apiVersion`, `kind` and
/// `metadata.name`.
pub fn parse_objects(documents: Vec<Value>) -> Result<Vec<DynamicObject>> {
    documents
        .into_iter()
        .map(|value| {
            let object: DynamicObject =
                serde_json::from_value(value).context("Manifest is not a Kubernetes object")?;
            if object.types.is_none() || object.metadata.name.is_none() {
                return Err(LsiError::InvalidValues(
                    "manifest objects need apiVersion, kind and metadata.name".to_string(),
                )
                .into());
            }
            Ok(object)
        })
        .collect()
}

/// Manifest read from a YAML file on every run.
#[derive(Debug, Clone)]
pub struct LocalManifest {
    name: String,
    path: PathBuf,
}

impl LocalManifest {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl Manifest for LocalManifest {
    fn name(&self) -> &str {
        &self.name
    }

    async fn manifests(&self) -> Result<Vec<DynamicObject>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read manifest {}", self.path.display()))?;
        parse_manifests(&content)
    }
}

/// Manifest built from objects held in memory.
#[derive(Debug, Clone)]
pub struct RawManifest {
    name: String,
    objects: Vec<DynamicObject>,
}

impl RawManifest {
    pub fn new(name: impl Into<String>, objects: Vec<DynamicObject>) -> Self {
        Self {
            name: name.into(),
            objects,
        }
    }
}

#[async_trait]
impl Manifest for RawManifest {
    fn name(&self) -> &str {
        &self.name
    }

    async fn manifests(&self) -> Result<Vec<DynamicObject>> {
        Ok(self.objects.clone())
    }
}

/// Reference to an object applied by this tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResource {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ManagedResource {
    fn from_object(object: &DynamicObject) -> Self {
        let (api_version, kind) = object
            .types
            .as_ref()
            .map(|t| (t.api_version.clone(), t.kind.clone()))
            .unwrap_or_default();
        Self {
            api_version,
            kind,
            name: object.metadata.name.clone().unwrap_or_default(),
            namespace: object.metadata.namespace.clone(),
        }
    }

    /// `kind/name` or `kind/namespace/name`.
    pub fn display(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}/{}", self.kind, ns, self.name),
            None => format!("{}/{}", self.kind, self.name),
        }
    }
}

/// API resource for an `apiVersion` and `kind` pair.
pub fn api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = api_version
        .split_once('/')
        .unwrap_or(("", api_version));
    ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind))
}

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Applies manifests and remembers what was applied.
pub struct KubeApply {
    client: Option<kube::Client>,
    state: SharedKeyValueState<Vec<ManagedResource>>,
    dry_run: bool,
    default_namespace: String,
    backoff: BackoffConfig,
}

impl KubeApply {
    pub fn new(
        client: Option<kube::Client>,
        state: SharedKeyValueState<Vec<ManagedResource>>,
        dry_run: bool,
        default_namespace: impl Into<String>,
    ) -> Self {
        Self {
            client,
            state,
            dry_run,
            default_namespace: default_namespace.into(),
            backoff: BackoffConfig::default(),
        }
    }

    /// Fill in the default namespace for namespaced objects that have none.
    fn with_namespace(&self, mut object: DynamicObject) -> DynamicObject {
        let kind = object.types.as_ref().map_or("", |t| t.kind.as_str());
        if object.metadata.namespace.is_none() && !is_cluster_scoped(kind) {
            object.metadata.namespace = Some(self.default_namespace.clone());
        }
        object
    }

    /// Apply `manifest` through `client`, or through the client this sink was
    /// built with when none is given.
    pub async fn apply(&self, manifest: &dyn Manifest, client: Option<&kube::Client>) -> Result<()> {
        let objects: Vec<DynamicObject> = manifest
            .manifests()
            .await?
            .into_iter()
            .map(|o| self.with_namespace(o))
            .collect();

        if self.dry_run {
            for object in &objects {
                println!("---\n{}", serde_yaml::to_string(object)?.trim_end());
            }
        } else {
            let client = client
                .or(self.client.as_ref())
                .ok_or_else(|| LsiError::MissingValue("Kubernetes client".to_string()))?;
            for object in &objects {
                self.apply_object(client, object).await?;
            }
        }

        let managed: Vec<ManagedResource> = objects.iter().map(ManagedResource::from_object).collect();
        self.state.store(manifest.name(), &managed).await?;
        info!(manifest = manifest.name(), objects = managed.len(), "Applied manifest");
        Ok(())
    }

    async fn apply_object(&self, client: &kube::Client, object: &DynamicObject) -> Result<()> {
        let resource = ManagedResource::from_object(object);
        let ar = api_resource(&resource.api_version, &resource.kind);
        let api: Api<DynamicObject> = match &resource.namespace {
            Some(ns) if !is_cluster_scoped(&resource.kind) => {
                Api::namespaced_with(client.clone(), ns, &ar)
            }
            _ => Api::all_with(client.clone(), &ar),
        };
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let target = resource.display();
        info!(object = %target, "Applying object");

        let (api, params, target, name) = (&api, &params, target.as_str(), resource.name.as_str());
        retry_with_backoff(&self.backoff, &format!("apply {target}"), move || async move {
            match api.patch(name, params, &Patch::Apply(object)).await {
                Ok(_) => Ok(true),
                Err(e) => {
                    warn!(object = %target, "Unable to apply object: {}", e);
                    debug!(object = %target, "{}", serde_json::to_string_pretty(object).unwrap_or_default());
                    Ok(false)
                }
            }
        })
        .await
    }
}

/// Applies one manifest as a flow task.
pub struct KubeApplyTask {
    manifest: Arc<dyn Manifest>,
    kube_apply: Arc<KubeApply>,
    client: Option<kube::Client>,
}

impl KubeApplyTask {
    pub fn new(manifest: Arc<dyn Manifest>, kube_apply: Arc<KubeApply>) -> Self {
        Self {
            manifest,
            kube_apply,
            client: None,
        }
    }

    /// Apply into the cluster behind `client` instead of the host cluster.
    #[must_use]
    pub fn with_client(mut self, client: kube::Client) -> Self {
        self.client = Some(client);
        self
    }
}

#[async_trait]
impl Task for KubeApplyTask {
    fn name(&self) -> &str {
        self.manifest.name()
    }

    async fn run(&self) -> Result<()> {
        self.kube_apply
            .apply(self.manifest.as_ref(), self.client.as_ref())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_server::{self, Exchange};
    use crate::state::KeyValueState;
    use crate::state::memory::MemoryKeyValueState;
    use http::Method;

    const MANIFEST: &str = r"
apiVersion: v1
kind: Namespace
metadata:
  name: garden
---
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: identity
spec:
  replicas: 2
---
apiVersion: networking.k8s.io/v1
kind: NetworkPolicy
metadata:
  name: deny-all
  namespace: shoot
";

    #[test]
    fn test_parse_manifests_skips_empty_documents() {
        let objects = parse_manifests(MANIFEST).unwrap();
        assert_eq!(objects.len(), 3);
        assert_eq!(objects[1].types.as_ref().unwrap().kind, "Deployment");
        assert_eq!(objects[1].data["spec"]["replicas"], 2);
    }

    #[test]
    fn test_parse_manifests_requires_identity() {
        assert!(parse_manifests("kind: ConfigMap\ndata: {}\n").is_err());
        assert!(parse_manifests("apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n").is_err());
    }

    #[test]
    fn test_api_resource() {
        let ar = api_resource("apps/v1", "Deployment");
        assert_eq!(ar.group, "apps");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.plural, "deployments");

        let core = api_resource("v1", "ConfigMap");
        assert_eq!(core.group, "");
        assert_eq!(core.api_version, "v1");
    }

    #[tokio::test]
    async fn test_dry_run_records_managed_resources() {
        let state = Arc::new(MemoryKeyValueState::<Vec<ManagedResource>>::default());
        let kube_apply = Arc::new(KubeApply::new(None, state.clone(), true, "garden"));
        let manifest = Arc::new(RawManifest::new(
            "host-config",
            parse_manifests(MANIFEST).unwrap(),
        ));

        let task = KubeApplyTask::new(manifest, kube_apply);
        assert_eq!(task.name(), "host-config");
        task.run().await.unwrap();

        let managed = state.get("host-config").await.unwrap();
        let names: Vec<String> = managed.iter().map(ManagedResource::display).collect();
        assert_eq!(
            names,
            vec![
                "Namespace/garden",
                "Deployment/garden/identity",
                "NetworkPolicy/shoot/deny-all"
            ]
        );
    }

    #[tokio::test]
    async fn test_apply_without_client_fails() {
        let state = Arc::new(MemoryKeyValueState::<Vec<ManagedResource>>::default());
        let kube_apply = KubeApply::new(None, state.clone(), false, "garden");
        let manifest = RawManifest::new("host-config", parse_manifests(MANIFEST).unwrap());

        let err = kube_apply.apply(&manifest, None).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LsiError>(),
            Some(LsiError::MissingValue(_))
        ));
        assert!(state.get_all().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_client_wins_over_host_client() {
        // the host answers nothing, so using it would time out
        let (host, host_server) = api_server::client(Vec::new());
        let (target, target_server) = api_server::client(vec![Exchange::new(
            Method::PATCH,
            "/api/v1/namespaces/garden/configmaps/settings",
            200,
            Value::Null,
        )]);

        let state = Arc::new(MemoryKeyValueState::<Vec<ManagedResource>>::default());
        let kube_apply = Arc::new(KubeApply::new(Some(host), state.clone(), false, "garden"));
        let manifest = Arc::new(RawManifest::new(
            "virtual-config",
            parse_manifests("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\ndata:\n  mode: virtual\n")
                .unwrap(),
        ));

        KubeApplyTask::new(manifest, kube_apply)
            .with_client(target)
            .run()
            .await
            .unwrap();

        let received = target_server.await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].method, Method::PATCH);
        assert!(received[0].query.as_deref().unwrap_or_default().contains("fieldManager=lsi"));
        assert_eq!(received[0].body["metadata"]["namespace"], "garden");
        assert_eq!(received[0].body["data"]["mode"], "virtual");
        assert!(host_server.await.unwrap().is_empty());
        assert_eq!(
            state.get("virtual-config").await.unwrap()[0].display(),
            "ConfigMap/garden/settings"
        );
    }

    #[tokio::test]
    async fn test_local_manifest_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.yaml");
        std::fs::write(&path, MANIFEST).unwrap();

        let manifest = LocalManifest::new("host", &path);
        assert_eq!(manifest.manifests().await.unwrap().len(), 3);
    }
}
