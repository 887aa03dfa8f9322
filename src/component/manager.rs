//! Expands a component upgrade into one step per intermediate version.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use semver::Version;
use tracing::info;

use super::Component;
use crate::flow::{Flow, Step, StepListener, Task};
use crate::version::{display_version, versions_to_install};

/// Records each version once its step has completed.
struct InstalledListener<'a> {
    component: &'a dyn Component,
    versions: HashMap<String, Version>,
}

#[async_trait]
impl StepListener for InstalledListener<'_> {
    async fn completed(&self, step: &str) -> Result<()> {
        match self.versions.get(step) {
            Some(version) => self.component.installed(version).await,
            None => Ok(()),
        }
    }
}

/// Drives a component from its current to its target version.
#[derive(Debug, Default)]
pub struct InstallationManager {
    flow: Flow,
}

impl InstallationManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            flow: Flow::new(name),
        }
    }

    /// Steps needed to reach the target version, paired with the version each
    /// one installs. Each step is named `<base>-v<X.Y.Z>`.
    pub async fn get_steps(&self, component: &dyn Component) -> Result<Vec<(Version, Step)>> {
        let target = component.target_version().await?;
        let versions = match component.current_version().await? {
            None => {
                info!(component = component.name(), "No installed version found, installing {}", display_version(&target));
                vec![target]
            }
            Some(current) => {
                let catalog = component.versions().await?;
                versions_to_install(Some(&current), &target, &catalog)
            }
        };

        let mut steps = Vec::with_capacity(versions.len());
        for version in versions {
            let mut step = component.install(&version).await?;
            let name = format!("{}-{}", step.name(), display_version(&version));
            step.rename(name);
            steps.push((version, step));
        }
        Ok(steps)
    }

    /// Install every pending version in order. The installed version is
    /// recorded after each step succeeds, so a failed run resumes from the
    /// last completed version.
    pub async fn install(&mut self, component: &dyn Component) -> Result<()> {
        let steps = self.get_steps(component).await?;
        if steps.is_empty() {
            info!(component = component.name(), "Nothing to do, component is up to date");
            return Ok(());
        }

        let mut versions = HashMap::with_capacity(steps.len());
        let steps: Vec<Step> = steps
            .into_iter()
            .map(|(version, step)| {
                versions.insert(step.name().to_string(), version);
                step
            })
            .collect();
        info!(
            component = component.name(),
            "Installing {} version(s): {}",
            steps.len(),
            steps.iter().map(Step::name).collect::<Vec<_>>().join(", ")
        );

        self.flow.add_steps(steps)?;
        let listener = InstalledListener {
            component,
            versions,
        };
        self.flow.execute(&listener).await
    }
}

/// Embeds a component upgrade as a single task of a parent flow.
pub struct InstallationTask {
    component: Arc<dyn Component>,
}

impl InstallationTask {
    pub fn new(component: Arc<dyn Component>) -> Self {
        Self { component }
    }
}

#[async_trait]
impl Task for InstallationTask {
    fn name(&self) -> &str {
        self.component.name()
    }

    async fn run(&self) -> Result<()> {
        InstallationManager::new(self.component.name())
            .install(self.component.as_ref())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::VersionedComponent;
    use crate::flow::FnTask;
    use crate::state::memory::MemoryKeyValueState;
    use crate::state::{KeyValueState, SharedKeyValueState};
    use crate::version::{CatalogVersion, parse_version};
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    fn v(s: &str) -> Version {
        parse_version(s).unwrap()
    }

    fn catalog() -> Vec<CatalogVersion> {
        ["1.1.5", "1.1.6", "1.2.1", "1.2.6", "1.3.4", "1.3.5", "1.4.2"]
            .iter()
            .map(|s| CatalogVersion::new(v(s)))
            .collect()
    }

    /// Component whose steps log `<version>` and fail for `fail_at`.
    fn component(
        target: &str,
        state: SharedKeyValueState<String>,
        log: &Log,
        fail_at: Option<Version>,
    ) -> VersionedComponent {
        let log = log.clone();
        VersionedComponent::new("gardener", v(target), state)
            .with_versions(catalog())
            .with_default_factory(move |version| {
                let log = log.clone();
                let version = version.clone();
                let fail = fail_at.as_ref() == Some(&version);
                Ok(Step::task(FnTask::new("gardener", move || {
                    let log = log.clone();
                    let version = version.clone();
                    async move {
                        if fail {
                            anyhow::bail!("gardener {version} unhealthy");
                        }
                        log.lock().unwrap().push(version.to_string());
                        Ok(())
                    }
                })))
            })
    }

    #[tokio::test]
    async fn test_get_steps_without_current_version() {
        let state = Arc::new(MemoryKeyValueState::<String>::default());
        let log = Log::default();
        let component = component("1.3.4", state, &log, None);

        let steps = InstallationManager::default()
            .get_steps(&component)
            .await
            .unwrap();

        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].0, v("1.3.4"));
        assert_eq!(steps[0].1.name(), "gardener-v1.3.4");
    }

    #[tokio::test]
    async fn test_get_steps_from_current_version() {
        let state = Arc::new(MemoryKeyValueState::<String>::default());
        state.store("gardener", &"v1.1.0".to_string()).await.unwrap();
        let component = component("1.3.4", state, &Log::default(), None);

        let steps = InstallationManager::default()
            .get_steps(&component)
            .await
            .unwrap();
        let names: Vec<&str> = steps.iter().map(|(_, s)| s.name()).collect();

        assert_eq!(names, vec!["gardener-v1.2.6", "gardener-v1.3.4"]);
    }

    #[tokio::test]
    async fn test_install_records_each_version() {
        let state = Arc::new(MemoryKeyValueState::<String>::default());
        state.store("gardener", &"v1.1.0".to_string()).await.unwrap();
        let log = Log::default();
        let component = component("1.4.2", state.clone(), &log, None);

        InstallationManager::new("gardener")
            .install(&component)
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["1.2.6", "1.3.5", "1.4.2"]);
        assert_eq!(state.get("gardener").await.unwrap(), "v1.4.2");
    }

    #[tokio::test]
    async fn test_install_failure_keeps_last_completed_version() {
        let state = Arc::new(MemoryKeyValueState::<String>::default());
        state.store("gardener", &"v1.1.0".to_string()).await.unwrap();
        let log = Log::default();
        let component = component("1.4.2", state.clone(), &log, Some(v("1.3.5")));

        let err = InstallationManager::new("gardener")
            .install(&component)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "gardener 1.3.5 unhealthy");
        assert_eq!(*log.lock().unwrap(), vec!["1.2.6"]);
        assert_eq!(state.get("gardener").await.unwrap(), "v1.2.6");
    }

    #[tokio::test]
    async fn test_nested_child_named_like_later_version_is_not_recorded() {
        let state = Arc::new(MemoryKeyValueState::<String>::default());
        state.store("gardener", &"v1.1.0".to_string()).await.unwrap();
        let component = VersionedComponent::new("gardener", v("1.3.4"), state.clone())
            .with_versions(catalog())
            .with_default_factory(|version| {
                let version = version.clone();
                let mut flow = Flow::new("gardener");
                flow.add_steps([
                    Step::task(FnTask::new("gardener-v1.3.4", || async { Ok(()) })),
                    Step::task(FnTask::new("rollout", move || {
                        let version = version.clone();
                        async move { Err::<(), _>(anyhow::anyhow!("gardener {version} rollout failed")) }
                    })),
                ])?;
                Ok(flow.into())
            });

        let err = InstallationManager::new("gardener")
            .install(&component)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "gardener 1.2.6 rollout failed");
        assert_eq!(state.get("gardener").await.unwrap(), "v1.1.0");
    }

    #[tokio::test]
    async fn test_install_nothing_to_do() {
        let state = Arc::new(MemoryKeyValueState::<String>::default());
        state.store("gardener", &"v1.4.2".to_string()).await.unwrap();
        let log = Log::default();
        // downgrade inside the same minor resolves to an empty path
        let component = component("1.4.0", state.clone(), &log, None);

        InstallationManager::default()
            .install(&component)
            .await
            .unwrap();

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(state.get("gardener").await.unwrap(), "v1.4.2");
    }

    #[tokio::test]
    async fn test_installation_task_in_parent_flow() {
        let state = Arc::new(MemoryKeyValueState::<String>::default());
        let log = Log::default();
        let component: Arc<dyn Component> =
            Arc::new(component("1.3.4", state.clone(), &log, None));

        let mut flow = Flow::new("landscape");
        flow.add_steps([Step::task(InstallationTask::new(component))])
            .unwrap();
        flow.execute(&()).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["1.3.4"]);
        assert_eq!(state.get("gardener").await.unwrap(), "v1.3.4");
    }
}
