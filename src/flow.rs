//! Sequential flow execution engine.
//!
//! A [`Flow`] runs its [`Step`]s strictly in insertion order. Nested flows run
//! to completion before the parent continues. The first failing task aborts its
//! own flow and every enclosing one; nothing is rolled back.

pub mod step;
pub mod task;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{Instrument, error, info, info_span};

use crate::error::LsiError;

pub use step::{Step, TaskStep};
#[cfg(test)]
pub use task::FnTask;
pub use task::Task;

/// Receives a notification after each step has finished successfully.
///
/// Consumers use this for post-commit side effects such as persisting the last
/// installed version. It is never called for a step that failed, and only the
/// direct steps of the executed flow are reported: a nested flow is reported
/// once as a whole, its own children are not.
#[async_trait]
pub trait StepListener: Send + Sync {
    async fn completed(&self, step: &str) -> Result<()>;
}

#[async_trait]
impl StepListener for () {
    async fn completed(&self, _step: &str) -> Result<()> {
        Ok(())
    }
}

/// Read-only mirror of a flow used for dry-run reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StepInfo>,
}

impl StepInfo {
    pub fn leaf(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
        }
    }

    /// Render the tree as indented lines, one step per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let name = if self.name.is_empty() {
            "(flow)"
        } else {
            &self.name
        };
        out.push_str(&"  ".repeat(depth));
        out.push_str("- ");
        out.push_str(name);
        out.push('\n');
        for child in &self.children {
            child.render_into(out, depth + 1);
        }
    }
}

/// Ordered, append-only list of steps.
#[derive(Default)]
pub struct Flow {
    name: String,
    steps: Vec<Step>,
    started: bool,
}

impl Flow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            started: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Append steps. Fails once execution has started.
    pub fn add_steps(&mut self, steps: impl IntoIterator<Item = Step>) -> Result<()> {
        if self.started {
            return Err(LsiError::FlowStarted(self.name.clone()).into());
        }
        self.steps.extend(steps);
        Ok(())
    }

    pub fn step_info(&self) -> StepInfo {
        StepInfo {
            name: self.name.clone(),
            children: self.steps.iter().map(Step::info).collect(),
        }
    }

    /// Run every step in order, reporting each successful top-level step to
    /// `listener`.
    pub fn execute<'a>(
        &'a mut self,
        listener: &'a dyn StepListener,
    ) -> BoxFuture<'a, Result<()>> {
        self.started = true;
        let span = info_span!("flow", flow = %self.name);
        async move {
            info!("Starting execution flow with {} steps", self.steps.len());
            for step in &mut self.steps {
                match step {
                    Step::Task(t) => run_task(t).await?,
                    Step::Flow(nested) => nested.execute(&()).await?,
                }
                listener.completed(step.name()).await?;
            }
            Ok(())
        }
        .instrument(span)
        .boxed()
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("started", &self.started)
            .finish()
    }
}

async fn run_task(step: &TaskStep) -> Result<()> {
    info!(task = step.name(), "Start executing {}", step.name());
    if let Err(e) = step.task().run().await {
        error!(task = step.name(), "Failed executing {}: {:#}", step.name(), e);
        return Err(e);
    }
    info!(task = step.name(), "Successfully executed {}", step.name());
    Ok(())
}
