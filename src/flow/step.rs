//! Step: the unit of sequencing inside a flow.

use super::{Flow, StepInfo, Task};

/// Either a leaf task or a nested flow that runs as one block.
pub enum Step {
    Task(TaskStep),
    Flow(Flow),
}

/// A task together with the name it is reported under.
///
/// The name starts as the task's own name and can be rewritten per
/// instantiation (e.g. `gardener-v1.62.3`) without touching the task.
pub struct TaskStep {
    name: String,
    task: Box<dyn Task>,
}

impl TaskStep {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task(&self) -> &dyn Task {
        self.task.as_ref()
    }
}

impl Step {
    pub fn task(task: impl Task + 'static) -> Self {
        Self::boxed(Box::new(task))
    }

    pub fn boxed(task: Box<dyn Task>) -> Self {
        Self::Task(TaskStep {
            name: task.name().to_string(),
            task,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Task(t) => &t.name,
            Self::Flow(f) => f.name(),
        }
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        match self {
            Self::Task(t) => t.name = name.into(),
            Self::Flow(f) => f.set_name(name),
        }
    }

    pub fn info(&self) -> StepInfo {
        match self {
            Self::Task(t) => StepInfo::leaf(&t.name),
            Self::Flow(f) => f.step_info(),
        }
    }
}

impl From<Flow> for Step {
    fn from(flow: Flow) -> Self {
        Self::Flow(flow)
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task(t) => f.debug_tuple("Task").field(&t.name).finish(),
            Self::Flow(flow) => f.debug_tuple("Flow").field(&flow.name()).finish(),
        }
    }
}
