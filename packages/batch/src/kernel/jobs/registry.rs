//! Registry of job definitions and their factories.

use std::collections::HashMap;
use std::sync::Arc;

use super::definition::JobDefinition;
use super::runtime::BatchJob;

type JobFactory = Arc<dyn Fn() -> Box<dyn BatchJob> + Send + Sync>;

/// One registered job: its static definition plus a factory producing a
/// fresh body instance per execution.
#[derive(Clone)]
pub struct RegisteredJob {
    pub definition: JobDefinition,
    factory: JobFactory,
}

impl RegisteredJob {
    pub fn instantiate(&self) -> Box<dyn BatchJob> {
        (self.factory)()
    }
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<String, RegisteredJob>,
    order: Vec<String>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition; the last registration of an id wins.
    pub fn register<F>(&mut self, definition: JobDefinition, factory: F)
    where
        F: Fn() -> Box<dyn BatchJob> + Send + Sync + 'static,
    {
        let id = definition.id.clone();
        if !self.jobs.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.jobs.insert(
            id,
            RegisteredJob {
                definition,
                factory: Arc::new(factory),
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<&RegisteredJob> {
        self.jobs.get(id)
    }

    /// Definitions in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredJob> {
        self.order.iter().filter_map(|id| self.jobs.get(id))
    }

    /// Definitions sorted by priority rank, then registration order. This is
    /// the queueing order for `run-all`; priorities never preempt.
    pub fn by_priority(&self) -> Vec<&RegisteredJob> {
        let mut jobs: Vec<&RegisteredJob> = self.iter().collect();
        jobs.sort_by_key(|j| j.definition.priority.rank());
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::BatchError;
    use crate::kernel::jobs::definition::{JobPriority, Trigger};
    use crate::kernel::jobs::runtime::{JobContext, JobMetrics};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Noop;

    #[async_trait]
    impl crate::kernel::jobs::BatchJob for Noop {
        fn job_type(&self) -> &'static str {
            "noop"
        }

        async fn execute(&self, _ctx: &JobContext) -> Result<JobMetrics, BatchError> {
            Ok(JobMetrics::default())
        }
    }

    fn definition(id: &str, priority: JobPriority) -> JobDefinition {
        JobDefinition::builder()
            .id(id)
            .name(id)
            .trigger(Trigger::Interval(Duration::from_secs(60)))
            .priority(priority)
            .build()
    }

    #[test]
    fn lookup_by_id_and_instantiate() {
        let mut registry = JobRegistry::new();
        registry.register(definition("a", JobPriority::Normal), || Box::new(Noop));

        let job = registry.get("a").unwrap();
        assert_eq!(job.instantiate().job_type(), "noop");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn by_priority_orders_critical_first() {
        let mut registry = JobRegistry::new();
        registry.register(definition("low", JobPriority::Low), || Box::new(Noop));
        registry.register(definition("crit", JobPriority::Critical), || Box::new(Noop));
        registry.register(definition("normal", JobPriority::Normal), || Box::new(Noop));

        let ids: Vec<&str> = registry
            .by_priority()
            .iter()
            .map(|j| j.definition.id.as_str())
            .collect();
        assert_eq!(ids, vec!["crit", "normal", "low"]);
    }

    #[test]
    fn re_registration_replaces_the_definition() {
        let mut registry = JobRegistry::new();
        registry.register(definition("a", JobPriority::Low), || Box::new(Noop));
        registry.register(definition("a", JobPriority::High), || Box::new(Noop));

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("a").unwrap().definition.priority.rank(),
            JobPriority::High.rank()
        );
    }
}
