use crate::scenario::{IterationOutcome, Workload};
use std::collections::HashMap;
use std::future::Future;

/// Named workloads that plan documents refer to through `exec`.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    workloads: HashMap<String, Workload>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `func` under `name`, replacing any earlier registration.
    ///
    /// # Example
    /// ```no_run
    /// use surge::Registry;
    ///
    /// async fn read_employees() {
    /// }
    ///
    /// let mut registry = Registry::new();
    /// registry.register("read_employees", read_employees);
    /// ```
    pub fn register<T, F>(&mut self, name: &str, func: T) -> &mut Self
    where
        T: Fn() -> F + Send + Sync + 'static,
        F: Future + Send + 'static,
        F::Output: IterationOutcome,
    {
        self.insert(name, Workload::new(func))
    }

    pub fn insert(&mut self, name: &str, workload: Workload) -> &mut Self {
        self.workloads.insert(name.to_string(), workload);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Workload> {
        self.workloads.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.workloads.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ok() {}

    async fn failing() -> Result<(), String> {
        Err("nope".to_string())
    }

    #[tokio::test]
    async fn registered_workloads_are_callable() {
        let mut registry = Registry::new();
        registry.register("ok", ok).register("failing", failing);

        let mut names: Vec<_> = registry.names().collect();
        names.sort();
        assert_eq!(names, ["failing", "ok"]);

        assert_eq!(registry.get("ok").unwrap().call().await, Ok(()));
        assert_eq!(
            registry.get("failing").unwrap().call().await,
            Err("nope".to_string())
        );
        assert!(registry.get("missing").is_none());
    }
}
