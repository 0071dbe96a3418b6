use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub accumulated_seconds: u64,
}

impl Task {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            accumulated_seconds: 0,
        }
    }
}

/// In-memory list of trackable tasks, owned by the coordinator.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Vec<Task>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an incoming id list into the registry.
    ///
    /// Ids already tracked keep their accumulated time, unseen ids start at
    /// zero and ids missing from `incoming` are dropped. The incoming order
    /// becomes the registry order; repeated ids collapse to their first
    /// occurrence.
    pub fn reconcile<I, S>(&mut self, incoming: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut previous: HashMap<String, u64> = self
            .tasks
            .drain(..)
            .map(|task| (task.id, task.accumulated_seconds))
            .collect();
        let mut seen = HashSet::new();

        for id in incoming {
            let id = id.as_ref();
            if !seen.insert(id.to_string()) {
                continue;
            }
            self.tasks.push(Task {
                accumulated_seconds: previous.remove(id).unwrap_or(0),
                ..Task::new(id)
            });
        }
    }

    pub fn find_index_by_id(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|task| task.id == id)
    }

    pub fn get(&self, index: usize) -> Option<&Task> {
        self.tasks.get(index)
    }

    pub fn tick(&mut self, index: usize) {
        if let Some(task) = self.tasks.get_mut(index) {
            task.accumulated_seconds += 1;
        }
    }

    pub fn reset_duration(&mut self, index: usize) {
        if let Some(task) = self.tasks.get_mut(index) {
            task.accumulated_seconds = 0;
        }
    }

    /// "Total worked" across every tracked task
    pub fn total_accumulated_seconds(&self) -> u64 {
        self.tasks.iter().map(|task| task.accumulated_seconds).sum()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry_with(ids: &[&str]) -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.reconcile(ids.iter().copied());
        registry
    }

    #[test]
    fn reconcile_creates_unseen_tasks_at_zero() {
        let registry = registry_with(&["A", "B"]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(0), Some(&Task::new("A")));
        assert_eq!(registry.get(1), Some(&Task::new("B")));
    }

    #[test]
    fn reconcile_preserves_durations_of_surviving_ids() {
        let mut registry = registry_with(&["A", "B", "C"]);
        for _ in 0..5 {
            registry.tick(0);
        }
        for _ in 0..7 {
            registry.tick(2);
        }

        registry.reconcile(["C", "D", "A"]);

        assert_eq!(registry.len(), 3);
        let a = registry.find_index_by_id("A").unwrap();
        let c = registry.find_index_by_id("C").unwrap();
        let d = registry.find_index_by_id("D").unwrap();
        assert_eq!(registry.get(a).unwrap().accumulated_seconds, 5);
        assert_eq!(registry.get(c).unwrap().accumulated_seconds, 7);
        assert_eq!(registry.get(d).unwrap().accumulated_seconds, 0);
        assert_eq!(registry.find_index_by_id("B"), None);
    }

    #[test]
    fn reconcile_follows_incoming_order() {
        let mut registry = registry_with(&["A", "B"]);
        registry.reconcile(["B", "A"]);
        assert_eq!(registry.find_index_by_id("B"), Some(0));
        assert_eq!(registry.find_index_by_id("A"), Some(1));
    }

    #[test]
    fn reconcile_collapses_repeated_ids() {
        let mut registry = registry_with(&["A"]);
        registry.tick(0);
        registry.reconcile(["A", "B", "A"]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(0).unwrap().accumulated_seconds, 1);
        assert_eq!(registry.total_accumulated_seconds(), 1);
    }

    #[test]
    fn reconcile_with_empty_list_clears_registry() {
        let mut registry = registry_with(&["A", "B"]);
        registry.reconcile(Vec::<String>::new());
        assert!(registry.is_empty());
        assert_eq!(registry.total_accumulated_seconds(), 0);
    }

    #[test]
    fn invalid_indices_are_ignored() {
        let mut registry = registry_with(&["A"]);
        registry.tick(3);
        registry.reset_duration(3);
        assert_eq!(registry.get(3), None);
        assert_eq!(registry.total_accumulated_seconds(), 0);
    }

    #[test]
    fn reset_duration_only_touches_one_task() {
        let mut registry = registry_with(&["A", "B"]);
        registry.tick(0);
        registry.tick(1);
        registry.tick(1);
        registry.reset_duration(1);
        assert_eq!(registry.get(0).unwrap().accumulated_seconds, 1);
        assert_eq!(registry.get(1).unwrap().accumulated_seconds, 0);
        assert_eq!(registry.total_accumulated_seconds(), 1);
    }
}
