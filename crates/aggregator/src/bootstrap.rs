//! Bootstrap tracking: has every required kind and every required service been seen once?

use std::collections::BTreeSet;

use rustc_hash::FxHashSet;

/// Tracks observations of kinds and services. Observations are never forgotten.
#[derive(Debug, Clone, Default)]
pub struct BootstrapTracker {
    required_kinds: BTreeSet<String>,
    seen_kinds: FxHashSet<String>,
    seen_services: FxHashSet<String>,
}

impl BootstrapTracker {
    pub fn new<I, S>(required_kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required_kinds: required_kinds.into_iter().map(Into::into).collect(),
            seen_kinds: FxHashSet::default(),
            seen_services: FxHashSet::default(),
        }
    }

    pub fn required_kinds(&self) -> &BTreeSet<String> {
        &self.required_kinds
    }

    pub fn observe_kind(&mut self, kind: &str) {
        if !self.seen_kinds.contains(kind) {
            self.seen_kinds.insert(kind.to_string());
        }
    }

    /// A service counts as observed on its first endpoint event, empty or not,
    /// whether or not it is required yet.
    pub fn observe_service(&mut self, service: &str) {
        if !self.seen_services.contains(service) {
            self.seen_services.insert(service.to_string());
        }
    }

    pub fn ready(&self, required_services: &BTreeSet<String>) -> bool {
        self.required_kinds.iter().all(|k| self.seen_kinds.contains(k))
            && required_services.iter().all(|s| self.seen_services.contains(s))
    }

    pub fn missing_kinds(&self) -> Vec<&str> {
        self.required_kinds
            .iter()
            .filter(|k| !self.seen_kinds.contains(*k))
            .map(String::as_str)
            .collect()
    }

    pub fn missing_services<'a>(&self, required_services: &'a BTreeSet<String>) -> Vec<&'a str> {
        required_services
            .iter()
            .filter(|s| !self.seen_services.contains(*s))
            .map(String::as_str)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_requirements_are_ready() {
        let t = BootstrapTracker::new(Vec::<String>::new());
        assert!(t.ready(&BTreeSet::new()));
    }

    #[test]
    fn waits_for_every_required_kind() {
        let mut t = BootstrapTracker::new(["service", "configmap"]);
        assert!(!t.ready(&BTreeSet::new()));
        t.observe_kind("service");
        assert!(!t.ready(&BTreeSet::new()));
        assert_eq!(t.missing_kinds(), vec!["configmap"]);
        t.observe_kind("configmap");
        t.observe_kind("configmap");
        assert!(t.ready(&BTreeSet::new()));
        assert!(t.missing_kinds().is_empty());
    }

    #[test]
    fn services_observed_early_still_count() {
        let mut t = BootstrapTracker::new(["configmap"]);
        t.observe_kind("configmap");
        t.observe_service("bar");
        assert!(t.ready(&set(&["bar"])));
        assert!(!t.ready(&set(&["bar", "baz"])));
        assert_eq!(t.missing_services(&set(&["bar", "baz"])), vec!["baz"]);
    }

    #[test]
    fn dropped_service_does_not_block() {
        let mut t = BootstrapTracker::new(Vec::<String>::new());
        assert!(!t.ready(&set(&["gone"])));
        assert!(t.ready(&set(&[])));
        t.observe_service("other");
        assert!(t.ready(&set(&["other"])));
    }
}
