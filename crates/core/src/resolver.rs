//! Resolver extraction: which external services must be endpoint-watched.
//!
//! A resolver is a predicate over a generic [`Resource`]: a marker annotation plus
//! a field naming the target service. New resolver flavours plug in through
//! [`ServiceResolver`] without touching the aggregator.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use crate::{Resource, ResourceTable};

/// Annotation marking a ConfigMap as a Consul resolver.
pub const CONSUL_RESOLVER_ANNOTATION: &str = "getambassador.io/consul-resolver";

/// Recognises resolver-bearing resources and names the service they reference.
pub trait ServiceResolver: Send + Sync {
    /// `Some(service)` when the resource qualifies, `None` otherwise. Never fails.
    fn target_service(&self, resource: &Resource) -> Option<String>;
}

/// Marker annotation + dotted path to the service name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationResolver {
    marker: String,
    service_path: Vec<String>,
}

impl AnnotationResolver {
    pub fn new(marker: impl Into<String>, service_path: &str) -> Self {
        Self {
            marker: marker.into(),
            service_path: service_path.split('.').filter(|s| !s.is_empty()).map(str::to_string).collect(),
        }
    }

    /// ConfigMap annotated `getambassador.io/consul-resolver: "true"` with `data.service`.
    pub fn consul() -> Self {
        Self::new(CONSUL_RESOLVER_ANNOTATION, "data.service")
    }

    fn marked(&self, resource: &Resource) -> bool {
        match resource.annotation(&self.marker) {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
            _ => false,
        }
    }
}

impl ServiceResolver for AnnotationResolver {
    fn target_service(&self, resource: &Resource) -> Option<String> {
        if !self.marked(resource) {
            return None;
        }
        let path: Vec<&str> = self.service_path.iter().map(String::as_str).collect();
        let svc = resource.get_path(&path)?.as_str()?.trim();
        if svc.is_empty() { None } else { Some(svc.to_string()) }
    }
}

/// Ordered set of resolvers consulted for every resource.
pub struct Resolvers {
    inner: Vec<Box<dyn ServiceResolver>>,
}

impl Resolvers {
    pub fn empty() -> Self {
        Self { inner: Vec::new() }
    }

    pub fn with(mut self, r: impl ServiceResolver + 'static) -> Self {
        self.inner.push(Box::new(r));
        self
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// First matching resolver wins.
    pub fn target_service(&self, resource: &Resource) -> Option<String> {
        self.inner.iter().find_map(|r| r.target_service(resource))
    }
}

impl Default for Resolvers {
    fn default() -> Self {
        Self::empty().with(AnnotationResolver::consul())
    }
}

impl std::fmt::Debug for Resolvers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolvers").field("len", &self.inner.len()).finish()
    }
}

/// Service names referenced by resolver-bearing resources across every kind.
pub fn required_services(tables: &ResourceTable, resolvers: &Resolvers) -> BTreeSet<String> {
    tables
        .values()
        .flatten()
        .filter_map(|r| resolvers.target_service(r))
        .collect()
}

/// The resolver-bearing resources themselves, in kind then table order.
pub fn watch_list(tables: &ResourceTable, resolvers: &Resolvers) -> Vec<Resource> {
    tables
        .values()
        .flatten()
        .filter(|r| resolvers.target_service(r).is_some())
        .cloned()
        .collect()
}
