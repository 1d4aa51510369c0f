//! Watt core types: cluster resources, mesh endpoints and merged snapshots.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod resolver;

pub use resolver::{required_services, watch_list, AnnotationResolver, Resolvers, ServiceResolver};

/// Resource tables keyed by kind, as held by the aggregator.
pub type ResourceTable = BTreeMap<String, Vec<Resource>>;

/// Endpoint tables keyed by service name.
pub type EndpointTable = BTreeMap<String, Endpoints>;

/// Opaque cluster resource. Only a handful of well-known fields are ever read;
/// everything else is carried through to snapshots untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(transparent)]
pub struct Resource(pub serde_json::Value);

impl Resource {
    pub fn new(raw: serde_json::Value) -> Self {
        Self(raw)
    }

    pub fn kind(&self) -> Option<&str> {
        self.0.get("kind").and_then(|v| v.as_str())
    }

    /// `metadata.name`, empty when absent.
    pub fn name(&self) -> &str {
        self.get_path(&["metadata", "name"]).and_then(|v| v.as_str()).unwrap_or("")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.get_path(&["metadata", "namespace"]).and_then(|v| v.as_str())
    }

    pub fn annotation(&self, key: &str) -> Option<&serde_json::Value> {
        self.get_path(&["metadata", "annotations", key])
    }

    /// Walk nested objects by key. Returns `None` on the first missing segment.
    pub fn get_path(&self, path: &[&str]) -> Option<&serde_json::Value> {
        let mut cur = &self.0;
        for seg in path {
            cur = cur.get(*seg)?;
        }
        Some(cur)
    }

    /// `namespace/name` (or just `name` for cluster-scoped objects).
    pub fn key(&self) -> String {
        match self.namespace() {
            Some(ns) if !ns.is_empty() => format!("{}/{}", ns, self.name()),
            _ => self.name().to_string(),
        }
    }
}

impl From<serde_json::Value> for Resource {
    fn from(v: serde_json::Value) -> Self {
        Self(v)
    }
}

/// One network endpoint of an external (mesh) service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Endpoint {
    pub service: String,
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Full current endpoint list for one service. An endpoint event carries exactly one of these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Endpoints {
    pub service: String,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl Endpoints {
    pub fn new(service: impl Into<String>, endpoints: Vec<Endpoint>) -> Self {
        Self { service: service.into(), endpoints }
    }
}

/// Complete current resource list for one kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct KubernetesEvent {
    pub kind: String,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl KubernetesEvent {
    pub fn new(kind: impl Into<String>, resources: Vec<Resource>) -> Self {
        Self { kind: kind.into(), resources }
    }
}

/// Input event as carried by line-oriented feeds (replay files, stdin).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum WattEvent {
    Kubernetes(KubernetesEvent),
    Consul(Endpoints),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ConsulSnapshot {
    pub endpoints: EndpointTable,
}

/// Merged point-in-time view of both sources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Snapshot {
    pub kubernetes: ResourceTable,
    pub consul: ConsulSnapshot,
}

impl Snapshot {
    /// Copy the current tables into a new snapshot.
    pub fn assemble(resources: &ResourceTable, endpoints: &EndpointTable) -> Self {
        Self {
            kubernetes: resources.clone(),
            consul: ConsulSnapshot { endpoints: endpoints.clone() },
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_accessors_tolerate_missing_fields() {
        let r = Resource::new(serde_json::json!({ "kind": "Service" }));
        assert_eq!(r.kind(), Some("Service"));
        assert_eq!(r.name(), "");
        assert_eq!(r.namespace(), None);
        assert!(r.annotation("x").is_none());
        assert_eq!(r.key(), "");

        let r = Resource::new(serde_json::json!({ "metadata": { "name": "foo", "namespace": "default" } }));
        assert_eq!(r.key(), "default/foo");
    }

    #[test]
    fn snapshot_json_layout_is_stable() {
        let mut resources = ResourceTable::new();
        resources.insert(
            "service".into(),
            vec![Resource::new(serde_json::json!({ "kind": "Service", "metadata": { "name": "foo" } }))],
        );
        let mut endpoints = EndpointTable::new();
        endpoints.insert(
            "bar".into(),
            Endpoints::new(
                "bar",
                vec![Endpoint { service: "bar".into(), address: "1.2.3.4".into(), port: 80, tags: vec![] }],
            ),
        );
        let json = Snapshot::assemble(&resources, &endpoints).to_json().unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["Kubernetes"]["service"][0]["metadata"]["name"], "foo");
        assert_eq!(v["Consul"]["Endpoints"]["bar"]["Service"], "bar");
        assert_eq!(v["Consul"]["Endpoints"]["bar"]["Endpoints"][0]["Address"], "1.2.3.4");
        assert_eq!(v["Consul"]["Endpoints"]["bar"]["Endpoints"][0]["Port"], 80);
    }

    #[test]
    fn watt_event_lines_parse() {
        let k: WattEvent = serde_json::from_str(
            r#"{"source":"kubernetes","kind":"service","resources":[{"metadata":{"name":"foo"}}]}"#,
        )
        .unwrap();
        match k {
            WattEvent::Kubernetes(ev) => {
                assert_eq!(ev.kind, "service");
                assert_eq!(ev.resources[0].name(), "foo");
            }
            other => panic!("unexpected {:?}", other),
        }
        let c: WattEvent = serde_json::from_str(
            r#"{"source":"consul","Service":"bar","Endpoints":[{"Service":"bar","Address":"1.2.3.4","Port":80}]}"#,
        )
        .unwrap();
        assert_eq!(
            c,
            WattEvent::Consul(Endpoints::new(
                "bar",
                vec![Endpoint { service: "bar".into(), address: "1.2.3.4".into(), port: 80, tags: vec![] }]
            ))
        );
    }
}
