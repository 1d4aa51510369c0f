#![allow(dead_code)]

use std::time::Duration;

use tokio::sync::mpsc;
use watt_aggregator::{Aggregator, AggregatorConfig, Intake, RunningAggregator};
use watt_core::{Endpoint, Endpoints, KubernetesEvent, Resource};

pub struct Isolator {
    pub intake: Intake,
    pub snapshots: mpsc::Receiver<String>,
    pub watches: mpsc::Receiver<Vec<Resource>>,
    pub running: RunningAggregator,
}

impl Isolator {
    /// Outputs are buffered since nothing reads them concurrently; intakes hold a single event.
    pub fn start(required_kinds: &[&str]) -> Self {
        let (snap_tx, snapshots) = mpsc::channel(100);
        let (watch_tx, watches) = mpsc::channel(100);
        let config = AggregatorConfig {
            intake_capacity: 1,
            ..AggregatorConfig::with_required_kinds(required_kinds.iter().copied())
        };
        let (agg, intake) = Aggregator::new(config, snap_tx, watch_tx);
        let running = agg.start();
        Self { intake, snapshots, watches, running }
    }

    pub async fn kube(&self, kind: &str, resources: Vec<Resource>) {
        self.intake.kubernetes.send(KubernetesEvent::new(kind, resources)).await.expect("kubernetes intake open");
    }

    pub async fn consul(&self, eps: Endpoints) {
        self.intake.consul.send(eps).await.expect("consul intake open");
    }

    /// Wait until the aggregator has processed `n` events in total.
    pub async fn processed(&self, n: u64) {
        let mut stats = self.running.stats();
        tokio::time::timeout(
            Duration::from_secs(2),
            stats.wait_for(|s| s.kubernetes_events + s.consul_events >= n),
        )
        .await
        .expect("timed out waiting for events to be processed")
        .expect("stats channel closed");
    }

    pub fn drain_snapshots(&mut self) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(s) = self.snapshots.try_recv() {
            out.push(serde_json::from_str(&s).expect("snapshot is json"));
        }
        out
    }
}

pub async fn next<T>(rx: &mut mpsc::Receiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for output")
        .expect("output channel closed")
}

pub async fn expect_silence<T: std::fmt::Debug>(rx: &mut mpsc::Receiver<T>, ms: u64) {
    if let Ok(v) = tokio::time::timeout(Duration::from_millis(ms), rx.recv()).await {
        panic!("expected no output within {}ms, got {:?}", ms, v);
    }
}

pub fn service(name: &str) -> Resource {
    Resource::new(serde_json::json!({
        "kind": "Service",
        "apiVersion": "v1",
        "metadata": { "name": name },
        "spec": {
            "selector": { "pod": name },
            "ports": [{ "protocol": "TCP", "port": 80, "targetPort": 80 }],
        },
    }))
}

pub fn resolver(name: &str, target: &str) -> Resource {
    Resource::new(serde_json::json!({
        "kind": "ConfigMap",
        "apiVersion": "v1",
        "metadata": {
            "name": name,
            "annotations": { "getambassador.io/consul-resolver": "true" },
        },
        "data": {
            "consulAddress": "127.0.0.1:8500",
            "datacenter": "dc1",
            "service": target,
        },
    }))
}

pub fn endpoints(service: &str, addrs: &[(&str, u16)]) -> Endpoints {
    Endpoints::new(
        service,
        addrs
            .iter()
            .map(|(a, p)| Endpoint { service: service.to_string(), address: a.to_string(), port: *p, tags: vec![] })
            .collect(),
    )
}
