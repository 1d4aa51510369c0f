//! Watt kubehub: list+watch one GVK and republish the complete list of that
//! kind after every change.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

use futures::{Stream, StreamExt};
use kube::{
    api::Api,
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use tokio::sync::mpsc;
use watt_core::{KubernetesEvent, Resource};

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: String::new(),
            version: version.to_string(),
            kind: kind.to_string(),
        }),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Kind label used on the aggregator side: the lowercased kind, e.g. `configmap`.
pub fn kind_label(gvk: &GroupVersionKind) -> String {
    gvk.kind.to_ascii_lowercase()
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Convert a watched object into an aggregator resource, filling in `kind` when
/// the API omitted it.
pub fn resource_from(obj: &DynamicObject, kind: &str) -> Result<Resource> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    if raw.get("kind").map_or(true, |k| k.is_null()) {
        if let Some(o) = raw.as_object_mut() {
            o.insert("kind".into(), serde_json::Value::String(kind.to_string()));
        }
    }
    Ok(Resource::new(raw))
}

/// Current objects of one kind keyed by `namespace/name`.
#[derive(Debug, Default)]
pub struct KindCache {
    items: BTreeMap<String, Resource>,
    synced: bool,
}

impl KindCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once an initial list has been applied.
    pub fn synced(&self) -> bool {
        self.synced
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn apply(&mut self, r: Resource) {
        self.items.insert(r.key(), r);
    }

    pub fn delete(&mut self, r: &Resource) {
        self.items.remove(&r.key());
    }

    /// Replace everything with a fresh list; marks the cache synced.
    pub fn reset(&mut self, list: Vec<Resource>) {
        self.items = list.into_iter().map(|r| (r.key(), r)).collect();
        self.synced = true;
    }

    pub fn resources(&self) -> Vec<Resource> {
        self.items.values().cloned().collect()
    }
}

/// Fold one watcher event into the cache. Returns the full list to publish, or
/// `None` while the initial list has not arrived.
pub fn fold_event(cache: &mut KindCache, kind: &str, ev: Event<DynamicObject>) -> Result<Option<Vec<Resource>>> {
    match ev {
        Event::Applied(o) => cache.apply(resource_from(&o, kind)?),
        Event::Deleted(o) => cache.delete(&resource_from(&o, kind)?),
        Event::Restarted(list) => {
            debug!(count = list.len(), "watch restart");
            let items = list.iter().map(|o| resource_from(o, kind)).collect::<Result<Vec<_>>>()?;
            cache.reset(items);
        }
    }
    Ok(cache.synced().then(|| cache.resources()))
}

/// Start list+watch for a GVK key and send the complete list of that kind into
/// `tx` after the initial sync and after every change.
pub async fn start_watcher(gvk_key: &str, namespace: Option<&str>, tx: mpsc::Sender<KubernetesEvent>) -> Result<()> {
    let client = Client::try_default().await?;
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
    let label = kind_label(&gvk);

    let api: Api<DynamicObject> = if namespaced {
        match namespace {
            Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
            None => Api::all_with(client.clone(), &ar),
        }
    } else {
        Api::all_with(client.clone(), &ar)
    };

    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    info!(gvk = %gvk_key, ns = ?namespace, kind = %label, "watcher started");
    pump_watch(stream, &gvk.kind, &label, tx).await;
    Ok(())
}

/// Fold a watcher stream into full per-kind lists and forward them to `tx`.
/// Stream errors are logged and polling continues; the watcher re-lists on its
/// own. Returns when the stream ends or the intake closes.
pub async fn pump_watch<S, E>(stream: S, kind: &str, label: &str, tx: mpsc::Sender<KubernetesEvent>)
where
    S: Stream<Item = Result<Event<DynamicObject>, E>>,
    E: std::fmt::Display,
{
    futures::pin_mut!(stream);
    let mut cache = KindCache::new();
    while let Some(item) = stream.next().await {
        let ev = match item {
            Ok(ev) => ev,
            Err(e) => {
                warn!(kind = %label, error = %e, "watch error; continuing");
                metrics::counter!("watt_kube_watch_errors_total", 1u64, "kind" => label.to_string());
                continue;
            }
        };
        let resources = match fold_event(&mut cache, kind, ev) {
            Ok(Some(resources)) => resources,
            Ok(None) => continue,
            Err(e) => {
                warn!(kind = %label, error = ?e, "dropping unconvertible watch event");
                continue;
            }
        };
        debug!(kind = %label, count = cache.len(), "publishing kind list");
        metrics::counter!("watt_kube_lists_total", 1u64, "kind" => label.to_string());
        if tx.send(KubernetesEvent::new(label, resources)).await.is_err() {
            warn!(kind = %label, "aggregator intake closed; stopping watcher");
            return;
        }
    }
    warn!(kind = %label, "watcher stream ended");
}
