//! Label + namespace selector resolution.
//!
//! Resolution is two staged: the namespace selector narrows the namespaces a
//! component may look into, then the label selector picks objects inside
//! those namespaces. Both stages are pure; [`resolve`] composes them against
//! an [`ObjectStore`].

use crate::crd::AgentSpec;
use crate::errors::*;
use crate::scrape::{VMPodScrape, VMServiceScrape};
use crate::store::{kind_of, object_key, Object, ObjectStore};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use log::debug;
use std::collections::BTreeMap;

/// Matched objects keyed by `namespace/name`.
pub type SelectorResolution<K> = BTreeMap<String, K>;

/// An empty selector matches everything.
pub fn label_selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(wanted) = &selector.match_labels {
        if !wanted.iter().all(|(k, v)| labels.get(k) == Some(v)) {
            return false;
        }
    }
    let exprs = match &selector.match_expressions {
        Some(exprs) => exprs,
        None => return true,
    };
    exprs.iter().all(|req| {
        let values = req.values.as_deref().unwrap_or_default();
        let current = labels.get(&req.key);
        match req.operator.as_str() {
            "In" => current.map_or(false, |v| values.contains(v)),
            "NotIn" => current.map_or(true, |v| !values.contains(v)),
            "Exists" => current.is_some(),
            "DoesNotExist" => current.is_none(),
            _ => false,
        }
    })
}

/// Stage one. Without a namespace selector the scope is the owner's own
/// namespace; an empty selector admits every listed namespace.
pub fn allowed_namespaces(
    own_namespace: &str,
    namespace_selector: Option<&LabelSelector>,
    namespaces: &[Namespace],
) -> Vec<String> {
    let selector = match namespace_selector {
        Some(s) => s,
        None => return vec![own_namespace.to_string()],
    };
    namespaces
        .iter()
        .filter(|ns| label_selector_matches(selector, ns.labels()))
        .map(|ns| ns.name_any())
        .collect()
}

/// Stage two.
pub fn select_objects<K: Object>(
    label_selector: &LabelSelector,
    candidates: Vec<K>,
) -> SelectorResolution<K> {
    candidates
        .into_iter()
        .filter(|obj| label_selector_matches(label_selector, obj.labels()))
        .map(|obj| (object_key(&obj), obj))
        .collect()
}

/// Resolves a selector pair. Both selectors absent selects nothing; a
/// namespace selector without a label selector selects every object of the
/// admitted namespaces. A failed list fails the whole resolution.
pub async fn resolve<K: Object, S: ObjectStore>(
    store: &S,
    own_namespace: &str,
    label_selector: Option<&LabelSelector>,
    namespace_selector: Option<&LabelSelector>,
) -> Result<SelectorResolution<K>> {
    let label_selector = match (label_selector, namespace_selector) {
        (None, None) => return Ok(SelectorResolution::new()),
        (Some(s), _) => s.clone(),
        (None, Some(_)) => LabelSelector::default(),
    };

    let namespaces = match namespace_selector {
        Some(_) => {
            let all = store
                .namespaces()
                .await
                .chain_err(|| ErrorKind::Selection("Namespace".to_string(), String::new()))?;
            allowed_namespaces(own_namespace, namespace_selector, &all)
        }
        None => allowed_namespaces(own_namespace, None, &[]),
    };

    let mut candidates = vec![];
    for ns in &namespaces {
        let objs = store
            .list::<K>(ns)
            .await
            .chain_err(|| ErrorKind::Selection(kind_of::<K>(), ns.clone()))?;
        candidates.extend(objs);
    }
    let selected = select_objects(&label_selector, candidates);
    debug!(
        "selected {} {} from {} namespaces",
        selected.len(),
        kind_of::<K>(),
        namespaces.len()
    );
    Ok(selected)
}

pub async fn select_service_scrapes<S: ObjectStore>(
    store: &S,
    own_namespace: &str,
    agent: &AgentSpec,
) -> Result<SelectorResolution<VMServiceScrape>> {
    resolve(
        store,
        own_namespace,
        agent.service_scrape_selector.as_ref(),
        agent.service_scrape_namespace_selector.as_ref(),
    )
    .await
}

pub async fn select_pod_scrapes<S: ObjectStore>(
    store: &S,
    own_namespace: &str,
    agent: &AgentSpec,
) -> Result<SelectorResolution<VMPodScrape>> {
    resolve(
        store,
        own_namespace,
        agent.pod_scrape_selector.as_ref(),
        agent.pod_scrape_namespace_selector.as_ref(),
    )
    .await
}
