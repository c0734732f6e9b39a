//! Converges the live children of a component onto their desired bodies.
//!
//! Children are matched by `namespace/name`. The desired body is merged onto
//! the live one, so fields the platform filled in (cluster IPs, defaulted
//! container fields, resource versions) survive, and an update is only sent
//! when the merge actually changes something.
//!
//! Every write records the shape of what the engine set in the
//! [`APPLIED_FIELDS`] annotation. A field recorded there but no longer
//! desired is removed on the next update.

use crate::errors::*;
use crate::scrape::VMServiceScrape;
use crate::store::{kind_of, object_key, Object, ObjectStore};
use crate::synth::Children;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::ResourceExt;
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::BTreeMap;

/// Annotation holding the field set of the engine's last write.
pub const APPLIED_FIELDS: &str = "operator.victoriametrics.com/applied-fields";

/// Outcome of converging one or more kinds of children.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub failures: Vec<Error>,
}

impl ApplyReport {
    pub fn merge(&mut self, other: ApplyReport) {
        self.created.extend(other.created);
        self.updated.extend(other.updated);
        self.deleted.extend(other.deleted);
        self.failures.extend(other.failures);
    }

    pub fn writes(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    /// Whether `kind namespace/name` was created or updated.
    pub fn changed(&self, kind: &str, key: &str) -> bool {
        let id = format!("{} {}", kind, key);
        self.created.contains(&id) || self.updated.contains(&id)
    }

    /// First failure that retrying will not fix.
    pub fn hard_failure(&self) -> Option<&Error> {
        self.failures.iter().find(|e| !e.is_retryable())
    }
}

/// Live objects of kind `K` carrying every owner label and, when the owner
/// has a uid, an owner reference to it.
pub async fn owned_children<K: Object, S: ObjectStore>(
    store: &S,
    namespace: &str,
    owner_uid: Option<&str>,
    labels: &BTreeMap<String, String>,
) -> Result<Vec<K>> {
    let live = store.list::<K>(namespace).await?;
    Ok(live
        .into_iter()
        .filter(|obj| {
            let has_labels = labels.iter().all(|(k, v)| obj.labels().get(k) == Some(v));
            let owned = match owner_uid {
                Some(uid) => obj.owner_references().iter().any(|o| o.uid == uid),
                None => true,
            };
            has_labels && owned
        })
        .collect())
}

/// Recursively overlays `desired` onto `live`. Objects merge per key, arrays
/// of equal length merge per element, anything else is replaced. A null in
/// `desired` leaves the live field alone; the api server never stores nulls.
pub fn merge_onto(live: &mut Value, desired: &Value) {
    match (live, desired) {
        (Value::Object(l), Value::Object(d)) => {
            for (k, dv) in d {
                if dv.is_null() {
                    continue;
                }
                match l.get_mut(k) {
                    Some(lv) => merge_onto(lv, dv),
                    None => {
                        l.insert(k.clone(), dv.clone());
                    }
                }
            }
        }
        (Value::Array(l), Value::Array(d)) if l.len() == d.len() => {
            for (lv, dv) in l.iter_mut().zip(d) {
                merge_onto(lv, dv);
            }
        }
        (l, d) => *l = d.clone(),
    }
}

/// Keys and array lengths of `v`; every scalar becomes `true`, nulls are
/// dropped. Values are left out so Secret data never lands in an annotation.
pub fn field_set(v: &Value) -> Value {
    match v {
        Value::Object(o) => Value::Object(
            o.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), field_set(v)))
                .collect(),
        ),
        Value::Array(a) => Value::Array(a.iter().map(field_set).collect()),
        _ => Value::Bool(true),
    }
}

/// Stamps `obj` with the fields it sets.
pub fn annotate_fields<K: Object>(obj: &mut K) -> Result<()> {
    let mut body = serde_json::to_value(&*obj)?;
    if let Some(o) = body.as_object_mut() {
        o.remove("status");
    }
    let fields = serde_json::to_string(&field_set(&body))?;
    obj.annotations_mut().insert(APPLIED_FIELDS.to_string(), fields);
    Ok(())
}

fn applied_fields(live: &Value) -> Option<Value> {
    let raw = live["metadata"]["annotations"][APPLIED_FIELDS].as_str()?;
    serde_json::from_str(raw).ok()
}

/// Removes from `merged` what `applied` records and `desired` no longer sets.
fn prune(merged: &mut Value, applied: &Value, desired: &Value) {
    match (merged, applied) {
        (Value::Object(m), Value::Object(a)) => {
            for (k, av) in a {
                match desired.get(k).filter(|d| !d.is_null()) {
                    None => {
                        m.remove(k);
                    }
                    Some(dv) => {
                        if let Some(mv) = m.get_mut(k) {
                            prune(mv, av, dv);
                        }
                    }
                }
            }
        }
        (Value::Array(m), Value::Array(a)) => {
            if let Some(d) = desired.as_array() {
                if m.len() == d.len() && a.len() == d.len() {
                    for ((mv, av), dv) in m.iter_mut().zip(a).zip(d) {
                        prune(mv, av, dv);
                    }
                }
            }
        }
        _ => {}
    }
}

/// Body to send when `desired` differs from `live` in fields the engine owns.
pub fn updated_body(live: &Value, desired: &Value) -> Option<Value> {
    let mut desired = desired.clone();
    if let Some(obj) = desired.as_object_mut() {
        obj.remove("status");
    }
    let mut merged = live.clone();
    merge_onto(&mut merged, &desired);
    if let Some(applied) = applied_fields(live) {
        prune(&mut merged, &applied, &desired);
    }
    if merged == *live {
        None
    } else {
        Some(merged)
    }
}

fn apply_error(kind: &str, key: &str, cause: Error) -> Error {
    Error::with_chain(cause, ErrorKind::Apply(kind.to_string(), key.to_string()))
}

/// Creates, updates and deletes children of kind `K` until the live set
/// equals `desired`. Every object is handled on its own: a failure is
/// recorded and the remaining objects are still applied.
pub async fn converge<K: Object, S: ObjectStore>(
    store: &S,
    namespace: &str,
    owner_uid: Option<&str>,
    labels: &BTreeMap<String, String>,
    desired: Vec<K>,
) -> ApplyReport {
    let kind = kind_of::<K>();
    let mut report = ApplyReport::default();

    let live = match owned_children::<K, S>(store, namespace, owner_uid, labels).await {
        Ok(live) => live,
        Err(e) => {
            report
                .failures
                .push(apply_error(&kind, &format!("{}/*", namespace), e));
            return report;
        }
    };
    let mut live: BTreeMap<String, K> = live.into_iter().map(|o| (object_key(&o), o)).collect();

    for mut obj in desired {
        let key = format!("{}/{}", namespace, obj.name_any());
        let id = format!("{} {}", kind, key);
        if let Err(e) = annotate_fields(&mut obj) {
            report.failures.push(apply_error(&kind, &key, e));
            live.remove(&key);
            continue;
        }
        match live.remove(&key) {
            None => match store.create(namespace, &obj).await {
                Ok(_) => {
                    info!("created {}", id);
                    report.created.push(id);
                }
                Err(e) => report.failures.push(apply_error(&kind, &key, e)),
            },
            Some(current) => {
                let res = match (serde_json::to_value(&current), serde_json::to_value(&obj)) {
                    (Ok(l), Ok(d)) => match updated_body(&l, &d) {
                        None => Ok(false),
                        Some(body) => match serde_json::from_value::<K>(body) {
                            Ok(body) => store.replace(namespace, &body).await.map(|_| true),
                            Err(e) => Err(e.into()),
                        },
                    },
                    (Err(e), _) | (_, Err(e)) => Err(e.into()),
                };
                match res {
                    Ok(true) => {
                        info!("updated {}", id);
                        report.updated.push(id);
                    }
                    Ok(false) => debug!("{} is up to date", id),
                    Err(e) => report.failures.push(apply_error(&kind, &key, e)),
                }
            }
        }
    }

    // whatever is left is live but no longer desired
    for (key, obj) in live {
        let id = format!("{} {}", kind, key);
        match store.delete::<K>(namespace, &obj.name_any()).await {
            Ok(()) => {
                info!("deleted {}", id);
                report.deleted.push(id);
            }
            Err(e) => report.failures.push(apply_error(&kind, &key, e)),
        }
    }

    for e in &report.failures {
        warn!("{}", e);
    }
    report
}

/// Converges every child kind of one component. An empty `Children` removes
/// all of them.
pub async fn converge_children<S: ObjectStore>(
    store: &S,
    namespace: &str,
    owner_uid: Option<&str>,
    labels: &BTreeMap<String, String>,
    children: Children,
) -> ApplyReport {
    let mut report = ApplyReport::default();
    report.merge(converge::<Secret, S>(store, namespace, owner_uid, labels, children.secrets).await);
    report.merge(
        converge::<StatefulSet, S>(store, namespace, owner_uid, labels, children.stateful_sets)
            .await,
    );
    report.merge(
        converge::<Deployment, S>(store, namespace, owner_uid, labels, children.deployments).await,
    );
    report.merge(converge::<Service, S>(store, namespace, owner_uid, labels, children.services).await);
    report.merge(
        converge::<VMServiceScrape, S>(store, namespace, owner_uid, labels, children.scrapes)
            .await,
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use serde_json::json;

    fn labels() -> BTreeMap<String, String> {
        vec![("app.kubernetes.io/name".to_string(), "vmselect".to_string())]
            .into_iter()
            .collect()
    }

    fn service(name: &str, ports: &[i32]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(labels()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "operator.victoriametrics.com/v1beta1".to_string(),
                    kind: "VMCluster".to_string(),
                    name: "main".to_string(),
                    uid: "owner".to_string(),
                    controller: Some(true),
                    ..OwnerReference::default()
                }]),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(
                    ports
                        .iter()
                        .map(|p| ServicePort {
                            port: *p,
                            ..ServicePort::default()
                        })
                        .collect(),
                ),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    #[test]
    fn merge_keeps_live_only_fields() {
        let mut live = json!({"spec": {"clusterIP": "10.0.0.1", "ports": [{"port": 80, "protocol": "TCP"}]}});
        let desired = json!({"spec": {"ports": [{"port": 81}]}});
        merge_onto(&mut live, &desired);
        assert_eq!(
            live,
            json!({"spec": {"clusterIP": "10.0.0.1", "ports": [{"port": 81, "protocol": "TCP"}]}})
        );
    }

    #[test]
    fn merge_replaces_arrays_of_different_length() {
        let mut live = json!({"args": ["-a", "-b"]});
        merge_onto(&mut live, &json!({"args": ["-a"]}));
        assert_eq!(live, json!({"args": ["-a"]}));
    }

    #[test]
    fn nulls_do_not_count_as_changes() {
        let live = json!({"spec": {"selector": {}, "endpoints": [{"port": "http"}]}});
        let desired = json!({"spec": {"selector": {}, "jobLabel": null, "endpoints": [{"port": "http", "path": null}]}});
        assert_eq!(updated_body(&live, &desired), None);
    }

    #[test]
    fn no_update_when_desired_is_subset_of_live() {
        let live = json!({"metadata": {"resourceVersion": "3"}, "spec": {"clusterIP": "10.0.0.1"}, "status": {}});
        let desired = json!({"spec": {}, "status": {"ignored": true}});
        assert_eq!(updated_body(&live, &desired), None);
    }

    #[tokio::test]
    async fn second_pass_is_a_noop() {
        let store = MemoryStore::new();
        let desired = vec![service("vmselect-main", &[8481]), service("extra", &[9000])];

        let first = converge(&store, "default", Some("owner"), &labels(), desired.clone()).await;
        assert_eq!(first.created.len(), 2);
        assert!(first.failures.is_empty());
        // the platform assigned a cluster ip meanwhile
        let live: Service = store.peek("default", "vmselect-main").unwrap();
        assert!(live.spec.unwrap().cluster_ip.is_some());

        store.reset_calls();
        let second = converge(&store, "default", Some("owner"), &labels(), desired).await;
        assert_eq!(second.writes(), 0);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn dropped_field_is_removed_from_live() {
        let store = MemoryStore::new();
        let mut node_port = service("svc", &[80]);
        node_port.spec.as_mut().unwrap().type_ = Some("NodePort".to_string());
        converge(&store, "default", Some("owner"), &labels(), vec![node_port]).await;

        let report =
            converge(&store, "default", Some("owner"), &labels(), vec![service("svc", &[80])]).await;
        assert_eq!(report.updated, vec!["Service default/svc".to_string()]);
        let after: Service = store.peek("default", "svc").unwrap();
        let spec = after.spec.unwrap();
        assert_eq!(spec.type_, None);
        // assigned by the platform, never recorded as ours
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.96.0.10"));

        store.reset_calls();
        converge(&store, "default", Some("owner"), &labels(), vec![service("svc", &[80])]).await;
        assert_eq!(store.writes(), 0);
    }

    #[test]
    fn applied_fields_keep_no_values() {
        let mut secret = Secret::default();
        secret.metadata.name = Some("vmagent-main-config".to_string());
        let mut data = BTreeMap::new();
        data.insert(
            "scrape.yaml".to_string(),
            k8s_openapi::ByteString(b"password: hunter2".to_vec()),
        );
        secret.data = Some(data);
        annotate_fields(&mut secret).unwrap();
        let fields = &secret.annotations()[APPLIED_FIELDS];
        assert!(!fields.contains("hunter2"));
        let parsed: Value = serde_json::from_str(fields).unwrap();
        assert_eq!(parsed["data"], json!({"scrape.yaml": true}));
        assert_eq!(parsed["metadata"]["name"], json!(true));
    }

    #[tokio::test]
    async fn updates_changed_fields_and_keeps_cluster_ip() {
        let store = MemoryStore::new();
        converge(&store, "default", Some("owner"), &labels(), vec![service("svc", &[80])]).await;
        let before: Service = store.peek("default", "svc").unwrap();
        let report =
            converge(&store, "default", Some("owner"), &labels(), vec![service("svc", &[80, 81])])
                .await;
        assert_eq!(report.updated, vec!["Service default/svc".to_string()]);
        assert!(report.changed("Service", "default/svc"));
        let after: Service = store.peek("default", "svc").unwrap();
        assert_eq!(after.spec.as_ref().unwrap().ports.as_ref().unwrap().len(), 2);
        assert_eq!(
            after.spec.unwrap().cluster_ip,
            before.spec.unwrap().cluster_ip
        );
    }

    #[tokio::test]
    async fn deletes_undesired_and_ignores_foreign_objects() {
        let store = MemoryStore::new();
        converge(
            &store,
            "default",
            Some("owner"),
            &labels(),
            vec![service("keep", &[80]), service("drop", &[80])],
        )
        .await;
        let mut foreign = service("foreign", &[80]);
        foreign.metadata.owner_references = None;
        store.insert(&foreign);

        let report =
            converge(&store, "default", Some("owner"), &labels(), vec![service("keep", &[80])])
                .await;
        assert_eq!(report.deleted, vec!["Service default/drop".to_string()]);
        let mut names = store.names::<Service>("default");
        names.sort();
        assert_eq!(names, vec!["foreign", "keep"]);
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_siblings() {
        let store = MemoryStore::new();
        store.fail::<Service>("create", "a", 422);
        let report = converge(
            &store,
            "default",
            Some("owner"),
            &labels(),
            vec![service("a", &[80]), service("b", &[80])],
        )
        .await;
        assert_eq!(report.created, vec!["Service default/b".to_string()]);
        assert_eq!(report.failures.len(), 1);
        match report.failures[0].kind() {
            ErrorKind::Apply(kind, key) => {
                assert_eq!(kind, "Service");
                assert_eq!(key, "default/a");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(report.hard_failure().is_some());
    }

    #[tokio::test]
    async fn conflicts_are_retryable() {
        let store = MemoryStore::new();
        converge(&store, "default", Some("owner"), &labels(), vec![service("a", &[80])]).await;
        store.fail::<Service>("replace", "a", 409);
        let report =
            converge(&store, "default", Some("owner"), &labels(), vec![service("a", &[81])]).await;
        assert_eq!(report.failures.len(), 1);
        assert!(report.hard_failure().is_none());
    }
}
