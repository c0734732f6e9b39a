//! In-memory [`ObjectStore`] used by unit tests. Mimics the parts of the api
//! server the engine relies on and counts every call.

use super::{kind_of, Object, ObjectStore};
use crate::errors::*;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::core::ErrorResponse;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

type Key = (String, String, String);

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<Key, Value>>,
    namespaces: Mutex<Vec<Namespace>>,
    calls: Mutex<HashMap<(String, String), usize>>,
    // (op, kind, namespace-or-name) triples that answer with an api error
    failures: Mutex<HashMap<(String, String, String), u16>>,
    next_uid: Mutex<u64>,
}

fn api_error(code: u16, message: String) -> Error {
    let reason = match code {
        403 => "Forbidden",
        404 => "NotFound",
        409 => "Conflict",
        _ => "InternalError",
    };
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
    .into()
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn add_namespace(&self, name: &str, labels: &[(&str, &str)]) {
        let ns: Namespace = serde_json::from_value(json!({
            "metadata": {
                "name": name,
                "labels": labels.iter().cloned().collect::<BTreeMap<_, _>>(),
            }
        }))
        .unwrap();
        self.namespaces.lock().unwrap().push(ns);
    }

    /// Stores an object as-is, bypassing counters.
    pub fn insert<K: Object>(&self, obj: &K) {
        let value = serde_json::to_value(obj).unwrap();
        let ns = obj.meta().namespace.clone().unwrap_or_default();
        let name = obj.meta().name.clone().unwrap_or_default();
        self.objects
            .lock()
            .unwrap()
            .insert((kind_of::<K>(), ns, name), value);
    }

    pub fn peek<K: Object>(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&(kind_of::<K>(), namespace.to_string(), name.to_string()))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    pub fn names<K: Object>(&self, namespace: &str) -> Vec<String> {
        let kind = kind_of::<K>();
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(k, ns, _)| *k == kind && ns == namespace)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// Overwrites the status block of a stored object, as a workload
    /// controller would.
    pub fn set_status<K: Object>(&self, namespace: &str, name: &str, status: Value) {
        let mut objects = self.objects.lock().unwrap();
        let key = (kind_of::<K>(), namespace.to_string(), name.to_string());
        let obj = objects.get_mut(&key).expect("object to update exists");
        obj["status"] = status;
    }

    /// Makes `op` on `kind` fail with `code`. `target` is the namespace for
    /// `list` and the object name for everything else.
    pub fn fail<K: Object>(&self, op: &str, target: &str, code: u16) {
        self.failures.lock().unwrap().insert(
            (op.to_string(), kind_of::<K>(), target.to_string()),
            code,
        );
    }

    pub fn calls(&self, op: &str, kind: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&(op.to_string(), kind.to_string()))
            .cloned()
            .unwrap_or(0)
    }

    pub fn writes(&self) -> usize {
        let calls = self.calls.lock().unwrap();
        calls
            .iter()
            .filter(|((op, _), _)| op == "create" || op == "replace" || op == "delete")
            .map(|(_, n)| *n)
            .sum()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, op: &str, kind: &str, target: &str) -> Result<()> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry((op.to_string(), kind.to_string()))
            .or_insert(0) += 1;
        let failures = self.failures.lock().unwrap();
        match failures.get(&(op.to_string(), kind.to_string(), target.to_string())) {
            Some(code) => Err(api_error(
                *code,
                format!("{} {} {} rejected", op, kind, target),
            )),
            None => Ok(()),
        }
    }

    fn uid(&self) -> String {
        let mut next = self.next_uid.lock().unwrap();
        *next += 1;
        format!("uid-{}", next)
    }
}

/// RFC 7386 merge patch, as the api server applies `Patch::Merge`.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let patch = match patch.as_object() {
        Some(p) => p,
        None => {
            *target = patch.clone();
            return;
        }
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Some(t) = target.as_object_mut() {
        for (k, v) in patch {
            if v.is_null() {
                t.remove(k);
            } else {
                merge_patch(t.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

fn spec_of(v: &Value) -> Value {
    let mut v = v.clone();
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
        obj.remove("metadata");
    }
    v
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let kind = kind_of::<K>();
        self.record("get", &kind, name)?;
        let objects = self.objects.lock().unwrap();
        match objects.get(&(kind, namespace.to_string(), name.to_string())) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    async fn list<K: Object>(&self, namespace: &str) -> Result<Vec<K>> {
        let kind = kind_of::<K>();
        self.record("list", &kind, namespace)?;
        let objects = self.objects.lock().unwrap();
        let mut out = vec![];
        for ((k, ns, _), v) in objects.iter() {
            if *k == kind && ns == namespace {
                out.push(serde_json::from_value(v.clone())?);
            }
        }
        Ok(out)
    }

    async fn namespaces(&self) -> Result<Vec<Namespace>> {
        self.record("list", "Namespace", "")?;
        Ok(self.namespaces.lock().unwrap().clone())
    }

    async fn create<K: Object>(&self, namespace: &str, obj: &K) -> Result<K> {
        let kind = kind_of::<K>();
        let name = obj.meta().name.clone().unwrap_or_default();
        self.record("create", &kind, &name)?;
        let key = (kind.clone(), namespace.to_string(), name.clone());
        if self.objects.lock().unwrap().contains_key(&key) {
            return Err(api_error(409, format!("{} {} already exists", kind, name)));
        }
        let mut v = serde_json::to_value(obj)?;
        v["metadata"]["namespace"] = json!(namespace);
        v["metadata"]["uid"] = json!(self.uid());
        v["metadata"]["resourceVersion"] = json!("1");
        v["metadata"]["generation"] = json!(1);
        if kind == "Service" && v["spec"].get("clusterIP").is_none() {
            v["spec"]["clusterIP"] = json!("10.96.0.10");
        }
        self.objects.lock().unwrap().insert(key, v.clone());
        Ok(serde_json::from_value(v)?)
    }

    async fn replace<K: Object>(&self, namespace: &str, obj: &K) -> Result<K> {
        let kind = kind_of::<K>();
        let name = obj.meta().name.clone().unwrap_or_default();
        self.record("replace", &kind, &name)?;
        let key = (kind.clone(), namespace.to_string(), name.clone());
        let mut objects = self.objects.lock().unwrap();
        let live = match objects.get(&key) {
            Some(live) => live.clone(),
            None => return Err(api_error(404, format!("{} {} not found", kind, name))),
        };
        let mut v = serde_json::to_value(obj)?;
        if v["metadata"]["resourceVersion"] != live["metadata"]["resourceVersion"] {
            return Err(api_error(409, format!("{} {} was modified", kind, name)));
        }
        let version: u64 = live["metadata"]["resourceVersion"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        v["metadata"]["resourceVersion"] = json!((version + 1).to_string());
        let mut generation = live["metadata"]["generation"].as_i64().unwrap_or(1);
        if spec_of(&v) != spec_of(&live) {
            generation += 1;
        }
        v["metadata"]["generation"] = json!(generation);
        v["status"] = live["status"].clone();
        if v["status"].is_null() {
            if let Some(o) = v.as_object_mut() {
                o.remove("status");
            }
        }
        objects.insert(key, v.clone());
        Ok(serde_json::from_value(v)?)
    }

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<()> {
        let kind = kind_of::<K>();
        self.record("delete", &kind, name)?;
        self.objects
            .lock()
            .unwrap()
            .remove(&(kind, namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn patch_status<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        status: Value,
    ) -> Result<()> {
        let kind = kind_of::<K>();
        self.record("patch_status", &kind, name)?;
        let mut objects = self.objects.lock().unwrap();
        match objects.get_mut(&(kind.clone(), namespace.to_string(), name.to_string())) {
            Some(obj) => {
                merge_patch(&mut obj["status"], &status);
                Ok(())
            }
            None => Err(api_error(404, format!("{} {} not found", kind, name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::merge_patch;
    use serde_json::json;

    #[test]
    fn merge_patch_drops_nulls_and_keeps_unmentioned_keys() {
        let mut status = json!({"phase": "expanding", "components": {"vmselect": {"phase": "expanding"}, "vmstorage": {"phase": "expanding"}}});
        merge_patch(
            &mut status,
            &json!({"phase": "operational", "reason": null, "components": {"vmselect": null}}),
        );
        assert_eq!(
            status,
            json!({"phase": "operational", "components": {"vmstorage": {"phase": "expanding"}}})
        );
    }
}
