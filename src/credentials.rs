//! Secret and ConfigMap key lookups.
//!
//! A [`CredentialCache`] lives for exactly one reconcile pass. It caches whole
//! objects, so several keys of the same Secret cost a single fetch.

use crate::errors::*;
use crate::scrape::Endpoint;
use crate::store::ObjectStore;
use k8s_openapi::api::core::v1::{ConfigMap, ConfigMapKeySelector, Secret, SecretKeySelector};
use log::trace;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    Secret,
    ConfigMap,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialKind::Secret => f.write_str("Secret"),
            CredentialKind::ConfigMap => f.write_str("ConfigMap"),
        }
    }
}

type ObjectData = BTreeMap<String, String>;

#[derive(Default, Debug)]
pub struct CredentialCache {
    objects: HashMap<(CredentialKind, String, String), ObjectData>,
}

impl CredentialCache {
    pub fn new() -> Self {
        CredentialCache::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

fn secret_data(secret: Secret) -> ObjectData {
    let mut data: ObjectData = secret
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
        .collect();
    data.extend(secret.string_data.unwrap_or_default());
    data
}

fn config_map_data(cm: ConfigMap) -> ObjectData {
    let mut data: ObjectData = cm
        .binary_data
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
        .collect();
    data.extend(cm.data.unwrap_or_default());
    data
}

async fn fetch<S: ObjectStore>(
    store: &S,
    kind: CredentialKind,
    namespace: &str,
    name: &str,
) -> Result<Option<ObjectData>> {
    let data = match kind {
        CredentialKind::Secret => store
            .get::<Secret>(namespace, name)
            .await?
            .map(secret_data),
        CredentialKind::ConfigMap => store
            .get::<ConfigMap>(namespace, name)
            .await?
            .map(config_map_data),
    };
    Ok(data)
}

/// Returns the value stored under `key` of the named Secret or ConfigMap.
pub async fn resolve<S: ObjectStore>(
    store: &S,
    cache: &mut CredentialCache,
    kind: CredentialKind,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<String> {
    let cache_key = (kind, namespace.to_string(), name.to_string());
    if !cache.objects.contains_key(&cache_key) {
        trace!("fetching {} {}/{}", kind, namespace, name);
        match fetch(store, kind, namespace, name).await? {
            Some(data) => {
                cache.objects.insert(cache_key.clone(), data);
            }
            None => bail!(ErrorKind::MissingObject(
                kind.to_string(),
                namespace.to_string(),
                name.to_string()
            )),
        }
    }
    match cache.objects.get(&cache_key).and_then(|data| data.get(key)) {
        Some(value) => Ok(value.clone()),
        None => bail!(ErrorKind::MissingKey(
            kind.to_string(),
            namespace.to_string(),
            name.to_string(),
            key.to_string()
        )),
    }
}

fn tolerate_optional(res: Result<String>, optional: Option<bool>) -> Result<Option<String>> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(Error(ErrorKind::MissingObject(..), _)) | Err(Error(ErrorKind::MissingKey(..), _))
            if optional.unwrap_or(false) =>
        {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// `None` only when the selector is marked optional and the value is absent.
pub async fn secret_key<S: ObjectStore>(
    store: &S,
    cache: &mut CredentialCache,
    namespace: &str,
    sel: &SecretKeySelector,
) -> Result<Option<String>> {
    let name = sel.name.as_deref().unwrap_or_default();
    let res = resolve(store, cache, CredentialKind::Secret, namespace, name, &sel.key).await;
    tolerate_optional(res, sel.optional)
}

pub async fn config_map_key<S: ObjectStore>(
    store: &S,
    cache: &mut CredentialCache,
    namespace: &str,
    sel: &ConfigMapKeySelector,
) -> Result<Option<String>> {
    let name = sel.name.as_deref().unwrap_or_default();
    let res = resolve(store, cache, CredentialKind::ConfigMap, namespace, name, &sel.key).await;
    tolerate_optional(res, sel.optional)
}

/// Resolved authentication material of one scrape endpoint.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EndpointAuth {
    pub username: Option<String>,
    pub password: Option<String>,
    pub bearer_token: Option<String>,
    pub ca: Option<String>,
}

/// Resolves every credential reference of a scrape endpoint, relative to the
/// namespace of the scrape object that declares it.
pub async fn endpoint_auth<S: ObjectStore>(
    store: &S,
    cache: &mut CredentialCache,
    namespace: &str,
    endpoint: &Endpoint,
) -> Result<EndpointAuth> {
    let mut auth = EndpointAuth::default();
    if let Some(basic) = &endpoint.basic_auth {
        if let Some(sel) = &basic.username {
            auth.username = secret_key(store, cache, namespace, sel).await?;
        }
        if let Some(sel) = &basic.password {
            auth.password = secret_key(store, cache, namespace, sel).await?;
        }
    }
    if let Some(sel) = &endpoint.bearer_token_secret {
        auth.bearer_token = secret_key(store, cache, namespace, sel).await?;
    }
    if let Some(tls) = &endpoint.tls_config {
        if let Some(sel) = &tls.ca_secret {
            auth.ca = secret_key(store, cache, namespace, sel).await?;
        } else if let Some(sel) = &tls.ca_config_map {
            auth.ca = config_map_key(store, cache, namespace, sel).await?;
        }
    }
    Ok(auth)
}
