//! Desired child objects of a component.
//!
//! Only the shape the engine manages is produced here; the api server fills
//! in the rest and the applier keeps those defaults when it merges.

use crate::credentials::EndpointAuth;
use crate::crd::{Component, ComponentSpec, VMCluster, WorkloadKind, ALERTMANAGER_CONFIG_KEY};
use crate::errors::*;
use crate::scrape::{Endpoint, VMPodScrape, VMServiceScrape, VMServiceScrapeSpec};
use crate::selector::SelectorResolution;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Secret, SecretVolumeSource, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::ByteString;
use kube::ResourceExt;
use log::warn;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub const AGENT_CONFIG_KEY: &str = "scrape.yaml";
const AGENT_CONFIG_DIR: &str = "/etc/vmagent/config";
const ALERTMANAGER_CONFIG_DIR: &str = "/etc/alertmanager/config";
const DEFAULT_ALERTMANAGER_CONFIG: &str = "route:\n  receiver: blackhole\nreceivers:\n- name: blackhole\n";

/// Desired children of one component, grouped by kind.
#[derive(Default, Debug, Clone)]
pub struct Children {
    pub stateful_sets: Vec<StatefulSet>,
    pub deployments: Vec<Deployment>,
    pub services: Vec<Service>,
    pub scrapes: Vec<VMServiceScrape>,
    pub secrets: Vec<Secret>,
}

/// Values the engine resolved before synthesis.
#[derive(Default, Debug, Clone)]
pub struct Resolved {
    /// Generated vmagent scrape configuration.
    pub scrape_config: Option<String>,
    /// Digest of referenced configuration; changing it rolls the pods.
    pub config_checksum: Option<String>,
}

/// Sha256 over the length-prefixed parts, hex encoded. Stable across builds,
/// so pods only roll when the referenced configuration changes.
pub fn checksum(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn default_image(c: Component) -> &'static str {
    match c {
        Component::Storage => "victoriametrics/vmstorage:v1.93.0-cluster",
        Component::Select => "victoriametrics/vmselect:v1.93.0-cluster",
        Component::Insert => "victoriametrics/vminsert:v1.93.0-cluster",
        Component::Agent => "victoriametrics/vmagent:v1.93.0",
        Component::Alertmanager => "prom/alertmanager:v0.25.0",
    }
}

fn child_meta(cluster: &VMCluster, c: Component, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: cluster.namespace(),
        labels: Some(cluster.selector_labels(c)),
        owner_references: cluster.as_owner().map(|o| vec![o]),
        ..ObjectMeta::default()
    }
}

fn port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        ..ServicePort::default()
    }
}

fn cluster_native_port(spec: &ComponentSpec) -> Option<i32> {
    let raw = spec.cluster_native_port.as_ref()?;
    match raw.parse() {
        Ok(p) => Some(p),
        Err(_) => {
            warn!("ignoring clusterNativePort {:?}: not a port number", raw);
            None
        }
    }
}

fn agent_config_secret(cluster: &VMCluster) -> String {
    format!("{}-config", cluster.prefixed_name(Component::Agent))
}

fn alertmanager_config_secret(cluster: &VMCluster) -> String {
    cluster
        .spec
        .alertmanager
        .as_ref()
        .and_then(|a| a.config_secret.clone())
        .unwrap_or_else(|| format!("{}-config", cluster.prefixed_name(Component::Alertmanager)))
}

fn args(cluster: &VMCluster, c: Component, spec: &ComponentSpec) -> Vec<String> {
    let mut args = vec![];
    match c {
        Component::Storage => {
            args.push(format!("-httpListenAddr=:{}", c.http_port()));
            args.push("-vminsertAddr=:8400".to_string());
            args.push("-vmselectAddr=:8401".to_string());
            args.push("-storageDataPath=/vm-data".to_string());
        }
        Component::Select | Component::Insert => {
            args.push(format!("-httpListenAddr=:{}", c.http_port()));
            let storage_port = if c == Component::Select { 8401 } else { 8400 };
            let nodes = cluster.storage_nodes(storage_port);
            if !nodes.is_empty() {
                args.push(format!("-storageNode={}", nodes.join(",")));
            }
            if let Some(p) = cluster_native_port(spec) {
                args.push(format!("-clusternativeListenAddr=:{}", p));
            }
        }
        Component::Agent => {
            args.push(format!("-httpListenAddr=:{}", c.http_port()));
            args.push(format!(
                "-promscrape.config={}/{}",
                AGENT_CONFIG_DIR, AGENT_CONFIG_KEY
            ));
            if cluster.spec.insert.is_some() {
                args.push(format!(
                    "-remoteWrite.url=http://{}.{}.svc:{}/insert/0/prometheus/api/v1/write",
                    cluster.prefixed_name(Component::Insert),
                    cluster.namespace().unwrap_or_default(),
                    Component::Insert.http_port()
                ));
            }
        }
        Component::Alertmanager => {
            args.push(format!(
                "--config.file={}/{}",
                ALERTMANAGER_CONFIG_DIR, ALERTMANAGER_CONFIG_KEY
            ));
            args.push(format!("--web.listen-address=:{}", c.http_port()));
        }
    }
    for (k, v) in &spec.extra_args {
        args.push(format!("-{}={}", k, v));
    }
    args
}

fn pod_template(
    cluster: &VMCluster,
    c: Component,
    spec: &ComponentSpec,
    resolved: &Resolved,
) -> PodTemplateSpec {
    let mut volumes = vec![];
    let mut mounts = vec![];
    let config = match c {
        Component::Agent => Some((agent_config_secret(cluster), AGENT_CONFIG_DIR)),
        Component::Alertmanager => Some((alertmanager_config_secret(cluster), ALERTMANAGER_CONFIG_DIR)),
        _ => None,
    };
    if let Some((secret, dir)) = config {
        volumes.push(Volume {
            name: "config".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        });
        mounts.push(VolumeMount {
            name: "config".to_string(),
            mount_path: dir.to_string(),
            read_only: Some(true),
            ..VolumeMount::default()
        });
    }

    let container = Container {
        name: c.app_name().to_string(),
        image: Some(
            spec.image
                .clone()
                .unwrap_or_else(|| default_image(c).to_string()),
        ),
        args: Some(args(cluster, c, spec)),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: c.http_port(),
            ..ContainerPort::default()
        }]),
        volume_mounts: if mounts.is_empty() { None } else { Some(mounts) },
        ..Container::default()
    };

    let annotations = resolved.config_checksum.as_ref().map(|sum| {
        let mut a = BTreeMap::new();
        a.insert("checksum/config".to_string(), sum.clone());
        a
    });

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(cluster.selector_labels(c)),
            annotations,
            ..ObjectMeta::default()
        }),
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: if volumes.is_empty() { None } else { Some(volumes) },
            image_pull_secrets: if cluster.spec.image_pull_secrets.is_empty() {
                None
            } else {
                Some(cluster.spec.image_pull_secrets.clone())
            },
            ..PodSpec::default()
        }),
    }
}

fn services(cluster: &VMCluster, c: Component, spec: &ComponentSpec) -> Vec<Service> {
    let mut ports = vec![port("http", c.http_port())];
    match c {
        Component::Storage => {
            ports.push(port("vminsert", 8400));
            ports.push(port("vmselect", 8401));
        }
        Component::Select | Component::Insert => {
            if let Some(p) = cluster_native_port(spec) {
                ports.push(port("clusternative", p));
            }
        }
        _ => {}
    }

    let mut out = vec![];
    match &spec.service_spec {
        Some(extra) if extra.use_as_default => ports.extend(extra.ports.iter().cloned()),
        Some(extra) => {
            let name = extra
                .name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| format!("{}-additional-service", cluster.prefixed_name(c)));
            out.push(Service {
                metadata: child_meta(cluster, c, name),
                spec: Some(ServiceSpec {
                    type_: extra.type_.clone(),
                    selector: Some(cluster.selector_labels(c)),
                    ports: Some(extra.ports.clone()),
                    ..ServiceSpec::default()
                }),
                ..Service::default()
            });
        }
        None => {}
    }

    let headless = match c.workload() {
        WorkloadKind::StatefulSet => Some("None".to_string()),
        WorkloadKind::Deployment => None,
    };
    out.insert(
        0,
        Service {
            metadata: child_meta(cluster, c, cluster.prefixed_name(c)),
            spec: Some(ServiceSpec {
                cluster_ip: headless,
                selector: Some(cluster.selector_labels(c)),
                ports: Some(ports),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        },
    );
    out
}

fn config_secret(cluster: &VMCluster, c: Component, name: String, key: &str, body: &str) -> Secret {
    let mut data = BTreeMap::new();
    data.insert(key.to_string(), ByteString(body.as_bytes().to_vec()));
    Secret {
        metadata: child_meta(cluster, c, name),
        data: Some(data),
        ..Secret::default()
    }
}

/// Desired children of a component present in spec.
pub fn children(cluster: &VMCluster, c: Component, resolved: &Resolved) -> Children {
    let spec = match cluster.component(c) {
        Some(spec) => spec,
        None => return Children::default(),
    };
    let name = cluster.prefixed_name(c);
    let selector = LabelSelector {
        match_labels: Some(cluster.selector_labels(c)),
        ..LabelSelector::default()
    };
    let template = pod_template(cluster, c, spec, resolved);

    let mut out = Children::default();
    match c.workload() {
        WorkloadKind::StatefulSet => out.stateful_sets.push(StatefulSet {
            metadata: child_meta(cluster, c, name.clone()),
            spec: Some(StatefulSetSpec {
                replicas: Some(spec.replicas()),
                revision_history_limit: spec.revision_history_limit_count,
                selector: selector.clone(),
                service_name: name.clone(),
                template,
                ..StatefulSetSpec::default()
            }),
            ..StatefulSet::default()
        }),
        WorkloadKind::Deployment => out.deployments.push(Deployment {
            metadata: child_meta(cluster, c, name.clone()),
            spec: Some(DeploymentSpec {
                replicas: Some(spec.replicas()),
                revision_history_limit: spec.revision_history_limit_count,
                selector: selector.clone(),
                template,
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        }),
    }
    out.services = services(cluster, c, spec);

    let mut scrape = VMServiceScrape::new(
        &name,
        VMServiceScrapeSpec {
            selector,
            endpoints: vec![Endpoint {
                port: Some("http".to_string()),
                ..Endpoint::default()
            }],
            job_label: None,
        },
    );
    scrape.metadata = child_meta(cluster, c, name);
    out.scrapes.push(scrape);

    match c {
        Component::Agent => {
            let body = resolved.scrape_config.as_deref().unwrap_or_default();
            out.secrets.push(config_secret(
                cluster,
                c,
                agent_config_secret(cluster),
                AGENT_CONFIG_KEY,
                body,
            ));
        }
        Component::Alertmanager => {
            let user_supplied = cluster
                .spec
                .alertmanager
                .as_ref()
                .map_or(false, |a| a.config_secret.is_some());
            if !user_supplied {
                out.secrets.push(config_secret(
                    cluster,
                    c,
                    alertmanager_config_secret(cluster),
                    ALERTMANAGER_CONFIG_KEY,
                    DEFAULT_ALERTMANAGER_CONFIG,
                ));
            }
        }
        _ => {}
    }
    out
}

#[derive(Serialize)]
struct ScrapeFile {
    global: Global,
    scrape_configs: Vec<ScrapeJob>,
}

#[derive(Serialize)]
struct Global {
    scrape_interval: String,
}

#[derive(Serialize)]
struct ScrapeJob {
    job_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    scrape_interval: Option<String>,
    metrics_path: String,
    scheme: String,
    kubernetes_sd_configs: Vec<SdConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    basic_auth: Option<BasicAuthConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bearer_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls_config: Option<TlsConfigFile>,
    relabel_configs: Vec<Relabel>,
}

#[derive(Serialize)]
struct SdConfig {
    role: String,
    namespaces: SdNamespaces,
}

#[derive(Serialize)]
struct SdNamespaces {
    names: Vec<String>,
}

#[derive(Serialize)]
struct BasicAuthConfig {
    username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<String>,
}

#[derive(Serialize)]
struct TlsConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    ca: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_name: Option<String>,
    insecure_skip_verify: bool,
}

#[derive(Serialize)]
struct Relabel {
    action: String,
    source_labels: Vec<String>,
    regex: String,
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Job name for the `idx`th endpoint of a scrape object; also the key of its
/// resolved credentials.
pub fn job_name(kind: &str, key: &str, idx: usize) -> String {
    format!("{}/{}/{}", kind, key, idx)
}

#[allow(clippy::too_many_arguments)]
fn job(
    name: String,
    namespace: &str,
    role: &str,
    label_prefix: &str,
    port_label: &str,
    selector: &LabelSelector,
    endpoint: &Endpoint,
    auth: Option<&EndpointAuth>,
) -> ScrapeJob {
    let mut relabel_configs: Vec<Relabel> = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| Relabel {
            action: "keep".to_string(),
            source_labels: vec![format!("{}{}", label_prefix, sanitize(k))],
            regex: v.clone(),
        })
        .collect();
    if let Some(p) = &endpoint.port {
        relabel_configs.push(Relabel {
            action: "keep".to_string(),
            source_labels: vec![port_label.to_string()],
            regex: p.clone(),
        });
    }
    let EndpointAuth {
        username,
        password,
        bearer_token,
        ca,
    } = auth.cloned().unwrap_or_default();
    ScrapeJob {
        job_name: name,
        scrape_interval: endpoint.interval.clone(),
        metrics_path: endpoint.path.clone().unwrap_or_else(|| "/metrics".to_string()),
        scheme: endpoint.scheme.clone().unwrap_or_else(|| "http".to_string()),
        kubernetes_sd_configs: vec![SdConfig {
            role: role.to_string(),
            namespaces: SdNamespaces {
                names: vec![namespace.to_string()],
            },
        }],
        basic_auth: username.map(|username| BasicAuthConfig { username, password }),
        bearer_token,
        tls_config: endpoint.tls_config.as_ref().map(|tls| TlsConfigFile {
            ca,
            server_name: tls.server_name.clone(),
            insecure_skip_verify: tls.insecure_skip_verify,
        }),
        relabel_configs,
    }
}

/// Renders the vmagent scrape configuration for the selected scrape objects.
/// `auth` is keyed by [`job_name`].
pub fn scrape_config(
    service_scrapes: &SelectorResolution<VMServiceScrape>,
    pod_scrapes: &SelectorResolution<VMPodScrape>,
    auth: &BTreeMap<String, EndpointAuth>,
) -> Result<String> {
    let mut jobs = vec![];
    for (key, scrape) in service_scrapes {
        let ns = scrape.namespace().unwrap_or_default();
        for (i, endpoint) in scrape.spec.endpoints.iter().enumerate() {
            let name = job_name("serviceScrape", key, i);
            let a = auth.get(&name);
            jobs.push(job(
                name,
                &ns,
                "endpoints",
                "__meta_kubernetes_service_label_",
                "__meta_kubernetes_endpoint_port_name",
                &scrape.spec.selector,
                endpoint,
                a,
            ));
        }
    }
    for (key, scrape) in pod_scrapes {
        let ns = scrape.namespace().unwrap_or_default();
        for (i, endpoint) in scrape.spec.pod_metrics_endpoints.iter().enumerate() {
            let name = job_name("podScrape", key, i);
            let a = auth.get(&name);
            jobs.push(job(
                name,
                &ns,
                "pod",
                "__meta_kubernetes_pod_label_",
                "__meta_kubernetes_pod_container_port_name",
                &scrape.spec.selector,
                endpoint,
                a,
            ));
        }
    }
    let file = ScrapeFile {
        global: Global {
            scrape_interval: "30s".to_string(),
        },
        scrape_configs: jobs,
    };
    Ok(serde_yaml::to_string(&file)?)
}
