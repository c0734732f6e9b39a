use crate::rollout::{ComponentStatus, Phase};
use k8s_openapi::api::core::v1::{ConfigMapKeySelector, LocalObjectReference, ServicePort};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference, Time};
use kube::{Resource, ResourceExt};
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const GROUP: &str = "operator.victoriametrics.com";
pub const MANAGED_BY: &str = "vm-operator";

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[kube(
    group = "operator.victoriametrics.com",
    version = "v1beta1",
    kind = "VMCluster",
    status = "VMClusterStatus",
    shortname = "vmc",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VMClusterSpec {
    /// Stops every mutation of child objects; status keeps being reported.
    #[serde(default)]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<LocalObjectReference>,
    #[serde(rename = "vmstorage", skip_serializing_if = "Option::is_none")]
    pub storage: Option<ComponentSpec>,
    #[serde(rename = "vmselect", skip_serializing_if = "Option::is_none")]
    pub select: Option<ComponentSpec>,
    #[serde(rename = "vminsert", skip_serializing_if = "Option::is_none")]
    pub insert: Option<ComponentSpec>,
    #[serde(rename = "vmagent", skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentSpec>,
    #[serde(rename = "vmalertmanager", skip_serializing_if = "Option::is_none")]
    pub alertmanager: Option<AlertmanagerSpec>,
}

/// Parameters shared by every sub-component.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    pub replica_count: Option<i32>,
    pub revision_history_limit_count: Option<i32>,
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_args: BTreeMap<String, String>,
    pub service_spec: Option<AdditionalServiceSpec>,
    /// Only meaningful for vmselect and vminsert.
    pub cluster_native_port: Option<String>,
}

impl ComponentSpec {
    pub fn replicas(&self) -> i32 {
        self.replica_count.unwrap_or(1)
    }
}

/// An extra Service exposing the component, or extra ports merged into the
/// default one when `useAsDefault` is set.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalServiceSpec {
    pub name: Option<String>,
    #[serde(default)]
    pub use_as_default: bool,
    #[serde(rename = "type")]
    pub type_: Option<String>,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    #[serde(flatten)]
    pub common: ComponentSpec,
    pub service_scrape_selector: Option<LabelSelector>,
    pub service_scrape_namespace_selector: Option<LabelSelector>,
    pub pod_scrape_selector: Option<LabelSelector>,
    pub pod_scrape_namespace_selector: Option<LabelSelector>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerSpec {
    #[serde(flatten)]
    pub common: ComponentSpec,
    /// Secret holding `alertmanager.yaml`.
    pub config_secret: Option<String>,
    pub tls_ca_config_map: Option<ConfigMapKeySelector>,
}

pub const ALERTMANAGER_CONFIG_KEY: &str = "alertmanager.yaml";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VMClusterStatus {
    /// Least ready phase across the components present in spec.
    pub phase: Option<Phase>,
    pub reason: Option<String>,
    pub last_transition_time: Option<Time>,
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentStatus>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    Storage,
    Select,
    Insert,
    Agent,
    Alertmanager,
}

pub enum WorkloadKind {
    StatefulSet,
    Deployment,
}

impl Component {
    /// Dependency order: vmstorage first, select and insert need its endpoints.
    pub const ORDERED: [Component; 5] = [
        Component::Storage,
        Component::Select,
        Component::Insert,
        Component::Agent,
        Component::Alertmanager,
    ];

    pub fn app_name(self) -> &'static str {
        match self {
            Component::Storage => "vmstorage",
            Component::Select => "vmselect",
            Component::Insert => "vminsert",
            Component::Agent => "vmagent",
            Component::Alertmanager => "vmalertmanager",
        }
    }

    pub fn workload(self) -> WorkloadKind {
        match self {
            Component::Insert | Component::Agent => WorkloadKind::Deployment,
            _ => WorkloadKind::StatefulSet,
        }
    }

    pub fn http_port(self) -> i32 {
        match self {
            Component::Storage => 8482,
            Component::Select => 8481,
            Component::Insert => 8480,
            Component::Agent => 8429,
            Component::Alertmanager => 9093,
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.app_name())
    }
}

impl VMCluster {
    pub fn component(&self, c: Component) -> Option<&ComponentSpec> {
        match c {
            Component::Storage => self.spec.storage.as_ref(),
            Component::Select => self.spec.select.as_ref(),
            Component::Insert => self.spec.insert.as_ref(),
            Component::Agent => self.spec.agent.as_ref().map(|a| &a.common),
            Component::Alertmanager => self.spec.alertmanager.as_ref().map(|a| &a.common),
        }
    }

    pub fn prefixed_name(&self, c: Component) -> String {
        format!("{}-{}", c.app_name(), self.name_any())
    }

    /// Labels identifying the children of one component; also the owner key
    /// live children are fetched by.
    pub fn selector_labels(&self, c: Component) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("app.kubernetes.io/name".to_string(), c.app_name().to_string());
        labels.insert("app.kubernetes.io/instance".to_string(), self.name_any());
        labels.insert(
            "app.kubernetes.io/component".to_string(),
            "monitoring".to_string(),
        );
        labels.insert("managed-by".to_string(), MANAGED_BY.to_string());
        labels
    }

    pub fn as_owner(&self) -> Option<OwnerReference> {
        self.controller_owner_ref(&())
    }

    /// Storage endpoints handed to vmselect (`port` 8401) and vminsert (8400).
    pub fn storage_nodes(&self, port: i32) -> Vec<String> {
        let storage = match &self.spec.storage {
            Some(s) => s,
            None => return vec![],
        };
        let name = self.prefixed_name(Component::Storage);
        let ns = self.namespace().unwrap_or_default();
        (0..storage.replicas())
            .map(|i| format!("{}-{}.{}.{}.svc:{}", name, i, name, ns, port))
            .collect()
    }
}
