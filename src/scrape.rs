//! Discovery registrations: where and how a workload's metrics are scraped.
//! vmagent picks these up through its selectors; every component also
//! registers its own `VMServiceScrape`.

use k8s_openapi::api::core::v1::{ConfigMapKeySelector, SecretKeySelector};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[kube(
    group = "operator.victoriametrics.com",
    version = "v1beta1",
    kind = "VMServiceScrape",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VMServiceScrapeSpec {
    /// Services to scrape.
    pub selector: LabelSelector,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    pub job_label: Option<String>,
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[kube(
    group = "operator.victoriametrics.com",
    version = "v1beta1",
    kind = "VMPodScrape",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VMPodScrapeSpec {
    /// Pods to scrape.
    pub selector: LabelSelector,
    #[serde(default)]
    pub pod_metrics_endpoints: Vec<Endpoint>,
    pub job_label: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Name of the service or container port.
    pub port: Option<String>,
    pub path: Option<String>,
    pub scheme: Option<String>,
    pub interval: Option<String>,
    pub basic_auth: Option<BasicAuth>,
    pub bearer_token_secret: Option<SecretKeySelector>,
    pub tls_config: Option<TlsConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuth {
    pub username: Option<SecretKeySelector>,
    pub password: Option<SecretKeySelector>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    pub ca_secret: Option<SecretKeySelector>,
    pub ca_config_map: Option<ConfigMapKeySelector>,
    pub server_name: Option<String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}
