//! One reconcile pass over a `VMCluster`.
//!
//! Components are handled in dependency order. Each one is resolved,
//! synthesized, applied and then evaluated for rollout progress; the
//! resulting status is written back once per pass and the pass decides when
//! it wants to run again.

use crate::apply::{converge_children, ApplyReport};
use crate::config::EngineConfig;
use crate::crd::{Component, VMCluster, VMClusterStatus, WorkloadKind, ALERTMANAGER_CONFIG_KEY};
use crate::credentials::{self, config_map_key, endpoint_auth, CredentialCache, CredentialKind};
use crate::errors::*;
use crate::rollout::{wait_ready, ComponentStatus, Phase, ReplicaCounts};
use crate::selector::{select_pod_scrapes, select_service_scrapes};
use crate::store::{ObjectStore, PassStore};
use crate::synth::{self, checksum, job_name, Resolved};
use chrono::{DateTime, SubsecRound, Utc};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use log::{debug, info, warn};
use rand::Rng;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Result of a pass: the status it settled on and when to run again.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: VMClusterStatus,
    pub requeue_after: Duration,
}

enum Step {
    Absent,
    Tracked(ComponentStatus),
    /// A failure retrying will not fix; the rest of the pass is skipped.
    Aborted(ComponentStatus),
}

struct Pass<'a, S> {
    store: PassStore<'a, S>,
    cache: CredentialCache,
    cluster: &'a VMCluster,
    config: &'a EngineConfig,
    namespace: String,
    prev: VMClusterStatus,
    now: DateTime<Utc>,
    retry: bool,
}

impl<'a, S: ObjectStore> Pass<'a, S> {
    fn prev(&self, c: Component) -> Option<&ComponentStatus> {
        self.prev.components.get(c.app_name())
    }

    /// Scrape targets for vmagent and referenced configuration for
    /// vmalertmanager.
    async fn resolve(&mut self, c: Component) -> Result<Resolved> {
        let cluster = self.cluster;
        let ns = self.namespace.clone();
        match c {
            Component::Agent => {
                let agent = match &cluster.spec.agent {
                    Some(a) => a,
                    None => return Ok(Resolved::default()),
                };
                let services = select_service_scrapes(&self.store, &ns, agent).await?;
                let pods = select_pod_scrapes(&self.store, &ns, agent).await?;
                let mut auth = BTreeMap::new();
                for (key, scrape) in &services {
                    let scrape_ns = scrape.namespace().unwrap_or_default();
                    for (i, endpoint) in scrape.spec.endpoints.iter().enumerate() {
                        let resolved =
                            endpoint_auth(&self.store, &mut self.cache, &scrape_ns, endpoint).await?;
                        auth.insert(job_name("serviceScrape", key, i), resolved);
                    }
                }
                for (key, scrape) in &pods {
                    let scrape_ns = scrape.namespace().unwrap_or_default();
                    for (i, endpoint) in scrape.spec.pod_metrics_endpoints.iter().enumerate() {
                        let resolved =
                            endpoint_auth(&self.store, &mut self.cache, &scrape_ns, endpoint).await?;
                        auth.insert(job_name("podScrape", key, i), resolved);
                    }
                }
                let config = synth::scrape_config(&services, &pods, &auth)?;
                debug!(
                    "{} scrapes {} service and {} pod targets",
                    cluster.prefixed_name(c),
                    services.len(),
                    pods.len()
                );
                Ok(Resolved {
                    config_checksum: Some(checksum(&[&config])),
                    scrape_config: Some(config),
                })
            }
            Component::Alertmanager => {
                let am = match &cluster.spec.alertmanager {
                    Some(a) => a,
                    None => return Ok(Resolved::default()),
                };
                let mut parts = vec![];
                if let Some(secret) = &am.config_secret {
                    let body = credentials::resolve(
                        &self.store,
                        &mut self.cache,
                        CredentialKind::Secret,
                        &ns,
                        secret,
                        ALERTMANAGER_CONFIG_KEY,
                    )
                    .await?;
                    parts.push(body);
                }
                if let Some(sel) = &am.tls_ca_config_map {
                    if let Some(ca) = config_map_key(&self.store, &mut self.cache, &ns, sel).await? {
                        parts.push(ca);
                    }
                }
                let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
                Ok(Resolved {
                    scrape_config: None,
                    config_checksum: if parts.is_empty() {
                        None
                    } else {
                        Some(checksum(&parts))
                    },
                })
            }
            _ => Ok(Resolved::default()),
        }
    }

    async fn observe(&self, c: Component, budget: Duration) -> Result<ReplicaCounts> {
        let name = self.cluster.prefixed_name(c);
        let replicas = self.cluster.component(c).map_or(0, |spec| spec.replicas());
        let interval = self.config.pod_wait_ready_interval_check;
        let ns = &self.namespace;
        match c.workload() {
            WorkloadKind::StatefulSet => {
                wait_ready::<StatefulSet, _>(&self.store, ns, &name, replicas, interval, budget).await
            }
            WorkloadKind::Deployment => {
                wait_ready::<Deployment, _>(&self.store, ns, &name, replicas, interval, budget).await
            }
        }
    }

    async fn sync(&mut self, c: Component) -> Step {
        let cluster = self.cluster;
        let present = cluster.component(c).is_some();
        let now = self.now;

        let resolved = if present {
            match self.resolve(c).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("{}: {}", cluster.prefixed_name(c), e);
                    self.retry |= e.is_retryable();
                    return Step::Tracked(ComponentStatus::failed(self.prev(c), e.to_string(), now));
                }
            }
        } else {
            Resolved::default()
        };

        let children = synth::children(cluster, c, &resolved);
        let report = converge_children(
            &self.store,
            &self.namespace,
            cluster.uid().as_deref(),
            &cluster.selector_labels(c),
            children,
        )
        .await;
        log_report(cluster, c, &report);
        if !report.failures.is_empty() {
            self.retry = true;
        }

        if !present {
            return Step::Absent;
        }
        if let Some(e) = report.hard_failure() {
            return Step::Aborted(ComponentStatus::failed(self.prev(c), e.to_string(), now));
        }

        let kind = match c.workload() {
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::Deployment => "Deployment",
        };
        let key = format!("{}/{}", self.namespace, cluster.prefixed_name(c));
        let changed = report.changed(kind, &key);
        match self.observe(c, self.config.pod_wait_ready_budget).await {
            Ok(counts) => Step::Tracked(ComponentStatus::advance(
                self.prev(c),
                c.app_name(),
                &counts,
                changed,
                now,
                self.config.pod_wait_ready_timeout,
            )),
            Err(e) => {
                warn!("{}: {}", cluster.prefixed_name(c), e);
                self.retry |= e.is_retryable();
                Step::Tracked(ComponentStatus::failed(self.prev(c), e.to_string(), now))
            }
        }
    }

    /// Paused clusters are observed only: children are never written.
    async fn observe_paused(&mut self) -> BTreeMap<String, ComponentStatus> {
        let mut out = BTreeMap::new();
        for &c in Component::ORDERED.iter() {
            if self.cluster.component(c).is_none() {
                continue;
            }
            let status = match self.observe(c, Duration::from_secs(0)).await {
                Ok(counts) => ComponentStatus::paused(self.prev(c), &counts, self.now),
                Err(e) => {
                    warn!("{}: {}", self.cluster.prefixed_name(c), e);
                    self.retry |= e.is_retryable();
                    ComponentStatus::failed(self.prev(c), e.to_string(), self.now)
                }
            };
            out.insert(c.app_name().to_string(), status);
        }
        out
    }

    async fn sync_all(&mut self) -> BTreeMap<String, ComponentStatus> {
        let mut out = BTreeMap::new();
        let mut aborted = false;
        for &c in Component::ORDERED.iter() {
            if aborted {
                // keep what the previous pass reported
                if self.cluster.component(c).is_some() {
                    if let Some(prev) = self.prev(c) {
                        out.insert(c.app_name().to_string(), prev.clone());
                    }
                }
                continue;
            }
            match self.sync(c).await {
                Step::Absent => {}
                Step::Tracked(status) => {
                    out.insert(c.app_name().to_string(), status);
                }
                Step::Aborted(status) => {
                    warn!(
                        "{}: skipping remaining components: {}",
                        self.cluster.prefixed_name(c),
                        status.reason.as_deref().unwrap_or_default()
                    );
                    out.insert(c.app_name().to_string(), status);
                    aborted = true;
                }
            }
        }
        out
    }
}

fn log_report(cluster: &VMCluster, c: Component, report: &ApplyReport) {
    if report.writes() > 0 {
        info!(
            "{}: created {:?}, updated {:?}, deleted {:?}",
            cluster.prefixed_name(c),
            report.created,
            report.updated,
            report.deleted
        );
    }
}

fn composite_status(
    prev: &VMClusterStatus,
    components: BTreeMap<String, ComponentStatus>,
    paused: bool,
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> VMClusterStatus {
    let phase = if paused {
        Phase::Paused
    } else {
        Phase::composite(components.values().map(|s| s.phase))
    };
    let reason = Component::ORDERED
        .iter()
        .filter_map(|c| components.get(c.app_name()).map(|s| (c, s)))
        .find(|(_, s)| s.phase == phase && phase != Phase::Operational)
        .and_then(|(c, s)| s.reason.as_ref().map(|r| format!("{}: {}", c, r)));
    let last_transition_time = match prev.phase {
        Some(p) if p == phase => prev.last_transition_time.clone(),
        _ => Some(Time(now)),
    };
    VMClusterStatus {
        phase: Some(phase),
        reason,
        last_transition_time,
        observed_generation: generation,
        components,
    }
}

/// Merge patch turning `prev` into `next`. Components that disappeared are
/// sent as explicit nulls, since a merge patch keeps keys it does not mention.
fn status_patch(prev: &VMClusterStatus, next: &VMClusterStatus) -> Result<serde_json::Value> {
    let mut patch = serde_json::to_value(next)?;
    for name in prev.components.keys() {
        if !next.components.contains_key(name) {
            patch["components"][name.as_str()] = serde_json::Value::Null;
        }
    }
    Ok(patch)
}

fn jittered(base: Duration) -> Duration {
    let spread = (base.as_millis() / 10) as u64;
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

fn requeue_after(status: &VMClusterStatus, retry: bool, paused: bool, config: &EngineConfig) -> Duration {
    if paused {
        return config.paused_resync_period;
    }
    let phases: Vec<Phase> = status.components.values().map(|s| s.phase).collect();
    if phases.contains(&Phase::Error) {
        jittered(config.error_backoff)
    } else if retry || phases.contains(&Phase::Expanding) {
        config.pod_wait_ready_interval_check
    } else {
        config.resync_period
    }
}

/// Runs one pass for `cluster`. Component failures end up in the returned
/// status; only a failed status write is returned as an error.
pub async fn reconcile<S: ObjectStore>(
    store: &S,
    cluster: &VMCluster,
    config: &EngineConfig,
) -> Result<Outcome> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    let prev = cluster.status.clone().unwrap_or_default();
    let paused = cluster.spec.paused;
    debug!("reconciling {}/{} (paused: {})", namespace, name, paused);

    let mut pass = Pass {
        store: PassStore::new(store, Instant::now() + config.reconcile_deadline),
        cache: CredentialCache::new(),
        cluster,
        config,
        namespace: namespace.clone(),
        prev: prev.clone(),
        now: Utc::now().trunc_subsecs(0),
        retry: false,
    };
    let components = if paused {
        pass.observe_paused().await
    } else {
        pass.sync_all().await
    };

    let status = composite_status(&prev, components, paused, cluster.metadata.generation, pass.now);
    if cluster.status.as_ref() != Some(&status) {
        info!(
            "{}/{} is {:?}",
            namespace,
            name,
            status.phase.unwrap_or(Phase::Operational)
        );
        pass.store
            .patch_status::<VMCluster>(&namespace, &name, status_patch(&prev, &status)?)
            .await?;
    }
    let requeue_after = requeue_after(&status, pass.retry, paused, config);
    Ok(Outcome {
        status,
        requeue_after,
    })
}
