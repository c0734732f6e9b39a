//! Rollout tracking: decides from a workload's observed status whether a
//! component has converged, and records the phase in the owner's status.

use crate::errors::*;
use crate::store::{Object, ObjectStore};
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use log::trace;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Rollout phase of a component. The declaration order is the aggregation
/// order: the composite phase of several components is the greatest one.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Operational,
    Paused,
    Expanding,
    #[serde(rename = "failed")]
    Error,
}

impl Phase {
    /// Least ready phase wins; nothing to track is operational.
    pub fn composite<I: IntoIterator<Item = Phase>>(phases: I) -> Phase {
        phases.into_iter().max().unwrap_or(Phase::Operational)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplicaCounts {
    /// Replica count the owner declares.
    pub desired: i32,
    /// Replica count the live workload is currently asked to run.
    pub spec_replicas: i32,
    pub current: i32,
    pub ready: i32,
    pub updated: i32,
    pub generation: Option<i64>,
    pub observed_generation: Option<i64>,
}

impl ReplicaCounts {
    // converged indicates whether the workload runs the declared replica count,
    // its controller has seen the latest spec and every desired replica is
    // ready and up to date.
    pub fn converged(&self) -> bool {
        let observed = match (self.generation, self.observed_generation) {
            (Some(generation), Some(observed)) => observed >= generation,
            (None, Some(_)) => true,
            (_, None) => false,
        };
        observed
            && self.spec_replicas == self.desired
            && self.ready == self.desired
            && self.updated == self.desired
    }

    /// Judges the counts against the owner's declared replica count instead
    /// of what the live workload asks for.
    pub fn declared(mut self, replicas: i32) -> Self {
        self.desired = replicas;
        self
    }

    fn progress(&self) -> String {
        format!(
            "{}/{} ready, {}/{} updated",
            self.ready, self.desired, self.updated, self.desired
        )
    }
}

/// Workload kinds whose rollout can be tracked.
pub trait Workload: Object {
    fn replica_counts(&self) -> ReplicaCounts;
}

impl Workload for StatefulSet {
    fn replica_counts(&self) -> ReplicaCounts {
        let desired = self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let status = self.status.clone().unwrap_or_default();
        ReplicaCounts {
            desired,
            spec_replicas: desired,
            current: status.current_replicas.unwrap_or(0),
            ready: status.ready_replicas.unwrap_or(0),
            updated: status.updated_replicas.unwrap_or(0),
            generation: self.metadata.generation,
            observed_generation: status.observed_generation,
        }
    }
}

impl Workload for Deployment {
    fn replica_counts(&self) -> ReplicaCounts {
        let desired = self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let status = self.status.clone().unwrap_or_default();
        ReplicaCounts {
            desired,
            spec_replicas: desired,
            current: status.replicas.unwrap_or(0),
            ready: status.ready_replicas.unwrap_or(0),
            updated: status.updated_replicas.unwrap_or(0),
            generation: self.metadata.generation,
            observed_generation: status.observed_generation,
        }
    }
}

/// Polls a workload every `interval` until it converges on `replicas`,
/// `budget` runs out or the next poll would cross the store's deadline.
/// Returns the last observed counts; a missing workload counts as not
/// converged.
pub async fn wait_ready<W: Workload, S: ObjectStore>(
    store: &S,
    namespace: &str,
    name: &str,
    replicas: i32,
    interval: Duration,
    budget: Duration,
) -> Result<ReplicaCounts> {
    let mut give_up = Instant::now() + budget;
    if let Some(deadline) = store.deadline() {
        give_up = give_up.min(deadline);
    }
    loop {
        let counts = store
            .get::<W>(namespace, name)
            .await?
            .map(|w| w.replica_counts())
            .unwrap_or_default()
            .declared(replicas);
        if counts.converged() || Instant::now() + interval >= give_up {
            return Ok(counts);
        }
        trace!("{}/{} not ready yet: {}", namespace, name, counts.progress());
        tokio::time::sleep(interval).await;
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    pub phase: Phase,
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub current_replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub updated_replicas: i32,
    pub reason: Option<String>,
    pub last_transition_time: Option<Time>,
    /// Start of the current rollout; timed against `podWaitReadyTimeout`.
    pub expanding_since: Option<Time>,
}

impl ComponentStatus {
    fn enter(
        prev: Option<&ComponentStatus>,
        phase: Phase,
        counts: &ReplicaCounts,
        now: DateTime<Utc>,
    ) -> Self {
        let last_transition_time = match prev {
            Some(p) if p.phase == phase => p.last_transition_time.clone(),
            _ => Some(Time(now)),
        };
        ComponentStatus {
            phase,
            replicas: counts.desired,
            current_replicas: counts.current,
            ready_replicas: counts.ready,
            updated_replicas: counts.updated,
            reason: None,
            last_transition_time,
            expanding_since: None,
        }
    }

    /// Next status of a component from freshly observed counts.
    /// `workload_changed` restarts the rollout timer.
    pub fn advance(
        prev: Option<&ComponentStatus>,
        component: &str,
        counts: &ReplicaCounts,
        workload_changed: bool,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Self {
        if counts.converged() {
            return Self::enter(prev, Phase::Operational, counts, now);
        }
        let since = match prev.and_then(|p| p.expanding_since.as_ref()) {
            Some(t) if !workload_changed => t.0,
            _ => now,
        };
        let waited = (now - since).to_std().unwrap_or_default();
        let mut next = if waited > timeout {
            let mut s = Self::enter(prev, Phase::Error, counts, now);
            let err: Error =
                ErrorKind::ReadinessTimeout(component.to_string(), waited.as_secs() as i64).into();
            s.reason = Some(format!("{} ({})", err, counts.progress()));
            s
        } else {
            let mut s = Self::enter(prev, Phase::Expanding, counts, now);
            s.reason = Some(counts.progress());
            s
        };
        next.expanding_since = Some(Time(since));
        next
    }

    /// Synthesis or apply failure. Replica counters and the rollout timer are
    /// carried over from the previous status.
    pub fn failed(prev: Option<&ComponentStatus>, reason: String, now: DateTime<Utc>) -> Self {
        let counts = prev
            .map(|p| ReplicaCounts {
                desired: p.replicas,
                current: p.current_replicas,
                ready: p.ready_replicas,
                updated: p.updated_replicas,
                ..ReplicaCounts::default()
            })
            .unwrap_or_default();
        let mut s = Self::enter(prev, Phase::Error, &counts, now);
        s.reason = Some(reason);
        s.expanding_since = prev.and_then(|p| p.expanding_since.clone());
        s
    }

    /// Paused components still report what the workload is doing.
    pub fn paused(prev: Option<&ComponentStatus>, counts: &ReplicaCounts, now: DateTime<Utc>) -> Self {
        let mut s = Self::enter(prev, Phase::Paused, counts, now);
        s.reason = Some("reconciliation is paused".to_string());
        s
    }
}
