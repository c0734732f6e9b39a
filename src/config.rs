use crate::errors::*;
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;

/// Environment variable naming an optional YAML config file.
pub const CONFIG_FILE_ENV: &str = "VM_OPERATOR_CONFIG";

/// Tunables of the reconcile engine.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// How long a component may stay expanding before it is reported failed.
    #[serde(deserialize_with = "human_duration")]
    pub pod_wait_ready_timeout: Duration,
    /// Interval between readiness checks, both in-pass and across requeues.
    #[serde(deserialize_with = "human_duration")]
    pub pod_wait_ready_interval_check: Duration,
    /// How long a single pass may poll a workload before handing back to the scheduler.
    #[serde(deserialize_with = "human_duration")]
    pub pod_wait_ready_budget: Duration,
    /// Upper bound for a whole reconcile pass, applied to every remote call.
    #[serde(deserialize_with = "human_duration")]
    pub reconcile_deadline: Duration,
    #[serde(deserialize_with = "human_duration")]
    pub error_backoff: Duration,
    #[serde(deserialize_with = "human_duration")]
    pub resync_period: Duration,
    #[serde(deserialize_with = "human_duration")]
    pub paused_resync_period: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            pod_wait_ready_timeout: Duration::from_secs(80),
            pod_wait_ready_interval_check: Duration::from_secs(5),
            pod_wait_ready_budget: Duration::from_secs(0),
            reconcile_deadline: Duration::from_secs(60),
            error_backoff: Duration::from_secs(30),
            resync_period: Duration::from_secs(300),
            paused_resync_period: Duration::from_secs(600),
        }
    }
}

fn human_duration<'de, D>(d: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(d)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

impl EngineConfig {
    /// defaults, then the file named by `VM_OPERATOR_CONFIG`, then `VM_*` overrides.
    pub fn load() -> Result<Self> {
        let mut cfg = match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => EngineConfig::default(),
        };
        cfg.apply_overrides(|k| std::env::var(k).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .chain_err(|| format!("cannot read config file {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(EngineConfig::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Applies overrides looked up by variable name. Split out from `load` so
    /// tests do not have to mutate the process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let fields: [(&str, &mut Duration); 6] = [
            ("VM_PODWAITREADYTIMEOUT", &mut self.pod_wait_ready_timeout),
            (
                "VM_PODWAITREADYINTERVALCHECK",
                &mut self.pod_wait_ready_interval_check,
            ),
            ("VM_PODWAITREADYBUDGET", &mut self.pod_wait_ready_budget),
            ("VM_RECONCILEDEADLINE", &mut self.reconcile_deadline),
            ("VM_ERRORBACKOFF", &mut self.error_backoff),
            ("VM_RESYNCPERIOD", &mut self.resync_period),
        ];
        for (name, field) in fields {
            if let Some(raw) = lookup(name) {
                *field = humantime::parse_duration(raw.trim())
                    .chain_err(|| ErrorKind::InvalidConfig(name.to_string(), raw.clone()))?;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pod_wait_ready_interval_check == Duration::from_secs(0) {
            bail!(ErrorKind::InvalidConfig(
                "podWaitReadyIntervalCheck".to_string(),
                "0s".to_string()
            ));
        }
        if self.reconcile_deadline <= self.pod_wait_ready_budget {
            bail!(ErrorKind::InvalidConfig(
                "reconcileDeadline".to_string(),
                humantime::format_duration(self.reconcile_deadline).to_string()
            ));
        }
        Ok(())
    }
}
