//! Configuration for the device host.
//!
//! Process settings come from `FLEET_*` environment variables. Device
//! parameters come from a [`ConfigSource`], a read-only parameter tree.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use fleet_reconcile::{BackoffPolicy, ControllerConfig};

use crate::composite::{DisconnectedPolicy, QuorumPolicy};
use crate::error::{HostError, HostResult};

/// Device host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Name of this host, used in logs and as the default endpoint.
    pub host_name: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Deadlines earlier than `now + min_lead` are moved to `now + min_lead`.
    pub min_lead: Duration,

    /// Default gap between the prepare and start deadlines.
    pub prepare_lead: Duration,

    /// Outbound events held per link while it is disconnected.
    pub event_buffer_cap: usize,

    /// Reconnect delays for remote links.
    pub reconnect: BackoffPolicy,

    /// Failed reconnect attempts before the link is reported at warn level.
    pub reconnect_warn_after: u32,

    /// Default quorum for composite devices.
    pub quorum: QuorumPolicy,

    /// Retries allowed to the reconciliation controller.
    pub controller_max_retries: u32,

    /// Reconciliation tick interval.
    pub controller_tick: Duration,

    /// Reconciliation response timeout.
    pub controller_response_timeout: Duration,

    /// Devices created at startup, as `(type, name)` pairs.
    pub boot_devices: Vec<(String, String)>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_name: "device-host".to_string(),
            log_level: "info".to_string(),
            min_lead: Duration::from_millis(1000),
            prepare_lead: Duration::from_secs(5),
            event_buffer_cap: 256,
            reconnect: BackoffPolicy::default(),
            reconnect_warn_after: 5,
            quorum: QuorumPolicy::default(),
            controller_max_retries: fleet_reconcile::DEFAULT_MAX_RETRIES,
            controller_tick: fleet_reconcile::DEFAULT_TICK_INTERVAL,
            controller_response_timeout: fleet_reconcile::DEFAULT_RESPONSE_TIMEOUT,
            boot_devices: Vec::new(),
        }
    }
}

impl HostConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> HostResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> HostResult<Self> {
        let defaults = Self::default();

        let host_name = lookup("FLEET_HOST_NAME").unwrap_or(defaults.host_name);
        let log_level = lookup("FLEET_LOG_LEVEL").unwrap_or(defaults.log_level);

        let min_lead_ms: u64 = parse_or(&lookup, "FLEET_MIN_LEAD_MS", 1000)?;
        let prepare_lead_secs: u64 = parse_or(&lookup, "FLEET_PREPARE_LEAD_SECS", 5)?;
        let event_buffer_cap: usize = parse_or(&lookup, "FLEET_EVENT_BUFFER_CAP", 256)?;
        if event_buffer_cap == 0 {
            return Err(HostError::InvalidParameter {
                key: "FLEET_EVENT_BUFFER_CAP".into(),
                detail: "must be at least 1".into(),
            });
        }

        let reconnect_base_ms: u64 = parse_or(
            &lookup,
            "FLEET_RECONNECT_BASE_MS",
            defaults.reconnect.base.as_millis() as u64,
        )?;
        let reconnect_max_ms: u64 = parse_or(
            &lookup,
            "FLEET_RECONNECT_MAX_MS",
            defaults.reconnect.max.as_millis() as u64,
        )?;
        let reconnect_warn_after: u32 = parse_or(&lookup, "FLEET_RECONNECT_WARN_AFTER", 5)?;

        let threshold_percent: u8 = parse_or(&lookup, "FLEET_QUORUM_PERCENT", 100)?;
        let disconnected = match lookup("FLEET_QUORUM_DISCONNECTED") {
            Some(raw) => raw.parse::<DisconnectedPolicy>()?,
            None => DisconnectedPolicy::default(),
        };
        let quorum = QuorumPolicy::new(threshold_percent, disconnected)?;

        let controller_max_retries: u32 = parse_or(
            &lookup,
            "FLEET_CONTROLLER_MAX_RETRIES",
            defaults.controller_max_retries,
        )?;
        let controller_tick_ms: u64 = parse_or(
            &lookup,
            "FLEET_CONTROLLER_TICK_MS",
            defaults.controller_tick.as_millis() as u64,
        )?;
        let controller_response_timeout_secs: u64 = parse_or(
            &lookup,
            "FLEET_CONTROLLER_RESPONSE_TIMEOUT_SECS",
            defaults.controller_response_timeout.as_secs(),
        )?;

        let boot_devices = match lookup("FLEET_DEVICES") {
            Some(raw) => parse_boot_devices(&raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            host_name,
            log_level,
            min_lead: Duration::from_millis(min_lead_ms),
            prepare_lead: Duration::from_secs(prepare_lead_secs),
            event_buffer_cap,
            reconnect: BackoffPolicy {
                base: Duration::from_millis(reconnect_base_ms),
                max: Duration::from_millis(reconnect_max_ms),
                jitter: defaults.reconnect.jitter,
            },
            reconnect_warn_after,
            quorum,
            controller_max_retries,
            controller_tick: Duration::from_millis(controller_tick_ms),
            controller_response_timeout: Duration::from_secs(controller_response_timeout_secs),
            boot_devices,
        })
    }

    /// Settings for the reconciliation controller.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            max_retries: self.controller_max_retries,
            backoff: BackoffPolicy::default(),
            response_timeout: self.controller_response_timeout,
        }
    }
}

/// Parse `type:name[,type:name...]`.
fn parse_boot_devices(raw: &str) -> HostResult<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once(':') {
            Some((device_type, name)) if !device_type.is_empty() && !name.is_empty() => {
                Ok((device_type.to_string(), name.to_string()))
            }
            _ => Err(HostError::InvalidParameter {
                key: "FLEET_DEVICES".into(),
                detail: format!("expected type:name, got {item:?}"),
            }),
        })
        .collect()
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> HostResult<T>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| HostError::InvalidParameter {
                key: key.to_string(),
                detail: e.to_string(),
            }),
        None => Ok(default),
    }
}

// =============================================================================
// Parameter tree
// =============================================================================

/// Read-only, synchronous parameter tree.
pub trait ConfigSource: Send + Sync {
    /// Value of a dotted key such as `devices.receiver.version`.
    fn get_parameter(&self, key: &str) -> Option<String>;

    /// Immediate child key names under `prefix` (empty prefix: top level).
    fn get_child_keys(&self, prefix: &str) -> Vec<String>;
}

/// In-memory parameter tree keyed by dotted paths.
#[derive(Debug, Clone, Default)]
pub struct MapConfigSource {
    values: BTreeMap<String, String>,
}

impl MapConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Build from `(name, value)` pairs such as the process environment.
    /// Names starting with `prefix` become dotted keys: `__` separates
    /// segments and the rest is lowercased, so
    /// `FLEET_PARAM_DEVICES__COMPOSITE__QUORUM_PERCENT` is
    /// `devices.composite.quorum_percent`.
    pub fn from_vars(prefix: &str, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let values = vars
            .into_iter()
            .filter_map(|(name, value)| {
                let rest = name.strip_prefix(prefix)?;
                let key = rest
                    .split("__")
                    .map(str::to_ascii_lowercase)
                    .collect::<Vec<_>>()
                    .join(".");
                (!key.is_empty()).then_some((key, value))
            })
            .collect();
        Self { values }
    }
}

impl ConfigSource for MapConfigSource {
    fn get_parameter(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn get_child_keys(&self, prefix: &str) -> Vec<String> {
        let mut children: Vec<String> = Vec::new();
        for key in self.values.keys() {
            let rest = if prefix.is_empty() {
                key.as_str()
            } else {
                match key
                    .strip_prefix(prefix)
                    .and_then(|r| r.strip_prefix('.'))
                {
                    Some(rest) => rest,
                    None => continue,
                }
            };
            let child = rest.split('.').next().unwrap_or(rest);
            if !child.is_empty() && children.last().map(String::as_str) != Some(child) {
                children.push(child.to_string());
            }
        }
        children.dedup();
        children
    }
}

/// Typed lookup of a required parameter.
pub fn require_parameter<T: FromStr>(source: &dyn ConfigSource, key: &str) -> HostResult<T>
where
    T::Err: std::fmt::Display,
{
    let raw = source
        .get_parameter(key)
        .ok_or_else(|| HostError::MissingParameter(key.to_string()))?;
    raw.trim().parse().map_err(|e: T::Err| HostError::InvalidParameter {
        key: key.to_string(),
        detail: e.to_string(),
    })
}

/// Typed lookup of an optional parameter.
pub fn optional_parameter<T: FromStr>(source: &dyn ConfigSource, key: &str) -> HostResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match source.get_parameter(key) {
        Some(_) => require_parameter(source, key).map(Some),
        None => Ok(None),
    }
}
