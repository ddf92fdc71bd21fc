//! Device registry: factories keyed by type tag, the live device table and
//! deferred destruction.
//!
//! Creation checks everything a device needs before it exists (type,
//! version, required parameters). Destruction only starts a shutdown; the
//! device stays in the table until it reaches a terminal state and
//! [`DeviceRegistry::collect_garbage`] takes it out.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use fleet_events::{DeviceState, ErrorCode, Params};
use fleet_id::DeviceName;
use tracing::{debug, info, warn};

use crate::composite::{CompositeBehavior, DisconnectedPolicy, QuorumPolicy};
use crate::config::{optional_parameter, ConfigSource};
use crate::error::{HostError, HostResult};
use crate::lifecycle::{LifecycleEngine, Phase, SimulatedDevice};

/// Builds devices of one type.
pub trait DeviceFactory: Send + Sync {
    /// Type tag used in `create_device`.
    fn device_type(&self) -> &str;

    /// Version implemented by this factory.
    fn version(&self) -> u32 {
        1
    }

    /// Parameters that must be present in the create request or under
    /// `devices.<type>.<key>` in the configuration.
    fn required_params(&self) -> &[&'static str] {
        &[]
    }

    fn build(&self, request: &CreateRequest<'_>) -> HostResult<LifecycleEngine>;
}

/// Everything a factory sees when building a device.
pub struct CreateRequest<'a> {
    pub name: &'a DeviceName,
    pub device_type: &'a str,
    pub params: &'a Params,
    pub config: &'a dyn ConfigSource,
}

impl CreateRequest<'_> {
    /// A parameter from the request, falling back to
    /// `devices.<type>.<key>` in the configuration.
    pub fn parameter(&self, key: &str) -> Option<String> {
        match self.params.get(key) {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
            None => self
                .config
                .get_parameter(&format!("devices.{}.{key}", self.device_type)),
        }
    }

    /// Typed form of [`parameter`](Self::parameter).
    pub fn typed<T: std::str::FromStr>(&self, key: &str) -> HostResult<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        match self.parameter(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|e: T::Err| HostError::InvalidParameter {
                key: key.to_string(),
                detail: e.to_string(),
            }),
        }
    }
}

/// Owns every device in this host.
pub struct DeviceRegistry {
    factories: HashMap<String, Box<dyn DeviceFactory>>,
    config: Arc<dyn ConfigSource>,
    devices: BTreeMap<DeviceName, LifecycleEngine>,
    doomed: BTreeSet<DeviceName>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&String> = self.factories.keys().collect();
        types.sort();
        f.debug_struct("DeviceRegistry")
            .field("types", &types)
            .field("devices", &self.devices.len())
            .field("doomed", &self.doomed)
            .finish()
    }
}

impl DeviceRegistry {
    pub fn new(config: Arc<dyn ConfigSource>) -> Self {
        Self {
            factories: HashMap::new(),
            config,
            devices: BTreeMap::new(),
            doomed: BTreeSet::new(),
        }
    }

    /// A registry with the `simulated` and `composite` factories.
    pub fn with_builtin(config: Arc<dyn ConfigSource>, quorum: QuorumPolicy) -> Self {
        let mut registry = Self::new(config);
        registry.register(Box::new(SimulatedFactory));
        registry.register(Box::new(CompositeFactory::new(quorum)));
        registry
    }

    /// Register a factory, replacing any previous one for the same type.
    pub fn register(&mut self, factory: Box<dyn DeviceFactory>) {
        let device_type = factory.device_type().to_string();
        debug!(device_type = %device_type, version = factory.version(), "Factory registered");
        self.factories.insert(device_type, factory);
    }

    pub fn supports(&self, device_type: &str) -> bool {
        self.factories.contains_key(device_type)
    }

    pub fn config(&self) -> &dyn ConfigSource {
        self.config.as_ref()
    }

    // =========================================================================
    // Create / destroy
    // =========================================================================

    /// Create and initialize a device.
    ///
    /// Configuration problems are reported before anything is built. A
    /// device whose initialize hook fails is never registered.
    pub fn create_device(&mut self, device_type: &str, name: DeviceName, params: Params) -> HostResult<()> {
        if self.devices.contains_key(&name) {
            warn!(device = %name, "Device already exists");
            return Err(HostError::AlreadyExists(name.to_string()));
        }
        let factory = self
            .factories
            .get(device_type)
            .ok_or_else(|| HostError::UnsupportedDeviceType(device_type.to_string()))?;

        let request = CreateRequest {
            name: &name,
            device_type,
            params: &params,
            config: self.config.as_ref(),
        };

        if let Some(requested) = request.typed::<u32>("version")? {
            if requested != factory.version() {
                return Err(HostError::VersionMismatch {
                    device_type: device_type.to_string(),
                    supported: factory.version(),
                    requested,
                });
            }
        }
        for key in factory.required_params() {
            if request.parameter(key).is_none() {
                return Err(HostError::MissingParameter(format!("{name}: {key}")));
            }
        }

        let mut engine = factory.build(&request)?;
        if let Err(err) = engine.initialize() {
            warn!(device = %name, device_type, error = %err, "Device initialize failed");
            return Err(err);
        }
        info!(device = %name, device_type, "Device created");
        self.devices.insert(name, engine);
        Ok(())
    }

    /// Start tearing a device down. Removal happens in
    /// [`collect_garbage`](Self::collect_garbage) once it is terminal.
    pub fn destroy_device(&mut self, name: &DeviceName) -> HostResult<()> {
        let engine = self
            .devices
            .get_mut(name)
            .ok_or_else(|| HostError::NotFound(name.to_string()))?;
        self.doomed.insert(name.clone());
        if engine.is_terminal() {
            debug!(device = %name, "Destroying terminal device");
            return Ok(());
        }
        if engine.is_tearing_down() {
            debug!(device = %name, "Teardown already in progress");
            return Ok(());
        }
        info!(device = %name, state = %engine.state(), "Device teardown requested");
        engine.shutdown()
    }

    /// Remove every terminal device and return the removed engines.
    pub fn collect_garbage(&mut self) -> Vec<LifecycleEngine> {
        let terminal: Vec<DeviceName> = self
            .devices
            .iter()
            .filter(|(_, e)| e.is_terminal())
            .map(|(n, _)| n.clone())
            .collect();
        let mut removed = Vec::with_capacity(terminal.len());
        for name in terminal {
            if let Some(engine) = self.devices.remove(&name) {
                self.doomed.remove(&name);
                info!(device = %name, state = %engine.state(), "Device removed");
                removed.push(engine);
            }
        }
        removed
    }

    /// Devices whose destruction was requested and is still in progress.
    pub fn pending_destruction(&self) -> Vec<&DeviceName> {
        self.doomed
            .iter()
            .filter(|n| self.devices.get(*n).is_some_and(|e| !e.is_terminal()))
            .collect()
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn get(&self, name: &DeviceName) -> Option<&LifecycleEngine> {
        self.devices.get(name)
    }

    pub fn get_mut(&mut self, name: &DeviceName) -> Option<&mut LifecycleEngine> {
        self.devices.get_mut(name)
    }

    pub fn require(&self, name: &DeviceName) -> HostResult<&LifecycleEngine> {
        self.devices
            .get(name)
            .ok_or_else(|| HostError::NotFound(name.to_string()))
    }

    pub fn require_mut(&mut self, name: &DeviceName) -> HostResult<&mut LifecycleEngine> {
        self.devices
            .get_mut(name)
            .ok_or_else(|| HostError::NotFound(name.to_string()))
    }

    pub fn get_state(&self, name: &DeviceName) -> HostResult<DeviceState> {
        self.require(name).map(LifecycleEngine::state)
    }

    pub fn contains(&self, name: &DeviceName) -> bool {
        self.devices.contains_key(name)
    }

    pub fn names(&self) -> Vec<DeviceName> {
        self.devices.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LifecycleEngine> {
        self.devices.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut LifecycleEngine> {
        self.devices.values_mut()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

// =============================================================================
// Built-in factories
// =============================================================================

/// Leaf device with scripted hooks.
///
/// Parameters: `defer` and `fail` take comma-separated phase names
/// (`claim,prepare`); failed phases report `DEVICE_FAULT`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedFactory;

impl DeviceFactory for SimulatedFactory {
    fn device_type(&self) -> &str {
        "simulated"
    }

    fn build(&self, request: &CreateRequest<'_>) -> HostResult<LifecycleEngine> {
        let mut device = SimulatedDevice::new();
        for phase in phase_list(request.parameter("defer"))? {
            device = device.defer(phase);
        }
        for phase in phase_list(request.parameter("fail"))? {
            device = device.fail(phase, ErrorCode::DEVICE_FAULT);
        }
        Ok(LifecycleEngine::new(
            request.name.clone(),
            request.device_type,
            Box::new(device),
        ))
    }
}

fn phase_list(raw: Option<String>) -> HostResult<Vec<Phase>> {
    raw.map(|raw| {
        raw.split(',')
            .filter(|s| !s.trim().is_empty())
            .map(str::parse)
            .collect()
    })
    .unwrap_or_else(|| Ok(Vec::new()))
}

/// Composite device that waits for a quorum of its children.
///
/// Parameters: `quorum_percent`, `disconnected` (`exclude` | `count`) and
/// `child_type`, each defaulting to the host-wide quorum policy.
#[derive(Debug, Clone, Copy)]
pub struct CompositeFactory {
    defaults: QuorumPolicy,
}

impl CompositeFactory {
    pub fn new(defaults: QuorumPolicy) -> Self {
        Self { defaults }
    }
}

impl DeviceFactory for CompositeFactory {
    fn device_type(&self) -> &str {
        "composite"
    }

    fn build(&self, request: &CreateRequest<'_>) -> HostResult<LifecycleEngine> {
        let threshold = request
            .typed::<u8>("quorum_percent")?
            .unwrap_or(self.defaults.threshold_percent());
        let disconnected = request
            .typed::<DisconnectedPolicy>("disconnected")?
            .unwrap_or(self.defaults.disconnected());
        let policy = QuorumPolicy::new(threshold, disconnected)?;

        let mut behavior = CompositeBehavior::new(policy);
        if let Some(child_type) = request.parameter("child_type") {
            behavior = behavior.watching(child_type);
        }
        Ok(LifecycleEngine::new(
            request.name.clone(),
            request.device_type,
            Box::new(behavior),
        )
        .with_disconnected_policy(disconnected))
    }
}

/// Host-wide quorum default read from `devices.composite.*`.
pub fn quorum_from_config(config: &dyn ConfigSource, fallback: QuorumPolicy) -> HostResult<QuorumPolicy> {
    let threshold = optional_parameter::<u8>(config, "devices.composite.quorum_percent")?
        .unwrap_or(fallback.threshold_percent());
    let disconnected = optional_parameter::<DisconnectedPolicy>(config, "devices.composite.disconnected")?
        .unwrap_or(fallback.disconnected());
    QuorumPolicy::new(threshold, disconnected)
}
