//! Fleet device host
//!
//! Runs the devices assigned to this machine: their lifecycles, schedules,
//! links to parents, children and listeners, and the fleet-level
//! reconciliation controller.
//!
//! ## Architecture
//!
//! - **Host loop**: a `HostActor` owning every device, link and schedule
//! - **Controller loop**: a `ControllerActor` ticking desired-state records
//! - **Shutdown**: ctrl-c stops both loops; devices are shut down on the way

use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_device_host::actors::{spawn_actor, ControllerActor, HostActor, HostClient};
use fleet_device_host::{Host, HostConfig, MapConfigSource, SystemClock, TracingStatusSink};
use fleet_events::Params;
use fleet_id::DeviceName;
use fleet_reconcile::{CompletionMode, MockLauncher, ReconciliationController};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const MAILBOX_SIZE: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    let config = HostConfig::from_env().context("loading configuration")?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        host_name = %config.host_name,
        min_lead_ms = config.min_lead.as_millis() as u64,
        event_buffer_cap = config.event_buffer_cap,
        quorum_percent = config.quorum.threshold_percent(),
        "Starting device host"
    );

    let clock = Arc::new(SystemClock);
    let params = Arc::new(MapConfigSource::from_vars("FLEET_PARAM_", std::env::vars()));

    let host = Host::new(config.clone(), clock.clone(), Arc::new(TracingStatusSink), params)
        .context("building host")?;
    let (host_handle, host_ref) = spawn_actor(HostActor::new(host), MAILBOX_SIZE);
    let client = HostClient::new(host_handle);

    // No remote controller processes are wired in yet; the mock launcher
    // records attempts so the loop can run standalone.
    let controller = ReconciliationController::new(config.controller_config(), CompletionMode::Poll);
    let (_controller_handle, controller_ref) = spawn_actor(
        ControllerActor::new(
            controller,
            Arc::new(MockLauncher::new()),
            clock,
            config.controller_tick,
        ),
        MAILBOX_SIZE,
    );

    for (device_type, name) in &config.boot_devices {
        let name = match DeviceName::new(name.as_str()) {
            Ok(name) => name,
            Err(e) => {
                warn!(device = %name, error = %e, "Skipping boot device");
                continue;
            }
        };
        match client.create_device(device_type.as_str(), name.clone(), Params::new()).await {
            Ok(()) => info!(device = %name, device_type = %device_type, "Boot device created"),
            Err(e) => error!(device = %name, device_type = %device_type, error = %e, "Boot device failed"),
        }
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Received shutdown signal");

    host_ref.stop();
    controller_ref.stop();
    host_ref.join().await;
    controller_ref.join().await;

    info!("Device host shutdown complete");
    Ok(())
}
