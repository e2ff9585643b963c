//! Bluetooth adapter control
//!
//! The adapter is modelled as a trait so the provisioning workflow can run against
//! BlueZ on the device and against an in-memory adapter in tests.

pub mod bluez;
#[cfg(any(test, feature = "mock"))]
pub mod fake;

use crate::error::ProvisioningError;
use anyhow::Result;
use log::{debug, info, warn};
use std::{collections::BTreeMap, fmt, time::Duration, time::SystemTime};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until, timeout_at};
use trait_variant::make;

/// Pairing IO capability announced by the agent
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PairingCapability {
    DisplayOnly,
    DisplayYesNo,
    KeyboardOnly,
    /// Accept every pairing request without a PIN, used by headless devices
    #[default]
    NoInputNoOutput,
    KeyboardDisplay,
}

impl fmt::Display for PairingCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DisplayOnly => "DisplayOnly",
            Self::DisplayYesNo => "DisplayYesNo",
            Self::KeyboardOnly => "KeyboardOnly",
            Self::NoInputNoOutput => "NoInputNoOutput",
            Self::KeyboardDisplay => "KeyboardDisplay",
        };
        f.write_str(name)
    }
}

/// Remote device as seen by the adapter during one poll
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    pub address: String,
    pub alias: String,
    pub last_seen: SystemTime,
    pub connected: bool,
}

impl Device {
    pub fn new(address: impl Into<String>, alias: impl Into<String>, connected: bool) -> Self {
        Self {
            address: address.into(),
            alias: alias.into(),
            last_seen: SystemTime::now(),
            connected,
        }
    }
}

/// Control surface of the local Bluetooth adapter
#[make(Send)]
pub trait BluetoothAdapter {
    async fn power_on(&mut self) -> Result<()>;
    async fn power_off(&mut self) -> Result<()>;
    async fn set_alias(&mut self, alias: &str) -> Result<()>;
    async fn set_discoverable(&mut self, discoverable: bool) -> Result<()>;
    async fn set_pairable(&mut self, pairable: bool) -> Result<()>;
    async fn register_agent(&mut self, capability: PairingCapability) -> Result<()>;
    async fn cancel_agent(&mut self) -> Result<()>;
    async fn start_discovery(&mut self) -> Result<()>;
    async fn stop_discovery(&mut self) -> Result<()>;
    async fn list_devices(&self) -> Result<Vec<Device>>;

    /// Stop discovery, hide the adapter, drop the agent and optionally power off.
    ///
    /// Every step is attempted even if a previous one failed. Calling it again
    /// after a successful close has no further effect.
    async fn close(&mut self, power_off: bool) -> Result<()>;
}

/// Timing of the peer acceptance windows
#[derive(Clone, Debug)]
pub struct AcceptPolicy {
    pub window: Duration,
    pub poll_interval: Duration,
    pub max_windows: u32,
}

impl Default for AcceptPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(15),
            poll_interval: Duration::from_secs(1),
            max_windows: 5,
        }
    }
}

/// Connected peers and the number of windows it took to find them
#[derive(Clone, Debug)]
pub struct PeerAcceptance {
    pub devices: Vec<Device>,
    pub windows: u32,
}

/// Make the adapter visible and wait for a peer to connect.
///
/// A single scan window regularly misses devices, so up to `max_windows`
/// windows are opened in a row. Returns as soon as a window observes at least
/// one connected device.
pub async fn accept_peer<A>(
    adapter: &mut A,
    policy: &AcceptPolicy,
) -> Result<PeerAcceptance, ProvisioningError>
where
    A: BluetoothAdapter,
{
    for window in 1..=policy.max_windows {
        info!("accepting bluetooth connections (window {window}/{})", policy.max_windows);

        let devices = match accept_window(adapter, policy).await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("window {window}: failed to accept bluetooth connections: {e:#}");
                continue;
            }
        };

        if devices.is_empty() {
            info!("window {window}: no devices connected via bluetooth");
            continue;
        }

        for device in &devices {
            info!("peer connected: {} ({})", device.alias, device.address);
        }

        return Ok(PeerAcceptance { devices, windows: window });
    }

    Err(ProvisioningError::NoPeerConnected {
        windows: policy.max_windows,
    })
}

async fn accept_window<A>(adapter: &mut A, policy: &AcceptPolicy) -> Result<Vec<Device>>
where
    A: BluetoothAdapter,
{
    adapter.set_discoverable(true).await?;
    adapter.set_pairable(true).await?;
    adapter.start_discovery().await?;

    let connected = poll_connected(adapter, policy).await;

    if let Err(e) = adapter.stop_discovery().await {
        warn!("failed to stop discovery: {e:#}");
    }

    Ok(connected.into_values().collect())
}

async fn poll_connected<A>(adapter: &A, policy: &AcceptPolicy) -> BTreeMap<String, Device>
where
    A: BluetoothAdapter,
{
    let deadline = Instant::now() + policy.window;
    let mut ticker = interval(policy.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut connected = BTreeMap::new();

    loop {
        tokio::select! {
            biased;

            _ = sleep_until(deadline) => break,
            _ = ticker.tick() => {
                match timeout_at(deadline, adapter.list_devices()).await {
                    Err(_) => {
                        warn!("listing bluetooth devices did not finish before the window closed");
                        break;
                    }
                    Ok(Ok(devices)) => {
                        for device in devices {
                            debug!(
                                "discovered device: {} ({}) connected={}",
                                device.alias, device.address, device.connected
                            );
                            if device.connected {
                                connected.insert(device.address.clone(), device);
                            }
                        }
                    }
                    Ok(Err(e)) => warn!("failed to list bluetooth devices: {e:#}"),
                }

                if !connected.is_empty() {
                    break;
                }
            }
        }
    }

    connected
}
