//! BlueZ backed adapter driven through `bluetoothctl` and `bt-agent`

use super::{BluetoothAdapter, Device, PairingCapability};
use crate::command::{CommandRunner, args};
use anyhow::{Context, Result, ensure};
use log::{debug, info, warn};
use std::{
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::process::{Child, Command};

const BLUETOOTHCTL: &str = "bluetoothctl";

pub struct BluezAdapter<R> {
    runner: R,
    agent_path: PathBuf,
    address: Option<String>,
    agent: Option<Child>,
    discovery: Option<Child>,
    // last state set through this handle, `None` until known
    powered: Option<bool>,
    discoverable: Option<bool>,
    pairable: Option<bool>,
}

impl<R> BluezAdapter<R>
where
    R: CommandRunner,
{
    /// Create an adapter handle, the controller is looked up on first power on
    pub fn new(runner: R, agent_path: PathBuf) -> Self {
        Self {
            runner,
            agent_path,
            address: None,
            agent: None,
            discovery: None,
            powered: None,
            discoverable: None,
            pairable: None,
        }
    }

    /// Address of the default controller once it was found
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Find the default controller of the host
    ///
    /// # Errors
    /// Fails if the host is not Linux, `bluetoothctl` is missing or no controller exists
    async fn attach(&mut self) -> Result<()> {
        if self.address.is_some() {
            return Ok(());
        }

        ensure!(
            cfg!(target_os = "linux"),
            "unsupported OS: {}",
            std::env::consts::OS
        );

        let out = self
            .ctl(["list"])
            .await
            .context("failed to list bluetooth controllers")?;
        let address = default_controller(&out).context("failed to find a bluetooth controller")?;

        info!("bluetooth controller address: {address}");
        self.address = Some(address);
        Ok(())
    }

    async fn ctl<const N: usize>(&self, cmd: [&str; N]) -> Result<String> {
        self.runner.run(BLUETOOTHCTL, args(cmd)).await
    }

    async fn device(&self, address: &str, fallback_alias: &str) -> Result<Device> {
        let info = self.ctl(["info", address]).await?;
        let mut device = Device::new(address, fallback_alias, false);

        for (key, value) in info.lines().filter_map(|line| line.trim().split_once(':')) {
            match key.trim() {
                "Alias" => device.alias = value.trim().to_string(),
                "Connected" => device.connected = value.trim() == "yes",
                _ => {}
            }
        }

        Ok(device)
    }
}

impl<R> BluetoothAdapter for BluezAdapter<R>
where
    R: CommandRunner + Send + Sync,
{
    async fn power_on(&mut self) -> Result<()> {
        self.attach().await?;
        self.ctl(["power", "on"]).await?;
        // the controller may come up with its configured visibility
        self.powered = Some(true);
        self.discoverable = None;
        self.pairable = None;
        Ok(())
    }

    async fn power_off(&mut self) -> Result<()> {
        self.ctl(["power", "off"]).await?;
        self.powered = Some(false);
        Ok(())
    }

    async fn set_alias(&mut self, alias: &str) -> Result<()> {
        self.ctl(["system-alias", alias]).await.map(|_| ())
    }

    async fn set_discoverable(&mut self, discoverable: bool) -> Result<()> {
        if discoverable {
            // stay visible for the whole window instead of the controller default
            self.ctl(["discoverable-timeout", "0"]).await?;
        }
        self.ctl(["discoverable", on_off(discoverable)]).await?;
        self.discoverable = Some(discoverable);
        Ok(())
    }

    async fn set_pairable(&mut self, pairable: bool) -> Result<()> {
        self.ctl(["pairable", on_off(pairable)]).await?;
        self.pairable = Some(pairable);
        Ok(())
    }

    async fn register_agent(&mut self, capability: PairingCapability) -> Result<()> {
        self.cancel_agent().await?;

        let child = spawn(
            &self.agent_path,
            &[format!("--capability={capability}")],
        )
        .context("failed to start pairing agent")?;

        info!("pairing agent registered with capability {capability}");
        self.agent = Some(child);
        Ok(())
    }

    async fn cancel_agent(&mut self) -> Result<()> {
        if let Some(mut child) = self.agent.take() {
            child.kill().await.context("failed to stop pairing agent")?;
            debug!("pairing agent stopped");
        }
        Ok(())
    }

    async fn start_discovery(&mut self) -> Result<()> {
        if self.discovery.is_some() {
            return Ok(());
        }

        let child = spawn(
            Path::new(BLUETOOTHCTL),
            &args(["scan", "on"]),
        )
        .context("failed to start discovery")?;

        self.discovery = Some(child);
        Ok(())
    }

    async fn stop_discovery(&mut self) -> Result<()> {
        if let Some(mut child) = self.discovery.take() {
            child.kill().await.context("failed to stop discovery")?;
        }
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        let out = self.ctl(["devices"]).await?;
        let mut devices = vec![];

        for (address, alias) in parse_devices(&out) {
            match self.device(address, alias).await {
                Ok(device) => devices.push(device),
                Err(e) => {
                    warn!("failed to get info for {address}: {e:#}");
                    devices.push(Device::new(address, alias, false));
                }
            }
        }

        Ok(devices)
    }

    async fn close(&mut self, power_off: bool) -> Result<()> {
        let mut errors = vec![];

        if let Err(e) = self.stop_discovery().await {
            errors.push(e);
        }
        if self.discoverable != Some(false) {
            if let Err(e) = self.set_discoverable(false).await {
                errors.push(e);
            }
        }
        if self.pairable != Some(false) {
            if let Err(e) = self.set_pairable(false).await {
                errors.push(e);
            }
        }
        if let Err(e) = self.cancel_agent().await {
            errors.push(e);
        }
        if power_off && self.powered != Some(false) {
            if let Err(e) = self.power_off().await {
                errors.push(e);
            }
        }

        let mut errors = errors.into_iter();
        let Some(first) = errors.next() else {
            return Ok(());
        };
        for e in errors {
            warn!("failed to close bluetooth adapter: {e:#}");
        }
        Err(first.context("failed to close bluetooth adapter"))
    }
}

fn on_off(value: bool) -> &'static str {
    if value { "on" } else { "off" }
}

fn spawn(program: &Path, args: &[String]) -> Result<Child> {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context(format!("failed to spawn {program:?}"))
}

/// Address of the default controller from `bluetoothctl list` output
fn default_controller(out: &str) -> Option<String> {
    let controllers: Vec<&str> = out
        .lines()
        .filter(|line| line.starts_with("Controller "))
        .collect();

    controllers
        .iter()
        .find(|line| line.contains("[default]"))
        .or(controllers.first())
        .and_then(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
}

/// `(address, alias)` pairs from `bluetoothctl devices` output
fn parse_devices(out: &str) -> Vec<(&str, &str)> {
    out.lines()
        .filter_map(|line| line.trim().strip_prefix("Device "))
        .filter_map(|rest| {
            let (address, alias) = rest.split_once(' ').unwrap_or((rest, ""));
            (!address.is_empty()).then_some((address, alias.trim()))
        })
        .collect()
}
