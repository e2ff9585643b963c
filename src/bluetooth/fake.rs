//! In-memory adapter with scripted peers

use super::{BluetoothAdapter, Device, PairingCapability};
use anyhow::{Result, bail};
use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

/// Observable state of a [`FakeAdapter`]
#[derive(Clone, Debug, Default)]
pub struct FakeState {
    pub powered: bool,
    pub alias: Option<String>,
    pub discoverable: bool,
    pub pairable: bool,
    pub discovering: bool,
    pub agent: Option<PairingCapability>,
    /// Number of discovery sessions started so far
    pub discovery_sessions: usize,
    pub list_calls: usize,
    pub close_calls: usize,
    /// `(discoverable, pairable)` captured at every `power_on`
    pub visible_at_power_on: Vec<(bool, bool)>,
}

/// Clonable handle to an in-memory adapter.
///
/// `list_devices` answers with the devices scripted for the current discovery
/// session, sessions beyond the script see no devices.
#[derive(Clone, Default)]
pub struct FakeAdapter {
    state: Arc<Mutex<FakeState>>,
    windows: Arc<Vec<Vec<Device>>>,
    unavailable: bool,
    list_delay: Duration,
}

impl FakeAdapter {
    pub fn with_windows(windows: Vec<Vec<Device>>) -> Self {
        Self {
            windows: Arc::new(windows),
            ..Default::default()
        }
    }

    /// Adapter that fails to power on, like a host without a controller
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Default::default()
        }
    }

    /// Every `list_devices` call takes `delay` before answering
    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = delay;
        self
    }

    pub fn state(&self) -> FakeState {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl BluetoothAdapter for FakeAdapter {
    async fn power_on(&mut self) -> Result<()> {
        if self.unavailable {
            bail!("no default controller available");
        }
        let mut state = self.lock();
        let visible = (state.discoverable, state.pairable);
        state.visible_at_power_on.push(visible);
        state.powered = true;
        Ok(())
    }

    async fn power_off(&mut self) -> Result<()> {
        self.lock().powered = false;
        Ok(())
    }

    async fn set_alias(&mut self, alias: &str) -> Result<()> {
        self.lock().alias = Some(alias.to_string());
        Ok(())
    }

    async fn set_discoverable(&mut self, discoverable: bool) -> Result<()> {
        self.lock().discoverable = discoverable;
        Ok(())
    }

    async fn set_pairable(&mut self, pairable: bool) -> Result<()> {
        self.lock().pairable = pairable;
        Ok(())
    }

    async fn register_agent(&mut self, capability: PairingCapability) -> Result<()> {
        self.lock().agent = Some(capability);
        Ok(())
    }

    async fn cancel_agent(&mut self) -> Result<()> {
        self.lock().agent = None;
        Ok(())
    }

    async fn start_discovery(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.discovering = true;
        state.discovery_sessions += 1;
        Ok(())
    }

    async fn stop_discovery(&mut self) -> Result<()> {
        self.lock().discovering = false;
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        let devices = {
            let mut state = self.lock();
            state.list_calls += 1;

            match state.discovery_sessions {
                session if state.discovering && session > 0 => {
                    self.windows.get(session - 1).cloned().unwrap_or_default()
                }
                _ => vec![],
            }
        };

        if !self.list_delay.is_zero() {
            tokio::time::sleep(self.list_delay).await;
        }
        Ok(devices)
    }

    async fn close(&mut self, power_off: bool) -> Result<()> {
        let mut state = self.lock();
        state.close_calls += 1;
        state.discovering = false;
        state.discoverable = false;
        state.pairable = false;
        state.agent = None;
        if power_off {
            state.powered = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut adapter = FakeAdapter::default();
        adapter.power_on().await.expect("should power on");
        adapter.set_discoverable(true).await.expect("should be visible");
        adapter.set_pairable(true).await.expect("should be pairable");
        adapter
            .register_agent(PairingCapability::NoInputNoOutput)
            .await
            .expect("should register agent");

        adapter.close(true).await.expect("first close should succeed");
        let after_first = adapter.state();
        adapter.close(true).await.expect("second close should succeed");
        let after_second = adapter.state();

        assert!(!after_second.discoverable);
        assert!(!after_second.pairable);
        assert!(!after_second.powered);
        assert_eq!(after_second.agent, None);
        assert_eq!(after_first.discoverable, after_second.discoverable);
        assert_eq!(after_first.powered, after_second.powered);
        assert_eq!(after_second.close_calls, 2);
    }

    #[tokio::test]
    async fn unavailable_adapter_fails_to_power_on() {
        let mut adapter = FakeAdapter::unavailable();
        assert!(adapter.power_on().await.is_err());
    }
}
