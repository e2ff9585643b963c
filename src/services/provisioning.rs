//! Provisioning session orchestration
//!
//! A session walks `Idle → CheckingConnectivity → EnablingAdapter → AwaitingPeer →
//! ReceivingCredentials → ApplyingNetwork → Verifying` and ends in `Succeeded` or
//! `Failed`. Everything acquired after the connectivity check is released again
//! before the session returns.

use super::{
    credentials::CredentialCandidate,
    network::NetworkConfigService,
    transfer::{FilePushServer, TransferWatcher},
};
use crate::{
    bluetooth::{AcceptPolicy, BluetoothAdapter, PairingCapability, accept_peer},
    command::CommandRunner,
    config::AppConfig,
    connectivity::ConnectivityProbe,
    error::ProvisioningError,
};
use anyhow::{Context, Result};
use log::{debug, error, info, log, warn};
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    #[default]
    Idle,
    CheckingConnectivity,
    EnablingAdapter,
    AwaitingPeer,
    ReceivingCredentials,
    ApplyingNetwork,
    Verifying,
    Succeeded,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Attempts {
    pub peer_windows: u32,
    pub candidates_attempted: usize,
}

#[derive(Clone, Debug, Default)]
pub struct Deadlines {
    pub peer: Option<Instant>,
    pub transfer: Option<Instant>,
}

/// Progress of a single `provision_if_needed` invocation
#[derive(Debug)]
pub struct ProvisioningSession {
    state: SessionState,
    pub attempts: Attempts,
    pub deadlines: Deadlines,
    pub candidates: Vec<CredentialCandidate>,
    history: Vec<SessionState>,
}

impl Default for ProvisioningSession {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            attempts: Attempts::default(),
            deadlines: Deadlines::default(),
            candidates: vec![],
            history: vec![SessionState::Idle],
        }
    }
}

impl ProvisioningSession {
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// States entered so far, starting with `Idle`
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    /// Move forward to `next`.
    ///
    /// `Failed` can be entered from any non-terminal state, every other
    /// transition must move forward. Rejected transitions are logged and leave
    /// the session unchanged.
    pub fn advance(&mut self, next: SessionState) -> bool {
        let allowed = !self.state.is_terminal()
            && (next == SessionState::Failed || next > self.state);

        if !allowed {
            warn!(
                "ignoring session transition from {:?} to {:?}",
                self.state, next
            );
            return false;
        }

        debug!("session state: {:?} -> {next:?}", self.state);
        self.state = next;
        self.history.push(next);
        true
    }
}

/// Values the provisioner needs beyond its collaborators
#[derive(Clone, Debug)]
pub struct ProvisionerSettings {
    pub probe_url: String,
    pub alias: String,
    pub capability: PairingCapability,
    pub accept: AcceptPolicy,
    pub power_off_on_close: bool,
}

impl ProvisionerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let bluetooth = &config.bluetooth;

        Self {
            probe_url: config.probe.url.clone(),
            alias: bluetooth.alias.clone(),
            capability: bluetooth.capability,
            accept: AcceptPolicy {
                window: bluetooth.accept_window,
                poll_interval: bluetooth.poll_interval,
                max_windows: bluetooth.max_windows,
            },
            power_off_on_close: bluetooth.power_off_on_close,
        }
    }
}

/// Brings an offline device online with credentials pushed over Bluetooth
pub struct Provisioner<A, S, P, R> {
    adapter: A,
    watcher: TransferWatcher<S>,
    probe: P,
    network: NetworkConfigService<R>,
    settings: ProvisionerSettings,
    session: ProvisioningSession,
}

impl<A, S, P, R> Provisioner<A, S, P, R>
where
    A: BluetoothAdapter,
    S: FilePushServer,
    P: ConnectivityProbe,
    R: CommandRunner,
{
    pub fn new(
        adapter: A,
        watcher: TransferWatcher<S>,
        probe: P,
        network: NetworkConfigService<R>,
        settings: ProvisionerSettings,
    ) -> Self {
        Self {
            adapter,
            watcher,
            probe,
            network,
            settings,
            session: ProvisioningSession::default(),
        }
    }

    /// The most recent session
    pub fn session(&self) -> &ProvisioningSession {
        &self.session
    }

    /// Run a provisioning session unless the device is already online
    ///
    /// # Returns
    /// `Ok(())` if the device was online or came online, otherwise the error that
    /// ended the session. The adapter and file-push service are released on
    /// every path that acquired them.
    pub async fn provision_if_needed(&mut self) -> Result<(), ProvisioningError> {
        self.session = ProvisioningSession::default();
        self.session.advance(SessionState::CheckingConnectivity);

        if self.probe.is_online(&self.settings.probe_url).await {
            info!("device is online, provisioning not needed");
            self.session.advance(SessionState::Succeeded);
            return Ok(());
        }

        info!("device is offline, starting bluetooth provisioning");

        let result = self.run_session().await;

        self.teardown().await;

        match &result {
            Ok(()) => {
                info!("provisioning succeeded");
                self.session.advance(SessionState::Succeeded);
            }
            Err(e) => {
                log!(
                    e.log_level(),
                    "provisioning failed in {:?}: {e}",
                    self.session.state()
                );
                self.session.advance(SessionState::Failed);
            }
        }

        result
    }

    async fn run_session(&mut self) -> Result<(), ProvisioningError> {
        self.session.advance(SessionState::EnablingAdapter);
        self.enable_adapter()
            .await
            .map_err(ProvisioningError::AdapterUnavailable)?;
        self.watcher.enable().await?;

        self.session.advance(SessionState::AwaitingPeer);
        let accept = &self.settings.accept;
        self.session.deadlines.peer =
            Instant::now().checked_add(accept.window.saturating_mul(accept.max_windows));

        let acceptance = accept_peer(&mut self.adapter, accept).await;
        let acceptance = match acceptance {
            Ok(acceptance) => acceptance,
            Err(e) => {
                if let ProvisioningError::NoPeerConnected { windows } = e {
                    self.session.attempts.peer_windows = windows;
                }
                return Err(e);
            }
        };
        self.session.attempts.peer_windows = acceptance.windows;

        self.session.advance(SessionState::ReceivingCredentials);
        self.session.deadlines.transfer = Instant::now().checked_add(self.watcher.timeout());

        let received = self.watcher.watch().await;
        self.close_window().await;
        self.session.candidates = received?;

        info!(
            "received {} credential candidate(s)",
            self.session.candidates.len()
        );

        self.session.advance(SessionState::ApplyingNetwork);
        let applied = self
            .network
            .apply_and_verify(&self.session.candidates, &self.probe)
            .await;
        let applied = match applied {
            Ok(applied) => applied,
            Err(e) => {
                if let ProvisioningError::AllCandidatesExhausted { attempted } = e {
                    self.session.attempts.candidates_attempted = attempted;
                }
                return Err(e);
            }
        };
        self.session.attempts.candidates_attempted = applied.attempts;

        self.session.advance(SessionState::Verifying);
        if !self.probe.is_online(&self.settings.probe_url).await {
            return Err(ProvisioningError::VerificationFailed);
        }

        info!("device is online via {}", applied.ssid);
        Ok(())
    }

    async fn enable_adapter(&mut self) -> Result<()> {
        // a controller left visible must not be seen before AwaitingPeer
        if let Err(e) = self.hide_adapter().await {
            debug!("failed to hide adapter before power on: {e:#}");
        }
        self.adapter
            .power_on()
            .await
            .context("failed to power on adapter")?;
        self.hide_adapter().await?;
        self.adapter
            .set_alias(&self.settings.alias)
            .await
            .context("failed to set adapter alias")?;
        self.adapter
            .register_agent(self.settings.capability)
            .await
            .context("failed to register pairing agent")?;

        info!(
            "bluetooth adapter enabled as {} ({})",
            self.settings.alias, self.settings.capability
        );
        Ok(())
    }

    async fn hide_adapter(&mut self) -> Result<()> {
        self.adapter
            .set_discoverable(false)
            .await
            .context("failed to disable discoverable mode")?;
        self.adapter
            .set_pairable(false)
            .await
            .context("failed to disable pairable mode")
    }

    /// Hide the adapter once the transfer step is over
    async fn close_window(&mut self) {
        if let Err(e) = self.hide_adapter().await {
            warn!("{e:#}");
        }
    }

    /// Stop the file-push service, purge credentials and close the adapter.
    ///
    /// Runs at the end of every session that got past the connectivity check.
    /// Calling it again has no further effect.
    pub async fn teardown(&mut self) {
        if let Err(e) = self.watcher.disable().await {
            error!("failed to stop file push service: {e:#}");
        }
        if let Err(e) = self.adapter.close(self.settings.power_off_on_close).await {
            error!("failed to close bluetooth adapter: {e:#}");
        }
        debug!("provisioning resources released");
    }
}
