//! Inbound credential transfer over OBEX Object Push

use super::credentials::{CredentialCandidate, CredentialStore};
use crate::error::ProvisioningError;
use anyhow::{Context, Result};
use log::{debug, info, warn};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use std::{fs, path::Path, path::PathBuf, process::Stdio, time::Duration};
use tokio::{
    process::{Child, Command},
    time::{Instant, MissedTickBehavior, interval, sleep_until},
};
use trait_variant::make;

/// Service receiving files pushed by a paired peer
#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait FilePushServer {
    /// Start accepting pushes into `root`
    async fn start(&mut self, root: &Path) -> Result<()>;
    /// Stop accepting pushes, stopping a stopped server is not an error
    async fn stop(&mut self) -> Result<()>;
}

/// `obexd` running in the foreground with auto-accept enabled
pub struct ObexPushServer {
    obexd_path: PathBuf,
    child: Option<Child>,
}

impl ObexPushServer {
    pub fn new(obexd_path: PathBuf) -> Self {
        Self {
            obexd_path,
            child: None,
        }
    }
}

impl FilePushServer for ObexPushServer {
    async fn start(&mut self, root: &Path) -> Result<()> {
        self.stop().await?;

        let mut child = Command::new(&self.obexd_path)
            .arg("--nodetach")
            .arg("--auto-accept")
            .arg(format!("--root={}", root.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context(format!("failed to spawn {:?}", self.obexd_path))?;

        if let Some(status) = child.try_wait().context("failed to query obexd")? {
            anyhow::bail!("obexd exited immediately with {status}");
        }

        info!("obex server accepting files into {root:?}");
        self.child = Some(child);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            child.kill().await.context("failed to stop obexd")?;
            info!("obex server stopped");
        }
        Ok(())
    }
}

/// Timing of the landing directory polling
#[derive(Clone, Debug)]
pub struct WatchPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for WatchPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(180),
        }
    }
}

/// Owns the file-push service and watches its landing directory for credentials
pub struct TransferWatcher<S> {
    server: S,
    store: CredentialStore,
    policy: WatchPolicy,
}

impl<S> TransferWatcher<S>
where
    S: FilePushServer,
{
    pub fn new(server: S, store: CredentialStore, policy: WatchPolicy) -> Self {
        Self {
            server,
            store,
            policy,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.policy.timeout
    }

    /// Prepare the landing directory and start the push service.
    ///
    /// Stale credential files are purged first so a previous session cannot be
    /// replayed.
    pub async fn enable(&mut self) -> Result<(), ProvisioningError> {
        let dir = self.store.dir().to_path_buf();

        fs::create_dir_all(&dir)
            .context(format!("failed to create landing directory {dir:?}"))
            .map_err(ProvisioningError::TransferServiceUnavailable)?;

        match self.store.purge() {
            Ok(0) => {}
            Ok(n) => info!("removed {n} stale credential file(s) from {dir:?}"),
            Err(e) => warn!("failed to clean up landing directory: {e:#}"),
        }

        self.server
            .start(&dir)
            .await
            .map_err(ProvisioningError::TransferServiceUnavailable)
    }

    /// Poll the landing directory until credentials arrive or the deadline passes
    pub async fn watch(&self) -> Result<Vec<CredentialCandidate>, ProvisioningError> {
        info!("watching for credentials in {:?}", self.store.dir());

        let deadline = Instant::now() + self.policy.timeout;
        let mut ticker = interval(self.policy.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut recognized_files = 0;

        loop {
            tokio::select! {
                biased;

                _ = ticker.tick() => {
                    match self.store.scan() {
                        Ok(scan) if !scan.candidates.is_empty() => return Ok(scan.candidates),
                        Ok(scan) => recognized_files = recognized_files.max(scan.recognized_files),
                        Err(e) => warn!("failed to scan landing directory: {e:#}"),
                    }
                }
                _ = sleep_until(deadline) => break,
            }
        }

        if recognized_files > 0 {
            Err(ProvisioningError::NoValidCredentials {
                files: recognized_files,
            })
        } else {
            Err(ProvisioningError::TransferTimeout(self.policy.timeout))
        }
    }

    /// Stop the push service and remove received credentials
    pub async fn disable(&mut self) -> Result<()> {
        let stopped = self.server.stop().await;

        match self.store.purge() {
            Ok(n) => debug!("removed {n} credential file(s) after session"),
            Err(e) => warn!("failed to remove credential files: {e:#}"),
        }

        stopped
    }
}
