use crate::command::{CommandRunner, SystemCommandRunner};
use anyhow::{Context, Result, ensure};
use log::{debug, info, warn};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use trait_variant::make;

/// Answers whether the host currently reaches the internet
#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait ConnectivityProbe {
    /// Single reachability check against `target`, callers own any retry policy
    async fn is_online(&self, target: &str) -> bool;
}

/// Probes connectivity with an HTTP GET that must answer `200 OK`
pub struct HttpConnectivityProbe {
    client: Client,
    runner: SystemCommandRunner,
}

impl HttpConnectivityProbe {
    pub fn new(timeout: Duration, runner: SystemCommandRunner) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to create connectivity probe client")?;

        Ok(Self { client, runner })
    }

    async fn check(&self, target: &str) -> Result<()> {
        let res = self
            .client
            .get(target)
            .send()
            .await
            .context(format!("failed to send GET request to {target}"))?;

        let status = res.status();
        ensure!(
            status == StatusCode::OK,
            "GET {target} answered with status {status}"
        );

        Ok(())
    }

    /// Name of the Wi-Fi network the host is associated with
    pub async fn current_network(&self) -> Result<String> {
        let ssid = self.runner.run("iwgetid", vec!["-r".to_string()]).await?;
        ensure!(!ssid.is_empty(), "failed to get current network: not associated");
        Ok(ssid)
    }
}

impl ConnectivityProbe for HttpConnectivityProbe {
    async fn is_online(&self, target: &str) -> bool {
        if let Err(e) = self.check(target).await {
            info!("not connected to the internet: {e:#}");
            return false;
        }

        match self.current_network().await {
            Ok(ssid) => info!("connected to wi-fi network: {ssid}"),
            Err(e) => warn!("failed to get current network: {e:#}"),
        }
        debug!("connectivity check against {target} succeeded");

        true
    }
}
