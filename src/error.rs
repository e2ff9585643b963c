use log::Level;
use std::time::Duration;
use thiserror::Error;

/// Terminal and per-step failures of a provisioning session
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// The host lacks a usable Bluetooth controller. Never retried.
    #[error("bluetooth adapter unavailable: {0:#}")]
    AdapterUnavailable(#[source] anyhow::Error),

    /// The OBEX file-push service could not be started.
    #[error("file push service unavailable: {0:#}")]
    TransferServiceUnavailable(#[source] anyhow::Error),

    #[error("no peer connected within {windows} discovery window(s)")]
    NoPeerConnected { windows: u32 },

    #[error("no credentials received within {}s", .0.as_secs())]
    TransferTimeout(Duration),

    #[error("received {files} credential file(s) but none were valid")]
    NoValidCredentials { files: usize },

    /// Applying a single candidate failed; the configurator moves on to the next one.
    #[error("failed to apply credentials for \"{ssid}\": {reason:#}")]
    PerCandidateApplyFailure {
        ssid: String,
        #[source]
        reason: anyhow::Error,
    },

    #[error("all {attempted} credential candidate attempt(s) exhausted")]
    AllCandidatesExhausted { attempted: usize },

    #[error("credentials applied but device is still offline")]
    VerificationFailed,
}

impl ProvisioningError {
    /// Whether the orchestrator may continue after this error
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::PerCandidateApplyFailure { .. })
    }

    /// Level to report this error at, fatal errors are errors and the rest warnings
    pub fn log_level(&self) -> Level {
        if self.is_fatal() {
            Level::Error
        } else {
            Level::Warn
        }
    }
}
