use crate::{bluetooth::PairingCapability, services::network::NetworkStrategy};
use anyhow::{Context, Result};
use std::{env, path::PathBuf, str::FromStr, sync::OnceLock, time::Duration};

/// Upper bound for every configured duration
const MAX_DURATION_SECS: u64 = 24 * 60 * 60;
const MAX_WINDOWS: u32 = 100;

/// Provisioner configuration loaded and validated at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Connectivity probe configuration
    pub probe: ProbeConfig,

    /// External process configuration
    pub command: CommandConfig,

    /// Bluetooth adapter configuration
    pub bluetooth: BluetoothConfig,

    /// Credential transfer configuration
    pub transfer: TransferConfig,

    /// Network configurator configuration
    pub network: NetworkConfig,
}

#[derive(Clone, Debug)]
pub struct ProbeConfig {
    /// Target checked before provisioning starts
    pub url: String,
    /// Target checked after credentials were applied
    pub verify_url: String,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct CommandConfig {
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct BluetoothConfig {
    pub alias: String,
    pub capability: PairingCapability,
    pub accept_window: Duration,
    pub poll_interval: Duration,
    pub max_windows: u32,
    pub power_off_on_close: bool,
    pub agent_path: PathBuf,
    pub obexd_path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct TransferConfig {
    pub landing_dir: PathBuf,
    pub extension: String,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub strategy: NetworkStrategy,
    pub fallback: bool,
    pub supplicant_conf: PathBuf,
    pub networking_service: String,
    /// Time given to the network stack between connecting and probing
    pub settle: Duration,
}

impl AppConfig {
    /// Get or load the configuration from the process environment
    ///
    /// # Panics
    /// Panics if loading fails, the provisioner cannot run without a valid configuration.
    pub fn get() -> &'static Self {
        static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();
        APP_CONFIG.get_or_init(|| {
            Self::from_lookup(|key| env::var(key).ok())
                .expect("failed to load provisioner configuration")
        })
    }

    /// Build the configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let probe = ProbeConfig {
            url: vars.string("PROBE_URL", "http://www.google.com"),
            verify_url: vars.string("VERIFY_URL", "http://www.google.com"),
            timeout: vars.secs("PROBE_TIMEOUT_SECS", 10)?,
        };

        let command = CommandConfig {
            timeout: vars.secs("COMMAND_TIMEOUT_SECS", 30)?,
        };

        let bluetooth = BluetoothConfig {
            alias: vars.string("BT_ALIAS", "SunlightMeter"),
            capability: PairingCapability::NoInputNoOutput,
            accept_window: vars.secs("BT_ACCEPT_WINDOW_SECS", 15)?,
            poll_interval: vars.secs("BT_POLL_INTERVAL_SECS", 1)?,
            max_windows: vars.parse("BT_MAX_WINDOWS", 5)?,
            power_off_on_close: vars.parse("BT_POWER_OFF_ON_CLOSE", true)?,
            agent_path: vars.string("BT_AGENT_PATH", "bt-agent").into(),
            obexd_path: vars
                .string("OBEXD_PATH", "/usr/lib/bluetooth/obexd")
                .into(),
        };

        let transfer = TransferConfig {
            landing_dir: vars
                .string("TRANSFER_DIR", "/home/sunlight/sunlight-meter/transfers")
                .into(),
            extension: vars
                .string("TRANSFER_EXTENSION", "creds")
                .trim_start_matches('.')
                .to_string(),
            poll_interval: vars.secs("TRANSFER_POLL_INTERVAL_SECS", 5)?,
            timeout: vars.secs("TRANSFER_TIMEOUT_SECS", 180)?,
        };

        let network = NetworkConfig {
            strategy: vars.parse("NETWORK_STRATEGY", NetworkStrategy::ConnectionManager)?,
            fallback: vars.parse("NETWORK_FALLBACK", true)?,
            supplicant_conf: vars
                .string("SUPPLICANT_CONF_PATH", "/etc/wpa_supplicant/wpa_supplicant.conf")
                .into(),
            networking_service: vars.string("NETWORKING_SERVICE", "networking"),
            settle: vars.secs("NETWORK_SETTLE_SECS", 5)?,
        };

        anyhow::ensure!(
            (1..=MAX_WINDOWS).contains(&bluetooth.max_windows),
            "failed to load BT_MAX_WINDOWS: must be between 1 and {MAX_WINDOWS}"
        );
        anyhow::ensure!(
            !bluetooth.poll_interval.is_zero() && !transfer.poll_interval.is_zero(),
            "failed to load poll intervals: must be at least 1s"
        );

        Ok(Self {
            probe,
            command,
            bluetooth,
            transfer,
            network,
        })
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str, default: &str) -> String {
        (self.0)(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.0)(key) {
            Some(value) => value
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("{e}"))
                .context(format!("failed to parse {key}: invalid format")),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &str, default: u64) -> Result<Duration> {
        let secs = self.parse(key, default)?;
        anyhow::ensure!(
            secs <= MAX_DURATION_SECS,
            "failed to load {key}: must be at most {MAX_DURATION_SECS}s"
        );
        Ok(Duration::from_secs(secs))
    }
}
