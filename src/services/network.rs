use super::credentials::CredentialCandidate;
use crate::{
    command::{CommandRunner, args},
    config::NetworkConfig,
    connectivity::ConnectivityProbe,
    error::ProvisioningError,
};
use anyhow::{Context, Result, anyhow, ensure};
use log::{debug, error, info, log, warn};
use std::{
    fmt, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
};
use tokio::time::sleep;

// ============================================================================
// Macros
// ============================================================================

macro_rules! supplicant_backup_file {
    ($conf:expr) => {
        PathBuf::from(format!("{}.old", $conf.display()))
    };
}

macro_rules! supplicant_tmp_file {
    ($conf:expr) => {
        PathBuf::from(format!("{}.tmp", $conf.display()))
    };
}

// ============================================================================
// Constants
// ============================================================================

const NMCLI: &str = "nmcli";
const SYSTEMCTL: &str = "systemctl";

// ============================================================================
// Structs
// ============================================================================

/// Mechanism used to hand credentials to the host network stack
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkStrategy {
    /// NetworkManager via `nmcli`
    ConnectionManager,
    /// Append to the wpa_supplicant configuration and restart networking
    Supplicant,
}

impl NetworkStrategy {
    fn other(self) -> Self {
        match self {
            Self::ConnectionManager => Self::Supplicant,
            Self::Supplicant => Self::ConnectionManager,
        }
    }
}

impl fmt::Display for NetworkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionManager => f.write_str("connection-manager"),
            Self::Supplicant => f.write_str("supplicant"),
        }
    }
}

impl FromStr for NetworkStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "connection-manager" | "nmcli" => Ok(Self::ConnectionManager),
            "supplicant" | "wpa_supplicant" => Ok(Self::Supplicant),
            other => Err(anyhow!(
                "unknown network strategy \"{other}\", expected connection-manager or supplicant"
            )),
        }
    }
}

/// The candidate that brought the device online
#[derive(Debug)]
pub struct AppliedNetwork {
    pub ssid: String,
    pub strategy: NetworkStrategy,
    /// Candidate attempts made across all strategies, including the successful one
    pub attempts: usize,
}

// ============================================================================
// Service
// ============================================================================

/// Service applying credential candidates to the host network stack
pub struct NetworkConfigService<R> {
    runner: R,
    config: NetworkConfig,
    verify_url: String,
}

impl<R> NetworkConfigService<R>
where
    R: CommandRunner,
{
    pub fn new(runner: R, config: NetworkConfig, verify_url: impl Into<String>) -> Self {
        Self {
            runner,
            config,
            verify_url: verify_url.into(),
        }
    }

    /// Strategies in the order they are attempted
    pub fn strategies(&self) -> Vec<NetworkStrategy> {
        let primary = self.config.strategy;
        if self.config.fallback {
            vec![primary, primary.other()]
        } else {
            vec![primary]
        }
    }

    /// Apply candidates in order until one yields verified connectivity
    ///
    /// The primary strategy tries every candidate before the fallback strategy
    /// gets its turn.
    ///
    /// # Arguments
    /// * `candidates` - Credentials in the order they were received
    /// * `probe` - Connectivity probe used to verify each applied candidate
    ///
    /// # Returns
    /// The applied network, or `AllCandidatesExhausted`
    pub async fn apply_and_verify<P>(
        &self,
        candidates: &[CredentialCandidate],
        probe: &P,
    ) -> Result<AppliedNetwork, ProvisioningError>
    where
        P: ConnectivityProbe,
    {
        let mut attempts = 0;

        for strategy in self.strategies() {
            info!("applying {} candidate(s) via {strategy}", candidates.len());

            let applied = match strategy {
                NetworkStrategy::ConnectionManager => {
                    self.apply_with_connection_manager(candidates, probe, &mut attempts)
                        .await
                }
                NetworkStrategy::Supplicant => {
                    self.apply_with_supplicant(candidates, probe, &mut attempts)
                        .await
                }
            };

            if let Some(ssid) = applied {
                info!("connected to {ssid} via {strategy}");
                return Ok(AppliedNetwork {
                    ssid,
                    strategy,
                    attempts,
                });
            }

            warn!("{strategy} exhausted all candidates");
        }

        Err(ProvisioningError::AllCandidatesExhausted { attempted: attempts })
    }

    async fn apply_with_connection_manager<P>(
        &self,
        candidates: &[CredentialCandidate],
        probe: &P,
        attempts: &mut usize,
    ) -> Option<String>
    where
        P: ConnectivityProbe,
    {
        for candidate in candidates {
            *attempts += 1;

            let result = async {
                self.connect_with_connection_manager(candidate).await?;
                self.verify(probe).await
            }
            .await;

            match result {
                Ok(()) => return Some(candidate.ssid().to_string()),
                Err(reason) => log_candidate_failure(candidate, reason),
            }
        }
        None
    }

    async fn connect_with_connection_manager(&self, candidate: &CredentialCandidate) -> Result<()> {
        let ssid = candidate.ssid();

        if let Err(e) = self.runner.run(NMCLI, args(["device", "wifi", "rescan"])).await {
            warn!("failed to rescan wi-fi networks: {e:#}");
        }

        if let Err(e) = self.remove_connection_profile(ssid).await {
            warn!("failed to remove existing profile for {ssid}: {e:#}");
        }

        info!("connecting to {ssid}");
        self.runner
            .run(
                NMCLI,
                args(["device", "wifi", "connect", ssid, "password", candidate.password()]),
            )
            .await
            .context("failed to connect")?;

        Ok(())
    }

    /// Delete the connection profiles named after `ssid`, absence is not an error
    async fn remove_connection_profile(&self, ssid: &str) -> Result<()> {
        let profiles = self
            .runner
            .run(NMCLI, args(["-t", "-f", "NAME", "connection", "show"]))
            .await
            .context("failed to list connection profiles")?;

        if profiles.lines().any(|name| name.trim() == ssid) {
            info!("removing existing profile {ssid}");
            self.runner
                .run(NMCLI, args(["connection", "delete", "id", ssid]))
                .await
                .context("failed to delete connection profile")?;
        }

        Ok(())
    }

    async fn apply_with_supplicant<P>(
        &self,
        candidates: &[CredentialCandidate],
        probe: &P,
        attempts: &mut usize,
    ) -> Option<String>
    where
        P: ConnectivityProbe,
    {
        let conf = &self.config.supplicant_conf;
        let backup = supplicant_backup_file!(conf);

        let backed_up = match copy_if_exists(conf, &backup) {
            Ok(backed_up) => backed_up,
            Err(e) => {
                error!("failed to back up supplicant configuration: {e:#}");
                return None;
            }
        };

        for candidate in candidates {
            *attempts += 1;

            let result = async {
                add_supplicant_network(conf, candidate)?;
                self.restart_networking().await?;
                self.verify(probe).await
            }
            .await;

            match result {
                Ok(()) => {
                    if let Err(e) = remove_if_exists(&backup) {
                        warn!("failed to remove supplicant backup: {e:#}");
                    }
                    return Some(candidate.ssid().to_string());
                }
                Err(reason) => log_candidate_failure(candidate, reason),
            }
        }

        self.rollback_supplicant_config(backed_up).await;
        None
    }

    /// Restore the supplicant configuration as it was before the first candidate
    async fn rollback_supplicant_config(&self, backed_up: bool) {
        let conf = &self.config.supplicant_conf;

        let restored = if backed_up {
            rename_if_exists(&supplicant_backup_file!(conf), conf)
        } else {
            remove_if_exists(conf)
        };

        match restored {
            Ok(true) => {
                info!("restored supplicant configuration {conf:?}");
                if let Err(e) = self.restart_networking().await {
                    error!("failed to restart networking after rollback: {e:#}");
                }
            }
            Ok(false) => debug!("supplicant configuration unchanged"),
            Err(e) => error!("failed to restore supplicant configuration: {e:#}"),
        }
    }

    async fn restart_networking(&self) -> Result<()> {
        let service = self.config.networking_service.as_str();
        info!("restarting {service}");
        self.runner
            .run(SYSTEMCTL, args(["restart", service]))
            .await
            .context(format!("failed to restart {service}"))
            .map(|_| ())
    }

    async fn verify<P>(&self, probe: &P) -> Result<()>
    where
        P: ConnectivityProbe,
    {
        if !self.config.settle.is_zero() {
            debug!("waiting {:?} for the network to settle", self.config.settle);
            sleep(self.config.settle).await;
        }

        ensure!(
            probe.is_online(&self.verify_url).await,
            "connected but {} is not reachable",
            self.verify_url
        );
        Ok(())
    }
}

fn log_candidate_failure(candidate: &CredentialCandidate, reason: anyhow::Error) {
    let failure = ProvisioningError::PerCandidateApplyFailure {
        ssid: candidate.ssid().to_string(),
        reason,
    };
    log!(failure.log_level(), "{failure}");
}

// ============================================================================
// Supplicant configuration
// ============================================================================

fn supplicant_block(candidate: &CredentialCandidate) -> Result<String> {
    for (field, value) in [("ssid", candidate.ssid()), ("password", candidate.password())] {
        ensure!(
            !value.contains(['"', '\n', '\r']),
            "{field} contains characters not representable in a supplicant block"
        );
    }

    Ok(format!(
        "\nnetwork={{\n    ssid=\"{}\"\n    psk=\"{}\"\n    key_mgmt=WPA-PSK\n}}\n",
        candidate.ssid(),
        candidate.password()
    ))
}

/// Drop every `network={...}` block whose ssid equals `ssid`
fn remove_network_blocks(contents: &str, ssid: &str) -> String {
    let needle = format!("ssid=\"{ssid}\"");
    let mut out = String::with_capacity(contents.len());
    let mut block: Vec<&str> = vec![];

    for line in contents.split_inclusive('\n') {
        let trimmed = line.trim();

        if block.is_empty() && !trimmed.starts_with("network={") {
            out.push_str(line);
            continue;
        }

        block.push(line);
        if trimmed == "}" {
            if block.iter().any(|l| l.trim() == needle) {
                block.clear();
            } else {
                out.extend(block.drain(..));
            }
        }
    }

    // unterminated block is kept verbatim
    out.extend(block);

    out
}

/// Replace any block for the candidate's ssid with a fresh one, atomically
fn add_supplicant_network(conf: &Path, candidate: &CredentialCandidate) -> Result<()> {
    let block = supplicant_block(candidate)?;

    let current = match fs::read_to_string(conf) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).context(format!("failed to read {conf:?}")),
    };

    let mut contents = remove_network_blocks(&current, candidate.ssid());
    contents.push_str(&block);

    let tmp = supplicant_tmp_file!(conf);
    fs::write(&tmp, &contents).context(format!("failed to write {tmp:?}"))?;
    fs::rename(&tmp, conf).context(format!("failed to rename {tmp:?} to {conf:?}"))?;

    info!("added network {} to {conf:?}", candidate.ssid());
    debug!("supplicant configuration:\n{}", redact_psk(&contents));

    Ok(())
}

fn redact_psk(contents: &str) -> String {
    contents
        .lines()
        .map(|line| {
            if line.trim_start().starts_with("psk=") {
                "    psk=***"
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// `Ok(false)` if `src` does not exist
fn copy_if_exists(src: &Path, dest: &Path) -> Result<bool> {
    match fs::copy(src, dest) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).context(format!("failed to copy {src:?} to {dest:?}")),
    }
}

/// `Ok(false)` if `src` does not exist
fn rename_if_exists(src: &Path, dest: &Path) -> Result<bool> {
    match fs::rename(src, dest) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).context(format!("failed to rename {src:?} to {dest:?}")),
    }
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).context(format!("failed to remove {path:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{command::MockCommandRunner, connectivity::MockConnectivityProbe};
    use mockall::Sequence;
    use std::time::Duration;
    use tempfile::TempDir;

    const VERIFY_URL: &str = "http://verify.test";

    fn config(strategy: NetworkStrategy, fallback: bool, conf: PathBuf) -> NetworkConfig {
        NetworkConfig {
            strategy,
            fallback,
            supplicant_conf: conf,
            networking_service: "networking".to_string(),
            settle: Duration::ZERO,
        }
    }

    fn candidate(ssid: &str, password: &str) -> CredentialCandidate {
        CredentialCandidate::new(ssid, password).expect("should be valid")
    }

    fn is_connect(args: &[String], ssid: &str) -> bool {
        args.len() > 3 && args[..3] == ["device", "wifi", "connect"] && args[3] == ssid
    }

    mod connection_manager {
        use super::*;

        #[tokio::test]
        async fn moves_on_after_failed_candidate_and_stops_at_success() {
            let mut runner = MockCommandRunner::new();
            let mut seq = Sequence::new();

            runner
                .expect_run()
                .withf(|_, args| !args.iter().any(|a| a == "connect"))
                .returning(|_, _| Box::pin(async { Ok(String::new()) }));
            runner
                .expect_run()
                .withf(|_, args| is_connect(args, "C1"))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| {
                    Box::pin(async { Err(anyhow!("Error: No network with SSID 'C1' found.")) })
                });
            runner
                .expect_run()
                .withf(|_, args| is_connect(args, "C2"))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Box::pin(async { Ok(String::new()) }));
            runner
                .expect_run()
                .withf(|_, args| is_connect(args, "C3"))
                .never();

            let mut probe = MockConnectivityProbe::new();
            probe
                .expect_is_online()
                .withf(|url| url == VERIFY_URL)
                .times(1)
                .returning(|_| Box::pin(async { true }));

            let service = NetworkConfigService::new(
                runner,
                config(NetworkStrategy::ConnectionManager, false, PathBuf::new()),
                VERIFY_URL,
            );

            let applied = service
                .apply_and_verify(
                    &[candidate("C1", "pw1"), candidate("C2", "pw2"), candidate("C3", "pw3")],
                    &probe,
                )
                .await
                .expect("second candidate should succeed");

            assert_eq!(applied.ssid, "C2");
            assert_eq!(applied.strategy, NetworkStrategy::ConnectionManager);
            assert_eq!(applied.attempts, 2);
        }

        #[tokio::test]
        async fn removes_existing_profile_before_connecting() {
            let mut runner = MockCommandRunner::new();
            let mut seq = Sequence::new();

            runner
                .expect_run()
                .withf(|_, args| args.iter().any(|a| a == "rescan"))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Box::pin(async { Err(anyhow!("scanning not allowed")) }));
            runner
                .expect_run()
                .withf(|_, args| args.iter().any(|a| a == "show"))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Box::pin(async { Ok("Wired connection 1\nHome\n".to_string()) }));
            runner
                .expect_run()
                .withf(|_, args| args[..] == ["connection", "delete", "id", "Home"])
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Box::pin(async { Ok(String::new()) }));
            runner
                .expect_run()
                .withf(|_, args| is_connect(args, "Home"))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Box::pin(async { Ok(String::new()) }));

            let mut probe = MockConnectivityProbe::new();
            probe.expect_is_online().returning(|_| Box::pin(async { true }));

            let service = NetworkConfigService::new(
                runner,
                config(NetworkStrategy::ConnectionManager, false, PathBuf::new()),
                VERIFY_URL,
            );

            service
                .apply_and_verify(&[candidate("Home", "secret")], &probe)
                .await
                .expect("should connect");
        }

        #[tokio::test]
        async fn connected_but_offline_counts_as_failure() {
            let mut runner = MockCommandRunner::new();
            runner.expect_run().returning(|_, _| Box::pin(async { Ok(String::new()) }));

            let mut probe = MockConnectivityProbe::new();
            probe.expect_is_online().times(2).returning(|_| Box::pin(async { false }));

            let service = NetworkConfigService::new(
                runner,
                config(NetworkStrategy::ConnectionManager, false, PathBuf::new()),
                VERIFY_URL,
            );

            let err = service
                .apply_and_verify(&[candidate("A", "pw"), candidate("B", "pw")], &probe)
                .await
                .unwrap_err();

            assert!(matches!(
                err,
                ProvisioningError::AllCandidatesExhausted { attempted: 2 }
            ));
        }
    }

    mod supplicant {
        use super::*;

        const EXISTING: &str = r#"ctrl_interface=DIR=/var/run/wpa_supplicant GROUP=netdev
update_config=1

network={
    ssid="Home"
    psk="old"
    key_mgmt=WPA-PSK
}

network={
    ssid="Office"
    psk="work"
}
"#;

        #[test]
        fn block_matches_supplicant_format() {
            let block = supplicant_block(&candidate("Net1", "pw1")).expect("should format");
            assert_eq!(
                block,
                "\nnetwork={\n    ssid=\"Net1\"\n    psk=\"pw1\"\n    key_mgmt=WPA-PSK\n}\n"
            );
        }

        #[test]
        fn block_rejects_quotes_and_newlines() {
            assert!(supplicant_block(&candidate("Net\"1", "pw")).is_err());
            assert!(supplicant_block(&candidate("Net1", "pw\nnetwork={")).is_err());
        }

        #[test]
        fn removes_only_matching_blocks() {
            let out = remove_network_blocks(EXISTING, "Home");

            assert!(!out.contains("ssid=\"Home\""));
            assert!(out.contains("ssid=\"Office\""));
            assert!(out.starts_with("ctrl_interface="));
            assert_eq!(remove_network_blocks(&out, "Home"), out);
        }

        #[test]
        fn redacts_psk_in_logged_configuration() {
            let redacted = redact_psk(EXISTING);
            assert!(!redacted.contains("psk=\"old\""));
            assert!(!redacted.contains("psk=\"work\""));
            assert_eq!(redacted.matches("psk=***").count(), 2);
            assert!(redacted.contains("ssid=\"Office\""));
        }

        #[tokio::test]
        async fn appends_block_restarts_networking_and_verifies() {
            let dir = TempDir::new().expect("should create temp dir");
            let conf = dir.path().join("wpa_supplicant.conf");
            fs::write(&conf, EXISTING).expect("should write conf");

            let mut runner = MockCommandRunner::new();
            runner
                .expect_run()
                .withf(|program, args| {
                    program == SYSTEMCTL && args[..] == ["restart", "networking"]
                })
                .times(1)
                .returning(|_, _| Box::pin(async { Ok(String::new()) }));

            let mut probe = MockConnectivityProbe::new();
            probe.expect_is_online().times(1).returning(|_| Box::pin(async { true }));

            let service = NetworkConfigService::new(
                runner,
                config(NetworkStrategy::Supplicant, false, conf.clone()),
                VERIFY_URL,
            );

            let applied = service
                .apply_and_verify(&[candidate("Home", "new")], &probe)
                .await
                .expect("should connect");
            assert_eq!(applied.strategy, NetworkStrategy::Supplicant);

            let contents = fs::read_to_string(&conf).expect("should read conf");
            assert_eq!(contents.matches("ssid=\"Home\"").count(), 1);
            assert!(contents.contains("psk=\"new\""));
            assert!(!contents.contains("psk=\"old\""));
            assert!(contents.contains("ssid=\"Office\""));
            assert!(!supplicant_backup_file!(conf).exists());
        }

        #[tokio::test]
        async fn restores_backup_when_exhausted() {
            let dir = TempDir::new().expect("should create temp dir");
            let conf = dir.path().join("wpa_supplicant.conf");
            fs::write(&conf, EXISTING).expect("should write conf");

            let mut runner = MockCommandRunner::new();
            runner
                .expect_run()
                .withf(|program, _| program == SYSTEMCTL)
                .times(2)
                .returning(|_, _| Box::pin(async { Ok(String::new()) }));

            let mut probe = MockConnectivityProbe::new();
            probe.expect_is_online().times(1).returning(|_| Box::pin(async { false }));

            let service = NetworkConfigService::new(
                runner,
                config(NetworkStrategy::Supplicant, false, conf.clone()),
                VERIFY_URL,
            );

            let err = service
                .apply_and_verify(&[candidate("Cafe", "latte")], &probe)
                .await
                .unwrap_err();

            assert!(matches!(
                err,
                ProvisioningError::AllCandidatesExhausted { attempted: 1 }
            ));
            assert_eq!(fs::read_to_string(&conf).expect("should read conf"), EXISTING);
        }

        #[tokio::test]
        async fn removes_created_configuration_when_exhausted() {
            let dir = TempDir::new().expect("should create temp dir");
            let conf = dir.path().join("wpa_supplicant.conf");

            let mut runner = MockCommandRunner::new();
            runner
                .expect_run()
                .times(2)
                .returning(|_, _| Box::pin(async { Ok(String::new()) }));

            let mut probe = MockConnectivityProbe::new();
            probe
                .expect_is_online()
                .returning(|_| Box::pin(async { false }));

            let service = NetworkConfigService::new(
                runner,
                config(NetworkStrategy::Supplicant, false, conf.clone()),
                VERIFY_URL,
            );

            assert!(
                service
                    .apply_and_verify(&[candidate("Cafe", "latte")], &probe)
                    .await
                    .is_err()
            );
            assert!(!conf.exists());
        }
    }

    mod fallback {
        use super::*;

        #[test]
        fn fallback_follows_primary() {
            let service = NetworkConfigService::new(
                MockCommandRunner::new(),
                config(NetworkStrategy::Supplicant, true, PathBuf::new()),
                VERIFY_URL,
            );
            assert_eq!(
                service.strategies(),
                vec![NetworkStrategy::Supplicant, NetworkStrategy::ConnectionManager]
            );
        }

        #[tokio::test]
        async fn falls_back_to_supplicant_when_connection_manager_is_missing() {
            let dir = TempDir::new().expect("should create temp dir");
            let conf = dir.path().join("wpa_supplicant.conf");

            let mut runner = MockCommandRunner::new();
            runner
                .expect_run()
                .withf(|program, _| program == NMCLI)
                .returning(|_, _| Box::pin(async { Err(anyhow!("failed to spawn nmcli")) }));
            runner
                .expect_run()
                .withf(|program, _| program == SYSTEMCTL)
                .times(1)
                .returning(|_, _| Box::pin(async { Ok(String::new()) }));

            let mut probe = MockConnectivityProbe::new();
            probe.expect_is_online().times(1).returning(|_| Box::pin(async { true }));

            let service = NetworkConfigService::new(
                runner,
                config(NetworkStrategy::ConnectionManager, true, conf.clone()),
                VERIFY_URL,
            );

            let applied = service
                .apply_and_verify(&[candidate("Net1", "pw1")], &probe)
                .await
                .expect("fallback should connect");

            assert_eq!(applied.strategy, NetworkStrategy::Supplicant);
            assert_eq!(applied.attempts, 2);
            assert!(
                fs::read_to_string(&conf)
                    .expect("should create conf")
                    .contains("ssid=\"Net1\"")
            );
        }

        #[test]
        fn parses_strategy_names() {
            assert_eq!(
                "connection-manager".parse::<NetworkStrategy>().ok(),
                Some(NetworkStrategy::ConnectionManager)
            );
            assert_eq!(
                "supplicant".parse::<NetworkStrategy>().ok(),
                Some(NetworkStrategy::Supplicant)
            );
            assert!("ethernet".parse::<NetworkStrategy>().is_err());
        }
    }
}
