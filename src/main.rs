use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use log::{error, info, warn};
use std::io::Write;
use tokio::signal::unix::{SignalKind, signal};
use wifi_provisioner::{
    bluetooth::bluez::BluezAdapter,
    command::SystemCommandRunner,
    config::AppConfig,
    connectivity::HttpConnectivityProbe,
    services::{
        credentials::CredentialStore,
        network::NetworkConfigService,
        provisioning::{Provisioner, ProvisionerSettings},
        transfer::{ObexPushServer, TransferWatcher, WatchPolicy},
    },
};

/// How the provisioning run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Online,
    /// Already logged by the provisioner
    Failed,
    Interrupted(&'static str),
}

impl Outcome {
    fn exit_code(self) -> i32 {
        match self {
            Self::Online => 0,
            Self::Failed | Self::Interrupted(_) => 1,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let code = match run().await {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            error!("application error: {e:#}");
            1
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    info!("good bye");
}

async fn run() -> Result<Outcome> {
    initialize();

    let config = AppConfig::get();
    let runner = SystemCommandRunner::new(config.command.timeout);

    let probe = HttpConnectivityProbe::new(config.probe.timeout, runner.clone())
        .context("failed to create connectivity probe")?;

    let adapter = BluezAdapter::new(runner.clone(), config.bluetooth.agent_path.clone());

    let watcher = TransferWatcher::new(
        ObexPushServer::new(config.bluetooth.obexd_path.clone()),
        CredentialStore::new(&config.transfer.landing_dir, &config.transfer.extension),
        WatchPolicy {
            poll_interval: config.transfer.poll_interval,
            timeout: config.transfer.timeout,
        },
    );

    let network = NetworkConfigService::new(
        runner,
        config.network.clone(),
        config.probe.verify_url.clone(),
    );

    let mut provisioner = Provisioner::new(
        adapter,
        watcher,
        probe,
        network,
        ProvisionerSettings::from_config(config),
    );

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    let outcome = tokio::select! {
        result = provisioner.provision_if_needed() => match result {
            Ok(()) => Outcome::Online,
            Err(_) => Outcome::Failed,
        },
        _ = sigterm.recv() => Outcome::Interrupted("SIGTERM"),
        _ = tokio::signal::ctrl_c() => Outcome::Interrupted("ctrl-c"),
    };

    if let Outcome::Interrupted(name) = outcome {
        warn!("received {name}, aborting provisioning");
        provisioner.teardown().await;
    }

    Ok(outcome)
}

fn initialize() {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("module version: {}", env!("CARGO_PKG_VERSION"));
}
