// # maildnsd - Mail Relay DNS Reconciler
//
// Thin integration layer: reads configuration, wires the provider crates
// into `maildns-core` and runs one command. All DNS logic lives in
// `maildns-core`.
//
// ## Commands
//
// - `init`: detect, apply and persist the detected state for the watcher
// - `update`: detect and apply
// - `cleanup`: delete every record this owner created
// - `verify`: wait for the records to become publicly visible
// - `status`: print owned records as JSON
// - `watch`: run the drift watch loop until SIGINT/SIGTERM
//
// ## Configuration
//
// Environment variables (see `settings.rs`):
//
// ### Provider
// - `DNS_PROVIDER`: Provider type (cloudflare)
// - `DNS_OWNER_ID`, or `NAMESPACE` + `RELEASE_NAME`: ownership marker id
// - `CF_API_TOKEN`, `CLOUDFLARE_ZONE_IDS`, `CLOUDFLARE_PROXIED`
//
// ### Mail
// - `MAIL_HOSTNAME`, `MAIL_DOMAINS`
// - `DNS_CREATE_A/MX/SPF/DKIM/DMARC`, `DNS_SPF_POLICY`, `DNS_DMARC_*`, `DNS_TTL`
//
// ### PTR
// - `PTR_ENABLED`, `PTR_PROVIDER`, `PTR_HOSTNAME`
// - `HETZNER_API_TOKEN` or `HETZNER_ROBOT_USERNAME` + `HETZNER_ROBOT_PASSWORD`
//
// ### IP / Cluster
// - `STATIC_IPS`, `IP_DETECTION_APIS`, `DETECT_OUTBOUND_IP`, `IP_DETECTION_TIMEOUT`
// - `SERVICE_NAME`, `POD_NAME` (or `HOSTNAME`)
//
// ## Example
//
// ```bash
// export CF_API_TOKEN=your_token
// export MAIL_HOSTNAME=mail.example.com
// export MAIL_DOMAINS=example.com
//
// maildnsd --dry-run update
// ```

mod propagation;
mod settings;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use maildns_core::config::WatchConfig;
use maildns_core::desired::dkim_record_name;
use maildns_core::traits::{ClusterInfo, PtrProvider, StateStore};
use maildns_core::{DnsManager, DriftWatcher, FileStateStore, ProviderRegistry};
use maildns_ip_http::HttpIpDetector;
use maildns_k8s::{KubeCluster, NoCluster};
use propagation::{HickoryLookup, PropagationTarget, VERIFY_INTERVAL};
use settings::Settings;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes
#[derive(Debug, Clone, Copy)]
enum MaildnsExitCode {
    /// Command succeeded
    Success = 0,
    /// Configuration error or command failure
    Failure = 1,
}

impl From<MaildnsExitCode> for ExitCode {
    fn from(code: MaildnsExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

impl From<bool> for MaildnsExitCode {
    fn from(success: bool) -> Self {
        if success {
            MaildnsExitCode::Success
        } else {
            MaildnsExitCode::Failure
        }
    }
}

/// DNS manager for a Kubernetes mail relay
#[derive(Debug, Parser)]
#[command(name = "maildnsd", version, about)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log intended changes without making them
    #[arg(long, global = true)]
    dry_run: bool,

    /// Directory shared with the relay and the watcher
    #[arg(long, global = true, env = "SHARED_DIR")]
    shared_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create or update all records and save the detected state
    Init {
        /// Seconds to wait for a LoadBalancer address
        #[arg(long, default_value_t = 300)]
        wait_for_lb: u64,
    },
    /// Create or update all records
    Update {
        /// Seconds to wait for a LoadBalancer address
        #[arg(long, default_value_t = 300)]
        wait_for_lb: u64,
    },
    /// Delete every record owned by this instance
    Cleanup,
    /// Wait until the records are publicly resolvable
    Verify {
        /// Seconds to wait for DNS propagation
        #[arg(long, default_value_t = 600)]
        verify_timeout: u64,
    },
    /// Print owned records as JSON
    Status,
    /// Watch for address and record drift
    Watch {
        /// Seconds between checks
        #[arg(long, env = "DNS_WATCHER_INTERVAL")]
        interval: Option<u64>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            return MaildnsExitCode::Failure.into();
        }
    };

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return MaildnsExitCode::Failure.into();
        }
    };

    let code = rt.block_on(async {
        match run(cli.command, settings).await {
            Ok(success) => MaildnsExitCode::from(success),
            Err(e) => {
                error!("{:#}", e);
                MaildnsExitCode::Failure
            }
        }
    });

    code.into()
}

/// Environment settings with command-line overrides applied
fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = Settings::from_env()?;

    if cli.dry_run {
        settings.ownership.dry_run = true;
    }
    if let Some(dir) = &cli.shared_dir {
        settings.shared_dir = dir.clone();
    }
    if let Command::Watch {
        interval: Some(secs),
    } = cli.command
    {
        settings.watch_interval = Duration::from_secs(secs);
    }

    settings.validate()?;
    Ok(settings)
}

/// Run one command
///
/// `Ok(false)` is a command that ran and failed; `Err` is a setup error.
async fn run(command: Command, settings: Settings) -> Result<bool> {
    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    let mut registry = ProviderRegistry::new();

    #[cfg(feature = "cloudflare")]
    maildns_provider_cloudflare::register(&mut registry);

    #[cfg(feature = "hetzner")]
    maildns_ptr_hetzner::register(&mut registry);

    debug!("Registered DNS providers: {:?}", registry.list_providers());
    info!(
        "Using DNS provider {} (owner: {})",
        settings.provider_name, settings.ownership.owner_id
    );

    let provider = registry
        .create_provider(&settings.provider)
        .context("Failed to initialize DNS provider")?;
    check_credentials(provider.verify_credentials().await, provider.provider_name())?;

    let cluster: Arc<dyn ClusterInfo> = match KubeCluster::try_default(settings.cluster.clone()).await {
        Ok(cluster) => Arc::new(cluster),
        Err(e) => {
            warn!("Kubernetes API unavailable, cluster lookups disabled: {}", e);
            Arc::new(NoCluster)
        }
    };

    let detector = HttpIpDetector::new(settings.ip.clone())?.with_cluster(cluster.clone());

    let ptr = ptr_provider(&registry, &settings)?;
    if let Some(ptr) = &ptr {
        check_credentials(ptr.verify_credentials().await, ptr.provider_name())?;
    }

    let manager = DnsManager::new(
        provider,
        settings.ownership.clone(),
        settings.mail.clone(),
        cluster.clone(),
        Arc::new(detector),
    )
    .with_ptr(settings.ptr.clone(), ptr)
    .with_cancellation(cancel.clone());

    if settings.ownership.dry_run {
        info!("[dry-run] No changes will be made");
    }

    match command {
        Command::Init { wait_for_lb } => {
            let Some(detected) = manager.detect(Duration::from_secs(wait_for_lb)).await else {
                return Ok(false);
            };
            info!("Detected {}", detected);
            if !manager.apply(&detected).await {
                return Ok(false);
            }

            if settings.shared_dir.is_dir() {
                let store = FileStateStore::new(&settings.shared_dir);
                if let Err(e) = store.save(&detected).await {
                    error!("Failed to save state to {}: {}", store.state_path().display(), e);
                    return Ok(false);
                }
                info!("Saved state to {}", store.state_path().display());
            }
            Ok(true)
        }

        Command::Update { wait_for_lb } => {
            Ok(manager.init_or_update(Duration::from_secs(wait_for_lb)).await)
        }

        Command::Cleanup => Ok(manager.cleanup().await),

        Command::Verify { verify_timeout } => {
            let target = propagation_target(&manager, cluster.as_ref(), &cancel).await;
            Ok(propagation::verify(
                &target,
                &HickoryLookup::new(),
                Duration::from_secs(verify_timeout),
                VERIFY_INTERVAL,
                &cancel,
            )
            .await)
        }

        Command::Status => {
            let report = manager.status().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(true)
        }

        Command::Watch { .. } => {
            let store = Arc::new(FileStateStore::new(&settings.shared_dir));
            let config = WatchConfig {
                interval: settings.watch_interval,
                ..WatchConfig::default()
            };

            info!(
                "Starting DNS watcher (interval: {}s, shared dir: {})",
                config.interval.as_secs(),
                settings.shared_dir.display()
            );

            let (watcher, mut events) = DriftWatcher::new(Arc::new(manager), store, config)?;
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    debug!(?event, "watch event");
                }
            });

            watcher.run(cancel).await?;
            Ok(true)
        }
    }
}

/// PTR provider for the configured backend, if PTR management is enabled
fn ptr_provider(registry: &ProviderRegistry, settings: &Settings) -> Result<Option<Arc<dyn PtrProvider>>> {
    if !settings.ptr.enabled {
        return Ok(None);
    }

    match (&settings.ptr.provider, &settings.ptr_settings) {
        (Some(name), Some(ptr_settings)) => {
            let provider = registry
                .create_ptr_provider(name, ptr_settings)
                .with_context(|| format!("Failed to initialize PTR provider {}", name))?;
            Ok(Some(provider))
        }
        _ => Ok(None),
    }
}

/// Fail on rejected credentials; any other verification failure only warns
fn check_credentials(result: maildns_core::Result<()>, provider: &str) -> Result<()> {
    match result {
        Ok(()) => {
            debug!("{} credentials verified", provider);
            Ok(())
        }
        Err(e @ maildns_core::Error::Authentication(_)) => {
            Err(anyhow::Error::new(e).context(format!("{} rejected the configured credentials", provider)))
        }
        Err(e) => {
            warn!("Could not verify {} credentials: {}", provider, e);
            Ok(())
        }
    }
}

/// Records `verify` waits for: the hostname and each published DKIM key
async fn propagation_target(
    manager: &DnsManager,
    cluster: &dyn ClusterInfo,
    cancel: &CancellationToken,
) -> PropagationTarget {
    let mail = manager.mail_config();
    let mut target = PropagationTarget::default();

    if mail.create_a {
        target.hostname = Some(mail.hostname.clone());
        target.expected_ip = manager.detector().incoming_ip(Duration::ZERO, cancel).await;
    }

    if mail.create_dkim {
        for domain in &mail.domains {
            match cluster.dkim_record(&domain.name).await {
                Ok(Some(_)) => target.dkim.push((
                    domain.name.clone(),
                    dkim_record_name(&domain.dkim_selector, &domain.name),
                )),
                Ok(None) => debug!("No DKIM key for {}, not verifying it", domain.name),
                Err(e) => warn!("DKIM lookup for {} failed, not verifying it: {}", domain.name, e),
            }
        }
    }

    target
}

/// Cancel `cancel` on SIGTERM or SIGINT
fn spawn_shutdown_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        match wait_for_shutdown().await {
            Ok(signal) => {
                info!("Received {}, shutting down", signal);
                cancel.cancel();
            }
            Err(e) => error!("Shutdown signal handling unavailable: {}", e),
        }
    });
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
///
/// # Returns
///
/// Returns the name of the signal received.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for shutdown signals (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn command_defaults() {
        let cli = Cli::try_parse_from(["maildnsd", "init"]).unwrap();
        assert!(matches!(cli.command, Command::Init { wait_for_lb: 300 }));

        let cli = Cli::try_parse_from(["maildnsd", "verify"]).unwrap();
        assert!(matches!(cli.command, Command::Verify { verify_timeout: 600 }));
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "maildnsd",
            "update",
            "--dry-run",
            "-v",
            "--wait-for-lb",
            "0",
            "--shared-dir",
            "/tmp/shared",
        ])
        .unwrap();

        assert!(cli.dry_run);
        assert!(cli.verbose);
        assert_eq!(cli.shared_dir, Some(PathBuf::from("/tmp/shared")));
        assert!(matches!(cli.command, Command::Update { wait_for_lb: 0 }));
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(Cli::try_parse_from(["maildnsd", "deploy"]).is_err());
    }

    #[test]
    fn only_rejected_credentials_are_fatal() {
        assert!(check_credentials(Ok(()), "cloudflare").is_ok());
        assert!(check_credentials(Err(maildns_core::Error::http("timeout")), "cloudflare").is_ok());

        let err = check_credentials(Err(maildns_core::Error::auth("invalid token")), "cloudflare")
            .unwrap_err();
        assert!(format!("{:#}", err).contains("cloudflare rejected the configured credentials"));
    }

    #[test]
    fn exit_code_from_outcome() {
        assert_eq!(MaildnsExitCode::from(true) as u8, 0);
        assert_eq!(MaildnsExitCode::from(false) as u8, 1);
    }
}
