use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use edge_cert_renewer::acme::{AcmeTransport, HttpAcmeTransport};
use edge_cert_renewer::api::server::{create_server, run_server, ServerState};
use edge_cert_renewer::cdn::create_cdn_provider;
use edge_cert_renewer::config::{self, Config};
use edge_cert_renewer::observability::{logging, metrics::RenewalMetrics};
use edge_cert_renewer::tls::dns_provider::create_dns_provider;
use edge_cert_renewer::tls::expiry_probe::probe_certificate;
use edge_cert_renewer::tls::{
    AccountStore, CertificateStore, ChallengeProcessor, ChallengeSettings, OrderClient, RenewalScheduler,
    RenewalSettings,
};

#[derive(Parser)]
#[command(name = "edge-cert-renewer")]
#[command(about = "Renews ACME certificates and deploys them to a CDN", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the renewal scheduler until interrupted
    Run,
    /// Run a single renewal cycle and exit
    Once,
    /// Deploy the newest stored certificate for a domain
    Redeploy { domain: String },
    /// Print the validity of the certificate a host serves
    Check {
        host: String,
        #[arg(long, default_value_t = 443)]
        port: u16,
    },
}

struct Pipeline {
    accounts: Arc<AccountStore>,
    scheduler: RenewalScheduler,
    metrics: Arc<RenewalMetrics>,
}

fn build_pipeline(config: &Config, cancel: CancellationToken) -> Result<Pipeline> {
    let metrics = Arc::new(RenewalMetrics::new().context("Failed to register metrics")?);

    let transport: Arc<dyn AcmeTransport> = Arc::new(
        HttpAcmeTransport::new(&config.acme.directory_url)?.with_cancellation(cancel.clone()),
    );
    let dns_provider = config.dns_provider.as_ref().map(create_dns_provider).transpose()?;
    let cdn = create_cdn_provider(&config.cdn_provider, &config.renewal)?;

    let processor = Arc::new(
        ChallengeProcessor::new(
            transport.clone(),
            dns_provider,
            ChallengeSettings::from(&config.challenge),
            cancel,
        )
        .with_metrics(metrics.clone()),
    );

    let accounts = Arc::new(AccountStore::new(transport.clone(), &config.acme));
    let orders = Arc::new(OrderClient::new(transport, processor));
    let certificates = Arc::new(CertificateStore::new(PathBuf::from(&config.renewal.certs_dir)));

    let scheduler = RenewalScheduler::new(
        accounts.clone(),
        orders,
        certificates,
        cdn,
        RenewalSettings::from(config),
    )
    .with_metrics(metrics.clone());

    Ok(Pipeline {
        accounts,
        scheduler,
        metrics,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = config::load_config(&cli.config)?;
    let _guard = logging::init_logging(&config.logging);

    if let Some(Commands::Check { host, port }) = &cli.command {
        let timeout = Duration::from_secs(config.renewal.probe_timeout_secs);
        let status = probe_certificate(host, *port, timeout).await;
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    config::validate_config(&config)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down...");
                cancel.cancel();
            }
        });
    }

    let pipeline = build_pipeline(&config, cancel.clone())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&config, pipeline, cancel).await,
        Commands::Once => {
            let report = pipeline.scheduler.run_cycle().await?;
            if !report.failed.is_empty() {
                bail!("{} domain(s) failed to renew: {:?}", report.failed.len(), report.failed);
            }
            Ok(())
        }
        Commands::Redeploy { domain } => {
            let outcome = pipeline.scheduler.redeploy(&domain).await?;
            info!(domain = %domain, ?outcome, "Redeployed");
            Ok(())
        }
        Commands::Check { .. } => Ok(()),
    }
}

async fn run(config: &Config, pipeline: Pipeline, cancel: CancellationToken) -> Result<()> {
    info!("Starting edge certificate renewer...");

    // Keystore problems are fatal at start-up; CA problems are retried per cycle
    pipeline
        .accounts
        .load_or_create_key()
        .await
        .context("Failed to load or create the ACME account keystore")?;

    if config.metrics.enabled {
        let state = ServerState {
            metrics: pipeline.metrics.clone(),
            webroot: PathBuf::from(&config.challenge.http_webroot),
        };
        let (addr, app) = create_server(&config.metrics.listen_addr, state)?;
        let server_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_server(addr, app, server_cancel).await {
                error!("HTTP server error: {}", e);
            }
        });
    }

    pipeline.scheduler.start(cancel).await;
    Ok(())
}
