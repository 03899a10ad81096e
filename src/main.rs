//! acme-proxy: a TLS-terminating proxy core with automatic certificates
//!
//! Verifies that the proxy fronts a domain, issues certificates for it via
//! ACME, renews them in batches and serves the right one per handshake by SNI.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tls::{
    bootstrap_account, get_acme_ca_name, resolve_acme_ca, shutdown_channel, AcmeClient,
    CertMatcher, CertificateFilter, CertificateService, CertificateStatus, ChallengeResponder,
    CreateRequest, FileStore, HttpDomainVerifier, InstantAcmeBackend, MemoryMatchCache,
    RefreshOptions, RefreshScheduler, RefreshSettings, SniAcceptor,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod boundary;

#[derive(Parser)]
#[command(name = "acme-proxy")]
#[command(author, version, about = "TLS-terminating proxy with automatic ACME certificates")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "acme-proxy.toml")]
    config: PathBuf,

    /// Log level (overrides global.log_level)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Run,
    /// Validate configuration
    Validate,
    /// Verify a domain and issue a certificate for it
    Create {
        domain: String,
        /// Renew automatically before expiry
        #[arg(long)]
        auto_refresh: bool,
        /// Days before expiry at which to renew
        #[arg(long, default_value_t = 30)]
        refresh_before_days: u32,
    },
    /// Show one certificate
    Get { domain: String },
    /// List certificates
    List {
        /// Only these domains
        #[arg(long = "domain")]
        domains: Vec<String>,
        /// Only certificates with this status
        #[arg(long)]
        status: Option<CertificateStatus>,
        /// Only certificates expiring before this RFC 3339 time
        #[arg(long)]
        expires_before: Option<chrono::DateTime<chrono::Utc>>,
    },
    /// Re-verify and renew certificates now
    Refresh {
        /// Domains to refresh (all when empty)
        domains: Vec<String>,
    },
    /// Delete a certificate
    Delete { domain: String },
}

/// Everything wired from one configuration
struct App {
    config: Config,
    store: Arc<FileStore>,
    acme: Arc<AcmeClient>,
    cache: Arc<MemoryMatchCache>,
    matcher: Arc<CertMatcher>,
    service: CertificateService,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("Failed to install rustls crypto provider");
    }

    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

    // Setup logging
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(config.global.log_level.as_str());
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Validate => {
            info!(config = ?cli.config, "Configuration valid");
            println!("Configuration valid");
            Ok(())
        }
        Commands::Run => run_server(build_app(config).await?).await,
        command => run_command(build_app(config).await?, command).await,
    }
}

async fn build_app(config: Config) -> Result<App> {
    let store = Arc::new(
        FileStore::open(&config.certs.storage_path)
            .await
            .context("Failed to initialize certificate storage")?,
    );

    // Supports provider names (e.g., "letsencrypt", "zerossl", "google") or direct URLs
    let ca_url = resolve_acme_ca(&config.acme.ca);
    info!(provider = %get_acme_ca_name(&ca_url), url = %ca_url, "Using ACME CA");

    let acme = Arc::new(AcmeClient::new(Arc::new(InstantAcmeBackend::new(ca_url))));
    bootstrap_account(store.as_ref(), &acme, &config.acme.email)
        .await
        .context("Failed to initialize ACME account")?;

    let cache = Arc::new(MemoryMatchCache::new());
    let matcher = Arc::new(
        CertMatcher::new(cache.clone(), config.certs.cache_ttl())
            .with_default_domain(config.certs.default_domain.as_deref()),
    );

    let verifier = Arc::new(HttpDomainVerifier::new().context("Failed to create verifier")?);
    let settings = RefreshSettings {
        batch_size: config.refresh.batch_size,
        failure_threshold: config.refresh.failure_threshold,
        cooldown: config.refresh.cooldown(),
        verify_timeout: config.refresh.verify_timeout(),
    };
    let service = CertificateService::new(
        store.clone(),
        verifier,
        acme.clone(),
        matcher.clone(),
        settings,
    )
    .with_list_limit(config.refresh.list_limit);

    Ok(App {
        config,
        store,
        acme,
        cache,
        matcher,
        service,
    })
}

async fn run_command(app: App, command: Commands) -> Result<()> {
    match command {
        Commands::Create {
            domain,
            auto_refresh,
            refresh_before_days,
        } => {
            let request = CreateRequest {
                domain,
                wait: true,
                refresh: Some(RefreshOptions {
                    auto_refresh,
                    refresh_before_days,
                }),
            };
            let info = app.service.create(request).await.context("Create failed")?;
            print_json(&info)
        }
        Commands::Get { domain } => {
            match app.service.get(&domain).await.context("Get failed")? {
                Some(info) => print_json(&info),
                None => anyhow::bail!("No certificate for {}", domain),
            }
        }
        Commands::List {
            domains,
            status,
            expires_before,
        } => {
            let filter = CertificateFilter {
                domains,
                expires_before,
                status,
            };
            print_json(&app.service.list(&filter).await.context("List failed")?)
        }
        Commands::Refresh { domains } => {
            let filter = CertificateFilter {
                domains,
                ..Default::default()
            };
            let report = app.service.refresh(filter).await.context("Refresh failed")?;
            print_json(&serde_json::json!({
                "refreshed": report.refreshed,
                "failed": report.failed,
            }))
        }
        Commands::Delete { domain } => {
            app.service.delete(&domain).await.context("Delete failed")?;
            info!(domain = %domain, "Deleted");
            Ok(())
        }
        Commands::Run | Commands::Validate => Ok(()),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_server(app: App) -> Result<()> {
    info!("Starting acme-proxy");
    let config = app.config.clone();

    let (shutdown_tx, shutdown_rx) = shutdown_channel();

    // Static certificates, reloaded periodically
    if config.certs.local_enabled {
        reload_static(&app.matcher, &config.certs.local_path).await;
        tokio::spawn(static_reload_loop(
            app.matcher.clone(),
            config.certs.local_path.clone(),
            config.certs.local_refresh_period(),
            shutdown_rx.clone(),
        ));
    }
    tokio::spawn(cache_purge_loop(
        app.cache.clone(),
        config.certs.cache_ttl(),
        shutdown_rx.clone(),
    ));

    // Plain HTTP boundary (echo + ACME challenges)
    let http_listener = TcpListener::bind(&config.server.http_listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.http_listen))?;
    info!(address = %config.server.http_listen, "Listening (HTTP)");
    let responder = ChallengeResponder::new(app.acme.clone());
    tokio::spawn(boundary::serve(
        http_listener,
        responder.clone(),
        shutdown_rx.clone(),
    ));

    // Start certificate refresh scheduler
    let scheduler = RefreshScheduler::new(app.service.refresher(), shutdown_rx.clone())
        .with_period(config.refresh.period())
        .with_run_timeout(config.refresh.timeout())
        .start();

    // TLS listener
    let https_listener = TcpListener::bind(&config.server.https_listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.https_listen))?;
    info!(address = %config.server.https_listen, "Listening (HTTPS)");

    let mut acceptor = SniAcceptor::new(app.matcher.clone(), app.store.clone())
        .with_fetch_timeout(config.certs.fetch_timeout());
    acceptor.enable_http11();

    info!("acme-proxy started successfully");
    loop {
        tokio::select! {
            accepted = https_listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "Failed to accept TCP connection");
                        continue;
                    }
                };

                let acceptor = acceptor.clone();
                let responder = responder.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => boundary::serve_connection(tls_stream, responder).await,
                        Err(e) => warn!(remote = %remote_addr, error = %e, "TLS handshake failed"),
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, initiating graceful shutdown...");
                break;
            }
        }
    }

    // Notify other components (scheduler, reload loops, HTTP) to stop
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(5), scheduler).await.is_err() {
        warn!("Refresh scheduler did not stop in time");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn reload_static(matcher: &Arc<CertMatcher>, path: &std::path::Path) {
    let loader = matcher.clone();
    let dir = path.to_path_buf();
    match tokio::task::spawn_blocking(move || loader.load_directory(&dir)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(path = ?path, error = %e, "Failed to load static certificates"),
        Err(e) => error!(error = %e, "Static certificate loader panicked"),
    }
}

async fn static_reload_loop(
    matcher: Arc<CertMatcher>,
    path: PathBuf,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => reload_static(&matcher, &path).await,
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn cache_purge_loop(
    cache: Arc<MemoryMatchCache>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => cache.purge_expired(),
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
