use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderName, Method};
use clap::Parser;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use yourvpn::api::{self, AppState};
use yourvpn::cli;
use yourvpn::clock::{Clock, SystemClock};
use yourvpn::config::{self, Config};
use yourvpn::jobs::BillingScheduler;
use yourvpn::lifecycle::EndpointManager;
use yourvpn::provider::digital_ocean::DigitalOceanClient;
use yourvpn::store::memory::MemoryStore;
use yourvpn::store::postgres::PgStore;
use yourvpn::store::LedgerStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load()?;
    init_tracing(cfg.json_logs);

    let args = cli::Cli::parse();
    let result = match args.command {
        Some(cli::Commands::Serve { port, ephemeral }) => run_server(cfg, port, ephemeral).await,
        Some(cli::Commands::Token { command }) => {
            let clock: Arc<dyn Clock> = Arc::new(SystemClock);
            let db = PgStore::connect(&cfg.database_url, clock).await?;
            db.migrate().await?;
            handle_token_command(command, &cfg, Arc::new(db)).await
        }
        None => run_server(cfg, None, false).await,
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "yourvpn=debug,yvpn=debug,tower_http=info".into()),
    );
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn build_lifecycle(cfg: &Config, store: Arc<dyn LedgerStore>) -> anyhow::Result<Arc<EndpointManager>> {
    let provider =
        DigitalOceanClient::new(cfg.digital_ocean()).context("failed to build DigitalOcean client")?;
    Ok(Arc::new(EndpointManager::new(
        store,
        Arc::new(provider),
        cfg.rate,
        cfg.lifecycle(),
    )))
}

async fn run_server(cfg: Config, port: Option<u16>, ephemeral: bool) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store: Arc<dyn LedgerStore> = if ephemeral {
        tracing::warn!("Using in-memory ledger; all tokens are lost on exit");
        Arc::new(MemoryStore::new(clock.clone()))
    } else {
        tracing::info!("Connecting to database...");
        let db = PgStore::connect(&cfg.database_url, clock.clone()).await?;
        tracing::info!("Running migrations...");
        db.migrate().await?;
        Arc::new(db)
    };

    let lifecycle = build_lifecycle(&cfg, store)?;
    let state = Arc::new(AppState::new(lifecycle.clone(), clock.clone()));

    let dashboard_origin = cfg.dashboard_origin.clone();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            let origin_str = origin.to_str().unwrap_or("");
            origin_str == dashboard_origin
                || origin_str.starts_with("http://localhost:")
                || origin_str.starts_with("http://127.0.0.1:")
        }))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            HeaderName::from_static("content-type"),
            HeaderName::from_static("token"),
            HeaderName::from_static("x-request-id"),
        ]);
    let app = api::router(state).layer(cors);

    let billing = Arc::new(BillingScheduler::new(
        lifecycle,
        clock,
        cfg.billing_period,
        cfg.reap_expired,
    ))
    .start();
    tracing::info!(
        period_secs = cfg.billing_period.as_secs(),
        reap_expired = cfg.reap_expired,
        "Billing scheduler started"
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(cfg.port)));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("yourVPN API listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Stopping billing scheduler...");
    billing.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn handle_token_command(
    cmd: cli::TokenCommands,
    cfg: &Config,
    store: Arc<dyn LedgerStore>,
) -> anyhow::Result<()> {
    match cmd {
        cli::TokenCommands::Create { funds, days, admin } => {
            let token = store.create_token(admin, funds, days).await?;
            println!(
                "Token created:\n  Token:   {}\n  Funds:   {}\n  Expires: {}\n  Admin:   {}",
                token.id, token.funds_available, token.expiration, token.is_admin
            );
        }
        cli::TokenCommands::List { skip, limit } => {
            let tokens = store.list_tokens(skip, limit).await?;
            if tokens.is_empty() {
                println!("No tokens found.");
            } else {
                println!(
                    "{:<66} {:<6} {:>12} {:>9} {:<25}",
                    "TOKEN", "ADMIN", "FUNDS", "ENDPOINTS", "EXPIRES"
                );
                for t in tokens {
                    println!(
                        "{:<66} {:<6} {:>12} {:>9} {:<25}",
                        t.id,
                        t.is_admin,
                        t.funds_available.to_string(),
                        t.endpoint_count,
                        t.expiration.to_rfc3339()
                    );
                }
            }
        }
        cli::TokenCommands::Delete { token } => {
            let lifecycle = build_lifecycle(cfg, store)?;
            lifecycle
                .delete_token(&token)
                .await
                .context("token teardown failed")?;
            println!("Token and its endpoints deleted.");
        }
    }
    Ok(())
}
