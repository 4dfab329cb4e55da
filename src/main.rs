use clap::Parser;
use dotenvy::dotenv;
use scidata_ingest::config::ServiceConfig;
use scidata_ingest::infrastructure::{database, layout::IngestLayout};
use scidata_ingest::services::converters::ConverterRegistry;
use scidata_ingest::services::dispatcher::Dispatcher;
use scidata_ingest::services::remote::FetcherRegistry;
use scidata_ingest::{AppState, create_app};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Service type to run (api, worker, all)
    #[arg(short, long, default_value = "all")]
    mode: String,

    /// Port for the API server
    #[arg(short, long, default_value_t = 8080)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scidata_ingest=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting scidata-ingest [mode: {}]", args.mode);

    let config = ServiceConfig::from_env();
    let db = database::setup_database().await?;
    database::ensure_schema(&db).await?;

    let layout = IngestLayout::new(config.ingest_root.clone());
    layout.ensure_roots().await?;
    info!("ingest root ready at {}", config.ingest_root.display());

    let state = AppState::build(db.clone(), config.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut handles = Vec::new();

    if args.mode == "worker" || args.mode == "all" {
        let dispatcher = Arc::new(Dispatcher::new(
            db.clone(),
            layout.clone(),
            config.clone(),
            ConverterRegistry::with_defaults(),
            FetcherRegistry::with_defaults(),
            state.ingest.clone(),
            state.sessions.clone(),
        ));
        handles.extend(dispatcher.spawn(shutdown_rx.clone()));
    }

    if args.mode == "api" || args.mode == "all" {
        let app = create_app(state.clone());
        let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("api listening on {addr}");

        let mut api_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = api_shutdown.changed().await;
            });
            if let Err(e) = serve.await {
                error!("api server error: {e}");
            }
        }));
    }

    if handles.is_empty() {
        anyhow::bail!("unknown mode '{}'; expected api, worker, or all", args.mode);
    }

    shutdown_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
    info!("all tasks stopped; bye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
