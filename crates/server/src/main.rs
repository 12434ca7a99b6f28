mod config;
mod engine;
mod rtc;
mod spy;
mod web;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::engine::EngineClient;
use crate::spy::SpyService;
use crate::web::AppState;

/// How long in-flight HTTP handlers get to drain after a shutdown signal.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

struct CliArgs {
    config_path: PathBuf,
    port: Option<u16>,
}

fn parse_args() -> CliArgs {
    let mut cli = CliArgs {
        config_path: PathBuf::from("config/rtpscope.toml"),
        port: None,
    };

    let mut args = std::env::args().skip(1);
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--config" | "-c" => {
                if let Some(path) = args.next() {
                    cli.config_path = PathBuf::from(path);
                }
            }
            "--port" | "-p" => {
                cli.port = args.next().and_then(|p| p.parse().ok());
            }
            other => {
                eprintln!("rtpscope-server: ignoring unknown argument '{other}'");
            }
        }
    }

    cli
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = parse_args();

    let mut config = config::load_config(&cli.config_path)?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Err(issues) = config.validate() {
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{issue}");
            } else {
                tracing::warn!("{issue}");
            }
        }
        if issues.iter().any(|issue| issue.starts_with("ERROR:")) {
            anyhow::bail!("invalid configuration, refusing to start");
        }
    }

    if !std::path::Path::new(&config.server.web_root).is_dir() {
        tracing::warn!(
            web_root = %config.server.web_root,
            "Operator UI directory missing; only the API routes will respond"
        );
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("Invalid bind address")?;

    // Engine control channel and the two WebRTC stacks
    let engine = Arc::new(
        EngineClient::connect(&config.engine.address)
            .await
            .context("Failed to open engine control socket")?,
    );
    let spy = SpyService::new(Arc::clone(&engine), rtc::build(&config.webrtc)?);

    let state = Arc::new(AppState {
        config: config.clone(),
        engine,
        spy: Arc::clone(&spy),
        started_at: std::time::Instant::now(),
    });

    // One span per request, one line per response. The request id comes
    // from the SetRequestId layer below (or the caller, if it sent one).
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &axum::http::Request<_>| {
            let request_id = req
                .headers()
                .get("x-request-id")
                .and_then(|id| id.to_str().ok())
                .unwrap_or("");
            tracing::info_span!("http", %request_id, verb = %req.method(), uri = %req.uri().path())
        })
        .on_response(
            |res: &axum::http::Response<_>, took: std::time::Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = res.status().as_u16(),
                    took_ms = took.as_millis() as u64,
                    "request served"
                );
            },
        );

    let app = web::build_router(state)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(trace_layer)
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(
        bind = %bind_addr,
        engine = %config.engine.address,
        web_root = %config.server.web_root,
        "rtpscope starting"
    );

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    // Background task: release spy sources nobody is listening to
    let idle_timeout = config.spy.idle_timeout;
    if idle_timeout > 0 {
        let reaper = Arc::clone(&spy);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(30)).await;
                reaper.reap_idle(Duration::from_secs(idle_timeout)).await;
            }
        });
    } else {
        tracing::info!("Idle spy source reclamation disabled (idle_timeout = 0)");
    }

    // Either signal trips the shutdown token; the HTTP server drains on it.
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT, shutting down"),
            _ = sigterm.recv() => tracing::info!("SIGTERM, shutting down"),
        }
        signal_token.cancel();
    });

    let drain_token = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { drain_token.cancelled().await })
            .await
    });

    tokio::select! {
        result = &mut server => {
            result.context("HTTP server task panicked")?.context("HTTP server failed")?;
        }
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(DRAIN_DEADLINE).await;
        } => {
            tracing::warn!("HTTP drain deadline reached, aborting remaining connections");
            server.abort();
        }
    }

    // Release remaining engine subscriptions before exit
    spy.shutdown().await;

    tracing::info!("rtpscope shut down cleanly");
    Ok(())
}
