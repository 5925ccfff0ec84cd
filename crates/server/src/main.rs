mod auth;
mod capture;
mod channel;
mod config;
mod devices;
mod encoder;
mod h264;
mod input;
mod negotiation;
mod pipeline;
mod registry;
mod sender;
mod session;
mod tls;
mod web;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::auth::{Authenticator, HmacSecret};
use crate::encoder::{GstH264Factory, OpusFactory};
use crate::negotiation::PeerNegotiatorFactory;
use crate::pipeline::{CodecFactory, EncoderParams};
use crate::registry::SessionRegistry;
use crate::session::SessionContext;
use crate::web::AppState;

/// How long shutdown waits for terminated sessions to unregister.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/periscope.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config_path, port_override) = parse_args();

    let mut config = config::load_config(&config_path)?;
    if let Some(p) = port_override {
        config.server.port = p;
    }
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    if !Path::new(&config.server.web_root).is_dir() {
        tracing::warn!(
            "Web root '{}' does not exist, the client will not load. \
             Set server.web_root in the config.",
            config.server.web_root
        );
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("Invalid bind address")?;

    let secret = HmacSecret::load_or_create(Path::new(&config.auth.hmac_key))?;
    let authenticator = Authenticator::from_config(&config.auth, &secret);
    tracing::info!(
        identity = %authenticator.identity(),
        system = authenticator.is_system(),
        "Authenticator ready"
    );

    let devices = devices::platform_devices(&config)?;
    let video_codec = Arc::new(GstH264Factory::new(config.video.encoder.clone()));
    if let Err(e) = video_codec.probe() {
        tracing::warn!("No usable H.264 encoder, sessions will fail to start: {e:#}");
    }

    let sessions = Arc::new(SessionContext {
        authenticator: Arc::new(authenticator),
        registry: Arc::new(SessionRegistry::new(config.server.max_sessions)),
        devices,
        video_codec,
        audio_codec: Arc::new(OpusFactory::new(config.audio.bitrate)),
        video_params: EncoderParams {
            bitrate_kbps: config.video.bitrate,
            framerate: config.video.framerate,
        },
        audio_params: EncoderParams {
            bitrate_kbps: config.audio.bitrate,
            framerate: 1000 / capture::AUDIO_FRAME_MS,
        },
        negotiations: PeerNegotiatorFactory::new(config.ice.clone()),
    });

    let tls_acceptor = if config.tls.enabled {
        let cert = Path::new(&config.tls.cert_file);
        let key = Path::new(&config.tls.key_file);
        tls::ensure_certificate(cert, key)?;
        Some(tls::make_acceptor(tls::load_server_config(cert, key)?))
    } else {
        tracing::warn!("TLS is DISABLED. Credentials and tokens travel in plain text.");
        None
    };
    let scheme = if tls_acceptor.is_some() { "https" } else { "http" };

    let state = Arc::new(AppState {
        config,
        sessions: Arc::clone(&sessions),
        login_limiter: web::LoginRateLimiter::new(5, 60),
        started_at: std::time::Instant::now(),
    });

    let app = web::build_router(Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_request(|_request: &axum::http::Request<_>, _span: &tracing::Span| {
                    tracing::event!(Level::INFO, "started");
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    tracing::info!("===========================================");
    tracing::info!("  Periscope Remote Desktop Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Listening on {scheme}://{bind_addr}");
    tracing::info!("===========================================");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("Failed to accept TCP connection: {e}");
                        continue;
                    }
                };
                let app = app.clone();
                match &tls_acceptor {
                    Some(acceptor) => {
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            let tls_stream = match tokio::time::timeout(
                                Duration::from_secs(10),
                                acceptor.accept(stream),
                            ).await {
                                Ok(Ok(s)) => s,
                                Ok(Err(e)) => {
                                    tracing::debug!(%peer_addr, "TLS handshake failed: {e}");
                                    return;
                                }
                                Err(_) => {
                                    tracing::debug!(%peer_addr, "TLS handshake timed out");
                                    return;
                                }
                            };
                            serve_connection(tls_stream, app, peer_addr).await;
                        });
                    }
                    None => {
                        tokio::spawn(serve_connection(stream, app, peer_addr));
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
                break;
            }
        }
    }

    let signalled = sessions.registry.terminate_all().await;
    if signalled > 0 {
        tracing::info!("Terminating {signalled} session(s)");
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while !sessions.registry.is_empty().await {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = sessions.registry.len().await,
                "Sessions still closing at shutdown"
            );
        }
    }

    tracing::info!("Periscope server shut down cleanly");
    Ok(())
}

async fn serve_connection<S>(stream: S, app: Router, peer_addr: SocketAddr)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let io = hyper_util::rt::TokioIo::new(stream);
    let hyper_service = hyper_util::service::TowerToHyperService::new(app);
    let builder = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new());

    if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
        tracing::debug!(%peer_addr, "Connection error: {e}");
    }
}
