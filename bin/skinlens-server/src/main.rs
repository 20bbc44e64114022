//! skinlens-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables and CLI overrides.
//! 2. Initialise structured tracing (JSON or pretty, optional rolling file).
//! 3. Load the class dictionary.
//! 4. Open the SQLite database and run pending migrations.
//! 5. Load the ONNX model and build the inference service.
//! 6. Bind the HTTP and gRPC listeners.
//! 7. Run the listeners and the audit-event consumer under the shutdown
//!    coordinator until a signal arrives or a component fails.  The listeners
//!    stop first; the consumer then drains every queued event.
//! 8. Close the model session and the database.
//!
//! Any failure before step 7 aborts startup.

mod analysis;
mod audit;
mod config;
mod db;
mod error;
mod grpc;
mod middleware;
mod routes;
mod schemas;
mod state;
mod tensor;
#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use skinlens_core::{
    CancellationToken, ClassDictionary, InferenceService, ModelSession, ShutdownCoordinator,
    ShutdownError, events,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{Cli, Config};
use crate::db::sqlite::SqliteAuditStore;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env().with_cli(Cli::parse());

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let _log_guard = init_tracing(&cfg);
    info!(version = env!("CARGO_PKG_VERSION"), "skinlens-server starting");

    // ── 3. Class dictionary ────────────────────────────────────────────────────
    let dictionary = ClassDictionary::load(&cfg.class_dictionary_path).with_context(|| {
        format!(
            "loading class dictionary from {}",
            cfg.class_dictionary_path.display()
        )
    })?;

    // ── 4. Database ────────────────────────────────────────────────────────────
    let store = SqliteAuditStore::connect(&cfg.database_url)
        .await
        .with_context(|| format!("opening database {}", cfg.database_url))?;
    info!(
        database_url = %cfg.database_url,
        audit_events = store.count().await?,
        "database ready"
    );

    // ── 5. Model + inference service ───────────────────────────────────────────
    let model_config = cfg.model_config();
    let session = tokio::task::spawn_blocking(move || ModelSession::open(&model_config))
        .await?
        .with_context(|| format!("loading model {}", cfg.model_path.display()))?;
    let inference = Arc::new(InferenceService::new(session, dictionary)?);

    // ── 6. Listeners ───────────────────────────────────────────────────────────
    let http_listener = TcpListener::bind(&cfg.http_bind)
        .await
        .with_context(|| format!("binding HTTP listener on {}", cfg.http_bind))?;
    info!(addr = %cfg.http_bind, "HTTP server listening");
    let grpc_listener = TcpListener::bind(&cfg.grpc_bind)
        .await
        .with_context(|| format!("binding gRPC listener on {}", cfg.grpc_bind))?;
    info!(addr = %cfg.grpc_bind, "gRPC server listening");

    // ── 7. Components ──────────────────────────────────────────────────────────
    let coordinator = ShutdownCoordinator::new(cfg.shutdown_grace);
    tokio::spawn(cancel_on_signal(coordinator.token()));
    let outcome = run(
        coordinator,
        http_listener,
        grpc_listener,
        cfg,
        Arc::clone(&inference),
        store.clone(),
    )
    .await;

    // ── 8. Cleanup ─────────────────────────────────────────────────────────────
    if let Err(e) = inference.close().await {
        warn!(error = %e, "model session did not release cleanly");
    }
    store.close().await;

    match outcome {
        Ok(()) => {
            info!("skinlens-server stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "skinlens-server stopped with an error");
            Err(e.into())
        }
    }
}

/// Serve HTTP and gRPC and persist audit events until the coordinator's token
/// is cancelled.
///
/// The listeners finish their in-flight requests first; the event consumer
/// runs on the drain stage, so the audit events of those requests are still
/// persisted before it stops.
async fn run(
    mut coordinator: ShutdownCoordinator,
    http_listener: TcpListener,
    grpc_listener: TcpListener,
    cfg: Config,
    inference: Arc<InferenceService>,
    store: SqliteAuditStore,
) -> Result<(), ShutdownError> {
    let token = coordinator.token();
    let (publisher, consumer) =
        events::bounded(cfg.event_queue_capacity, coordinator.drain_token());

    let state = Arc::new(AppState {
        config: Arc::new(cfg),
        inference,
        events: publisher,
    });

    coordinator.spawn_drain("event-consumer", async move {
        consumer.run(store).await;
        Ok(())
    });
    coordinator.spawn(
        "http",
        routes::serve(http_listener, Arc::clone(&state), token.clone()),
    );
    coordinator.spawn("grpc", grpc::serve(grpc_listener, state, token));

    coordinator.wait().await
}

/// Build the log-level filter and install the subscriber.
///
/// The returned guard flushes the file writer and must live until exit.
fn init_tracing(cfg: &Config) -> Option<WorkerGuard> {
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: SKINLENS_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let stdout = if cfg.log_json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    };

    let (file, guard) = match &cfg.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "skinlens-server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_current_span(true)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout)
        .with(file)
        .init();
    guard
}

/// Cancel `token` when SIGINT (Ctrl-C) or SIGTERM is received.
async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = token.cancelled() => return,
    }

    info!("shutdown signal received; starting graceful shutdown");
    token.cancel();
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use skinlens_core::EventStatus;
    use skinlens_proto::SkinAnalysisServiceClient;
    use skinlens_proto::v1::AnalyzeSkinRequest;
    use skinlens_proto::v1::analyze_skin_request::RequestPayload;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;
    use crate::test_support::{self, f32le, valid_input};

    /// A one-shot HTTP/1.1 `POST /v1/predict`; returns the raw response.
    async fn post_predict(addr: SocketAddr) -> String {
        let body = serde_json::json!({ "input": valid_input() }).to_string();
        let request = format!(
            "POST /v1/predict HTTP/1.1\r\n\
             Host: {addr}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{body}",
            body.len()
        );
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_finishes_in_flight_requests_and_persists_their_events() {
        let store = SqliteAuditStore::in_memory().await;
        let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let grpc = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_addr = http.local_addr().unwrap();
        let grpc_addr = grpc.local_addr().unwrap();

        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let token = coordinator.token();
        let server = tokio::spawn(run(
            coordinator,
            http,
            grpc,
            test_support::config(),
            test_support::inference(Duration::from_millis(300)),
            store.clone(),
        ));

        let mut client = SkinAnalysisServiceClient::connect(format!("http://{grpc_addr}"))
            .await
            .unwrap();
        let upload = vec![AnalyzeSkinRequest {
            request_payload: Some(RequestPayload::Chunk(f32le(&valid_input()))),
        }];
        let grpc_call =
            tokio::spawn(async move { client.analyze_skin(futures::stream::iter(upload)).await });
        let http_call = tokio::spawn(post_predict(http_addr));

        // Both requests are now waiting on the engine.
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .expect("listeners and consumer stop within a bounded time")
            .unwrap();
        outcome.expect("clean shutdown");

        let http_response = http_call.await.unwrap();
        assert!(http_response.starts_with("HTTP/1.1 200"), "{http_response}");
        let grpc_response = grpc_call.await.unwrap().unwrap().into_inner();
        assert_eq!(grpc_response.results.len(), 1);

        let rows = store.all().await.unwrap();
        assert_eq!(rows.len(), 2, "every in-flight request is audited");
        assert!(rows.iter().all(|r| r.status == EventStatus::Success));
    }

    #[tokio::test]
    async fn idle_server_stops_on_cancel() {
        let store = SqliteAuditStore::in_memory().await;
        let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let grpc = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let token = coordinator.token();
        let server = tokio::spawn(run(
            coordinator,
            http,
            grpc,
            test_support::config(),
            test_support::inference(Duration::ZERO),
            store.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("bounded shutdown")
            .unwrap()
            .expect("clean shutdown");
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
