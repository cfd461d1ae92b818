//! Wiring from configuration to a running router.

use std::{sync::Arc, time::Duration};

use axum::Router;
use chat_relay_client::{
    BridgeConfig, BridgeFactory, LoopbackFactory, loopback::LoopbackOptions,
};
use chat_relay_core::{ClientFactory, EventBus, MessageStore, StoreError, StreamManager};
use chat_relay_session::{SessionRegistry, storage::MemoryMessageStore};
use chat_relay_transport::{AppState, router};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::config::{AppConfig, ClientMode, StorageBackend};

/// Router plus the registry and streams it serves, kept for shutdown.
pub struct App {
    pub router: Router,
    pub registry: Arc<SessionRegistry>,
    pub streams: StreamManager,
}

/// Build the application from validated configuration.
///
/// # Errors
/// Returns `StoreError` if the message store cannot be opened.
pub async fn build(config: &AppConfig) -> Result<App, StoreError> {
    let store = open_store(config).await?;
    let factory = client_factory(config);

    let bus = EventBus::new();
    let registry = SessionRegistry::new(factory, store, bus.clone());
    let streams = StreamManager::new(bus, &config.stream.stream_config());

    let router = router(AppState::new(Arc::clone(&registry), streams.clone()))
        .layer(CorsLayer::permissive());
    Ok(App {
        router,
        registry,
        streams,
    })
}

/// Serve `app` until `signal` resolves, then shut down.
///
/// Live streams are ended as soon as the signal fires so open SSE and
/// WebSocket viewers do not hold the graceful drain open. Sessions are
/// destroyed once the server has stopped.
///
/// # Errors
/// Returns the I/O error that stopped the server.
pub async fn serve<F>(app: App, listener: TcpListener, signal: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let App {
        router,
        registry,
        streams,
    } = app;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            signal.await;
            streams.shutdown_all();
        })
        .await?;

    let closed = registry.shutdown_all().await;
    tracing::info!(sessions = closed, "Server stopped");
    Ok(())
}

fn client_factory(config: &AppConfig) -> Arc<dyn ClientFactory> {
    let client = &config.client;
    match client.mode {
        ClientMode::Loopback => {
            tracing::info!("Using loopback automation client");
            Arc::new(LoopbackFactory::new(LoopbackOptions {
                auto_login: client.loopback_auto_login_secs.map(Duration::from_secs),
                echo: client.loopback_echo,
            }))
        }
        ClientMode::Bridge => {
            let command = client.bridge_command.clone().unwrap_or_default();
            tracing::info!(command = %command, "Using bridge automation client");
            Arc::new(BridgeFactory::new(
                BridgeConfig::new(command).with_request_timeout(client.request_timeout()),
            ))
        }
    }
}

async fn open_store(config: &AppConfig) -> Result<Arc<dyn MessageStore>, StoreError> {
    match config.storage.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryMessageStore::new())),
        #[cfg(feature = "sqlite")]
        StorageBackend::Sqlite => {
            let url = &config.storage.sqlite_url;
            tracing::info!(url = %url, "Opening SQLite message store");
            let store =
                chat_relay_session::storage::SqliteMessageStore::connect(url).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        StorageBackend::Sqlite => Err(StoreError::Internal(
            "SQLite storage requires the `sqlite` feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use chat_relay_core::UserId;
    use serde_json::{Value, json};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
        sync::oneshot,
    };
    use tower::ServiceExt;

    use super::*;

    #[tokio::test]
    async fn test_default_app_serves_api() {
        let app = build(&AppConfig::default()).await.unwrap();

        let response = app
            .router
            .clone()
            .oneshot(
                Request::post("/whatsapp/initialize")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"userId":"u1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(app.registry.session_count(), 1);

        let response = app
            .router
            .oneshot(Request::get("/whatsapp/logout/u1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        assert_eq!(app.registry.shutdown_all().await, 1);
        assert_eq!(app.registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_loopback_auto_login() {
        let mut config = AppConfig::default();
        config.client.loopback_auto_login_secs = Some(0);
        let app = build(&config).await.unwrap();

        app.router
            .clone()
            .oneshot(
                Request::post("/whatsapp/initialize")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"userId":"u1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        let mut state = app
            .registry
            .watch_state(&chat_relay_core::UserId::new("u1"))
            .unwrap();
        state
            .wait_for(|s| *s == chat_relay_core::SessionState::Ready)
            .await
            .unwrap();

        let response = app
            .router
            .oneshot(Request::get("/whatsapp/qr/u1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, json!({"message": "User is already logged in."}));
    }

    #[tokio::test]
    async fn test_shutdown_ends_open_sse_viewers() {
        let app = build(&AppConfig::default()).await.unwrap();
        let streams = app.streams.clone();
        let user = UserId::new("u1");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(app, listener, async move {
            let _ = stopped.await;
        }));

        let mut viewer = TcpStream::connect(addr).await.unwrap();
        viewer
            .write_all(b"GET /whatsapp/messages/stream/u1 HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut buf = vec![0u8; 1024];
        let n = viewer.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200 OK"));
        assert_eq!(streams.active_connections(&user), 1);

        stop.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server kept draining with a viewer connected")
            .unwrap()
            .unwrap();

        assert!(streams.is_shut_down());
        assert_eq!(streams.active_connections(&user), 0);
    }

    #[cfg(not(feature = "sqlite"))]
    #[tokio::test]
    async fn test_sqlite_backend_without_feature() {
        let mut config = AppConfig::default();
        config.storage.backend = StorageBackend::Sqlite;
        assert!(build(&config).await.is_err());
    }
}
