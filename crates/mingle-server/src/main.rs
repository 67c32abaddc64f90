use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use mingle_api::auth::{self, AppState, AppStateInner};
use mingle_api::chat;
use mingle_api::middleware::{require_auth, verify_token};
use mingle_gateway::dispatcher::Dispatcher;
use mingle_gateway::registry::ConnectionRegistry;
use mingle_gateway::session;
use mingle_gateway::storage::FsObjectStore;

#[derive(Clone)]
struct ServerState {
    registry: ConnectionRegistry,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mingle=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("MINGLE_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("MINGLE_DB_PATH").unwrap_or_else(|_| "mingle.db".into());
    let storage_dir =
        std::env::var("MINGLE_STORAGE_DIR").unwrap_or_else(|_| "mingle-files".into());
    let public_base = std::env::var("MINGLE_PUBLIC_BASE").unwrap_or_else(|_| "/files".into());
    let host = std::env::var("MINGLE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("MINGLE_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database and attachment storage
    let db = Arc::new(mingle_db::Database::open(&PathBuf::from(&db_path))?);
    let store = Arc::new(FsObjectStore::new(PathBuf::from(&storage_dir), public_base).await?);

    // Shared state
    let registry = ConnectionRegistry::new();
    let dispatcher = Dispatcher::new(db.clone(), registry.clone(), store);
    let app_state: AppState = Arc::new(AppStateInner {
        db,
        jwt_secret: jwt_secret.clone(),
        dispatcher,
    });

    let server_state = ServerState {
        registry,
        jwt_secret,
    };

    // Routes
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/chat/create/direct", post(chat::create_direct))
        .route("/chat/create/group", post(chat::create_group))
        .route("/chat/conversation/{conversation_id}/edit", put(chat::edit_conversation))
        .route("/chat/conversation/{conversation_id}/send", post(chat::send_message))
        .route("/chat/conversation/{conversation_id}/info", get(chat::conversation_info))
        .route("/chat/fetch", get(chat::fetch))
        .route("/chat/fetch_history", get(chat::fetch_history))
        .layer(middleware::from_fn(require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/chat/ws", get(ws_upgrade))
        .with_state(server_state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Mingle server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// Authenticate the bearer credential at the upgrade request, before the
/// socket exists: a bad token is turned away with 401 and never touches
/// the connection registry.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(query): Query<WsQuery>,
    headers: axum::http::HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = query.token.or_else(|| {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)
    });

    let Some(claims) = token.and_then(|t| verify_token(&state.jwt_secret, &t)) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    ws.on_upgrade(move |socket| {
        session::handle_connection(socket, state.registry, claims.sub, claims.username)
    })
    .into_response()
}
