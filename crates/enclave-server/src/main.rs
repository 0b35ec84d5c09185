use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use enclave_api::middleware::require_auth;
use enclave_api::{ApiState, ApiStateInner, auth, invites, realms};
use enclave_gateway::{GatewayState, RateLimiter, RoomRouter, ws_handler};

/// Interval for sweeping expired rate-limit windows.
const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "enclave_server=debug,enclave_api=debug,enclave_gateway=debug,tower_http=debug"
                    .into()
            }),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("ENCLAVE_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("ENCLAVE_DB_PATH").unwrap_or_else(|_| "enclave.db".into());
    let host = std::env::var("ENCLAVE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("ENCLAVE_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database
    let db = Arc::new(enclave_db::Database::open(&PathBuf::from(&db_path))?);

    // Shared state
    let limiter = Arc::new(RateLimiter::new());
    let api_state: ApiState = Arc::new(ApiStateInner {
        db: db.clone(),
        jwt_secret: jwt_secret.clone(),
    });
    let gateway_state = Arc::new(GatewayState {
        db,
        router: RoomRouter::new(),
        limiter: limiter.clone(),
        jwt_secret,
    });

    // Stale rate windows are swept in the background.
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(LIMITER_SWEEP_INTERVAL);
        loop {
            tick.tick().await;
            limiter.purge_expired(LIMITER_SWEEP_INTERVAL);
        }
    });

    // Routes
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(api_state.clone());

    let protected_routes = Router::new()
        .route("/realms", post(realms::create_realm))
        .route("/realms/join-by-code", post(invites::join_by_code))
        .route("/realms/{realm_id}/channels", post(realms::create_channel))
        .route(
            "/realms/{realm_id}/invitations",
            post(invites::mint_invitation),
        )
        .layer(middleware::from_fn_with_state(
            api_state.clone(),
            require_auth,
        ))
        .with_state(api_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_handler))
        .with_state(gateway_state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Enclave server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
