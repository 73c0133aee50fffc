use crate::{
    auths::{AuthRepository, MemoryAuthRepository, PgAuthRepository},
    cli::globals::GlobalArgs,
    groups::{AuthGroupHierarchy, GroupRepository, MemoryGroupRepository, PgGroupRepository},
    oauth::{HttpIdentityProvider, IdentityProvider, OAuthStateManager},
    ratelimit::{LoginRateLimiter, RateLimitConfig, ResetDispatcher},
    session::{MemorySessionStore, PgSessionStore, SessionConfig, SessionIssuer, SessionStore},
    store::{KeyedStore, MemoryStore, PgStore},
    tenants::{MemoryTenantDirectory, PgTenantDirectory, TenantDirectory},
    users::{MemoryUserRepository, PgUserRepository, UserRepository, ensure_admin},
};
use anyhow::{Context, Result};
use axum::{
    Extension, Json, Router,
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    routing::get,
};
use secrecy::ExposeSecret;
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, task::JoinHandle};
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Instrument, Span, debug, error, info, info_span};
use ulid::Ulid;
use utoipa_axum::router::OpenApiRouter;

pub mod error;
pub mod handlers;
// OpenAPI router wiring and route registration live in openapi.rs.
mod openapi;

pub use openapi::openapi;

const RESET_QUEUE_CAPACITY: usize = 1024;
const JANITOR_INTERVAL: Duration = Duration::from_secs(5 * 60);
const SCHEMA: &str = include_str!("../../sql/schema.sql");

/// Build the API router with all documented routes registered.
#[must_use]
pub fn router() -> OpenApiRouter {
    openapi::api_router()
}

/// Storage behind the service, one implementation per concern.
pub struct Backends {
    pub store: Arc<dyn KeyedStore>,
    pub groups: Arc<dyn GroupRepository>,
    pub tenants: Arc<dyn TenantDirectory>,
    pub auths: Arc<dyn AuthRepository>,
    pub sessions: Arc<dyn SessionStore>,
    pub users: Arc<dyn UserRepository>,
}

impl Backends {
    /// In-process backends for a single node and for tests.
    #[must_use]
    pub fn memory() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            groups: Arc::new(MemoryGroupRepository::new()),
            tenants: Arc::new(MemoryTenantDirectory::new()),
            auths: Arc::new(MemoryAuthRepository::new()),
            sessions: Arc::new(MemorySessionStore::new()),
            users: Arc::new(MemoryUserRepository::new()),
        }
    }

    #[must_use]
    pub fn postgres(pool: &PgPool) -> Self {
        Self {
            store: Arc::new(PgStore::new(pool.clone())),
            groups: Arc::new(PgGroupRepository::new(pool.clone())),
            tenants: Arc::new(PgTenantDirectory::new(pool.clone())),
            auths: Arc::new(PgAuthRepository::new(pool.clone())),
            sessions: Arc::new(PgSessionStore::new(pool.clone())),
            users: Arc::new(PgUserRepository::new(pool.clone())),
        }
    }
}

/// Everything a handler needs, shared behind one `Arc`.
pub struct AppState {
    pub limiter: Arc<LoginRateLimiter>,
    pub resets: ResetDispatcher,
    pub groups: AuthGroupHierarchy,
    pub oauth: OAuthStateManager,
    pub identity: Arc<dyn IdentityProvider>,
    pub tenants: Arc<dyn TenantDirectory>,
    pub auths: Arc<dyn AuthRepository>,
    pub sessions: SessionIssuer,
    pub users: Arc<dyn UserRepository>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("limiter", &self.limiter)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Wire components over `backends` and start the login reset worker.
    #[must_use]
    pub fn new(
        backends: Backends,
        identity: Arc<dyn IdentityProvider>,
        rate_limit: RateLimitConfig,
        session: SessionConfig,
    ) -> (Self, JoinHandle<()>) {
        let limiter = Arc::new(LoginRateLimiter::new(backends.store.clone(), rate_limit));
        let (resets, worker) = ResetDispatcher::spawn(limiter.clone(), RESET_QUEUE_CAPACITY);
        let state = Self {
            limiter,
            resets,
            groups: AuthGroupHierarchy::new(backends.groups),
            oauth: OAuthStateManager::new(backends.store, backends.tenants.clone()),
            identity,
            tenants: backends.tenants,
            auths: backends.auths,
            sessions: SessionIssuer::new(backends.sessions, session),
            users: backends.users,
        };
        (state, worker)
    }
}

/// Served router: documented routes, `/openapi.json` and the request layers.
#[must_use]
pub fn app(state: Arc<AppState>) -> Router {
    let (router, spec) = router().split_for_parts();
    router
        .route("/openapi.json", get(move || async move { Json(spec) }))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(state)),
        )
}

/// Start the server
/// # Errors
/// Return error if the database is unreachable, the schema cannot be applied
/// or the listener fails
pub async fn new(
    port: u16,
    dsn: String,
    globals: &GlobalArgs,
    rate_limit: RateLimitConfig,
    session: SessionConfig,
) -> Result<()> {
    // Connect to database
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    let span = info_span!("db.query", db.system = "postgresql", db.operation = "MIGRATE");
    sqlx::raw_sql(SCHEMA)
        .execute(&pool)
        .instrument(span)
        .await
        .context("Failed to apply database schema")?;

    let backends = Backends::postgres(&pool);

    if let (Some(account), Some(password)) = (&globals.admin_account, &globals.admin_password) {
        ensure_admin(backends.users.as_ref(), account, password.expose_secret())
            .await
            .context("Failed to create admin account")?;
    }

    let identity = Arc::new(
        HttpIdentityProvider::new().context("Failed to build identity provider client")?,
    );
    let (state, _reset_worker) = AppState::new(backends, identity, rate_limit, session);

    spawn_janitor(
        PgStore::new(pool.clone()),
        PgSessionStore::new(pool),
        JANITOR_INTERVAL,
    );

    let app = app(Arc::new(state));

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {err}");
        }
        info!("Gracefully shutdown");
    })
    .await?;

    Ok(())
}

/// Periodically delete expired keyed entries and sessions. Rows past their
/// expiry are already invisible to readers; this only reclaims space.
pub fn spawn_janitor(
    store: PgStore,
    sessions: PgSessionStore,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match store.purge_expired().await {
                Ok(purged) => debug!(purged, "Purged expired keyed entries"),
                Err(err) => error!("Failed to purge keyed entries: {err}"),
            }
            match sessions.purge_expired().await {
                Ok(purged) => debug!(purged, "Purged expired sessions"),
                Err(err) => error!("Failed to purge sessions: {err}"),
            }
        }
    })
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
