use crate::saml::{
    ErrorKind, IdentityProviderMetadataLoader, PgUserRepository, SamlError, SamlOrchestrator,
    ServiceProviderConfig, SessionSecrets, SessionStore, SystemMetadataReader,
};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{header::CONTENT_TYPE, HeaderName, HeaderValue, Method, Request},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Router,
};
use sqlx::postgres::PgPoolOptions;
use std::{any::Any, sync::Arc, time::Duration};
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{error, info, info_span, Span};
use ulid::Ulid;
use url::Url;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod handlers;
mod openapi;

pub use self::handlers::saml::FrontendOrigins;
pub use self::openapi::{openapi, ApiDoc};


/// Connection pool sizing.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime: Duration,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub dsn: String,
    pub pool: PoolConfig,
    pub idp_metadata_url: String,
    pub entity_id: String,
    pub backend_url: Url,
    pub frontend_origins: Vec<String>,
}

/// Start the server
/// # Errors
/// Return error if the database, the IdP metadata or the listener are not available
pub async fn new(config: ServerConfig) -> Result<()> {
    // Connect to database
    let pool = PgPoolOptions::new()
        .min_connections(config.pool.min_connections)
        .max_connections(config.pool.max_connections)
        .max_lifetime(config.pool.max_lifetime)
        .test_before_acquire(true)
        .connect(&config.dsn)
        .await
        .map_err(|e| SamlError::with_cause(ErrorKind::DbOpen, e))
        .context("Failed to connect to database")?;

    let sp_config = ServiceProviderConfig::new(&config.entity_id, &config.backend_url)?;
    let loader = IdentityProviderMetadataLoader::new(SystemMetadataReader::new()?);

    let saml = SamlOrchestrator::bootstrap(
        sp_config,
        &config.idp_metadata_url,
        &loader,
        Arc::new(PgUserRepository::new(pool)),
        SessionStore::new(SessionSecrets::generate()),
    )
    .await
    .context("Failed to initialize the SAML service provider")?;

    let origins = FrontendOrigins::new(&config.frontend_origins)?;
    let app = router(Arc::new(saml), origins)?;

    let listener = TcpListener::bind(format!("::0:{}", config.port)).await?;

    info!("Listening on [::]:{}", config.port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// All routes with their layers, without binding a listener.
///
/// # Errors
/// Returns an error if a frontend origin cannot be used as a CORS header value.
pub fn router(saml: Arc<SamlOrchestrator>, origins: FrontendOrigins) -> Result<Router> {
    let allowed = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin)
                .with_context(|| format!("Invalid frontend origin: {origin}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let cors = CorsLayer::new()
        .allow_headers([CONTENT_TYPE])
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(AllowOrigin::list(allowed))
        .allow_credentials(true);

    let app = Router::new()
        .route("/saml/login", get(handlers::saml::login))
        .route("/saml/acs", post(handlers::saml::acs))
        .route("/saml/logout", get(handlers::saml::logout))
        .route("/saml/slo", post(handlers::saml::slo))
        .route("/saml/error", get(handlers::saml::error))
        .route("/saml/metadata", get(handlers::saml::metadata))
        .route("/auth/refresh", post(handlers::saml::refresh))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
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
                .layer(CatchPanicLayer::custom(handle_panic))
                .layer(cors)
                .layer(Extension(saml))
                .layer(Extension(origins)),
        )
        .route(
            "/health",
            get(handlers::health).options(handlers::health),
        );

    Ok(app)
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

fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");

    SamlError::with_cause(ErrorKind::Panic, detail.to_string()).into_response()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Gracefully shutdown");
}
