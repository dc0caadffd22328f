use std::{env, net::SocketAddr, sync::Arc};

use anyhow::{anyhow, Context};
use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json,
};
use tower_http::cors::CorsLayer;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    conf,
    data::{Kv, Memory, Storage},
    docs::ApiDoc,
    generation::{GenerationError, Generator, Rejection},
    types::{
        GenerateReq, GenerateResp, GeneratedImage, Generation, SessionReq,
        User, UserStatus,
    },
    upstream::{GenerateError, Upstream},
};

pub const CLIENT_ID_HEADER: &str = "x-client-id";

const MAX_CLIENT_ID_LEN: usize = 128;

#[derive(Debug, serde::Serialize, serde::Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug)]
pub struct ApiError(StatusCode, Json<ErrorResponse>);

impl ApiError {
    fn new(status: StatusCode, error: String, details: Option<String>) -> Self {
        Self(status, Json(ErrorResponse { error, details }))
    }
}

impl From<GenerateError> for ApiError {
    fn from(error: GenerateError) -> Self {
        Self::new(error.status(), error.to_string(), error.details())
    }
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        Self::new(rejection.status(), rejection.to_string(), None)
    }
}

impl From<GenerationError> for ApiError {
    fn from(error: GenerationError) -> Self {
        match error {
            GenerationError::Rejected(rejection) => rejection.into(),
            GenerationError::Failed(error) => error.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError(status, body) = self;
        (status, body).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub generator: Arc<Generator>,
}

impl AppState {
    pub fn new(kv: Arc<dyn Kv>, upstream: Upstream) -> Self {
        Self {
            generator: Arc::new(Generator::new(kv, upstream)),
        }
    }
}

#[tracing::instrument(name = "server", skip_all)]
pub async fn run(memory: bool) -> anyhow::Result<()> {
    let conf = conf::global();
    let dir = env::current_dir()?;
    tracing::info!(?dir, ?conf, "Starting.");
    let addr = SocketAddr::from((conf.addr, conf.port));

    let upstream = Upstream::new(&conf.upstream)?;
    let kv: Arc<dyn Kv> = if memory {
        tracing::warn!("Using in-memory storage. Nothing will be persisted.");
        Arc::new(Memory::default())
    } else {
        let busy_timeout = conf.sqlite_busy_timeout()?;
        let storage = Storage::connect(&conf.data_file, busy_timeout)
            .await
            .context(format!("Failed to open storage: {:?}", conf.data_file))?;
        Arc::new(storage)
    };
    let state = AppState::new(kv, upstream);

    let cors = cors(&conf)?;
    let service = router(state).layer(cors).into_make_service();

    match &conf.tls {
        None => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::warn!(?addr, "Listening unencrypted.");
            axum::serve(listener, service).await?;
        }
        Some(conf::Tls {
            cert_file,
            key_file,
        }) => {
            // XXX One MUST do this manual init of rustls provider when using
            //     more than a single dep which itself depends on rustls.
            //     Here we using 2:
            //     - axum_server
            //     - reqwest
            rustls::crypto::aws_lc_rs::default_provider()
                .install_default()
                .map_err(|crypto_provider| {
                    anyhow!(
                        "Failed to install default crypto provider: \
                        {crypto_provider:?}"
                    )
                })?;

            let config =
                axum_server::tls_rustls::RustlsConfig::from_pem_file(
                    cert_file, key_file,
                )
                .await
                .context(format!(
                    "Failed to construct RustlsConfig. \
                    cert_file={cert_file:?}, key_file={key_file:?}"
                ))?;

            tracing::info!(
                ?addr,
                ?cert_file,
                ?key_file,
                "Listening with TLS."
            );
            axum_server::bind_rustls(addr, config)
                .serve(service)
                .await?;
        }
    }

    Ok(())
}

fn cors(conf: &conf::Conf) -> anyhow::Result<CorsLayer> {
    let origins = [
        "http://localhost:3000".to_string(),
        "https://localhost:3000".to_string(),
        format!("http://{}:{}", conf.addr, conf.port),
        format!("https://{}:{}", conf.addr, conf.port),
    ]
    .iter()
    .map(|origin| {
        HeaderValue::from_str(origin)
            .context(format!("Invalid CORS origin: {origin:?}"))
    })
    .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::ORIGIN,
            HeaderName::from_static(CLIENT_ID_HEADER),
        ])
        .allow_credentials(true)
        .expose_headers([header::CONTENT_TYPE, header::CONTENT_LENGTH]))
}

pub fn router(state: AppState) -> axum::Router {
    let client_scoped = axum::Router::new()
        .route("/api/session", post(session_handler))
        .route("/api/user", get(user_handler))
        .route("/api/upgrade", post(upgrade_handler))
        .route("/api/images", get(images_handler))
        .route("/api/generations", post(generations_handler))
        .route_layer(middleware::from_fn(client_layer));
    axum::Router::new()
        .route("/health", get(health_check))
        .route("/api/generate", post(generate_handler))
        .merge(client_scoped)
        .route_layer(middleware::from_fn(|req: Request, next: Next| {
            REQ_ID.scope(ReqId::new(), next.run(req))
        }))
        .merge(
            SwaggerUi::new("/swagger-ui")
                .url("/api-docs/openapi.json", ApiDoc::openapi()),
        )
        .with_state(state)
}

#[tracing::instrument(skip_all, fields(req_id = %REQ_ID.get().req_id))]
#[utoipa::path(
    post,
    path = "/api/generate",
    request_body = GenerateReq,
    responses(
        (status = 200, description = "Image generated", body = GenerateResp),
        (status = 400, description = "Prompt missing or body malformed", body = ErrorResponse),
        (status = 500, description = "Upstream misconfigured or unexpected upstream response", body = ErrorResponse),
        (status = "default", description = "Upstream failure, upstream status passed through", body = ErrorResponse),
    )
)]
pub async fn generate_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<GenerateResp>, ApiError> {
    let GenerateReq { prompt } = parse_body(&body)?;
    let image_url = state.generator.upstream().generate(&prompt).await?;
    Ok(Json(GenerateResp { image_url }))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = %REQ_ID.get().req_id, client = %CLIENT.get().id)
)]
#[utoipa::path(
    post,
    path = "/api/session",
    request_body = SessionReq,
    params(("x-client-id" = String, Header, description = "Client storage namespace")),
    responses(
        (status = 200, description = "Existing or newly created user", body = User),
        (status = 400, description = "Missing client id or malformed body", body = ErrorResponse),
    )
)]
pub async fn session_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<User>, ApiError> {
    let SessionReq { email } = parse_body(&body)?;
    let client = CLIENT.get();
    let user = state.generator.sign_in(&client.id, &email).await;
    Ok(Json(user))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = %REQ_ID.get().req_id, client = %CLIENT.get().id)
)]
#[utoipa::path(
    get,
    path = "/api/user",
    params(("x-client-id" = String, Header, description = "Client storage namespace")),
    responses(
        (status = 200, description = "User and remaining quota", body = UserStatus),
        (status = 401, description = "No user signed in", body = ErrorResponse),
    )
)]
pub async fn user_handler(
    State(state): State<AppState>,
) -> Result<Json<UserStatus>, ApiError> {
    let client = CLIENT.get();
    let status = state.generator.status(&client.id).await?;
    Ok(Json(status))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = %REQ_ID.get().req_id, client = %CLIENT.get().id)
)]
#[utoipa::path(
    post,
    path = "/api/upgrade",
    params(("x-client-id" = String, Header, description = "Client storage namespace")),
    responses(
        (status = 200, description = "User is now premium", body = User),
        (status = 401, description = "No user signed in", body = ErrorResponse),
    )
)]
pub async fn upgrade_handler(
    State(state): State<AppState>,
) -> Result<Json<User>, ApiError> {
    let client = CLIENT.get();
    let user = state.generator.upgrade(&client.id).await?;
    Ok(Json(user))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = %REQ_ID.get().req_id, client = %CLIENT.get().id)
)]
#[utoipa::path(
    get,
    path = "/api/images",
    params(("x-client-id" = String, Header, description = "Client storage namespace")),
    responses(
        (status = 200, description = "Gallery, newest first", body = Vec<GeneratedImage>),
    )
)]
pub async fn images_handler(
    State(state): State<AppState>,
) -> Json<Vec<GeneratedImage>> {
    let client = CLIENT.get();
    Json(state.generator.images(&client.id).await)
}

#[tracing::instrument(
    skip_all,
    fields(req_id = %REQ_ID.get().req_id, client = %CLIENT.get().id)
)]
#[utoipa::path(
    post,
    path = "/api/generations",
    request_body = GenerateReq,
    params(("x-client-id" = String, Header, description = "Client storage namespace")),
    responses(
        (status = 200, description = "Image generated and recorded", body = Generation),
        (status = 400, description = "Prompt missing or body malformed", body = ErrorResponse),
        (status = 401, description = "No user signed in", body = ErrorResponse),
        (status = 402, description = "Daily limit reached", body = ErrorResponse),
        (status = 500, description = "Upstream misconfigured or unexpected upstream response", body = ErrorResponse),
        (status = "default", description = "Upstream failure, upstream status passed through", body = ErrorResponse),
    )
)]
pub async fn generations_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Generation>, ApiError> {
    let GenerateReq { prompt } = parse_body(&body)?;
    let client = CLIENT.get();
    let generation = state.generator.generate(&client.id, &prompt).await?;
    Ok(Json(generation))
}

async fn health_check() -> &'static str {
    "OK"
}

fn parse_body<T: serde::de::DeserializeOwned>(
    body: &Bytes,
) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|error| {
        tracing::warn!(?error, "Failed to parse request body.");
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "Invalid request body".to_string(),
            Some(error.to_string()),
        )
    })
}

#[derive(Debug, Clone)]
struct Client {
    pub id: String,
}

#[derive(Debug, Clone)]
struct ReqId {
    pub req_id: String,
}

impl ReqId {
    fn new() -> Self {
        let req_id = cuid2::create_id();
        Self { req_id }
    }
}

tokio::task_local! {
    static CLIENT: Client;
    static REQ_ID: ReqId;
}

/// Scopes the request to the storage namespace named by the client id
/// header. This identifies, it does not authenticate.
async fn client_layer(req: Request, next: Next) -> Result<Response, ApiError> {
    let id = req
        .headers()
        .get(CLIENT_ID_HEADER)
        .ok_or_else(|| {
            tracing::warn!("Missing client id header.");
            bad_client_id(format!("{CLIENT_ID_HEADER} header is required"))
        })?
        .to_str()
        .map_err(|error| {
            tracing::warn!(?error, "Invalid client id header encoding.");
            bad_client_id(format!("{CLIENT_ID_HEADER} header is not valid"))
        })?
        .trim()
        .to_string();
    if !is_valid_client_id(&id) {
        tracing::warn!(client = ?id, "Rejected client id.");
        return Err(bad_client_id(format!(
            "{CLIENT_ID_HEADER} header is not valid"
        )));
    }
    tracing::debug!(client = %id, "Client scoped.");
    Ok(CLIENT.scope(Client { id }, next.run(req)).await)
}

fn bad_client_id(error: String) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, error, None)
}

fn is_valid_client_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_CLIENT_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
