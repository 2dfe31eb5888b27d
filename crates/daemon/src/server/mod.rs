//! HTTP server: connection loop, routing and request logging.
//!
//! Built on hyper's http1 connection driver with one task per connection.
//! Routing is a plain match over method and path; every handler returns
//! `Result<Response, ApiError>` and errors are rendered here as bare status
//! lines, with the detail kept in the log.

pub mod auth_routes;
pub mod resources;
pub mod responses;
pub mod user_routes;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use protocol::{ApiError, ErrorKind};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{verifier, CredentialVerifier, TokenCodec, TokenError};
use crate::config::Config;
use crate::files::ScopeResolver;
use crate::store::UserStore;
use responses::ResponseBody;

/// Everything a request handler needs. Built once at startup and shared
/// read-only across connections; per-user state lives in the store.
pub struct AppState {
    pub config: Config,
    pub codec: TokenCodec,
    pub store: Arc<dyn UserStore>,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub resolver: ScopeResolver,
}

impl AppState {
    pub fn new(config: Config, key: &[u8], store: Arc<dyn UserStore>) -> Result<Self, TokenError> {
        let codec = TokenCodec::new(key)?;
        let verifier = verifier::from_config(&config.auth);
        let resolver = ScopeResolver::new(Arc::clone(&store));
        Ok(Self {
            config,
            codec,
            store,
            verifier,
            resolver,
        })
    }
}

/// Accept connections on `listener` until `shutdown` fires.
///
/// In-flight connections are not awaited; each finishes on its own task.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let local = listener.local_addr()?;
    info!(address = %local, auth = state.verifier.name(), "Filekeep listening");

    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutting down HTTP server");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "Error accepting connection");
                    continue;
                }
            },
        };

        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { Ok::<_, Infallible>(handle_request(state, addr, req).await) }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                debug!(peer = %addr, error = %err, "Connection ended with error");
            }
        });
    }
}

/// Route one request and log its outcome.
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Response<ResponseBody> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match route(state, req).await {
        Ok(response) => response,
        Err(err) => {
            log_error(&method, &path, &err);
            responses::error_response(&err)
        }
    };

    info!(
        peer = %addr,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request"
    );
    response
}

fn log_error(method: &Method, path: &str, err: &ApiError) {
    match err.kind() {
        ErrorKind::Internal => {
            error!(method = %method, path = %path, error = %err.detail(), "Request failed")
        }
        ErrorKind::AuthFailure | ErrorKind::PermissionDenied => {
            warn!(method = %method, path = %path, error = %err.detail(), "Request denied")
        }
        _ => debug!(method = %method, path = %path, error = %err.detail(), "Request rejected"),
    }
}

async fn route(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Result<Response<ResponseBody>, ApiError> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (method, path.as_str()) {
        (Method::POST, "/api/login") => auth_routes::login(state, req).await,
        (Method::POST, "/api/signup") => auth_routes::signup(state, req).await,
        (Method::POST, "/api/renew") => auth_routes::renew(state, req).await,

        (Method::GET, "/api/users") => user_routes::list(state, req).await,
        (Method::POST, "/api/users") => user_routes::create(state, req).await,
        (method, p) if p.starts_with("/api/users/") => {
            let id = &p["/api/users/".len()..];
            match method {
                Method::GET => user_routes::get(state, req, id).await,
                Method::PUT => user_routes::update(state, req, id).await,
                Method::DELETE => user_routes::delete(state, req, id).await,
                _ => Ok(responses::status_line(StatusCode::METHOD_NOT_ALLOWED)),
            }
        }

        (method, p) if p == "/api/resources" || p.starts_with("/api/resources/") => {
            let raw = &p["/api/resources".len()..];
            match method {
                Method::GET => resources::get(state, req, raw).await,
                Method::POST | Method::PUT => resources::upload(state, req, raw).await,
                Method::DELETE => resources::delete(state, req, raw).await,
                Method::PATCH => resources::patch(state, req, raw).await,
                _ => Ok(responses::status_line(StatusCode::METHOD_NOT_ALLOWED)),
            }
        }

        _ => Err(ApiError::not_found(format!("no route for {}", path))),
    }
}
