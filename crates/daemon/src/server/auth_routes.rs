//! `POST /api/login`, `POST /api/signup` and `POST /api/renew`.

use std::sync::Arc;

use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use protocol::messages::SignupRequest;
use protocol::ApiError;
use tracing::{info, warn};

use super::responses::{self, ResponseBody, MAX_JSON_BODY};
use super::AppState;
use crate::auth::{hash_password, require_auth, LoginAttempt};
use crate::store::{validate_username, StoreError, User};

/// Authenticate through the configured verifier and return a signed token
/// as plain text.
pub async fn login(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Result<Response<ResponseBody>, ApiError> {
    let (parts, body) = req.into_parts();
    let body = responses::read_body(body, MAX_JSON_BODY)
        .await
        .map_err(|e| ApiError::auth_failure(e.detail().to_string()))?;
    let attempt = LoginAttempt {
        headers: parts.headers,
        body,
    };

    let user = match state
        .verifier
        .authenticate(&attempt, Arc::clone(&state.store))
        .await
    {
        Ok(user) => user,
        Err(e) => {
            warn!(backend = state.verifier.name(), "Login failed");
            return Err(e);
        }
    };

    let token = state.codec.issue(user.id)?;
    info!(user_id = user.id, username = %user.username, "Login succeeded");
    Ok(responses::text(StatusCode::OK, token))
}

/// Self-registration with configured defaults. Disabled signup is a 403
/// regardless of the body.
pub async fn signup(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Result<Response<ResponseBody>, ApiError> {
    if !state.config.auth.signup {
        return Err(ApiError::permission_denied("signup is disabled"));
    }

    let body = responses::read_body(req.into_body(), MAX_JSON_BODY).await?;
    let request: SignupRequest = responses::parse_json(&body)?;
    if request.username.is_empty() || request.password.is_empty() {
        return Err(ApiError::validation("username and password are required"));
    }
    validate_username(&request.username)?;

    let user = User::from_defaults(&state.config.defaults, &request.username, String::new());
    let user = create_user(&state, user, &request.password).await?;
    info!(user_id = user.id, username = %user.username, "User signed up");
    Ok(responses::status_line(StatusCode::OK))
}

/// Fresh token for the caller, provided their account still exists.
pub async fn renew(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Result<Response<ResponseBody>, ApiError> {
    let inner = Arc::clone(&state);
    require_auth(&state.codec, req, move |ctx, _req| async move {
        let user = inner.resolver.load_user(&ctx)?;
        let token = inner.codec.issue(user.id)?;
        Ok::<_, ApiError>(responses::text(StatusCode::OK, token))
    })
    .await
}

/// Hash `password` into `user`, create its scope directory when
/// `create_user_dir` is set, and save it.
pub(crate) async fn create_user(
    state: &AppState,
    mut user: User,
    password: &str,
) -> Result<User, ApiError> {
    let password = password.to_string();
    user.password = tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| ApiError::internal(format!("hash task failed: {}", e)))??;

    if state.config.defaults.create_user_dir {
        tokio::fs::create_dir_all(&user.scope).await.map_err(|e| {
            ApiError::internal(format!("creating scope {}: {}", user.scope.display(), e))
        })?;
    }

    let username = user.username.clone();
    match state.store.save(user) {
        Ok(user) => Ok(user),
        Err(StoreError::Exist) => Err(ApiError::conflict(format!(
            "username {:?} is taken",
            username
        ))),
        Err(e) => Err(e.into()),
    }
}
