//! `/api/users` administration.
//!
//! Admins see and change everything. A non-admin may read their own record
//! and change their own password, locale and view mode.

use std::path::PathBuf;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::header;
use hyper::{Request, Response, StatusCode};
use protocol::messages::{UserRequest, UserView};
use protocol::{ApiError, UserId};
use tracing::info;

use super::auth_routes::create_user;
use super::responses::{self, ResponseBody, MAX_JSON_BODY};
use super::AppState;
use crate::auth::{hash_password, require_auth, RequestContext};
use crate::store::{validate_username, StoreError, User};

fn parse_id(raw: &str) -> Result<UserId, ApiError> {
    raw.trim_end_matches('/')
        .parse()
        .map_err(|_| ApiError::not_found(format!("no user route for {:?}", raw)))
}

fn require_admin(user: &User) -> Result<(), ApiError> {
    if user.perm.admin {
        Ok(())
    } else {
        Err(ApiError::permission_denied(format!(
            "user {} is not an admin",
            user.id
        )))
    }
}

fn absolute_scope(scope: &str) -> Result<PathBuf, ApiError> {
    let path = PathBuf::from(scope);
    if path.is_absolute() {
        Ok(path)
    } else {
        Err(ApiError::validation(format!("scope {:?} is not absolute", scope)))
    }
}

fn get_target(state: &AppState, id: UserId) -> Result<User, ApiError> {
    state.store.get(id).map_err(|e| match e {
        StoreError::NotExist => ApiError::not_found(format!("user {} does not exist", id)),
        other => other.into(),
    })
}

async fn read_request(req: Request<Incoming>) -> Result<UserRequest, ApiError> {
    let body = responses::read_body(req.into_body(), MAX_JSON_BODY).await?;
    responses::parse_json(&body)
}

/// `GET /api/users`
pub async fn list(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Result<Response<ResponseBody>, ApiError> {
    let inner = Arc::clone(&state);
    require_auth(&state.codec, req, move |ctx, _req| async move {
        require_admin(&inner.resolver.load_user(&ctx)?)?;
        let users: Vec<UserView> = inner.store.list()?.iter().map(User::view).collect();
        responses::json(StatusCode::OK, &users)
    })
    .await
}

/// `POST /api/users`
pub async fn create(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Result<Response<ResponseBody>, ApiError> {
    let inner = Arc::clone(&state);
    require_auth(&state.codec, req, move |ctx, req| async move {
        let caller = inner.resolver.load_user(&ctx)?;
        require_admin(&caller)?;

        let request = read_request(req).await?;
        let username = request.username.unwrap_or_default();
        let password = request.password.unwrap_or_default();
        if username.is_empty() || password.is_empty() {
            return Err(ApiError::validation("username and password are required"));
        }
        validate_username(&username)?;

        let mut user = User::from_defaults(&inner.config.defaults, &username, String::new());
        if let Some(locale) = request.locale {
            user.locale = locale;
        }
        if let Some(view_mode) = request.view_mode {
            user.view_mode = view_mode;
        }
        if let Some(scope) = request.scope {
            user.scope = absolute_scope(&scope)?;
        }
        if let Some(perm) = request.perm {
            user.perm = perm;
        }

        let user = create_user(&inner, user, &password).await?;
        info!(admin_id = caller.id, user_id = user.id, username = %user.username, "User created");

        let mut response = responses::json(StatusCode::CREATED, &user.view())?;
        responses::set_header(
            &mut response,
            header::LOCATION,
            &format!("/api/users/{}", user.id),
        );
        Ok::<_, ApiError>(response)
    })
    .await
}

/// `GET /api/users/{id}`
pub async fn get(
    state: Arc<AppState>,
    req: Request<Incoming>,
    raw_id: &str,
) -> Result<Response<ResponseBody>, ApiError> {
    let raw_id = raw_id.to_string();
    let inner = Arc::clone(&state);
    require_auth(&state.codec, req, move |ctx, _req| async move {
        let id = parse_id(&raw_id)?;
        let caller = inner.resolver.load_user(&ctx)?;
        if caller.id != id {
            require_admin(&caller)?;
        }
        responses::json(StatusCode::OK, &get_target(&inner, id)?.view())
    })
    .await
}

/// `PUT /api/users/{id}`
pub async fn update(
    state: Arc<AppState>,
    req: Request<Incoming>,
    raw_id: &str,
) -> Result<Response<ResponseBody>, ApiError> {
    let raw_id = raw_id.to_string();
    let inner = Arc::clone(&state);
    require_auth(&state.codec, req, move |ctx, req| async move {
        let id = parse_id(&raw_id)?;
        let caller = inner.resolver.load_user(&ctx)?;
        let request = read_request(req).await?;
        let user = apply_update(&inner, &ctx, &caller, id, request).await?;
        responses::json(StatusCode::OK, &user.view())
    })
    .await
}

async fn apply_update(
    state: &AppState,
    ctx: &RequestContext,
    caller: &User,
    id: UserId,
    request: UserRequest,
) -> Result<User, ApiError> {
    if caller.id != id {
        require_admin(caller)?;
    }
    let privileged =
        request.username.is_some() || request.scope.is_some() || request.perm.is_some();
    if privileged {
        require_admin(caller)?;
    }

    let mut user = get_target(state, id)?;
    if let Some(username) = request.username {
        validate_username(&username)?;
        user.username = username;
    }
    if let Some(scope) = request.scope {
        user.scope = absolute_scope(&scope)?;
    }
    if let Some(perm) = request.perm {
        if caller.id == id && !perm.admin {
            return Err(ApiError::validation("admins cannot revoke their own admin bit"));
        }
        user.perm = perm;
    }
    if let Some(locale) = request.locale {
        user.locale = locale;
    }
    if let Some(view_mode) = request.view_mode {
        user.view_mode = view_mode;
    }
    if let Some(password) = request.password {
        if password.is_empty() {
            return Err(ApiError::validation("password is empty"));
        }
        user.password = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| ApiError::internal(format!("hash task failed: {}", e)))??;
    }

    state.store.update(&user).map_err(|e| match e {
        StoreError::Exist => ApiError::conflict(format!("username {:?} is taken", user.username)),
        StoreError::NotExist => ApiError::not_found(format!("user {} does not exist", id)),
        other => other.into(),
    })?;
    info!(
        request_id = %ctx.request_id,
        caller_id = caller.id,
        user_id = id,
        "User updated"
    );
    Ok(user)
}

/// `DELETE /api/users/{id}`
pub async fn delete(
    state: Arc<AppState>,
    req: Request<Incoming>,
    raw_id: &str,
) -> Result<Response<ResponseBody>, ApiError> {
    let raw_id = raw_id.to_string();
    let inner = Arc::clone(&state);
    require_auth(&state.codec, req, move |ctx, _req| async move {
        let id = parse_id(&raw_id)?;
        let caller = inner.resolver.load_user(&ctx)?;
        require_admin(&caller)?;
        if caller.id == id {
            return Err(ApiError::permission_denied("admins cannot delete themselves"));
        }

        inner.store.delete(id).map_err(|e| match e {
            StoreError::NotExist => ApiError::not_found(format!("user {} does not exist", id)),
            other => other.into(),
        })?;
        info!(admin_id = caller.id, user_id = id, "User deleted");
        Ok::<_, ApiError>(responses::status_line(StatusCode::OK))
    })
    .await
}
