//! `/api/resources/{path}`: the resource dispatcher.
//!
//! Each handler authenticates, resolves its target(s) through the scope
//! resolver, and hands the confined paths to [`crate::files`]. The route
//! suffix after `/api/resources` is the percent-encoded logical path.

use std::sync::Arc;

use futures_util::stream;
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap};
use hyper::{Request, Response, StatusCode};
use protocol::messages::{BatchRequest, ChecksumResponse, PatchAction};
use protocol::ApiError;
use tracing::info;

use super::responses::{self, ResponseBody, JSON_CONTENT_TYPE, MAX_JSON_BODY};
use super::AppState;
use crate::auth::require_auth;
use crate::files::transfer::{self, TransferError};
use crate::files::{browser, ops, resolve_for, Operation};

/// Query parameters understood by resource routes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResourceQuery {
    /// `override=true` lets `POST` replace an existing file.
    pub override_existing: bool,
    /// `action=rename|move|copy` for single-item `PATCH`.
    pub action: Option<String>,
    /// Logical destination for `PATCH`.
    pub destination: Option<String>,
    /// `checksum=sha256` on `GET`.
    pub checksum: Option<String>,
}

impl ResourceQuery {
    pub fn from_query_string(query: Option<&str>) -> Self {
        let mut params = Self::default();

        if let Some(q) = query {
            for pair in q.split('&') {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                let value = urlencoding::decode(&value.replace('+', " "))
                    .map(|v| v.into_owned())
                    .unwrap_or_default();
                match key {
                    "override" => params.override_existing = value == "true" || value == "1",
                    "action" => params.action = Some(value),
                    "destination" => params.destination = Some(value),
                    "checksum" => params.checksum = Some(value),
                    _ => {}
                }
            }
        }

        params
    }
}

/// Percent-decode the route suffix into a logical path.
pub fn decode_path(raw: &str) -> Result<String, ApiError> {
    let decoded = urlencoding::decode(raw)
        .map_err(|_| ApiError::validation(format!("path {:?} is not valid UTF-8", raw)))?;
    if decoded.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(decoded.into_owned())
    }
}

/// `GET`: list a directory, stream a file, or report a file's checksum.
pub async fn get(
    state: Arc<AppState>,
    req: Request<Incoming>,
    raw: &str,
) -> Result<Response<ResponseBody>, ApiError> {
    let raw = raw.to_string();
    let query = ResourceQuery::from_query_string(req.uri().query());
    let inner = Arc::clone(&state);

    require_auth(&state.codec, req, move |ctx, req| async move {
        let logical = decode_path(&raw)?;
        let (user, target) = inner.resolver.resolve(&ctx, &logical, Operation::List)?;
        let meta = tokio::fs::metadata(&target.path).await.map_err(|e| {
            if transfer::is_missing(&e) {
                ApiError::not_found(format!("{} not found", target.logical))
            } else {
                ApiError::from(e)
            }
        })?;

        if meta.is_dir() {
            let mut rx = browser::list_directory(&target, inner.config.files.chunk_size).await?;
            let body = stream::poll_fn(move |cx| rx.poll_recv(cx));
            return Ok(responses::stream(StatusCode::OK, JSON_CONTENT_TYPE, body));
        }

        if !Operation::Download.allowed_by(&user.perm) {
            return Err(ApiError::permission_denied(format!(
                "user {} may not download {}",
                user.id, target.logical
            )));
        }

        if let Some(algorithm) = query.checksum {
            if algorithm != "sha256" {
                return Err(ApiError::validation(format!(
                    "unsupported checksum algorithm {:?}",
                    algorithm
                )));
            }
            let (size, checksum) = transfer::checksum(&target.path).await?;
            return responses::json(
                StatusCode::OK,
                &ChecksumResponse {
                    path: target.logical,
                    size,
                    algorithm,
                    checksum,
                },
            );
        }

        serve_file(&target.path, req.headers(), inner.config.files.chunk_size).await
    })
    .await
}

async fn serve_file(
    path: &std::path::Path,
    headers: &HeaderMap,
    chunk_size: usize,
) -> Result<Response<ResponseBody>, ApiError> {
    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());

    let download = match transfer::open_download(path, range, chunk_size).await {
        Ok(download) => download,
        Err(TransferError::RangeNotSatisfiable { total }) => {
            let mut response = responses::status_line(StatusCode::RANGE_NOT_SATISFIABLE);
            responses::set_header(
                &mut response,
                header::CONTENT_RANGE,
                &format!("bytes */{}", total),
            );
            return Ok(response);
        }
        Err(e) => return Err(e.into()),
    };

    let status = if download.range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let len = download.len();
    let total = download.total;
    let range = download.range;
    let content_type = download.content_type;

    let mut response = responses::stream(status, &content_type, download.stream);
    responses::set_header(&mut response, header::CONTENT_LENGTH, &len.to_string());
    responses::set_header(&mut response, header::ACCEPT_RANGES, "bytes");
    if let Some(range) = range {
        responses::set_header(
            &mut response,
            header::CONTENT_RANGE,
            &range.content_range(total),
        );
    }
    Ok(response)
}

/// `POST`/`PUT`: upload a file, or create a directory (`POST` with a
/// trailing slash).
///
/// `POST` creates and fails with Conflict on an existing target unless
/// `override=true`, which also needs the modify bit. `PUT` replaces the
/// content of an existing file.
pub async fn upload(
    state: Arc<AppState>,
    req: Request<Incoming>,
    raw: &str,
) -> Result<Response<ResponseBody>, ApiError> {
    let raw = raw.to_string();
    let is_put = req.method() == hyper::Method::PUT;
    let wants_directory = !is_put && raw.ends_with('/');
    let query = ResourceQuery::from_query_string(req.uri().query());
    let inner = Arc::clone(&state);

    require_auth(&state.codec, req, move |ctx, req| async move {
        let logical = decode_path(&raw)?;
        let user = inner.resolver.load_user(&ctx)?;

        if wants_directory {
            let target = resolve_for(&user, &logical, Operation::Create)?;
            transfer::create_directory(&target.path).await?;
            info!(user_id = user.id, path = %target.logical, "Directory created");
            return Ok(responses::status_line(StatusCode::OK));
        }

        let op = if is_put {
            Operation::Modify
        } else {
            Operation::Create
        };
        let target = resolve_for(&user, &logical, op)?;

        match tokio::fs::metadata(&target.path).await {
            Ok(meta) if meta.is_dir() => {
                return Err(ApiError::conflict(format!(
                    "{} is a directory",
                    target.logical
                )));
            }
            Ok(_) if !is_put => {
                if !query.override_existing {
                    return Err(ApiError::conflict(format!(
                        "{} already exists",
                        target.logical
                    )));
                }
                resolve_for(&user, &logical, Operation::Modify)?;
            }
            Ok(_) => {}
            Err(e) if transfer::is_missing(&e) => {
                if is_put {
                    return Err(ApiError::not_found(format!("{} not found", target.logical)));
                }
            }
            Err(e) => return Err(e.into()),
        }

        let written = transfer::write_atomic(
            &target.path,
            req.into_body(),
            inner.config.files.max_upload_size,
        )
        .await?;
        info!(user_id = user.id, path = %target.logical, bytes = written, "Upload stored");
        Ok::<_, ApiError>(responses::status_line(StatusCode::OK))
    })
    .await
}

/// `DELETE`: remove a file or directory tree.
pub async fn delete(
    state: Arc<AppState>,
    req: Request<Incoming>,
    raw: &str,
) -> Result<Response<ResponseBody>, ApiError> {
    let raw = raw.to_string();
    let inner = Arc::clone(&state);

    require_auth(&state.codec, req, move |ctx, _req| async move {
        let logical = decode_path(&raw)?;
        let (_, target) = inner.resolver.resolve(&ctx, &logical, Operation::Delete)?;
        ops::delete(&target).await?;
        Ok::<_, ApiError>(responses::status_line(StatusCode::OK))
    })
    .await
}

/// `PATCH`: rename/move or copy with `?action=..&destination=..`, or a JSON
/// batch against the directory in the path when no action is given.
pub async fn patch(
    state: Arc<AppState>,
    req: Request<Incoming>,
    raw: &str,
) -> Result<Response<ResponseBody>, ApiError> {
    let raw = raw.to_string();
    let query = ResourceQuery::from_query_string(req.uri().query());
    let inner = Arc::clone(&state);

    require_auth(&state.codec, req, move |ctx, req| async move {
        let logical = decode_path(&raw)?;
        let user = inner.resolver.load_user(&ctx)?;

        let Some(action) = query.action else {
            let dir = resolve_for(&user, &logical, Operation::List)?;
            let body = responses::read_body(req.into_body(), MAX_JSON_BODY).await?;
            let request: BatchRequest = responses::parse_json(&body)?;
            let outcomes = ops::run_batch(&user, &dir.logical, &request).await;
            info!(
                user_id = user.id,
                dir = %dir.logical,
                items = outcomes.len(),
                failed = outcomes.iter().filter(|o| !o.ok).count(),
                "Batch applied"
            );
            return responses::json(StatusCode::OK, &outcomes);
        };

        let action = PatchAction::parse(&action)
            .ok_or_else(|| ApiError::validation(format!("unknown action {:?}", action)))?;
        let destination = query
            .destination
            .filter(|d| !d.is_empty())
            .ok_or_else(|| ApiError::validation("destination is required"))?;

        match action {
            PatchAction::Rename => {
                let src = resolve_for(&user, &logical, Operation::Rename)?;
                let dst = resolve_for(&user, &destination, Operation::Rename)?;
                ops::rename(&src, &dst).await?;
            }
            PatchAction::Copy => {
                let src = resolve_for(&user, &logical, Operation::Copy)?;
                let dst = resolve_for(&user, &destination, Operation::Create)?;
                ops::copy(&src, &dst).await?;
            }
        }
        Ok(responses::status_line(StatusCode::OK))
    })
    .await
}
