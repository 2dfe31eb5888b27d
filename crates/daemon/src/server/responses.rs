//! Response construction and request body helpers.

use std::io;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, Limited, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::{self, HeaderName, HeaderValue};
use hyper::{Response, StatusCode};
use protocol::{ApiError, ErrorKind};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Body type of every response the server produces.
pub type ResponseBody = UnsyncBoxBody<Bytes, io::Error>;

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Largest JSON request body accepted (login, signup, users, batch).
pub const MAX_JSON_BODY: usize = 1024 * 1024;

fn boxed_full(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

/// Set a header from a runtime string; values that are not valid header
/// text are dropped.
pub fn set_header(response: &mut Response<ResponseBody>, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            response.headers_mut().insert(name, value);
        }
        Err(_) => tracing::warn!(header = %name, "Dropping invalid header value"),
    }
}

pub fn full(status: StatusCode, content_type: &'static str, bytes: Bytes) -> Response<ResponseBody> {
    let mut response = Response::new(boxed_full(bytes));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

pub fn text(status: StatusCode, body: impl Into<String>) -> Response<ResponseBody> {
    full(status, TEXT_CONTENT_TYPE, Bytes::from(body.into()))
}

/// `"<code> <reason>"` as a plain-text body with that status.
pub fn status_line(status: StatusCode) -> Response<ResponseBody> {
    let line = format!(
        "{} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    text(status, line)
}

pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<ResponseBody>, ApiError> {
    let body = serde_json::to_vec(value)
        .map_err(|e| ApiError::internal(format!("failed to encode response: {}", e)))?;
    Ok(full(status, JSON_CONTENT_TYPE, Bytes::from(body)))
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    StatusCode::from_u16(kind.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// The client-facing form of an error: its status line and nothing else.
pub fn error_response(err: &ApiError) -> Response<ResponseBody> {
    text(status_for(err.kind()), err.status_line())
}

/// Wrap a byte stream as a chunked response body.
pub fn stream<S>(status: StatusCode, content_type: &str, body: S) -> Response<ResponseBody>
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    let body = StreamBody::new(body.map(|chunk| chunk.map(Frame::data))).boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    set_header(&mut response, header::CONTENT_TYPE, content_type);
    response
}

/// Collect a request body of at most `limit` bytes.
pub async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, ApiError>
where
    B: Body<Data = Bytes>,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    Limited::new(body, limit)
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| ApiError::validation(format!("unreadable request body: {}", e)))
}

/// Decode a JSON body; malformed input is a validation error.
pub fn parse_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(bytes).map_err(|e| ApiError::validation(format!("invalid JSON: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_string(response: Response<ResponseBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_error_response_hides_detail() {
        let err = ApiError::internal("disk /dev/sda1 on fire");
        let response = error_response(&err);

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_string(response).await, "500 Internal Server Error");
    }

    #[tokio::test]
    async fn test_every_kind_maps_to_its_status() {
        for (kind, code) in [
            (ErrorKind::AuthFailure, 403),
            (ErrorKind::PermissionDenied, 403),
            (ErrorKind::NotFound, 404),
            (ErrorKind::Conflict, 409),
            (ErrorKind::Validation, 400),
            (ErrorKind::Internal, 500),
        ] {
            let response = error_response(&ApiError::new(kind, "detail"));
            assert_eq!(response.status().as_u16(), code);
        }
    }

    #[tokio::test]
    async fn test_json_content_type() {
        let response = json(StatusCode::OK, &serde_json::json!({"a": 1})).unwrap();
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            JSON_CONTENT_TYPE
        );
        assert_eq!(body_string(response).await, r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_stream_body() {
        let chunks = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ]);
        let response = stream(StatusCode::OK, "text/plain", chunks);
        assert_eq!(body_string(response).await, "hello world");
    }

    #[tokio::test]
    async fn test_read_body_limit() {
        let body = Full::new(Bytes::from(vec![b'x'; 100]));
        let err = read_body(body, 10).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let body = Full::new(Bytes::from_static(b"small"));
        assert_eq!(read_body(body, 10).await.unwrap(), "small");
    }

    #[test]
    fn test_status_line_response() {
        let response = status_line(StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
