//! Error types and canned error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Body type used for every response the proxy produces
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Static page served for unknown hosts and TLS policy rejections
pub const NOT_FOUND_PAGE: &str = include_str!("../assets/404.html");

/// Connection-level failures. Returning one of these from the request
/// service makes hyper close the connection without writing a response.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("upgrade for host '{0}' dropped")]
    UpgradeDropped(String),
}

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Backend refused the protocol upgrade
    UpgradeRejected,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::UpgradeRejected => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::UpgradeRejected => "UPGRADE_REJECTED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

pub fn full_body(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(error.to_json()))
        .expect("valid response with StatusCode enum and static headers")
}

/// 404 with the static not-found page
pub fn not_found_response() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(full_body(NOT_FOUND_PAGE))
        .expect("valid response with static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::MissingHostHeader.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::UpgradeRejected.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::ConnectionFailed, "Backend unreachable");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"CONNECTION_FAILED\""));
        assert!(json.contains("\"message\":\"Backend unreachable\""));
        assert!(json.contains("\"status\":502"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::MissingHostHeader, "no host");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "MISSING_HOST_HEADER"
        );
    }

    #[test]
    fn test_not_found_response() {
        let response = not_found_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(NOT_FOUND_PAGE.contains("404"));
    }
}
