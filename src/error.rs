//! Error codes, error pages and shared response body helpers

use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use hyper::{Response, StatusCode};
use std::path::Path;
use tracing::warn;

/// Body shared by static files, FastCGI streams and proxied responses.
///
/// Unsync because the proxied `reqwest` byte stream is `Send` but not `Sync`.
/// Stream failures are carried as `io::Error` so hyper can box them for any
/// lifetime.
pub type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Header carrying the gateway error code on generated error responses
pub const X_GATEWAY_ERROR: &str = "x-gateway-error";

const BUILTIN_NOT_FOUND_PAGE: &str = "<!DOCTYPE html>\n\
<html>\n\
<head><meta charset=\"utf-8\"><title>404 Not Found</title></head>\n\
<body>\n\
<h1>404 Not Found</h1>\n\
<p>The requested page could not be found on this server.</p>\n\
</body>\n\
</html>\n";

/// Failure classes surfaced to HTTP clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorCode {
    /// Request body could not be read
    BadRequest,
    /// No site, file or route for the request
    NotFound,
    /// Denied by a proxy access rule
    Forbidden,
    /// FastCGI worker unreachable (e.g. mid-restart)
    ServiceUnavailable,
    /// Proxied backend failed or FastCGI stream broke before headers
    BadGateway,
    /// FastCGI worker did not answer in time
    GatewayTimeout,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            GatewayErrorCode::NotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::Forbidden => StatusCode::FORBIDDEN,
            GatewayErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::BadGateway => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::BadRequest => "BAD_REQUEST",
            GatewayErrorCode::NotFound => "NOT_FOUND",
            GatewayErrorCode::Forbidden => "FORBIDDEN",
            GatewayErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            GatewayErrorCode::BadGateway => "BAD_GATEWAY",
            GatewayErrorCode::GatewayTimeout => "GATEWAY_TIMEOUT",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

pub fn full_body(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_body() -> ResponseBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

/// Plain-text error response with X-Gateway-Error header
pub fn error_response(code: GatewayErrorCode, message: impl Into<String>) -> Response<ResponseBody> {
    Response::builder()
        .status(code.status_code())
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(X_GATEWAY_ERROR, code.as_header_value())
        .body(full_body(message.into()))
        .expect("valid response with StatusCode enum and static headers")
}

/// The generic not-found page, read from `error_page` or built in.
///
/// Site denials and unresolved paths use 200 here, proxy denials use 403.
pub fn not_found_page(error_page: &Path, status: StatusCode) -> Response<ResponseBody> {
    let page = match std::fs::read(error_page) {
        Ok(content) => Bytes::from(content),
        Err(e) => {
            warn!(path = %error_page.display(), error = %e, "Error page unavailable, using built-in page");
            Bytes::from_static(BUILTIN_NOT_FOUND_PAGE.as_bytes())
        }
    };

    let mut builder = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/html; charset=utf-8");
    if !status.is_success() {
        let code = if status == StatusCode::FORBIDDEN {
            GatewayErrorCode::Forbidden
        } else {
            GatewayErrorCode::NotFound
        };
        builder = builder.header(X_GATEWAY_ERROR, code.as_header_value());
    }

    builder
        .body(full_body(page))
        .expect("valid response with StatusCode enum and static headers")
}

/// Redirect with a Location taken from config or the request
pub fn redirect_response(status: StatusCode, location: &str) -> Response<ResponseBody> {
    let Ok(value) = HeaderValue::from_str(location) else {
        warn!(location, "Redirect target is not a valid header value");
        return error_response(GatewayErrorCode::InternalError, "Invalid redirect target");
    };

    Response::builder()
        .status(status)
        .header(LOCATION, value)
        .body(empty_body())
        .expect("valid response with StatusCode enum and checked Location")
}

/// 301 to the HTTPS form of the request (port omitted when it is 443)
pub fn https_redirect(host: &str, https_port: u16, path_and_query: &str) -> Response<ResponseBody> {
    let location = if https_port == 443 {
        format!("https://{}{}", host, path_and_query)
    } else {
        format!("https://{}:{}{}", host, https_port, path_and_query)
    };
    redirect_response(StatusCode::MOVED_PERMANENTLY, &location)
}
