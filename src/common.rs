use crate::error::ProxyError;
use crate::pages::{HTML_CONTENT_TYPE, PAC_CONTENT_TYPE};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Response, StatusCode};

/// Body type of every response the listener writes.
pub type ProxyBody = UnsyncBoxBody<Bytes, ProxyError>;

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Common response builder utilities
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Generic 502. Internal error text stays in the logs.
    pub fn bad_gateway() -> Response<ProxyBody> {
        Self::error(StatusCode::BAD_GATEWAY, "Bad Gateway")
    }

    pub fn bad_request() -> Response<ProxyBody> {
        Self::error(StatusCode::BAD_REQUEST, "Bad Request")
    }

    pub fn not_found() -> Response<ProxyBody> {
        Self::error(StatusCode::NOT_FOUND, "Not Found")
    }

    /// Maps a failed proxy request onto the response the client sees.
    pub fn from_error(error: &ProxyError) -> Response<ProxyBody> {
        match error.status_code() {
            StatusCode::BAD_REQUEST => Self::bad_request(),
            _ => Self::bad_gateway(),
        }
    }

    pub fn html(content: &str) -> Response<ProxyBody> {
        Self::with_content_type(HTML_CONTENT_TYPE, content)
    }

    pub fn pac(content: &str) -> Response<ProxyBody> {
        Self::with_content_type(PAC_CONTENT_TYPE, content)
    }

    fn with_content_type(content_type: &'static str, content: &str) -> Response<ProxyBody> {
        let mut response = Response::new(full(content.to_string()));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        response
    }

    /// Creates a plain-text response with custom status and message
    pub fn error(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
        let mut response = Response::new(full(message));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        response
    }
}
