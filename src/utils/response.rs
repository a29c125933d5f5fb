//! Response helpers for the admin and status HTTP apps.

use http::{header, HeaderValue, Response, StatusCode};
use serde::Serialize;

use crate::core::GatewayError;

/// Standard content types
pub mod content_type {
    pub const TEXT_PLAIN: &str = "text/plain";
    pub const APPLICATION_JSON: &str = "application/json";
}

pub struct ResponseBuilder;

impl ResponseBuilder {
    pub fn success_http(body: Vec<u8>, content_type: Option<&str>) -> Response<Vec<u8>> {
        Self::with_status(StatusCode::OK, body, content_type)
    }

    pub fn with_status(
        status: StatusCode,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Response<Vec<u8>> {
        let mut builder = Response::builder().status(status);

        if let Some(ct) = content_type {
            match HeaderValue::from_str(ct) {
                Ok(header_value) => {
                    builder = builder.header(header::CONTENT_TYPE, header_value);
                }
                Err(e) => {
                    log::error!("Invalid content type '{}': {}", ct, e);
                }
            }
        }

        builder.body(body).unwrap_or_else(|e| {
            log::error!("Failed to build response: {}", e);
            Self::error_http(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        })
    }

    pub fn error_http(status: StatusCode, message: &str) -> Response<Vec<u8>> {
        let mut resp = Response::new(message.as_bytes().to_vec());
        *resp.status_mut() = status;
        resp.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(content_type::TEXT_PLAIN),
        );
        resp
    }

    /// Maps the error kind onto its status code, with the cause as body.
    pub fn from_error(err: &GatewayError) -> Response<Vec<u8>> {
        let status = err.kind().status_code();
        if status.is_server_error() {
            log::error!("Admin request failed: {err}");
        }
        Self::error_http(status, &err.to_string())
    }

    pub fn success_json<T: Serialize>(data: &T) -> Response<Vec<u8>> {
        Self::json(StatusCode::OK, data)
    }

    pub fn json<T: Serialize>(status: StatusCode, data: &T) -> Response<Vec<u8>> {
        match serde_json::to_vec(data) {
            Ok(json_body) => Self::with_status(status, json_body, Some(content_type::APPLICATION_JSON)),
            Err(e) => {
                log::error!("Failed to serialize JSON response: {}", e);
                Self::error_http(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "JSON serialization failed",
                )
            }
        }
    }

    pub fn no_content() -> Response<Vec<u8>> {
        Self::with_status(StatusCode::NO_CONTENT, Vec::new(), None)
    }
}
