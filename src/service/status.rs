use async_trait::async_trait;
use http::{Response, StatusCode};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use serde::Serialize;

use crate::{config::Status, core::status, utils::response::ResponseBuilder};

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
}

/// Liveness and readiness probes, served apart from the admin API.
///
/// `/status/ready` answers 503 until the gateway has provisioned its modules
/// and tenants.
pub struct StatusHttpApp {
    config: Status,
}

impl StatusHttpApp {
    pub fn new(cfg: &Status) -> Self {
        Self {
            config: cfg.clone(),
        }
    }

    pub fn status_http_service(cfg: &Status) -> Service<Self> {
        let app = Self::new(cfg);
        let addr = &app.config.address.to_string();
        let mut service = Service::new("Status HTTP".to_string(), app);
        service.add_tcp(addr);
        service
    }
}

#[async_trait]
impl ServeHttp for StatusHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);

        match http_session.req_header().uri.path() {
            "/status/live" => live_response(),
            "/status/ready" => ready_response(status::is_ready()),
            _ => ResponseBuilder::error_http(StatusCode::NOT_FOUND, "Not Found"),
        }
    }
}

fn live_response() -> Response<Vec<u8>> {
    ResponseBuilder::success_json(&StatusResponse {
        status: "ok",
        error: None,
    })
}

fn ready_response(ready: bool) -> Response<Vec<u8>> {
    if ready {
        live_response()
    } else {
        ResponseBuilder::json(
            StatusCode::SERVICE_UNAVAILABLE,
            &StatusResponse {
                status: "error",
                error: Some("Gateway not bootstrapped yet"),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_response() {
        let resp = ready_response(false);
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["status"], "error");

        let resp = ready_response(true);
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body().as_slice(), br#"{"status":"ok"}"#);
    }
}
