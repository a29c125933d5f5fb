use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{header, Method, Response, StatusCode};
use matchit::{Match, Router};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::form_urlencoded;

use crate::{
    config::Admin,
    core::{GatewayError, GatewayResult},
    deploy::DeployRequest,
    manager::Tenant,
    module::ModuleDescriptor,
    proxy::Gateway,
    utils::response::ResponseBuilder,
};

type Params = BTreeMap<String, String>;

#[async_trait]
trait Handler {
    async fn handle(
        &self,
        gateway: &Gateway,
        session: &mut ServerSession,
        params: Params,
    ) -> GatewayResult<Response<Vec<u8>>>;
}

/// Management API for modules, tenants, pipelines and deployments.
pub struct AdminHttpApp {
    gateway: Arc<Gateway>,
    router: Router<HashMap<Method, Box<dyn Handler + Send + Sync>>>,

    config: Admin,
}

impl AdminHttpApp {
    pub fn new(cfg: &Admin, gateway: Arc<Gateway>) -> Self {
        let mut this = Self {
            gateway,
            router: Router::new(),
            config: cfg.clone(),
        };

        this.route("/_/proxy/modules", Method::POST, Box::new(ModuleCreate))
            .route("/_/proxy/modules", Method::GET, Box::new(ModuleList))
            .route("/_/proxy/modules/{id}", Method::GET, Box::new(ModuleGet))
            .route("/_/proxy/modules/{id}", Method::DELETE, Box::new(ModuleDelete))
            .route("/_/proxy/tenants", Method::POST, Box::new(TenantCreate))
            .route("/_/proxy/tenants", Method::GET, Box::new(TenantList))
            .route("/_/proxy/tenants/{id}", Method::GET, Box::new(TenantGet))
            .route("/_/proxy/tenants/{id}", Method::DELETE, Box::new(TenantDelete))
            .route(
                "/_/proxy/tenants/{id}/modules",
                Method::POST,
                Box::new(TenantEnable),
            )
            .route(
                "/_/proxy/tenants/{id}/modules",
                Method::GET,
                Box::new(TenantModules),
            )
            .route(
                "/_/proxy/tenants/{id}/modules/{module}",
                Method::DELETE,
                Box::new(TenantDisable),
            )
            .route(
                "/_/proxy/pipeline/{tenant}",
                Method::GET,
                Box::new(PipelineGet),
            )
            .route("/_/discovery/modules", Method::GET, Box::new(DiscoveryList))
            .route("/_/discovery/modules", Method::POST, Box::new(DiscoveryDeploy))
            .route(
                "/_/discovery/modules/{srvc}",
                Method::GET,
                Box::new(DiscoveryList),
            )
            .route(
                "/_/discovery/modules/{srvc}/{inst}",
                Method::DELETE,
                Box::new(DiscoveryUndeploy),
            );

        this
    }

    fn route(
        &mut self,
        path: &str,
        method: Method,
        handler: Box<dyn Handler + Send + Sync>,
    ) -> &mut Self {
        match self.router.at_mut(path) {
            Ok(routes) => {
                routes.value.insert(method, handler);
            }
            Err(_) => {
                let mut handlers = HashMap::new();
                handlers.insert(method, handler);
                if let Err(e) = self.router.insert(path, handlers) {
                    log::error!("Failed to add admin route {path}: {e}");
                }
            }
        }
        self
    }

    pub fn admin_http_service(cfg: &Admin, gateway: Arc<Gateway>) -> Service<Self> {
        let app = Self::new(cfg, gateway);
        let addr = &app.config.address.to_string();
        let mut service = Service::new("Admin HTTP".to_string(), app);
        service.add_tcp(addr);
        service
    }

    fn authorized(&self, api_key: Option<&str>) -> bool {
        match &self.config.api_key {
            Some(expected) => api_key == Some(expected.as_str()),
            None => true,
        }
    }
}

#[async_trait]
impl ServeHttp for AdminHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);

        let api_key = http_session
            .get_header("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if !self.authorized(api_key.as_deref()) {
            return ResponseBuilder::error_http(StatusCode::FORBIDDEN, "Must provide api key");
        }

        let (path, method) = {
            let req_header = http_session.req_header();
            (req_header.uri.path().to_string(), req_header.method.clone())
        };

        match self.router.at(&path) {
            Ok(Match { value, params }) => match value.get(&method) {
                Some(handler) => {
                    let params: Params = params
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect();
                    match handler.handle(&self.gateway, http_session, params).await {
                        Ok(resp) => resp,
                        Err(e) => ResponseBuilder::from_error(&e),
                    }
                }
                None => ResponseBuilder::error_http(StatusCode::METHOD_NOT_ALLOWED, ""),
            },
            Err(_) => ResponseBuilder::error_http(StatusCode::NOT_FOUND, "Not Found"),
        }
    }
}

fn param<'a>(params: &'a Params, name: &str) -> GatewayResult<&'a str> {
    params
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| GatewayError::User(format!("Missing {name}")))
}

fn validate_content_type(http_session: &ServerSession) -> GatewayResult<()> {
    match http_session
        .get_header(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        Some(content_type) if content_type.starts_with("application/json") => Ok(()),
        _ => Err(GatewayError::User(
            "Content-Type must be application/json".to_string(),
        )),
    }
}

async fn read_request_body(http_session: &mut ServerSession) -> GatewayResult<Bytes> {
    let mut body_data = BytesMut::new();
    loop {
        match http_session.read_request_body().await {
            Ok(Some(chunk)) => body_data.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(e) => {
                return Err(GatewayError::User(format!(
                    "Failed to read request body: {e}"
                )))
            }
        }
    }
    Ok(body_data.freeze())
}

fn json_to_resource<T: DeserializeOwned>(body: &[u8]) -> GatewayResult<T> {
    serde_json::from_slice(body).map_err(|e| GatewayError::Decode(e.to_string()))
}

async fn read_json<T: DeserializeOwned>(http_session: &mut ServerSession) -> GatewayResult<T> {
    validate_content_type(http_session)?;
    let body = read_request_body(http_session).await?;
    json_to_resource(&body)
}

/// `method` and `path` of the pipeline query, percent-decoded. A path with
/// its own query string must be encoded, `&` included.
fn pipeline_query(query: Option<&str>) -> GatewayResult<(Option<String>, String)> {
    let mut method = None;
    let mut path = None;
    for (key, value) in form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
        match &*key {
            "method" if !value.is_empty() => method = Some(value.to_uppercase()),
            "path" if !value.is_empty() => path = Some(value.into_owned()),
            _ => {}
        }
    }
    let path = path.ok_or_else(|| GatewayError::User("Missing path parameter".to_string()))?;
    Ok((method, path))
}

struct ModuleCreate;

#[async_trait]
impl Handler for ModuleCreate {
    async fn handle(
        &self,
        gateway: &Gateway,
        http_session: &mut ServerSession,
        _params: Params,
    ) -> GatewayResult<Response<Vec<u8>>> {
        let md: ModuleDescriptor = read_json(http_session).await?;
        let md = gateway.modules().create(md).await?;
        Ok(ResponseBuilder::json(StatusCode::CREATED, md.as_ref()))
    }
}

struct ModuleList;

#[async_trait]
impl Handler for ModuleList {
    async fn handle(
        &self,
        gateway: &Gateway,
        _http_session: &mut ServerSession,
        _params: Params,
    ) -> GatewayResult<Response<Vec<u8>>> {
        let modules: Vec<ModuleDescriptor> = gateway
            .modules()
            .list()
            .iter()
            .map(|md| md.as_ref().clone())
            .collect();
        Ok(ResponseBuilder::success_json(&modules))
    }
}

struct ModuleGet;

#[async_trait]
impl Handler for ModuleGet {
    async fn handle(
        &self,
        gateway: &Gateway,
        _http_session: &mut ServerSession,
        params: Params,
    ) -> GatewayResult<Response<Vec<u8>>> {
        let md = gateway.modules().get(param(&params, "id")?)?;
        Ok(ResponseBuilder::success_json(md.as_ref()))
    }
}

struct ModuleDelete;

#[async_trait]
impl Handler for ModuleDelete {
    async fn handle(
        &self,
        gateway: &Gateway,
        _http_session: &mut ServerSession,
        params: Params,
    ) -> GatewayResult<Response<Vec<u8>>> {
        gateway.delete_module(param(&params, "id")?).await?;
        Ok(ResponseBuilder::no_content())
    }
}

struct TenantCreate;

#[async_trait]
impl Handler for TenantCreate {
    async fn handle(
        &self,
        gateway: &Gateway,
        http_session: &mut ServerSession,
        _params: Params,
    ) -> GatewayResult<Response<Vec<u8>>> {
        let tenant: Tenant = read_json(http_session).await?;
        let tenant = gateway.tenants().create(tenant).await?;
        Ok(ResponseBuilder::json(StatusCode::CREATED, tenant.as_ref()))
    }
}

struct TenantList;

#[async_trait]
impl Handler for TenantList {
    async fn handle(
        &self,
        gateway: &Gateway,
        _http_session: &mut ServerSession,
        _params: Params,
    ) -> GatewayResult<Response<Vec<u8>>> {
        let tenants: Vec<Tenant> = gateway
            .tenants()
            .list()
            .iter()
            .map(|t| t.as_ref().clone())
            .collect();
        Ok(ResponseBuilder::success_json(&tenants))
    }
}

struct TenantGet;

#[async_trait]
impl Handler for TenantGet {
    async fn handle(
        &self,
        gateway: &Gateway,
        _http_session: &mut ServerSession,
        params: Params,
    ) -> GatewayResult<Response<Vec<u8>>> {
        let tenant = gateway.tenants().get(param(&params, "id")?)?;
        Ok(ResponseBuilder::success_json(tenant.as_ref()))
    }
}

struct TenantDelete;

#[async_trait]
impl Handler for TenantDelete {
    async fn handle(
        &self,
        gateway: &Gateway,
        _http_session: &mut ServerSession,
        params: Params,
    ) -> GatewayResult<Response<Vec<u8>>> {
        gateway.tenants().delete(param(&params, "id")?).await?;
        Ok(ResponseBuilder::no_content())
    }
}

#[derive(Serialize, Deserialize)]
struct TenantModule {
    id: String,
}

struct TenantEnable;

#[async_trait]
impl Handler for TenantEnable {
    async fn handle(
        &self,
        gateway: &Gateway,
        http_session: &mut ServerSession,
        params: Params,
    ) -> GatewayResult<Response<Vec<u8>>> {
        let module: TenantModule = read_json(http_session).await?;
        let tenant = gateway
            .tenants()
            .enable(param(&params, "id")?, &module.id)
            .await?;
        Ok(ResponseBuilder::json(StatusCode::CREATED, tenant.as_ref()))
    }
}

struct TenantModules;

#[async_trait]
impl Handler for TenantModules {
    async fn handle(
        &self,
        gateway: &Gateway,
        _http_session: &mut ServerSession,
        params: Params,
    ) -> GatewayResult<Response<Vec<u8>>> {
        let tenant = gateway.tenants().get(param(&params, "id")?)?;
        let modules: Vec<TenantModule> = tenant
            .enabled_modules
            .iter()
            .map(|id| TenantModule { id: id.clone() })
            .collect();
        Ok(ResponseBuilder::success_json(&modules))
    }
}

struct TenantDisable;

#[async_trait]
impl Handler for TenantDisable {
    async fn handle(
        &self,
        gateway: &Gateway,
        _http_session: &mut ServerSession,
        params: Params,
    ) -> GatewayResult<Response<Vec<u8>>> {
        gateway
            .tenants()
            .disable(param(&params, "id")?, param(&params, "module")?)
            .await?;
        Ok(ResponseBuilder::no_content())
    }
}

struct PipelineGet;

#[async_trait]
impl Handler for PipelineGet {
    async fn handle(
        &self,
        gateway: &Gateway,
        http_session: &mut ServerSession,
        params: Params,
    ) -> GatewayResult<Response<Vec<u8>>> {
        let req_header = http_session.req_header();
        let (method, path) = pipeline_query(req_header.uri.query())?;
        let pipeline = gateway.resolve_pipeline(
            param(&params, "tenant")?,
            method.as_deref(),
            &path,
            &req_header.headers,
        )?;
        Ok(ResponseBuilder::success_json(pipeline.as_ref()))
    }
}

struct DiscoveryList;

#[async_trait]
impl Handler for DiscoveryList {
    async fn handle(
        &self,
        gateway: &Gateway,
        _http_session: &mut ServerSession,
        params: Params,
    ) -> GatewayResult<Response<Vec<u8>>> {
        let deployments = gateway
            .deployments_of(params.get("srvc").map(String::as_str))
            .await?;
        Ok(ResponseBuilder::success_json(&deployments))
    }
}

struct DiscoveryDeploy;

#[async_trait]
impl Handler for DiscoveryDeploy {
    async fn handle(
        &self,
        gateway: &Gateway,
        http_session: &mut ServerSession,
        _params: Params,
    ) -> GatewayResult<Response<Vec<u8>>> {
        let req: DeployRequest = read_json(http_session).await?;
        let md = gateway.deployments().deploy(req).await?;
        Ok(ResponseBuilder::json(StatusCode::CREATED, &md))
    }
}

struct DiscoveryUndeploy;

#[async_trait]
impl Handler for DiscoveryUndeploy {
    async fn handle(
        &self,
        gateway: &Gateway,
        _http_session: &mut ServerSession,
        params: Params,
    ) -> GatewayResult<Response<Vec<u8>>> {
        gateway
            .deployments()
            .undeploy(param(&params, "srvc")?, param(&params, "inst")?)
            .await?;
        Ok(ResponseBuilder::no_content())
    }
}
