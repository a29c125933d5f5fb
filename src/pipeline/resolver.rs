use std::sync::Arc;

use http::HeaderMap;
use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};

use crate::{
    core::{GatewayError, GatewayResult},
    module::{routing::strip_query, ModuleDescriptor, RoutingRule, RuleType},
};

use super::{ModuleInstance, ModulePermissions, Pipeline, StageKind};

static RESOLUTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pipeline_resolutions_total",
        "Pipeline resolutions by outcome",
        &["outcome"]
    )
    .unwrap()
});

#[derive(Clone, Debug)]
pub struct ResolverOptions {
    /// Redirect hops followed before giving up.
    pub max_redirects: usize,
    /// Incoming header carrying a JSON map of module id to permissions.
    pub permissions_header: String,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            max_redirects: 5,
            permissions_header: "x-gateway-module-permissions".to_string(),
        }
    }
}

struct Candidate<'a> {
    module: &'a Arc<ModuleDescriptor>,
    rule: &'a RoutingRule,
    kind: StageKind,
}

/// Builds module pipelines from the modules enabled for a tenant.
#[derive(Clone, Debug, Default)]
pub struct PipelineResolver {
    options: ResolverOptions,
}

impl PipelineResolver {
    pub fn new(options: ResolverOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    /// Resolves the pipeline for a request against `modules`, given in the
    /// tenant's enablement order.
    pub fn resolve(
        &self,
        modules: &[Arc<ModuleDescriptor>],
        method: Option<&str>,
        path: &str,
        headers: &HeaderMap,
    ) -> GatewayResult<Pipeline> {
        let result = self.resolve_inner(modules, method, path, headers);
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind().as_str(),
        };
        RESOLUTIONS.with_label_values(&[outcome]).inc();
        result
    }

    fn resolve_inner(
        &self,
        modules: &[Arc<ModuleDescriptor>],
        method: Option<&str>,
        path: &str,
        headers: &HeaderMap,
    ) -> GatewayResult<Pipeline> {
        let mut permissions = self.incoming_permissions(headers)?;

        let satisfied: Vec<bool> = modules
            .iter()
            .map(|module| requirements_satisfied(module, modules))
            .collect();

        let mut current = path.to_string();
        let mut redirects: Vec<String> = Vec::new();

        loop {
            let mut candidates = collect_candidates(modules, &satisfied, method, &current);
            // stable: equal levels keep declaration order
            candidates.sort_by_key(|c| c.rule.level());

            let redirect = candidates
                .iter()
                .find(|c| c.rule.rule_type() == RuleType::Redirect);
            if let Some(candidate) = redirect {
                let target = candidate.rule.get_redirect_uri(&current).ok_or_else(|| {
                    GatewayError::Internal(format!(
                        "Redirect rule of {} has no target",
                        candidate.module.id
                    ))
                })?;
                self.check_redirect(path, &redirects, &target)?;
                log::debug!(
                    "Module {} redirects {} to {}",
                    candidate.module.id,
                    current,
                    target
                );
                redirects.push(target.clone());
                current = target;
                continue;
            }

            let stages: Vec<ModuleInstance> = candidates
                .into_iter()
                .map(|c| ModuleInstance {
                    module: c.module.clone(),
                    module_id: c.module.id.clone(),
                    rule: c.rule.clone(),
                    kind: c.kind,
                    path: c
                        .rule
                        .get_rewrite_uri(&current)
                        .unwrap_or_else(|| current.clone()),
                    method: method.map(str::to_string),
                    headers_only: c.rule.rule_type().headers_only(),
                })
                .collect();

            if !stages.iter().any(ModuleInstance::is_handler) {
                return Err(if redirects.is_empty() {
                    GatewayError::NotFound(format!(
                        "No suitable module found for path {}",
                        strip_query(&current)
                    ))
                } else {
                    GatewayError::NotFound(format!(
                        "Redirect target {} not found",
                        strip_query(&current)
                    ))
                });
            }

            for stage in &stages {
                let granted = &stage.rule.config().module_permissions;
                if !granted.is_empty() {
                    let entry = permissions.entry(stage.module_id.clone()).or_default();
                    for perm in granted {
                        if !entry.contains(perm) {
                            entry.push(perm.clone());
                        }
                    }
                }
            }

            log::debug!(
                "Resolved {} {} to [{}]",
                method.unwrap_or("*"),
                path,
                stages
                    .iter()
                    .map(|s| s.module_id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );

            return Ok(Pipeline::new(stages, redirects, permissions));
        }
    }

    fn check_redirect(&self, origin: &str, redirects: &[String], target: &str) -> GatewayResult<()> {
        if redirects.len() >= self.options.max_redirects {
            return Err(GatewayError::Internal(format!(
                "Too many redirects for {}",
                strip_query(origin)
            )));
        }
        let target_path = strip_query(target);
        let seen = std::iter::once(origin)
            .chain(redirects.iter().map(String::as_str))
            .any(|p| strip_query(p) == target_path);
        if seen {
            return Err(GatewayError::Internal(format!(
                "Redirect loop: {} -> {}",
                strip_query(origin),
                target_path
            )));
        }
        Ok(())
    }

    fn incoming_permissions(&self, headers: &HeaderMap) -> GatewayResult<ModulePermissions> {
        let Some(value) = headers.get(self.options.permissions_header.as_str()) else {
            return Ok(ModulePermissions::new());
        };
        let value = value.to_str().map_err(|_| {
            GatewayError::User(format!(
                "Invalid {} header",
                self.options.permissions_header
            ))
        })?;
        serde_json::from_str(value).map_err(|e| {
            GatewayError::User(format!(
                "Invalid {} header: {e}",
                self.options.permissions_header
            ))
        })
    }
}

/// Every required interface of `module` is provided, compatibly, by another module.
fn requirements_satisfied(module: &ModuleDescriptor, modules: &[Arc<ModuleDescriptor>]) -> bool {
    module.requires.iter().all(|required| {
        modules
            .iter()
            .filter(|other| other.id != module.id)
            .any(|other| other.provides.iter().any(|p| p.is_compatible(required)))
    })
}

fn collect_candidates<'a>(
    modules: &'a [Arc<ModuleDescriptor>],
    satisfied: &[bool],
    method: Option<&str>,
    path: &str,
) -> Vec<Candidate<'a>> {
    let mut candidates = Vec::new();
    for (module, &satisfied) in modules.iter().zip(satisfied) {
        for rule in &module.filters {
            if rule.matches(method, path) {
                candidates.push(Candidate {
                    module,
                    rule,
                    kind: StageKind::Filter,
                });
            }
        }

        if !satisfied {
            log::debug!("Skipping handlers of {}: requirements not met", module.id);
            continue;
        }
        for iface in &module.provides {
            for rule in &iface.handlers {
                if rule.matches(method, path) {
                    candidates.push(Candidate {
                        module,
                        rule,
                        kind: StageKind::Handler,
                    });
                }
            }
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;
    use crate::module::{InterfaceDescriptor, RoutingRuleConfig};

    fn rule(methods: &[&str], pattern: &str, level: i32) -> RoutingRule {
        RoutingRule::try_from(RoutingRuleConfig {
            methods: methods.iter().map(|m| m.to_string()).collect(),
            path_pattern: Some(pattern.to_string()),
            level,
            ..Default::default()
        })
        .unwrap()
    }

    fn handler_module(id: &str, iface: &str, version: &str, rules: Vec<RoutingRule>) -> ModuleDescriptor {
        let mut md = ModuleDescriptor::new(id);
        let mut provided = InterfaceDescriptor::new(iface, version.parse().unwrap());
        provided.handlers = rules;
        md.provides.push(provided);
        md
    }

    fn filter_module(id: &str, rules: Vec<RoutingRule>) -> ModuleDescriptor {
        let mut md = ModuleDescriptor::new(id);
        md.filters = rules;
        md
    }

    fn ids(pipeline: &Pipeline) -> Vec<String> {
        pipeline.stages().iter().map(|s| s.module_id.clone()).collect()
    }

    fn modules(mds: Vec<ModuleDescriptor>) -> Vec<Arc<ModuleDescriptor>> {
        mds.into_iter().map(Arc::new).collect()
    }

    #[test]
    fn test_filter_and_handler_ordering() {
        let mods = modules(vec![
            handler_module("a-1.0.0", "x", "1.2", vec![rule(&["GET"], "/foo", 20)]),
            filter_module("b-1.0.0", vec![rule(&["*"], "/*", 10)]),
        ]);
        let resolver = PipelineResolver::default();

        let pipeline = resolver
            .resolve(&mods, Some("GET"), "/foo", &HeaderMap::new())
            .unwrap();
        assert_eq!(ids(&pipeline), ["b-1.0.0", "a-1.0.0"]);
        assert_eq!(pipeline.stages()[0].kind, StageKind::Filter);
        assert_eq!(pipeline.stages()[1].kind, StageKind::Handler);

        let err = resolver
            .resolve(&mods, Some("GET"), "/bar", &HeaderMap::new())
            .unwrap_err();
        assert!(err.is_not_found());

        let err = resolver
            .resolve(&mods, Some("POST"), "/foo", &HeaderMap::new())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_levels_frame_handlers_and_ties_keep_order() {
        let mods = modules(vec![
            filter_module(
                "auth-1.0.0",
                vec![rule(&["*"], "/*", 10), rule(&["*"], "/*", 90)],
            ),
            handler_module("a-1.0.0", "x", "1.0", vec![rule(&["GET"], "/items", 50)]),
            filter_module("log-1.0.0", vec![rule(&["*"], "/*", 50)]),
        ]);
        let pipeline = PipelineResolver::default()
            .resolve(&mods, Some("GET"), "/items", &HeaderMap::new())
            .unwrap();
        assert_eq!(
            ids(&pipeline),
            ["auth-1.0.0", "a-1.0.0", "log-1.0.0", "auth-1.0.0"]
        );
    }

    #[test]
    fn test_unsatisfied_requirements_exclude_handlers_only() {
        let mut needy = handler_module("needy-1.0.0", "y", "1.0", vec![rule(&["GET"], "/y", 30)]);
        needy.filters.push(rule(&["*"], "/*", 5));
        needy
            .requires
            .push(InterfaceDescriptor::new("x", "2.0".parse().unwrap()));

        let provider = handler_module("a-1.0.0", "x", "1.5", vec![rule(&["GET"], "/x", 30)]);
        let resolver = PipelineResolver::default();

        // x 1.5 does not satisfy x 2.0
        let mods = modules(vec![needy.clone(), provider]);
        assert!(resolver
            .resolve(&mods, Some("GET"), "/y", &HeaderMap::new())
            .is_err());
        let pipeline = resolver
            .resolve(&mods, Some("GET"), "/x", &HeaderMap::new())
            .unwrap();
        assert_eq!(ids(&pipeline), ["needy-1.0.0", "a-1.0.0"]);

        let provider = handler_module("a-2.1.0", "x", "2.1", vec![]);
        let mods = modules(vec![needy, provider]);
        let pipeline = resolver
            .resolve(&mods, Some("GET"), "/y", &HeaderMap::new())
            .unwrap();
        assert_eq!(ids(&pipeline), ["needy-1.0.0", "needy-1.0.0"]);
    }

    #[test]
    fn test_redirect_is_reprocessed() {
        let redirect = RoutingRule::try_from(RoutingRuleConfig {
            methods: vec!["GET".to_string()],
            path_pattern: Some("/old/{id}".to_string()),
            level: 20,
            rule_type: RuleType::Redirect,
            redirect_path: Some("/new/{id}".to_string()),
            ..Default::default()
        })
        .unwrap();
        let mods = modules(vec![
            handler_module("r-1.0.0", "r", "1.0", vec![redirect]),
            handler_module("n-1.0.0", "n", "1.0", vec![rule(&["GET"], "/new/{id}", 30)]),
        ]);

        let pipeline = PipelineResolver::default()
            .resolve(&mods, Some("GET"), "/old/5?x=1", &HeaderMap::new())
            .unwrap();
        assert_eq!(ids(&pipeline), ["n-1.0.0"]);
        assert_eq!(pipeline.redirects(), ["/new/5?x=1"]);
        assert_eq!(pipeline.stages()[0].path, "/new/5?x=1");
    }

    #[test]
    fn test_redirect_loop_and_missing_target() {
        let redirect = |from: &str, to: &str| {
            RoutingRule::try_from(RoutingRuleConfig {
                path: Some(from.to_string()),
                rule_type: RuleType::Redirect,
                redirect_path: Some(to.to_string()),
                ..Default::default()
            })
            .unwrap()
        };
        let resolver = PipelineResolver::default();

        let mods = modules(vec![handler_module(
            "r-1.0.0",
            "r",
            "1.0",
            vec![redirect("/a", "/b"), redirect("/b", "/a")],
        )]);
        let err = resolver
            .resolve(&mods, Some("GET"), "/a", &HeaderMap::new())
            .unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));

        let chain: Vec<RoutingRule> = (0..10)
            .map(|i| redirect(&format!("/h{i}"), &format!("/h{}", i + 1)))
            .collect();
        let mods = modules(vec![handler_module("r-1.0.0", "r", "1.0", chain)]);
        let err = resolver
            .resolve(&mods, Some("GET"), "/h0", &HeaderMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("Too many redirects"));

        let mods = modules(vec![handler_module(
            "r-1.0.0",
            "r",
            "1.0",
            vec![redirect("/a", "/nowhere")],
        )]);
        let err = resolver
            .resolve(&mods, Some("GET"), "/a", &HeaderMap::new())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_rewrite_and_headers_only() {
        let rewrite = RoutingRule::try_from(RoutingRuleConfig {
            path_pattern: Some("/v1/{rest}".to_string()),
            rewrite_path: Some("/{rest}".to_string()),
            rule_type: RuleType::HeadersOnly,
            ..Default::default()
        })
        .unwrap();
        let mods = modules(vec![handler_module("a-1.0.0", "a", "1.0", vec![rewrite])]);
        let pipeline = PipelineResolver::default()
            .resolve(&mods, None, "/v1/things", &HeaderMap::new())
            .unwrap();
        assert_eq!(pipeline.stages()[0].path, "/things");
        assert!(pipeline.stages()[0].headers_only);
        assert_eq!(pipeline.stages()[0].method, None);
    }

    #[test]
    fn test_module_permissions() {
        let granting = RoutingRule::try_from(RoutingRuleConfig {
            path: Some("/p".to_string()),
            module_permissions: vec!["users.read".to_string()],
            ..Default::default()
        })
        .unwrap();
        let mods = modules(vec![handler_module("a-1.0.0", "a", "1.0", vec![granting])]);
        let resolver = PipelineResolver::default();

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-gateway-module-permissions",
            HeaderValue::from_static(r#"{"b-1.0.0": ["b.write"]}"#),
        );
        let pipeline = resolver.resolve(&mods, Some("GET"), "/p", &headers).unwrap();
        assert_eq!(pipeline.module_permissions().len(), 2);
        assert_eq!(
            pipeline.module_permissions_header(),
            r#"{"a-1.0.0":["users.read"],"b-1.0.0":["b.write"]}"#
        );

        headers.insert(
            "x-gateway-module-permissions",
            HeaderValue::from_static("not json"),
        );
        let err = resolver.resolve(&mods, Some("GET"), "/p", &headers).unwrap_err();
        assert_eq!(err.kind(), crate::core::ErrorKind::User);
    }

    #[test]
    fn test_cursor_stop() {
        let mods = modules(vec![
            filter_module("f-1.0.0", vec![rule(&["*"], "/*", 10)]),
            handler_module("a-1.0.0", "a", "1.0", vec![rule(&["GET"], "/a", 20)]),
            filter_module("g-1.0.0", vec![rule(&["*"], "/*", 90)]),
        ]);
        let pipeline = PipelineResolver::default()
            .resolve(&mods, Some("GET"), "/a", &HeaderMap::new())
            .unwrap();

        let mut cursor = pipeline.cursor();
        let first = cursor.next().unwrap();
        assert_eq!(first.module_id, "f-1.0.0");

        let mut response = HeaderMap::new();
        response.insert("x-gateway-stop", HeaderValue::from_static("true"));
        cursor.observe(&response, "x-gateway-stop");
        assert!(cursor.is_stopped());
        assert!(cursor.next().is_none());
        assert_eq!(cursor.skipped().len(), 2);

        let visited: Vec<_> = pipeline.cursor().map(|s| s.module_id.as_str()).collect();
        assert_eq!(visited, ["f-1.0.0", "a-1.0.0", "g-1.0.0"]);
    }
}
