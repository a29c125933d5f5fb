//! Routing rules: method and path matching, redirect and rewrite targets.
//!
//! A rule carries either an exact `path` or a `pathPattern`. Patterns are made of
//! literals, the `*` wildcard and `{name}` placeholders, and are compiled when
//! the rule is deserialized, so a malformed pattern rejects the whole descriptor
//! before it reaches the resolver.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, PickFirst};

use crate::core::{GatewayError, GatewayResult};

const DEFAULT_LEVEL: i32 = 50;

/// How the invoker treats the module bound by a rule.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleType {
    #[default]
    RequestResponse,
    RequestOnly,
    Redirect,
    HeadersOnly,
    System,
}

impl RuleType {
    /// Only headers travel to the module, the body is not round-tripped.
    pub fn headers_only(&self) -> bool {
        matches!(self, RuleType::HeadersOnly | RuleType::System)
    }
}

/// Routing rule as it appears in a module descriptor.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRuleConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_pattern: Option<String>,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    #[serde(default = "RoutingRuleConfig::default_level")]
    pub level: i32,
    #[serde(default, rename = "type")]
    pub rule_type: RuleType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub desired_permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub module_permissions: Vec<String>,
}

impl RoutingRuleConfig {
    fn default_level() -> i32 {
        DEFAULT_LEVEL
    }
}

impl Default for RoutingRuleConfig {
    fn default() -> Self {
        Self {
            methods: Vec::new(),
            path: None,
            path_pattern: None,
            level: DEFAULT_LEVEL,
            rule_type: RuleType::default(),
            redirect_path: None,
            rewrite_path: None,
            required_permissions: Vec::new(),
            desired_permissions: Vec::new(),
            module_permissions: Vec::new(),
        }
    }
}

/// Path part of a rule.
#[derive(Clone, Debug)]
pub enum PathSpec {
    /// No path configured, matches every path.
    Any,
    Exact(String),
    Pattern(PathPattern),
}

impl PathSpec {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathSpec::Any => true,
            PathSpec::Exact(spec) => exact_matches(spec, path),
            PathSpec::Pattern(pattern) => pattern.matches(path),
        }
    }

    fn captures(&self, path: &str) -> BTreeMap<String, String> {
        match self {
            PathSpec::Pattern(pattern) => pattern.captures(path).unwrap_or_default(),
            _ => BTreeMap::new(),
        }
    }

    fn params(&self) -> &[String] {
        match self {
            PathSpec::Pattern(pattern) => &pattern.params,
            _ => &[],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Literal(String),
    Wildcard,
    Param(String),
}

/// Compiled `pathPattern`.
#[derive(Clone, Debug)]
pub struct PathPattern {
    source: String,
    tokens: Vec<Token>,
    params: Vec<String>,
    regex: Regex,
}

impl PathPattern {
    pub fn compile(pattern: &str) -> GatewayResult<Self> {
        let tokens = tokenize(pattern, true)
            .map_err(|e| GatewayError::Decode(format!("Invalid pathPattern {pattern}: {e}")))?;
        if tokens.is_empty() {
            return Err(GatewayError::Decode("Empty pathPattern".to_string()));
        }

        let mut params = Vec::new();
        let mut expr = String::from("^");
        for token in &tokens {
            match token {
                Token::Literal(lit) => expr.push_str(&regex::escape(lit)),
                Token::Wildcard => expr.push_str(".*"),
                Token::Param(name) => {
                    if params.contains(name) {
                        return Err(GatewayError::Decode(format!(
                            "Invalid pathPattern {pattern}: duplicate placeholder {name}"
                        )));
                    }
                    expr.push_str(&format!("(?P<{name}>[^/?#]+)"));
                    params.push(name.clone());
                }
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr)
            .map_err(|e| GatewayError::Decode(format!("Invalid pathPattern {pattern}: {e}")))?;

        Ok(Self {
            source: pattern.to_string(),
            tokens,
            params,
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, path: &str) -> bool {
        let path = strip_query(path);
        self.fast_match(path) && self.regex.is_match(path)
    }

    /// Values captured by the `{name}` placeholders.
    pub fn captures(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let path = strip_query(path);
        if !self.fast_match(path) {
            return None;
        }
        let caps = self.regex.captures(path)?;
        Some(
            self.params
                .iter()
                .filter_map(|name| {
                    caps.name(name)
                        .map(|m| (name.clone(), m.as_str().to_string()))
                })
                .collect(),
        )
    }

    /// Cheap rejection on the trailing token before the full match.
    fn fast_match(&self, path: &str) -> bool {
        match self.tokens.last() {
            Some(Token::Literal(lit)) => path.ends_with(lit.as_str()),
            Some(Token::Param(_)) => !path.is_empty() && !path.ends_with('/'),
            Some(Token::Wildcard) | None => true,
        }
    }
}

fn tokenize(input: &str, allow_wildcard: bool) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '{' => {
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some('{') | None => return Err("unbalanced {".to_string()),
                        Some(ch) => name.push(ch),
                    }
                }
                if !is_param_name(&name) {
                    return Err(format!("bad placeholder name '{name}'"));
                }
                tokens.push(Token::Param(name));
            }
            '}' => return Err("unbalanced }".to_string()),
            '*' if allow_wildcard => {
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                tokens.push(Token::Wildcard);
            }
            '.' | '\\' | '?' | '#' if allow_wildcard => {
                return Err(format!("character '{c}' not allowed"));
            }
            _ => literal.push(c),
        }
    }
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    Ok(tokens)
}

fn is_param_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Request path without its `?query` / `#fragment` suffix.
pub fn strip_query(path: &str) -> &str {
    path.find(|c| c == '?' || c == '#')
        .map_or(path, |idx| &path[..idx])
}

/// The `?query` / `#fragment` suffix of a request path, empty if none.
fn query_suffix(path: &str) -> &str {
    path.find(|c| c == '?' || c == '#')
        .map_or("", |idx| &path[idx..])
}

fn exact_matches(spec: &str, path: &str) -> bool {
    if spec.is_empty() {
        return false;
    }
    let path = strip_query(path);
    if path == spec {
        return true;
    }
    !spec.ends_with('/') && path.strip_suffix('/') == Some(spec)
}

/// Redirect or rewrite target, optionally referencing pattern placeholders.
#[derive(Clone, Debug)]
struct PathTemplate {
    tokens: Vec<Token>,
}

impl PathTemplate {
    fn parse(target: &str, params: &[String]) -> GatewayResult<Self> {
        let tokens = tokenize(target, false)
            .map_err(|e| GatewayError::Decode(format!("Invalid target path {target}: {e}")))?;
        for token in &tokens {
            if let Token::Param(name) = token {
                if !params.contains(name) {
                    return Err(GatewayError::Decode(format!(
                        "Invalid target path {target}: unknown placeholder {name}"
                    )));
                }
            }
        }
        Ok(Self { tokens })
    }

    fn render(&self, captures: &BTreeMap<String, String>) -> String {
        self.tokens
            .iter()
            .map(|token| match token {
                Token::Literal(lit) => lit.as_str(),
                Token::Param(name) => captures.get(name).map_or("", String::as_str),
                Token::Wildcard => "*",
            })
            .collect()
    }
}

/// Compiled routing rule. Immutable once built.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "RoutingRuleConfig", into = "RoutingRuleConfig")]
pub struct RoutingRule {
    config: RoutingRuleConfig,
    path_spec: PathSpec,
    redirect: Option<PathTemplate>,
    rewrite: Option<PathTemplate>,
}

impl TryFrom<RoutingRuleConfig> for RoutingRule {
    type Error = GatewayError;

    fn try_from(config: RoutingRuleConfig) -> GatewayResult<Self> {
        let path_spec = match (&config.path, &config.path_pattern) {
            (Some(_), Some(_)) => {
                return Err(GatewayError::Decode(
                    "path and pathPattern are mutually exclusive".to_string(),
                ))
            }
            (Some(path), None) => PathSpec::Exact(path.clone()),
            (None, Some(pattern)) => PathSpec::Pattern(PathPattern::compile(pattern)?),
            (None, None) => PathSpec::Any,
        };

        if config.rule_type == RuleType::Redirect && config.redirect_path.is_none() {
            return Err(GatewayError::Decode(
                "redirect rule requires redirectPath".to_string(),
            ));
        }

        let redirect = config
            .redirect_path
            .as_deref()
            .map(|target| PathTemplate::parse(target, path_spec.params()))
            .transpose()?;
        let rewrite = config
            .rewrite_path
            .as_deref()
            .map(|target| PathTemplate::parse(target, path_spec.params()))
            .transpose()?;

        Ok(Self {
            config,
            path_spec,
            redirect,
            rewrite,
        })
    }
}

impl From<RoutingRule> for RoutingRuleConfig {
    fn from(rule: RoutingRule) -> Self {
        rule.config
    }
}

impl PartialEq for RoutingRule {
    fn eq(&self, other: &Self) -> bool {
        self.config == other.config
    }
}

impl Eq for RoutingRule {}

impl RoutingRule {
    pub fn config(&self) -> &RoutingRuleConfig {
        &self.config
    }

    pub fn path_spec(&self) -> &PathSpec {
        &self.path_spec
    }

    pub fn level(&self) -> i32 {
        self.config.level
    }

    pub fn rule_type(&self) -> RuleType {
        self.config.rule_type
    }

    /// A request method of `None` always matches.
    pub fn match_method(&self, method: Option<&str>) -> bool {
        match method {
            None => true,
            Some(method) => {
                self.config.methods.is_empty()
                    || self
                        .config
                        .methods
                        .iter()
                        .any(|m| m == "*" || m.eq_ignore_ascii_case(method))
            }
        }
    }

    pub fn match_path(&self, path: &str) -> bool {
        self.path_spec.matches(path)
    }

    pub fn matches(&self, method: Option<&str>, path: &str) -> bool {
        self.match_method(method) && self.match_path(path)
    }

    /// Redirect target for a request path, with the original query and fragment.
    pub fn get_redirect_uri(&self, original_path: &str) -> Option<String> {
        self.redirect
            .as_ref()
            .map(|template| self.render_target(template, original_path))
    }

    /// Rewritten path for a request path, with the original query and fragment.
    pub fn get_rewrite_uri(&self, original_path: &str) -> Option<String> {
        self.rewrite
            .as_ref()
            .map(|template| self.render_target(template, original_path))
    }

    fn render_target(&self, template: &PathTemplate, original_path: &str) -> String {
        let captures = self.path_spec.captures(original_path);
        format!(
            "{}{}",
            template.render(&captures),
            query_suffix(original_path)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern_rule(pattern: &str) -> RoutingRule {
        RoutingRule::try_from(RoutingRuleConfig {
            path_pattern: Some(pattern.to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_placeholder_pattern() {
        let rule = pattern_rule("/a/{id}");
        for path in ["/a/b", "/a/0-9", "/a/0-9?x=1", "/a/b#frag"] {
            assert!(rule.match_path(path), "{path} should match");
        }
        for path in ["/a", "/a/", "/a/b/c", "/", ""] {
            assert!(!rule.match_path(path), "{path} should not match");
        }
    }

    #[test]
    fn test_wildcard_pattern() {
        let rule = pattern_rule("/*/a");
        assert!(rule.match_path("/b/a"));
        assert!(rule.match_path("/c/b/a"));
        assert!(!rule.match_path("/a"));
        assert!(!rule.match_path("/"));

        let trailing = pattern_rule("/x/*");
        assert!(trailing.match_path("/x/y/z"));
        assert!(!trailing.match_path("/y/x"));
    }

    #[test]
    fn test_literal_pattern_and_fast_match() {
        let rule = pattern_rule("/users/{id}/profile");
        assert!(rule.match_path("/users/42/profile"));
        assert!(!rule.match_path("/users/42/profiles"));
        assert!(!rule.match_path("/users//profile"));

        let pattern = PathPattern::compile("/users/{id}/profile").unwrap();
        let caps = pattern.captures("/users/42/profile?full=1").unwrap();
        assert_eq!(caps.get("id").map(String::as_str), Some("42"));
    }

    #[test]
    fn test_invalid_patterns() {
        for pattern in [
            "/a/b.json", "/a\\b", "/a/{id", "/a/id}", "/a?x", "/a#x", "/{}", "/{1x}", "/{a}/{a}",
            "",
        ] {
            let res = RoutingRule::try_from(RoutingRuleConfig {
                path_pattern: Some(pattern.to_string()),
                ..Default::default()
            });
            assert!(
                matches!(res, Err(GatewayError::Decode(_))),
                "{pattern} should be rejected"
            );
        }
    }

    #[test]
    fn test_exact_path() {
        let rule = RoutingRule::try_from(RoutingRuleConfig {
            path: Some("/foo".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert!(rule.match_path("/foo"));
        assert!(rule.match_path("/foo/"));
        assert!(rule.match_path("/foo?q=1"));
        assert!(!rule.match_path("/foo//"));
        assert!(!rule.match_path("/foobar"));

        let slash = PathSpec::Exact("/foo/".to_string());
        assert!(slash.matches("/foo/"));
        assert!(!slash.matches("/foo"));

        assert!(!PathSpec::Exact(String::new()).matches(""));
        assert!(PathSpec::Any.matches("/anything"));
    }

    #[test]
    fn test_path_and_pattern_exclusive() {
        let res = RoutingRule::try_from(RoutingRuleConfig {
            path: Some("/a".to_string()),
            path_pattern: Some("/a".to_string()),
            ..Default::default()
        });
        assert!(res.is_err());
    }

    #[test]
    fn test_methods() {
        let mut config = RoutingRuleConfig {
            methods: vec!["GET".to_string(), "POST".to_string()],
            ..Default::default()
        };
        let rule = RoutingRule::try_from(config.clone()).unwrap();
        assert!(rule.match_method(Some("GET")));
        assert!(rule.match_method(Some("post")));
        assert!(!rule.match_method(Some("DELETE")));
        assert!(rule.match_method(None));

        config.methods = vec!["*".to_string()];
        assert!(RoutingRule::try_from(config.clone())
            .unwrap()
            .match_method(Some("DELETE")));

        config.methods.clear();
        assert!(RoutingRule::try_from(config)
            .unwrap()
            .match_method(Some("PATCH")));
    }

    #[test]
    fn test_redirect_uri() {
        let rule = RoutingRule::try_from(RoutingRuleConfig {
            path_pattern: Some("/req/{id}".to_string()),
            rule_type: RuleType::Redirect,
            redirect_path: Some("/res/1234".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(rule.get_redirect_uri("/req/2").unwrap(), "/res/1234");
        assert_eq!(
            rule.get_redirect_uri("/req/2?a=b#c").unwrap(),
            "/res/1234?a=b#c"
        );
        assert_eq!(rule.get_redirect_uri("/req/2#top").unwrap(), "/res/1234#top");
        assert!(rule.get_rewrite_uri("/req/2").is_none());
    }

    #[test]
    fn test_templated_targets() {
        let rule = RoutingRule::try_from(RoutingRuleConfig {
            path_pattern: Some("/old/{id}/items".to_string()),
            rewrite_path: Some("/new/{id}".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(rule.get_rewrite_uri("/old/7/items?x=1").unwrap(), "/new/7?x=1");

        let res = RoutingRule::try_from(RoutingRuleConfig {
            path_pattern: Some("/old/{id}".to_string()),
            rewrite_path: Some("/new/{other}".to_string()),
            ..Default::default()
        });
        assert!(res.is_err());
    }

    #[test]
    fn test_redirect_requires_target() {
        let res = RoutingRule::try_from(RoutingRuleConfig {
            path: Some("/a".to_string()),
            rule_type: RuleType::Redirect,
            ..Default::default()
        });
        assert!(res.is_err());
    }

    #[test]
    fn test_deserialize() {
        let rule: RoutingRule = serde_json::from_str(
            r#"{"methods":["GET"],"pathPattern":"/things/{id}","level":"30","type":"headers-only"}"#,
        )
        .unwrap();
        assert_eq!(rule.level(), 30);
        assert_eq!(rule.rule_type(), RuleType::HeadersOnly);
        assert!(rule.rule_type().headers_only());
        assert!(rule.matches(Some("GET"), "/things/1"));

        let rule: RoutingRule = serde_json::from_str(r#"{"path":"/x"}"#).unwrap();
        assert_eq!(rule.level(), 50);

        let err = serde_json::from_str::<RoutingRule>(r#"{"pathPattern":"/a.b"}"#);
        assert!(err.is_err());
    }
}
