//! CORS middleware.
//!
//! Classifies requests as preflight, simple or actual CORS requests.
//! Preflights are answered directly with 204 and the Allow-* headers;
//! simple/actual requests are validated on the way in and get
//! `Access-Control-Allow-Origin` / `-Expose-Headers` stamped on the way
//! out. No matching rule or origin denies with 403.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{glob_match, Middleware, MiddlewareConfig, MiddlewareContext, MiddlewareResult};

/// How an allowed origin is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginPatternType {
    Exact,
    /// Glob, e.g. `https://*.example.com`.
    Wildcard,
    Regex,
}

/// One allowed origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedOrigin {
    pub origin: String,
    pub pattern_type: OriginPatternType,
}

impl AllowedOrigin {
    #[must_use]
    pub fn exact(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            pattern_type: OriginPatternType::Exact,
        }
    }

    #[must_use]
    pub fn wildcard(pattern: impl Into<String>) -> Self {
        Self {
            origin: pattern.into(),
            pattern_type: OriginPatternType::Wildcard,
        }
    }

    #[must_use]
    pub fn regex(pattern: impl Into<String>) -> Self {
        Self {
            origin: pattern.into(),
            pattern_type: OriginPatternType::Regex,
        }
    }

    #[must_use]
    pub fn matches(&self, origin: &str) -> bool {
        match self.pattern_type {
            OriginPatternType::Exact => self.origin == origin || self.origin == "*",
            OriginPatternType::Wildcard => glob_match(&self.origin, origin),
            OriginPatternType::Regex => Regex::new(&self.origin)
                .map(|re| re.is_match(origin))
                .unwrap_or(false),
        }
    }
}

/// One CORS rule, matched against the request path by glob and priority.
#[derive(Debug, Clone)]
pub struct CorsRule {
    pub rule_id: String,
    pub path_pattern: String,
    pub allowed_origins: Vec<AllowedOrigin>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub allow_credentials: bool,
    /// Preflight cache lifetime in seconds.
    pub max_age: u64,
    pub priority: i32,
    pub enabled: bool,
}

impl CorsRule {
    #[must_use]
    pub fn new(rule_id: impl Into<String>, path_pattern: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            path_pattern: path_pattern.into(),
            allowed_origins: Vec::new(),
            allowed_methods: vec!["GET".into(), "POST".into()],
            allowed_headers: vec!["Content-Type".into()],
            exposed_headers: Vec::new(),
            allow_credentials: false,
            max_age: 600,
            priority: 0,
            enabled: true,
        }
    }

    #[must_use]
    pub fn with_origins(mut self, origins: Vec<AllowedOrigin>) -> Self {
        self.allowed_origins = origins;
        self
    }

    #[must_use]
    pub fn with_methods(mut self, methods: Vec<String>) -> Self {
        self.allowed_methods = methods;
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Vec<String>) -> Self {
        self.allowed_headers = headers;
        self
    }

    #[must_use]
    pub fn with_exposed_headers(mut self, headers: Vec<String>) -> Self {
        self.exposed_headers = headers;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, allow: bool) -> Self {
        self.allow_credentials = allow;
        self
    }

    fn allows_origin(&self, origin: &str) -> bool {
        self.allowed_origins
            .iter()
            .any(|allowed| allowed.matches(origin))
    }

    fn allows_method(&self, method: &str) -> bool {
        self.allowed_methods
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(method))
    }

    fn allows_header(&self, header: &str) -> bool {
        self.allowed_headers
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(header))
    }
}

/// Request classification per the CORS protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorsRequestKind {
    /// No Origin header; CORS does not apply.
    NotCors,
    /// OPTIONS probe carrying `Access-Control-Request-Method`.
    Preflight,
    /// Safe method with only simple headers.
    Simple,
    /// Cross-origin request that needs response headers.
    Actual,
}

const SIMPLE_CONTENT_TYPES: [&str; 3] = [
    "application/x-www-form-urlencoded",
    "multipart/form-data",
    "text/plain",
];

/// Classify a request. Exposed for reuse in tests and transports.
#[must_use]
pub fn classify(ctx: &MiddlewareContext) -> CorsRequestKind {
    let request = &ctx.request;
    if request.header("origin").is_none() {
        return CorsRequestKind::NotCors;
    }
    if request.method.eq_ignore_ascii_case("OPTIONS")
        && request.header("access-control-request-method").is_some()
    {
        return CorsRequestKind::Preflight;
    }

    let safe_method = matches!(
        request.method.to_ascii_uppercase().as_str(),
        "GET" | "HEAD" | "OPTIONS"
    );
    let simple_content_type = request.header("content-type").is_none_or(|value| {
        SIMPLE_CONTENT_TYPES
            .iter()
            .any(|simple| value.to_ascii_lowercase().starts_with(simple))
    });
    if safe_method && simple_content_type {
        CorsRequestKind::Simple
    } else {
        CorsRequestKind::Actual
    }
}

/// CORS middleware behavior options.
#[derive(Debug, Clone, Default)]
pub struct CorsSettings {
    /// Deny ambiguous requests (e.g. multiple rules disagreeing) outright.
    pub strict: bool,
}

/// Origin validation and preflight handling.
pub struct CorsMiddleware {
    config: MiddlewareConfig,
    settings: CorsSettings,
    rules: parking_lot::RwLock<Vec<CorsRule>>,
}

impl CorsMiddleware {
    #[must_use]
    pub fn new(config: MiddlewareConfig, settings: CorsSettings) -> Self {
        Self {
            config,
            settings,
            rules: parking_lot::RwLock::new(Vec::new()),
        }
    }

    pub fn add_rule(&self, rule: CorsRule) {
        self.rules.write().push(rule);
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|rule| rule.rule_id != rule_id);
        before != rules.len()
    }

    fn matching_rule(&self, path: &str) -> Option<CorsRule> {
        self.rules
            .read()
            .iter()
            .filter(|rule| rule.enabled && glob_match(&rule.path_pattern, path))
            .max_by_key(|rule| rule.priority)
            .cloned()
    }

    fn deny(reason: &str) -> MiddlewareResult {
        MiddlewareResult::stop(
            403,
            format!(r#"{{"error": "CORS request denied", "reason": "{reason}"}}"#),
        )
    }

    fn preflight_response(rule: &CorsRule, origin: &str) -> MiddlewareResult {
        let mut result = MiddlewareResult::stop(204, "")
            .with_header("Access-Control-Allow-Origin", origin)
            .with_header(
                "Access-Control-Allow-Methods",
                rule.allowed_methods.join(", "),
            )
            .with_header(
                "Access-Control-Allow-Headers",
                rule.allowed_headers.join(", "),
            )
            .with_header("Access-Control-Max-Age", rule.max_age.to_string());
        if rule.allow_credentials {
            result = result.with_header("Access-Control-Allow-Credentials", "true");
        }
        result
    }
}

#[async_trait]
impl Middleware for CorsMiddleware {
    fn config(&self) -> &MiddlewareConfig {
        &self.config
    }

    async fn process_request(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> anyhow::Result<MiddlewareResult> {
        let kind = classify(ctx);
        if kind == CorsRequestKind::NotCors {
            return Ok(MiddlewareResult::success());
        }
        let origin = ctx
            .request
            .header("origin")
            .unwrap_or_default()
            .to_string();

        let Some(rule) = self.matching_rule(&ctx.request.path) else {
            // default effect on no matching rule is deny
            return Ok(Self::deny("no cors rule for path"));
        };
        if !rule.allows_origin(&origin) {
            debug!(origin = %origin, rule = %rule.rule_id, "origin not allowed");
            return Ok(Self::deny("origin not allowed"));
        }

        match kind {
            CorsRequestKind::Preflight => {
                let requested_method = ctx
                    .request
                    .header("access-control-request-method")
                    .unwrap_or_default()
                    .to_string();
                if !rule.allows_method(&requested_method) {
                    return Ok(Self::deny("method not allowed"));
                }
                if let Some(requested_headers) = ctx.request.header("access-control-request-headers")
                {
                    for header in requested_headers.split(',') {
                        let header = header.trim();
                        if !header.is_empty() && !rule.allows_header(header) {
                            return Ok(Self::deny("header not allowed"));
                        }
                    }
                }
                ctx.set_data("cors_preflight", serde_json::json!(true));
                Ok(Self::preflight_response(&rule, &origin))
            }
            CorsRequestKind::Simple | CorsRequestKind::Actual => {
                if kind == CorsRequestKind::Actual
                    && self.settings.strict
                    && !rule.allows_method(&ctx.request.method)
                {
                    return Ok(Self::deny("method not allowed"));
                }
                ctx.set_data("cors_origin", serde_json::json!(origin));
                ctx.set_data("cors_rule", serde_json::json!(rule.rule_id));
                Ok(MiddlewareResult::success())
            }
            CorsRequestKind::NotCors => Ok(MiddlewareResult::success()),
        }
    }

    async fn process_response(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> anyhow::Result<MiddlewareResult> {
        let Some(origin) = ctx.data_as::<String>("cors_origin") else {
            return Ok(MiddlewareResult::success());
        };
        let rule = ctx
            .data_as::<String>("cors_rule")
            .and_then(|rule_id| self.rule_by_id(&rule_id));
        let Some(response) = ctx.response.as_mut() else {
            return Ok(MiddlewareResult::success());
        };

        response.set_header("Access-Control-Allow-Origin", origin);
        if let Some(rule) = rule {
            if !rule.exposed_headers.is_empty() {
                response.set_header(
                    "Access-Control-Expose-Headers",
                    rule.exposed_headers.join(", "),
                );
            }
            if rule.allow_credentials {
                response.set_header("Access-Control-Allow-Credentials", "true");
            }
        }
        Ok(MiddlewareResult::success())
    }
}

impl CorsMiddleware {
    fn rule_by_id(&self, rule_id: &str) -> Option<CorsRule> {
        self.rules
            .read()
            .iter()
            .find(|rule| rule.rule_id == rule_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{MiddlewareRequest, MiddlewareType};

    fn example_rule() -> CorsRule {
        CorsRule::new("api", "/api/*")
            .with_origins(vec![AllowedOrigin::exact("https://example.com")])
            .with_methods(vec!["GET".into(), "POST".into()])
            .with_headers(vec!["Content-Type".into(), "Authorization".into()])
            .with_exposed_headers(vec!["X-Request-Id".into()])
    }

    fn middleware_with(rule: CorsRule) -> CorsMiddleware {
        let mw = CorsMiddleware::new(
            MiddlewareConfig::new("cors", MiddlewareType::Cors),
            CorsSettings::default(),
        );
        mw.add_rule(rule);
        mw
    }

    #[test]
    fn origin_pattern_types_match() {
        assert!(AllowedOrigin::exact("https://example.com").matches("https://example.com"));
        assert!(!AllowedOrigin::exact("https://example.com").matches("https://evil.com"));
        assert!(AllowedOrigin::exact("*").matches("https://anything.dev"));

        let wildcard = AllowedOrigin::wildcard("https://*.example.com");
        assert!(wildcard.matches("https://app.example.com"));
        assert!(!wildcard.matches("https://example.org"));

        let regex = AllowedOrigin::regex(r"^https://app-\d+\.example\.com$");
        assert!(regex.matches("https://app-42.example.com"));
        assert!(!regex.matches("https://app-x.example.com"));
    }

    #[test]
    fn classification_covers_the_three_kinds() {
        let no_origin = MiddlewareContext::new(MiddlewareRequest::new("GET", "/api/x"));
        assert_eq!(classify(&no_origin), CorsRequestKind::NotCors);

        let preflight = MiddlewareContext::new(
            MiddlewareRequest::new("OPTIONS", "/api/x")
                .with_header("Origin", "https://example.com")
                .with_header("Access-Control-Request-Method", "POST"),
        );
        assert_eq!(classify(&preflight), CorsRequestKind::Preflight);

        let simple = MiddlewareContext::new(
            MiddlewareRequest::new("GET", "/api/x").with_header("Origin", "https://example.com"),
        );
        assert_eq!(classify(&simple), CorsRequestKind::Simple);

        let actual = MiddlewareContext::new(
            MiddlewareRequest::new("POST", "/api/x")
                .with_header("Origin", "https://example.com")
                .with_header("Content-Type", "application/json"),
        );
        assert_eq!(classify(&actual), CorsRequestKind::Actual);
    }

    #[tokio::test]
    async fn preflight_success_returns_204_with_allow_headers() {
        let mw = middleware_with(example_rule());
        let mut ctx = MiddlewareContext::new(
            MiddlewareRequest::new("OPTIONS", "/api/x")
                .with_header("Origin", "https://example.com")
                .with_header("Access-Control-Request-Method", "POST")
                .with_header("Access-Control-Request-Headers", "Authorization"),
        );

        let result = mw.process_request(&mut ctx).await.unwrap();
        assert!(!result.continue_chain);
        assert_eq!(result.status_code, Some(204));
        assert_eq!(
            result.headers.get("Access-Control-Allow-Origin").map(String::as_str),
            Some("https://example.com")
        );
        assert_eq!(
            result.headers.get("Access-Control-Allow-Methods").map(String::as_str),
            Some("GET, POST")
        );
        assert!(result
            .headers
            .get("Access-Control-Allow-Headers")
            .is_some_and(|headers| headers.contains("Authorization")));
    }

    #[tokio::test]
    async fn preflight_with_disallowed_method_is_denied() {
        let mw = middleware_with(example_rule());
        let mut ctx = MiddlewareContext::new(
            MiddlewareRequest::new("OPTIONS", "/api/x")
                .with_header("Origin", "https://example.com")
                .with_header("Access-Control-Request-Method", "DELETE"),
        );

        let result = mw.process_request(&mut ctx).await.unwrap();
        assert_eq!(result.status_code, Some(403));
    }

    #[tokio::test]
    async fn disallowed_origin_is_denied() {
        let mw = middleware_with(example_rule());
        let mut ctx = MiddlewareContext::new(
            MiddlewareRequest::new("GET", "/api/x").with_header("Origin", "https://evil.com"),
        );
        let result = mw.process_request(&mut ctx).await.unwrap();
        assert_eq!(result.status_code, Some(403));
    }

    #[tokio::test]
    async fn actual_request_gets_response_headers() {
        let mw = middleware_with(example_rule());
        let mut ctx = MiddlewareContext::new(
            MiddlewareRequest::new("POST", "/api/x")
                .with_header("Origin", "https://example.com")
                .with_header("Content-Type", "application/json"),
        );

        let result = mw.process_request(&mut ctx).await.unwrap();
        assert!(result.continue_chain);

        ctx.response = Some(super::super::MiddlewareResponse::new(200));
        mw.process_response(&mut ctx).await.unwrap();
        let response = ctx.response.unwrap();
        assert_eq!(
            response.header("access-control-allow-origin"),
            Some("https://example.com")
        );
        assert_eq!(
            response.header("access-control-expose-headers"),
            Some("X-Request-Id")
        );
    }

    #[tokio::test]
    async fn non_cors_requests_pass_untouched() {
        let mw = middleware_with(example_rule());
        let mut ctx = MiddlewareContext::new(MiddlewareRequest::new("GET", "/api/x"));
        let result = mw.process_request(&mut ctx).await.unwrap();
        assert!(result.continue_chain);

        ctx.response = Some(super::super::MiddlewareResponse::new(200));
        mw.process_response(&mut ctx).await.unwrap();
        assert!(ctx
            .response
            .unwrap()
            .header("access-control-allow-origin")
            .is_none());
    }
}
