//! Authentication middleware and providers.
//!
//! Providers are tried in configured order and the first success wins. On
//! success the authenticated context lands in `middleware_data` under
//! [`AUTHENTICATION_CONTEXT_KEY`] and its fields are mirrored into
//! `user_data` for downstream middlewares (authorization, rate limiting,
//! caching scopes).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    Middleware, MiddlewareConfig, MiddlewareContext, MiddlewareResult,
};

/// Well-known `middleware_data` key for the authenticated context.
pub const AUTHENTICATION_CONTEXT_KEY: &str = "authentication_context";

/// Supported credential mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationType {
    Jwt,
    ApiKey,
    BasicAuth,
}

/// Decoded token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject: the user id.
    pub sub: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    #[serde(flatten)]
    pub custom: HashMap<String, serde_json::Value>,
}

impl JwtClaims {
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            sub: user_id.into(),
            username: String::new(),
            email: String::new(),
            roles: Vec::new(),
            permissions: Vec::new(),
            iat: None,
            exp: None,
            iss: None,
            aud: None,
            custom: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    #[must_use]
    pub fn with_permissions(mut self, permissions: Vec<String>) -> Self {
        self.permissions = permissions;
        self
    }
}

/// Who the request is, as established by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationContext {
    pub is_authenticated: bool,
    pub authentication_type: Option<AuthenticationType>,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub authenticated_at: Option<DateTime<Utc>>,
}

impl AuthenticationContext {
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            is_authenticated: false,
            authentication_type: None,
            user_id: None,
            username: None,
            email: None,
            roles: Vec::new(),
            permissions: Vec::new(),
            api_key: None,
            metadata: HashMap::new(),
            authenticated_at: None,
        }
    }

    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

/// Result of one provider attempt.
#[derive(Debug, Clone)]
pub struct AuthenticationOutcome {
    pub success: bool,
    pub context: Option<AuthenticationContext>,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

impl AuthenticationOutcome {
    #[must_use]
    pub fn granted(context: AuthenticationContext) -> Self {
        Self {
            success: true,
            context: Some(context),
            error: None,
            error_code: None,
        }
    }

    #[must_use]
    pub fn denied(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            success: false,
            context: None,
            error: Some(error.into()),
            error_code: Some(code.into()),
        }
    }
}

/// One credential mechanism.
#[async_trait]
pub trait AuthenticationProvider: Send + Sync {
    fn authentication_type(&self) -> AuthenticationType;
    async fn authenticate(&self, ctx: &MiddlewareContext) -> AuthenticationOutcome;
}

/// JWT verification options.
#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub algorithm: Algorithm,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub verify_exp: bool,
    /// Clock-skew tolerance applied to expiry checks.
    pub leeway_secs: u64,
    /// Lifetime stamped into issued tokens.
    pub token_ttl: Duration,
}

impl JwtConfig {
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            algorithm: Algorithm::HS256,
            issuer: None,
            audience: None,
            verify_exp: true,
            leeway_secs: 0,
            token_ttl: Duration::from_secs(3600),
        }
    }
}

/// Decodes, verifies and issues tokens.
pub struct JwtValidator {
    config: JwtConfig,
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
    validation: Validation,
}

impl JwtValidator {
    #[must_use]
    pub fn new(config: JwtConfig) -> Self {
        let mut validation = Validation::new(config.algorithm);
        validation.leeway = config.leeway_secs;
        validation.validate_exp = config.verify_exp;
        if !config.verify_exp {
            validation.required_spec_claims.clear();
        }
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(std::slice::from_ref(issuer));
        }
        if let Some(audience) = &config.audience {
            validation.set_audience(std::slice::from_ref(audience));
        }
        Self {
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            validation,
            config,
        }
    }

    /// Verify a raw token and build the authenticated context.
    pub fn validate(&self, token: &str) -> AuthenticationOutcome {
        let claims = match decode::<JwtClaims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => data.claims,
            Err(err) => {
                return match err.kind() {
                    ErrorKind::ExpiredSignature => {
                        AuthenticationOutcome::denied("Token has expired", "TOKEN_EXPIRED")
                    }
                    _ => AuthenticationOutcome::denied(
                        format!("Invalid token: {err}"),
                        "INVALID_TOKEN",
                    ),
                };
            }
        };

        let context = AuthenticationContext {
            is_authenticated: true,
            authentication_type: Some(AuthenticationType::Jwt),
            user_id: Some(claims.sub.clone()),
            username: Some(claims.username.clone()),
            email: Some(claims.email.clone()),
            roles: claims.roles.clone(),
            permissions: claims.permissions.clone(),
            api_key: None,
            metadata: claims.custom.clone(),
            authenticated_at: Some(Utc::now()),
        };
        AuthenticationOutcome::granted(context)
    }

    /// Issue a signed token, stamping `iat` and (unless preset) `exp` from
    /// the configured lifetime.
    pub fn issue(&self, mut claims: JwtClaims) -> anyhow::Result<String> {
        let now = Utc::now();
        claims.iat = Some(now.timestamp());
        if claims.exp.is_none() {
            claims.exp = Some((now + self.config.token_ttl).timestamp());
        }
        if claims.iss.is_none() {
            claims.iss.clone_from(&self.config.issuer);
        }
        if claims.aud.is_none() {
            claims.aud.clone_from(&self.config.audience);
        }
        Ok(encode(
            &Header::new(self.config.algorithm),
            &claims,
            &self.encoding_key,
        )?)
    }
}

/// `Authorization: Bearer <token>` provider.
pub struct JwtProvider {
    validator: JwtValidator,
}

impl JwtProvider {
    #[must_use]
    pub fn new(config: JwtConfig) -> Self {
        Self {
            validator: JwtValidator::new(config),
        }
    }

    #[must_use]
    pub fn validator(&self) -> &JwtValidator {
        &self.validator
    }
}

#[async_trait]
impl AuthenticationProvider for JwtProvider {
    fn authentication_type(&self) -> AuthenticationType {
        AuthenticationType::Jwt
    }

    async fn authenticate(&self, ctx: &MiddlewareContext) -> AuthenticationOutcome {
        let Some(header) = ctx.request.header("authorization") else {
            return AuthenticationOutcome::denied(
                "Missing Authorization header",
                "MISSING_AUTH_HEADER",
            );
        };
        let Some(token) = header.strip_prefix("Bearer ") else {
            return AuthenticationOutcome::denied(
                "Invalid Authorization header format",
                "INVALID_AUTH_FORMAT",
            );
        };
        if token.is_empty() {
            return AuthenticationOutcome::denied("Missing token", "MISSING_TOKEN");
        }
        self.validator.validate(token)
    }
}

/// Stored API key identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ApiKeyRecord {
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: String::new(),
            email: String::new(),
            roles: Vec::new(),
            permissions: Vec::new(),
            created_at: Utc::now(),
            last_used: None,
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }
}

/// Key storage contract; lookups stamp the last-used time.
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn lookup(&self, api_key: &str) -> Option<ApiKeyRecord>;
}

/// Process-local key store.
#[derive(Default)]
pub struct MemoryApiKeyStore {
    keys: DashMap<String, ApiKeyRecord>,
}

impl MemoryApiKeyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, api_key: impl Into<String>, record: ApiKeyRecord) {
        self.keys.insert(api_key.into(), record);
    }

    pub fn remove(&self, api_key: &str) -> bool {
        self.keys.remove(api_key).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl ApiKeyStore for MemoryApiKeyStore {
    async fn lookup(&self, api_key: &str) -> Option<ApiKeyRecord> {
        let mut entry = self.keys.get_mut(api_key)?;
        entry.last_used = Some(Utc::now());
        Some(entry.clone())
    }
}

/// Generate a fresh API key with an optional prefix.
#[must_use]
pub fn generate_api_key(prefix: &str, length: usize) -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{prefix}{token}")
}

/// API key extraction options.
#[derive(Debug, Clone)]
pub struct ApiKeyConfig {
    pub header_name: String,
    pub query_param: String,
    pub allow_query_param: bool,
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            header_name: "X-API-Key".to_string(),
            query_param: "api_key".to_string(),
            allow_query_param: true,
        }
    }
}

/// Header/query-parameter API key provider over an injected store.
pub struct ApiKeyProvider {
    config: ApiKeyConfig,
    store: Arc<dyn ApiKeyStore>,
}

impl ApiKeyProvider {
    #[must_use]
    pub fn new(config: ApiKeyConfig, store: Arc<dyn ApiKeyStore>) -> Self {
        Self { config, store }
    }
}

#[async_trait]
impl AuthenticationProvider for ApiKeyProvider {
    fn authentication_type(&self) -> AuthenticationType {
        AuthenticationType::ApiKey
    }

    async fn authenticate(&self, ctx: &MiddlewareContext) -> AuthenticationOutcome {
        let from_header = ctx.request.header(&self.config.header_name);
        let api_key = match from_header {
            Some(key) => Some(key),
            None if self.config.allow_query_param => {
                ctx.request.query_param(&self.config.query_param)
            }
            None => None,
        };
        let Some(api_key) = api_key else {
            return AuthenticationOutcome::denied(
                format!(
                    "Missing API key in {} header or {} parameter",
                    self.config.header_name, self.config.query_param
                ),
                "MISSING_API_KEY",
            );
        };

        let Some(record) = self.store.lookup(api_key).await else {
            return AuthenticationOutcome::denied("Invalid API key", "INVALID_API_KEY");
        };

        let context = AuthenticationContext {
            is_authenticated: true,
            authentication_type: Some(AuthenticationType::ApiKey),
            user_id: Some(record.user_id),
            username: Some(record.username),
            email: Some(record.email),
            roles: record.roles,
            permissions: record.permissions,
            api_key: Some(api_key.to_string()),
            metadata: record.metadata,
            authenticated_at: Some(Utc::now()),
        };
        AuthenticationOutcome::granted(context)
    }
}

/// Identity produced by a Basic-auth credential validator.
#[derive(Debug, Clone)]
pub struct UserAccount {
    pub user_id: String,
    pub email: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Callback deciding whether a username/password pair is valid.
pub type CredentialValidator =
    Arc<dyn Fn(&str, &str) -> Option<UserAccount> + Send + Sync>;

/// `Authorization: Basic <base64>` provider delegating to a validator.
pub struct BasicAuthProvider {
    realm: String,
    validator: CredentialValidator,
}

impl BasicAuthProvider {
    #[must_use]
    pub fn new(realm: impl Into<String>, validator: CredentialValidator) -> Self {
        Self {
            realm: realm.into(),
            validator,
        }
    }

    #[must_use]
    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Split `Basic <base64(user:pass)>` at the first colon.
    fn decode_credentials(header: &str) -> Option<(String, String)> {
        let encoded = header.strip_prefix("Basic ")?;
        let decoded = BASE64.decode(encoded).ok()?;
        let text = String::from_utf8(decoded).ok()?;
        let (username, password) = text.split_once(':')?;
        Some((username.to_string(), password.to_string()))
    }
}

#[async_trait]
impl AuthenticationProvider for BasicAuthProvider {
    fn authentication_type(&self) -> AuthenticationType {
        AuthenticationType::BasicAuth
    }

    async fn authenticate(&self, ctx: &MiddlewareContext) -> AuthenticationOutcome {
        let Some(header) = ctx.request.header("authorization") else {
            return AuthenticationOutcome::denied(
                "Missing Authorization header",
                "MISSING_AUTH_HEADER",
            );
        };
        let Some((username, password)) = Self::decode_credentials(header) else {
            return AuthenticationOutcome::denied(
                "Invalid Authorization header format",
                "INVALID_AUTH_FORMAT",
            );
        };

        let Some(account) = (self.validator)(&username, &password) else {
            return AuthenticationOutcome::denied(
                "Invalid username or password",
                "INVALID_CREDENTIALS",
            );
        };

        let context = AuthenticationContext {
            is_authenticated: true,
            authentication_type: Some(AuthenticationType::BasicAuth),
            user_id: Some(account.user_id),
            username: Some(username),
            email: Some(account.email),
            roles: account.roles,
            permissions: account.permissions,
            api_key: None,
            metadata: account.metadata,
            authenticated_at: Some(Utc::now()),
        };
        AuthenticationOutcome::granted(context)
    }
}

/// Authentication middleware behavior options.
#[derive(Debug, Clone, Default)]
pub struct AuthenticationSettings {
    /// Continue with an anonymous marker when no provider succeeds.
    pub allow_anonymous: bool,
    /// Path prefixes that bypass authentication entirely.
    pub skip_paths: Vec<String>,
}

/// Orchestrates the configured providers.
pub struct AuthenticationMiddleware {
    config: MiddlewareConfig,
    settings: AuthenticationSettings,
    providers: Vec<Arc<dyn AuthenticationProvider>>,
}

impl AuthenticationMiddleware {
    #[must_use]
    pub fn new(
        config: MiddlewareConfig,
        settings: AuthenticationSettings,
        providers: Vec<Arc<dyn AuthenticationProvider>>,
    ) -> Self {
        Self {
            config,
            settings,
            providers,
        }
    }

    fn should_skip(&self, path: &str) -> bool {
        self.settings
            .skip_paths
            .iter()
            .any(|skip| path.starts_with(skip.as_str()))
    }

    /// Authenticated context stored by a previous run over this context.
    #[must_use]
    pub fn authentication_context(ctx: &MiddlewareContext) -> Option<AuthenticationContext> {
        ctx.data_as(AUTHENTICATION_CONTEXT_KEY)
    }
}

#[async_trait]
impl Middleware for AuthenticationMiddleware {
    fn config(&self) -> &MiddlewareConfig {
        &self.config
    }

    async fn process_request(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> anyhow::Result<MiddlewareResult> {
        if self.should_skip(&ctx.request.path) {
            ctx.set_data("authentication_skipped", serde_json::json!(true));
            return Ok(MiddlewareResult::success());
        }

        let mut granted = None;
        for provider in &self.providers {
            let outcome = provider.authenticate(ctx).await;
            if outcome.success {
                granted = outcome.context;
                break;
            }
            debug!(
                provider = ?provider.authentication_type(),
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "authentication attempt failed"
            );
        }

        let Some(context) = granted else {
            if self.settings.allow_anonymous {
                ctx.set_data("authentication_anonymous", serde_json::json!(true));
                ctx.set_data(
                    AUTHENTICATION_CONTEXT_KEY,
                    serde_json::to_value(AuthenticationContext::anonymous())?,
                );
                return Ok(MiddlewareResult::success());
            }
            return Ok(MiddlewareResult::stop(
                401,
                r#"{"error": "Authentication required"}"#,
            ));
        };

        ctx.set_user_data("user_id", serde_json::json!(context.user_id));
        ctx.set_user_data("username", serde_json::json!(context.username));
        ctx.set_user_data("roles", serde_json::json!(context.roles));
        ctx.set_user_data("permissions", serde_json::json!(context.permissions));
        ctx.set_data(AUTHENTICATION_CONTEXT_KEY, serde_json::to_value(context)?);

        Ok(MiddlewareResult::success())
    }
}
