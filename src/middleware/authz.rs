//! Authorization middleware: RBAC, ACL and a condition-matching policy
//! engine, tried in that order until one allows.
//!
//! Role permissions are the transitive closure over parent roles; cycles
//! are handled with a visited set so accumulation is finite. Decisions are
//! cached (user, resource, action) for a short TTL.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache as DecisionCache;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::auth::{AuthenticationContext, AUTHENTICATION_CONTEXT_KEY};
use super::{glob_match, Middleware, MiddlewareConfig, MiddlewareContext, MiddlewareResult};

/// Action derived from the request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationAction {
    Read,
    Write,
    Create,
    Update,
    Delete,
    Admin,
    Execute,
}

impl AuthorizationAction {
    /// GET reads, POST creates, PUT/PATCH update, DELETE deletes; anything
    /// else is treated as a read.
    #[must_use]
    pub fn from_method(method: &str) -> Self {
        match method.to_ascii_uppercase().as_str() {
            "POST" => Self::Create,
            "PUT" | "PATCH" => Self::Update,
            "DELETE" => Self::Delete,
            _ => Self::Read,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Admin => "admin",
            Self::Execute => "execute",
        }
    }
}

/// A named capability over a resource pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    pub permission_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Glob over the resource (request path).
    pub resource_pattern: String,
    pub actions: Vec<AuthorizationAction>,
}

impl Permission {
    #[must_use]
    pub fn new(
        permission_id: impl Into<String>,
        resource_pattern: impl Into<String>,
        actions: Vec<AuthorizationAction>,
    ) -> Self {
        let permission_id = permission_id.into();
        Self {
            name: permission_id.clone(),
            permission_id,
            description: String::new(),
            resource_pattern: resource_pattern.into(),
            actions,
        }
    }

    #[must_use]
    pub fn matches_resource(&self, resource: &str) -> bool {
        glob_match(&self.resource_pattern, resource)
    }

    /// Admin in the action list grants everything.
    #[must_use]
    pub fn allows_action(&self, action: AuthorizationAction) -> bool {
        self.actions.contains(&action) || self.actions.contains(&AuthorizationAction::Admin)
    }
}

/// A role: direct permissions plus parents it inherits from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub role_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub parent_roles: Vec<String>,
}

impl Role {
    #[must_use]
    pub fn new(role_id: impl Into<String>, permissions: Vec<String>) -> Self {
        let role_id = role_id.into();
        Self {
            name: role_id.clone(),
            role_id,
            description: String::new(),
            permissions,
            parent_roles: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_parents(mut self, parents: Vec<String>) -> Self {
        self.parent_roles = parents;
        self
    }
}

/// Permission registry.
#[derive(Default)]
pub struct PermissionRegistry {
    permissions: RwLock<HashMap<String, Permission>>,
}

impl PermissionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, permission: Permission) {
        self.permissions
            .write()
            .insert(permission.permission_id.clone(), permission);
    }

    pub fn unregister(&self, permission_id: &str) -> bool {
        self.permissions.write().remove(permission_id).is_some()
    }

    #[must_use]
    pub fn get(&self, permission_id: &str) -> Option<Permission> {
        self.permissions.read().get(permission_id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.permissions.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.permissions.read().is_empty()
    }
}

/// Role registry with inheritance resolution.
#[derive(Default)]
pub struct RoleRegistry {
    roles: RwLock<HashMap<String, Role>>,
}

impl RoleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, role: Role) {
        self.roles.write().insert(role.role_id.clone(), role);
    }

    pub fn unregister(&self, role_id: &str) -> bool {
        self.roles.write().remove(role_id).is_some()
    }

    #[must_use]
    pub fn get(&self, role_id: &str) -> Option<Role> {
        self.roles.read().get(role_id).cloned()
    }

    /// Every permission of the role, including inherited ones. Parent
    /// cycles terminate through the visited set.
    #[must_use]
    pub fn role_permissions(
        &self,
        role_id: &str,
        permissions: &PermissionRegistry,
    ) -> Vec<Permission> {
        let roles = self.roles.read();
        let mut collected = Vec::new();
        let mut visited = HashSet::new();
        let mut pending = vec![role_id.to_string()];

        while let Some(current) = pending.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let Some(role) = roles.get(&current) else {
                continue;
            };
            for permission_id in &role.permissions {
                if let Some(permission) = permissions.get(permission_id) {
                    collected.push(permission);
                }
            }
            pending.extend(role.parent_roles.iter().cloned());
        }
        collected
    }
}

/// Allow or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

/// ACL evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclEvaluationOrder {
    DenyFirst,
    AllowFirst,
}

/// One access-control entry; subjects are user ids or role ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclEntry {
    pub subject: String,
    pub resource: String,
    pub action: AuthorizationAction,
    pub effect: Effect,
}

impl AclEntry {
    #[must_use]
    pub fn new(
        subject: impl Into<String>,
        resource: impl Into<String>,
        action: AuthorizationAction,
        effect: Effect,
    ) -> Self {
        Self {
            subject: subject.into(),
            resource: resource.into(),
            action,
            effect,
        }
    }

    fn matches(&self, subject: &str, resource: &str, action: AuthorizationAction) -> bool {
        self.subject == subject && self.resource == resource && self.action == action
    }
}

/// Access-control list with configurable evaluation order and default
/// effect.
pub struct AccessControlList {
    entries: RwLock<Vec<AclEntry>>,
    evaluation_order: AclEvaluationOrder,
    default_effect: Effect,
}

impl Default for AccessControlList {
    fn default() -> Self {
        Self::new(AclEvaluationOrder::DenyFirst, Effect::Deny)
    }
}

impl AccessControlList {
    #[must_use]
    pub fn new(evaluation_order: AclEvaluationOrder, default_effect: Effect) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            evaluation_order,
            default_effect,
        }
    }

    pub fn add_entry(&self, entry: AclEntry) {
        self.entries.write().push(entry);
    }

    pub fn remove_entry(
        &self,
        subject: &str,
        resource: &str,
        action: AuthorizationAction,
    ) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|entry| !entry.matches(subject, resource, action));
        before != entries.len()
    }

    /// Evaluate one subject against the list.
    #[must_use]
    pub fn evaluate(&self, subject: &str, resource: &str, action: AuthorizationAction) -> bool {
        let entries = self.entries.read();
        let mut allowed = false;
        let mut denied = false;
        for entry in entries.iter() {
            if entry.matches(subject, resource, action) {
                match entry.effect {
                    Effect::Allow => allowed = true,
                    Effect::Deny => denied = true,
                }
            }
        }
        match self.evaluation_order {
            AclEvaluationOrder::DenyFirst => {
                if denied {
                    false
                } else if allowed {
                    true
                } else {
                    self.default_effect == Effect::Allow
                }
            }
            AclEvaluationOrder::AllowFirst => {
                if allowed {
                    true
                } else if denied {
                    false
                } else {
                    self.default_effect == Effect::Allow
                }
            }
        }
    }
}

/// A policy: equality conditions over the combined request context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationPolicy {
    pub policy_id: String,
    pub name: String,
    #[serde(default)]
    pub conditions: HashMap<String, serde_json::Value>,
    pub effect: Effect,
    #[serde(default)]
    pub priority: i32,
}

impl AuthorizationPolicy {
    #[must_use]
    pub fn new(policy_id: impl Into<String>, effect: Effect) -> Self {
        let policy_id = policy_id.into();
        Self {
            name: policy_id.clone(),
            policy_id,
            conditions: HashMap::new(),
            effect,
            priority: 0,
        }
    }

    #[must_use]
    pub fn with_condition(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.conditions.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn matches(&self, context: &HashMap<String, serde_json::Value>) -> bool {
        self.conditions
            .iter()
            .all(|(key, expected)| context.get(key) == Some(expected))
    }
}

/// Highest-priority matching policy wins; no match denies.
#[derive(Default)]
pub struct PolicyEngine {
    policies: RwLock<HashMap<String, AuthorizationPolicy>>,
}

impl PolicyEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, policy: AuthorizationPolicy) {
        self.policies.write().insert(policy.policy_id.clone(), policy);
    }

    pub fn unregister(&self, policy_id: &str) -> bool {
        self.policies.write().remove(policy_id).is_some()
    }

    #[must_use]
    pub fn evaluate(&self, context: &HashMap<String, serde_json::Value>) -> bool {
        let policies = self.policies.read();
        let mut sorted: Vec<&AuthorizationPolicy> = policies.values().collect();
        sorted.sort_by_key(|policy| std::cmp::Reverse(policy.priority));
        for policy in sorted {
            if policy.matches(context) {
                return policy.effect == Effect::Allow;
            }
        }
        false
    }
}

/// Authorization decision with the reason that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationDecision {
    pub allowed: bool,
    pub reason: String,
    #[serde(default)]
    pub applied_permissions: Vec<String>,
}

impl AuthorizationDecision {
    #[must_use]
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            applied_permissions: Vec::new(),
        }
    }

    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            applied_permissions: Vec::new(),
        }
    }
}

/// Deny handling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementMode {
    /// Deny produces a 403 stop.
    Strict,
    /// Deny is recorded and the chain proceeds.
    Permissive,
}

/// Authorization middleware behavior options.
#[derive(Debug, Clone)]
pub struct AuthorizationSettings {
    pub enforcement_mode: EnforcementMode,
    /// Effect when the request carries no authenticated context.
    pub default_effect: Effect,
    pub skip_paths: Vec<String>,
    /// Path prefixes that require the `admin` role regardless of engines.
    pub admin_paths: Vec<String>,
    /// TTL of the (user, resource, action) decision cache.
    pub decision_cache_ttl: Duration,
    pub decision_cache_capacity: u64,
}

impl Default for AuthorizationSettings {
    fn default() -> Self {
        Self {
            enforcement_mode: EnforcementMode::Strict,
            default_effect: Effect::Deny,
            skip_paths: Vec::new(),
            admin_paths: Vec::new(),
            decision_cache_ttl: Duration::from_secs(300),
            decision_cache_capacity: 10_000,
        }
    }
}

/// RBAC → ACL → policy engine, first allow wins.
pub struct AuthorizationMiddleware {
    config: MiddlewareConfig,
    settings: AuthorizationSettings,
    permissions: Arc<PermissionRegistry>,
    roles: Arc<RoleRegistry>,
    acl: Arc<AccessControlList>,
    policies: Arc<PolicyEngine>,
    decisions: DecisionCache<String, AuthorizationDecision>,
}

impl AuthorizationMiddleware {
    #[must_use]
    pub fn new(config: MiddlewareConfig, settings: AuthorizationSettings) -> Self {
        let decisions = DecisionCache::builder()
            .max_capacity(settings.decision_cache_capacity)
            .time_to_live(settings.decision_cache_ttl)
            .build();
        Self {
            config,
            settings,
            permissions: Arc::new(PermissionRegistry::new()),
            roles: Arc::new(RoleRegistry::new()),
            acl: Arc::new(AccessControlList::default()),
            policies: Arc::new(PolicyEngine::new()),
            decisions,
        }
    }

    /// Seed the common API permissions and the `user`/`admin` roles.
    pub fn install_default_rbac(&self) {
        self.permissions.register(Permission::new(
            "api_read",
            "/api/*",
            vec![AuthorizationAction::Read],
        ));
        self.permissions.register(Permission::new(
            "api_write",
            "/api/*",
            vec![
                AuthorizationAction::Write,
                AuthorizationAction::Create,
                AuthorizationAction::Update,
            ],
        ));
        self.permissions.register(Permission::new(
            "api_admin",
            "*",
            vec![AuthorizationAction::Admin],
        ));
        self.roles
            .register(Role::new("user", vec!["api_read".into()]));
        self.roles
            .register(Role::new("admin", vec!["api_admin".into()]));
    }

    #[must_use]
    pub fn permissions(&self) -> &Arc<PermissionRegistry> {
        &self.permissions
    }

    #[must_use]
    pub fn roles(&self) -> &Arc<RoleRegistry> {
        &self.roles
    }

    #[must_use]
    pub fn acl(&self) -> &Arc<AccessControlList> {
        &self.acl
    }

    #[must_use]
    pub fn policies(&self) -> &Arc<PolicyEngine> {
        &self.policies
    }

    fn should_skip(&self, path: &str) -> bool {
        self.settings
            .skip_paths
            .iter()
            .any(|skip| path.starts_with(skip.as_str()))
    }

    fn requires_admin(&self, path: &str) -> bool {
        self.settings
            .admin_paths
            .iter()
            .any(|admin| path.starts_with(admin.as_str()))
    }

    fn evaluate_rbac(
        &self,
        auth: &AuthenticationContext,
        resource: &str,
        action: AuthorizationAction,
    ) -> AuthorizationDecision {
        if auth.has_role("admin") {
            return AuthorizationDecision::allow("administrator access");
        }
        let mut applied = Vec::new();
        for role_id in &auth.roles {
            for permission in self.roles.role_permissions(role_id, &self.permissions) {
                if permission.matches_resource(resource) && permission.allows_action(action) {
                    applied.push(permission.permission_id);
                }
            }
        }
        if applied.is_empty() {
            AuthorizationDecision::deny("no matching rbac permissions")
        } else {
            let mut decision =
                AuthorizationDecision::allow(format!("rbac permissions: {}", applied.join(", ")));
            decision.applied_permissions = applied;
            decision
        }
    }

    fn evaluate_acl(
        &self,
        auth: &AuthenticationContext,
        resource: &str,
        action: AuthorizationAction,
    ) -> AuthorizationDecision {
        if let Some(user_id) = &auth.user_id {
            if self.acl.evaluate(user_id, resource, action) {
                return AuthorizationDecision::allow("acl grant for user");
            }
        }
        for role in &auth.roles {
            if self.acl.evaluate(role, resource, action) {
                return AuthorizationDecision::allow(format!("acl grant for role {role}"));
            }
        }
        AuthorizationDecision::deny("acl denied")
    }

    fn evaluate_policies(
        &self,
        auth: &AuthenticationContext,
        ctx: &MiddlewareContext,
        resource: &str,
        action: AuthorizationAction,
    ) -> AuthorizationDecision {
        let mut policy_context: HashMap<String, serde_json::Value> = HashMap::new();
        policy_context.insert("user_id".into(), serde_json::json!(auth.user_id));
        policy_context.insert("roles".into(), serde_json::json!(auth.roles));
        policy_context.insert("resource".into(), serde_json::json!(resource));
        policy_context.insert("action".into(), serde_json::json!(action.as_str()));
        policy_context.insert("method".into(), serde_json::json!(ctx.request.method));
        policy_context.insert(
            "remote_addr".into(),
            serde_json::json!(ctx.request.remote_addr),
        );
        for (key, value) in &ctx.request.metadata {
            policy_context.insert(key.clone(), value.clone());
        }

        if self.policies.evaluate(&policy_context) {
            AuthorizationDecision::allow("policy grant")
        } else {
            AuthorizationDecision::deny("no policy allowed the request")
        }
    }

    fn deny_response(decision: &AuthorizationDecision) -> MiddlewareResult {
        MiddlewareResult::stop(
            403,
            format!(
                r#"{{"error": "Access denied", "reason": "{}"}}"#,
                decision.reason
            ),
        )
    }
}

#[async_trait]
impl Middleware for AuthorizationMiddleware {
    fn config(&self) -> &MiddlewareConfig {
        &self.config
    }

    async fn process_request(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> anyhow::Result<MiddlewareResult> {
        if self.should_skip(&ctx.request.path) {
            ctx.set_data("authorization_skipped", serde_json::json!(true));
            return Ok(MiddlewareResult::success());
        }

        let auth: Option<AuthenticationContext> = ctx.data_as(AUTHENTICATION_CONTEXT_KEY);
        let Some(auth) = auth.filter(|auth| auth.is_authenticated) else {
            if self.settings.default_effect == Effect::Allow {
                return Ok(MiddlewareResult::success());
            }
            return Ok(MiddlewareResult::stop(
                401,
                r#"{"error": "Authentication required for authorization"}"#,
            ));
        };

        let resource = ctx.request.path.clone();
        let action = AuthorizationAction::from_method(&ctx.request.method);

        // admin paths require the admin role regardless of engine outcome;
        // the engines are never consulted for this request
        if self.requires_admin(&resource) && !auth.has_role("admin") {
            let decision = AuthorizationDecision::deny("administrator role required");
            ctx.set_data("authorization_result", serde_json::to_value(&decision)?);
            return match self.settings.enforcement_mode {
                EnforcementMode::Strict => Ok(Self::deny_response(&decision)),
                EnforcementMode::Permissive => {
                    ctx.add_error(anyhow::anyhow!(
                        "authorization denied (permissive): {}",
                        decision.reason
                    ));
                    Ok(MiddlewareResult::success())
                }
            };
        }

        let cache_key = format!(
            "{}|{}|{}",
            auth.user_id.as_deref().unwrap_or("-"),
            resource,
            action.as_str()
        );
        if let Some(cached) = self.decisions.get(&cache_key).await {
            ctx.set_data("authorization_result", serde_json::to_value(&cached)?);
            ctx.set_data("authorization_cached", serde_json::json!(true));
            if cached.allowed || self.settings.enforcement_mode == EnforcementMode::Permissive {
                return Ok(MiddlewareResult::success());
            }
            return Ok(Self::deny_response(&cached));
        }

        let engines: [(&str, AuthorizationDecision); 3] = [
            ("rbac", self.evaluate_rbac(&auth, &resource, action)),
            ("acl", self.evaluate_acl(&auth, &resource, action)),
            (
                "policy",
                self.evaluate_policies(&auth, ctx, &resource, action),
            ),
        ];

        let mut last_decision = AuthorizationDecision::deny("no engine allowed the request");
        for (engine, decision) in engines {
            if decision.allowed {
                debug!(engine, user = ?auth.user_id, resource = %resource, "authorization granted");
                ctx.set_data("authorization_method", serde_json::json!(engine));
                ctx.set_data("authorization_result", serde_json::to_value(&decision)?);
                self.decisions.insert(cache_key, decision).await;
                return Ok(MiddlewareResult::success());
            }
            last_decision = decision;
        }

        ctx.set_data("authorization_result", serde_json::to_value(&last_decision)?);
        self.decisions
            .insert(cache_key, last_decision.clone())
            .await;

        match self.settings.enforcement_mode {
            EnforcementMode::Permissive => {
                ctx.add_error(anyhow::anyhow!(
                    "authorization denied (permissive): {}",
                    last_decision.reason
                ));
                Ok(MiddlewareResult::success())
            }
            EnforcementMode::Strict => Ok(Self::deny_response(&last_decision)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{MiddlewareRequest, MiddlewareType};

    fn authed_context(method: &str, path: &str, roles: Vec<&str>) -> MiddlewareContext {
        let mut ctx = MiddlewareContext::new(MiddlewareRequest::new(method, path));
        let auth = AuthenticationContext {
            is_authenticated: true,
            authentication_type: None,
            user_id: Some("u-1".into()),
            username: Some("user".into()),
            email: None,
            roles: roles.into_iter().map(String::from).collect(),
            permissions: Vec::new(),
            api_key: None,
            metadata: HashMap::new(),
            authenticated_at: None,
        };
        ctx.set_data(
            AUTHENTICATION_CONTEXT_KEY,
            serde_json::to_value(auth).unwrap(),
        );
        ctx
    }

    fn middleware(settings: AuthorizationSettings) -> AuthorizationMiddleware {
        AuthorizationMiddleware::new(
            MiddlewareConfig::new("authz", MiddlewareType::Authorization),
            settings,
        )
    }

    #[test]
    fn actions_derive_from_methods() {
        assert_eq!(
            AuthorizationAction::from_method("GET"),
            AuthorizationAction::Read
        );
        assert_eq!(
            AuthorizationAction::from_method("post"),
            AuthorizationAction::Create
        );
        assert_eq!(
            AuthorizationAction::from_method("PATCH"),
            AuthorizationAction::Update
        );
        assert_eq!(
            AuthorizationAction::from_method("DELETE"),
            AuthorizationAction::Delete
        );
    }

    #[test]
    fn role_permissions_follow_parents_and_survive_cycles() {
        let permissions = PermissionRegistry::new();
        permissions.register(Permission::new(
            "api_read",
            "/api/*",
            vec![AuthorizationAction::Read],
        ));
        permissions.register(Permission::new(
            "api_write",
            "/api/*",
            vec![AuthorizationAction::Write],
        ));

        let roles = RoleRegistry::new();
        // admin inherits user; user points back at admin to form a cycle
        roles.register(
            Role::new("admin", vec!["api_write".into()]).with_parents(vec!["user".into()]),
        );
        roles.register(
            Role::new("user", vec!["api_read".into()]).with_parents(vec!["admin".into()]),
        );

        let resolved = roles.role_permissions("admin", &permissions);
        let ids: HashSet<String> = resolved
            .into_iter()
            .map(|p| p.permission_id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("api_read"));
        assert!(ids.contains("api_write"));
    }

    #[test]
    fn acl_deny_first_beats_allow() {
        let acl = AccessControlList::default();
        acl.add_entry(AclEntry::new(
            "u-1",
            "/api/x",
            AuthorizationAction::Read,
            Effect::Allow,
        ));
        acl.add_entry(AclEntry::new(
            "u-1",
            "/api/x",
            AuthorizationAction::Read,
            Effect::Deny,
        ));
        assert!(!acl.evaluate("u-1", "/api/x", AuthorizationAction::Read));

        let allow_first = AccessControlList::new(AclEvaluationOrder::AllowFirst, Effect::Deny);
        allow_first.add_entry(AclEntry::new(
            "u-1",
            "/api/x",
            AuthorizationAction::Read,
            Effect::Allow,
        ));
        allow_first.add_entry(AclEntry::new(
            "u-1",
            "/api/x",
            AuthorizationAction::Read,
            Effect::Deny,
        ));
        assert!(allow_first.evaluate("u-1", "/api/x", AuthorizationAction::Read));
    }

    #[test]
    fn policy_engine_highest_priority_wins() {
        let engine = PolicyEngine::new();
        engine.register(
            AuthorizationPolicy::new("deny-all", Effect::Deny).with_priority(1),
        );
        engine.register(
            AuthorizationPolicy::new("allow-u1", Effect::Allow)
                .with_condition("user_id", serde_json::json!("u-1"))
                .with_priority(10),
        );

        let mut context = HashMap::new();
        context.insert("user_id".to_string(), serde_json::json!("u-1"));
        assert!(engine.evaluate(&context));

        context.insert("user_id".to_string(), serde_json::json!("u-2"));
        assert!(!engine.evaluate(&context));
    }

    #[tokio::test]
    async fn rbac_inheritance_grants_inherited_read() {
        let mw = middleware(AuthorizationSettings::default());
        mw.permissions().register(Permission::new(
            "api_read",
            "/api/*",
            vec![AuthorizationAction::Read],
        ));
        mw.roles().register(Role::new("user", vec!["api_read".into()]));
        mw.roles()
            .register(Role::new("power", Vec::new()).with_parents(vec!["user".into()]));

        let mut ctx = authed_context("GET", "/api/x", vec!["power"]);
        let result = mw.process_request(&mut ctx).await.unwrap();
        assert!(result.continue_chain, "inherited api_read should allow GET");

        let mut guest = authed_context("GET", "/api/x", vec!["guest"]);
        let result = mw.process_request(&mut guest).await.unwrap();
        assert!(!result.continue_chain);
        assert_eq!(result.status_code, Some(403));
    }

    #[tokio::test]
    async fn admin_role_bypasses_engines() {
        let mw = middleware(AuthorizationSettings::default());
        let mut ctx = authed_context("DELETE", "/anything", vec!["admin"]);
        let result = mw.process_request(&mut ctx).await.unwrap();
        assert!(result.continue_chain);
        assert_eq!(
            ctx.data("authorization_method"),
            Some(&serde_json::json!("rbac"))
        );
    }

    #[tokio::test]
    async fn admin_paths_require_admin_role() {
        let mw = middleware(AuthorizationSettings {
            admin_paths: vec!["/admin".into()],
            ..AuthorizationSettings::default()
        });
        mw.install_default_rbac();

        let mut ctx = authed_context("GET", "/admin/metrics", vec!["user"]);
        let result = mw.process_request(&mut ctx).await.unwrap();
        assert_eq!(result.status_code, Some(403));
    }

    #[tokio::test]
    async fn admin_paths_hold_regardless_of_engine_outcome_in_permissive_mode() {
        let mw = middleware(AuthorizationSettings {
            enforcement_mode: EnforcementMode::Permissive,
            admin_paths: vec!["/admin".into()],
            ..AuthorizationSettings::default()
        });
        // a permission that would grant GET /admin/* through RBAC
        mw.permissions().register(Permission::new(
            "admin_read",
            "/admin/*",
            vec![AuthorizationAction::Read],
        ));
        mw.roles()
            .register(Role::new("user", vec!["admin_read".into()]));
        // and an ACL entry that would grant it too
        mw.acl().add_entry(AclEntry::new(
            "u-1",
            "/admin/metrics",
            AuthorizationAction::Read,
            Effect::Allow,
        ));

        let mut ctx = authed_context("GET", "/admin/metrics", vec!["user"]);
        let result = mw.process_request(&mut ctx).await.unwrap();

        // permissive: the chain proceeds, but the deny is recorded and no
        // engine grant overwrites it
        assert!(result.continue_chain);
        assert!(ctx.has_errors());
        let decision: AuthorizationDecision =
            ctx.data_as("authorization_result").unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "administrator role required");
        assert!(ctx.data("authorization_method").is_none());

        // an actual admin still passes the same path untouched
        let mut admin_ctx = authed_context("GET", "/admin/metrics", vec!["admin"]);
        let result = mw.process_request(&mut admin_ctx).await.unwrap();
        assert!(result.continue_chain);
        assert!(!admin_ctx.has_errors());
    }

    #[tokio::test]
    async fn permissive_mode_records_but_continues() {
        let mw = middleware(AuthorizationSettings {
            enforcement_mode: EnforcementMode::Permissive,
            ..AuthorizationSettings::default()
        });
        let mut ctx = authed_context("GET", "/api/x", vec!["guest"]);
        let result = mw.process_request(&mut ctx).await.unwrap();
        assert!(result.continue_chain);
        assert!(ctx.has_errors());
    }

    #[tokio::test]
    async fn unauthenticated_requests_follow_default_effect() {
        let strict = middleware(AuthorizationSettings::default());
        let mut ctx = MiddlewareContext::new(MiddlewareRequest::new("GET", "/api/x"));
        let result = strict.process_request(&mut ctx).await.unwrap();
        assert_eq!(result.status_code, Some(401));

        let lenient = middleware(AuthorizationSettings {
            default_effect: Effect::Allow,
            ..AuthorizationSettings::default()
        });
        let mut ctx = MiddlewareContext::new(MiddlewareRequest::new("GET", "/api/x"));
        let result = lenient.process_request(&mut ctx).await.unwrap();
        assert!(result.continue_chain);
    }

    #[tokio::test]
    async fn decisions_are_cached_per_user_resource_action() {
        let mw = middleware(AuthorizationSettings::default());
        mw.install_default_rbac();

        let mut first = authed_context("GET", "/api/x", vec!["user"]);
        let result = mw.process_request(&mut first).await.unwrap();
        assert!(result.continue_chain);
        assert!(first.data("authorization_cached").is_none());

        let mut second = authed_context("GET", "/api/x", vec!["user"]);
        let result = mw.process_request(&mut second).await.unwrap();
        assert!(result.continue_chain);
        assert_eq!(
            second.data("authorization_cached"),
            Some(&serde_json::json!(true))
        );
    }
}
