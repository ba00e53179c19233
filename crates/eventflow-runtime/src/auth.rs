//! Principals and authorization policies.
//!
//! Authorization is policy-driven: the host authenticates and supplies a
//! [`Principal`]; the buses evaluate a registered [`AuthorizationPolicy`]
//! combining required permissions, roles, ownership, and custom predicates.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use eventflow_core::{EngineError, EngineResult};

/// Authenticated caller identity supplied by the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Principal {
    pub id: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: Vec::new(),
            permissions: Vec::new(),
        }
    }

    pub fn with_roles(mut self, roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_permissions(
        mut self,
        permissions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

/// Custom authorization predicate evaluated against the message payload.
pub type CustomCheck = Arc<dyn Fn(&Principal, &Value) -> bool + Send + Sync>;

/// Declarative policy for one command or query type.
#[derive(Clone, Default)]
pub struct AuthorizationPolicy {
    required_permissions: Vec<String>,
    required_roles: Vec<String>,
    /// Payload field that must equal the principal id (ownership check)
    owner_field: Option<String>,
    custom: Option<CustomCheck>,
}

impl std::fmt::Debug for AuthorizationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationPolicy")
            .field("required_permissions", &self.required_permissions)
            .field("required_roles", &self.required_roles)
            .field("owner_field", &self.owner_field)
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

impl AuthorizationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require_permission(mut self, permission: impl Into<String>) -> Self {
        self.required_permissions.push(permission.into());
        self
    }

    pub fn require_role(mut self, role: impl Into<String>) -> Self {
        self.required_roles.push(role.into());
        self
    }

    pub fn require_owner_field(mut self, field: impl Into<String>) -> Self {
        self.owner_field = Some(field.into());
        self
    }

    pub fn with_custom_check(mut self, check: CustomCheck) -> Self {
        self.custom = Some(check);
        self
    }

    /// Evaluate the policy. `Err(reason)` carries the denied requirement.
    pub fn evaluate(&self, principal: &Principal, payload: &Value) -> Result<(), String> {
        for permission in &self.required_permissions {
            if !principal.has_permission(permission) {
                return Err(format!("missing permission '{}'", permission));
            }
        }
        for role in &self.required_roles {
            if !principal.has_role(role) {
                return Err(format!("missing role '{}'", role));
            }
        }
        if let Some(field) = &self.owner_field {
            let owner = payload.get(field).and_then(Value::as_str);
            if owner != Some(principal.id.as_str()) {
                return Err(format!("principal does not own '{}'", field));
            }
        }
        if let Some(check) = &self.custom {
            if !check(principal, payload) {
                return Err("custom authorization check failed".to_string());
            }
        }
        Ok(())
    }
}

/// Per-message-type policy registry shared by the command and query buses.
///
/// In strict mode a message type without a registered policy is denied; in
/// non-strict mode unauthenticated messages without a policy pass through.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    policies: HashMap<String, AuthorizationPolicy>,
    strict: bool,
}

impl PolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict() -> Self {
        Self {
            policies: HashMap::new(),
            strict: true,
        }
    }

    pub fn register(&mut self, message_type: impl Into<String>, policy: AuthorizationPolicy) {
        self.policies.insert(message_type.into(), policy);
    }

    pub fn with_policy(
        mut self,
        message_type: impl Into<String>,
        policy: AuthorizationPolicy,
    ) -> Self {
        self.register(message_type, policy);
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn authorize(
        &self,
        message_type: &str,
        principal: Option<&Principal>,
        payload: &Value,
    ) -> EngineResult<()> {
        let deny = |reason: String| EngineError::AuthorizationFailure {
            message_type: message_type.to_string(),
            reason,
        };

        match self.policies.get(message_type) {
            Some(policy) => {
                let principal =
                    principal.ok_or_else(|| deny("no principal supplied".to_string()))?;
                policy
                    .evaluate(principal, payload)
                    .map_err(deny)
            }
            None if self.strict => Err(deny("no policy registered (strict mode)".to_string())),
            None => Ok(()),
        }
    }
}
