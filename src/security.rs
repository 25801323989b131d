//! Security context view used across the bus and gateway
//!
//! The core never authenticates anyone: it consumes an externally established
//! identity with roles and claims, and evaluates `authorize` predicates
//! against it.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Identity, roles, and claims of the caller on whose behalf a message is
/// dispatched or a gateway request is processed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityContext {
    /// Principal identity; `None` for anonymous callers
    pub identity: Option<String>,
    /// Granted roles
    pub roles: HashSet<String>,
    /// Opaque claims attached by the authenticator
    pub claims: HashMap<String, serde_json::Value>,
}

impl SecurityContext {
    /// Creates an authenticated context
    #[must_use]
    pub fn authenticated(identity: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
            roles: HashSet::new(),
            claims: HashMap::new(),
        }
    }

    /// Creates an anonymous context
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            identity: None,
            roles: HashSet::new(),
            claims: HashMap::new(),
        }
    }

    /// Adds a role
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    /// Adds a claim
    #[must_use]
    pub fn with_claim(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.claims.insert(key.into(), value);
        self
    }

    /// Whether the context carries an authenticated identity
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    /// Whether the context holds the given role
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Authorizes a permission against this context.
    ///
    /// Permissions are role names; an authenticated identity is required for
    /// any permission to hold.
    #[must_use]
    pub fn authorize(&self, permission: &str) -> bool {
        self.is_authenticated() && self.has_role(permission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_context_authorizes_nothing() {
        let ctx = SecurityContext::anonymous();
        assert!(!ctx.is_authenticated());
        assert!(!ctx.authorize("admin"));
    }

    #[test]
    fn authorize_requires_the_role() {
        let ctx = SecurityContext::authenticated("ops@example.com").with_role("operator");
        assert!(ctx.authorize("operator"));
        assert!(!ctx.authorize("admin"));
    }
}
