//! Request-scoped state passed explicitly into the engine
//!
//! Carries what an HTTP request context would otherwise hold implicitly: the
//! correlation id, the authenticated user and extra criteria that narrow
//! every listing made on behalf of the request.

use serde::{Deserialize, Serialize};

use crate::query::Criterion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthenticationType {
    Basic,
    Bearer,
}

impl AuthenticationType {
    /// Scheme of an `Authorization` header value
    pub fn from_header(value: &str) -> Option<Self> {
        let scheme = value.split_whitespace().next()?;
        if scheme.eq_ignore_ascii_case("basic") {
            Some(AuthenticationType::Basic)
        } else if scheme.eq_ignore_ascii_case("bearer") {
            Some(AuthenticationType::Bearer)
        } else {
            None
        }
    }
}

/// Privileges granted to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AccessLevel {
    /// Used when a component does not set an access level explicitly
    #[default]
    Default,
    /// Manage global resources not scoped to a tenant
    Global,
    /// Manage the caller's own tenant resources
    Tenant,
    /// Manage the resources of all tenants
    AllTenant,
}

impl std::str::FromStr for AccessLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default" => Ok(AccessLevel::Default),
            "global" => Ok(AccessLevel::Global),
            "tenant" => Ok(AccessLevel::Tenant),
            "all_tenant" | "alltenant" => Ok(AccessLevel::AllTenant),
            _ => Err(format!("Unknown access level: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub name: String,
    pub authentication_type: AuthenticationType,
    pub access_level: AccessLevel,
}

#[derive(Debug, Clone, Default)]
pub struct RequestScope {
    pub correlation_id: String,
    pub user: Option<UserContext>,
    /// Appended to every listing made for this request
    pub criteria: Vec<Criterion>,
}

impl RequestScope {
    /// Scope with a freshly generated correlation id
    pub fn new() -> Self {
        Self::with_correlation_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_correlation_id(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            user: None,
            criteria: Vec::new(),
        }
    }

    pub fn with_user(mut self, user: UserContext) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_criteria(mut self, criteria: Vec<Criterion>) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn user_name(&self) -> &str {
        self.user.as_ref().map(|u| u.name.as_str()).unwrap_or("anonymous")
    }
}
