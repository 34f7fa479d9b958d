//! Tenant authorization.
//!
//! A request moves through `Unresolved → OrgResolved → Authorized` or ends
//! in `Rejected`. Identity comes from headers first, then from the route
//! or body, and membership is read from a header-encoded claim of
//! `orgId:ROLE` pairs. Every rejection is terminal.

use std::collections::HashMap;

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

/// Roles in ascending order of privilege.
pub const DEFAULT_ROLE_HIERARCHY: [&str; 4] = ["STAFF", "MANAGER", "PARTNER", "SYSTEM_ADMIN"];

/// Ordered role hierarchy; later entries outrank earlier ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct RoleHierarchy(Vec<String>);

impl RoleHierarchy {
    pub fn new<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(roles.into_iter().map(|r| normalize_role(r.as_ref())).collect())
    }

    pub fn rank(&self, role: &str) -> Option<usize> {
        self.0.iter().position(|r| r == role)
    }

    pub fn contains(&self, role: &str) -> bool {
        self.rank(role).is_some()
    }

    pub fn roles(&self) -> &[String] {
        &self.0
    }

    /// Does `role` meet `minimum`?
    ///
    /// Known roles compare by rank. A role outside the hierarchy passes only
    /// when it is exactly the required role.
    pub fn satisfies(&self, role: &str, minimum: &str) -> bool {
        match (self.rank(role), self.rank(minimum)) {
            (Some(have), Some(need)) => have >= need,
            (Some(_), None) => true,
            (None, _) => role == minimum,
        }
    }
}

impl Default for RoleHierarchy {
    fn default() -> Self {
        Self::new(DEFAULT_ROLE_HIERARCHY)
    }
}

impl From<Vec<String>> for RoleHierarchy {
    fn from(roles: Vec<String>) -> Self {
        Self::new(roles)
    }
}

impl From<RoleHierarchy> for Vec<String> {
    fn from(hierarchy: RoleHierarchy) -> Self {
        hierarchy.0
    }
}

pub fn normalize_role(role: &str) -> String {
    role.trim().to_uppercase()
}

/// Policy applied by the guard. Swapped atomically on config reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationPolicy {
    pub minimum_role: String,
    pub hierarchy: RoleHierarchy,
}

impl AuthorizationPolicy {
    pub fn new(minimum_role: &str, hierarchy: RoleHierarchy) -> Self {
        Self {
            minimum_role: normalize_role(minimum_role),
            hierarchy,
        }
    }
}

impl Default for AuthorizationPolicy {
    fn default() -> Self {
        Self::new("STAFF", RoleHierarchy::default())
    }
}

/// Identity established for an authorized request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgContext {
    pub org_id: String,
    pub user_id: String,
    pub role: String,
}

/// Identity forwarded by an upstream authenticator, if one ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
}

/// Candidate identity values gathered from one request.
#[derive(Debug, Clone, Default)]
pub struct IdentitySources<'a> {
    pub org_header: Option<&'a str>,
    pub org_route_param: Option<&'a str>,
    pub org_body_field: Option<&'a str>,
    pub user_header: Option<&'a str>,
    pub principal: Option<&'a Principal>,
    pub memberships: Option<&'a str>,
}

/// Terminal authorization failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthzError {
    #[error("org id missing")]
    OrgIdMissing,

    #[error("user not authenticated")]
    UserNotAuthenticated,

    #[error("access to org {0} denied")]
    AccessDenied(String),

    #[error("role {role} does not meet {required}")]
    InsufficientRole { role: String, required: String },
}

impl AuthzError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthzError::OrgIdMissing => "org_id_missing",
            AuthzError::UserNotAuthenticated => "user_not_authenticated",
            AuthzError::AccessDenied(_) => "org_access_denied",
            AuthzError::InsufficientRole { .. } => "insufficient_role",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthzError::OrgIdMissing => StatusCode::BAD_REQUEST,
            AuthzError::UserNotAuthenticated => StatusCode::UNAUTHORIZED,
            AuthzError::AccessDenied(_) | AuthzError::InsufficientRole { .. } => {
                StatusCode::FORBIDDEN
            }
        }
    }
}

/// Progress of the guard through a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardState {
    Unresolved,
    OrgResolved { org_id: String },
    Authorized(OrgContext),
    Rejected(AuthzError),
}

/// Parse `orgId:ROLE` pairs separated by `;` or `,`.
///
/// Malformed pairs are skipped. A later pair for the same org replaces an
/// earlier one.
pub fn parse_memberships(raw: &str) -> HashMap<String, String> {
    raw.split([';', ','])
        .filter_map(|pair| {
            let (org, role) = pair.split_once(':')?;
            let org = org.trim();
            let role = normalize_role(role);
            (!org.is_empty() && !role.is_empty()).then(|| (org.to_string(), role))
        })
        .collect()
}

fn first_present<'a>(candidates: &[Option<&'a str>]) -> Option<&'a str> {
    candidates
        .iter()
        .copied()
        .flatten()
        .map(str::trim)
        .find(|v| !v.is_empty())
}

/// Run the guard to completion.
pub fn authorize(
    sources: &IdentitySources<'_>,
    policy: &AuthorizationPolicy,
) -> Result<OrgContext, AuthzError> {
    let mut state = GuardState::Unresolved;
    loop {
        state = match state {
            GuardState::Unresolved => resolve_org(sources),
            GuardState::OrgResolved { org_id } => check_membership(sources, policy, org_id),
            GuardState::Authorized(ctx) => return Ok(ctx),
            GuardState::Rejected(err) => return Err(err),
        };
    }
}

fn resolve_org(sources: &IdentitySources<'_>) -> GuardState {
    match first_present(&[
        sources.org_header,
        sources.org_route_param,
        sources.org_body_field,
    ]) {
        Some(org_id) => GuardState::OrgResolved {
            org_id: org_id.to_string(),
        },
        None => GuardState::Rejected(AuthzError::OrgIdMissing),
    }
}

fn check_membership(
    sources: &IdentitySources<'_>,
    policy: &AuthorizationPolicy,
    org_id: String,
) -> GuardState {
    let principal = sources.principal.map(|p| p.user_id.as_str());
    let Some(user_id) = first_present(&[sources.user_header, principal]) else {
        return GuardState::Rejected(AuthzError::UserNotAuthenticated);
    };

    let memberships = sources.memberships.map(parse_memberships).unwrap_or_default();
    let Some(role) = memberships.get(&org_id) else {
        return GuardState::Rejected(AuthzError::AccessDenied(org_id));
    };

    if !policy.hierarchy.satisfies(role, &policy.minimum_role) {
        return GuardState::Rejected(AuthzError::InsufficientRole {
            role: role.clone(),
            required: policy.minimum_role.clone(),
        });
    }

    GuardState::Authorized(OrgContext {
        org_id,
        user_id: user_id.to_string(),
        role: role.clone(),
    })
}
