//! Authorization guard middleware.
//! Resolves the tenant and user for `/v1` routes and enforces membership.

use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::{
    body::{Body, Bytes},
    extract::{FromRequestParts, RawPathParams, State},
    http::{header, request::Parts, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::Value;

use crate::context::{self, ScopeKey};
use crate::http::middleware::context::header_value;
use crate::http::response::{error_response, PAYLOAD_TOO_LARGE};
use crate::observability::metrics;
use crate::security::access_control::{authorize, AuthorizationPolicy, IdentitySources, Principal};

pub const X_ORG_ID: &str = "x-org-id";
pub const X_USER_ID: &str = "x-user-id";
pub const X_ORG_MEMBERSHIPS: &str = "x-org-memberships";

const ORG_ROUTE_PARAMS: [&str; 2] = ["orgId", "org_id"];
const ORG_BODY_FIELDS: [&str; 2] = ["orgId", "org_id"];

/// Guard state shared by every request.
#[derive(Clone)]
pub struct AuthzState {
    pub policy: Arc<ArcSwap<AuthorizationPolicy>>,
    pub max_body_scan_bytes: usize,
}

impl AuthzState {
    pub fn new(policy: AuthorizationPolicy, max_body_scan_bytes: usize) -> Self {
        Self {
            policy: Arc::new(ArcSwap::from_pointee(policy)),
            max_body_scan_bytes,
        }
    }

    pub fn update_policy(&self, policy: AuthorizationPolicy) {
        tracing::info!(minimum_role = %policy.minimum_role, "Authorization policy updated");
        self.policy.store(Arc::new(policy));
    }
}

pub async fn authorization_middleware(
    State(state): State<AuthzState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let (mut parts, body) = req.into_parts();

    let route_org = route_org_param(&mut parts).await;
    let needs_body = header_value(&parts.headers, X_ORG_ID).is_none()
        && route_org.as_deref().and_then(context::ids::non_empty).is_none()
        && is_json(&parts);

    let (body, body_org) = if needs_body {
        match scan_body_for_org(body, state.max_body_scan_bytes).await {
            Ok(scanned) => scanned,
            Err(response) => return response,
        }
    } else {
        (body, None)
    };

    let result = {
        let sources = IdentitySources {
            org_header: header_value(&parts.headers, X_ORG_ID),
            org_route_param: route_org.as_deref(),
            org_body_field: body_org.as_deref(),
            user_header: header_value(&parts.headers, X_USER_ID),
            principal: parts.extensions.get::<Principal>(),
            memberships: header_value(&parts.headers, X_ORG_MEMBERSHIPS),
        };
        authorize(&sources, &state.policy.load())
    };

    match result {
        Ok(org) => {
            if let Err(e) = context::set(ScopeKey::OrgId, &org.org_id)
                .and_then(|()| context::set(ScopeKey::UserId, &org.user_id))
            {
                tracing::debug!(error = %e, "Identity not published to request scope");
            }
            let span = tracing::Span::current();
            span.record("org_id", org.org_id.as_str());
            span.record("user_id", org.user_id.as_str());
            tracing::debug!(role = %org.role, "Request authorized");

            parts.extensions.insert(org);
            next.run(Request::from_parts(parts, body)).await
        }
        Err(e) => {
            tracing::info!(code = e.code(), error = %e, "Request rejected by authorization guard");
            metrics::record_authz_rejection(e.code());
            e.into_response()
        }
    }
}

async fn route_org_param(parts: &mut Parts) -> Option<String> {
    let params = RawPathParams::from_request_parts(parts, &()).await.ok()?;
    params
        .iter()
        .find(|(name, _)| ORG_ROUTE_PARAMS.contains(name))
        .map(|(_, value)| value.to_string())
}

fn is_json(parts: &Parts) -> bool {
    parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("json"))
}

/// Buffer the body, pull an org id field out of it and hand back a body
/// the handler can still read.
async fn scan_body_for_org(body: Body, limit: usize) -> Result<(Body, Option<String>), Response> {
    let bytes: Bytes = axum::body::to_bytes(body, limit).await.map_err(|e| {
        tracing::info!(error = %e, limit, "Request body too large to scan for org id");
        error_response(StatusCode::PAYLOAD_TOO_LARGE, PAYLOAD_TOO_LARGE)
    })?;
    let org = org_from_json(&bytes);
    Ok((Body::from(bytes), org))
}

fn org_from_json(bytes: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    ORG_BODY_FIELDS
        .iter()
        .find_map(|field| value.get(field).and_then(Value::as_str))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_org_from_json_fields() {
        assert_eq!(org_from_json(br#"{"orgId":"acme"}"#), Some("acme".to_string()));
        assert_eq!(org_from_json(br#"{"org_id":"beta"}"#), Some("beta".to_string()));
        assert_eq!(org_from_json(br#"{"orgId":7}"#), None);
        assert_eq!(org_from_json(br#"["acme"]"#), None);
        assert_eq!(org_from_json(b"not json"), None);
    }

    #[tokio::test]
    async fn test_scan_keeps_body_readable() {
        let (body, org) = scan_body_for_org(Body::from(r#"{"orgId":"acme","n":1}"#), 1024)
            .await
            .unwrap();
        assert_eq!(org.as_deref(), Some("acme"));
        let bytes = axum::body::to_bytes(body, 1024).await.unwrap();
        assert_eq!(&bytes[..], br#"{"orgId":"acme","n":1}"#);
    }

    #[tokio::test]
    async fn test_scan_rejects_oversized_body() {
        let response = scan_body_for_org(Body::from(vec![b' '; 64]), 16).await.unwrap_err();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
