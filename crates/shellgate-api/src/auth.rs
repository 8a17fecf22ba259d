//! Token authentication
//!
//! Validates the HS512-signed access token carried by every gateway request
//! and turns it into typed [`IdentityClaims`].
//!
//! # Token sources
//!
//! First match wins:
//! 1. `Authorization: Bearer <token>`
//! 2. `Sec-WebSocket-Protocol: bearer, <token>` (browsers cannot set headers
//!    on a WebSocket handshake, so the token rides in the subprotocol list)
//!
//! # Validation order
//!
//! 1. Signature with the shared secret, algorithm pinned to HS512
//! 2. Payload must be a JSON claim set
//! 3. `exp` present, numeric, not in the past
//! 4. `userAuthId` present and non-empty, `userType` a known role

use std::fmt;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Error;
use crate::exec_proxy::ExecPhase;

/// Subprotocol marker that precedes the token in `Sec-WebSocket-Protocol`
pub const BEARER_SUBPROTOCOL: &str = "bearer";

/// Role carried in the `userType` claim
///
/// The role selects which secret path holds the caller's cluster token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Platform-wide administrator, uses the shared cluster token
    SuperAdmin,
    /// Administrator of specific clusters, uses a per-user cluster token
    ClusterAdmin,
    /// Regular user, uses a per-user, per-namespace token
    User,
}

impl Role {
    /// Parse the wire representation of a role
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SUPER_ADMIN" => Some(Role::SuperAdmin),
            "CLUSTER_ADMIN" => Some(Role::ClusterAdmin),
            "USER" => Some(Role::User),
            _ => None,
        }
    }

    /// Wire representation of this role
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SuperAdmin => "SUPER_ADMIN",
            Role::ClusterAdmin => "CLUSTER_ADMIN",
            Role::User => "USER",
        }
    }

    /// Whether this role reads the shared cluster-wide token
    pub fn is_elevated(&self) -> bool {
        matches!(self, Role::SuperAdmin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated identity of the caller
///
/// Only produced by [`TokenValidator`], so every value in circulation has a
/// non-empty subject, a known role and an expiry that was in the future when
/// the request was accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityClaims {
    subject: String,
    role: Role,
    expires_at: DateTime<Utc>,
}

impl IdentityClaims {
    /// Subject identifier (`userAuthId`)
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Caller role (`userType`)
    pub fn role(&self) -> Role {
        self.role
    }

    /// Token expiry
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Authentication failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No token in either supported location
    #[error("missing access token")]
    MissingCredential,

    /// Signature did not verify, or the token was not signed with HS512
    #[error("invalid token signature: {0}")]
    SignatureInvalid(String),

    /// Token is structurally invalid or lacks a usable expiry
    #[error("invalid token: {0}")]
    TokenFailed(String),

    /// Token expiry is in the past
    #[error("token expired")]
    TokenExpired,

    /// Token verified but does not identify a caller with a known role
    #[error("access denied: {0}")]
    AccessDenied(String),
}

impl AuthError {
    /// Machine-readable reason code returned to the client
    pub fn reason_code(&self) -> &'static str {
        match self {
            AuthError::MissingCredential => "MISSING_JWT",
            AuthError::SignatureInvalid(_) | AuthError::TokenFailed(_) => "TOKEN_FAILED",
            AuthError::TokenExpired => "TOKEN_EXPIRED",
            AuthError::AccessDenied(_) => "ApiAccessDenied",
        }
    }
}

/// Claim set as it appears in the token payload
///
/// Fields are kept as raw JSON so an ill-typed claim is reported with the
/// same error as a missing one instead of a generic decode failure.
#[derive(Debug, Deserialize)]
struct RawClaims {
    #[serde(default)]
    exp: Option<Value>,
    #[serde(default, rename = "userAuthId")]
    user_auth_id: Option<Value>,
    #[serde(default, rename = "userType")]
    user_type: Option<Value>,
}

/// HS512 token validator with a pre-shared secret
pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    /// Create a validator for tokens signed with `secret`
    pub fn new(secret: &SecretString) -> Self {
        let mut validation = Validation::new(Algorithm::HS512);
        validation.algorithms = vec![Algorithm::HS512];
        // Expiry is checked by hand below so missing, ill-typed and past
        // values map to distinct errors with no leeway.
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.required_spec_claims.clear();

        Self {
            key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
        }
    }

    /// Extract and validate the token carried by a request
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<IdentityClaims, AuthError> {
        let token = extract_token(headers).ok_or(AuthError::MissingCredential)?;
        self.validate(token)
    }

    /// Validate a raw token against the current time
    pub fn validate(&self, token: &str) -> Result<IdentityClaims, AuthError> {
        self.validate_at(token, Utc::now())
    }

    /// Validate a raw token as of `now`
    pub fn validate_at(&self, token: &str, now: DateTime<Utc>) -> Result<IdentityClaims, AuthError> {
        let data = decode::<RawClaims>(token, &self.key, &self.validation).map_err(classify)?;
        let claims = data.claims;

        let exp = claims
            .exp
            .as_ref()
            .and_then(Value::as_f64)
            .ok_or_else(|| AuthError::TokenFailed("missing or non-numeric exp claim".into()))?;
        // Fractional seconds are truncated
        let exp = exp as i64;
        if exp < now.timestamp() {
            return Err(AuthError::TokenExpired);
        }
        let expires_at = DateTime::from_timestamp(exp, 0)
            .ok_or_else(|| AuthError::TokenFailed("exp claim out of range".into()))?;

        let subject = match claims.user_auth_id {
            Some(Value::String(s)) if !s.is_empty() => s,
            _ => return Err(AuthError::AccessDenied("missing userAuthId claim".into())),
        };

        let role = claims
            .user_type
            .as_ref()
            .and_then(Value::as_str)
            .and_then(Role::parse)
            .ok_or_else(|| AuthError::AccessDenied("missing or unknown userType claim".into()))?;

        debug!(user = %subject, role = %role, "Validated access token");

        Ok(IdentityClaims {
            subject,
            role,
            expires_at,
        })
    }
}

/// Map a jsonwebtoken failure onto the gateway's taxonomy
fn classify(e: jsonwebtoken::errors::Error) -> AuthError {
    match e.kind() {
        ErrorKind::InvalidSignature
        | ErrorKind::InvalidAlgorithm
        | ErrorKind::InvalidAlgorithmName
        | ErrorKind::InvalidKeyFormat => AuthError::SignatureInvalid(e.to_string()),
        _ => AuthError::TokenFailed(e.to_string()),
    }
}

/// Extract Bearer token from Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Extract the token from a `Sec-WebSocket-Protocol: bearer, <token>` header
///
/// The header must hold exactly two comma-separated entries, the first of
/// which is the `bearer` marker.
pub fn extract_subprotocol_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(SEC_WEBSOCKET_PROTOCOL)?.to_str().ok()?;
    let mut parts = value.split(',');
    let marker = parts.next()?;
    let token = parts.next()?;
    if parts.next().is_some() || marker.trim() != BEARER_SUBPROTOCOL {
        return None;
    }
    Some(token.trim()).filter(|t| !t.is_empty())
}

/// Extract the access token from whichever supported location carries it
pub fn extract_token(headers: &HeaderMap) -> Option<&str> {
    extract_bearer_token(headers).or_else(|| extract_subprotocol_token(headers))
}

/// Middleware that authenticates the request and attaches [`IdentityClaims`]
///
/// Requests that fail authentication are answered with 401 and never reach
/// the handler.
pub async fn require_identity(
    State(validator): State<Arc<TokenValidator>>,
    mut request: Request,
    next: Next,
) -> Response {
    match validator.authenticate(request.headers()) {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(e) => {
            warn!(
                path = %request.uri().path(),
                reason = e.reason_code(),
                phase = %ExecPhase::Unauthenticated,
                error = %e,
                "Rejected unauthenticated request"
            );
            Error::Unauthorized(e).into_response()
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use axum::routing::get;
    use axum::{Extension, Router};
    use serde_json::json;
    use tower::ServiceExt;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, value.parse().unwrap());
        }
        headers
    }

    fn future_exp() -> i64 {
        Utc::now().timestamp() + 3600
    }

    // ========================================================================
    // Token extraction
    // ========================================================================

    #[test]
    fn test_extract_bearer_token() {
        let headers = headers(&[("authorization", "Bearer abc123")]);
        assert_eq!(extract_token(&headers), Some("abc123"));
    }

    #[test]
    fn test_extract_bearer_token_wrong_scheme() {
        let headers = headers(&[("authorization", "Basic abc123")]);
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn test_extract_subprotocol_token() {
        let headers = headers(&[("sec-websocket-protocol", "bearer, abc123")]);
        assert_eq!(extract_token(&headers), Some("abc123"));
    }

    #[test]
    fn test_authorization_header_wins_over_subprotocol() {
        let headers = headers(&[
            ("authorization", "Bearer from-header"),
            ("sec-websocket-protocol", "bearer, from-protocol"),
        ]);
        assert_eq!(extract_token(&headers), Some("from-header"));
    }

    #[test]
    fn test_non_bearer_authorization_falls_back_to_subprotocol() {
        let headers = headers(&[
            ("authorization", "Basic dXNlcjpwYXNz"),
            ("sec-websocket-protocol", "bearer, from-protocol"),
        ]);
        assert_eq!(extract_token(&headers), Some("from-protocol"));
    }

    #[test]
    fn test_subprotocol_requires_exactly_two_entries() {
        let headers = headers(&[("sec-websocket-protocol", "bearer, abc, extra")]);
        assert_eq!(extract_token(&headers), None);

        let headers = headers_single("bearer");
        assert_eq!(extract_token(&headers), None);
    }

    fn headers_single(value: &str) -> HeaderMap {
        headers(&[("sec-websocket-protocol", value)])
    }

    #[test]
    fn test_subprotocol_requires_bearer_marker() {
        let headers = headers_single("v4.channel.k8s.io, abc123");
        assert_eq!(extract_token(&headers), None);
    }

    #[test]
    fn test_subprotocol_empty_token() {
        let headers = headers_single("bearer,   ");
        assert_eq!(extract_token(&headers), None);
    }

    #[test]
    fn test_missing_credential() {
        let validator = test_validator();
        let err = validator.authenticate(&HeaderMap::new()).unwrap_err();
        assert_eq!(err, AuthError::MissingCredential);
        assert_eq!(err.reason_code(), "MISSING_JWT");
    }

    // ========================================================================
    // Validation
    // ========================================================================

    #[test]
    fn test_valid_token_yields_typed_claims() {
        let validator = test_validator();
        let exp = future_exp();
        let token = sign(&json!({"userAuthId": "user-1", "userType": "CLUSTER_ADMIN", "exp": exp}));

        let claims = validator.validate(&token).unwrap();

        assert_eq!(claims.subject(), "user-1");
        assert_eq!(claims.role(), Role::ClusterAdmin);
        assert_eq!(claims.expires_at().timestamp(), exp);
    }

    #[test]
    fn test_other_algorithms_are_rejected() {
        let validator = test_validator();
        let claims = json!({"userAuthId": "user-1", "userType": "USER", "exp": future_exp()});

        for alg in [Algorithm::HS256, Algorithm::HS384] {
            let token = sign_with(alg, TEST_SECRET, &claims);
            let err = validator.validate(&token).unwrap_err();
            assert!(
                matches!(err, AuthError::SignatureInvalid(_)),
                "{alg:?} should be rejected, got {err:?}"
            );
            assert_eq!(err.reason_code(), "TOKEN_FAILED");
        }
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let validator = test_validator();
        let claims = json!({"userAuthId": "user-1", "userType": "USER", "exp": future_exp()});
        let token = sign_with(
            Algorithm::HS512,
            "a-different-secret-key-that-is-very-long-and-secure",
            &claims,
        );

        assert!(matches!(
            validator.validate(&token),
            Err(AuthError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_garbage_token_fails() {
        let validator = test_validator();
        let err = validator.validate("not.a.jwt").unwrap_err();
        assert!(matches!(err, AuthError::TokenFailed(_)));
    }

    #[test]
    fn test_non_object_payload_fails() {
        let validator = test_validator();
        let token = sign(&json!("just a string"));
        assert!(matches!(
            validator.validate(&token),
            Err(AuthError::TokenFailed(_))
        ));
    }

    #[test]
    fn test_expired_token() {
        let validator = test_validator();
        let token = sign(&json!({
            "userAuthId": "user-1",
            "userType": "USER",
            "exp": Utc::now().timestamp() - 3600,
        }));

        let err = validator.validate(&token).unwrap_err();
        assert_eq!(err, AuthError::TokenExpired);
        assert_eq!(err.reason_code(), "TOKEN_EXPIRED");
    }

    #[test]
    fn test_expiry_boundary_has_no_leeway() {
        let validator = test_validator();
        let now = Utc::now();
        let at_now = sign(&json!({"userAuthId": "u", "userType": "USER", "exp": now.timestamp()}));
        let just_past =
            sign(&json!({"userAuthId": "u", "userType": "USER", "exp": now.timestamp() - 1}));

        assert!(validator.validate_at(&at_now, now).is_ok());
        assert_eq!(
            validator.validate_at(&just_past, now).unwrap_err(),
            AuthError::TokenExpired
        );
    }

    #[test]
    fn test_missing_exp_fails() {
        let validator = test_validator();
        let token = sign(&json!({"userAuthId": "user-1", "userType": "USER"}));
        assert!(matches!(
            validator.validate(&token),
            Err(AuthError::TokenFailed(_))
        ));
    }

    #[test]
    fn test_string_exp_fails() {
        let validator = test_validator();
        let token = sign(&json!({"userAuthId": "user-1", "userType": "USER", "exp": "tomorrow"}));
        assert!(matches!(
            validator.validate(&token),
            Err(AuthError::TokenFailed(_))
        ));
    }

    #[test]
    fn test_missing_subject_is_access_denied() {
        let validator = test_validator();
        let token = sign(&json!({"userType": "USER", "exp": future_exp()}));

        let err = validator.validate(&token).unwrap_err();
        assert!(matches!(err, AuthError::AccessDenied(_)));
        assert_eq!(err.reason_code(), "ApiAccessDenied");
    }

    #[test]
    fn test_empty_or_non_string_subject_is_access_denied() {
        let validator = test_validator();
        for subject in [json!(""), json!(42), json!(null)] {
            let token = sign(&json!({"userAuthId": subject, "userType": "USER", "exp": future_exp()}));
            assert!(matches!(
                validator.validate(&token),
                Err(AuthError::AccessDenied(_))
            ));
        }
    }

    #[test]
    fn test_unknown_role_is_access_denied() {
        let validator = test_validator();
        let token = sign(&json!({"userAuthId": "user-1", "userType": "ROOT", "exp": future_exp()}));
        assert!(matches!(
            validator.validate(&token),
            Err(AuthError::AccessDenied(_))
        ));
    }

    #[test]
    fn test_expired_check_runs_before_subject_check() {
        let validator = test_validator();
        let token = sign(&json!({"exp": Utc::now().timestamp() - 10}));
        assert_eq!(validator.validate(&token).unwrap_err(), AuthError::TokenExpired);
    }

    #[test]
    fn test_role_round_trip() {
        for role in [Role::SuperAdmin, Role::ClusterAdmin, Role::User] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert!(Role::SuperAdmin.is_elevated());
        assert!(!Role::ClusterAdmin.is_elevated());
        assert!(!Role::User.is_elevated());
    }

    // ========================================================================
    // Middleware
    // ========================================================================

    fn protected_router() -> Router {
        let validator = Arc::new(test_validator());
        Router::new()
            .route(
                "/whoami",
                get(|Extension(identity): Extension<IdentityClaims>| async move {
                    format!("{}:{}", identity.subject(), identity.role())
                }),
            )
            .layer(axum::middleware::from_fn_with_state(
                validator,
                require_identity,
            ))
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_middleware_rejects_missing_token() {
        let response = protected_router()
            .oneshot(HttpRequest::get("/whoami").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_string(response).await, "\"MISSING_JWT\"");
    }

    #[tokio::test]
    async fn test_middleware_rejects_expired_token() {
        let token = sign(&json!({
            "userAuthId": "user-1",
            "userType": "USER",
            "exp": Utc::now().timestamp() - 60,
        }));
        let response = protected_router()
            .oneshot(
                HttpRequest::get("/whoami")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_string(response).await, "\"TOKEN_EXPIRED\"");
    }

    #[tokio::test]
    async fn test_middleware_attaches_identity() {
        let token = token_for("user-7", "SUPER_ADMIN");
        let response = protected_router()
            .oneshot(
                HttpRequest::get("/whoami")
                    .header("sec-websocket-protocol", format!("bearer, {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "user-7:SUPER_ADMIN");
    }
}
