//! Access control for the MCP HTTP transport.
//!
//! Three auth modes, resolved at startup:
//! - `Open`: no credential required (stdio-equivalent trust, localhost dev).
//! - `SharedToken`: a pre-shared bearer token, compared in constant time.
//!   Configured via `WEBSEARCH_AUTH_TOKEN`.
//! - `Issuer`: OAuth bearer tokens. The middleware enforces token structure
//!   and claims (issuer, audience, expiry); cryptographic signature
//!   verification against the issuer's JWKS is an external collaborator.
//!
//! Also here: the RFC 9728 protected-resource-metadata endpoint the OAuth
//! flow discovers the issuer through, and the Origin allowlist middleware
//! that blocks DNS-rebinding attacks on browser clients.

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;

use crate::types::McpAppContext;

// ---------------------------------------------------------------------------
// Auth mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum AuthMode {
    Open,
    SharedToken { token: String },
    Issuer { issuer: String },
}

impl AuthMode {
    /// An OAuth issuer outranks a shared token; with neither, the transport
    /// is open.
    pub fn resolve(issuer: Option<String>, shared_token: Option<String>) -> Self {
        match (issuer, shared_token) {
            (Some(issuer), _) => AuthMode::Issuer { issuer },
            (None, Some(token)) if !token.is_empty() => AuthMode::SharedToken { token },
            _ => AuthMode::Open,
        }
    }

    pub fn requires_credentials(&self) -> bool {
        !matches!(self, AuthMode::Open)
    }

    fn issuer(&self) -> Option<&str> {
        match self {
            AuthMode::Issuer { issuer } => Some(issuer),
            _ => None,
        }
    }
}

/// Why a presented credential was rejected. The variant feeds the RFC 6750
/// `error_description` so clients can tell a stale token from a wrong one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerRejection {
    Missing,
    Malformed,
    WrongToken,
    WrongIssuer,
    WrongAudience,
    Expired,
}

impl BearerRejection {
    fn description(&self) -> &'static str {
        match self {
            BearerRejection::Missing => "missing bearer token",
            BearerRejection::Malformed => "token is not well formed",
            BearerRejection::WrongToken => "token does not match",
            BearerRejection::WrongIssuer => "token issuer is not trusted",
            BearerRejection::WrongAudience => "token audience does not cover this server",
            BearerRejection::Expired => "token has expired",
        }
    }
}

// ---------------------------------------------------------------------------
// Credential checks (pure)
// ---------------------------------------------------------------------------

/// Check a presented bearer token against the configured mode.
///
/// `now_secs` is passed in so expiry is testable; `server_url` is the
/// expected audience in issuer mode.
pub fn check_bearer(
    mode: &AuthMode,
    token: &str,
    server_url: &str,
    now_secs: u64,
) -> Result<(), BearerRejection> {
    match mode {
        AuthMode::Open => Ok(()),
        AuthMode::SharedToken { token: expected } => {
            if constant_time_eq(expected.as_bytes(), token.as_bytes()) {
                Ok(())
            } else {
                Err(BearerRejection::WrongToken)
            }
        }
        AuthMode::Issuer { issuer } => check_jwt_claims(token, issuer, server_url, now_secs),
    }
}

/// Length-guarded constant-time byte comparison. The length check leaks only
/// the token length, which the attacker already knows.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Deserialize)]
struct JwtClaims {
    iss: Option<String>,
    exp: Option<u64>,
    aud: Option<serde_json::Value>,
}

/// Structural JWT validation: shape, issuer, audience, expiry.
///
/// Signature verification against the issuer's JWKS happens upstream of this
/// server; a token that passes here has the right claims, not a proven
/// provenance.
fn check_jwt_claims(
    token: &str,
    issuer: &str,
    server_url: &str,
    now_secs: u64,
) -> Result<(), BearerRejection> {
    let mut segments = token.split('.');
    let (Some(_header), Some(payload), Some(signature)) =
        (segments.next(), segments.next(), segments.next())
    else {
        return Err(BearerRejection::Malformed);
    };
    if segments.next().is_some() || signature.is_empty() {
        return Err(BearerRejection::Malformed);
    }

    let claims_bytes =
        URL_SAFE_NO_PAD.decode(payload).map_err(|_| BearerRejection::Malformed)?;
    let claims: JwtClaims =
        serde_json::from_slice(&claims_bytes).map_err(|_| BearerRejection::Malformed)?;

    match claims.iss.as_deref() {
        Some(iss) if iss.trim_end_matches('/') == issuer.trim_end_matches('/') => {}
        _ => return Err(BearerRejection::WrongIssuer),
    }

    if let Some(aud) = &claims.aud {
        if !audience_covers(aud, server_url) {
            return Err(BearerRejection::WrongAudience);
        }
    }

    match claims.exp {
        Some(exp) if exp > now_secs => Ok(()),
        Some(_) => Err(BearerRejection::Expired),
        // No expiry claim: treat as malformed rather than immortal.
        None => Err(BearerRejection::Malformed),
    }
}

/// `aud` may be a single string or an array of strings.
fn audience_covers(aud: &serde_json::Value, server_url: &str) -> bool {
    let matches = |v: &serde_json::Value| {
        v.as_str().is_some_and(|a| a.trim_end_matches('/') == server_url.trim_end_matches('/'))
    };
    match aud {
        serde_json::Value::String(_) => matches(aud),
        serde_json::Value::Array(items) => items.iter().any(matches),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Origin policy (pure)
// ---------------------------------------------------------------------------

/// Exact-match Origin allowlist. `"null"` in the allowlist admits the
/// literal `null` origin that file:// and sandboxed contexts send; nothing
/// else is pattern-matched, so a rebinding page on an attacker's domain can
/// never pass.
pub fn origin_allowed(allowed: &[String], origin: &str) -> bool {
    allowed.iter().any(|a| a == origin)
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Origin gate for every transport route.
///
/// Requests without an `Origin` header (CLI and server-side MCP clients)
/// pass; browser requests must match the allowlist exactly.
pub async fn enforce_origin(
    State(ctx): State<McpAppContext>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        if !origin_allowed(&ctx.config.allowed_origins, origin) {
            tracing::warn!(origin = origin, "Rejected request from disallowed origin");
            return Err(StatusCode::FORBIDDEN);
        }
    }
    Ok(next.run(request).await)
}

/// Bearer gate for the `/mcp` routes.
///
/// Failures answer 401 with an RFC 6750 `WWW-Authenticate` challenge whose
/// `resource_metadata` points clients at the PRM endpoint for discovery.
pub async fn require_bearer(
    State(ctx): State<McpAppContext>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, Response> {
    if !ctx.config.auth.requires_credentials() {
        return Ok(next.run(request).await);
    }

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    let outcome = match presented {
        None => Err(BearerRejection::Missing),
        Some(token) => {
            let now_secs = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            check_bearer(&ctx.config.auth, token, &ctx.config.server_url, now_secs)
        }
    };

    match outcome {
        Ok(()) => Ok(next.run(request).await),
        Err(rejection) => {
            tracing::debug!(reason = rejection.description(), "Rejected bearer credential");
            Err(unauthorized(&ctx, rejection))
        }
    }
}

fn unauthorized(ctx: &McpAppContext, rejection: BearerRejection) -> Response {
    let prm_url = format!("{}/.well-known/oauth-protected-resource/mcp", ctx.config.server_url);
    let challenge = match rejection {
        BearerRejection::Missing => format!("Bearer resource_metadata=\"{prm_url}\""),
        _ => format!(
            "Bearer resource_metadata=\"{prm_url}\", error=\"invalid_token\", error_description=\"{}\"",
            rejection.description()
        ),
    };

    let mut response = StatusCode::UNAUTHORIZED.into_response();
    if let Ok(value) = HeaderValue::from_str(&challenge) {
        response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

// ---------------------------------------------------------------------------
// Protected Resource Metadata (RFC 9728)
// ---------------------------------------------------------------------------

/// `GET /.well-known/oauth-protected-resource/mcp`
///
/// Discovery document for the OAuth flow. Served in every mode: an empty
/// `authorization_servers` array tells clients no authorization server is
/// involved (open or shared-token deployments).
pub async fn protected_resource_metadata(State(ctx): State<McpAppContext>) -> impl IntoResponse {
    let auth_servers: Vec<&str> = ctx.config.auth.issuer().into_iter().collect();

    let body = serde_json::json!({
        "resource": ctx.config.server_url,
        "resource_name": "websearch",
        "authorization_servers": auth_servers,
        "bearer_methods_supported": ["header"],
    });

    ([(header::CONTENT_TYPE, "application/json")], serde_json::to_string(&body).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn jwt(payload: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
        format!("{header}.{body}.fakesig")
    }

    const ISSUER: &str = "https://auth.example.com";
    const SERVER: &str = "http://127.0.0.1:8732";
    const NOW: u64 = 1_700_000_000;

    #[test]
    fn resolve_prefers_issuer_over_token() {
        let mode = AuthMode::resolve(Some(ISSUER.into()), Some("secret".into()));
        assert!(matches!(mode, AuthMode::Issuer { .. }));
        let mode = AuthMode::resolve(None, Some("secret".into()));
        assert!(matches!(mode, AuthMode::SharedToken { .. }));
        assert!(!AuthMode::resolve(None, None).requires_credentials());
        // An empty token env var does not lock the transport.
        assert!(!AuthMode::resolve(None, Some(String::new())).requires_credentials());
    }

    #[test]
    fn shared_token_matches_exactly() {
        let mode = AuthMode::SharedToken { token: "s3cret".into() };
        assert!(check_bearer(&mode, "s3cret", SERVER, NOW).is_ok());
        assert_eq!(
            check_bearer(&mode, "s3cres", SERVER, NOW),
            Err(BearerRejection::WrongToken)
        );
        assert_eq!(
            check_bearer(&mode, "s3cret-but-longer", SERVER, NOW),
            Err(BearerRejection::WrongToken)
        );
    }

    #[test]
    fn jwt_with_matching_claims_passes() {
        let mode = AuthMode::Issuer { issuer: ISSUER.into() };
        let token = jwt(json!({ "iss": ISSUER, "aud": SERVER, "exp": NOW + 60 }));
        assert!(check_bearer(&mode, &token, SERVER, NOW).is_ok());
    }

    #[test]
    fn jwt_audience_may_be_an_array() {
        let mode = AuthMode::Issuer { issuer: ISSUER.into() };
        let token = jwt(json!({
            "iss": ISSUER,
            "aud": ["https://other.example", SERVER],
            "exp": NOW + 60,
        }));
        assert!(check_bearer(&mode, &token, SERVER, NOW).is_ok());
    }

    #[test]
    fn jwt_claim_failures_are_distinguished() {
        let mode = AuthMode::Issuer { issuer: ISSUER.into() };

        let wrong_issuer = jwt(json!({ "iss": "https://evil.example", "exp": NOW + 60 }));
        assert_eq!(
            check_bearer(&mode, &wrong_issuer, SERVER, NOW),
            Err(BearerRejection::WrongIssuer)
        );

        let wrong_aud = jwt(json!({ "iss": ISSUER, "aud": "https://other.example", "exp": NOW + 60 }));
        assert_eq!(
            check_bearer(&mode, &wrong_aud, SERVER, NOW),
            Err(BearerRejection::WrongAudience)
        );

        let expired = jwt(json!({ "iss": ISSUER, "aud": SERVER, "exp": NOW - 1 }));
        assert_eq!(check_bearer(&mode, &expired, SERVER, NOW), Err(BearerRejection::Expired));

        let no_expiry = jwt(json!({ "iss": ISSUER, "aud": SERVER }));
        assert_eq!(
            check_bearer(&mode, &no_expiry, SERVER, NOW),
            Err(BearerRejection::Malformed)
        );
    }

    #[test]
    fn jwt_shape_is_enforced() {
        let mode = AuthMode::Issuer { issuer: ISSUER.into() };
        for bad in ["not-a-jwt", "a.b", "a.b.c.d", "a.!!!.c"] {
            assert_eq!(
                check_bearer(&mode, bad, SERVER, NOW),
                Err(BearerRejection::Malformed),
                "accepted {bad}"
            );
        }
    }

    #[test]
    fn trailing_slashes_do_not_break_issuer_or_audience() {
        let mode = AuthMode::Issuer { issuer: format!("{ISSUER}/") };
        let token = jwt(json!({ "iss": ISSUER, "aud": format!("{SERVER}/"), "exp": NOW + 60 }));
        assert!(check_bearer(&mode, &token, SERVER, NOW).is_ok());
    }

    #[test]
    fn origin_allowlist_is_exact() {
        let allowed = vec!["http://localhost:8732".to_string(), "null".to_string()];
        assert!(origin_allowed(&allowed, "http://localhost:8732"));
        assert!(origin_allowed(&allowed, "null"));
        assert!(!origin_allowed(&allowed, "http://localhost:8732.evil.example"));
        assert!(!origin_allowed(&allowed, "http://localhost"));
    }
}
