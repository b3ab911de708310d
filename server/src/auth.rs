//! The surface the gateway requires of its authentication middleware: turn
//! an upgraded request's headers into a stable principal identifier before
//! the connection handler starts. Token minting/validation, allowlists and
//! OAuth live outside this repo; any middleware that can resolve a bearer
//! token to a principal id satisfies this contract.

use axum::http::HeaderMap;

/// Resolve the authenticated principal for a request. `None` means the
/// request is unauthenticated; with auth disabled that is every request,
/// and session owners are stored as the empty string.
pub trait PrincipalResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Option<String>;
}

/// No-op resolver for gateways running without authentication.
pub struct NoAuth;

impl PrincipalResolver for NoAuth {
    fn resolve(&self, _headers: &HeaderMap) -> Option<String> {
        None
    }
}

/// Resolver backed by a caller-supplied validation function, e.g. a JWT
/// service's "verify and extract subject". Keeps the crypto outside the
/// gateway while letting deployments plug real tokens in.
pub struct BearerResolver<F> {
    validate: F,
}

impl<F> BearerResolver<F>
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    pub fn new(validate: F) -> Self {
        Self { validate }
    }
}

impl<F> PrincipalResolver for BearerResolver<F>
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn resolve(&self, headers: &HeaderMap) -> Option<String> {
        let value = headers.get(axum::http::header::AUTHORIZATION)?;
        let token = value.to_str().ok()?.strip_prefix("Bearer ")?;
        (self.validate)(token)
    }
}
