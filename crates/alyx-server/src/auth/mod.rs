pub mod jwt;
pub mod limiter;
pub mod password;
pub mod routes;

pub use jwt::{AccessClaims, JwtKeys};
pub use limiter::RateLimiter;

/// Extractor for the verified claims the auth middleware put into
/// request extensions. `None` means the caller is anonymous: a
/// present-but-invalid token was already rejected with 401 before any
/// handler ran.
pub struct OptionalAuth(pub Option<AccessClaims>);

impl<S> axum::extract::FromRequestParts<S> for OptionalAuth
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        Ok(OptionalAuth(parts.extensions.get::<AccessClaims>().cloned()))
    }
}

/// A hook point that may veto a signup before the user row exists.
///
/// The default allows everything; deployments wire their own gate in
/// where registration must be fenced (invite lists, domain checks).
pub trait SignupGate: Send + Sync {
    /// Returns the rejection message when the signup must not proceed.
    fn allow_signup(&self, email: &str) -> Result<(), String>;
}

/// The default gate: every signup passes.
pub struct OpenSignup;

impl SignupGate for OpenSignup {
    fn allow_signup(&self, _email: &str) -> Result<(), String> {
        Ok(())
    }
}
