//! Token Supplier Port
//!
//! Source of credentials for the authentication interceptor.

/// Produces the current credential.
///
/// Token issuance and refresh happen outside this crate; the interceptor
/// asks for a token on every request.
pub trait TokenSupplier: Send + Sync {
    fn token(&self) -> String;
}

impl<F> TokenSupplier for F
where
    F: Fn() -> String + Send + Sync,
{
    fn token(&self) -> String {
        self()
    }
}
