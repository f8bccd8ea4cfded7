//! Authentication hook.
//!
//! Hearth does not authenticate anyone itself. The node calls an
//! [`Authenticator`] with the name and password from `LOGIN_REQUEST` and
//! binds the returned [`Identity`] to the new session.

use crate::{Identity, SessionError};

/// Validates client credentials.
///
/// Called from the connection's read task, so implementations may await
/// network I/O. Failures are reported to the client as a generic
/// `LOGIN_FAILURE`; the error detail only reaches the logs.
///
/// # Example
///
/// ```rust
/// use hearth_session::{Authenticator, Identity, SessionError};
///
/// /// Accepts anyone whose password equals their name reversed.
/// struct MirrorAuthenticator;
///
/// impl Authenticator for MirrorAuthenticator {
///     async fn authenticate(
///         &self,
///         name: &str,
///         password: &str,
///     ) -> Result<Identity, SessionError> {
///         let expected: String = name.chars().rev().collect();
///         if password == expected {
///             Ok(Identity::new(name))
///         } else {
///             Err(SessionError::AuthFailed("bad password".into()))
///         }
///     }
/// }
/// ```
pub trait Authenticator: Send + Sync + 'static {
    /// Returns the identity for `name` if `password` is accepted.
    fn authenticate(
        &self,
        name: &str,
        password: &str,
    ) -> impl std::future::Future<Output = Result<Identity, SessionError>> + Send;
}
