use std::future::Future;

use crate::error::Error;
use crate::types::{ApiKey, RegisterRequest, SessionEnvelope, Token};

/// Backend operations the session controller depends on.
///
/// [`HttpApiClient`](crate::HttpApiClient) is the production implementation.
/// The credential setters are called only by the controller, which keeps
/// them in step with persisted storage.
///
/// # Example
///
/// ```rust,ignore
/// impl SessionApi for OfflineApi {
///     async fn session_state(&self) -> Result<SessionEnvelope, Error> {
///         Err(Error::Api { operation: "session state", status: Some(503), detail: "offline".into() })
///     }
///     // ...
/// }
/// ```
pub trait SessionApi: Send + Sync + 'static {
    /// `POST /session/login`.
    fn login(
        &self,
        username: &str,
        password: &str,
    ) -> impl Future<Output = Result<SessionEnvelope, Error>> + Send;

    /// `POST /session/register`.
    fn register(
        &self,
        payload: &RegisterRequest,
    ) -> impl Future<Output = Result<SessionEnvelope, Error>> + Send;

    /// `GET /session/state`, authenticated with the current credentials.
    fn session_state(&self) -> impl Future<Output = Result<SessionEnvelope, Error>> + Send;

    /// `POST /session/logout`.
    fn logout(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Replace (or drop, with `None`) the bearer token sent on requests.
    fn set_token(&self, token: Option<&Token>);

    /// Replace (or drop, with `None`) the API key sent on requests.
    fn set_api_key(&self, api_key: Option<&ApiKey>);

    /// Drop every credential.
    fn clear_auth(&self);
}
