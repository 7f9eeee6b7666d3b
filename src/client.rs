use parking_lot::RwLock;
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::api::SessionApi;
use crate::config::ClientConfig;
use crate::error::Error;
use crate::types::{ApiKey, ApiKeyRecord, RegisterRequest, SessionEnvelope, Token};

const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Default)]
struct Credentials {
    token: Option<Token>,
    api_key: Option<ApiKey>,
}

/// REST client for the console backend.
///
/// Requests carry `Authorization: Bearer <token>` when a token is held,
/// otherwise `X-API-Key` when an API key is held. Credentials live in
/// memory only; persisting them is the session controller's job.
pub struct HttpApiClient {
    config: ClientConfig,
    http: reqwest::Client,
    credentials: RwLock<Credentials>,
}

#[derive(Deserialize)]
struct RotatedKey {
    api_key: ApiKey,
}

impl HttpApiClient {
    /// Create a client with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the TLS backend cannot be initialized.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            config,
            http,
            credentials: RwLock::new(Credentials::default()),
        })
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether a token or API key will be sent.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        let creds = self.credentials.read();
        creds.token.is_some() || creds.api_key.is_some()
    }

    /// Create an API key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] on network failure, or [`Error::Api`] if the
    /// backend rejects the request.
    pub async fn create_api_key(
        &self,
        name: Option<&str>,
        rate_limit: Option<u32>,
    ) -> Result<ApiKeyRecord, Error> {
        let body = serde_json::json!({ "name": name, "rate_limit": rate_limit });
        let request = self
            .http
            .post(self.config.endpoint("session/api-keys")?)
            .json(&body);
        self.send_json(request, "create api key").await
    }

    /// List the account's API keys.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] on network failure, or [`Error::Api`] if the
    /// backend rejects the request.
    pub async fn list_api_keys(&self) -> Result<Vec<ApiKeyRecord>, Error> {
        let request = self.http.get(self.config.endpoint("session/api-keys")?);
        self.send_json(request, "list api keys").await
    }

    /// Rotate an API key, returning the replacement secret.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] on network failure, or [`Error::Api`] if the
    /// backend rejects the request.
    pub async fn rotate_api_key(&self, key_id: i64) -> Result<ApiKey, Error> {
        let request = self
            .http
            .put(self.config.endpoint(&format!("session/api-keys/{key_id}"))?);
        let rotated: RotatedKey = self.send_json(request, "rotate api key").await?;
        Ok(rotated.api_key)
    }

    /// Delete an API key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] on network failure, or [`Error::Api`] if the
    /// backend rejects the request.
    pub async fn delete_api_key(&self, key_id: i64) -> Result<(), Error> {
        let request = self
            .http
            .delete(self.config.endpoint(&format!("session/api-keys/{key_id}"))?);
        self.send(request, "delete api key").await.map(drop)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let creds = self.credentials.read();
        if let Some(token) = &creds.token {
            request.bearer_auth(token.as_str())
        } else if let Some(api_key) = &creds.api_key {
            request.header(API_KEY_HEADER, api_key.as_str())
        } else {
            request
        }
    }

    async fn send(
        &self,
        request: RequestBuilder,
        operation: &'static str,
    ) -> Result<reqwest::Response, Error> {
        let response = self.authorize(request).send().await?;
        Self::ensure_success(response, operation).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        operation: &'static str,
    ) -> Result<T, Error> {
        let response = self.send(request, operation).await?;
        response.json::<T>().await.map_err(Into::into)
    }

    /// Checks HTTP response status; returns the response on success or an error with details.
    ///
    /// The backend reports failures as `{"detail": "..."}`; other bodies are
    /// passed through verbatim.
    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response, Error> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_owned))
            .unwrap_or(body);
        Err(Error::Api {
            operation,
            status: Some(status),
            detail,
        })
    }
}

impl SessionApi for HttpApiClient {
    async fn login(&self, username: &str, password: &str) -> Result<SessionEnvelope, Error> {
        let body = serde_json::json!({ "username": username, "password": password });
        let request = self
            .http
            .post(self.config.endpoint("session/login")?)
            .json(&body);
        self.send_json(request, "login").await
    }

    async fn register(&self, payload: &RegisterRequest) -> Result<SessionEnvelope, Error> {
        let request = self
            .http
            .post(self.config.endpoint("session/register")?)
            .json(payload);
        self.send_json(request, "register").await
    }

    async fn session_state(&self) -> Result<SessionEnvelope, Error> {
        let request = self.http.get(self.config.endpoint("session/state")?);
        self.send_json(request, "session state").await
    }

    async fn logout(&self) -> Result<(), Error> {
        let request = self
            .http
            .post(self.config.endpoint("session/logout")?)
            .json(&serde_json::json!({}));
        self.send(request, "logout").await.map(drop)
    }

    fn set_token(&self, token: Option<&Token>) {
        self.credentials.write().token = token.cloned();
    }

    fn set_api_key(&self, api_key: Option<&ApiKey>) {
        self.credentials.write().api_key = api_key.cloned();
    }

    fn clear_auth(&self) {
        *self.credentials.write() = Credentials::default();
    }
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::Json;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{delete, get, post};
    use serde_json::{Value, json};

    use super::*;
    use crate::controller::SessionController;
    use crate::storage::{KeyValueStore, MemoryStore};

    type Reply = Result<Json<Value>, (StatusCode, Json<Value>)>;

    fn unauthorized() -> (StatusCode, Json<Value>) {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "detail": "Not authenticated" })),
        )
    }

    fn envelope(token: &str, username: &str) -> Value {
        json!({
            "token": token,
            "token_type": "bearer",
            "user": {
                "id": 1,
                "username": username,
                "email": format!("{username}@example.com"),
                "is_active": true,
                "is_admin": false,
                "balance": 3.5
            },
            "abilities": { "can_purchase": true },
            "pages": { "admin": { "allowed": false, "reason": "ADMIN_ONLY" } },
            "refreshed_at": "2025-06-01T12:00:00Z"
        })
    }

    async fn login(Json(body): Json<Value>) -> Reply {
        if body["username"] == "alice" && body["password"] == "pw" {
            Ok(Json(envelope("xyz", "alice")))
        } else {
            Err((
                StatusCode::BAD_REQUEST,
                Json(json!({ "detail": "Incorrect username or password" })),
            ))
        }
    }

    async fn register(Json(body): Json<Value>) -> Reply {
        let username = body["username"].as_str().unwrap_or_default().to_owned();
        if body["email"].is_string() && body["password"].is_string() {
            Ok(Json(envelope("fresh", &username)))
        } else {
            Err((StatusCode::UNPROCESSABLE_ENTITY, Json(json!({ "detail": "invalid" }))))
        }
    }

    async fn state(headers: HeaderMap) -> Reply {
        let bearer = headers.get("authorization").and_then(|v| v.to_str().ok());
        let api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());
        match (bearer, api_key) {
            (Some("Bearer xyz"), _) => Ok(Json(envelope("xyz", "alice"))),
            (None, Some("key-1")) => Ok(Json(json!({
                "api_key": "key-1",
                "user": { "username": "alice" }
            }))),
            _ => Err(unauthorized()),
        }
    }

    async fn logout(headers: HeaderMap) -> Reply {
        if headers.contains_key("authorization") {
            Ok(Json(json!({ "message": "logged out" })))
        } else {
            Err(unauthorized())
        }
    }

    async fn list_keys(headers: HeaderMap) -> Reply {
        if !headers.contains_key("authorization") {
            return Err(unauthorized());
        }
        Ok(Json(json!([
            { "id": 1, "name": "old", "api_key": "key-old", "rate_limit": 1000, "is_active": false,
              "created_at": "2025-01-01T00:00:00Z" },
            { "id": 2, "name": "main", "api_key": "key-main", "rate_limit": 500, "is_active": true,
              "created_at": "2025-02-01T00:00:00Z" }
        ])))
    }

    async fn create_key(Json(body): Json<Value>) -> Json<Value> {
        Json(json!({
            "id": 3,
            "name": body["name"],
            "api_key": "key-new",
            "rate_limit": body["rate_limit"],
            "is_active": true,
            "created_at": "2025-03-01T00:00:00Z"
        }))
    }

    async fn rotate_key(Path(id): Path<i64>, headers: HeaderMap) -> Reply {
        match headers.get("authorization").and_then(|v| v.to_str().ok()) {
            Some("Bearer xyz") => Ok(Json(json!({ "api_key": format!("key-rotated-{id}") }))),
            _ => Err(unauthorized()),
        }
    }

    async fn delete_key(Path(id): Path<i64>) -> Reply {
        if id == 2 {
            Ok(Json(json!({ "message": "deleted" })))
        } else {
            Err((StatusCode::NOT_FOUND, Json(json!({ "detail": "API key not found" }))))
        }
    }

    async fn broken() -> (StatusCode, &'static str) {
        (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded")
    }

    /// Serve a stub backend on an ephemeral port and return its API root.
    async fn spawn_backend() -> ClientConfig {
        let api = Router::new()
            .route("/session/login", post(login))
            .route("/session/register", post(register))
            .route("/session/state", get(state))
            .route("/session/logout", post(logout))
            .route("/session/api-keys", get(list_keys).post(create_key))
            .route("/session/api-keys/{id}", delete(delete_key).put(rotate_key))
            .route("/broken/session/state", get(broken));
        let app = Router::new().nest("/api/v1", api);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        ClientConfig::new(format!("http://{addr}/api/v1").parse().unwrap())
    }

    #[tokio::test]
    async fn login_returns_envelope() {
        let client = HttpApiClient::new(spawn_backend().await).unwrap();

        let envelope = client.login("alice", "pw").await.unwrap();

        assert_eq!(envelope.token, Some(Token::from("xyz")));
        assert_eq!(envelope.user.as_ref().unwrap().username, "alice");
        assert_eq!(envelope.user.as_ref().unwrap().balance, 3.5);
        assert!(!envelope.pages["admin"].allowed);
    }

    #[tokio::test]
    async fn login_failure_carries_backend_detail() {
        let client = HttpApiClient::new(spawn_backend().await).unwrap();

        let err = client.login("alice", "wrong").await.unwrap_err();

        match err {
            Error::Api {
                operation,
                status,
                detail,
            } => {
                assert_eq!(operation, "login");
                assert_eq!(status, Some(400));
                assert_eq!(detail, "Incorrect username or password");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn register_posts_payload() {
        let client = HttpApiClient::new(spawn_backend().await).unwrap();

        let envelope = client
            .register(&RegisterRequest::new("carol", "carol@example.com", "secret"))
            .await
            .unwrap();

        assert_eq!(envelope.token, Some(Token::from("fresh")));
        assert_eq!(envelope.user.unwrap().username, "carol");
    }

    #[tokio::test]
    async fn session_state_uses_bearer_token() {
        let client = HttpApiClient::new(spawn_backend().await).unwrap();
        assert!(!client.has_credentials());

        let err = client.session_state().await.unwrap_err();
        assert!(matches!(err, Error::Api { status: Some(401), .. }));

        client.set_token(Some(&Token::from("xyz")));
        let envelope = client.session_state().await.unwrap();
        assert_eq!(envelope.user.unwrap().username, "alice");
    }

    #[tokio::test]
    async fn token_takes_precedence_over_api_key() {
        let client = HttpApiClient::new(spawn_backend().await).unwrap();
        client.set_api_key(Some(&ApiKey::from("key-1")));

        let envelope = client.session_state().await.unwrap();
        assert_eq!(envelope.api_key, Some(ApiKey::from("key-1")));
        assert_eq!(envelope.token, None);

        client.set_token(Some(&Token::from("xyz")));
        let envelope = client.session_state().await.unwrap();
        assert_eq!(envelope.token, Some(Token::from("xyz")));
    }

    #[tokio::test]
    async fn clear_auth_drops_credentials() {
        let client = HttpApiClient::new(spawn_backend().await).unwrap();
        client.set_token(Some(&Token::from("xyz")));
        client.set_api_key(Some(&ApiKey::from("key-1")));

        client.clear_auth();

        assert!(!client.has_credentials());
        assert!(client.logout().await.is_err());
    }

    #[tokio::test]
    async fn logout_with_token_succeeds() {
        let client = HttpApiClient::new(spawn_backend().await).unwrap();
        client.set_token(Some(&Token::from("xyz")));
        client.logout().await.unwrap();
    }

    #[tokio::test]
    async fn server_error_is_transient_with_raw_detail() {
        let config = spawn_backend().await;
        let broken_root = config.endpoint("broken/").unwrap();
        let client = HttpApiClient::new(ClientConfig::new(broken_root)).unwrap();

        let err = client.session_state().await.unwrap_err();

        assert!(err.is_transient());
        assert!(err.to_string().contains("upstream exploded"));
    }

    #[tokio::test]
    async fn api_key_management() {
        let client = HttpApiClient::new(spawn_backend().await).unwrap();
        client.set_token(Some(&Token::from("xyz")));

        let keys = client.list_api_keys().await.unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(
            crate::types::preferred_api_key(&keys),
            Some(&ApiKey::from("key-main"))
        );

        let created = client.create_api_key(Some("ci"), Some(250)).await.unwrap();
        assert_eq!(created.api_key, ApiKey::from("key-new"));
        assert_eq!(created.name.as_deref(), Some("ci"));
        assert_eq!(created.rate_limit, Some(250));

        let rotated = client.rotate_api_key(2).await.unwrap();
        assert_eq!(rotated, ApiKey::from("key-rotated-2"));

        client.delete_api_key(2).await.unwrap();
        let err = client.delete_api_key(9).await.unwrap_err();
        assert!(matches!(err, Error::Api { status: Some(404), .. }));
    }

    /// A base URL whose port was just released, so connecting is refused.
    async fn unreachable_backend() -> ClientConfig {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        ClientConfig::new(format!("http://{addr}/api/v1").parse().unwrap())
    }

    #[tokio::test]
    async fn unreachable_backend_is_transient() {
        let client = HttpApiClient::new(unreachable_backend().await).unwrap();

        let err = client.session_state().await.unwrap_err();

        assert!(matches!(err, Error::Http(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn unreachable_backend_keeps_stored_token() {
        let store = MemoryStore::new();
        store.set("access_token", "xyz").unwrap();
        let client = HttpApiClient::new(unreachable_backend().await).unwrap();
        let session = SessionController::new(store.clone(), client);

        assert!(session.safe_refresh().await.is_none());

        assert_eq!(store.get("access_token").unwrap().as_deref(), Some("xyz"));
    }

    #[tokio::test]
    async fn unauthorized_api_key_call_refreshes_session() {
        let store = MemoryStore::new();
        store.set("access_token", "xyz").unwrap();
        let client = HttpApiClient::new(spawn_backend().await).unwrap();
        let session = SessionController::new(store.clone(), client);

        let err = session
            .authorized(|api| api.list_api_keys())
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());

        assert_eq!(session.user().unwrap().username, "alice");
        let keys = session.authorized(|api| api.list_api_keys()).await.unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn unauthorized_with_stale_token_signs_out() {
        let store = MemoryStore::new();
        store.set("access_token", "stale").unwrap();
        let client = HttpApiClient::new(spawn_backend().await).unwrap();
        let session = SessionController::new(store.clone(), client);
        session.api().set_token(Some(&Token::from("stale")));

        let err = session
            .authorized(|api| api.rotate_api_key(2))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Api { status: Some(401), .. }));
        assert!(!session.is_authenticated());
        assert!(!session.api().has_credentials());
        assert_eq!(store.get("access_token").unwrap(), None);
    }
}
