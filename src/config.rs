#[cfg(feature = "http")]
use std::time::Duration;

#[cfg(feature = "http")]
use url::Url;

#[cfg(feature = "http")]
use crate::error::Error;

/// Storage key names used by the session controller.
///
/// Defaults match the keys earlier console builds wrote, so an existing
/// profile keeps its login. Override with the `with_*` methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    pub(crate) session: String,
    pub(crate) token: String,
    pub(crate) username: String,
    pub(crate) user: String,
    pub(crate) api_key: String,
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self {
            session: "session_envelope".into(),
            token: "access_token".into(),
            username: "username".into(),
            user: "user_info".into(),
            api_key: "api_key".into(),
        }
    }
}

impl StorageKeys {
    #[must_use]
    pub fn with_session_key(mut self, key: impl Into<String>) -> Self {
        self.session = key.into();
        self
    }

    #[must_use]
    pub fn with_token_key(mut self, key: impl Into<String>) -> Self {
        self.token = key.into();
        self
    }

    #[must_use]
    pub fn with_username_key(mut self, key: impl Into<String>) -> Self {
        self.username = key.into();
        self
    }

    #[must_use]
    pub fn with_user_key(mut self, key: impl Into<String>) -> Self {
        self.user = key.into();
        self
    }

    #[must_use]
    pub fn with_api_key_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = key.into();
        self
    }

    /// Key holding the serialized envelope.
    #[must_use]
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Key holding the raw bearer token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Key holding the serialized user object.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Every key, for [`migrate_keys`](crate::migrate_keys).
    #[must_use]
    pub fn all(&self) -> [&str; 5] {
        [
            &self.session,
            &self.token,
            &self.username,
            &self.user,
            &self.api_key,
        ]
    }
}

/// Backend connection settings.
///
/// ```rust,ignore
/// use proxy_session::ClientConfig;
///
/// let config = ClientConfig::new("http://localhost:8000/api/v1/".parse()?)
///     .with_timeout(std::time::Duration::from_secs(10));
/// ```
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClientConfig {
    pub(crate) base_url: Url,
    pub(crate) timeout: Duration,
    pub(crate) user_agent: String,
}

#[cfg(feature = "http")]
impl ClientConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a config for the API rooted at `base_url`.
    ///
    /// A trailing slash is added when missing so endpoint paths join under it.
    #[must_use]
    pub fn new(mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            base_url,
            timeout: Self::DEFAULT_TIMEOUT,
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).into(),
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `PROXY_API_BASE_URL`: API root, e.g. `http://localhost:8000/api/v1`
    ///
    /// # Optional env vars
    /// - `PROXY_API_TIMEOUT_SECS`: request timeout in seconds (default 30)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the base URL is missing or invalid, or the
    /// timeout is not a number.
    pub fn from_env() -> Result<Self, Error> {
        let base_url = std::env::var("PROXY_API_BASE_URL")
            .map_err(|_| Error::Config("PROXY_API_BASE_URL is required".into()))?;
        let base_url: Url = base_url
            .parse()
            .map_err(|e| Error::Config(format!("PROXY_API_BASE_URL: {e}")))?;

        let mut config = Self::new(base_url);

        if let Ok(secs) = std::env::var("PROXY_API_TIMEOUT_SECS") {
            let secs: u64 = secs
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("PROXY_API_TIMEOUT_SECS: {e}")))?;
            config = config.with_timeout(Duration::from_secs(secs));
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Resolve an endpoint path against the base URL.
    pub(crate) fn endpoint(&self, path: &str) -> Result<Url, Error> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::Config(format!("endpoint {path}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_storage_keys() {
        let keys = StorageKeys::default();
        assert_eq!(keys.session(), "session_envelope");
        assert_eq!(keys.token(), "access_token");
        assert_eq!(keys.username(), "username");
        assert_eq!(keys.user(), "user_info");
        assert_eq!(keys.api_key(), "api_key");
    }

    #[test]
    fn storage_key_overrides() {
        let keys = StorageKeys::default()
            .with_session_key("console.session")
            .with_token_key("console.token");
        assert_eq!(keys.session(), "console.session");
        assert_eq!(keys.token(), "console.token");
        assert_eq!(keys.all().len(), 5);
    }

    #[cfg(feature = "http")]
    #[test]
    fn endpoint_joins_under_base_path() {
        let config = ClientConfig::new("http://localhost:8000/api/v1".parse().unwrap());
        assert_eq!(config.base_url().as_str(), "http://localhost:8000/api/v1/");
        assert_eq!(
            config.endpoint("/session/state").unwrap().as_str(),
            "http://localhost:8000/api/v1/session/state"
        );
        assert_eq!(
            config.endpoint("session/login").unwrap().as_str(),
            "http://localhost:8000/api/v1/session/login"
        );
    }

    #[cfg(feature = "http")]
    #[test]
    fn config_with_overrides() {
        let config = ClientConfig::new("https://console.example.com/".parse().unwrap())
            .with_timeout(Duration::from_secs(5))
            .with_user_agent("console-test");
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.user_agent(), "console-test");
        assert_eq!(config.base_url().as_str(), "https://console.example.com/");
    }
}
