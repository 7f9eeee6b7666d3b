#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The envelope carries neither a token nor an API key.
    #[error("Invalid session envelope: token or api_key is required")]
    InvalidSession,

    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-success status.
    #[error("{operation} failed (status {status:?}): {detail}")]
    Api {
        operation: &'static str,
        status: Option<u16>,
        detail: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A page guard refused access. The display form is matched by callers.
    #[error("PAGE_ACCESS_DENIED:{0}")]
    PageAccessDenied(String),
}

impl Error {
    /// Whether the failure looks like a temporary backend fault: a 5xx, a
    /// timeout, or a backend that could not be reached at all.
    ///
    /// Transient failures never tear down an existing session.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api {
                status: Some(status),
                ..
            } => *status >= 500,
            #[cfg(feature = "http")]
            Self::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            _ => false,
        }
    }

    /// Whether the backend rejected the credentials (HTTP 401).
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Self::Api { status, .. } => *status == Some(401),
            #[cfg(feature = "http")]
            Self::Http(e) => e.status().is_some_and(|s| s.as_u16() == 401),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_page_access_denied(&self) -> bool {
        matches!(self, Self::PageAccessDenied(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(status: Option<u16>) -> Error {
        Error::Api {
            operation: "session state",
            status,
            detail: "boom".into(),
        }
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(api_error(Some(500)).is_transient());
        assert!(api_error(Some(503)).is_transient());
    }

    #[test]
    fn client_errors_are_not_transient() {
        assert!(!api_error(Some(401)).is_transient());
        assert!(!api_error(Some(404)).is_transient());
        assert!(!api_error(None).is_transient());
        assert!(!Error::InvalidSession.is_transient());
        assert!(!Error::Storage("disk full".into()).is_transient());
    }

    #[test]
    fn only_401_is_unauthorized() {
        assert!(api_error(Some(401)).is_unauthorized());
        assert!(!api_error(Some(403)).is_unauthorized());
        assert!(!api_error(None).is_unauthorized());
        assert!(!Error::InvalidSession.is_unauthorized());
    }

    #[test]
    fn page_access_denied_display() {
        let err = Error::PageAccessDenied("admin".into());
        assert_eq!(err.to_string(), "PAGE_ACCESS_DENIED:admin");
        assert!(err.is_page_access_denied());
        assert!(!Error::InvalidSession.is_page_access_denied());
    }
}
