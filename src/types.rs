use std::collections::BTreeMap;

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::Error;

/// Reason the backend attaches to pages only administrators may open.
pub const ADMIN_ONLY: &str = "ADMIN_ONLY";

/// Page names the console gates on.
pub mod page {
    pub const DASHBOARD: &str = "dashboard";
    pub const PROXY: &str = "proxy";
    pub const PRODUCTS: &str = "products";
    pub const ORDERS: &str = "orders";
    pub const API_KEYS: &str = "api-keys";
    pub const PROFILE: &str = "profile";
    pub const ADMIN: &str = "admin";
}

/// Capability names found in [`SessionEnvelope::abilities`].
pub mod ability {
    pub const CAN_PURCHASE: &str = "can_purchase";
    pub const CAN_USE_API: &str = "can_use_api";
    pub const CAN_MANAGE_PLATFORM: &str = "can_manage_platform";
    pub const CAN_ACCESS_ADMIN: &str = "can_access_admin";
}

/// Opaque bearer credential.
///
/// `Debug` is redacted so tokens never end up in logs.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
#[serde(transparent)]
pub struct Token(pub String);

impl Token {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Token(***)")
    }
}

impl From<&str> for Token {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Opaque API credential, sent as `X-API-Key`.
///
/// `Debug` is redacted like [`Token`]; `Display` prints the key for the
/// account page that shows it.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct ApiKey(pub String);

impl ApiKey {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// The user block of a session envelope.
///
/// Fields the console does not interpret are kept in `extra` so a cached
/// envelope is written back exactly as the backend sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct SessionUser {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub balance: f64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SessionUser {
    #[must_use]
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: None,
            username: username.into(),
            email: None,
            is_active: None,
            is_admin: false,
            balance: 0.0,
            extra: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn with_admin(mut self, is_admin: bool) -> Self {
        self.is_admin = is_admin;
        self
    }

    #[must_use]
    pub fn with_balance(mut self, balance: f64) -> Self {
        self.balance = balance;
        self
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_active(mut self, active: bool) -> Self {
        self.is_active = Some(active);
        self
    }
}

/// Access decision for one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageAccess {
    pub allowed: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

impl PageAccess {
    #[must_use]
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    #[must_use]
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Full session payload exchanged with the backend and cached locally.
///
/// Replaced wholesale on every update. Valid only while it carries a token
/// or an API key; see [`SessionEnvelope::validate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct SessionEnvelope {
    #[serde(default)]
    pub token: Option<Token>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default)]
    pub api_key: Option<ApiKey>,
    #[serde(default)]
    pub user: Option<SessionUser>,
    #[serde(default)]
    pub abilities: BTreeMap<String, bool>,
    #[serde(default)]
    pub pages: BTreeMap<String, PageAccess>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub refreshed_at: Option<OffsetDateTime>,
}

impl SessionEnvelope {
    /// Create an envelope authenticated by a bearer token.
    #[must_use]
    pub fn with_token(token: impl Into<Token>) -> Self {
        Self {
            token: Some(token.into()),
            token_type: Some("bearer".into()),
            ..Self::default()
        }
    }

    /// Create an envelope authenticated by an API key only.
    #[must_use]
    pub fn with_api_key_only(api_key: impl Into<ApiKey>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_user(mut self, user: SessionUser) -> Self {
        self.user = Some(user);
        self
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<ApiKey>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    #[must_use]
    pub fn with_page(mut self, name: impl Into<String>, access: PageAccess) -> Self {
        self.pages.insert(name.into(), access);
        self
    }

    #[must_use]
    pub fn with_ability(mut self, name: impl Into<String>, granted: bool) -> Self {
        self.abilities.insert(name.into(), granted);
        self
    }

    #[must_use]
    pub fn with_refreshed_at(mut self, at: OffsetDateTime) -> Self {
        self.refreshed_at = Some(at);
        self
    }

    /// Locally synthesized reduced-trust envelope.
    ///
    /// Used when the backend cannot confirm the session but a stored token
    /// and username suggest the user was logged in. Every standard page is
    /// open except `admin`.
    #[must_use]
    pub fn degraded(token: Token, username: impl Into<String>, api_key: Option<ApiKey>) -> Self {
        let pages = [
            page::DASHBOARD,
            page::PROXY,
            page::PRODUCTS,
            page::ORDERS,
            page::API_KEYS,
            page::PROFILE,
        ]
        .into_iter()
        .map(|name| (name.to_owned(), PageAccess::allowed()))
        .chain([(page::ADMIN.to_owned(), PageAccess::denied(ADMIN_ONLY))])
        .collect();

        let abilities = [
            (ability::CAN_PURCHASE, true),
            (ability::CAN_USE_API, true),
            (ability::CAN_MANAGE_PLATFORM, false),
            (ability::CAN_ACCESS_ADMIN, false),
        ]
        .into_iter()
        .map(|(name, granted)| (name.to_owned(), granted))
        .collect();

        Self {
            token: Some(token),
            token_type: Some("bearer".into()),
            api_key,
            user: Some(SessionUser::new(username).with_active(true)),
            abilities,
            pages,
            refreshed_at: Some(OffsetDateTime::now_utc()),
        }
    }

    /// Whether a non-empty token or API key is present.
    #[must_use]
    pub fn has_credential(&self) -> bool {
        let token = self.token.as_ref().is_some_and(|t| !t.as_str().is_empty());
        let api_key = self.api_key.as_ref().is_some_and(|k| !k.as_str().is_empty());
        token || api_key
    }

    /// Checks the envelope invariant.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSession`] when neither credential is present.
    pub fn validate(&self) -> Result<(), Error> {
        if self.has_credential() {
            Ok(())
        } else {
            Err(Error::InvalidSession)
        }
    }
}

/// Sign-up payload for `POST /session/register`.
#[derive(Debug, Clone, Serialize)]
#[non_exhaustive]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

impl RegisterRequest {
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
            password: password.into(),
        }
    }
}

/// An API key as listed by `GET /session/api-keys`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ApiKeyRecord {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    pub api_key: ApiKey,
    #[serde(default)]
    pub rate_limit: Option<u32>,
    pub is_active: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_used_at: Option<OffsetDateTime>,
}

/// Picks the key the session should carry: the first active one, else the first.
#[must_use]
pub fn preferred_api_key(keys: &[ApiKeyRecord]) -> Option<&ApiKey> {
    keys.iter()
        .find(|k| k.is_active)
        .or_else(|| keys.first())
        .map(|k| &k.api_key)
}
