//! The session controller: single source of truth for who is logged in.
//!
//! ```text
//!                 initialize()
//! [Uninitialized] ────────────→ [Authenticated] ⟷ [Anonymous]
//!                                   set_state()    clear_state()
//! ```
//!
//! The controller owns the envelope, its persisted copy, and the API
//! client's credentials. Consumers read through accessors and observe
//! changes with [`SessionController::subscribe`].
//!
//! # Ordering
//!
//! Every state change runs inside one reentrant transition lock that covers
//! "persist, replace, notify". Listeners therefore always see the latest
//! state, and a listener may call back into the controller from inside a
//! notification without deadlocking.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tokio::sync::OnceCell;

use crate::api::SessionApi;
use crate::config::StorageKeys;
use crate::error::Error;
use crate::navigator::{LoggingNavigator, Navigator};
use crate::storage::KeyValueStore;
use crate::types::{
    ADMIN_ONLY, ApiKey, PageAccess, RegisterRequest, SessionEnvelope, SessionUser, Token,
};

/// Shown when a guard denies a page reserved for administrators.
pub const ADMIN_ONLY_MESSAGE: &str =
    "This account does not have administrator access. Returning to the login page.";

/// Shown when a guard denies a page for any other reason.
pub const SESSION_EXPIRED_MESSAGE: &str = "Your session has expired. Please sign in again.";

type Listener = Arc<dyn Fn(Option<&SessionEnvelope>) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

/// Handle returned by [`SessionController::subscribe`].
///
/// Dropping it keeps the listener registered; call
/// [`unsubscribe`](Subscription::unsubscribe) to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Remove the listener. No-op if the controller is gone.
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().entries.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Options for [`SessionController::ensure_page`].
#[derive(Debug, Clone, Default)]
pub struct PageGuard {
    pub redirect_to: Option<String>,
    /// Overrides the reason-based default message.
    pub message: Option<String>,
}

impl PageGuard {
    #[must_use]
    pub fn redirect_to(target: impl Into<String>) -> Self {
        Self {
            redirect_to: Some(target.into()),
            message: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Options for [`SessionController::logout`].
#[derive(Debug, Clone, Default)]
pub struct LogoutOptions {
    pub redirect_to: Option<String>,
}

impl LogoutOptions {
    #[must_use]
    pub fn redirect_to(target: impl Into<String>) -> Self {
        Self {
            redirect_to: Some(target.into()),
        }
    }
}

/// Owns the authenticated-session lifecycle.
///
/// Construct one per application (or per tab) and share it by `Arc`.
///
/// ```rust,ignore
/// let api = HttpApiClient::new(ClientConfig::from_env()?)?;
/// let store = FileStore::open(profile_dir.join("session.json"))?;
/// let session = Arc::new(SessionController::new(store, api));
///
/// session.initialize().await;
/// session.ensure_page("orders", PageGuard::redirect_to("login.html")).await?;
/// ```
pub struct SessionController<S, A> {
    store: S,
    api: A,
    keys: StorageKeys,
    navigator: Arc<dyn Navigator>,
    state: RwLock<Option<Arc<SessionEnvelope>>>,
    listeners: Arc<Mutex<Registry>>,
    transition: ReentrantMutex<()>,
    initialized: OnceCell<()>,
    refresh_gate: tokio::sync::Mutex<()>,
    refresh_generation: AtomicU64,
    notifications: AtomicU64,
}

impl<S: KeyValueStore, A: SessionApi> SessionController<S, A> {
    /// Create a controller with default storage keys and a logging navigator.
    ///
    /// Nothing is read until [`initialize`](Self::initialize) runs.
    #[must_use]
    pub fn new(store: S, api: A) -> Self {
        Self {
            store,
            api,
            keys: StorageKeys::default(),
            navigator: Arc::new(LoggingNavigator),
            state: RwLock::new(None),
            listeners: Arc::new(Mutex::new(Registry::default())),
            transition: ReentrantMutex::new(()),
            initialized: OnceCell::new(),
            refresh_gate: tokio::sync::Mutex::new(()),
            refresh_generation: AtomicU64::new(0),
            notifications: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_storage_keys(mut self, keys: StorageKeys) -> Self {
        self.keys = keys;
        self
    }

    #[must_use]
    pub fn with_navigator(mut self, navigator: impl Navigator) -> Self {
        self.navigator = Arc::new(navigator);
        self
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn api(&self) -> &A {
        &self.api
    }

    #[must_use]
    pub fn storage_keys(&self) -> &StorageKeys {
        &self.keys
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Bootstrap from storage. Runs once; later calls await the same result.
    ///
    /// A parseable cached envelope is adopted immediately, without a network
    /// round trip. Otherwise a stored token triggers a refresh, and with
    /// neither the controller settles as anonymous.
    pub async fn initialize(&self) {
        self.initialized.get_or_init(|| self.bootstrap()).await;
    }

    /// Whether [`initialize`](Self::initialize) has completed.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    async fn bootstrap(&self) {
        if let Some(raw) = self.read(self.keys.session()) {
            match serde_json::from_str::<SessionEnvelope>(&raw) {
                Ok(envelope) => {
                    let _transition = self.transition.lock();
                    self.api.set_token(envelope.token.as_ref());
                    self.api.set_api_key(envelope.api_key.as_ref());
                    self.replace_state(Some(Arc::new(envelope)));
                    tracing::debug!("Session hydrated from cache");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding unreadable cached session");
                    self.erase(self.keys.session());
                }
            }
        }

        if self.session().is_some() {
            return;
        }
        if self.stored_token().is_some() {
            self.safe_refresh().await;
        } else {
            self.clear_state();
        }
    }

    /// Refresh with failure containment and coalescing.
    ///
    /// Callers that arrive while a refresh is in flight wait for it and then
    /// return its outcome instead of starting another. A transient failure
    /// keeps the current session; any other failure clears it.
    pub async fn safe_refresh(&self) -> Option<Arc<SessionEnvelope>> {
        let observed = self.refresh_generation.load(Ordering::Acquire);
        let _gate = self.refresh_gate.lock().await;
        if self.refresh_generation.load(Ordering::Acquire) != observed {
            tracing::debug!("Joined in-flight session refresh");
            return self.session();
        }

        match self.refresh().await {
            Ok(_) => {}
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "Session refresh failed transiently, keeping current session");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Session refresh failed");
                self.clear_state();
            }
        }

        self.refresh_generation.fetch_add(1, Ordering::AcqRel);
        self.session()
    }

    /// Resynchronize with the backend.
    ///
    /// Without a stored token the session is cleared. When the backend cannot
    /// confirm the session but a username is cached, a degraded envelope
    /// (every page but `admin` open) is adopted so a backend hiccup does not
    /// log the user out.
    ///
    /// # Errors
    ///
    /// Returns the backend error when it is transient and no username is
    /// cached; the current session is left as it was. Returns
    /// [`Error::Serialization`] if the degraded envelope cannot be persisted.
    pub async fn refresh(&self) -> Result<Option<Arc<SessionEnvelope>>, Error> {
        let Some(token) = self.stored_token() else {
            self.clear_state();
            return Ok(None);
        };

        self.api.set_token(Some(&token));
        let failure = match self.api.session_state().await {
            Ok(envelope) => match self.set_state(envelope) {
                Ok(session) => return Ok(Some(session)),
                Err(e) => e,
            },
            Err(e) => e,
        };

        match self.read(self.keys.username()).filter(|u| !u.is_empty()) {
            Some(username) => {
                tracing::warn!(
                    error = %failure,
                    username = %username,
                    "Session state unavailable, continuing with degraded session"
                );
                let api_key = self
                    .read(self.keys.api_key())
                    .filter(|k| !k.is_empty())
                    .map(ApiKey::from);
                self.set_state(SessionEnvelope::degraded(token, username, api_key))
                    .map(Some)
            }
            None if failure.is_transient() => Err(failure),
            None => {
                tracing::warn!(error = %failure, "Session state refresh failed, signing out");
                self.clear_state();
                Ok(None)
            }
        }
    }

    // ── State transitions ──────────────────────────────────────────

    /// Validate, persist and publish a new envelope.
    ///
    /// Storage write failures are logged and do not block the update.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSession`] if the envelope has neither a token
    /// nor an API key; nothing is stored and no listener fires.
    pub fn set_state(&self, envelope: SessionEnvelope) -> Result<Arc<SessionEnvelope>, Error> {
        envelope.validate()?;
        let serialized = serde_json::to_string(&envelope)?;
        let user = match &envelope.user {
            Some(user) => serde_json::to_string(user)?,
            None => "{}".to_owned(),
        };

        let _transition = self.transition.lock();

        self.write(self.keys.session(), &serialized);
        match &envelope.token {
            Some(token) => self.write(self.keys.token(), token.as_str()),
            None => self.erase(self.keys.token()),
        }
        match &envelope.api_key {
            Some(api_key) => self.write(self.keys.api_key(), api_key.as_str()),
            None => self.erase(self.keys.api_key()),
        }
        let username = envelope.user.as_ref().map_or("", |u| u.username.as_str());
        self.write(self.keys.username(), username);
        self.write(self.keys.user(), &user);

        self.api.set_token(envelope.token.as_ref());
        self.api.set_api_key(envelope.api_key.as_ref());

        let session = Arc::new(envelope);
        self.replace_state(Some(Arc::clone(&session)));
        Ok(session)
    }

    /// Forget the session everywhere and notify listeners with `None`.
    pub fn clear_state(&self) {
        let _transition = self.transition.lock();

        for key in [
            self.keys.session(),
            self.keys.username(),
            self.keys.token(),
            self.keys.api_key(),
            self.keys.user(),
        ] {
            self.erase(key);
        }
        self.api.clear_auth();
        self.replace_state(None);
    }

    /// Set or clear the session's API key after a key is created or rotated.
    ///
    /// Starts from an empty envelope when there is no session yet. This path
    /// skips the credential check: clearing the key of a key-only session
    /// leaves an envelope without credentials, which stays unauthenticated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the envelope cannot be encoded.
    pub fn update_api_key(&self, api_key: Option<ApiKey>) -> Result<Arc<SessionEnvelope>, Error> {
        let _transition = self.transition.lock();

        let mut envelope = self.session().map(|s| (*s).clone()).unwrap_or_default();
        envelope.api_key = api_key.filter(|k| !k.as_str().is_empty());
        let serialized = serde_json::to_string(&envelope)?;

        self.write(self.keys.session(), &serialized);
        match &envelope.api_key {
            Some(api_key) => self.write(self.keys.api_key(), api_key.as_str()),
            None => self.erase(self.keys.api_key()),
        }
        self.api.set_api_key(envelope.api_key.as_ref());

        let session = Arc::new(envelope);
        self.replace_state(Some(Arc::clone(&session)));
        Ok(session)
    }

    /// Caller must hold the transition lock.
    fn replace_state(&self, next: Option<Arc<SessionEnvelope>>) {
        *self.state.write() = next;
        self.emit();
    }

    /// Notify every listener once with the current state.
    ///
    /// A listener that changes the state starts a nested broadcast of the
    /// newer state; the outer broadcast then stops, so each listener sees
    /// every surviving state exactly once.
    fn emit(&self) {
        let round = self.notifications.fetch_add(1, Ordering::AcqRel) + 1;
        let current = self.session();
        let listeners = self.listeners.lock().entries.clone();
        for (id, listener) in &listeners {
            if self.notifications.load(Ordering::Acquire) != round {
                break;
            }
            invoke(*id, listener, current.as_deref());
        }
    }

    // ── Observers ──────────────────────────────────────────────────

    /// Register a listener for state changes.
    ///
    /// If a session already exists the listener is called with it before
    /// this returns. Listeners run synchronously in registration order; a
    /// panicking listener is logged and skipped.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Option<&SessionEnvelope>) + Send + Sync + 'static,
    {
        let _transition = self.transition.lock();

        let listener: Listener = Arc::new(listener);
        let id = {
            let mut registry = self.listeners.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.entries.push((id, Arc::clone(&listener)));
            id
        };

        if let Some(current) = self.session() {
            invoke(id, &listener, Some(&*current));
        }

        Subscription {
            id,
            registry: Arc::downgrade(&self.listeners),
        }
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().entries.len()
    }

    // ── Backend delegation ─────────────────────────────────────────

    /// Log in and adopt the returned envelope.
    ///
    /// # Errors
    ///
    /// Propagates backend errors and [`Error::InvalidSession`].
    pub async fn login(&self, username: &str, password: &str) -> Result<Arc<SessionEnvelope>, Error> {
        let envelope = self.api.login(username, password).await?;
        let session = self.set_state(envelope)?;
        tracing::info!(username, "Logged in");
        Ok(session)
    }

    /// Create an account and adopt the returned envelope.
    ///
    /// # Errors
    ///
    /// Propagates backend errors and [`Error::InvalidSession`].
    pub async fn register(&self, payload: &RegisterRequest) -> Result<Arc<SessionEnvelope>, Error> {
        let envelope = self.api.register(payload).await?;
        let session = self.set_state(envelope)?;
        tracing::info!(username = %payload.username, "Registered");
        Ok(session)
    }

    /// Log out on the server (best effort), then locally, then redirect.
    pub async fn logout(&self, options: LogoutOptions) {
        if let Err(e) = self.api.logout().await {
            tracing::warn!(error = %e, "Server-side logout failed");
        }
        self.clear_state();
        tracing::info!("Logged out");
        if let Some(target) = options.redirect_to {
            self.navigator.redirect(&target);
        }
    }

    /// Run an authenticated backend call and resynchronize on a 401.
    ///
    /// A rejected credential means the session is stale, so
    /// [`safe_refresh`](Self::safe_refresh) runs before the error is handed
    /// back to the caller.
    ///
    /// ```rust,ignore
    /// let keys = session.authorized(|api| api.list_api_keys()).await?;
    /// ```
    ///
    /// # Errors
    ///
    /// Returns whatever `call` returns.
    pub async fn authorized<'a, T, F, Fut>(&'a self, call: F) -> Result<T, Error>
    where
        F: FnOnce(&'a A) -> Fut,
        Fut: Future<Output = Result<T, Error>> + 'a,
    {
        let result = call(&self.api).await;
        if let Err(e) = &result {
            if e.is_unauthorized() {
                tracing::warn!(error = %e, "Backend rejected credentials, refreshing session");
                self.safe_refresh().await;
            }
        }
        result
    }

    // ── Accessors ──────────────────────────────────────────────────

    #[must_use]
    pub fn session(&self) -> Option<Arc<SessionEnvelope>> {
        self.state.read().clone()
    }

    #[must_use]
    pub fn user(&self) -> Option<SessionUser> {
        self.state.read().as_ref().and_then(|s| s.user.clone())
    }

    #[must_use]
    pub fn pages(&self) -> std::collections::BTreeMap<String, PageAccess> {
        self.state
            .read()
            .as_ref()
            .map(|s| s.pages.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn abilities(&self) -> std::collections::BTreeMap<String, bool> {
        self.state
            .read()
            .as_ref()
            .map(|s| s.abilities.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn has_ability(&self, name: &str) -> bool {
        self.state
            .read()
            .as_ref()
            .and_then(|s| s.abilities.get(name).copied())
            .unwrap_or(false)
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state.read().as_ref().is_some_and(|s| s.user.is_some())
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.state
            .read()
            .as_ref()
            .and_then(|s| s.user.as_ref())
            .is_some_and(|u| u.is_admin)
    }

    /// Page gate check.
    ///
    /// A page without a record (or an empty name) is open to any
    /// authenticated user; otherwise the record's `allowed` flag decides.
    #[must_use]
    pub fn can_access(&self, page: &str) -> bool {
        if page.is_empty() {
            return self.is_authenticated();
        }
        let record = self
            .state
            .read()
            .as_ref()
            .and_then(|s| s.pages.get(page).map(|p| p.allowed));
        match record {
            Some(allowed) => allowed,
            None => self.is_authenticated(),
        }
    }

    #[must_use]
    pub fn page_reason(&self, page: &str) -> Option<String> {
        self.state
            .read()
            .as_ref()
            .and_then(|s| s.pages.get(page))
            .and_then(|p| p.reason.clone())
    }

    /// Guard for page bootstrap code.
    ///
    /// Waits for initialization, refreshes once if anonymous, and on denial
    /// shows a message and optionally redirects through the navigator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageAccessDenied`] (`PAGE_ACCESS_DENIED:<page>`) so the
    /// caller aborts page setup.
    pub async fn ensure_page(&self, page: &str, guard: PageGuard) -> Result<(), Error> {
        self.initialize().await;
        if !self.is_authenticated() {
            self.safe_refresh().await;
        }
        if self.can_access(page) {
            return Ok(());
        }

        let message = guard.message.unwrap_or_else(|| {
            if self.page_reason(page).as_deref() == Some(ADMIN_ONLY) {
                ADMIN_ONLY_MESSAGE.to_owned()
            } else {
                SESSION_EXPIRED_MESSAGE.to_owned()
            }
        });

        tracing::warn!(page, "Page access denied");
        self.navigator.notify(&message);
        if let Some(target) = guard.redirect_to {
            self.navigator.redirect(&target);
        }
        Err(Error::PageAccessDenied(page.to_owned()))
    }

    // ── Storage helpers ────────────────────────────────────────────

    fn stored_token(&self) -> Option<Token> {
        self.read(self.keys.token())
            .filter(|t| !t.is_empty())
            .map(Token::from)
    }

    fn read(&self, key: &str) -> Option<String> {
        self.store.get(key).unwrap_or_else(|e| {
            tracing::warn!(key, error = %e, "Session storage read failed");
            None
        })
    }

    fn write(&self, key: &str, value: &str) {
        if let Err(e) = self.store.set(key, value) {
            tracing::warn!(key, error = %e, "Session storage write failed");
        }
    }

    fn erase(&self, key: &str) {
        if let Err(e) = self.store.remove(key) {
            tracing::warn!(key, error = %e, "Session storage remove failed");
        }
    }
}

fn invoke(id: u64, listener: &Listener, state: Option<&SessionEnvelope>) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| listener(state))) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_default();
        tracing::warn!(listener = id, panic = %reason, "Session listener panicked");
    }
}
