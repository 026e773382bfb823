//! Bearer-token state shared by the queue and whoever logs the user in.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::error::{Result, SyncError};

/// Obtains a fresh token after the server rejected the current one.
pub trait TokenProvider: Send + Sync {
    /// `Ok(Some(token))` when a token is available right away, `Ok(None)`
    /// when it will arrive later through [`SecurityContext::set_token`].
    fn refresh_token(&self, user_id: Option<&str>) -> Result<Option<String>>;
}

/// Told when a token becomes available.
pub trait TokenListener: Send + Sync {
    fn token_available(&self);
}

/// Token, user identity and the admission rule derived from them.
pub struct SecurityContext {
    requires_token: AtomicBool,
    token: RwLock<Option<String>>,
    user_id: RwLock<Option<String>>,
    provider: RwLock<Option<Arc<dyn TokenProvider>>>,
    listeners: RwLock<Vec<Weak<dyn TokenListener>>>,
    refreshing: AtomicBool,
}

impl SecurityContext {
    pub fn new(requires_token: bool) -> Self {
        Self {
            requires_token: AtomicBool::new(requires_token),
            token: RwLock::new(None),
            user_id: RwLock::new(None),
            provider: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
            refreshing: AtomicBool::new(false),
        }
    }

    pub fn requires_token(&self) -> bool {
        self.requires_token.load(Ordering::SeqCst)
    }

    pub fn set_requires_token(&self, required: bool) {
        self.requires_token.store(required, Ordering::SeqCst);
        if !required {
            self.notify_token_available();
        }
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    pub fn has_token(&self) -> bool {
        self.token.read().is_some()
    }

    /// Requests may be dispatched.
    pub fn is_admission_open(&self) -> bool {
        !self.requires_token() || self.has_token()
    }

    /// Store a token and wake everyone waiting for one.
    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
        self.refreshing.store(false, Ordering::SeqCst);
        tracing::debug!("token available");
        self.notify_token_available();
    }

    pub fn clear_token(&self) {
        *self.token.write() = None;
    }

    pub fn set_user(&self, user_id: impl Into<String>) {
        *self.user_id.write() = Some(user_id.into());
    }

    pub fn clear_user(&self) {
        *self.user_id.write() = None;
    }

    pub fn current_user(&self) -> Option<String> {
        self.user_id.read().clone()
    }

    pub fn set_token_provider(&self, provider: Arc<dyn TokenProvider>) {
        *self.provider.write() = Some(provider);
    }

    pub fn add_token_listener(&self, listener: Weak<dyn TokenListener>) {
        self.listeners.write().push(listener);
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }

    /// Drop the current token and ask the provider for a new one.
    ///
    /// Concurrent refreshes collapse into the one already running.
    pub fn refresh_token(&self) -> Result<()> {
        self.clear_token();
        if self.refreshing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let provider = self.provider.read().clone();
        let Some(provider) = provider else {
            self.refreshing.store(false, Ordering::SeqCst);
            return Err(SyncError::TokenRefresh("no token provider configured".into()));
        };

        tracing::info!("refreshing token");
        let user = self.current_user();
        match provider.refresh_token(user.as_deref()) {
            Ok(Some(token)) => {
                self.set_token(token);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.refreshing.store(false, Ordering::SeqCst);
                tracing::error!(error = %e, "token refresh failed");
                Err(SyncError::TokenRefresh(e.to_string()))
            }
        }
    }

    fn notify_token_available(&self) {
        let live: Vec<Arc<dyn TokenListener>> = {
            let mut listeners = self.listeners.write();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in live {
            listener.token_available();
        }
    }
}

impl Default for SecurityContext {
    fn default() -> Self {
        Self::new(false)
    }
}
