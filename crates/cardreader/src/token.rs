//! # Connection Token Provider
//!
//! Supplies the opaque connection token the vendor terminal needs to open a
//! session with its backend, by delegating to the app's credential store.
//!
//! ## Token Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Connection Token Flow                              │
//! │                                                                         │
//! │  ┌────────────────┐     ┌─────────────────┐     ┌─────────────────┐    │
//! │  │ Vendor SDK     │     │ TokenProvider   │     │ CredentialStore │    │
//! │  └───────┬────────┘     └────────┬────────┘     └────────┬────────┘    │
//! │          │  1. fetch token       │                       │             │
//! │          │──────────────────────►│  2. cache empty:      │             │
//! │          │                       │     get token         │             │
//! │          │                       │──────────────────────►│             │
//! │          │                       │◄──────────────────────│             │
//! │          │◄──────────────────────│  3. cache + return    │             │
//! │          │                       │                       │             │
//! │          │  [Later: fetch again] │                       │             │
//! │          │──────────────────────►│  4. cached, no call   │             │
//! │          │◄──────────────────────│                       │             │
//! │          │                       │                       │             │
//! │          │  [Token expired / clearCachedCredentials]     │             │
//! │          │                       │  5. cache dropped,    │             │
//! │          │                       │     next fetch asks   │             │
//! │          │                       │     the store again   │             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use cardreader_core::{TerminalError, TerminalErrorCode};

use crate::error::ReaderResult;
use crate::terminal::{ConnectionTokenSource, TerminalResult};

/// The app-side collaborator that mints connection tokens.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_connection_token(&self) -> ReaderResult<String>;
}

/// A cached connection token.
#[derive(Clone)]
pub struct ConnectionToken {
    secret: String,
    pub issued_at: DateTime<Utc>,
}

impl ConnectionToken {
    pub fn new(secret: String) -> Self {
        Self {
            secret,
            issued_at: Utc::now(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionToken")
            .field("secret", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Caching token provider.
///
/// The store is asked again only after [`clear_cached_credentials`] or a
/// token-expiry notification from the terminal.
///
/// [`clear_cached_credentials`]: TokenProvider::clear_cached_credentials
pub struct TokenProvider {
    store: Arc<dyn CredentialStore>,
    cached: RwLock<Option<ConnectionToken>>,
}

impl TokenProvider {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            cached: RwLock::new(None),
        }
    }

    /// Returns the cached token, or fetches and caches a fresh one.
    pub async fn connection_token(&self) -> ReaderResult<String> {
        {
            let guard = self.cached.read().await;
            if let Some(token) = guard.as_ref() {
                debug!(issued_at = %token.issued_at, "Using cached connection token");
                return Ok(token.secret.clone());
            }
        }

        let mut guard = self.cached.write().await;

        // Double-check after acquiring write lock
        if let Some(token) = guard.as_ref() {
            return Ok(token.secret.clone());
        }

        let token = ConnectionToken::new(self.store.get_connection_token().await?);
        info!(issued_at = %token.issued_at, "Fetched new connection token");
        let secret = token.secret.clone();
        *guard = Some(token);
        Ok(secret)
    }

    /// Drops the cached token.
    pub async fn clear_cached_credentials(&self) {
        if self.cached.write().await.take().is_some() {
            info!("Cleared cached connection token");
        }
    }

    /// Reacts to the terminal rejecting the current token.
    pub async fn handle_token_expired(&self) {
        warn!("Connection token expired, next request will fetch a new one");
        self.cached.write().await.take();
    }

    pub async fn has_cached_token(&self) -> bool {
        self.cached.read().await.is_some()
    }
}

#[async_trait]
impl ConnectionTokenSource for TokenProvider {
    async fn fetch_connection_token(&self) -> TerminalResult<String> {
        self.connection_token().await.map_err(|e| {
            TerminalError::new(TerminalErrorCode::ApiConnectionError, e.to_string())
        })
    }
}
