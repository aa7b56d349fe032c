//! Shared, lazily established Salesforce session.
//!
//! Concurrent callers never race to authenticate: the first caller without a
//! session takes the handshake lock, everyone else waits on it and then reuses
//! the session it produced (double-checked locking, same shape as a token
//! refresh).

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::AppError;
use crate::salesforce::auth::{Authenticator, Session};

/// Thread-safe holder of the current session.
///
/// # Thread Safety
///
/// - `current`: `RwLock` so requests read the session concurrently.
/// - `handshake_lock`: `Mutex` serializing authentication so only one
///   handshake is ever in flight.
pub struct SessionManager {
    authenticator: Arc<dyn Authenticator>,
    current: RwLock<Option<Arc<Session>>>,
    handshake_lock: Mutex<()>,
    handshakes: AtomicU64,
}

impl SessionManager {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            authenticator,
            current: RwLock::new(None),
            handshake_lock: Mutex::new(()),
            handshakes: AtomicU64::new(0),
        }
    }

    /// Returns the current session, authenticating first if there is none.
    ///
    /// # Errors
    ///
    /// Propagates the authenticator's error (typically
    /// `AppError::AuthenticationFailure`). A failed handshake leaves no
    /// session behind, so the next caller tries again.
    pub async fn session(&self) -> Result<Arc<Session>, AppError> {
        if let Some(session) = self.current.read().await.as_ref() {
            return Ok(session.clone());
        }

        let _handshake_guard = self.handshake_lock.lock().await;

        // Double-check: another caller may have authenticated while we waited
        if let Some(session) = self.current.read().await.as_ref() {
            return Ok(session.clone());
        }

        self.handshakes.fetch_add(1, Ordering::SeqCst);
        info!("[SFDC] Establishing session");

        let session = Arc::new(self.authenticator.authenticate().await?);
        *self.current.write().await = Some(session.clone());

        Ok(session)
    }

    /// Drops `stale` if it is still the current session.
    ///
    /// A caller that got a 401 passes the session it used; if another caller
    /// already replaced it, nothing happens and the newer session survives.
    pub async fn invalidate(&self, stale: &Arc<Session>) {
        let mut guard = self.current.write().await;
        match guard.as_ref() {
            Some(current) if Arc::ptr_eq(current, stale) => {
                warn!("[SFDC] Session rejected, will re-authenticate");
                *guard = None;
            }
            _ => info!("[SFDC] Session already replaced by another caller"),
        }
    }

    /// Runs `op` with the current session. If Salesforce rejects it, the
    /// session is dropped, re-established, and `op` runs once more.
    ///
    /// # Errors
    ///
    /// A second `AppError::SessionExpired` is returned as is, as is a failed
    /// re-authentication.
    pub async fn with_session<R, F, Fut>(&self, op: F) -> Result<R, AppError>
    where
        F: Fn(Arc<Session>) -> Fut,
        Fut: Future<Output = Result<R, AppError>>,
    {
        let session = self.session().await?;
        match op(session.clone()).await {
            Err(AppError::SessionExpired) => {
                self.invalidate(&session).await;
                op(self.session().await?).await
            }
            other => other,
        }
    }

    /// Number of handshakes performed so far.
    pub fn handshake_count(&self) -> u64 {
        self.handshakes.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use secrecy::{ExposeSecret, SecretString};
    use url::Url;

    /// Fake authenticator that counts calls and hands out numbered tokens.
    struct FakeAuthenticator {
        calls: AtomicU64,
        fail: AtomicBool,
    }

    impl FakeAuthenticator {
        fn new() -> Self {
            Self {
                calls: AtomicU64::new(0),
                fail: AtomicBool::new(false),
            }
        }
    }

    impl Authenticator for FakeAuthenticator {
        fn authenticate(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<Session, AppError>> + Send + '_>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                // Simulate a slow handshake so concurrent callers pile up
                tokio::time::sleep(Duration::from_millis(20)).await;
                if self.fail.load(Ordering::SeqCst) {
                    return Err(AppError::AuthenticationFailure("bad password".into()));
                }
                Ok(Session::new(
                    Url::parse("https://na1.salesforce.com").unwrap(),
                    SecretString::from(format!("token-{}", n)),
                ))
            })
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_handshake() {
        let auth = Arc::new(FakeAuthenticator::new());
        let manager = Arc::new(SessionManager::new(auth.clone()));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.session().await }));
        }

        let mut tokens = Vec::new();
        for handle in handles {
            let session = handle.await.unwrap().unwrap();
            tokens.push(session.access_token.expose_secret().to_string());
        }

        assert_eq!(manager.handshake_count(), 1);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
        assert!(tokens.iter().all(|t| t == "token-0"));
    }

    #[tokio::test]
    async fn invalidate_forces_single_reauthentication() {
        let auth = Arc::new(FakeAuthenticator::new());
        let manager = SessionManager::new(auth.clone());

        let first = manager.session().await.unwrap();
        manager.invalidate(&first).await;
        // Second invalidate with the same stale session is a no-op
        let second = manager.session().await.unwrap();
        manager.invalidate(&first).await;
        let third = manager.session().await.unwrap();

        assert_eq!(second.access_token.expose_secret(), "token-1");
        assert!(Arc::ptr_eq(&second, &third));
        assert_eq!(manager.handshake_count(), 2);
    }

    #[tokio::test]
    async fn with_session_repeats_once_on_rejection() {
        let auth = Arc::new(FakeAuthenticator::new());
        let manager = SessionManager::new(auth.clone());
        let seen = std::sync::Mutex::new(Vec::new());

        let result = manager
            .with_session(|session| {
                let token = session.access_token.expose_secret().to_string();
                seen.lock().unwrap().push(token.clone());
                async move {
                    if token == "token-0" {
                        Err(AppError::SessionExpired)
                    } else {
                        Ok(token)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "token-1");
        assert_eq!(*seen.lock().unwrap(), vec!["token-0", "token-1"]);
        assert_eq!(manager.handshake_count(), 2);

        // A second rejection is handed back
        let always: Result<(), AppError> = manager
            .with_session(|_| async { Err(AppError::SessionExpired) })
            .await;
        assert!(matches!(always, Err(AppError::SessionExpired)));
        assert_eq!(manager.handshake_count(), 3);
    }

    #[tokio::test]
    async fn failed_handshake_is_retried_by_next_caller() {
        let auth = Arc::new(FakeAuthenticator::new());
        auth.fail.store(true, Ordering::SeqCst);
        let manager = SessionManager::new(auth.clone());

        assert!(matches!(
            manager.session().await,
            Err(AppError::AuthenticationFailure(_))
        ));

        auth.fail.store(false, Ordering::SeqCst);
        assert!(manager.session().await.is_ok());
        assert_eq!(manager.handshake_count(), 2);
    }
}
