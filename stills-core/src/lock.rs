//! Exclusive access to a stills pool.
//!
//! The device grants its pool lock through a callback on its own
//! notification thread. [`LockCoordinator::acquire`] bridges that
//! callback into a bounded async wait and returns a [`LockGuard`] which
//! gives the lock back exactly once: explicitly through
//! [`LockGuard::release`], or on drop.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::device::{LockToken, Stills};
use crate::error::StillsError;

/// How long to wait for the device to grant the pool lock.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(3);

// ── LockCoordinator ──────────────────────────────────────────────

/// Requests the stills-pool lock and waits for it.
#[derive(Clone)]
pub struct LockCoordinator {
    stills: Arc<dyn Stills>,
    timeout: Duration,
}

impl LockCoordinator {
    pub fn new(stills: Arc<dyn Stills>) -> Self {
        Self::with_timeout(stills, LOCK_TIMEOUT)
    }

    pub fn with_timeout(stills: Arc<dyn Stills>, timeout: Duration) -> Self {
        Self { stills, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Request the lock and wait until it is granted or the timeout
    /// elapses.
    ///
    /// A grant that arrives after this call has returned
    /// [`StillsError::LockTimeout`] is unlocked by the callback itself,
    /// so an abandoned request never leaves the pool held.
    pub async fn acquire(&self) -> Result<LockGuard, StillsError> {
        let (tx, mut rx) = oneshot::channel::<LockToken>();
        let stills = Arc::clone(&self.stills);
        let requested = Instant::now();

        self.stills.lock(Box::new(move |token| {
            if let Err(token) = tx.send(token) {
                warn!(token = token.id(), "lock granted after waiter gave up; releasing");
                stills.unlock(token);
            }
        }));

        let token = match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(Ok(token)) => token,
            Ok(Err(_)) => {
                return Err(StillsError::ProtocolViolation(
                    "device dropped lock callback without granting",
                ));
            }
            Err(_) => {
                // Close first so a racing grant either lands here or is
                // bounced back to the device by the callback.
                rx.close();
                match rx.try_recv() {
                    Ok(token) => token,
                    Err(_) => return Err(StillsError::LockTimeout(self.timeout)),
                }
            }
        };

        let waited = requested.elapsed();
        debug!(token = token.id(), ?waited, "stills lock obtained");
        Ok(LockGuard {
            stills: Arc::clone(&self.stills),
            token: Some(token),
            waited,
        })
    }
}

impl fmt::Debug for LockCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockCoordinator")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

// ── LockGuard ────────────────────────────────────────────────────

/// A held stills-pool lock.
pub struct LockGuard {
    stills: Arc<dyn Stills>,
    token: Option<LockToken>,
    waited: Duration,
}

impl LockGuard {
    /// The device token, or `None` once released.
    pub fn token(&self) -> Option<LockToken> {
        self.token
    }

    pub fn is_held(&self) -> bool {
        self.token.is_some()
    }

    /// Time between the lock request and the grant.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Give the lock back. Returns `false` if it was already released.
    pub fn release(&mut self) -> bool {
        match self.token.take() {
            Some(token) => {
                self.stills.unlock(token);
                debug!(token = token.id(), "stills lock released");
                true
            }
            None => false,
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("token", &self.token)
            .field("waited", &self.waited)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{LockBehavior, SimulatedStills};

    fn coordinator(stills: &SimulatedStills, timeout: Duration) -> LockCoordinator {
        LockCoordinator::with_timeout(Arc::new(stills.clone()), timeout)
    }

    #[tokio::test]
    async fn grant_then_release_once() {
        let stills = SimulatedStills::default();
        let mut guard = coordinator(&stills, LOCK_TIMEOUT).acquire().await.unwrap();
        assert!(guard.is_held());
        assert!(stills.is_locked());

        assert!(guard.release());
        assert!(!guard.release());
        drop(guard);

        assert!(!stills.is_locked());
        assert_eq!(stills.unlocks(), 1);
        assert_eq!(stills.stale_unlocks(), 0);
    }

    #[tokio::test]
    async fn drop_releases() {
        let stills = SimulatedStills::default();
        {
            let _guard = coordinator(&stills, LOCK_TIMEOUT).acquire().await.unwrap();
            assert!(stills.is_locked());
        }
        assert!(!stills.is_locked());
        assert_eq!(stills.unlocks(), 1);
    }

    #[tokio::test]
    async fn times_out_when_never_granted() {
        let stills = SimulatedStills::default();
        stills.set_lock_behavior(LockBehavior::Held);

        let err = coordinator(&stills, Duration::from_millis(50))
            .acquire()
            .await
            .unwrap_err();
        assert!(matches!(err, StillsError::LockTimeout(d) if d == Duration::from_millis(50)));
        assert!(!stills.is_locked());
    }

    #[tokio::test]
    async fn late_grant_is_handed_back() {
        let stills = SimulatedStills::default();
        stills.set_lock_behavior(LockBehavior::Held);

        let result = coordinator(&stills, Duration::from_millis(20)).acquire().await;
        assert!(result.is_err());

        assert!(stills.grant_pending());
        assert_eq!(stills.locks_granted(), 1);
        assert!(!stills.is_locked(), "late grant must be released");
        assert_eq!(stills.unlocks(), 1);
    }

    #[tokio::test]
    async fn second_acquire_after_release() {
        let stills = SimulatedStills::default();
        let coord = coordinator(&stills, LOCK_TIMEOUT);

        let first = coord.acquire().await.unwrap();
        let first_token = first.token();
        drop(first);

        let second = coord.acquire().await.unwrap();
        assert_ne!(second.token(), first_token);
        assert_eq!(stills.locks_granted(), 2);
    }
}
