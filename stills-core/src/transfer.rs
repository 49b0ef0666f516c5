//! Upload of one frame into one still slot.
//!
//! An attempt walks the [`TransferPhase`] machine:
//!
//! ```text
//!  Idle ──► AwaitingLock ──► Locked ──► AwaitingTransfer ──┬─► Completed
//!   ▲            │                                         ├─► Cancelled
//!   │            ▼ (LockTimeout)                           ├─► Failed
//!   └────────────┴─────────────────────────────────────────┴─► TransferTimeout
//! ```
//!
//! Completion arrives on the device's notification thread through a
//! [`SlotListener`] that resolves a oneshot channel. The listener only
//! accepts terminal events for its own slot and its own attempt
//! generation; anything else is dropped. Before an attempt returns, on
//! every path, the pool lock is released and the listener deregistered.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::device::{ListenerId, MediaPoolEvent, Stills, StillsListener};
use crate::error::StillsError;
use crate::frame::Frame;
use crate::lock::LockCoordinator;

/// How long to wait for a terminal transfer event.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(10);

// ── TransferOutcome ──────────────────────────────────────────────

/// How the device ended a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Stored. `received` is the device's view of the uploaded frame.
    Completed { received: Option<Frame> },
    Cancelled,
    Failed,
}

impl TransferOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    fn from_event(event: MediaPoolEvent, frame: Option<Frame>) -> Option<Self> {
        match event {
            MediaPoolEvent::TransferCompleted => Some(Self::Completed { received: frame }),
            MediaPoolEvent::TransferCancelled => Some(Self::Cancelled),
            MediaPoolEvent::TransferFailed => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed { .. } => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// ── TransferPhase ────────────────────────────────────────────────

/// Where an upload attempt currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferPhase {
    #[default]
    Idle,
    AwaitingLock,
    Locked,
    AwaitingTransfer,
    Completed,
    Cancelled,
    Failed,
    TransferTimeout,
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "Idle",
            Self::AwaitingLock => "AwaitingLock",
            Self::Locked => "Locked",
            Self::AwaitingTransfer => "AwaitingTransfer",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
            Self::Failed => "Failed",
            Self::TransferTimeout => "TransferTimeout",
        };
        f.write_str(s)
    }
}

impl TransferPhase {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Failed | Self::TransferTimeout
        )
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Idle`.
    pub fn request_lock(&mut self) -> Result<(), StillsError> {
        match self {
            Self::Idle => {
                *self = Self::AwaitingLock;
                Ok(())
            }
            _ => Err(StillsError::ProtocolViolation(
                "cannot request lock: attempt already in progress",
            )),
        }
    }

    /// Valid from: `AwaitingLock`.
    pub fn lock_granted(&mut self) -> Result<(), StillsError> {
        match self {
            Self::AwaitingLock => {
                *self = Self::Locked;
                Ok(())
            }
            _ => Err(StillsError::ProtocolViolation(
                "cannot take lock: not awaiting one",
            )),
        }
    }

    /// Valid from: `Locked`.
    pub fn begin_transfer(&mut self) -> Result<(), StillsError> {
        match self {
            Self::Locked => {
                *self = Self::AwaitingTransfer;
                Ok(())
            }
            _ => Err(StillsError::ProtocolViolation(
                "cannot upload: stills pool not locked",
            )),
        }
    }

    /// Valid from: `AwaitingTransfer`.
    pub fn resolve(&mut self, outcome: &TransferOutcome) -> Result<(), StillsError> {
        match self {
            Self::AwaitingTransfer => {
                *self = match outcome {
                    TransferOutcome::Completed { .. } => Self::Completed,
                    TransferOutcome::Cancelled => Self::Cancelled,
                    TransferOutcome::Failed => Self::Failed,
                };
                Ok(())
            }
            _ => Err(StillsError::ProtocolViolation(
                "cannot resolve: no transfer outstanding",
            )),
        }
    }

    /// Valid from: `AwaitingTransfer`.
    pub fn expire(&mut self) -> Result<(), StillsError> {
        match self {
            Self::AwaitingTransfer => {
                *self = Self::TransferTimeout;
                Ok(())
            }
            _ => Err(StillsError::ProtocolViolation(
                "cannot expire: no transfer outstanding",
            )),
        }
    }

    /// Return to `Idle` from wherever the attempt stopped.
    pub fn reset(&mut self) {
        *self = Self::Idle;
    }
}

// ── SlotListener ─────────────────────────────────────────────────

/// Stills listener scoped to one slot and one attempt generation.
pub struct SlotListener {
    slot: u32,
    generation: u64,
    current: Arc<AtomicU64>,
    armed: AtomicBool,
    signal: Mutex<Option<oneshot::Sender<TransferOutcome>>>,
}

impl SlotListener {
    /// `current` is the coordinator's live generation counter; once it
    /// moves past `generation` this listener goes deaf.
    pub fn new(
        slot: u32,
        generation: u64,
        current: Arc<AtomicU64>,
        signal: oneshot::Sender<TransferOutcome>,
    ) -> Self {
        Self {
            slot,
            generation,
            current,
            armed: AtomicBool::new(false),
            signal: Mutex::new(Some(signal)),
        }
    }

    /// Start accepting events. Called right before the upload is issued
    /// so leftovers from an earlier transfer on the slot are ignored.
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Whether the completion signal has already been fired.
    pub fn is_resolved(&self) -> bool {
        self.signal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

impl StillsListener for SlotListener {
    fn notify(&self, event: MediaPoolEvent, frame: Option<Frame>, slot: u32) {
        if slot != self.slot {
            return;
        }
        let Some(outcome) = TransferOutcome::from_event(event, frame) else {
            return;
        };
        if !self.armed.load(Ordering::SeqCst)
            || self.current.load(Ordering::SeqCst) != self.generation
        {
            trace!(slot, generation = self.generation, %event, "dropping stale transfer event");
            return;
        }

        let sender = self
            .signal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match sender {
            // The waiter may have timed out already; nothing to do then.
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => trace!(slot, %event, "transfer already resolved"),
        }
    }
}

// ── ListenerRegistration ─────────────────────────────────────────

/// A listener registered with a stills pool, removed on drop.
pub struct ListenerRegistration {
    stills: Arc<dyn Stills>,
    id: Option<ListenerId>,
}

impl ListenerRegistration {
    pub fn register(stills: Arc<dyn Stills>, listener: Arc<dyn StillsListener>) -> Self {
        let id = stills.add_listener(listener);
        Self {
            stills,
            id: Some(id),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.id.is_some()
    }

    /// Deregister. Returns `false` if already removed.
    pub fn remove(&mut self) -> bool {
        match self.id.take() {
            Some(id) => {
                if !self.stills.remove_listener(id) {
                    warn!(listener = id.id(), "device did not know listener");
                }
                true
            }
            None => false,
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.remove();
    }
}

// ── TransferReport ───────────────────────────────────────────────

/// Result of an attempt that reached a terminal event.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub slot: u32,
    pub name: String,
    pub generation: u64,
    pub outcome: TransferOutcome,
    /// Time spent waiting for the pool lock.
    pub lock_wait: Duration,
    /// Upload issue to terminal event.
    pub transfer_time: Duration,
}

// ── TransferCoordinator ──────────────────────────────────────────

/// Runs upload attempts against one stills pool, one at a time.
pub struct TransferCoordinator {
    port: StillsPort,
    phase: TransferPhase,
}

/// Everything an attempt needs apart from the phase it advances.
struct StillsPort {
    stills: Arc<dyn Stills>,
    lock: LockCoordinator,
    transfer_timeout: Duration,
    generation: Arc<AtomicU64>,
}

/// Puts the phase back to `Idle` however the attempt ends, including
/// when the `upload` future is dropped mid-wait.
struct PhaseReset<'a>(&'a mut TransferPhase);

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        self.0.reset();
    }
}

impl TransferCoordinator {
    pub fn new(stills: Arc<dyn Stills>) -> Self {
        let lock = LockCoordinator::new(Arc::clone(&stills));
        Self::with_lock(stills, lock, TRANSFER_TIMEOUT)
    }

    pub fn with_timeouts(
        stills: Arc<dyn Stills>,
        lock_timeout: Duration,
        transfer_timeout: Duration,
    ) -> Self {
        let lock = LockCoordinator::with_timeout(Arc::clone(&stills), lock_timeout);
        Self::with_lock(stills, lock, transfer_timeout)
    }

    fn with_lock(stills: Arc<dyn Stills>, lock: LockCoordinator, transfer_timeout: Duration) -> Self {
        Self {
            port: StillsPort {
                stills,
                lock,
                transfer_timeout,
                generation: Arc::new(AtomicU64::new(0)),
            },
            phase: TransferPhase::Idle,
        }
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    /// Generation of the most recent attempt (0 before the first).
    pub fn generation(&self) -> u64 {
        self.port.generation.load(Ordering::SeqCst)
    }

    pub fn slot_count(&self) -> u32 {
        self.port.stills.slot_count()
    }

    /// Upload `frame` into `slot` under the pool lock and wait for the
    /// device to finish.
    ///
    /// `Cancelled` and `Failed` transfers come back as `Ok` with the
    /// outcome in the report; only the two timeouts and device refusals
    /// are errors. The lock and listener are gone when this returns, and
    /// the coordinator is `Idle` again even if the future is dropped
    /// before completing.
    pub async fn upload(
        &mut self,
        slot: u32,
        name: &str,
        frame: &Frame,
    ) -> Result<TransferReport, StillsError> {
        let ring = self.port.stills.slot_count();
        if slot >= ring {
            return Err(StillsError::SlotOutOfRange { slot, ring });
        }

        let generation = self.port.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut phase = PhaseReset(&mut self.phase);
        let result = self
            .port
            .attempt(&mut *phase.0, slot, name, frame, generation)
            .await;
        debug!(slot, generation, phase = %phase.0, "attempt finished");
        result
    }
}

impl StillsPort {
    async fn attempt(
        &self,
        phase: &mut TransferPhase,
        slot: u32,
        name: &str,
        frame: &Frame,
        generation: u64,
    ) -> Result<TransferReport, StillsError> {
        phase.request_lock()?;
        let mut lock = self.lock.acquire().await?;
        phase.lock_granted()?;

        let (tx, rx) = oneshot::channel();
        let listener = Arc::new(SlotListener::new(
            slot,
            generation,
            Arc::clone(&self.generation),
            tx,
        ));
        let mut registration =
            ListenerRegistration::register(Arc::clone(&self.stills), listener.clone());

        phase.begin_transfer()?;
        listener.arm();
        let started = Instant::now();
        self.stills.upload(slot, name, frame)?;

        let waited = tokio::time::timeout(self.transfer_timeout, rx).await;
        let transfer_time = started.elapsed();

        lock.release();
        registration.remove();

        match waited {
            Ok(Ok(outcome)) => {
                phase.resolve(&outcome)?;
                if outcome.is_completed() {
                    info!(
                        "Upload inner #{slot} took {}ms",
                        transfer_time.as_millis()
                    );
                } else {
                    warn!(slot, name, %outcome, "transfer did not complete");
                }
                Ok(TransferReport {
                    slot,
                    name: name.to_string(),
                    generation,
                    outcome,
                    lock_wait: lock.waited(),
                    transfer_time,
                })
            }
            Ok(Err(_)) => Err(StillsError::ProtocolViolation(
                "transfer signal dropped without an outcome",
            )),
            Err(_) => {
                phase.expire()?;
                Err(StillsError::TransferTimeout {
                    slot,
                    after: self.transfer_timeout,
                })
            }
        }
    }
}

impl fmt::Debug for TransferCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferCoordinator")
            .field("lock", &self.port.lock)
            .field("transfer_timeout", &self.port.transfer_timeout)
            .field("generation", &self.generation())
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

// ── Tests ────────────────────────────────────────────────────────
