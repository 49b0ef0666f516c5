//! In-process switcher for tests and dry runs.
//!
//! Implements every device trait with behaviour that can be scripted per
//! run: connect failures, how the pool lock is granted, and how each
//! slot's transfer ends. Lock grants and transfer notifications are
//! delivered from their own OS threads, the way a vendor SDK calls back
//! from its notification thread.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::{
    Discovery, LockCallback, LockToken, ListenerId, MediaPool, MediaPoolEvent, STILL_SLOTS,
    Stills, StillsListener, Switcher,
};
use crate::error::{ConnectFailure, StillsError};
use crate::frame::{Frame, FrameBuffer, PixelFormat};

// ── Behaviour ────────────────────────────────────────────────────

/// How the simulated pool answers lock requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBehavior {
    /// Grant as soon as the pool is free.
    Immediate,
    /// Grant after a delay, once the pool is free.
    After(Duration),
    /// Queue requests until [`SimulatedStills::grant_pending`] is called.
    Held,
}

/// How a transfer into a slot ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferBehavior {
    Complete,
    Cancel,
    Fail,
    /// Never report anything for the slot.
    Silent,
}

/// Scripted behaviour of a [`SimulatedStills`].
#[derive(Debug, Clone)]
pub struct SimBehavior {
    pub slot_count: u32,
    pub lock: LockBehavior,
    pub transfer: TransferBehavior,
    pub transfer_delay: Duration,
    /// Overrides `transfer` for individual slots.
    pub per_slot: HashMap<u32, TransferBehavior>,
    /// Most recent uploads kept for inspection; older ones are dropped.
    pub history: usize,
}

/// Default length of the upload history.
pub const UPLOAD_HISTORY: usize = 1024;

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            slot_count: STILL_SLOTS,
            lock: LockBehavior::Immediate,
            transfer: TransferBehavior::Complete,
            transfer_delay: Duration::from_millis(5),
            per_slot: HashMap::new(),
            history: UPLOAD_HISTORY,
        }
    }
}

// ── Records ──────────────────────────────────────────────────────

/// One `upload` call as seen by the device.
#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub slot: u32,
    pub name: String,
    pub fingerprint: blake3::Hash,
    /// Whether the pool lock was held when the upload was issued.
    pub locked: bool,
    pub issued_at: Instant,
}

/// What a slot holds after a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredStill {
    pub name: String,
    pub fingerprint: blake3::Hash,
}

// ── SimulatedStills ──────────────────────────────────────────────

#[derive(Default)]
struct StillsState {
    holder: Option<LockToken>,
    queued: VecDeque<LockCallback>,
    listeners: BTreeMap<u64, Arc<dyn StillsListener>>,
    uploads: VecDeque<UploadRecord>,
    uploads_issued: u64,
    stored: HashMap<u32, StoredStill>,
    locks_granted: u64,
    unlocks: u64,
    stale_unlocks: u64,
}

struct Shared {
    state: Mutex<StillsState>,
    behavior: Mutex<SimBehavior>,
    next_id: AtomicU64,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, StillsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn behavior(&self) -> MutexGuard<'_, SimBehavior> {
        self.behavior.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand the lock to the oldest queued request if the pool is free.
    fn grant_next(&self) -> bool {
        let (callback, token) = {
            let mut state = self.state();
            if state.holder.is_some() {
                return false;
            }
            let Some(callback) = state.queued.pop_front() else {
                return false;
            };
            let token = LockToken::new(self.next_id.fetch_add(1, Ordering::Relaxed));
            state.holder = Some(token);
            state.locks_granted += 1;
            (callback, token)
        };
        debug!(token = token.id(), "sim: lock granted");
        callback(token);
        true
    }

    fn emit(&self, event: MediaPoolEvent, frame: Option<Frame>, slot: u32) {
        let listeners: Vec<_> = self.state().listeners.values().cloned().collect();
        trace!(%event, slot, listeners = listeners.len(), "sim: notify");
        for listener in listeners {
            listener.notify(event, frame.clone(), slot);
        }
    }
}

fn schedule_grant(shared: &Arc<Shared>, delay: Duration) {
    let shared = Arc::clone(shared);
    thread::spawn(move || {
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        shared.grant_next();
    });
}

/// Simulated stills pool.
#[derive(Clone)]
pub struct SimulatedStills {
    shared: Arc<Shared>,
}

impl SimulatedStills {
    pub fn new(behavior: SimBehavior) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(StillsState::default()),
                behavior: Mutex::new(behavior),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    // ── Scripting ────────────────────────────────────────────────

    pub fn set_lock_behavior(&self, lock: LockBehavior) {
        self.shared.behavior().lock = lock;
    }

    pub fn set_transfer_behavior(&self, transfer: TransferBehavior) {
        self.shared.behavior().transfer = transfer;
    }

    pub fn set_slot_behavior(&self, slot: u32, transfer: TransferBehavior) {
        self.shared.behavior().per_slot.insert(slot, transfer);
    }

    pub fn set_transfer_delay(&self, delay: Duration) {
        self.shared.behavior().transfer_delay = delay;
    }

    /// Grant the oldest queued lock request now, on the calling thread.
    ///
    /// Returns `false` if nothing was queued or the pool is held.
    pub fn grant_pending(&self) -> bool {
        self.shared.grant_next()
    }

    /// Push a notification to every registered listener.
    pub fn emit(&self, event: MediaPoolEvent, frame: Option<Frame>, slot: u32) {
        self.shared.emit(event, frame, slot);
    }

    // ── Inspection ───────────────────────────────────────────────

    pub fn is_locked(&self) -> bool {
        self.shared.state().holder.is_some()
    }

    pub fn locks_granted(&self) -> u64 {
        self.shared.state().locks_granted
    }

    pub fn unlocks(&self) -> u64 {
        self.shared.state().unlocks
    }

    /// Unlock calls carrying a token that was not the current holder.
    pub fn stale_unlocks(&self) -> u64 {
        self.shared.state().stale_unlocks
    }

    pub fn queued_locks(&self) -> usize {
        self.shared.state().queued.len()
    }

    pub fn listener_count(&self) -> usize {
        self.shared.state().listeners.len()
    }

    /// The most recent uploads, oldest first, up to `history` of them.
    pub fn uploads(&self) -> Vec<UploadRecord> {
        self.shared.state().uploads.iter().cloned().collect()
    }

    /// Every upload call accepted since creation.
    pub fn uploads_issued(&self) -> u64 {
        self.shared.state().uploads_issued
    }

    pub fn stored(&self, slot: u32) -> Option<StoredStill> {
        self.shared.state().stored.get(&slot).cloned()
    }
}

impl Default for SimulatedStills {
    fn default() -> Self {
        Self::new(SimBehavior::default())
    }
}

impl Stills for SimulatedStills {
    fn slot_count(&self) -> u32 {
        self.shared.behavior().slot_count
    }

    fn lock(&self, on_obtained: LockCallback) {
        let lock = self.shared.behavior().lock;
        self.shared.state().queued.push_back(on_obtained);
        match lock {
            LockBehavior::Immediate => schedule_grant(&self.shared, Duration::ZERO),
            LockBehavior::After(delay) => schedule_grant(&self.shared, delay),
            LockBehavior::Held => debug!("sim: lock request queued"),
        }
    }

    fn unlock(&self, token: LockToken) {
        let regrant = {
            let mut state = self.shared.state();
            if state.holder != Some(token) {
                state.stale_unlocks += 1;
                debug!(token = token.id(), "sim: ignoring stale unlock");
                return;
            }
            state.holder = None;
            state.unlocks += 1;
            !state.queued.is_empty()
        };
        debug!(token = token.id(), "sim: lock released");
        if regrant {
            match self.shared.behavior().lock {
                LockBehavior::Immediate => schedule_grant(&self.shared, Duration::ZERO),
                LockBehavior::After(delay) => schedule_grant(&self.shared, delay),
                LockBehavior::Held => {}
            }
        }
    }

    fn add_listener(&self, listener: Arc<dyn StillsListener>) -> ListenerId {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.state().listeners.insert(id, listener);
        ListenerId::new(id)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.state().listeners.remove(&id.id()).is_some()
    }

    fn upload(&self, slot: u32, name: &str, frame: &Frame) -> Result<(), StillsError> {
        let (ring, outcome, delay, history) = {
            let behavior = self.shared.behavior();
            let outcome = behavior
                .per_slot
                .get(&slot)
                .copied()
                .unwrap_or(behavior.transfer);
            (
                behavior.slot_count,
                outcome,
                behavior.transfer_delay,
                behavior.history,
            )
        };
        if slot >= ring {
            return Err(StillsError::SlotOutOfRange { slot, ring });
        }

        {
            let mut state = self.shared.state();
            let locked = state.holder.is_some();
            state.uploads_issued += 1;
            if history > 0 {
                while state.uploads.len() >= history {
                    state.uploads.pop_front();
                }
                state.uploads.push_back(UploadRecord {
                    slot,
                    name: name.to_string(),
                    fingerprint: frame.fingerprint(),
                    locked,
                    issued_at: Instant::now(),
                });
            }
        }

        let shared = Arc::clone(&self.shared);
        let name = name.to_string();
        let frame = frame.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            match outcome {
                TransferBehavior::Complete => {
                    shared.state().stored.insert(
                        slot,
                        StoredStill {
                            name,
                            fingerprint: frame.fingerprint(),
                        },
                    );
                    shared.emit(MediaPoolEvent::ValidChanged, None, slot);
                    shared.emit(MediaPoolEvent::NameChanged, None, slot);
                    shared.emit(MediaPoolEvent::TransferCompleted, Some(frame), slot);
                }
                TransferBehavior::Cancel => {
                    shared.emit(MediaPoolEvent::TransferCancelled, None, slot)
                }
                TransferBehavior::Fail => shared.emit(MediaPoolEvent::TransferFailed, None, slot),
                TransferBehavior::Silent => debug!(slot, "sim: swallowing transfer"),
            }
        });
        Ok(())
    }
}

// ── SimulatedSwitcher ────────────────────────────────────────────

struct SimulatedMediaPool {
    stills: Option<SimulatedStills>,
    frames: bool,
}

impl MediaPool for SimulatedMediaPool {
    fn create_frame(&self, format: PixelFormat, width: u32, height: u32) -> Option<FrameBuffer> {
        (self.frames && width > 0 && height > 0).then(|| FrameBuffer::new(format, width, height))
    }

    fn stills(&self) -> Option<Arc<dyn Stills>> {
        self.stills
            .clone()
            .map(|s| Arc::new(s) as Arc<dyn Stills>)
    }
}

/// A connected simulated switcher.
#[derive(Clone)]
pub struct SimulatedSwitcher {
    stills: SimulatedStills,
    media_pool: bool,
    stills_pool: bool,
    frames: bool,
}

impl SimulatedSwitcher {
    pub fn new(stills: SimulatedStills) -> Self {
        Self {
            stills,
            media_pool: true,
            stills_pool: true,
            frames: true,
        }
    }

    /// Behave like an API version without the media-pool capability.
    pub fn without_media_pool(mut self) -> Self {
        self.media_pool = false;
        self
    }

    pub fn without_stills(mut self) -> Self {
        self.stills_pool = false;
        self
    }

    /// Refuse every frame allocation.
    pub fn without_frames(mut self) -> Self {
        self.frames = false;
        self
    }

    pub fn stills(&self) -> &SimulatedStills {
        &self.stills
    }
}

impl Switcher for SimulatedSwitcher {
    fn product_name(&self) -> String {
        "Simulated Switcher".to_string()
    }

    fn media_pool(&self) -> Option<Arc<dyn MediaPool>> {
        if !self.media_pool {
            return None;
        }
        Some(Arc::new(SimulatedMediaPool {
            stills: self.stills_pool.then(|| self.stills.clone()),
            frames: self.frames,
        }))
    }
}

// ── SimulatedDiscovery ───────────────────────────────────────────

/// Discovery that fails with a scripted sequence before connecting.
pub struct SimulatedDiscovery {
    switcher: SimulatedSwitcher,
    failures: Mutex<VecDeque<ConnectFailure>>,
    delay: Duration,
    attempts: AtomicU32,
}

impl SimulatedDiscovery {
    pub fn new(switcher: SimulatedSwitcher) -> Self {
        Self::with_failures(switcher, std::iter::empty())
    }

    /// Fail once per entry of `failures`, in order, then connect.
    pub fn with_failures(
        switcher: SimulatedSwitcher,
        failures: impl IntoIterator<Item = ConnectFailure>,
    ) -> Self {
        Self {
            switcher,
            failures: Mutex::new(failures.into_iter().collect()),
            delay: Duration::ZERO,
            attempts: AtomicU32::new(0),
        }
    }

    /// Block each connect call for `delay`, like name resolution would.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Discovery for SimulatedDiscovery {
    fn connect_to(&self, address: &str) -> Result<Arc<dyn Switcher>, ConnectFailure> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let failure = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match failure {
            Some(reason) => {
                debug!(address, %reason, "sim: connect refused");
                Err(reason)
            }
            None => Ok(Arc::new(self.switcher.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    struct Recorder(Mutex<Vec<(MediaPoolEvent, u32)>>);

    impl StillsListener for Recorder {
        fn notify(&self, event: MediaPoolEvent, _frame: Option<Frame>, slot: u32) {
            self.0.lock().unwrap().push((event, slot));
        }
    }

    fn frame() -> Frame {
        FrameBuffer::new(PixelFormat::Yuva10, 4, 4).freeze()
    }

    #[test]
    fn lock_is_exclusive_and_queued() {
        let stills = SimulatedStills::default();
        stills.set_lock_behavior(LockBehavior::Held);

        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        stills.lock(Box::new(move |t| tx.send(t).unwrap()));
        stills.lock(Box::new(move |t| tx2.send(t).unwrap()));
        assert_eq!(stills.queued_locks(), 2);

        assert!(stills.grant_pending());
        assert_eq!(stills.queued_locks(), 1);
        let first = rx.recv().unwrap();
        assert!(!stills.grant_pending(), "pool already held");

        stills.unlock(first);
        assert!(stills.grant_pending());
        let second = rx.recv().unwrap();
        assert_ne!(first, second);
        assert_eq!(stills.locks_granted(), 2);
    }

    #[test]
    fn stale_unlock_is_ignored() {
        let stills = SimulatedStills::default();
        stills.set_lock_behavior(LockBehavior::Held);
        let (tx, rx) = mpsc::channel();
        stills.lock(Box::new(move |t| tx.send(t).unwrap()));
        stills.grant_pending();
        let token = rx.recv().unwrap();

        stills.unlock(token);
        stills.unlock(token);
        assert_eq!(stills.unlocks(), 1);
        assert_eq!(stills.stale_unlocks(), 1);
        assert!(!stills.is_locked());
    }

    #[test]
    fn completed_upload_notifies_listeners() {
        let stills = SimulatedStills::default();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let id = stills.add_listener(recorder.clone());

        stills.upload(3, "frame 3", &frame()).unwrap();
        thread::sleep(Duration::from_millis(200));

        let seen = recorder.0.lock().unwrap().clone();
        assert!(seen.contains(&(MediaPoolEvent::TransferCompleted, 3)));
        assert_eq!(stills.stored(3).unwrap().name, "frame 3");

        assert!(stills.remove_listener(id));
        assert!(!stills.remove_listener(id));
    }

    #[test]
    fn upload_outside_ring_is_refused() {
        let stills = SimulatedStills::default();
        let err = stills.upload(STILL_SLOTS, "x", &frame()).unwrap_err();
        assert!(matches!(err, StillsError::SlotOutOfRange { slot: 32, ring: 32 }));
        assert!(stills.uploads().is_empty());
    }

    #[test]
    fn upload_history_is_bounded() {
        let stills = SimulatedStills::new(SimBehavior {
            transfer: TransferBehavior::Silent,
            transfer_delay: Duration::ZERO,
            history: 3,
            ..SimBehavior::default()
        });
        for slot in 0..5 {
            stills.upload(slot, &format!("frame {slot}"), &frame()).unwrap();
        }
        let slots: Vec<u32> = stills.uploads().iter().map(|u| u.slot).collect();
        assert_eq!(slots, vec![2, 3, 4]);
        assert_eq!(stills.uploads_issued(), 5);
    }

    #[test]
    fn discovery_replays_failures() {
        let discovery = SimulatedDiscovery::with_failures(
            SimulatedSwitcher::new(SimulatedStills::default()),
            [ConnectFailure::NoResponse],
        );
        assert_eq!(
            discovery.connect_to("10.0.0.1").err(),
            Some(ConnectFailure::NoResponse)
        );
        assert!(discovery.connect_to("10.0.0.1").is_ok());
        assert_eq!(discovery.attempts(), 2);
    }

    #[test]
    fn capabilities_can_be_removed() {
        let sw = SimulatedSwitcher::new(SimulatedStills::default()).without_media_pool();
        assert!(sw.media_pool().is_none());

        let sw = SimulatedSwitcher::new(SimulatedStills::default()).without_frames();
        let pool = sw.media_pool().unwrap();
        assert!(pool.create_frame(PixelFormat::Yuva10, 16, 16).is_none());
        assert!(pool.stills().is_some());
    }
}
