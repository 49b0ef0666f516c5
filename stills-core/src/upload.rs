//! The upload loop.
//!
//! Cycles the [`TransferCoordinator`] over the still ring forever (or
//! until stopped), pausing between attempts. Attempt `n` goes to slot
//! `n % ring_size` and is named `"frame n"`; the name keeps counting after
//! the slots wrap around.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::device::STILL_SLOTS;
use crate::error::StillsError;
use crate::frame::Frame;
use crate::policy::{Decision, RetryPolicy};
use crate::transfer::{TransferCoordinator, TransferOutcome};

// ── LoopConfig ───────────────────────────────────────────────────

/// Configuration for [`UploadLoop`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Number of slots cycled through (clamped to the device's ring).
    pub ring_size: u32,
    /// Pause between attempts in milliseconds.
    pub pause_ms: u64,
    /// Stop after this many attempts. `None` runs until stopped.
    pub max_attempts: Option<u64>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            ring_size: STILL_SLOTS,
            pause_ms: 100,
            max_attempts: None,
        }
    }
}

// ── LoopStats ────────────────────────────────────────────────────

/// Running totals published after every attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopStats {
    pub attempts: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
    /// Timeouts the retry policy let the loop survive.
    pub timeouts: u64,
    pub last_slot: u32,
    /// Whole attempt, lock wait included.
    pub last_outer: Duration,
    /// Upload issue to terminal event.
    pub last_inner: Duration,
}

// ── UploadLoop ───────────────────────────────────────────────────

/// Drives uploads of one frame across the still ring.
pub struct UploadLoop {
    coordinator: TransferCoordinator,
    frame: Frame,
    config: LoopConfig,
    policy: RetryPolicy,
    running: Arc<AtomicBool>,
    stats_tx: watch::Sender<LoopStats>,
    stats_rx: watch::Receiver<LoopStats>,
}

impl UploadLoop {
    pub fn new(
        coordinator: TransferCoordinator,
        frame: Frame,
        config: LoopConfig,
        policy: RetryPolicy,
    ) -> Self {
        let (stats_tx, stats_rx) = watch::channel(LoopStats::default());
        Self {
            coordinator,
            frame,
            config,
            policy,
            running: Arc::new(AtomicBool::new(true)),
            stats_tx,
            stats_rx,
        }
    }

    /// A cloneable stop handle. Storing `false` ends the loop after the
    /// current attempt, or before the first one if `run` has not started.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stats_receiver(&self) -> watch::Receiver<LoopStats> {
        self.stats_rx.clone()
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// `true` until the loop is stopped or `run` returns.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Effective ring size: configured value clamped to `1..=device slots`.
    pub fn ring_size(&self) -> u32 {
        self.config
            .ring_size
            .clamp(1, self.coordinator.slot_count().max(1))
    }

    /// Slot used by attempt `attempt`.
    pub fn slot_for(&self, attempt: u64) -> u32 {
        (attempt % u64::from(self.ring_size())) as u32
    }

    /// Display name of attempt `attempt`.
    pub fn name_for(attempt: u64) -> String {
        format!("frame {attempt}")
    }

    /// Run until stopped, the attempt limit is reached, or a failure the
    /// retry policy will not absorb.
    pub async fn run(&mut self) -> Result<LoopStats, StillsError> {
        let pause = Duration::from_millis(self.config.pause_ms);
        let mut stats = LoopStats::default();
        let mut lock_timeouts = 0u32;
        let mut transfer_timeouts = 0u32;
        let mut attempt = 0u64;

        info!(
            ring = self.ring_size(),
            ?pause,
            limit = ?self.config.max_attempts,
            "upload loop starting"
        );

        while self.is_running() {
            if self.config.max_attempts.is_some_and(|max| attempt >= max) {
                break;
            }

            let slot = self.slot_for(attempt);
            let name = Self::name_for(attempt);
            let started = Instant::now();
            let result = self.coordinator.upload(slot, &name, &self.frame).await;
            let outer = started.elapsed();

            stats.attempts += 1;
            stats.last_slot = slot;
            stats.last_outer = outer;

            match result {
                Ok(report) => {
                    lock_timeouts = 0;
                    transfer_timeouts = 0;
                    stats.last_inner = report.transfer_time;
                    match report.outcome {
                        TransferOutcome::Completed { .. } => stats.completed += 1,
                        TransferOutcome::Cancelled => stats.cancelled += 1,
                        TransferOutcome::Failed => stats.failed += 1,
                    }
                }
                Err(err) => {
                    let consecutive = match &err {
                        StillsError::LockTimeout(_) => {
                            lock_timeouts += 1;
                            lock_timeouts
                        }
                        StillsError::TransferTimeout { .. } => {
                            transfer_timeouts += 1;
                            transfer_timeouts
                        }
                        _ => 1,
                    };
                    match self.policy.decide(&err, consecutive) {
                        Decision::Retry(delay) => {
                            warn!("attempt #{attempt} ({name}) failed: {err}; continuing");
                            stats.timeouts += 1;
                            tokio::time::sleep(delay).await;
                        }
                        Decision::Abort => {
                            error!("attempt #{attempt} ({name}) failed: {err}");
                            let _ = self.stats_tx.send(stats.clone());
                            self.running.store(false, Ordering::SeqCst);
                            return Err(err);
                        }
                    }
                }
            }

            info!("Upload outer #{attempt} took {}ms", outer.as_millis());
            let _ = self.stats_tx.send(stats.clone());
            attempt += 1;

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = Self::wait_for_stop(&self.running) => break,
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(attempts = stats.attempts, completed = stats.completed, "upload loop stopped");
        Ok(stats)
    }

    /// Resolves when `running` becomes false.
    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{LockBehavior, SimulatedStills, TransferBehavior};
    use crate::frame::{FrameBuffer, PixelFormat};

    fn upload_loop(stills: &SimulatedStills, config: LoopConfig, policy: RetryPolicy) -> UploadLoop {
        let coordinator = TransferCoordinator::with_timeouts(
            Arc::new(stills.clone()),
            Duration::from_millis(100),
            Duration::from_millis(200),
        );
        let frame = FrameBuffer::new(PixelFormat::Yuva10, 4, 4).freeze();
        UploadLoop::new(coordinator, frame, config, policy)
    }

    fn limited(attempts: u64, ring_size: u32) -> LoopConfig {
        LoopConfig {
            ring_size,
            pause_ms: 1,
            max_attempts: Some(attempts),
        }
    }

    #[test]
    fn names_diverge_from_slots_after_wrap() {
        let stills = SimulatedStills::default();
        let l = upload_loop(&stills, LoopConfig::default(), RetryPolicy::fatal());
        assert_eq!(l.slot_for(0), 0);
        assert_eq!(l.slot_for(31), 31);
        assert_eq!(l.slot_for(32), 0);
        assert_eq!(l.slot_for(33), 1);
        assert_eq!(UploadLoop::name_for(33), "frame 33");
    }

    #[test]
    fn ring_size_is_clamped_to_device() {
        let stills = SimulatedStills::default();
        let l = upload_loop(&stills, limited(1, 64), RetryPolicy::fatal());
        assert_eq!(l.ring_size(), 32);
        let l = upload_loop(&stills, limited(1, 0), RetryPolicy::fatal());
        assert_eq!(l.ring_size(), 1);
    }

    #[tokio::test]
    async fn wraps_the_ring() {
        let stills = SimulatedStills::default();
        stills.set_transfer_delay(Duration::from_millis(1));
        let mut l = upload_loop(&stills, limited(6, 4), RetryPolicy::fatal());

        let stats = l.run().await.unwrap();
        assert_eq!(stats.attempts, 6);
        assert_eq!(stats.completed, 6);

        let slots: Vec<u32> = stills.uploads().iter().map(|u| u.slot).collect();
        assert_eq!(slots, vec![0, 1, 2, 3, 0, 1]);
        assert_eq!(stills.stored(0).unwrap().name, "frame 4");
        assert_eq!(stills.unlocks(), 6);
        assert!(!l.is_running());
    }

    #[tokio::test]
    async fn failed_and_cancelled_keep_looping() {
        let stills = SimulatedStills::default();
        stills.set_slot_behavior(1, TransferBehavior::Fail);
        stills.set_slot_behavior(2, TransferBehavior::Cancel);
        let mut l = upload_loop(&stills, limited(4, 32), RetryPolicy::fatal());

        let stats = l.run().await.unwrap();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stills.unlocks(), 4);
        assert_eq!(*l.stats_receiver().borrow(), stats);
    }

    #[tokio::test]
    async fn transfer_timeout_is_fatal_by_default() {
        let stills = SimulatedStills::default();
        stills.set_slot_behavior(1, TransferBehavior::Silent);
        let mut l = upload_loop(&stills, limited(10, 32), RetryPolicy::fatal());

        let err = l.run().await.unwrap_err();
        assert!(matches!(err, StillsError::TransferTimeout { slot: 1, .. }));
        assert_eq!(stills.uploads().len(), 2);
        assert!(!stills.is_locked());
        assert!(!l.is_running());
    }

    #[tokio::test]
    async fn tolerated_timeouts_move_on() {
        let stills = SimulatedStills::default();
        stills.set_slot_behavior(1, TransferBehavior::Silent);
        let policy = RetryPolicy {
            transfer_timeout_retries: 1,
            ..RetryPolicy::fatal()
        };
        let mut l = upload_loop(&stills, limited(3, 32), policy);

        let stats = l.run().await.unwrap();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.timeouts, 1);
        let slots: Vec<u32> = stills.uploads().iter().map(|u| u.slot).collect();
        assert_eq!(slots, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn lock_timeout_aborts_before_upload() {
        let stills = SimulatedStills::default();
        stills.set_lock_behavior(LockBehavior::Held);
        let mut l = upload_loop(&stills, limited(3, 32), RetryPolicy::fatal());

        let err = l.run().await.unwrap_err();
        assert!(matches!(err, StillsError::LockTimeout(_)));
        assert!(stills.uploads().is_empty());
    }

    #[tokio::test]
    async fn stop_before_run_uploads_nothing() {
        let stills = SimulatedStills::default();
        let mut l = upload_loop(&stills, LoopConfig::default(), RetryPolicy::fatal());
        l.stop_handle().store(false, Ordering::SeqCst);

        let stats = l.run().await.unwrap();
        assert_eq!(stats.attempts, 0);
        assert!(stills.uploads().is_empty());
        assert_eq!(stills.locks_granted(), 0);
    }

    #[tokio::test]
    async fn stop_handle_ends_unbounded_loop() {
        let stills = SimulatedStills::default();
        let mut l = upload_loop(
            &stills,
            LoopConfig {
                pause_ms: 10,
                ..LoopConfig::default()
            },
            RetryPolicy::fatal(),
        );
        let stop = l.stop_handle();
        let mut stats_rx = l.stats_receiver();

        let task = tokio::spawn(async move { l.run().await });
        stats_rx.changed().await.unwrap();
        stop.store(false, Ordering::SeqCst);

        let stats = task.await.unwrap().unwrap();
        assert!(stats.attempts >= 1);
        assert!(!stills.is_locked());
    }
}
