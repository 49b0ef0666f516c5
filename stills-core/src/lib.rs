//! # stills-core
//!
//! Still-upload orchestration for a video switcher's media pool.
//!
//! This crate contains:
//! - **Device**: collaborator traits for discovery, media pool and stills
//!   pool, plus an in-process simulated switcher (`device::sim`)
//! - **Session**: `DeviceSession`, connect-by-address on the blocking pool
//! - **Frame**: `FrameBuffer` / `Frame`, writable and shared pixel storage
//! - **Lock**: `LockCoordinator` and the self-releasing `LockGuard`
//! - **Transfer**: `TransferCoordinator`, the lock → upload → await →
//!   release state machine
//! - **Upload**: `UploadLoop`, cycling uploads over the still ring
//! - **Policy**: `RetryPolicy` for connection failures and timeouts
//! - **Error**: `StillsError`, typed, `thiserror`-based error hierarchy

pub mod device;
pub mod error;
pub mod frame;
pub mod lock;
pub mod policy;
pub mod session;
pub mod transfer;
pub mod upload;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use device::{
    Discovery, LockToken, ListenerId, MediaPool, MediaPoolEvent, STILL_SLOTS, Stills,
    StillsListener, Switcher,
};
pub use error::{ConnectFailure, StillsError};
pub use frame::{Frame, FrameBuffer, HD_HEIGHT, HD_WIDTH, PixelFormat};
pub use lock::{LOCK_TIMEOUT, LockCoordinator, LockGuard};
pub use policy::{Backoff, Decision, RetryPolicy};
pub use session::DeviceSession;
pub use transfer::{
    TRANSFER_TIMEOUT, TransferCoordinator, TransferOutcome, TransferPhase, TransferReport,
};
pub use upload::{LoopConfig, LoopStats, UploadLoop};
