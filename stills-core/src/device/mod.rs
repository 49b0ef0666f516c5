//! Collaborator surface of a switcher device.
//!
//! These traits describe what the vendor integration layer provides:
//! discovery, the media pool, and the stills pool with its lock and
//! push-notification listeners. Everything above this module talks to a
//! device only through them, so a real SDK binding and the in-process
//! [`sim`] device are interchangeable.
//!
//! ```text
//! Discovery ──connect──► Switcher ──► MediaPool ──► Stills
//!                                        │            ├─ lock(cb) / unlock(token)
//!                                        │            ├─ add_listener / remove_listener
//!                                        └ create_frame └─ upload(slot, name, frame)
//! ```
//!
//! Callbacks (`LockCallback`, [`StillsListener::notify`]) may be invoked
//! from any thread the device chooses, including after the caller has
//! stopped waiting.

pub mod sim;

use std::fmt;
use std::sync::Arc;

use crate::error::{ConnectFailure, StillsError};
use crate::frame::{Frame, FrameBuffer, PixelFormat};

/// Still slots exposed by the switcher's media pool.
pub const STILL_SLOTS: u32 = 32;

// ── Identifiers ──────────────────────────────────────────────────

/// Proof of held exclusive access to a stills pool.
///
/// Handed to the lock callback by the device and passed back to
/// [`Stills::unlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(u64);

impl LockToken {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

/// Handle returned by [`Stills::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

// ── MediaPoolEvent ───────────────────────────────────────────────

/// Kinds of notification pushed by a stills pool.
///
/// Only the three `Transfer*` kinds end a transfer; the rest are state
/// chatter every listener sees and must ignore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaPoolEvent {
    /// A slot's valid flag changed.
    ValidChanged,
    /// A slot was renamed.
    NameChanged,
    /// Another client holds the pool lock.
    LockBusy,
    /// The pool lock became free.
    LockIdle,
    /// A transfer finished and the device stored the frame.
    TransferCompleted,
    /// A transfer was cancelled by the device.
    TransferCancelled,
    /// A transfer failed on the device.
    TransferFailed,
}

impl MediaPoolEvent {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::TransferCompleted | Self::TransferCancelled | Self::TransferFailed
        )
    }
}

impl fmt::Display for MediaPoolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ValidChanged => "valid-changed",
            Self::NameChanged => "name-changed",
            Self::LockBusy => "lock-busy",
            Self::LockIdle => "lock-idle",
            Self::TransferCompleted => "transfer-completed",
            Self::TransferCancelled => "transfer-cancelled",
            Self::TransferFailed => "transfer-failed",
        };
        f.write_str(s)
    }
}

// ── Callbacks ────────────────────────────────────────────────────

/// One-shot callback invoked when the device grants the pool lock.
pub type LockCallback = Box<dyn FnOnce(LockToken) + Send + 'static>;

/// Receiver of every stills-pool notification.
///
/// `frame` is only populated for [`MediaPoolEvent::TransferCompleted`]
/// and carries what the device received.
pub trait StillsListener: Send + Sync {
    fn notify(&self, event: MediaPoolEvent, frame: Option<Frame>, slot: u32);
}

// ── Device traits ────────────────────────────────────────────────

/// Connects to switchers by address. Blocking and slow.
pub trait Discovery: Send + Sync {
    fn connect_to(&self, address: &str) -> Result<Arc<dyn Switcher>, ConnectFailure>;
}

/// A connected switcher.
pub trait Switcher: Send + Sync {
    /// Human-readable model name, for logs.
    fn product_name(&self) -> String;

    /// The media-pool capability, if this device/API version has one.
    fn media_pool(&self) -> Option<Arc<dyn MediaPool>>;
}

/// Still and clip storage on the switcher.
pub trait MediaPool: Send + Sync {
    /// Allocate a zeroed frame in the device's accepted shape.
    fn create_frame(&self, format: PixelFormat, width: u32, height: u32) -> Option<FrameBuffer>;

    /// The stills pool, if present.
    fn stills(&self) -> Option<Arc<dyn Stills>>;
}

/// The still-image slots of a media pool.
pub trait Stills: Send + Sync {
    /// Number of addressable still slots.
    fn slot_count(&self) -> u32;

    /// Request exclusive access. `on_obtained` fires at most once.
    fn lock(&self, on_obtained: LockCallback);

    /// Give back a previously granted lock. Stale tokens are ignored.
    fn unlock(&self, token: LockToken);

    fn add_listener(&self, listener: Arc<dyn StillsListener>) -> ListenerId;

    /// Returns `false` if `id` was not registered.
    fn remove_listener(&self, id: ListenerId) -> bool;

    /// Start a transfer into `slot`. Completion is reported through the
    /// listeners; an `Err` means the device refused to start at all.
    fn upload(&self, slot: u32, name: &str, frame: &Frame) -> Result<(), StillsError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transfer_events_are_terminal() {
        assert!(MediaPoolEvent::TransferCompleted.is_terminal());
        assert!(MediaPoolEvent::TransferCancelled.is_terminal());
        assert!(MediaPoolEvent::TransferFailed.is_terminal());
        assert!(!MediaPoolEvent::ValidChanged.is_terminal());
        assert!(!MediaPoolEvent::LockIdle.is_terminal());
    }

    #[test]
    fn event_display() {
        assert_eq!(
            MediaPoolEvent::TransferCompleted.to_string(),
            "transfer-completed"
        );
        assert_eq!(MediaPoolEvent::LockBusy.to_string(), "lock-busy");
    }
}
