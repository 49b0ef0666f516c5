//! Device session establishment.
//!
//! Connecting goes through the blocking discovery collaborator, which can
//! take several seconds to answer either way (name resolution plus a
//! device round-trip). The call therefore runs on Tokio's blocking pool
//! so it never stalls the executor.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::device::{Discovery, MediaPool, Stills, Switcher};
use crate::error::StillsError;
use crate::frame::{FrameBuffer, PixelFormat};
use crate::policy::{Decision, RetryPolicy};

/// A connected switcher with its media-pool capability resolved.
pub struct DeviceSession {
    address: String,
    switcher: Arc<dyn Switcher>,
    media_pool: Arc<dyn MediaPool>,
    since: Instant,
}

impl DeviceSession {
    /// Connect to the switcher at `address`, retrying as `policy` allows.
    pub async fn connect(
        discovery: Arc<dyn Discovery>,
        address: &str,
        policy: &RetryPolicy,
    ) -> Result<Self, StillsError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(StillsError::EmptyAddress);
        }

        let mut failures = 0u32;
        loop {
            let err = match Self::connect_once(Arc::clone(&discovery), address).await {
                Ok(session) => return Ok(session),
                Err(e) => e,
            };
            failures += 1;
            match policy.decide(&err, failures) {
                Decision::Retry(delay) => {
                    warn!("connect to {address} failed ({err}); retry {failures} in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                Decision::Abort => return Err(err),
            }
        }
    }

    async fn connect_once(
        discovery: Arc<dyn Discovery>,
        address: &str,
    ) -> Result<Self, StillsError> {
        let target = address.to_string();
        let switcher = tokio::task::spawn_blocking(move || discovery.connect_to(&target)).await??;
        Self::from_switcher(address, switcher)
    }

    /// Wrap an already connected switcher.
    ///
    /// Fails with [`StillsError::MediaPoolUnavailable`] when the device
    /// API has no media pool; that is a version mismatch, not something
    /// a retry fixes.
    pub fn from_switcher(address: &str, switcher: Arc<dyn Switcher>) -> Result<Self, StillsError> {
        let media_pool = switcher
            .media_pool()
            .ok_or(StillsError::MediaPoolUnavailable)?;
        info!("Connected to {} at {address}", switcher.product_name());
        Ok(Self {
            address: address.to_string(),
            switcher,
            media_pool,
            since: Instant::now(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn product_name(&self) -> String {
        self.switcher.product_name()
    }

    pub fn connected_for(&self) -> Duration {
        self.since.elapsed()
    }

    pub fn media_pool(&self) -> &Arc<dyn MediaPool> {
        &self.media_pool
    }

    pub fn stills(&self) -> Result<Arc<dyn Stills>, StillsError> {
        self.media_pool
            .stills()
            .ok_or(StillsError::StillsUnavailable)
    }

    /// Allocate a frame buffer in the device's accepted shape.
    pub fn create_frame(
        &self,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<FrameBuffer, StillsError> {
        self.media_pool
            .create_frame(format, width, height)
            .ok_or(StillsError::FrameUnavailable)
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("address", &self.address)
            .field("since", &self.since)
            .finish_non_exhaustive()
    }
}
