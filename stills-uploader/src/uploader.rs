//! Wiring from configuration to a running upload loop.
//!
//! Connects through the configured discovery, allocates and fills the
//! frame once, and builds the [`UploadLoop`] that cycles it over the
//! still ring.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use stills_core::device::sim::{SimulatedDiscovery, SimulatedStills, SimulatedSwitcher};
use stills_core::{
    ConnectFailure, DeviceSession, Discovery, Frame, StillsError, TransferCoordinator, UploadLoop,
};

use crate::config::UploaderConfig;

// ── Uploader ─────────────────────────────────────────────────────

/// Owns the configuration and the discovery collaborator.
pub struct Uploader {
    config: UploaderConfig,
    discovery: Arc<dyn Discovery>,
}

impl Uploader {
    /// Uploader backed by the simulated switcher described in
    /// `config.simulator`.
    pub fn simulated(config: UploaderConfig) -> Self {
        let stills = SimulatedStills::new(config.to_sim_behavior());
        let failures: Vec<ConnectFailure> = config
            .simulator
            .connect_failures
            .iter()
            .copied()
            .map(Into::into)
            .collect();
        let discovery = SimulatedDiscovery::with_failures(SimulatedSwitcher::new(stills), failures)
            .with_delay(Duration::from_millis(config.simulator.connect_delay_ms));
        Self::with_discovery(config, Arc::new(discovery))
    }

    pub fn with_discovery(config: UploaderConfig, discovery: Arc<dyn Discovery>) -> Self {
        Self { config, discovery }
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    /// Connect to the configured address.
    pub async fn connect(&self) -> Result<DeviceSession, StillsError> {
        info!("connecting to {}", self.config.device.address);
        DeviceSession::connect(
            Arc::clone(&self.discovery),
            &self.config.device.address,
            &self.config.retry,
        )
        .await
    }

    /// Allocate the frame on the device and fill it once.
    pub fn prepare_frame(&self, session: &DeviceSession) -> Result<Frame, StillsError> {
        let f = &self.config.frame;
        let mut buffer = session.create_frame(f.format, f.width, f.height)?;
        let seed = self.config.frame_seed();
        buffer.fill_seeded(seed);
        let frame = buffer.freeze();
        info!(
            width = frame.width(),
            height = frame.height(),
            bytes = frame.byte_len(),
            seed,
            "frame ready"
        );
        Ok(frame)
    }

    /// Build the upload loop for an established session.
    pub fn build_loop(&self, session: &DeviceSession) -> Result<UploadLoop, StillsError> {
        let stills = session.stills()?;
        let frame = self.prepare_frame(session)?;
        let coordinator = TransferCoordinator::with_timeouts(
            stills,
            self.config.lock_timeout(),
            self.config.transfer_timeout(),
        );
        Ok(UploadLoop::new(
            coordinator,
            frame,
            self.config.upload.clone(),
            self.config.retry.clone(),
        ))
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConnectFailure;

    fn quick_config() -> UploaderConfig {
        let mut cfg = UploaderConfig::default();
        cfg.simulator.connect_delay_ms = 0;
        cfg.simulator.transfer_delay_ms = 1;
        cfg.frame.width = 64;
        cfg.frame.height = 36;
        cfg.frame.seed = Some(1);
        cfg.upload.pause_ms = 1;
        cfg.upload.max_attempts = Some(3);
        cfg
    }

    #[tokio::test]
    async fn runs_configured_attempts() {
        let uploader = Uploader::simulated(quick_config());
        let session = uploader.connect().await.unwrap();
        let mut upload_loop = uploader.build_loop(&session).unwrap();
        let stats = upload_loop.run().await.unwrap();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.completed, 3);
    }

    #[tokio::test]
    async fn connect_failure_surfaces_reason() {
        let mut cfg = quick_config();
        cfg.simulator.connect_failures = vec![SimConnectFailure::IncompatibleFirmware];
        let err = Uploader::simulated(cfg).connect().await.unwrap_err();
        assert_eq!(err.to_string(), "Switcher has incompatible firmware");
    }

    #[tokio::test]
    async fn frame_matches_configured_shape() {
        let uploader = Uploader::simulated(quick_config());
        let session = uploader.connect().await.unwrap();
        let frame = uploader.prepare_frame(&session).unwrap();
        assert_eq!(frame.byte_len(), 64 * 36 * 4);

        let again = uploader.prepare_frame(&session).unwrap();
        assert_eq!(frame, again, "seeded frames are reproducible");
    }
}
