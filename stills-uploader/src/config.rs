//! Configuration for the still uploader.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use stills_core::device::sim::{LockBehavior, SimBehavior, TransferBehavior};
use stills_core::{ConnectFailure, HD_HEIGHT, HD_WIDTH, LoopConfig, PixelFormat, RetryPolicy};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    /// Which switcher to talk to.
    pub device: DeviceConfig,
    /// Shape and content of the uploaded frame.
    pub frame: FrameConfig,
    /// Lock and transfer deadlines.
    pub timing: TimingConfig,
    /// Slot ring, pacing and attempt limit.
    pub upload: LoopConfig,
    /// Reaction to connection failures and timeouts.
    pub retry: RetryPolicy,
    /// Behaviour of the simulated switcher.
    pub simulator: SimulatorConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Device settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Switcher IP address or hostname.
    pub address: String,
}

/// Frame settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    pub width: u32,
    pub height: u32,
    /// Pixel format: "yuva10", "argb8" or "yuv8".
    pub format: PixelFormat,
    /// Seed for the frame noise. A fresh seed is picked per run if unset.
    pub seed: Option<u64>,
}

/// Coordination deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How long to wait for the stills lock, in milliseconds.
    pub lock_timeout_ms: u64,
    /// How long to wait for a transfer to end, in milliseconds.
    pub transfer_timeout_ms: u64,
}

/// Connect failure names accepted in `simulator.connect_failures`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimConnectFailure {
    NoResponse,
    IncompatibleFirmware,
    Unknown,
}

impl From<SimConnectFailure> for ConnectFailure {
    fn from(f: SimConnectFailure) -> Self {
        match f {
            SimConnectFailure::NoResponse => ConnectFailure::NoResponse,
            SimConnectFailure::IncompatibleFirmware => ConnectFailure::IncompatibleFirmware,
            SimConnectFailure::Unknown => ConnectFailure::Unknown,
        }
    }
}

/// Simulated switcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// How long each connect attempt blocks, in milliseconds.
    pub connect_delay_ms: u64,
    /// Failures reported by successive connect attempts before success.
    pub connect_failures: Vec<SimConnectFailure>,
    /// Delay before the lock is granted, in milliseconds.
    pub lock_delay_ms: u64,
    /// Never grant the lock.
    pub lock_never_granted: bool,
    /// Transfer duration, in milliseconds.
    pub transfer_delay_ms: u64,
    /// Slots whose transfers fail.
    pub failing_slots: Vec<u32>,
    /// Slots whose transfers are cancelled.
    pub cancelled_slots: Vec<u32>,
    /// Slots whose transfers never report back.
    pub silent_slots: Vec<u32>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: "10.42.13.99".into(),
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            width: HD_WIDTH,
            height: HD_HEIGHT,
            format: PixelFormat::Yuva10,
            seed: None,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 3_000,
            transfer_timeout_ms: 10_000,
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            connect_delay_ms: 250,
            connect_failures: Vec::new(),
            lock_delay_ms: 2,
            lock_never_granted: false,
            transfer_delay_ms: 40,
            failing_slots: Vec::new(),
            cancelled_slots: Vec::new(),
            silent_slots: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl UploaderConfig {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields the defaults; an unreadable or malformed one
    /// is an error.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config at {}; using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.lock_timeout_ms.max(1))
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.transfer_timeout_ms.max(1))
    }

    /// Frame seed, picking one from the clock when none is configured.
    pub fn frame_seed(&self) -> u64 {
        self.frame.seed.unwrap_or_else(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or_default()
        })
    }

    /// Convert simulator settings into scripted device behaviour.
    pub fn to_sim_behavior(&self) -> SimBehavior {
        let sim = &self.simulator;
        let lock = if sim.lock_never_granted {
            LockBehavior::Held
        } else if sim.lock_delay_ms == 0 {
            LockBehavior::Immediate
        } else {
            LockBehavior::After(Duration::from_millis(sim.lock_delay_ms))
        };

        let mut behavior = SimBehavior {
            lock,
            transfer_delay: Duration::from_millis(sim.transfer_delay_ms),
            ..SimBehavior::default()
        };
        let scripted = [
            (&sim.failing_slots, TransferBehavior::Fail),
            (&sim.cancelled_slots, TransferBehavior::Cancel),
            (&sim.silent_slots, TransferBehavior::Silent),
        ];
        for (slots, outcome) in scripted {
            for &slot in slots {
                behavior.per_slot.insert(slot, outcome);
            }
        }
        behavior
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = UploaderConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("address"));
        assert!(text.contains("lock_timeout_ms"));
        assert!(text.contains("yuva10"));
    }

    #[test]
    fn roundtrip_config() {
        let text = toml::to_string_pretty(&UploaderConfig::default()).unwrap();
        let parsed: UploaderConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.device.address, "10.42.13.99");
        assert_eq!(parsed.upload.ring_size, 32);
        assert_eq!(parsed.upload.pause_ms, 100);
        assert_eq!(parsed.retry, RetryPolicy::fatal());
    }

    #[test]
    fn defaults_match_device_contract() {
        let cfg = UploaderConfig::default();
        assert_eq!(cfg.lock_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.transfer_timeout(), Duration::from_secs(10));
        assert_eq!((cfg.frame.width, cfg.frame.height), (1920, 1080));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let parsed: UploaderConfig = toml::from_str(
            r#"
            [device]
            address = "192.168.1.240"

            [simulator]
            connect_failures = ["no-response", "incompatible-firmware"]
            failing_slots = [5]
            "#,
        )
        .unwrap();
        assert_eq!(parsed.device.address, "192.168.1.240");
        assert_eq!(parsed.timing.lock_timeout_ms, 3_000);
        assert_eq!(
            parsed.simulator.connect_failures,
            vec![
                SimConnectFailure::NoResponse,
                SimConnectFailure::IncompatibleFirmware
            ]
        );

        let behavior = parsed.to_sim_behavior();
        assert_eq!(behavior.per_slot.get(&5), Some(&TransferBehavior::Fail));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join("stills-uploader-config-does-not-exist.toml");
        let cfg = UploaderConfig::load(&path).unwrap();
        assert_eq!(cfg.device.address, "10.42.13.99");
    }

    #[test]
    fn malformed_file_is_rejected() {
        let path = std::env::temp_dir().join(format!(
            "stills-uploader-config-bad-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "[retry]\nlock_timeout_retries = \"three\"\n").unwrap();
        let err = UploaderConfig::load(&path).unwrap_err();
        let _ = std::fs::remove_file(&path);
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn written_default_loads_back() {
        let path = std::env::temp_dir().join(format!(
            "stills-uploader-config-default-{}.toml",
            std::process::id()
        ));
        UploaderConfig::write_default(&path).unwrap();
        let cfg = UploaderConfig::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(cfg.device.address, "10.42.13.99");
        assert_eq!(cfg.upload, LoopConfig::default());
    }

    #[test]
    fn configured_seed_is_used() {
        let mut cfg = UploaderConfig::default();
        cfg.frame.seed = Some(99);
        assert_eq!(cfg.frame_seed(), 99);
    }

    #[test]
    fn lock_never_granted_maps_to_held() {
        let mut cfg = UploaderConfig::default();
        cfg.simulator.lock_never_granted = true;
        assert_eq!(cfg.to_sim_behavior().lock, LockBehavior::Held);
    }
}
