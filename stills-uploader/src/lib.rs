//! # stills-uploader: Switcher Still Uploader
//!
//! Connects to a switcher, allocates one frame, fills it with seeded
//! noise, and uploads it into the still slots over and over, logging how
//! long each attempt takes.
//!
//! The device is reached through a [`stills_core::Discovery`]
//! implementation. This build ships the simulated switcher, configured
//! from the `[simulator]` section of the TOML config.

pub mod config;
pub mod uploader;
