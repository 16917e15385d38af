//! Configuration: CLI/env-loaded server settings, and the per-session
//! `DeviceConfig` a client negotiates at connect time.
//!
//! CLI flags take precedence over environment variables, which take
//! precedence over defaults — standard `clap` layering, parsed once at
//! startup into an immutable [`ServerConfig`].

use std::time::Duration;

use clap::Parser;

use crate::error::{CoreError, CoreResult};

/// Process-wide settings, parsed once at startup.
#[derive(Parser, Debug, Clone)]
#[command(name = "webview-tile-streamer")]
#[command(about = "Streams headless-browser dashboard frames to embedded tile displays")]
pub struct ServerConfig {
    /// Address to bind the WebSocket front door to.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: String,

    /// Seconds of inactivity before a device session is evicted.
    #[arg(long, env = "IDLE_TTL_SECS", default_value_t = 300)]
    pub idle_ttl_secs: u64,

    /// Interval, in seconds, between idle-sweep passes.
    #[arg(long, env = "IDLE_SWEEP_SECS", default_value_t = 60)]
    pub idle_sweep_secs: u64,

    /// Log filter passed to `tracing-subscriber`'s `EnvFilter`, e.g. `info`
    /// or `webview_tile_streamer=debug,tower_http=info`.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,

    /// Whether the browser should emulate `prefers-reduced-motion: reduce`.
    /// Derived from `PREFERS_REDUCED_MOTION` when the flag itself is absent.
    #[arg(long, default_value_t = false)]
    pub prefers_reduced_motion: bool,
}

impl ServerConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.idle_sweep_secs)
    }

    /// Parses CLI args, then overlays the `PREFERS_REDUCED_MOTION` env flag
    /// (truthy: `1`, `true`, `yes`, `on`, case-insensitive) if the CLI flag
    /// itself wasn't explicitly set.
    pub fn parse_with_env() -> Self {
        let mut cfg = Self::parse();
        if !cfg.prefers_reduced_motion {
            cfg.prefers_reduced_motion = env_flag_truthy("PREFERS_REDUCED_MOTION");
        }
        cfg
    }
}

fn env_flag_truthy(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Rotation applied to the decoded raster before tiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    None,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn from_degrees(deg: u16) -> CoreResult<Self> {
        match deg {
            0 => Ok(Rotation::None),
            90 => Ok(Rotation::Deg90),
            180 => Ok(Rotation::Deg180),
            270 => Ok(Rotation::Deg270),
            other => Err(CoreError::InvalidConfig(format!(
                "rotation must be one of 0/90/180/270, got {other}"
            ))),
        }
    }
}

/// Immutable per-session negotiated configuration. Two configs are equal iff
/// every recognized field is equal; `ensure_device` treats any inequality as
/// grounds to rebuild the session (§3 of the design doc).
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub width: u32,
    pub height: u32,
    pub tile_size: u32,
    pub rotation: Rotation,
    pub jpeg_quality: u8,
    pub full_frame_tile_count: u32,
    pub full_frame_area_threshold: f32,
    pub full_frame_every: u32,
    pub every_nth_frame: u32,
    pub min_frame_interval: Duration,
    pub max_bytes_per_message: usize,
}

impl DeviceConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(CoreError::InvalidConfig("width/height must be > 0".into()));
        }
        if self.tile_size == 0 {
            return Err(CoreError::InvalidConfig("tile_size must be > 0".into()));
        }
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(CoreError::InvalidConfig("jpeg_quality must be 1-100".into()));
        }
        if !(0.0..=1.0).contains(&self.full_frame_area_threshold) {
            return Err(CoreError::InvalidConfig(
                "full_frame_area_threshold must be within 0..=1".into(),
            ));
        }
        if self.every_nth_frame == 0 {
            return Err(CoreError::InvalidConfig("every_nth_frame must be > 0".into()));
        }
        if self.max_bytes_per_message == 0 {
            return Err(CoreError::InvalidConfig(
                "max_bytes_per_message must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            width: 480,
            height: 320,
            tile_size: 32,
            rotation: Rotation::None,
            jpeg_quality: 70,
            full_frame_tile_count: 40,
            full_frame_area_threshold: 0.5,
            full_frame_every: 300,
            every_nth_frame: 1,
            min_frame_interval: Duration::from_millis(100),
            max_bytes_per_message: 4096,
        }
    }
}
