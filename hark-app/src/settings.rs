//! Persistent host settings (JSON file in the user data directory).
//!
//! Precedence: built-in defaults < settings file < `HARK_*` environment
//! variables. Everything is normalized afterwards, so a hand-edited file
//! with out-of-range values still produces a usable engine.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use hark_core::vad::{SUPPORTED_FRAME_MS, SUPPORTED_SAMPLE_RATES};
use hark_core::{EngineConfig, StageTimeouts};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    pub sample_rate: u32,
    pub frame_ms: u32,
    pub start_trigger_frames: u32,
    pub end_trigger_frames: u32,
    pub energy_threshold: f32,
    pub transcribe_timeout_ms: u64,
    pub generate_timeout_ms: u64,
    pub synthesize_timeout_ms: u64,
    pub play_timeout_ms: u64,
    /// Artificial latency of each stub stage, to make preemption visible.
    pub stub_latency_ms: u64,
    /// Playback speed factor for both the simulated and the device player
    /// (> 1 plays faster).
    pub playback_speed: f32,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            preferred_input_device: None,
            sample_rate: 16_000,
            frame_ms: 30,
            start_trigger_frames: 8,
            end_trigger_frames: 12,
            energy_threshold: 0.01,
            transcribe_timeout_ms: 30_000,
            generate_timeout_ms: 30_000,
            synthesize_timeout_ms: 30_000,
            play_timeout_ms: 60_000,
            stub_latency_ms: 400,
            playback_speed: 1.0,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.sample_rate = nearest(&SUPPORTED_SAMPLE_RATES, self.sample_rate);
        self.frame_ms = nearest(&SUPPORTED_FRAME_MS, self.frame_ms);
        self.start_trigger_frames = self.start_trigger_frames.clamp(1, 100);
        self.end_trigger_frames = self.end_trigger_frames.clamp(1, 200);
        self.energy_threshold = if self.energy_threshold.is_finite() {
            self.energy_threshold.clamp(0.0005, 0.5)
        } else {
            0.01
        };
        self.transcribe_timeout_ms = self.transcribe_timeout_ms.clamp(100, 600_000);
        self.generate_timeout_ms = self.generate_timeout_ms.clamp(100, 600_000);
        self.synthesize_timeout_ms = self.synthesize_timeout_ms.clamp(100, 600_000);
        self.play_timeout_ms = self.play_timeout_ms.clamp(100, 600_000);
        self.stub_latency_ms = self.stub_latency_ms.min(10_000);
        self.playback_speed = if self.playback_speed.is_finite() {
            self.playback_speed.clamp(0.25, 8.0)
        } else {
            1.0
        };
        self.preferred_input_device = self
            .preferred_input_device
            .as_ref()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
    }

    /// Apply `HARK_*` overrides. Unparseable values are ignored with a
    /// warning.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        override_parsed(&lookup, "HARK_SAMPLE_RATE", &mut self.sample_rate);
        override_parsed(&lookup, "HARK_FRAME_MS", &mut self.frame_ms);
        override_parsed(&lookup, "HARK_START_FRAMES", &mut self.start_trigger_frames);
        override_parsed(&lookup, "HARK_END_FRAMES", &mut self.end_trigger_frames);
        override_parsed(&lookup, "HARK_ENERGY_THRESHOLD", &mut self.energy_threshold);
        if let Some(device) = lookup("HARK_INPUT_DEVICE") {
            self.preferred_input_device = Some(device);
        }
    }

    pub fn stage_timeouts(&self) -> StageTimeouts {
        StageTimeouts {
            transcribe: Duration::from_millis(self.transcribe_timeout_ms),
            generate: Duration::from_millis(self.generate_timeout_ms),
            synthesize: Duration::from_millis(self.synthesize_timeout_ms),
            play: Duration::from_millis(self.play_timeout_ms),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            sample_rate: self.sample_rate,
            frame_ms: self.frame_ms,
            start_trigger_frames: self.start_trigger_frames,
            end_trigger_frames: self.end_trigger_frames,
            energy_threshold: self.energy_threshold,
            timeouts: self.stage_timeouts(),
            input_device: self.preferred_input_device.clone(),
            ..EngineConfig::default()
        }
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => warn!("ignoring {key}={raw:?}: not a valid value"),
    }
}

/// Closest allowed value; ties go to the smaller one.
fn nearest(allowed: &[u32], value: u32) -> u32 {
    allowed
        .iter()
        .copied()
        .min_by_key(|&a| a.abs_diff(value))
        .unwrap_or(value)
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hark")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("hark")
            .join("settings.json")
    }
}

/// Never fails: a missing or malformed file yields defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = read_settings_file(path);
    settings.apply_env_overrides();
    settings.normalize();
    settings
}

fn read_settings_file(path: &Path) -> AppSettings {
    let Ok(raw) = fs::read_to_string(path) else {
        return AppSettings::default();
    };
    serde_json::from_str::<AppSettings>(&raw).unwrap_or_else(|e| {
        warn!(path = ?path, "settings file unreadable, using defaults: {e}");
        AppSettings::default()
    })
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
