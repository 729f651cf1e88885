use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "r02_ring".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Signal pipeline tuning. Every field takes effect on the next sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TuningConfig {
    /// Ring orientation correction in degrees
    #[serde(default)]
    pub rotation_deg: f64,
    /// Pixels per raw accelerometer unit
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
    /// Circular deadzone radius in raw accelerometer units
    #[serde(default = "default_deadzone")]
    pub deadzone: i32,
    /// 0.0 = no smoothing, 1.0 = heaviest
    #[serde(default = "default_smoothing")]
    pub smoothing: f64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            rotation_deg: 0.0,
            sensitivity: default_sensitivity(),
            deadzone: default_deadzone(),
            smoothing: default_smoothing(),
        }
    }
}

fn default_sensitivity() -> f64 {
    0.015
}
fn default_deadzone() -> i32 {
    200
}
fn default_smoothing() -> f64 {
    0.5
}

// Setters report whether the value actually changed so callers only notify
// on real changes.
impl TuningConfig {
    pub fn set_rotation(&mut self, degrees: f64) -> bool {
        replace_f64(&mut self.rotation_deg, degrees)
    }

    pub fn set_sensitivity(&mut self, sensitivity: f64) -> bool {
        replace_f64(&mut self.sensitivity, sensitivity)
    }

    pub fn set_deadzone(&mut self, deadzone: i32) -> bool {
        if self.deadzone == deadzone {
            return false;
        }
        self.deadzone = deadzone;
        true
    }

    pub fn set_smoothing(&mut self, smoothing: f64) -> bool {
        replace_f64(&mut self.smoothing, smoothing.clamp(0.0, 1.0))
    }

    /// Apply the setter rules to values that came straight from a file
    ///
    /// Non-finite numbers fall back to defaults; smoothing is clamped to [0, 1].
    pub fn sanitized(self) -> Self {
        let defaults = Self::default();
        let finite_or = |value: f64, fallback: f64| if value.is_finite() { value } else { fallback };
        Self {
            rotation_deg: finite_or(self.rotation_deg, defaults.rotation_deg),
            sensitivity: finite_or(self.sensitivity, defaults.sensitivity),
            deadzone: self.deadzone,
            smoothing: finite_or(self.smoothing, defaults.smoothing).clamp(0.0, 1.0),
        }
    }
}

fn replace_f64(slot: &mut f64, value: f64) -> bool {
    if *slot == value || !value.is_finite() {
        return false;
    }
    *slot = value;
    true
}

/// Event-loop timing knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    #[serde(default = "default_battery_poll_secs")]
    pub battery_poll_secs: u64,
    #[serde(default = "default_rate_window_secs")]
    pub packet_rate_window_secs: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_stop_drain_ms")]
    pub stop_drain_ms: u64,
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            battery_poll_secs: default_battery_poll_secs(),
            packet_rate_window_secs: default_rate_window_secs(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            stop_drain_ms: default_stop_drain_ms(),
            scan_timeout_secs: default_scan_timeout_secs(),
        }
    }
}

impl TimingSettings {
    pub fn battery_poll_interval(&self) -> Duration {
        Duration::from_secs(self.battery_poll_secs.max(1))
    }

    pub fn packet_rate_window(&self) -> Duration {
        Duration::from_secs(self.packet_rate_window_secs.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn stop_drain(&self) -> Duration {
        Duration::from_millis(self.stop_drain_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }
}

fn default_battery_poll_secs() -> u64 {
    30
}
fn default_rate_window_secs() -> u64 {
    5
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}
fn default_stop_drain_ms() -> u64 {
    100
}
fn default_scan_timeout_secs() -> u64 {
    20
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub tuning: TuningConfig,
    #[serde(default)]
    pub auto_reconnect: bool,
    #[serde(default)]
    pub mouse_control_enabled: bool,
    #[serde(default)]
    pub timing: TimingSettings,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

/// Read-only settings source. The connector never writes to disk.
pub struct SettingsService {
    settings: Settings,
    settings_path: Option<PathBuf>,
}

impl SettingsService {
    /// Load settings from the user config directory, falling back to defaults
    pub fn load() -> Self {
        let settings_path = Self::get_settings_path();
        let settings = settings_path
            .as_deref()
            .and_then(|path| Self::load_from_file(path).ok())
            .unwrap_or_default();

        Self {
            settings,
            settings_path,
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let settings = Self::load_from_file(&path)?;
        Ok(Self {
            settings,
            settings_path: Some(path),
        })
    }

    fn get_settings_path() -> Option<PathBuf> {
        let mut path = dirs::config_dir()?;
        path.push("R02Ring");
        path.push("settings.json");
        Some(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> Option<&Path> {
        self.settings_path.as_deref()
    }

    pub fn into_settings(self) -> Settings {
        self.settings
    }
}
