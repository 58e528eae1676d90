use crate::errors::{Result, SpoolerError};
use crate::printer::TargetSelection;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default job label handed to the print system (shows up in `lpstat -o`).
pub const DEFAULT_JOB_LABEL: &str = "Label Print";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub listen_addr: String,
    /// Directory with the browser UI. `None` disables static file serving.
    pub static_dir: Option<PathBuf>,
    /// When set, logs are also written to a daily rolling file here.
    pub log_dir: Option<PathBuf>,
    pub printer_backend: PrinterBackend,
    pub usb_hotplug: bool,
    /// Resolution used to turn image pixels into page size.
    pub render_dpi: f32,
    pub spooler: SpoolerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrinterBackend {
    /// CUPS command line tools (`lpstat` / `lp`)
    Lp,
    /// `printers` crate, requires the `native-printers` feature
    Native,
}

impl std::str::FromStr for PrinterBackend {
    type Err = SpoolerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lp" | "cups" => Ok(PrinterBackend::Lp),
            "native" => Ok(PrinterBackend::Native),
            other => Err(SpoolerError::Config(format!("Unknown printer backend: {}", other))),
        }
    }
}

/// Where the loaded configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    /// No file at this path, built-in defaults used
    Defaults(PathBuf),
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "Config loaded from {:?}", path),
            ConfigSource::Defaults(path) => write!(f, "No config file at {:?}, using defaults", path),
        }
    }
}

/// Tunables of the spooler core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolerConfig {
    /// Fixed delay between polls while no printer is reachable.
    pub retry_interval_ms: u64,
    /// Which target to pick when several are reachable.
    pub target_selection: TargetSelection,
    pub job_label: String,
}

impl SpoolerConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Default for SpoolerConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 5000, // 5 seconds
            target_selection: TargetSelection::First,
            job_label: DEFAULT_JOB_LABEL.to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let static_dir = PathBuf::from("public");
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            static_dir: static_dir.is_dir().then_some(static_dir),
            log_dir: None,
            printer_backend: PrinterBackend::Lp,
            usb_hotplug: true,
            render_dpi: 72.0,
            spooler: SpoolerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Location of the JSON config file.
    ///
    /// `SPOOLER_CONFIG` wins; otherwise the platform config directory.
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("SPOOLER_CONFIG") {
            return PathBuf::from(path);
        }

        let config_dir = if cfg!(target_os = "macos") {
            dirs::home_dir()
                .map(|p| p.join("Library/Application Support/label-spooler"))
                .unwrap_or_else(|| PathBuf::from("."))
        } else {
            dirs::config_dir()
                .map(|p| p.join("label-spooler"))
                .unwrap_or_else(|| PathBuf::from("."))
        };

        config_dir.join("config.json")
    }

    /// Load config from disk (defaults if the file is missing), then apply
    /// environment overrides.
    ///
    /// Runs before logging is set up, so the source is returned for the
    /// caller to log instead of being logged here.
    pub fn load() -> Result<(Self, ConfigSource)> {
        let path = Self::config_path();
        let mut config = Self::load_from(&path)?;
        config.apply_env_overrides()?;
        config.validate()?;

        let source = if path.exists() {
            ConfigSource::File(path)
        } else {
            ConfigSource::Defaults(path)
        };
        Ok((config, source))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| SpoolerError::Config(format!("Failed to parse {:?}: {}", path, e)))
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("SPOOLER_LISTEN_ADDR") {
            self.listen_addr = addr;
        }

        if let Ok(raw) = std::env::var("SPOOLER_RETRY_INTERVAL_MS") {
            self.spooler.retry_interval_ms = raw.trim().parse().map_err(|_| {
                SpoolerError::Config(format!("SPOOLER_RETRY_INTERVAL_MS is not a number: {}", raw))
            })?;
        }

        if let Ok(dir) = std::env::var("SPOOLER_STATIC_DIR") {
            self.static_dir = (!dir.is_empty()).then(|| PathBuf::from(dir));
        }

        if let Ok(dir) = std::env::var("SPOOLER_LOG_DIR") {
            self.log_dir = (!dir.is_empty()).then(|| PathBuf::from(dir));
        }

        if let Ok(backend) = std::env::var("SPOOLER_PRINTER_BACKEND") {
            self.printer_backend = backend.parse()?;
        }

        if let Ok(raw) = std::env::var("SPOOLER_USB_HOTPLUG") {
            self.usb_hotplug = matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.spooler.retry_interval_ms == 0 {
            return Err(SpoolerError::Config("retry_interval_ms must be greater than zero".to_string()));
        }

        if !(self.render_dpi.is_finite() && self.render_dpi > 0.0) {
            return Err(SpoolerError::Config(format!("render_dpi must be positive, got {}", self.render_dpi)));
        }

        Ok(())
    }
}
