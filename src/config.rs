use serde::{Deserialize, Serialize};
use clap::{ArgAction, Parser, ValueHint};
use dirs_next::home_dir;
use std::{fs, path::{Path, PathBuf}, time::Duration};
use thiserror::Error;

use crate::display::registry::{DeviceId, USBD480_PRODUCT_ID, USBD480_VENDOR_ID};
use crate::display::scheduler::{
    DEFAULT_BULK_ENDPOINT, DEFAULT_BULK_TIMEOUT, DEFAULT_REFRESH_INTERVAL, FlipMode,
    INITIAL_DELAY_FACTOR, SchedulerConfig,
};
use crate::display::control::DEFAULT_CONTROL_TIMEOUT;
use crate::display::session::{DiscoveryPolicy, SessionConfig};

/// Error type for config loading/validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Top-level configuration. Every field is optional, defaults are applied
/// when the session configuration is derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    pub log_level: Option<String>,     // e.g., "info" | "debug"
    pub driver: Option<DriverConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DriverConfig {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub refresh_interval_ms: Option<u64>,
    pub initial_delay_factor: Option<u32>,
    pub control_timeout_ms: Option<u64>,
    pub bulk_timeout_ms: Option<u64>,
    pub bulk_endpoint: Option<u8>,
    pub flip_mode: Option<FlipMode>,
    pub discovery: Option<DiscoveryPolicy>,
    pub fallback_width: Option<u32>,
    pub fallback_height: Option<u32>,
    pub brightness: Option<u8>,     // 0-255
}

impl Config {
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn driver(&self) -> DriverConfig {
        self.driver.clone().unwrap_or_default()
    }
}

impl DriverConfig {
    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(
            self.vendor_id.unwrap_or(USBD480_VENDOR_ID),
            self.product_id.unwrap_or(USBD480_PRODUCT_ID),
        )
    }

    fn refresh_interval(&self) -> Duration {
        self.refresh_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REFRESH_INTERVAL)
    }

    /// None when interval x factor does not fit a Duration
    fn initial_delay(&self) -> Option<Duration> {
        self.refresh_interval()
            .checked_mul(self.initial_delay_factor.unwrap_or(INITIAL_DELAY_FACTOR))
    }

    /// Resolve to a session configuration, defaults filled in
    pub fn session_config(&self) -> SessionConfig {
        let interval = self.refresh_interval();

        SessionConfig {
            control_timeout: self
                .control_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CONTROL_TIMEOUT),
            discovery: self.discovery.unwrap_or_default(),
            fallback_geometry: self.fallback_width.zip(self.fallback_height),
            initial_brightness: self.brightness,
            scheduler: SchedulerConfig {
                interval,
                initial_delay: self.initial_delay().unwrap_or(Duration::MAX),
                bulk_timeout: self
                    .bulk_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_BULK_TIMEOUT),
                endpoint: self.bulk_endpoint.unwrap_or(DEFAULT_BULK_ENDPOINT),
                flip_mode: self.flip_mode.unwrap_or_default(),
            },
        }
    }
}

/// CLI overrides. All fields are Options so we can layer them over YAML.
#[derive(Debug, Parser, Clone)]
#[command(name = "usbd480fb", about = "USBD480 USB display driver", disable_help_flag = false)]
pub struct Cli {
    /// Path to a YAML config file (overrides search)
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub log_level: Option<String>,
    /// more logging, repeat for trace
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
    /// refresh interval in milliseconds
    #[arg(long)]
    pub refresh_ms: Option<u64>,
    /// same-cycle | write-then-flip
    #[arg(long)]
    pub flip_mode: Option<FlipMode>,
    /// strict | lenient
    #[arg(long)]
    pub discovery: Option<DiscoveryPolicy>,
    /// backlight level sent after discovery (0-255)
    #[arg(long)]
    pub brightness: Option<u8>,
    /// run against a simulated 480x272 device instead of the USB bus
    #[arg(long, action = ArgAction::SetTrue)]
    pub simulate: bool,
    /// paint a test pattern into every attached display
    #[arg(long, action = ArgAction::SetTrue)]
    pub test_pattern: bool,
    /// dump fully merged config (after overrides) and exit
    #[arg(long, action = ArgAction::SetTrue)]
    pub dump_config: bool,
}

/// Public entry point: parse CLI, read YAML, merge, validate.
pub fn load() -> Result<(Config, Cli), ConfigError> {
    let cli = Cli::parse();
    let cfg = resolve(&cli)?;

    if cli.dump_config {
        // Pretty YAML of effective config (nice for debugging)
        let s = serde_yaml::to_string(&cfg)?;
        println!("{s}");
        std::process::exit(0);
    }

    Ok((cfg, cli))
}

/// Build the effective configuration for `cli`
pub fn resolve(cli: &Cli) -> Result<Config, ConfigError> {
    // 1) defaults (from `Default` impl)
    let mut cfg = Config::default();

    // 2) YAML file (explicit path or search)
    if let Some(p) = cli.config.as_ref() {
        if p.exists() {
            let y = read_yaml(p)?;
            merge(&mut cfg, y);
        } else {
            return Err(ConfigError::Validation(format!(
                "Config file not found: {}",
                p.display()
            )));
        }
    } else if let Some(p) = find_config_file() {
        let y = read_yaml(&p)?;
        merge(&mut cfg, y);
    }

    // 3) CLI overrides (highest precedence)
    apply_cli_overrides(&mut cfg, cli);

    // 4) Validate
    validate(&cfg)?;

    Ok(cfg)
}

/// Try common locations in order (first hit wins).
fn find_config_file() -> Option<PathBuf> {
    // XDG-style: ~/.config/usbd480fb/config.yaml
    if let Some(home) = home_dir() {
        let p = home.join(".config/usbd480fb/config.yaml");
        if p.exists() { return Some(p) }
        let p = home.join(".config/usbd480fb.yaml");
        if p.exists() { return Some(p) }
    }
    // project local
    for candidate in &["usbd480fb.yaml", "config.yaml"] {
        let p = PathBuf::from(candidate);
        if p.exists() { return Some(p) }
    }
    None
}

fn read_yaml(path: &Path) -> Result<Config, ConfigError> {
    let s = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&s)?;
    Ok(cfg)
}

/// Shallow merge `src` into `dst`, Option-by-Option.
fn merge(dst: &mut Config, src: Config) {
    // top-level
    if src.log_level.is_some()      { dst.log_level = src.log_level; }
    // driver
    match (&mut dst.driver, src.driver) {
        (None, Some(c)) => dst.driver = Some(c),
        (Some(d), Some(s)) => merge_driver(d, s),
        _ => {}
    }
}

fn merge_driver(dst: &mut DriverConfig, src: DriverConfig) {
    if src.vendor_id.is_some()            { dst.vendor_id = src.vendor_id; }
    if src.product_id.is_some()           { dst.product_id = src.product_id; }
    if src.refresh_interval_ms.is_some()  { dst.refresh_interval_ms = src.refresh_interval_ms; }
    if src.initial_delay_factor.is_some() { dst.initial_delay_factor = src.initial_delay_factor; }
    if src.control_timeout_ms.is_some()   { dst.control_timeout_ms = src.control_timeout_ms; }
    if src.bulk_timeout_ms.is_some()      { dst.bulk_timeout_ms = src.bulk_timeout_ms; }
    if src.bulk_endpoint.is_some()        { dst.bulk_endpoint = src.bulk_endpoint; }
    if src.flip_mode.is_some()            { dst.flip_mode = src.flip_mode; }
    if src.discovery.is_some()            { dst.discovery = src.discovery; }
    if src.fallback_width.is_some()       { dst.fallback_width = src.fallback_width; }
    if src.fallback_height.is_some()      { dst.fallback_height = src.fallback_height; }
    if src.brightness.is_some()           { dst.brightness = src.brightness; }
}

fn apply_cli_overrides(cfg: &mut Config, cli: &Cli) {
    if cli.log_level.is_some()       { cfg.log_level = cli.log_level.clone(); }
    match cli.verbose {
        0 => {}
        1 => cfg.log_level = Some("debug".into()),
        _ => cfg.log_level = Some("trace".into()),
    }

    let any_driver = cli.refresh_ms.is_some()
        || cli.flip_mode.is_some()
        || cli.discovery.is_some()
        || cli.brightness.is_some();

    if any_driver && cfg.driver.is_none() {
        cfg.driver = Some(DriverConfig::default());
    }
    if let Some(driver) = cfg.driver.as_mut() {
        if cli.refresh_ms.is_some()  { driver.refresh_interval_ms = cli.refresh_ms; }
        if cli.flip_mode.is_some()   { driver.flip_mode = cli.flip_mode; }
        if cli.discovery.is_some()   { driver.discovery = cli.discovery; }
        if cli.brightness.is_some()  { driver.brightness = cli.brightness; }
    }
}

/// Put any invariants here (required fields, ranges, etc.)
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if let Some(driver) = cfg.driver.as_ref() {
        for (name, value) in [
            ("refresh_interval_ms", driver.refresh_interval_ms),
            ("control_timeout_ms", driver.control_timeout_ms),
            ("bulk_timeout_ms", driver.bulk_timeout_ms),
        ] {
            if value == Some(0) {
                return Err(ConfigError::Validation(format!("driver {name} must be > 0")));
            }
        }
        if driver.initial_delay().is_none() {
            return Err(ConfigError::Validation(
                "driver refresh_interval_ms x initial_delay_factor is out of range".into()
            ));
        }
        match (driver.fallback_width, driver.fallback_height) {
            (None, None) => {},
            (Some(w), Some(h)) if w > 0 && h > 0 => {},
            (Some(_), Some(_)) => {
                return Err(ConfigError::Validation("driver fallback width/height must be > 0".into()))
            }
            _ => {
                return Err(ConfigError::Validation(
                    "driver fallback_width and fallback_height go together".into()
                ))
            }
        }
        if let Some(ep) = driver.bulk_endpoint {
            if ep == 0 || ep & 0x80 != 0 {
                return Err(ConfigError::Validation(format!(
                    "driver bulk_endpoint {ep:#04x} is not an OUT endpoint"
                )));
            }
        }
    }
    Ok(())
}
