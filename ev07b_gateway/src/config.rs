//Command line interface
// runtime configuration (listener, timeouts, audit/log outputs, seeded fences)
use crate::errors::Result;
use clap::Parser;
use ev07b_protocol::{DEFAULT_GATEWAY_PORT, Geofence};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Seconds without a complete frame before the connection is closed. 0 disables.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Outbound frames buffered per connection.
    #[serde(default = "default_write_queue")]
    pub write_queue: u64,
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    #[serde(default)]
    pub audit_csv: Option<PathBuf>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Push seeded fences to their devices (or queue them) at startup.
    #[serde(default)]
    pub push_geofences: bool,
    #[serde(default)]
    pub geofences: Vec<Geofence>,
}

fn default_bind_addr() -> String {
    format!("0.0.0.0:{DEFAULT_GATEWAY_PORT}")
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_write_queue() -> u64 {
    256
}

fn default_status_interval_secs() -> u64 {
    30
}

impl Config {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(1))
    }
}

/// Flags win over `EV07B_*` environment variables, which win over the TOML file.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "ev07b_gateway", about = "TCP gateway for EV07B/EV04 GPS trackers")]
pub struct Cli {
    #[arg(long)] pub config: Option<PathBuf>,
    #[arg(long)] pub bind_addr: Option<String>,
    #[arg(long)] pub idle_timeout_secs: Option<u64>,
    #[arg(long)] pub write_queue: Option<u64>,
    #[arg(long)] pub status_interval_secs: Option<u64>,
    #[arg(long)] pub audit_csv: Option<PathBuf>,
    #[arg(long)] pub log_dir: Option<PathBuf>,
    #[arg(long)] pub push_geofences: bool,
}

impl Cli {
    pub fn parse_and_build_config() -> Result<Config> {
        <Cli as Parser>::parse().build_config()
    }

    pub fn build_config(self) -> Result<Config> {
        let mut builder = config::Config::builder();
        if let Some(path) = &self.config {
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }
        let mut builder = builder
            .add_source(config::Environment::with_prefix("EV07B").try_parsing(true))
            .set_override_option("bind_addr", self.bind_addr)?
            .set_override_option("idle_timeout_secs", self.idle_timeout_secs)?
            .set_override_option("write_queue", self.write_queue)?
            .set_override_option("status_interval_secs", self.status_interval_secs)?
            .set_override_option("audit_csv", self.audit_csv.map(|p| p.display().to_string()))?
            .set_override_option("log_dir", self.log_dir.map(|p| p.display().to_string()))?;
        if self.push_geofences {
            builder = builder.set_override("push_geofences", true)?;
        }
        Ok(builder.build()?.try_deserialize()?)
    }
}
