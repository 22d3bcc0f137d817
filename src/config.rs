//! Configuration module for the trickle server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::compress::Codec;
use crate::scheduler::RetriggerPolicy;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "trickle")]
#[command(author = "trickle authors")]
#[command(version = "0.1.0")]
#[command(
    about = "Streams a compressed payload in paced fixed-size packets to clients that ask for it",
    long_about = None
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Option<CliCommand>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:5555)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// File whose compressed contents are served
    #[arg(short = 'i', long)]
    pub input: Option<PathBuf>,

    /// Codec used to compress the input file
    #[arg(long, value_enum)]
    pub codec: Option<Codec>,

    /// Compression level for the chosen codec
    #[arg(long)]
    pub level: Option<u32>,

    /// Maximum bytes per packet
    #[arg(short = 'p', long)]
    pub packet_size: Option<usize>,

    /// Delay between scheduler ticks in milliseconds
    #[arg(long)]
    pub pacing_ms: Option<u64>,

    /// Line (without newline) that starts a transfer
    #[arg(long)]
    pub trigger: Option<String>,

    /// What to do with a trigger that arrives during a transfer
    #[arg(long, value_enum)]
    pub retrigger: Option<RetriggerPolicy>,

    /// Number of I/O worker threads
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Request the payload from a running server and decompress it
    Fetch(FetchArgs),
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:5555")]
    pub server: String,

    /// Where to write the decompressed payload
    #[arg(short, long)]
    pub output: PathBuf,

    /// Codec the server compresses with
    #[arg(long, value_enum, default_value = "gzip")]
    pub codec: Codec,

    /// Trigger line to send (without newline)
    #[arg(long, default_value = "start")]
    pub trigger: String,

    /// Give up when no data arrives for this long
    #[arg(long, default_value_t = 5000)]
    pub idle_timeout_ms: u64,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub payload: PayloadConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of I/O worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Connections beyond this are closed on admission
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Disable Nagle on accepted sockets
    #[serde(default = "default_true")]
    pub nodelay: bool,
    /// Treat a failed write as a closed connection
    #[serde(default)]
    pub close_on_write_error: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: default_workers(),
            max_connections: default_max_connections(),
            nodelay: true,
            close_on_write_error: false,
        }
    }
}

/// Payload source configuration
#[derive(Debug, Deserialize)]
pub struct PayloadConfig {
    #[serde(default = "default_input")]
    pub input: PathBuf,
    #[serde(default)]
    pub codec: Codec,
    #[serde(default = "default_level")]
    pub level: u32,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            input: default_input(),
            codec: Codec::default(),
            level: default_level(),
        }
    }
}

/// Transfer pacing configuration
#[derive(Debug, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
    #[serde(default = "default_trigger")]
    pub trigger: String,
    #[serde(default)]
    pub retrigger: RetriggerPolicy,
    /// Idle time broadcast cadence; disabled when absent
    pub announce_ms: Option<u64>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            packet_size: default_packet_size(),
            pacing_ms: default_pacing_ms(),
            trigger: default_trigger(),
            retrigger: RetriggerPolicy::default(),
            announce_ms: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:5555".to_string()
}

fn default_workers() -> usize {
    1
}

fn default_max_connections() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn default_input() -> PathBuf {
    PathBuf::from("nav_data.csv")
}

fn default_level() -> u32 {
    6
}

fn default_packet_size() -> usize {
    750 // emulates a low bandwidth medium
}

fn default_pacing_ms() -> u64 {
    100
}

fn default_trigger() -> String {
    "start".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// What the binary was asked to do
#[derive(Debug)]
pub enum Invocation {
    Serve(Config),
    Fetch(FetchConfig),
}

impl Invocation {
    pub fn log_level(&self) -> &str {
        match self {
            Invocation::Serve(config) => &config.log_level,
            Invocation::Fetch(config) => &config.log_level,
        }
    }
}

/// Final resolved server configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: usize,
    pub max_connections: usize,
    pub nodelay: bool,
    pub close_on_write_error: bool,
    pub input: PathBuf,
    pub codec: Codec,
    pub level: u32,
    pub packet_size: usize,
    pub pacing: Duration,
    pub trigger: String,
    pub retrigger: RetriggerPolicy,
    pub announce: Option<Duration>,
    pub log_level: String,
}

/// Final resolved fetch configuration
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub server: String,
    pub output: PathBuf,
    pub codec: Codec,
    pub trigger: String,
    pub idle_timeout: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Invocation, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = match cli.config {
            Some(ref config_path) => {
                let contents = std::fs::read_to_string(config_path)
                    .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
                toml::from_str(&contents)
                    .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
            }
            None => TomlConfig::default(),
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Invocation, ConfigError> {
        let log_level = cli
            .log_level
            .unwrap_or(toml_config.logging.level);

        if let Some(CliCommand::Fetch(args)) = cli.command {
            let fetch = FetchConfig {
                server: args.server,
                output: args.output,
                codec: args.codec,
                trigger: args.trigger,
                idle_timeout: Duration::from_millis(args.idle_timeout_ms),
                log_level,
            };
            validate_trigger(&fetch.trigger)?;
            if fetch.idle_timeout.is_zero() {
                return Err(ConfigError::Invalid("idle timeout must be non-zero".into()));
            }
            return Ok(Invocation::Fetch(fetch));
        }

        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers: cli.workers.unwrap_or(toml_config.server.workers),
            max_connections: toml_config.server.max_connections,
            nodelay: toml_config.server.nodelay,
            close_on_write_error: toml_config.server.close_on_write_error,
            input: cli.input.unwrap_or(toml_config.payload.input),
            codec: cli.codec.unwrap_or(toml_config.payload.codec),
            level: cli.level.unwrap_or(toml_config.payload.level),
            packet_size: cli.packet_size.unwrap_or(toml_config.transfer.packet_size),
            pacing: Duration::from_millis(cli.pacing_ms.unwrap_or(toml_config.transfer.pacing_ms)),
            trigger: cli.trigger.unwrap_or(toml_config.transfer.trigger),
            retrigger: cli.retrigger.unwrap_or(toml_config.transfer.retrigger),
            announce: toml_config.transfer.announce_ms.map(Duration::from_millis),
            log_level,
        };
        config.validate()?;
        Ok(Invocation::Serve(config))
    }

    /// Check the invariants the runtime relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.packet_size == 0 {
            return Err(ConfigError::Invalid("packet_size must be non-zero".into()));
        }
        if self.pacing.is_zero() {
            return Err(ConfigError::Invalid("pacing_ms must be non-zero".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be non-zero".into()));
        }
        if matches!(self.announce, Some(d) if d.is_zero()) {
            return Err(ConfigError::Invalid("announce_ms must be non-zero".into()));
        }
        let levels = self.codec.levels();
        if !levels.contains(&self.level) {
            return Err(ConfigError::Invalid(format!(
                "level {} out of range {:?} for {:?}",
                self.level, levels, self.codec
            )));
        }
        validate_trigger(&self.trigger)
    }

    /// The exact line, delimiter included, that starts a transfer.
    pub fn trigger_line(&self) -> String {
        format!("{}\n", self.trigger)
    }
}

fn validate_trigger(trigger: &str) -> Result<(), ConfigError> {
    if trigger.is_empty() || trigger.contains(|c| c == '\n' || c == '\r') {
        return Err(ConfigError::Invalid(format!(
            "trigger {trigger:?} must be non-empty and single-line"
        )));
    }
    Ok(())
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serve(args: &[&str], toml_config: TomlConfig) -> Result<Config, ConfigError> {
        let cli = CliArgs::try_parse_from(std::iter::once("trickle").chain(args.iter().copied()))
            .unwrap();
        match Config::resolve(cli, toml_config)? {
            Invocation::Serve(config) => Ok(config),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_default_config() {
        let config = serve(&[], TomlConfig::default()).unwrap();
        assert_eq!(config.listen, "0.0.0.0:5555");
        assert_eq!(config.packet_size, 750);
        assert_eq!(config.pacing, Duration::from_millis(100));
        assert_eq!(config.trigger_line(), "start\n");
        assert_eq!(config.codec, Codec::Gzip);
        assert_eq!(config.retrigger, RetriggerPolicy::Ignore);
        assert!(!config.close_on_write_error);
        assert!(config.announce.is_none());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:6000"
            workers = 2
            close_on_write_error = true

            [payload]
            input = "data.bin"
            codec = "bzip2"
            level = 9

            [transfer]
            packet_size = 1024
            pacing_ms = 10
            retrigger = "queue"
            announce_ms = 1000

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = serve(&[], toml_config).unwrap();
        assert_eq!(config.listen, "127.0.0.1:6000");
        assert_eq!(config.workers, 2);
        assert!(config.close_on_write_error);
        assert_eq!(config.input, PathBuf::from("data.bin"));
        assert_eq!(config.codec, Codec::Bzip2);
        assert_eq!(config.level, 9);
        assert_eq!(config.packet_size, 1024);
        assert_eq!(config.pacing, Duration::from_millis(10));
        assert_eq!(config.retrigger, RetriggerPolicy::Queue);
        assert_eq!(config.announce, Some(Duration::from_secs(1)));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [transfer]
            packet_size = 1024
            [logging]
            level = "debug"
        "#,
        )
        .unwrap();

        let config = serve(
            &["--packet-size", "100", "--codec", "lzma", "--log-level", "warn"],
            toml_config,
        )
        .unwrap();
        assert_eq!(config.packet_size, 100);
        assert_eq!(config.codec, Codec::Lzma);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_rejects_zero_packet_size() {
        let err = serve(&["--packet-size", "0"], TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_multiline_trigger() {
        let err = serve(&["--trigger", "go\n"], TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_level_out_of_range() {
        let err = serve(&["--codec", "bzip2", "--level", "0"], TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_fetch_subcommand() {
        let cli = CliArgs::try_parse_from([
            "trickle",
            "fetch",
            "--output",
            "out.csv",
            "--codec",
            "lzma",
        ])
        .unwrap();

        match Config::resolve(cli, TomlConfig::default()).unwrap() {
            Invocation::Fetch(fetch) => {
                assert_eq!(fetch.server, "127.0.0.1:5555");
                assert_eq!(fetch.output, PathBuf::from("out.csv"));
                assert_eq!(fetch.codec, Codec::Lzma);
                assert_eq!(fetch.trigger, "start");
                assert_eq!(fetch.idle_timeout, Duration::from_secs(5));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
