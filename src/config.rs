//! Configuration module for the flag submission server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::clock::Tick;
use crate::protocol::{is_valid_banner, FlagFormat};
use crate::team::{parse_network, TeamId, TeamResolver};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the submission server
#[derive(Parser, Debug, Default)]
#[command(name = "flagsub")]
#[command(author = "flagsub authors")]
#[command(version = "0.1.0")]
#[command(about = "A flag submission server for attack/defense CTFs", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0 or ::)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Banner sent to clients before the blank line
    #[arg(long)]
    pub banner: Option<String>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Seconds without input before a connection is closed (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// TOML file with the issued flags
    #[arg(short, long)]
    pub flags_file: Option<PathBuf>,

    /// Game start time (RFC 3339, e.g. 2026-10-14T09:00:00Z)
    #[arg(long)]
    pub game_start: Option<DateTime<Utc>>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub game: GameConfig,
    #[serde(default)]
    pub teams: TeamsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog; excess connections wait here
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Interval for logging submission statistics in seconds
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            idle_timeout: default_idle_timeout(),
            stats_interval: default_stats_interval(),
            workers: None,
        }
    }
}

/// Wire protocol configuration
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    /// Banner text
    #[serde(default = "default_banner")]
    pub banner: String,
    /// Prefix every flag starts with
    #[serde(default = "default_flag_prefix")]
    pub flag_prefix: String,
    /// Number of base64 characters after the prefix
    #[serde(default = "default_flag_length")]
    pub flag_length: usize,
    /// Longest accepted line in bytes
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    /// Submissions validated concurrently per connection
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            banner: default_banner(),
            flag_prefix: default_flag_prefix(),
            flag_length: default_flag_length(),
            max_line_length: default_max_line_length(),
            max_pending: default_max_pending(),
        }
    }
}

/// Competition timing
#[derive(Debug, Deserialize)]
pub struct GameConfig {
    /// Start of tick 0
    pub start: Option<DateTime<Utc>>,
    /// Tick length in seconds
    #[serde(default = "default_tick_duration")]
    pub tick_duration: u64,
    /// Ticks a flag can be submitted for
    #[serde(default = "default_valid_ticks")]
    pub valid_ticks: Tick,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            start: None,
            tick_duration: default_tick_duration(),
            valid_ticks: default_valid_ticks(),
        }
    }
}

/// Team addressing
#[derive(Debug, Deserialize)]
pub struct TeamsConfig {
    /// Two-octet prefixes of the team networks
    #[serde(default = "default_networks")]
    pub networks: Vec<String>,
    #[serde(default = "default_min_net_number")]
    pub min_net_number: TeamId,
    pub max_net_number: Option<TeamId>,
    /// Individual addresses mapped to teams
    #[serde(default)]
    pub hosts: HashMap<String, TeamId>,
}

impl Default for TeamsConfig {
    fn default() -> Self {
        Self {
            networks: default_networks(),
            min_net_number: default_min_net_number(),
            max_net_number: None,
            hosts: HashMap::new(),
        }
    }
}

/// Flag store configuration
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    /// Issued flags file
    pub flags_file: Option<PathBuf>,
    /// Interval for re-reading the flags file in seconds
    #[serde(default = "default_reload_interval")]
    pub reload_interval: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            flags_file: None,
            reload_interval: default_reload_interval(),
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    6666
}

fn default_backlog() -> u32 {
    1024
}

fn default_max_connections() -> usize {
    1024
}

fn default_idle_timeout() -> u64 {
    300 // 5 minutes
}

fn default_stats_interval() -> u64 {
    60
}

fn default_banner() -> String {
    "Flag submission server\nOne flag per line please!".to_string()
}

fn default_flag_prefix() -> String {
    "FLAG_".to_string()
}

fn default_flag_length() -> usize {
    32
}

fn default_max_line_length() -> usize {
    1024
}

fn default_max_pending() -> usize {
    64
}

fn default_tick_duration() -> u64 {
    60
}

fn default_valid_ticks() -> Tick {
    5
}

fn default_networks() -> Vec<String> {
    vec!["10.32".to_string(), "10.33".to_string()]
}

fn default_min_net_number() -> TeamId {
    1
}

fn default_reload_interval() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub backlog: u32,
    pub max_connections: usize,
    pub idle_timeout: u64,
    pub stats_interval: u64,
    pub workers: Option<usize>,
    pub banner: String,
    pub flag_prefix: String,
    pub flag_length: usize,
    pub max_line_length: usize,
    pub max_pending: usize,
    pub game_start: Option<DateTime<Utc>>,
    pub tick_duration: u64,
    pub valid_ticks: Tick,
    pub team_networks: Vec<[u8; 2]>,
    pub min_net_number: TeamId,
    pub max_net_number: Option<TeamId>,
    pub team_hosts: HashMap<IpAddr, TeamId>,
    pub flags_file: Option<PathBuf>,
    pub reload_interval: u64,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve configuration from already parsed CLI args.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence) and validate.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            server,
            protocol,
            game,
            teams,
            store,
            logging,
        } = toml_config;

        let host = cli.host.unwrap_or(server.host);
        let host: IpAddr = host
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid host address '{host}'")))?;

        let team_networks = teams
            .networks
            .iter()
            .map(|prefix| {
                parse_network(prefix).ok_or_else(|| {
                    ConfigError::Invalid(format!("invalid team network prefix '{prefix}'"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let team_hosts = teams
            .hosts
            .iter()
            .map(|(addr, team)| {
                addr.parse::<IpAddr>()
                    .map(|addr| (addr, *team))
                    .map_err(|_| ConfigError::Invalid(format!("invalid team host '{addr}'")))
            })
            .collect::<Result<HashMap<_, _>, _>>()?;

        let config = Config {
            host,
            port: cli.port.unwrap_or(server.port),
            backlog: server.backlog,
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            idle_timeout: cli.idle_timeout.unwrap_or(server.idle_timeout),
            stats_interval: server.stats_interval,
            workers: cli.workers.or(server.workers),
            banner: cli.banner.unwrap_or(protocol.banner),
            flag_prefix: protocol.flag_prefix,
            flag_length: protocol.flag_length,
            max_line_length: protocol.max_line_length,
            max_pending: protocol.max_pending,
            game_start: cli.game_start.or(game.start),
            tick_duration: game.tick_duration,
            valid_ticks: game.valid_ticks,
            team_networks,
            min_net_number: teams.min_net_number,
            max_net_number: teams.max_net_number,
            team_hosts,
            flags_file: cli.flags_file.or(store.flags_file),
            reload_interval: store.reload_interval,
            log_level: cli.log_level.unwrap_or(logging.level),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_banner(&self.banner) {
            return Err(ConfigError::Invalid(
                "banner must not contain an empty line or end with a newline".to_string(),
            ));
        }
        if self.flag_prefix.is_empty() || !self.flag_prefix.is_ascii() {
            return Err(ConfigError::Invalid(
                "flag_prefix must be non-empty ASCII".to_string(),
            ));
        }
        if self
            .flag_prefix
            .bytes()
            .any(|b| b.is_ascii_whitespace() || b.is_ascii_control())
        {
            return Err(ConfigError::Invalid(
                "flag_prefix must not contain whitespace".to_string(),
            ));
        }
        if self.flag_length == 0 {
            return Err(ConfigError::Invalid("flag_length must be positive".to_string()));
        }
        if self.max_line_length < self.flag_prefix.len() + self.flag_length {
            return Err(ConfigError::Invalid(
                "max_line_length is shorter than a flag".to_string(),
            ));
        }
        if self.max_connections == 0 || self.max_pending == 0 {
            return Err(ConfigError::Invalid(
                "max_connections and max_pending must be positive".to_string(),
            ));
        }
        if self.tick_duration == 0 {
            return Err(ConfigError::Invalid("tick_duration must be positive".to_string()));
        }
        if let Some(max) = self.max_net_number {
            if max < self.min_net_number {
                return Err(ConfigError::Invalid(
                    "max_net_number is below min_net_number".to_string(),
                ));
            }
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be positive".to_string()));
        }
        Ok(())
    }

    /// Socket address to listen on.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn flag_format(&self) -> FlagFormat {
        FlagFormat::new(self.flag_prefix.clone(), self.flag_length)
    }

    pub fn team_resolver(&self) -> TeamResolver {
        self.team_hosts.iter().fold(
            TeamResolver::new(
                self.team_networks.clone(),
                self.min_net_number,
                self.max_net_number,
            ),
            |resolver, (addr, team)| resolver.with_host(*addr, *team),
        )
    }

    /// Idle timeout, `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout > 0).then(|| Duration::from_secs(self.idle_timeout))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host().parse().unwrap_or(IpAddr::from([0, 0, 0, 0])),
            port: default_port(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            idle_timeout: default_idle_timeout(),
            stats_interval: default_stats_interval(),
            workers: None,
            banner: default_banner(),
            flag_prefix: default_flag_prefix(),
            flag_length: default_flag_length(),
            max_line_length: default_max_line_length(),
            max_pending: default_max_pending(),
            game_start: None,
            tick_duration: default_tick_duration(),
            valid_ticks: default_valid_ticks(),
            team_networks: vec![[10, 32], [10, 33]],
            min_net_number: default_min_net_number(),
            max_net_number: None,
            team_hosts: HashMap::new(),
            flags_file: None,
            reload_interval: default_reload_interval(),
            log_level: default_log_level(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
