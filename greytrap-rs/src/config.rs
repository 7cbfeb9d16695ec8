use crate::error::{GreytrapError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level daemon configuration, loaded from a TOML file and
/// overridable from the command line.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub grey: GreyConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub firewall: FirewallConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Blacklist feeds compiled at boot.
    #[serde(default, rename = "blacklist")]
    pub blacklists: Vec<BlacklistFeed>,
    /// Whitelist feeds cancelling blacklist coverage.
    #[serde(default, rename = "whitelist")]
    pub whitelists: Vec<WhitelistFeed>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// IPv4 listen address; all interfaces when unset.
    pub bind_address: Option<String>,
    /// IPv6 listen address, used when `enable_ipv6` is set.
    pub bind_address_ipv6: Option<String>,
    #[serde(default)]
    pub enable_ipv6: bool,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Loopback-only configuration port.
    #[serde(default = "default_config_port")]
    pub config_port: u16,
    #[serde(default = "default_max_cons")]
    pub max_cons: usize,
    #[serde(default = "default_max_cons")]
    pub max_black: usize,
    /// Seconds between stuttered bytes.
    #[serde(default = "default_stutter")]
    pub stutter: u64,
    /// Defaults to the system hostname.
    pub hostname: Option<String>,
    #[serde(default = "default_banner")]
    pub banner: String,
    /// Reply code used for blacklist rejection messages (450 or 550).
    #[serde(default = "default_reply_code")]
    pub reply_code: String,
    #[serde(default)]
    pub verbose: bool,
    pub pidfile: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GreyConfig {
    /// Greylisting enabled; when false every connection is treated as
    /// blacklist-only tarpitting.
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Seconds before a retry may pass.
    #[serde(default = "default_pass_time")]
    pub pass_time: i64,
    /// Seconds before an unanswered grey entry expires.
    #[serde(default = "default_grey_expiry")]
    pub grey_expiry: i64,
    /// Seconds a whitelist entry stays in the firewall set.
    #[serde(default = "default_white_expiry")]
    pub white_expiry: i64,
    /// Seconds a trapped address stays trapped.
    #[serde(default = "default_trap_expiry")]
    pub trap_expiry: i64,
    #[serde(default = "default_scan_interval")]
    pub scan_interval: u64,
    /// Seconds of stutter applied to greylisted (non-blacklisted) clients.
    #[serde(default = "default_grey_stutter")]
    pub stutter: u64,
    /// Address of a deliberately low-priority MX; clients greeting it first
    /// are trapped.
    pub low_prio_mx: Option<String>,
    /// Treat recipients outside the stored permitted domains as spamtrap
    /// hits. Off unless the domains table is in use.
    #[serde(default)]
    pub permitted_domains: bool,
    #[serde(default = "default_traplist_name")]
    pub traplist_name: String,
    #[serde(default = "default_traplist_message")]
    pub traplist_message: String,
    #[serde(default = "default_whitelist_name")]
    pub whitelist_name: String,
    #[serde(default = "default_whitelist_name_ipv6")]
    pub whitelist_name_ipv6: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Store driver: "sqlite" or "memory".
    #[serde(default = "default_store_driver")]
    pub driver: String,
    #[serde(default = "default_store_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FirewallConfig {
    /// Firewall driver; only "dummy" is built in.
    #[serde(default = "default_fw_driver")]
    pub driver: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Verify HMACs and reject replayed counters on receive.
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(default = "default_sync_key")]
    pub key: String,
    #[serde(default = "default_sync_port")]
    pub port: u16,
    /// Unicast peers to notify of grey/white/trap updates.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Listen address for incoming sync datagrams.
    pub bind_address: Option<String>,
    /// Multicast interface, optionally suffixed ":ttl".
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// One blacklist feed: a spamd-format file plus the rejection message
/// presented to matching clients.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BlacklistFeed {
    pub name: String,
    pub message: String,
    pub file: String,
}

/// A whitelist feed carving addresses out of every blacklist feed.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WhitelistFeed {
    pub file: String,
}

fn default_port() -> u16 {
    8025
}

fn default_config_port() -> u16 {
    8026
}

fn default_max_cons() -> usize {
    800
}

fn default_stutter() -> u64 {
    1
}

fn default_banner() -> String {
    "greytrap IP-based SPAM blocker".to_string()
}

fn default_reply_code() -> String {
    "450".to_string()
}

fn default_true() -> bool {
    true
}

fn default_pass_time() -> i64 {
    60 * 25
}

fn default_grey_expiry() -> i64 {
    60 * 60 * 4
}

fn default_white_expiry() -> i64 {
    60 * 60 * 24 * 36
}

fn default_trap_expiry() -> i64 {
    60 * 60 * 24
}

fn default_scan_interval() -> u64 {
    60
}

fn default_grey_stutter() -> u64 {
    10
}

fn default_traplist_name() -> String {
    "greytrap-traplist".to_string()
}

fn default_traplist_message() -> String {
    "Your address %A has mailed to spamtraps here".to_string()
}

fn default_whitelist_name() -> String {
    "greytrap-whitelist".to_string()
}

fn default_whitelist_name_ipv6() -> String {
    "greytrap-whitelist-ipv6".to_string()
}

fn default_store_driver() -> String {
    "sqlite".to_string()
}

fn default_store_path() -> String {
    "/var/lib/greytrap/greytrap.db".to_string()
}

fn default_fw_driver() -> String {
    "dummy".to_string()
}

fn default_sync_key() -> String {
    "/etc/greytrap/greytrap.key".to_string()
}

fn default_sync_port() -> u16 {
    8025
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GreytrapError::Config(e.to_string()))?;

        toml::from_str(&content).map_err(|e| GreytrapError::Config(e.to_string()))
    }

    /// Effective SMTP hostname: configured value or the system hostname.
    pub fn hostname(&self) -> String {
        self.server
            .hostname
            .clone()
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned())
    }

    /// Sync sending is on when peers are configured.
    pub fn sync_send(&self) -> bool {
        !self.sync.hosts.is_empty() || self.sync.interface.is_some()
    }

    /// Sync receiving is on when a listen address or interface is configured.
    pub fn sync_recv(&self) -> bool {
        self.sync.bind_address.is_some() || self.sync.interface.is_some()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            grey: GreyConfig::default(),
            store: StoreConfig::default(),
            firewall: FirewallConfig::default(),
            sync: SyncConfig::default(),
            logging: LoggingConfig::default(),
            blacklists: Vec::new(),
            whitelists: Vec::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: None,
            bind_address_ipv6: None,
            enable_ipv6: false,
            port: default_port(),
            config_port: default_config_port(),
            max_cons: default_max_cons(),
            max_black: default_max_cons(),
            stutter: default_stutter(),
            hostname: None,
            banner: default_banner(),
            reply_code: default_reply_code(),
            verbose: false,
            pidfile: None,
        }
    }
}

impl Default for GreyConfig {
    fn default() -> Self {
        GreyConfig {
            enable: true,
            pass_time: default_pass_time(),
            grey_expiry: default_grey_expiry(),
            white_expiry: default_white_expiry(),
            trap_expiry: default_trap_expiry(),
            scan_interval: default_scan_interval(),
            stutter: default_grey_stutter(),
            low_prio_mx: None,
            permitted_domains: false,
            traplist_name: default_traplist_name(),
            traplist_message: default_traplist_message(),
            whitelist_name: default_whitelist_name(),
            whitelist_name_ipv6: default_whitelist_name_ipv6(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            driver: default_store_driver(),
            path: default_store_path(),
        }
    }
}

impl Default for FirewallConfig {
    fn default() -> Self {
        FirewallConfig {
            driver: default_fw_driver(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            verify: true,
            key: default_sync_key(),
            port: default_sync_port(),
            hosts: Vec::new(),
            bind_address: None,
            interface: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
        }
    }
}
