//! Configuration management
//!
//! TOML configuration file parsing with environment variable overrides
//! and validation. The environment keys match the deployment contract
//! (`CERTS_DIR`, `ACME_CHALLENGE_DIR`, `CERT_MAX_WAIT_TIME`, ...), so a
//! container can run without any file present.

use crate::error::{CertError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub certs: CertSettings,

    #[serde(default)]
    pub schedule: ScheduleSettings,

    #[serde(default)]
    pub mysql: MySqlSettings,

    #[serde(default)]
    pub redis: RedisSettings,

    #[serde(default)]
    pub kafka: KafkaSettings,

    #[serde(default)]
    pub server: ServerSettings,
}

/// Certificate pool and ACME driver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertSettings {
    /// Pool root containing `Websites/` and `Apis/`
    #[serde(default = "default_certs_dir")]
    pub certs_dir: String,

    /// HTTP-01 webroot served to the ACME CA
    #[serde(default = "default_challenge_dir")]
    pub acme_challenge_dir: String,

    /// ACME subprocess wall-clock timeout in seconds
    #[serde(default = "default_max_wait_time")]
    pub cert_max_wait_time: u64,

    /// Run the pool importer once at API boot
    #[serde(default)]
    pub read_on_startup: bool,
}

/// Cron settings for the background jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Weekly pool import day: mon..sun
    #[serde(default = "default_weekly_day")]
    pub weekly_day: String,

    #[serde(default = "default_weekly_hour")]
    pub weekly_hour: u32,

    #[serde(default)]
    pub weekly_minute: u32,
}

/// MySQL connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MySqlSettings {
    #[serde(default = "default_mysql_host")]
    pub host: String,

    #[serde(default = "default_mysql_port")]
    pub port: u16,

    #[serde(default = "default_mysql_database")]
    pub database: String,

    #[serde(default = "default_mysql_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_pool_size")]
    pub max_connections: u32,
}

/// Redis cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub db: u32,

    /// May be empty for an unauthenticated instance
    #[serde(default)]
    pub password: String,

    /// TTL for the list projection
    #[serde(default = "default_list_ttl")]
    pub list_ttl_secs: u64,

    /// TTL for the detail projection
    #[serde(default = "default_detail_ttl")]
    pub detail_ttl_secs: u64,
}

/// Event bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaSettings {
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,

    #[serde(default = "default_event_topic")]
    pub event_topic: String,

    /// Messages whose handler keeps failing are parked here
    #[serde(default = "default_poison_topic")]
    pub poison_topic: String,

    #[serde(default = "default_group_id")]
    pub group_id: String,
}

/// HTTP adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

// Default values
fn default_certs_dir() -> String {
    "/data/certs".to_string()
}

fn default_challenge_dir() -> String {
    "/data/acme-challenge".to_string()
}

fn default_max_wait_time() -> u64 {
    300
}

fn default_weekly_day() -> String {
    "sun".to_string()
}

fn default_weekly_hour() -> u32 {
    3
}

fn default_mysql_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_mysql_database() -> String {
    "certpool".to_string()
}

fn default_mysql_user() -> String {
    "certpool".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_list_ttl() -> u64 {
    300
}

fn default_detail_ttl() -> u64 {
    60
}

fn default_bootstrap_servers() -> String {
    "127.0.0.1:9092".to_string()
}

fn default_event_topic() -> String {
    "certpool.events".to_string()
}

fn default_poison_topic() -> String {
    "certpool.events.poison".to_string()
}

fn default_group_id() -> String {
    "certpool-worker".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for CertSettings {
    fn default() -> Self {
        Self {
            certs_dir: default_certs_dir(),
            acme_challenge_dir: default_challenge_dir(),
            cert_max_wait_time: default_max_wait_time(),
            read_on_startup: false,
        }
    }
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            weekly_day: default_weekly_day(),
            weekly_hour: default_weekly_hour(),
            weekly_minute: 0,
        }
    }
}

impl Default for MySqlSettings {
    fn default() -> Self {
        Self {
            host: default_mysql_host(),
            port: default_mysql_port(),
            database: default_mysql_database(),
            user: default_mysql_user(),
            password: String::new(),
            max_connections: default_pool_size(),
        }
    }
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            password: String::new(),
            list_ttl_secs: default_list_ttl(),
            detail_ttl_secs: default_detail_ttl(),
        }
    }
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            event_topic: default_event_topic(),
            poison_topic: default_poison_topic(),
            group_id: default_group_id(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            certs: CertSettings::default(),
            schedule: ScheduleSettings::default(),
            mysql: MySqlSettings::default(),
            redis: RedisSettings::default(),
            kafka: KafkaSettings::default(),
            server: ServerSettings::default(),
        }
    }
}

const WEEKDAYS: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

impl Config {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CertError::configuration(format!("Failed to read config file: {e}")))?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| CertError::configuration(format!("Failed to parse TOML: {e}")))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = env::var("CERTS_DIR") {
            self.certs.certs_dir = v;
        }
        if let Ok(v) = env::var("ACME_CHALLENGE_DIR") {
            self.certs.acme_challenge_dir = v;
        }
        if let Ok(v) = env::var("CERT_MAX_WAIT_TIME") {
            self.certs.cert_max_wait_time = parse_env("CERT_MAX_WAIT_TIME", &v)?;
        }
        if let Ok(v) = env::var("READ_ON_STARTUP") {
            self.certs.read_on_startup = parse_bool(&v);
        }

        if let Ok(v) = env::var("SCHEDULE_ENABLED") {
            self.schedule.enabled = parse_bool(&v);
        }
        if let Ok(v) = env::var("SCHEDULE_WEEKLY_DAY") {
            self.schedule.weekly_day = v.to_lowercase();
        }
        if let Ok(v) = env::var("SCHEDULE_WEEKLY_HOUR") {
            self.schedule.weekly_hour = parse_env("SCHEDULE_WEEKLY_HOUR", &v)?;
        }
        if let Ok(v) = env::var("SCHEDULE_WEEKLY_MINUTE") {
            self.schedule.weekly_minute = parse_env("SCHEDULE_WEEKLY_MINUTE", &v)?;
        }

        if let Ok(v) = env::var("MYSQL_HOST") {
            self.mysql.host = v;
        }
        if let Ok(v) = env::var("MYSQL_PORT") {
            self.mysql.port = parse_env("MYSQL_PORT", &v)?;
        }
        if let Ok(v) = env::var("MYSQL_DATABASE") {
            self.mysql.database = v;
        }
        if let Ok(v) = env::var("MYSQL_USER") {
            self.mysql.user = v;
        }
        if let Ok(v) = env::var("MYSQL_PASSWORD") {
            self.mysql.password = v;
        }

        if let Ok(v) = env::var("REDIS_HOST") {
            self.redis.host = v;
        }
        if let Ok(v) = env::var("REDIS_PORT") {
            self.redis.port = parse_env("REDIS_PORT", &v)?;
        }
        if let Ok(v) = env::var("REDIS_DB") {
            self.redis.db = parse_env("REDIS_DB", &v)?;
        }
        if let Ok(v) = env::var("REDIS_PASSWORD") {
            self.redis.password = v;
        }
        if let Ok(v) = env::var("REDIS_DEFAULT_TTL") {
            self.redis.list_ttl_secs = parse_env("REDIS_DEFAULT_TTL", &v)?;
        }

        if let Ok(v) = env::var("KAFKA_BOOTSTRAP_SERVERS") {
            self.kafka.bootstrap_servers = v;
        }
        if let Ok(v) = env::var("KAFKA_EVENT_TOPIC") {
            self.kafka.event_topic = v;
        }
        if let Ok(v) = env::var("KAFKA_POISON_TOPIC") {
            self.kafka.poison_topic = v;
        }
        if let Ok(v) = env::var("KAFKA_GROUP_ID") {
            self.kafka.group_id = v;
        }

        if let Ok(v) = env::var("LISTEN_ADDR") {
            self.server.listen_addr = v;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.certs.certs_dir.is_empty() {
            return Err(CertError::configuration("certs_dir cannot be empty"));
        }
        if self.certs.acme_challenge_dir.is_empty() {
            return Err(CertError::configuration(
                "acme_challenge_dir cannot be empty",
            ));
        }
        if self.certs.cert_max_wait_time == 0 {
            return Err(CertError::configuration(
                "cert_max_wait_time must be greater than 0",
            ));
        }

        if !WEEKDAYS.contains(&self.schedule.weekly_day.as_str()) {
            return Err(CertError::configuration(format!(
                "weekly_day must be one of {}, got '{}'",
                WEEKDAYS.join("/"),
                self.schedule.weekly_day
            )));
        }
        if self.schedule.weekly_hour > 23 {
            return Err(CertError::configuration(format!(
                "weekly_hour must be in 0-23, got {}",
                self.schedule.weekly_hour
            )));
        }
        if self.schedule.weekly_minute > 59 {
            return Err(CertError::configuration(format!(
                "weekly_minute must be in 0-59, got {}",
                self.schedule.weekly_minute
            )));
        }

        if self.mysql.host.is_empty() || self.mysql.database.is_empty() {
            return Err(CertError::configuration(
                "mysql host and database cannot be empty",
            ));
        }
        if self.kafka.bootstrap_servers.is_empty() || self.kafka.event_topic.is_empty() {
            return Err(CertError::configuration(
                "kafka bootstrap_servers and event_topic cannot be empty",
            ));
        }

        Ok(())
    }

    /// MySQL connection URL for the pool
    pub fn mysql_url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.mysql.user, self.mysql.password, self.mysql.host, self.mysql.port, self.mysql.database
        )
    }

    /// Redis connection URL
    pub fn redis_url(&self) -> String {
        if self.redis.password.is_empty() {
            format!("redis://{}:{}/{}", self.redis.host, self.redis.port, self.redis.db)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.redis.password, self.redis.host, self.redis.port, self.redis.db
            )
        }
    }

    /// ACME subprocess timeout as a Duration
    pub fn cert_max_wait(&self) -> Duration {
        Duration::from_secs(self.certs.cert_max_wait_time)
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1")
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| CertError::configuration(format!("{key} has invalid value '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.redis.list_ttl_secs, 300);
        assert_eq!(config.redis.detail_ttl_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_string() {
        let toml = r#"
[certs]
certs_dir = "/srv/certs"
acme_challenge_dir = "/srv/challenge"
cert_max_wait_time = 120
read_on_startup = true

[schedule]
enabled = true
weekly_day = "mon"
weekly_hour = 2
weekly_minute = 30

[mysql]
host = "db"
password = "secret"

[kafka]
event_topic = "certs.events"
"#;

        let config = Config::from_str(toml).unwrap();
        assert_eq!(config.certs.certs_dir, "/srv/certs");
        assert_eq!(config.certs.cert_max_wait_time, 120);
        assert!(config.certs.read_on_startup);
        assert_eq!(config.schedule.weekly_day, "mon");
        assert_eq!(config.kafka.event_topic, "certs.events");
        assert_eq!(config.mysql_url(), "mysql://certpool:secret@db:3306/certpool");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_weekday() {
        let mut config = Config::default();
        config.schedule.weekly_day = "someday".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redis_url_with_password() {
        let mut config = Config::default();
        assert_eq!(config.redis_url(), "redis://127.0.0.1:6379/0");
        config.redis.password = "pw".to_string();
        assert_eq!(config.redis_url(), "redis://:pw@127.0.0.1:6379/0");
    }
}
