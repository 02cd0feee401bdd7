//! Loader configuration
//!
//! TOML file with `database`, `session` and `chain` sections. Every field has
//! a default, so an empty or missing file yields a usable configuration.

use anyhow::{bail, Context};
use chrono::{Duration, NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "SCALETIME_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "scaletime.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub chain: ChainConfig,
}

impl Settings {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let settings: Self = toml::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from `SCALETIME_CONFIG` or the default path, falling back to
    /// built-in defaults when the file is absent.
    pub fn from_env() -> anyhow::Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        if !Path::new(&path).exists() {
            tracing::debug!("Using default settings ({} not found)", path);
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let step = self.session.step()?;
        if self.session.close < self.session.open {
            bail!(
                "session close {} is before open {}",
                self.session.close,
                self.session.open
            );
        }
        if step > Duration::days(1) {
            bail!("session step {} is longer than a day", self.session.step);
        }
        if self.chain.table.trim().is_empty() {
            bail!("chain.table must not be empty");
        }
        Ok(())
    }
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Reconnects allowed per loader operation
    #[serde(default = "default_retries")]
    pub retries_on_disconnect: u32,

    /// Remote target, used only for descriptive logging
    #[serde(default)]
    pub remote: Option<ConnectionDescriptor>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("scaletime.db")
}

fn default_retries() -> u32 {
    crate::loader::DEFAULT_RETRIES_ON_DISCONNECT
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            retries_on_disconnect: default_retries(),
            remote: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_open", with = "clock_serde")]
    pub open: NaiveTime,

    #[serde(default = "default_close", with = "clock_serde")]
    pub close: NaiveTime,

    /// Step interval: "5m", "300s", "1h" or bare seconds
    #[serde(default = "default_step")]
    pub step: String,

    #[serde(default = "default_tz", with = "tz_serde")]
    pub tz: Tz,
}

fn default_open() -> NaiveTime {
    NaiveTime::from_hms_opt(8, 30, 0).unwrap_or(NaiveTime::MIN)
}

fn default_close() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 0, 0).unwrap_or(NaiveTime::MIN)
}

fn default_step() -> String {
    "5m".to_string()
}

fn default_tz() -> Tz {
    chrono_tz::America::Chicago
}

impl SessionConfig {
    pub fn step(&self) -> anyhow::Result<Duration> {
        parse_step(&self.step)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            open: default_open(),
            close: default_close(),
            step: default_step(),
            tz: default_tz(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_table")]
    pub table: String,

    #[serde(default = "default_num_expiries")]
    pub num_expiries: usize,

    #[serde(default = "default_num_strikes")]
    pub num_strikes: usize,

    #[serde(default = "default_expiry_weekday")]
    pub expiry_weekday: Weekday,

    /// Fixed RNG seed; entropy when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_table() -> String {
    crate::pricing::PRICING_TABLE.to_string()
}

fn default_num_expiries() -> usize {
    12
}

fn default_num_strikes() -> usize {
    500
}

fn default_expiry_weekday() -> Weekday {
    Weekday::Fri
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            num_expiries: default_num_expiries(),
            num_strikes: default_num_strikes(),
            expiry_weekday: default_expiry_weekday(),
            seed: None,
        }
    }
}

// =============================================================================
// Remote connection descriptor
// =============================================================================

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub dbname: String,
}

fn default_port() -> u16 {
    5432
}

impl ConnectionDescriptor {
    pub fn conn_string(&self) -> String {
        self.render(&self.password)
    }

    /// Same as `conn_string` with the password masked. Safe to log.
    pub fn redacted(&self) -> String {
        self.render("***")
    }

    fn render(&self, password: &str) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode=require",
            self.user, password, self.host, self.port, self.dbname
        )
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

// =============================================================================
// Parsing helpers
// =============================================================================

/// Parse a step interval. Accepts `<n>s`, `<n>m`, `<n>min`, `<n>h` or a bare
/// number of seconds. Zero is rejected.
pub fn parse_step(raw: &str) -> anyhow::Result<Duration> {
    let s = raw.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        bail!("invalid step {:?}: missing number", raw);
    }
    let n: i64 = digits
        .parse()
        .with_context(|| format!("invalid step {:?}", raw))?;

    let step = match unit.trim() {
        "" | "s" | "sec" => Duration::try_seconds(n),
        "m" | "min" => Duration::try_minutes(n),
        "h" => Duration::try_hours(n),
        other => bail!("invalid step {:?}: unknown unit {:?}", raw, other),
    };
    match step {
        Some(d) if d > Duration::zero() => Ok(d),
        Some(_) => bail!("invalid step {:?}: must be positive", raw),
        None => bail!("invalid step {:?}: out of range", raw),
    }
}

/// `HH:MM` wall-clock times (seconds optional on input)
mod clock_serde {
    use chrono::NaiveTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(t: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&t.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&s, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M:%S"))
            .map_err(serde::de::Error::custom)
    }
}

/// Time zones by IANA name
mod tz_serde {
    use chrono_tz::Tz;
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(tz.name())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Tz, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Tz::from_str(&s).map_err(serde::de::Error::custom)
    }
}
