// Application configuration, loaded from environment variables and CLI flags.

use std::time::Duration;

use chrono::NaiveTime;
use thiserror::Error;

use crate::db::NameMatch;
use crate::sampler::{IdRange, SamplingStrategy};

/// Upper bound on `DAILY_GAME_SLOTS`.
pub const MAX_GAME_SLOTS: u32 = 1000;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(var: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            var,
            reason: reason.into(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (SQLite connection string).
    pub database_url: String,
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Local wall-clock time at which the daily rotation fires.
    pub fire_time: NaiveTime,
    /// Number of game slots (K); slots are numbered 1..=K.
    pub game_slots: u32,
    /// Disjoint species id ranges the sampler draws from, in declaration order.
    pub id_ranges: Vec<IdRange>,
    pub sampling: SamplingStrategy,
    pub name_match: NameMatch,
    /// Upper bound on every single store operation.
    pub store_timeout: Duration,
    /// Skip spawning the background rotation task.
    pub scheduler_disabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: "sqlite:pokemon.db?mode=rwc".to_string(),
            port: 8080,
            fire_time: NaiveTime::MIN,
            game_slots: 3,
            id_ranges: vec![IdRange::new(1, 1025), IdRange::new(10001, 10279)],
            sampling: SamplingStrategy::Counted,
            name_match: NameMatch::Exact,
            store_timeout: Duration::from_secs(10),
            scheduler_disabled: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// Environment variables:
    /// - `DATABASE_URL` - SQLite connection string (default: `sqlite:pokemon.db?mode=rwc`)
    /// - `PORT` - HTTP server port (default: 8080)
    /// - `DAILY_FIRE_TIME` - local `HH:MM` of the daily rotation (default: `00:00`)
    /// - `DAILY_GAME_SLOTS` - number of game slots, at most 1000 (default: 3)
    /// - `SPECIES_ID_RANGES` - e.g. `1-1025,10001-10279`
    /// - `SAMPLING_STRATEGY` - `counted` (default) or `dense`
    /// - `NAME_MATCH` - `exact` (default) or `prefix`
    /// - `STORE_TIMEOUT_SECS` - per-operation store timeout, at least 1 (default: 10)
    /// - `DISABLE_SCHEDULER` - set to `true` to skip the rotation task
    ///
    /// CLI flags:
    /// - `--port <PORT>` - Override the port
    /// - `--fire-time <HH:MM>` - Override the rotation time
    /// - `--no-scheduler` - Same as `DISABLE_SCHEDULER=true`
    pub fn load() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().collect();
        Self::from_sources(&args, |key| std::env::var(key).ok())
    }

    /// Build a configuration from CLI arguments and an environment lookup.
    pub fn from_sources<F>(args: &[String], env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(url) = env("DATABASE_URL") {
            config.database_url = url;
        }

        // CLI flag takes precedence, then env var, then default
        if let Some(port) = Self::parse_cli_value(args, "--port").or_else(|| env("PORT")) {
            config.port = port
                .parse()
                .map_err(|_| ConfigError::invalid("PORT", format!("'{port}' is not a port")))?;
        }

        if let Some(time) =
            Self::parse_cli_value(args, "--fire-time").or_else(|| env("DAILY_FIRE_TIME"))
        {
            config.fire_time = parse_fire_time(&time)?;
        }

        if let Some(slots) = env("DAILY_GAME_SLOTS") {
            config.game_slots = match slots.parse::<u32>() {
                Ok(n) if (1..=MAX_GAME_SLOTS).contains(&n) => n,
                _ => {
                    return Err(ConfigError::invalid(
                        "DAILY_GAME_SLOTS",
                        format!("'{slots}' is not an integer in 1..={MAX_GAME_SLOTS}"),
                    ))
                }
            };
        }

        if let Some(ranges) = env("SPECIES_ID_RANGES") {
            config.id_ranges = parse_id_ranges(&ranges)?;
        }

        if let Some(strategy) = env("SAMPLING_STRATEGY") {
            config.sampling = match strategy.to_ascii_lowercase().as_str() {
                "counted" => SamplingStrategy::Counted,
                "dense" => SamplingStrategy::Dense,
                other => {
                    return Err(ConfigError::invalid(
                        "SAMPLING_STRATEGY",
                        format!("'{other}' (expected counted or dense)"),
                    ))
                }
            };
        }

        if let Some(mode) = env("NAME_MATCH") {
            config.name_match = match mode.to_ascii_lowercase().as_str() {
                "exact" => NameMatch::Exact,
                "prefix" => NameMatch::Prefix,
                other => {
                    return Err(ConfigError::invalid(
                        "NAME_MATCH",
                        format!("'{other}' (expected exact or prefix)"),
                    ))
                }
            };
        }

        if let Some(secs) = env("STORE_TIMEOUT_SECS") {
            config.store_timeout = match secs.parse::<u64>() {
                Ok(n) if n >= 1 => Duration::from_secs(n),
                _ => {
                    return Err(ConfigError::invalid(
                        "STORE_TIMEOUT_SECS",
                        format!("'{secs}' is not a positive number of seconds"),
                    ))
                }
            };
        }

        config.scheduler_disabled = args.contains(&"--no-scheduler".to_string())
            || env("DISABLE_SCHEDULER")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false);

        Ok(config)
    }

    /// Parse a CLI flag value like `--port 8080`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }
}

fn parse_fire_time(value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| {
        ConfigError::invalid(
            "DAILY_FIRE_TIME",
            format!("'{value}' (expected HH:MM)"),
        )
    })
}

/// Parse `lo-hi[,lo-hi...]` into disjoint ranges, keeping declaration order.
pub fn parse_id_ranges(value: &str) -> Result<Vec<IdRange>, ConfigError> {
    let invalid = |reason: String| ConfigError::invalid("SPECIES_ID_RANGES", reason);

    let mut ranges: Vec<IdRange> = Vec::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (lo, hi) = part
            .split_once('-')
            .ok_or_else(|| invalid(format!("'{part}' is not of the form lo-hi")))?;
        let lo: i64 = lo
            .trim()
            .parse()
            .map_err(|_| invalid(format!("'{part}' has a non-numeric bound")))?;
        let hi: i64 = hi
            .trim()
            .parse()
            .map_err(|_| invalid(format!("'{part}' has a non-numeric bound")))?;
        if lo > hi {
            return Err(invalid(format!("'{part}' has lo > hi")));
        }
        let range = IdRange::new(lo, hi);
        if let Some(other) = ranges.iter().find(|r| r.overlaps(&range)) {
            return Err(invalid(format!("'{part}' overlaps {other}")));
        }
        ranges.push(range);
    }

    if ranges.is_empty() {
        return Err(invalid("no ranges given".to_string()));
    }
    Ok(ranges)
}
