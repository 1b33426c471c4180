// ===============================
// src/config.rs
// ===============================
//
// Env-first configuration with a thin CLI on top. Everything has a default
// except broker credentials, which are fatal to omit in live mode.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::NaiveDate;
use clap::Parser;
use dotenvy::dotenv;
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(name = "krx-pilot", about = "unattended KRX trading controller")]
pub struct Cli {
    /// Read this file instead of ./.env
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// Force the paper gateway regardless of TRADE_MODE
    #[arg(long)]
    pub paper: bool,

    /// Override METRICS_PORT
    #[arg(long)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("env file {path}: {err}")]
    EnvFile { path: String, err: dotenvy::Error },
    #[error("{key} entry {entry:?} is not a date (want YYYY-MM-DD)")]
    BadDate { key: &'static str, entry: String },
    #[error("live mode needs {0}")]
    MissingCredential(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TradeMode {
    Paper,
    Live,
}

impl TradeMode {
    fn from_env(default_mode: TradeMode) -> TradeMode {
        match env::var("TRADE_MODE").unwrap_or_default().to_ascii_lowercase().as_str() {
            "paper" => TradeMode::Paper,
            "live" => TradeMode::Live,
            _ => default_mode,
        }
    }

    pub fn is_live(self) -> bool {
        self == TradeMode::Live
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub mode: TradeMode,

    // broker REST + WS
    pub base_url: String,
    pub ws_url: String,
    pub app_key: String,
    pub app_secret: String,
    pub account_no: String,
    pub account_product: String,
    pub token_cache: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub max_rps: usize,

    // local state
    pub ledger_dir: PathBuf,
    pub stats_file: Option<PathBuf>,
    pub store_path: Option<PathBuf>,

    // market calendar + watch list
    pub holidays: Vec<NaiveDate>,
    pub pre_market: bool,
    pub nxt_market: bool,
    pub nxt_symbols: Vec<String>,
    pub watch: Vec<(String, f64)>,

    pub initial_capital: f64,
    pub metrics_port: u16,
}

pub fn load(cli: &Cli) -> Result<Settings, ConfigError> {
    match cli.env_file.as_ref() {
        Some(path) => {
            dotenvy::from_path(path).map_err(|err| ConfigError::EnvFile {
                path: path.display().to_string(),
                err,
            })?;
        }
        // Missing ./.env is fine, env vars may come from the shell.
        None => {
            let _ = dotenv();
        }
    }

    let mode = if cli.paper {
        TradeMode::Paper
    } else {
        TradeMode::from_env(TradeMode::Paper)
    };

    let settings = Settings {
        mode,
        base_url: var("KIS_BASE_URL", "https://openapi.koreainvestment.com:9443"),
        ws_url: var("KIS_WS_URL", "ws://ops.koreainvestment.com:21000"),
        app_key: var("KIS_APP_KEY", ""),
        app_secret: var("KIS_APP_SECRET", ""),
        account_no: var("KIS_ACCOUNT_NO", ""),
        account_product: var("KIS_ACCOUNT_PRODUCT", "01"),
        token_cache: opt_path("TOKEN_CACHE", "data/token.json"),
        http_timeout_secs: parse_var("HTTP_TIMEOUT_SECS", 10),
        max_rps: parse_var("MAX_RPS", 18),
        ledger_dir: PathBuf::from(var("LEDGER_DIR", "data/trades")),
        stats_file: opt_path("RISK_STATS_FILE", "data/daily_stats.json"),
        store_path: opt_path("STORE_PATH", "data/trades.db"),
        holidays: parse_holidays(&var("HOLIDAYS", ""))?,
        pre_market: parse_var("PRE_MARKET", true),
        nxt_market: parse_var("NXT_MARKET", true),
        nxt_symbols: list("NXT_SYMBOLS"),
        watch: parse_watch(&var("WATCH_SYMBOLS", "")),
        initial_capital: parse_var("INITIAL_CAPITAL", 10_000_000.0),
        metrics_port: cli.metrics_port.unwrap_or_else(|| parse_var("METRICS_PORT", 9898)),
    };

    if settings.mode.is_live() {
        if settings.app_key.is_empty() {
            return Err(ConfigError::MissingCredential("KIS_APP_KEY"));
        }
        if settings.app_secret.is_empty() {
            return Err(ConfigError::MissingCredential("KIS_APP_SECRET"));
        }
        if settings.account_no.is_empty() {
            return Err(ConfigError::MissingCredential("KIS_ACCOUNT_NO"));
        }
    }

    Ok(settings)
}

// ---- env helpers ----

fn var(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

/// Empty value disables the path entirely.
fn opt_path(key: &str, default: &str) -> Option<PathBuf> {
    let raw = var(key, default);
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(PathBuf::from(trimmed))
    }
}

fn list(key: &str) -> Vec<String> {
    env::var(key)
        .ok()
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|x| !x.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

// ---- pure parsers ----

/// `WATCH_SYMBOLS=005930:82.5,000660:74`; a missing score reads as 0.
fn parse_watch(raw: &str) -> Vec<(String, f64)> {
    raw.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((sym, score)) => {
                (sym.trim().to_string(), score.trim().parse().unwrap_or(0.0))
            }
            None => (entry.to_string(), 0.0),
        })
        .collect()
}

/// A malformed holiday would let the controller trade on a closed day, so
/// bad entries are fatal rather than skipped.
fn parse_holidays(raw: &str) -> Result<Vec<NaiveDate>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(|entry| {
            NaiveDate::parse_from_str(entry, "%Y-%m-%d").map_err(|_| ConfigError::BadDate {
                key: "HOLIDAYS",
                entry: entry.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_pairs_parse_with_and_without_score() {
        let w = parse_watch("005930:82.5, 000660:74,035420");
        assert_eq!(w.len(), 3);
        assert_eq!(w[0].0, "005930");
        assert!((w[0].1 - 82.5).abs() < 1e-9);
        assert_eq!(w[2], ("035420".to_string(), 0.0));
        assert!(parse_watch("").is_empty());
    }

    #[test]
    fn test_holidays_reject_malformed_dates() {
        let ok = parse_holidays("2026-01-01,2026-03-01").unwrap();
        assert_eq!(ok.len(), 2);
        assert_eq!(ok[0], NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
        assert!(parse_holidays("2026-13-40").is_err());
        assert!(parse_holidays("").unwrap().is_empty());
    }
}
