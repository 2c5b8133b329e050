use crate::model::TradingMode;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fmt;
use std::fs::File;
use std::path::Path;

const DEFAULT_INTERVAL_SECS: u64 = 300;
const DEFAULT_CANDLE_INTERVAL: &str = "1h";
const DEFAULT_HISTORY_DAYS: u32 = 30;
const DEFAULT_LOOKBACK_DAYS: f64 = 7.0;
const DEFAULT_FEE_RATE: Decimal = dec!(0.001);
const DEFAULT_TAKE_PROFIT_PERCENT: f64 = 5.0;
const DEFAULT_MAX_HOLDING_HOURS: u64 = 168;
const DEFAULT_CALL_TIMEOUT_MILLIS: u64 = 10_000;
const DEFAULT_PARAMS_VALIDITY_DAYS: i64 = 7;
const DEFAULT_ANNUALIZATION_FACTOR: f64 = 8760.0;
const DEFAULT_MIN_BACKTEST_TRADES: usize = 3;
const DEFAULT_INITIAL_BALANCE: Decimal = dec!(10000);
const DEFAULT_HEARTBEAT_STALE_SECS: u64 = 900;
const DEFAULT_REPLAY_STEP_MILLIS: u64 = 10;

pub const MAX_POSITION_USD_LIMIT: Decimal = dec!(100000);
pub const MAX_CONCURRENT_SPREADS_LIMIT: usize = 20;

#[derive(Debug)]
pub enum ConfigError {
    OutOfRange(String),
    UnknownUniverse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::OutOfRange(e) => write!(f, "Out of range: {}", e),
            ConfigError::UnknownUniverse(e) => write!(f, "Unknown universe: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Runtime trading configuration. Lives in the store and is replaced as a
/// whole; partial updates go through [`BotConfigPatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    pub enabled: bool,
    pub mode: TradingMode,
    pub max_position_usd: Decimal,
    pub max_concurrent_spreads: usize,
    pub min_quality_stars: u8,
    pub min_win_rate: f64,
    pub z_entry_threshold: f64,
    pub z_exit_threshold: f64,
    pub stop_loss_percent: f64,
    pub active_universes: Vec<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: TradingMode::Paper,
            max_position_usd: dec!(1000),
            max_concurrent_spreads: 3,
            min_quality_stars: 3,
            min_win_rate: 0.5,
            z_entry_threshold: 2.0,
            z_exit_threshold: 0.5,
            stop_loss_percent: 10.0,
            active_universes: vec!["majors".to_string()],
        }
    }
}

impl BotConfig {
    pub fn validate(&self, universes: &BTreeMap<String, Vec<String>>) -> Result<(), ConfigError> {
        if self.max_position_usd <= Decimal::ZERO || self.max_position_usd > MAX_POSITION_USD_LIMIT {
            return Err(ConfigError::OutOfRange(format!(
                "max_position_usd must be in (0, {}], got {}",
                MAX_POSITION_USD_LIMIT, self.max_position_usd
            )));
        }
        if self.max_concurrent_spreads == 0
            || self.max_concurrent_spreads > MAX_CONCURRENT_SPREADS_LIMIT
        {
            return Err(ConfigError::OutOfRange(format!(
                "max_concurrent_spreads must be in [1, {}], got {}",
                MAX_CONCURRENT_SPREADS_LIMIT, self.max_concurrent_spreads
            )));
        }
        if !(2..=5).contains(&self.min_quality_stars) {
            return Err(ConfigError::OutOfRange(format!(
                "min_quality_stars must be in [2, 5], got {}",
                self.min_quality_stars
            )));
        }
        if !(0.0..=1.0).contains(&self.min_win_rate) {
            return Err(ConfigError::OutOfRange(format!(
                "min_win_rate must be in [0, 1], got {}",
                self.min_win_rate
            )));
        }
        if !(self.z_entry_threshold > 0.0 && self.z_entry_threshold <= 5.0) {
            return Err(ConfigError::OutOfRange(format!(
                "z_entry_threshold must be in (0, 5], got {}",
                self.z_entry_threshold
            )));
        }
        if !(self.z_exit_threshold >= 0.0 && self.z_exit_threshold < self.z_entry_threshold) {
            return Err(ConfigError::OutOfRange(format!(
                "z_exit_threshold must be in [0, z_entry_threshold), got {}",
                self.z_exit_threshold
            )));
        }
        if !(self.stop_loss_percent > 0.0 && self.stop_loss_percent <= 100.0) {
            return Err(ConfigError::OutOfRange(format!(
                "stop_loss_percent must be in (0, 100], got {}",
                self.stop_loss_percent
            )));
        }
        if self.active_universes.is_empty() {
            return Err(ConfigError::OutOfRange(
                "active_universes must not be empty".to_string(),
            ));
        }
        if let Some(unknown) = self
            .active_universes
            .iter()
            .find(|name| !universes.contains_key(name.as_str()))
        {
            return Err(ConfigError::UnknownUniverse(unknown.clone()));
        }
        Ok(())
    }

    /// Field-merge; the result still has to pass [`BotConfig::validate`].
    pub fn merged(&self, patch: &BotConfigPatch) -> BotConfig {
        let mut next = self.clone();
        if let Some(v) = patch.enabled {
            next.enabled = v;
        }
        if let Some(v) = patch.mode {
            next.mode = v;
        }
        if let Some(v) = patch.max_position_usd {
            next.max_position_usd = v;
        }
        if let Some(v) = patch.max_concurrent_spreads {
            next.max_concurrent_spreads = v;
        }
        if let Some(v) = patch.min_quality_stars {
            next.min_quality_stars = v;
        }
        if let Some(v) = patch.min_win_rate {
            next.min_win_rate = v;
        }
        if let Some(v) = patch.z_entry_threshold {
            next.z_entry_threshold = v;
        }
        if let Some(v) = patch.z_exit_threshold {
            next.z_exit_threshold = v;
        }
        if let Some(v) = patch.stop_loss_percent {
            next.stop_loss_percent = v;
        }
        if let Some(v) = &patch.active_universes {
            next.active_universes = v.clone();
        }
        next
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BotConfigPatch {
    pub enabled: Option<bool>,
    pub mode: Option<TradingMode>,
    pub max_position_usd: Option<Decimal>,
    pub max_concurrent_spreads: Option<usize>,
    pub min_quality_stars: Option<u8>,
    pub min_win_rate: Option<f64>,
    pub z_entry_threshold: Option<f64>,
    pub z_exit_threshold: Option<f64>,
    pub stop_loss_percent: Option<f64>,
    pub active_universes: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum StringOrVec {
    String(String),
    Vec(Vec<String>),
}

impl StringOrVec {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrVec::String(value) => split_assets(&value),
            StringOrVec::Vec(values) => values
                .into_iter()
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct SettingsYaml {
    interval_secs: Option<u64>,
    candle_interval: Option<String>,
    history_days: Option<u32>,
    lookback_days: Option<f64>,
    universes: Option<BTreeMap<String, StringOrVec>>,
    fee_rate: Option<Decimal>,
    take_profit_percent: Option<f64>,
    max_holding_hours: Option<u64>,
    call_timeout_millis: Option<u64>,
    params_validity_days: Option<i64>,
    annualization_factor: Option<f64>,
    min_backtest_trades: Option<usize>,
    initial_balance: Option<Decimal>,
    heartbeat_stale_secs: Option<u64>,
    state_file: Option<String>,
    status_file: Option<String>,
    replay_file: Option<String>,
    replay_reject_probability: Option<f64>,
    replay_step_millis: Option<u64>,
    bot: Option<BotConfigPatch>,
}

/// Process-level settings. Unlike [`BotConfig`] these are fixed for the
/// lifetime of the process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub interval_secs: u64,
    pub candle_interval: String,
    pub history_days: u32,
    pub lookback_days: f64,
    pub universes: BTreeMap<String, Vec<String>>,
    pub fee_rate: Decimal,
    pub take_profit_percent: f64,
    pub max_holding_hours: u64,
    pub call_timeout_millis: u64,
    pub params_validity_days: i64,
    pub annualization_factor: f64,
    pub min_backtest_trades: usize,
    pub initial_balance: Decimal,
    pub heartbeat_stale_secs: u64,
    pub state_file: Option<String>,
    pub status_file: Option<String>,
    // Replay feed used in place of a venue connector
    pub replay_file: Option<String>,
    pub replay_reject_probability: f64,
    pub replay_step_millis: u64,
    /// Initial runtime configuration, used when the store has none yet.
    pub bot: BotConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
            candle_interval: DEFAULT_CANDLE_INTERVAL.to_string(),
            history_days: DEFAULT_HISTORY_DAYS,
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            universes: default_universes(),
            fee_rate: DEFAULT_FEE_RATE,
            take_profit_percent: DEFAULT_TAKE_PROFIT_PERCENT,
            max_holding_hours: DEFAULT_MAX_HOLDING_HOURS,
            call_timeout_millis: DEFAULT_CALL_TIMEOUT_MILLIS,
            params_validity_days: DEFAULT_PARAMS_VALIDITY_DAYS,
            annualization_factor: DEFAULT_ANNUALIZATION_FACTOR,
            min_backtest_trades: DEFAULT_MIN_BACKTEST_TRADES,
            initial_balance: DEFAULT_INITIAL_BALANCE,
            heartbeat_stale_secs: DEFAULT_HEARTBEAT_STALE_SECS,
            state_file: None,
            status_file: None,
            replay_file: None,
            replay_reject_probability: 0.0,
            replay_step_millis: DEFAULT_REPLAY_STEP_MILLIS,
            bot: BotConfig::default(),
        }
    }
}

fn default_universes() -> BTreeMap<String, Vec<String>> {
    let mut universes = BTreeMap::new();
    universes.insert(
        "majors".to_string(),
        ["BTC", "ETH", "SOL", "BNB", "XRP"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    );
    universes
}

impl Settings {
    pub fn from_env_or_yaml() -> Result<Self> {
        let config_path = env::var("SPREADBOT_CONFIG_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty());
        if let Some(path) = config_path {
            return Self::from_yaml_path(path);
        }
        Self::from_env()
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open spreadbot config {}", path_ref.display()))?;
        let yaml: SettingsYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse spreadbot config {}", path_ref.display()))?;
        let mut settings = Self::from_yaml(yaml);
        settings.apply_env_overrides()?;
        settings.check()?;
        Ok(settings)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let yaml: SettingsYaml = serde_yaml::from_str(raw).context("failed to parse settings")?;
        let settings = Self::from_yaml(yaml);
        settings.check()?;
        Ok(settings)
    }

    fn from_yaml(yaml: SettingsYaml) -> Self {
        let defaults = Settings::default();
        let universes = yaml
            .universes
            .map(|map| {
                map.into_iter()
                    .map(|(name, assets)| (name, assets.into_vec()))
                    .collect()
            })
            .unwrap_or(defaults.universes);
        let bot = yaml
            .bot
            .map(|patch| defaults.bot.merged(&patch))
            .unwrap_or(defaults.bot);
        Settings {
            interval_secs: yaml.interval_secs.unwrap_or(defaults.interval_secs),
            candle_interval: yaml.candle_interval.unwrap_or(defaults.candle_interval),
            history_days: yaml.history_days.unwrap_or(defaults.history_days),
            lookback_days: yaml.lookback_days.unwrap_or(defaults.lookback_days),
            universes,
            fee_rate: yaml.fee_rate.unwrap_or(defaults.fee_rate),
            take_profit_percent: yaml
                .take_profit_percent
                .unwrap_or(defaults.take_profit_percent),
            max_holding_hours: yaml.max_holding_hours.unwrap_or(defaults.max_holding_hours),
            call_timeout_millis: yaml.call_timeout_millis.unwrap_or(defaults.call_timeout_millis),
            params_validity_days: yaml
                .params_validity_days
                .unwrap_or(defaults.params_validity_days),
            annualization_factor: yaml
                .annualization_factor
                .unwrap_or(defaults.annualization_factor),
            min_backtest_trades: yaml
                .min_backtest_trades
                .unwrap_or(defaults.min_backtest_trades),
            initial_balance: yaml.initial_balance.unwrap_or(defaults.initial_balance),
            heartbeat_stale_secs: yaml
                .heartbeat_stale_secs
                .unwrap_or(defaults.heartbeat_stale_secs),
            state_file: yaml.state_file,
            status_file: yaml.status_file,
            replay_file: yaml.replay_file,
            replay_reject_probability: yaml
                .replay_reject_probability
                .unwrap_or(defaults.replay_reject_probability),
            replay_step_millis: yaml
                .replay_step_millis
                .unwrap_or(defaults.replay_step_millis),
            bot,
        }
    }

    pub fn from_env() -> Result<Self> {
        let mut settings = Settings::default();
        settings.apply_env_overrides()?;
        settings.check()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_parse::<u64>("INTERVAL_SECS")? {
            self.interval_secs = v;
        }
        if let Ok(v) = env::var("CANDLE_INTERVAL") {
            if !v.trim().is_empty() {
                self.candle_interval = v.trim().to_string();
            }
        }
        if let Some(v) = env_parse::<u32>("HISTORY_DAYS")? {
            self.history_days = v;
        }
        if let Some(v) = env_parse::<f64>("LOOKBACK_DAYS")? {
            self.lookback_days = v;
        }
        if let Ok(raw) = env::var("UNIVERSES") {
            if !raw.trim().is_empty() {
                self.universes = parse_universes(&raw)?;
            }
        }
        if let Some(v) = env_parse::<Decimal>("FEE_RATE")? {
            self.fee_rate = v;
        }
        if let Some(v) = env_parse::<f64>("TAKE_PROFIT_PERCENT")? {
            self.take_profit_percent = v;
        }
        if let Some(v) = env_parse::<u64>("MAX_HOLDING_HOURS")? {
            self.max_holding_hours = v;
        }
        if let Some(v) = env_parse::<u64>("CALL_TIMEOUT_MILLIS")? {
            self.call_timeout_millis = v;
        }
        if let Some(v) = env_parse::<i64>("PARAMS_VALIDITY_DAYS")? {
            self.params_validity_days = v;
        }
        if let Some(v) = env_parse::<Decimal>("INITIAL_BALANCE")? {
            self.initial_balance = v;
        }
        if let Ok(v) = env::var("STATE_FILE") {
            self.state_file = Some(v).filter(|v| !v.trim().is_empty());
        }
        if let Ok(v) = env::var("STATUS_FILE") {
            self.status_file = Some(v).filter(|v| !v.trim().is_empty());
        }
        if let Ok(v) = env::var("REPLAY_FILE") {
            self.replay_file = Some(v).filter(|v| !v.trim().is_empty());
        }
        if let Some(v) = env_parse::<f64>("REPLAY_REJECT_PROBABILITY")? {
            self.replay_reject_probability = v;
        }
        if let Ok(v) = env::var("TRADING_MODE") {
            self.bot.mode = v.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(v) = env_parse::<Decimal>("MAX_POSITION_USD")? {
            self.bot.max_position_usd = v;
        }
        if let Some(v) = env_parse::<usize>("MAX_CONCURRENT_SPREADS")? {
            self.bot.max_concurrent_spreads = v;
        }
        if let Some(v) = env_parse::<f64>("ENTRY_Z_SCORE")? {
            self.bot.z_entry_threshold = v;
        }
        if let Some(v) = env_parse::<f64>("EXIT_Z_SCORE")? {
            self.bot.z_exit_threshold = v;
        }
        if let Some(v) = env_parse::<f64>("STOP_LOSS_PERCENT")? {
            self.bot.stop_loss_percent = v;
        }
        if let Ok(v) = env::var("ACTIVE_UNIVERSES") {
            let names = split_assets(&v);
            if !names.is_empty() {
                self.bot.active_universes = names;
            }
        }
        Ok(())
    }

    fn check(&self) -> Result<()> {
        if self.lookback_days <= 0.0 {
            anyhow::bail!("lookback_days must be positive");
        }
        if self.fee_rate < Decimal::ZERO || self.fee_rate >= Decimal::ONE {
            anyhow::bail!("fee_rate must be in [0, 1)");
        }
        if !(0.0..=1.0).contains(&self.replay_reject_probability) {
            anyhow::bail!("replay_reject_probability must be in [0, 1]");
        }
        if self.initial_balance <= Decimal::ZERO {
            anyhow::bail!("initial_balance must be positive");
        }
        self.bot
            .validate(&self.universes)
            .context("invalid initial bot configuration")?;
        Ok(())
    }

    pub fn call_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.call_timeout_millis.max(1))
    }

    pub fn max_holding(&self) -> chrono::Duration {
        chrono::Duration::hours(self.max_holding_hours as i64)
    }

    pub fn history_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.history_days as i64)
    }

    /// Universe names resolved to assets, deduplicated in first-seen order.
    pub fn resolve_universe(&self, active: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut assets = Vec::new();
        for name in active {
            let Some(list) = self.universes.get(name) else {
                log::warn!("[CONFIG] unknown universe '{}' ignored", name);
                continue;
            };
            for asset in list {
                if seen.insert(asset.clone()) {
                    assets.push(asset.clone());
                }
            }
        }
        assets
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("invalid {}", key)),
        _ => Ok(None),
    }
}

fn split_assets(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// Parses `name=A,B,C;other=D,E`.
fn parse_universes(raw: &str) -> Result<BTreeMap<String, Vec<String>>> {
    let mut universes = BTreeMap::new();
    for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, assets) = entry
            .split_once('=')
            .with_context(|| format!("invalid universe entry '{}', expected name=A,B", entry))?;
        let assets = split_assets(assets);
        if assets.is_empty() {
            anyhow::bail!("universe '{}' has no assets", name.trim());
        }
        universes.insert(name.trim().to_string(), assets);
    }
    Ok(universes)
}
