//! Конфигурация бота: TOML-файл, токены можно брать из переменных окружения.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
pub struct Config {
    /// Токен бота прямо в конфиге (удобно для dev-окружения).
    pub bot_token: Option<String>,
    /// Имя переменной окружения с токеном, если bot_token не задан.
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,
    #[serde(default)]
    pub admin_ids: Vec<i64>,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub payments: PaymentsConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
}

#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Bearer-токен админ-API. Если не задан ни здесь, ни в окружении,
    /// HTTP-сервер не поднимается.
    pub admin_token: Option<String>,
    #[serde(default = "default_admin_token_env")]
    pub admin_token_env: String,
}

#[derive(Debug, Deserialize)]
pub struct PaymentsConfig {
    /// Курс: сколько рублей зачисляется за одну звезду.
    #[serde(default = "default_star_rate")]
    pub star_rate_rub: i64,
    #[serde(default = "default_tariffs")]
    pub tariffs: Vec<Tariff>,
    #[serde(default = "default_stars_packs")]
    pub stars_packs: Vec<StarsPack>,
    #[serde(default)]
    pub cryptobot: CryptoBotConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tariff {
    pub days: i64,
    pub price_rub: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StarsPack {
    pub stars: i64,
    pub rub: i64,
}

#[derive(Debug, Deserialize)]
pub struct CryptoBotConfig {
    pub token: Option<String>,
    #[serde(default = "default_cryptobot_token_env")]
    pub token_env: String,
    #[serde(default = "default_cryptobot_asset")]
    pub asset: String,
    #[serde(default = "default_cryptobot_network")]
    pub network: String,
    #[serde(default = "default_cryptobot_amounts")]
    pub amounts: Vec<CryptoAmount>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CryptoAmount {
    pub rub: i64,
    pub usdt: f64,
    pub bonus_days: i64,
}

#[derive(Debug, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_secs: u64,
    #[serde(default = "default_notify_interval")]
    pub notify_interval_secs: u64,
}

fn default_bot_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/starvpn-bot/bot.db")
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_admin_token_env() -> String {
    "ADMIN_TOKEN".to_string()
}

fn default_star_rate() -> i64 {
    2
}

fn default_tariffs() -> Vec<Tariff> {
    vec![
        Tariff {
            days: 30,
            price_rub: 180,
        },
        Tariff {
            days: 90,
            price_rub: 450,
        },
        Tariff {
            days: 180,
            price_rub: 850,
        },
    ]
}

fn default_stars_packs() -> Vec<StarsPack> {
    vec![
        StarsPack {
            stars: 100,
            rub: 180,
        },
        StarsPack {
            stars: 250,
            rub: 450,
        },
        StarsPack {
            stars: 750,
            rub: 850,
        },
    ]
}

fn default_cryptobot_token_env() -> String {
    "CRYPTO_BOT_TOKEN".to_string()
}

fn default_cryptobot_asset() -> String {
    "USDT".to_string()
}

fn default_cryptobot_network() -> String {
    "TRC20".to_string()
}

fn default_cryptobot_amounts() -> Vec<CryptoAmount> {
    vec![
        CryptoAmount {
            rub: 180,
            usdt: 2.4,
            bonus_days: 7,
        },
        CryptoAmount {
            rub: 450,
            usdt: 5.7,
            bonus_days: 15,
        },
        CryptoAmount {
            rub: 850,
            usdt: 11.0,
            bonus_days: 30,
        },
    ]
}

fn default_reconcile_interval() -> u64 {
    300
}

fn default_broadcast_interval() -> u64 {
    60
}

fn default_notify_interval() -> u64 {
    6 * 3600
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_token: None,
            admin_token_env: default_admin_token_env(),
        }
    }
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            star_rate_rub: default_star_rate(),
            tariffs: default_tariffs(),
            stars_packs: default_stars_packs(),
            cryptobot: CryptoBotConfig::default(),
        }
    }
}

impl Default for CryptoBotConfig {
    fn default() -> Self {
        Self {
            token: None,
            token_env: default_cryptobot_token_env(),
            asset: default_cryptobot_asset(),
            network: default_cryptobot_network(),
            amounts: default_cryptobot_amounts(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval(),
            broadcast_interval_secs: default_broadcast_interval(),
            notify_interval_secs: default_notify_interval(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Не удалось прочитать конфиг {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("Не удалось разобрать конфиг {}", path.display()))?;
        Ok(config)
    }

    pub fn bot_token(&self) -> Result<String, anyhow::Error> {
        if let Some(token) = &self.bot_token {
            return Ok(token.clone());
        }
        std::env::var(&self.bot_token_env).with_context(|| {
            format!(
                "Токен бота не задан: ни bot_token в конфиге, ни ${}",
                self.bot_token_env
            )
        })
    }

    pub fn admin_api_token(&self) -> Option<String> {
        self.api
            .admin_token
            .clone()
            .or_else(|| std::env::var(&self.api.admin_token_env).ok())
    }

    pub fn cryptobot_token(&self) -> Option<String> {
        self.payments
            .cryptobot
            .token
            .clone()
            .or_else(|| std::env::var(&self.payments.cryptobot.token_env).ok())
    }

    pub fn is_admin(&self, tg_user_id: i64) -> bool {
        self.admin_ids.contains(&tg_user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            bot_token = "123:abc"
            admin_ids = [42]
            "#,
        )
        .unwrap();
        assert!(config.is_admin(42));
        assert!(!config.is_admin(7));
        assert_eq!(config.payments.star_rate_rub, 2);
        assert_eq!(config.payments.tariffs.len(), 3);
        assert_eq!(config.sweep.reconcile_interval_secs, 300);
        assert_eq!(config.bot_token().unwrap(), "123:abc");
    }

    #[test]
    fn star_rate_is_overridable() {
        let config: Config = toml::from_str(
            r#"
            [payments]
            star_rate_rub = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.payments.star_rate_rub, 3);
    }
}
