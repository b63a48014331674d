//! SQLite-слой: пользователи, серверы, ключи, промокоды, рефералы,
//! платежи, тикеты и рассылки.
//!
//! Все конкурентные изменения (баланс, subscription_end, счётчики
//! промокодов и рекламных ссылок) выполняются одним условным UPDATE по
//! своей строке, чтобы параллельные операции не теряли обновления.

use crate::subscription;
use rand::distr::{Alphanumeric, SampleString};
use sqlx::FromRow;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub balance: i64,
    pub subscription_end: Option<i64>,
    pub country: Option<String>,
    pub referred_by: Option<i64>,
    pub ad_ref_id: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub country: String,
    pub status: String,
    pub api_url: String,
    pub cert_sha256: String,
    pub max_keys: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct OutlineKey {
    pub id: i64,
    pub user_id: i64,
    pub server_id: i64,
    pub outline_key_id: String,
    pub access_url: String,
    pub created_at: i64,
}

/// Ключ пользователя вместе с сервером — для списка «Мои ключи».
#[derive(Debug, Clone, FromRow)]
pub struct UserKey {
    pub id: i64,
    pub access_url: String,
    pub server_name: String,
    pub server_country: String,
}

/// Ключ с контекстом владельца и сервера — вход ревизии истёкших подписок.
#[derive(Debug, Clone, FromRow)]
pub struct KeyForSweep {
    pub id: i64,
    pub outline_key_id: String,
    pub user_id: i64,
    pub server_id: i64,
    pub subscription_end: Option<i64>,
    pub api_url: String,
    pub cert_sha256: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct PromoCode {
    pub id: i64,
    pub code: String,
    pub days: i64,
    pub max_uses: Option<i64>,
    pub expires_at: Option<i64>,
    pub used_count: i64,
    pub is_active: bool,
    pub is_auto_generated: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct AdRefLink {
    pub id: i64,
    pub referrer_id: String,
    pub short_id: String,
    pub name: String,
    pub clicks: i64,
    pub registrations: i64,
    pub paid: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct SupportTicket {
    pub id: i64,
    pub user_id: i64,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub question: String,
    pub answer: Option<String>,
    pub status: String,
    pub created_at: i64,
    pub answered_at: Option<i64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct BroadcastTemplate {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct ScheduledBroadcast {
    pub id: i64,
    pub message: String,
    pub scheduled_at: i64,
    /// JSON-массив id пользователей; NULL — рассылка всем.
    pub user_ids: Option<String>,
    pub status: String,
    pub error: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct ReferrerStat {
    pub referrer_id: i64,
    pub username: Option<String>,
    pub total: i64,
    pub paid: i64,
}

#[derive(Debug, Clone)]
pub struct Stats {
    pub total_users: i64,
    pub active_subscriptions: i64,
    pub live_keys: i64,
    pub open_tickets: i64,
}

/// Откуда пришёл новый пользователь. Фиксируется один раз, при первом
/// /start, и больше никогда не переписывается.
#[derive(Debug, Clone)]
pub enum RefSource {
    User(i64),
    Ad(String),
}

#[derive(Debug)]
pub struct PromoRedeemed {
    pub days: i64,
    pub new_end: i64,
}

#[derive(Debug, Error)]
pub enum PromoRedeemError {
    #[error("Промокод не найден.")]
    NotFound,
    #[error("Промокод неактивен.")]
    Inactive,
    #[error("Срок действия промокода истёк.")]
    Expired,
    #[error("Промокод больше не действителен — лимит использований исчерпан.")]
    Exhausted,
    #[error("Вы уже использовали этот промокод.")]
    AlreadyUsed,
    #[error("Пользователь не найден. Нажмите /start.")]
    UserNotFound,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[derive(Debug)]
pub struct PurchaseOutcome {
    pub new_end: i64,
    pub new_balance: i64,
    /// referrer_id рекламной ссылки, если это первая оплаченная конверсия.
    pub first_paid_conversion: Option<String>,
}

#[derive(Debug, Error)]
pub enum PurchaseError {
    #[error("Пользователь не найден. Нажмите /start.")]
    UserNotFound,
    #[error("Недостаточно средств: не хватает {missing} ₽ (на балансе {balance} ₽).")]
    InsufficientBalance { missing: i64, balance: i64 },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

pub const SERVER_ONLINE: &str = "online";
pub const BROADCAST_PENDING: &str = "pending";
pub const BROADCAST_COMPLETED: &str = "completed";
pub const BROADCAST_FAILED: &str = "failed";
pub const TICKET_OPEN: &str = "open";
pub const TICKET_ANSWERED: &str = "answered";

pub fn current_unix_timestamp() -> Result<i64, anyhow::Error> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .map_err(|err| anyhow::anyhow!("Системное время меньше UNIX_EPOCH: {}", err))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.to_string().to_lowercase().contains("unique")
}

pub struct Db {
    pool: SqlitePool,
}

impl Db {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("Не удалось создать директорию для БД: {}", e))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts)
            .await
            .map_err(|e| anyhow::anyhow!("Не удалось подключиться к SQLite: {}", e))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// БД в памяти для тестов.
    pub async fn open_in_memory() -> Result<Self, anyhow::Error> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePool::connect_with(opts).await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                telegram_id INTEGER NOT NULL UNIQUE,
                username TEXT,
                balance INTEGER NOT NULL DEFAULT 0,
                subscription_end INTEGER,
                country TEXT,
                referred_by INTEGER,
                ad_ref_id TEXT,
                paid_conversion_reported INTEGER NOT NULL DEFAULT 0,
                expiry_notified INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_users_subscription_end ON users(subscription_end);

            CREATE TABLE IF NOT EXISTS servers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                country TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'online',
                api_url TEXT NOT NULL,
                cert_sha256 TEXT NOT NULL,
                max_keys INTEGER NOT NULL DEFAULT 100,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS outline_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                server_id INTEGER NOT NULL,
                outline_key_id TEXT NOT NULL,
                access_url TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_outline_keys_user ON outline_keys(user_id);
            CREATE INDEX IF NOT EXISTS idx_outline_keys_server ON outline_keys(server_id);

            CREATE TABLE IF NOT EXISTS promo_codes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT NOT NULL UNIQUE,
                days INTEGER NOT NULL,
                max_uses INTEGER,
                expires_at INTEGER,
                used_count INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_auto_generated INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS used_promo_codes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                promo_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(user_id, promo_id)
            );

            CREATE TABLE IF NOT EXISTS referrals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                referrer_id INTEGER NOT NULL,
                referred_id INTEGER NOT NULL UNIQUE,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_referrals_referrer ON referrals(referrer_id);

            CREATE TABLE IF NOT EXISTS ad_ref_links (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                referrer_id TEXT NOT NULL UNIQUE,
                short_id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                clicks INTEGER NOT NULL DEFAULT 0,
                registrations INTEGER NOT NULL DEFAULT 0,
                paid INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS payments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                amount INTEGER NOT NULL,
                stars INTEGER,
                invoice_payload TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'completed',
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS support_tickets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                question TEXT NOT NULL,
                answer TEXT,
                status TEXT NOT NULL DEFAULT 'open',
                created_at INTEGER NOT NULL,
                answered_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS broadcast_templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS scheduled_broadcasts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message TEXT NOT NULL,
                scheduled_at INTEGER NOT NULL,
                user_ids TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                error TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_broadcasts_status ON scheduled_broadcasts(status, scheduled_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Миграция БД: {}", e))?;

        self.ensure_column_exists("users", "paid_conversion_reported", "INTEGER NOT NULL DEFAULT 0")
            .await?;
        self.ensure_column_exists("users", "expiry_notified", "INTEGER NOT NULL DEFAULT 0")
            .await?;
        self.ensure_column_exists("promo_codes", "is_auto_generated", "INTEGER NOT NULL DEFAULT 0")
            .await?;

        Ok(())
    }

    async fn ensure_column_exists(
        &self,
        table: &str,
        column: &str,
        sql_type: &str,
    ) -> Result<(), anyhow::Error> {
        let count = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM pragma_table_info('{}') WHERE name = '{}'",
            table, column
        ))
        .fetch_one(&self.pool)
        .await?;
        if count == 0 {
            sqlx::query(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                table, column, sql_type
            ))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    // --- Пользователи ---

    /// Создаёт пользователя при первом контакте или возвращает существующего.
    pub async fn ensure_user(
        &self,
        telegram_id: i64,
        username: Option<&str>,
        country: Option<&str>,
        ref_source: Option<RefSource>,
    ) -> Result<(User, bool), anyhow::Error> {
        let now = current_unix_timestamp()?;

        if let Some(existing) = self.get_user_by_telegram(telegram_id).await? {
            if existing.country.is_none() && country.is_some() {
                sqlx::query("UPDATE users SET country = ? WHERE id = ?")
                    .bind(country)
                    .bind(existing.id)
                    .execute(&self.pool)
                    .await?;
            }
            if username.is_some() && existing.username.as_deref() != username {
                sqlx::query("UPDATE users SET username = ? WHERE id = ?")
                    .bind(username)
                    .bind(existing.id)
                    .execute(&self.pool)
                    .await?;
            }
            return Ok((existing, false));
        }

        let (referred_by, ad_ref_id) = match &ref_source {
            Some(RefSource::User(referrer_tg)) => {
                let referrer = self.get_user_by_telegram(*referrer_tg).await?;
                (referrer.map(|u| u.id), None)
            }
            // Принимаем и короткий id, и полный; храним канонический.
            Some(RefSource::Ad(id)) => {
                let link = self.get_ad_ref_link(id).await?;
                (None, link.map(|l| l.referrer_id))
            }
            None => (None, None),
        };

        sqlx::query(
            "INSERT INTO users (telegram_id, username, country, referred_by, ad_ref_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(telegram_id)
        .bind(username)
        .bind(country)
        .bind(referred_by)
        .bind(&ad_ref_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let user = self
            .get_user_by_telegram(telegram_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("только что созданный пользователь не найден"))?;

        if let Some(referrer_id) = referred_by {
            sqlx::query(
                "INSERT OR IGNORE INTO referrals (referrer_id, referred_id, created_at) VALUES (?, ?, ?)",
            )
            .bind(referrer_id)
            .bind(user.id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        }
        if let Some(ad_id) = &ad_ref_id {
            sqlx::query(
                "UPDATE ad_ref_links SET registrations = registrations + 1 WHERE referrer_id = ?",
            )
            .bind(ad_id)
            .execute(&self.pool)
            .await?;
        }

        Ok((user, true))
    }

    pub async fn get_user_by_telegram(
        &self,
        telegram_id: i64,
    ) -> Result<Option<User>, anyhow::Error> {
        let row = sqlx::query_as::<_, User>(
            "SELECT id, telegram_id, username, balance, subscription_end, country, referred_by, ad_ref_id, created_at
             FROM users WHERE telegram_id = ?",
        )
        .bind(telegram_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_users(&self) -> Result<Vec<User>, anyhow::Error> {
        let rows = sqlx::query_as::<_, User>(
            "SELECT id, telegram_id, username, balance, subscription_end, country, referred_by, ad_ref_id, created_at
             FROM users ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Ручная правка срока подписки. Сбрасывает флаг напоминания.
    pub async fn set_subscription_end(
        &self,
        user_id: i64,
        subscription_end: Option<i64>,
    ) -> Result<Option<User>, anyhow::Error> {
        let result = sqlx::query(
            "UPDATE users SET subscription_end = ?, expiry_notified = 0 WHERE id = ?",
        )
        .bind(subscription_end)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        let row = sqlx::query_as::<_, User>(
            "SELECT id, telegram_id, username, balance, subscription_end, country, referred_by, ad_ref_id, created_at
             FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Покупка подписки с баланса: списание и продление одним условным
    /// UPDATE. При первой успешной покупке пользователя с рекламной
    /// атрибуцией инкрементируется счётчик paid его ссылки.
    pub async fn purchase_subscription(
        &self,
        telegram_id: i64,
        price_rub: i64,
        days: i64,
        now: i64,
    ) -> Result<PurchaseOutcome, PurchaseError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE users
             SET balance = balance - ?,
                 subscription_end = MAX(COALESCE(subscription_end, 0), ?) + ?,
                 expiry_notified = 0
             WHERE telegram_id = ? AND balance >= ?",
        )
        .bind(price_rub)
        .bind(now)
        .bind(subscription::days_to_secs(days))
        .bind(telegram_id)
        .bind(price_rub)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let balance = sqlx::query_scalar::<_, i64>(
                "SELECT balance FROM users WHERE telegram_id = ?",
            )
            .bind(telegram_id)
            .fetch_optional(&mut *tx)
            .await?;
            return match balance {
                Some(balance) => Err(PurchaseError::InsufficientBalance {
                    missing: price_rub - balance,
                    balance,
                }),
                None => Err(PurchaseError::UserNotFound),
            };
        }

        #[derive(FromRow)]
        struct AfterPurchase {
            balance: i64,
            subscription_end: i64,
            ad_ref_id: Option<String>,
            paid_conversion_reported: bool,
        }
        let after = sqlx::query_as::<_, AfterPurchase>(
            "SELECT balance, subscription_end, ad_ref_id, paid_conversion_reported
             FROM users WHERE telegram_id = ?",
        )
        .bind(telegram_id)
        .fetch_one(&mut *tx)
        .await?;

        let mut first_paid_conversion = None;
        if let Some(ad_id) = &after.ad_ref_id {
            if !after.paid_conversion_reported {
                sqlx::query(
                    "UPDATE users SET paid_conversion_reported = 1 WHERE telegram_id = ?",
                )
                .bind(telegram_id)
                .execute(&mut *tx)
                .await?;
                sqlx::query("UPDATE ad_ref_links SET paid = paid + 1 WHERE referrer_id = ?")
                    .bind(ad_id)
                    .execute(&mut *tx)
                    .await?;
                first_paid_conversion = Some(ad_id.clone());
            }
        }

        tx.commit().await?;
        Ok(PurchaseOutcome {
            new_end: after.subscription_end,
            new_balance: after.balance,
            first_paid_conversion,
        })
    }

    /// Зачисляет подтверждённый платёж ровно один раз на invoice_payload.
    /// Возвращает новый баланс либо None, если платёж уже был обработан.
    pub async fn apply_payment(
        &self,
        telegram_id: i64,
        amount_rub: i64,
        stars: Option<i64>,
        invoice_payload: &str,
    ) -> Result<Option<i64>, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let user = self
            .get_user_by_telegram(telegram_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Платёж от незарегистрированного пользователя"))?;

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO payments (user_id, amount, stars, invoice_payload, status, created_at)
             VALUES (?, ?, ?, ?, 'completed', ?)",
        )
        .bind(user.id)
        .bind(amount_rub)
        .bind(stars)
        .bind(invoice_payload)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            // Повторная доставка того же платежа — не ошибка.
            return Ok(None);
        }

        sqlx::query("UPDATE users SET balance = balance + ? WHERE id = ?")
            .bind(amount_rub)
            .bind(user.id)
            .execute(&mut *tx)
            .await?;
        let new_balance =
            sqlx::query_scalar::<_, i64>("SELECT balance FROM users WHERE id = ?")
                .bind(user.id)
                .fetch_one(&mut *tx)
                .await?;
        tx.commit().await?;
        Ok(Some(new_balance))
    }

    /// Пользователи, чья подписка истекает в ближайшие `horizon_secs`
    /// и кому ещё не отправляли напоминание.
    pub async fn users_expiring_within(
        &self,
        now: i64,
        horizon_secs: i64,
    ) -> Result<Vec<User>, anyhow::Error> {
        let rows = sqlx::query_as::<_, User>(
            "SELECT id, telegram_id, username, balance, subscription_end, country, referred_by, ad_ref_id, created_at
             FROM users
             WHERE subscription_end > ? AND subscription_end <= ? AND expiry_notified = 0",
        )
        .bind(now)
        .bind(now + horizon_secs)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn mark_expiry_notified(&self, user_id: i64) -> Result<(), anyhow::Error> {
        sqlx::query("UPDATE users SET expiry_notified = 1 WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Серверы ---

    pub async fn list_online_servers(&self) -> Result<Vec<Server>, anyhow::Error> {
        let rows = sqlx::query_as::<_, Server>(
            "SELECT id, name, country, status, api_url, cert_sha256, max_keys, created_at
             FROM servers WHERE status = ? ORDER BY country",
        )
        .bind(SERVER_ONLINE)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_servers(&self) -> Result<Vec<Server>, anyhow::Error> {
        let rows = sqlx::query_as::<_, Server>(
            "SELECT id, name, country, status, api_url, cert_sha256, max_keys, created_at
             FROM servers ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_server(&self, id: i64) -> Result<Option<Server>, anyhow::Error> {
        let row = sqlx::query_as::<_, Server>(
            "SELECT id, name, country, status, api_url, cert_sha256, max_keys, created_at
             FROM servers WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn create_server(
        &self,
        name: &str,
        country: &str,
        status: &str,
        api_url: &str,
        cert_sha256: &str,
        max_keys: i64,
    ) -> Result<Server, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO servers (name, country, status, api_url, cert_sha256, max_keys, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(country)
        .bind(status)
        .bind(api_url)
        .bind(cert_sha256)
        .bind(max_keys)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        self.get_server(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("только что созданный сервер не найден"))
    }

    pub async fn update_server(
        &self,
        id: i64,
        name: &str,
        country: &str,
        status: &str,
        api_url: &str,
        cert_sha256: &str,
        max_keys: i64,
    ) -> Result<Option<Server>, anyhow::Error> {
        let result = sqlx::query(
            "UPDATE servers SET name = ?, country = ?, status = ?, api_url = ?, cert_sha256 = ?, max_keys = ?
             WHERE id = ?",
        )
        .bind(name)
        .bind(country)
        .bind(status)
        .bind(api_url)
        .bind(cert_sha256)
        .bind(max_keys)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_server(id).await
    }

    pub async fn delete_server(&self, id: i64) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("DELETE FROM servers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // --- Ключи ---

    pub async fn count_keys_on_server(&self, server_id: i64) -> Result<i64, anyhow::Error> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM outline_keys WHERE server_id = ?")
                .bind(server_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn list_keys_of_user(&self, user_id: i64) -> Result<Vec<OutlineKey>, anyhow::Error> {
        let rows = sqlx::query_as::<_, OutlineKey>(
            "SELECT id, user_id, server_id, outline_key_id, access_url, created_at
             FROM outline_keys WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_user_keys_with_servers(
        &self,
        user_id: i64,
    ) -> Result<Vec<UserKey>, anyhow::Error> {
        let rows = sqlx::query_as::<_, UserKey>(
            "SELECT k.id, k.access_url, s.name AS server_name, s.country AS server_country
             FROM outline_keys k
             JOIN servers s ON s.id = k.server_id
             WHERE k.user_id = ?
             ORDER BY k.created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Замена ключей пользователя: удаление старых записей и вставка новой
    /// в одной транзакции — в таблице не бывает момента, когда у
    /// пользователя больше одного живого ключа.
    pub async fn replace_user_key(
        &self,
        user_id: i64,
        server_id: i64,
        outline_key_id: &str,
        access_url: &str,
    ) -> Result<OutlineKey, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM outline_keys WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO outline_keys (user_id, server_id, outline_key_id, access_url, created_at)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(user_id)
        .bind(server_id)
        .bind(outline_key_id)
        .bind(access_url)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(OutlineKey {
            id,
            user_id,
            server_id,
            outline_key_id: outline_key_id.to_string(),
            access_url: access_url.to_string(),
            created_at: now,
        })
    }

    pub async fn delete_key(&self, key_id: i64) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("DELETE FROM outline_keys WHERE id = ?")
            .bind(key_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_keys(&self) -> Result<Vec<OutlineKey>, anyhow::Error> {
        let rows = sqlx::query_as::<_, OutlineKey>(
            "SELECT id, user_id, server_id, outline_key_id, access_url, created_at
             FROM outline_keys ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_keys_for_sweep(&self) -> Result<Vec<KeyForSweep>, anyhow::Error> {
        let rows = sqlx::query_as::<_, KeyForSweep>(
            "SELECT k.id, k.outline_key_id, k.user_id, k.server_id,
                    u.subscription_end, s.api_url, s.cert_sha256
             FROM outline_keys k
             JOIN users u ON u.id = k.user_id
             JOIN servers s ON s.id = k.server_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // --- Промокоды ---

    /// Погашение промокода. Все четыре эффекта (инкремент счётчика,
    /// авто-деактивация на потолке, запись о погашении, продление подписки)
    /// выполняются в одной транзакции; частичное применение невозможно.
    pub async fn redeem_promo(
        &self,
        telegram_id: i64,
        code: &str,
        now: i64,
    ) -> Result<PromoRedeemed, PromoRedeemError> {
        let mut tx = self.pool.begin().await?;

        let user_id =
            sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE telegram_id = ?")
                .bind(telegram_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(PromoRedeemError::UserNotFound)?;

        let promo = sqlx::query_as::<_, PromoCode>(
            "SELECT id, code, days, max_uses, expires_at, used_count, is_active, is_auto_generated, created_at
             FROM promo_codes WHERE code = ?",
        )
        .bind(code)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(promo) = promo else {
            return Err(PromoRedeemError::NotFound);
        };

        let updated = sqlx::query(
            "UPDATE promo_codes
             SET used_count = used_count + 1,
                 is_active = CASE
                     WHEN max_uses IS NOT NULL AND used_count + 1 >= max_uses THEN 0
                     ELSE is_active
                 END
             WHERE id = ?
               AND is_active = 1
               AND (expires_at IS NULL OR expires_at > ?)
               AND (max_uses IS NULL OR used_count < max_uses)",
        )
        .bind(promo.id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            // Порядок проверок фиксирован: активность, срок, лимит.
            if !promo.is_active {
                return Err(PromoRedeemError::Inactive);
            }
            if promo.expires_at.is_some_and(|at| at <= now) {
                return Err(PromoRedeemError::Expired);
            }
            if promo.max_uses.is_some_and(|max| promo.used_count >= max) {
                return Err(PromoRedeemError::Exhausted);
            }
            return Err(PromoRedeemError::NotFound);
        }

        let inserted = sqlx::query(
            "INSERT INTO used_promo_codes (user_id, promo_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(promo.id)
        .bind(now)
        .execute(&mut *tx)
        .await;
        if let Err(err) = inserted {
            // Откат транзакции вернёт и счётчик использований.
            if is_unique_violation(&err) {
                return Err(PromoRedeemError::AlreadyUsed);
            }
            return Err(PromoRedeemError::Db(err));
        }

        sqlx::query(
            "UPDATE users
             SET subscription_end = MAX(COALESCE(subscription_end, 0), ?) + ?,
                 expiry_notified = 0
             WHERE id = ?",
        )
        .bind(now)
        .bind(subscription::days_to_secs(promo.days))
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        let new_end = sqlx::query_scalar::<_, i64>(
            "SELECT subscription_end FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(PromoRedeemed {
            days: promo.days,
            new_end,
        })
    }

    pub async fn create_promo(
        &self,
        code: &str,
        days: i64,
        max_uses: Option<i64>,
        expires_at: Option<i64>,
    ) -> Result<PromoCode, anyhow::Error> {
        let now = current_unix_timestamp()?;
        sqlx::query(
            "INSERT INTO promo_codes (code, days, max_uses, expires_at, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(code)
        .bind(days)
        .bind(max_uses)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Не удалось создать промокод: {}", e))?;
        self.get_promo_by_code(code)
            .await?
            .ok_or_else(|| anyhow::anyhow!("только что созданный промокод не найден"))
    }

    /// Одноразовый бонусный промокод за пополнение через CryptoBot.
    pub async fn create_bonus_promo(
        &self,
        telegram_id: i64,
        days: i64,
    ) -> Result<PromoCode, anyhow::Error> {
        let now = current_unix_timestamp()?;
        for _ in 0..8 {
            let suffix = Alphanumeric.sample_string(&mut rand::rng(), 6).to_uppercase();
            let code = format!("BONUS-{}-{}", telegram_id, suffix);
            let result = sqlx::query(
                "INSERT INTO promo_codes (code, days, max_uses, is_auto_generated, created_at)
                 VALUES (?, ?, 1, 1, ?)",
            )
            .bind(&code)
            .bind(days)
            .bind(now)
            .execute(&self.pool)
            .await;
            match result {
                Ok(_) => {
                    if let Some(promo) = self.get_promo_by_code(&code).await? {
                        return Ok(promo);
                    }
                }
                Err(err) if is_unique_violation(&err) => continue,
                Err(err) => {
                    return Err(anyhow::anyhow!("Не удалось создать бонусный промокод: {}", err));
                }
            }
        }
        Err(anyhow::anyhow!("Не удалось сгенерировать уникальный бонусный код"))
    }

    pub async fn get_promo_by_code(&self, code: &str) -> Result<Option<PromoCode>, anyhow::Error> {
        let row = sqlx::query_as::<_, PromoCode>(
            "SELECT id, code, days, max_uses, expires_at, used_count, is_active, is_auto_generated, created_at
             FROM promo_codes WHERE code = ?",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_promos(&self) -> Result<Vec<PromoCode>, anyhow::Error> {
        let rows = sqlx::query_as::<_, PromoCode>(
            "SELECT id, code, days, max_uses, expires_at, used_count, is_active, is_auto_generated, created_at
             FROM promo_codes ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn set_promo_active(&self, id: i64, is_active: bool) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("UPDATE promo_codes SET is_active = ? WHERE id = ?")
            .bind(is_active)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_promo(&self, id: i64) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("DELETE FROM promo_codes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // --- Рефералы и рекламные ссылки ---

    pub async fn referral_stats(&self, user_id: i64, now: i64) -> Result<(i64, i64), anyhow::Error> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM referrals WHERE referrer_id = ?",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        let paid = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM referrals r
             JOIN users u ON u.id = r.referred_id
             WHERE r.referrer_id = ? AND u.subscription_end > ?",
        )
        .bind(user_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok((total, paid))
    }

    pub async fn top_referrers(
        &self,
        now: i64,
        limit: i64,
    ) -> Result<Vec<ReferrerStat>, anyhow::Error> {
        let rows = sqlx::query_as::<_, ReferrerStat>(
            "SELECT r.referrer_id, ru.username,
                    COUNT(*) AS total,
                    SUM(CASE WHEN u.subscription_end > ? THEN 1 ELSE 0 END) AS paid
             FROM referrals r
             JOIN users u ON u.id = r.referred_id
             LEFT JOIN users ru ON ru.id = r.referrer_id
             GROUP BY r.referrer_id
             ORDER BY total DESC
             LIMIT ?",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn referred_users(&self, referrer_id: i64) -> Result<Vec<User>, anyhow::Error> {
        let rows = sqlx::query_as::<_, User>(
            "SELECT u.id, u.telegram_id, u.username, u.balance, u.subscription_end, u.country, u.referred_by, u.ad_ref_id, u.created_at
             FROM referrals r
             JOIN users u ON u.id = r.referred_id
             WHERE r.referrer_id = ?",
        )
        .bind(referrer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn create_ad_ref_link(&self, name: &str) -> Result<AdRefLink, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let referrer_id = format!("ad-{}", uuid::Uuid::new_v4());
        let short_id = Alphanumeric.sample_string(&mut rand::rng(), 8);
        sqlx::query(
            "INSERT INTO ad_ref_links (referrer_id, short_id, name, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&referrer_id)
        .bind(&short_id)
        .bind(name)
        .bind(now)
        .execute(&self.pool)
        .await?;
        let row = sqlx::query_as::<_, AdRefLink>(
            "SELECT id, referrer_id, short_id, name, clicks, registrations, paid, created_at
             FROM ad_ref_links WHERE referrer_id = ?",
        )
        .bind(&referrer_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_ad_ref_links(&self) -> Result<Vec<AdRefLink>, anyhow::Error> {
        let rows = sqlx::query_as::<_, AdRefLink>(
            "SELECT id, referrer_id, short_id, name, clicks, registrations, paid, created_at
             FROM ad_ref_links ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn delete_ad_ref_link(&self, id: i64) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("DELETE FROM ad_ref_links WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Клик по рекламной ссылке: счётчик растёт независимо от того,
    /// дойдёт ли посетитель до регистрации.
    pub async fn increment_ad_click(&self, id: &str) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            "UPDATE ad_ref_links SET clicks = clicks + 1 WHERE short_id = ? OR referrer_id = ?",
        )
        .bind(id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_ad_ref_link(&self, id: &str) -> Result<Option<AdRefLink>, anyhow::Error> {
        let row = sqlx::query_as::<_, AdRefLink>(
            "SELECT id, referrer_id, short_id, name, clicks, registrations, paid, created_at
             FROM ad_ref_links WHERE referrer_id = ? OR short_id = ?",
        )
        .bind(id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // --- Тикеты поддержки ---

    pub async fn create_ticket(&self, user_id: i64, question: &str) -> Result<i64, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO support_tickets (user_id, question, status, created_at)
             VALUES (?, ?, 'open', ?) RETURNING id",
        )
        .bind(user_id)
        .bind(question)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn list_tickets(&self) -> Result<Vec<SupportTicket>, anyhow::Error> {
        let rows = sqlx::query_as::<_, SupportTicket>(
            "SELECT t.id, t.user_id, u.telegram_id, u.username, t.question, t.answer, t.status, t.created_at, t.answered_at
             FROM support_tickets t
             JOIN users u ON u.id = t.user_id
             ORDER BY t.created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Сохраняет ответ и возвращает (telegram_id, вопрос) для доставки
    /// ответа через бота.
    pub async fn answer_ticket(
        &self,
        ticket_id: i64,
        answer: &str,
    ) -> Result<Option<(i64, String)>, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let target = sqlx::query_as::<_, (i64, String)>(
            "SELECT u.telegram_id, t.question
             FROM support_tickets t
             JOIN users u ON u.id = t.user_id
             WHERE t.id = ?",
        )
        .bind(ticket_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(target) = target else {
            return Ok(None);
        };
        sqlx::query(
            "UPDATE support_tickets SET status = ?, answer = ?, answered_at = ? WHERE id = ?",
        )
        .bind(TICKET_ANSWERED)
        .bind(answer)
        .bind(now)
        .bind(ticket_id)
        .execute(&self.pool)
        .await?;
        Ok(Some(target))
    }

    pub async fn delete_ticket(&self, id: i64) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("DELETE FROM support_tickets WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // --- Шаблоны и отложенные рассылки ---

    pub async fn list_templates(&self) -> Result<Vec<BroadcastTemplate>, anyhow::Error> {
        let rows = sqlx::query_as::<_, BroadcastTemplate>(
            "SELECT id, title, content, created_at FROM broadcast_templates ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn create_template(
        &self,
        title: &str,
        content: &str,
    ) -> Result<BroadcastTemplate, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO broadcast_templates (title, content, created_at) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(title)
        .bind(content)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(BroadcastTemplate {
            id,
            title: title.to_string(),
            content: content.to_string(),
            created_at: now,
        })
    }

    pub async fn delete_template(&self, id: i64) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("DELETE FROM broadcast_templates WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn create_scheduled_broadcast(
        &self,
        message: &str,
        scheduled_at: i64,
        user_ids: Option<&[i64]>,
    ) -> Result<ScheduledBroadcast, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let user_ids_json = user_ids
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| anyhow::anyhow!("Не удалось сериализовать список получателей: {}", e))?;
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO scheduled_broadcasts (message, scheduled_at, user_ids, status, created_at)
             VALUES (?, ?, ?, 'pending', ?) RETURNING id",
        )
        .bind(message)
        .bind(scheduled_at)
        .bind(&user_ids_json)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(ScheduledBroadcast {
            id,
            message: message.to_string(),
            scheduled_at,
            user_ids: user_ids_json,
            status: BROADCAST_PENDING.to_string(),
            error: None,
            created_at: now,
        })
    }

    pub async fn list_scheduled_broadcasts(
        &self,
    ) -> Result<Vec<ScheduledBroadcast>, anyhow::Error> {
        let rows = sqlx::query_as::<_, ScheduledBroadcast>(
            "SELECT id, message, scheduled_at, user_ids, status, error, created_at
             FROM scheduled_broadcasts ORDER BY scheduled_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn delete_scheduled_broadcast(&self, id: i64) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("DELETE FROM scheduled_broadcasts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// pending-рассылки, чьё время уже наступило.
    pub async fn due_broadcasts(&self, now: i64) -> Result<Vec<ScheduledBroadcast>, anyhow::Error> {
        let rows = sqlx::query_as::<_, ScheduledBroadcast>(
            "SELECT id, message, scheduled_at, user_ids, status, error, created_at
             FROM scheduled_broadcasts
             WHERE status = ? AND scheduled_at <= ?
             ORDER BY scheduled_at",
        )
        .bind(BROADCAST_PENDING)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Перевод рассылки в терминальный статус. Срабатывает только из
    /// pending, поэтому повторный диспатч той же рассылки невозможен.
    pub async fn finish_broadcast(
        &self,
        id: i64,
        status: &str,
        error: Option<&str>,
    ) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            "UPDATE scheduled_broadcasts SET status = ?, error = ? WHERE id = ? AND status = ?",
        )
        .bind(status)
        .bind(error)
        .bind(id)
        .bind(BROADCAST_PENDING)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// telegram_id получателей: явный список id пользователей или все.
    pub async fn broadcast_recipients(
        &self,
        user_ids: Option<&str>,
    ) -> Result<Vec<i64>, anyhow::Error> {
        match user_ids {
            None => {
                let rows = sqlx::query_scalar::<_, i64>("SELECT telegram_id FROM users")
                    .fetch_all(&self.pool)
                    .await?;
                Ok(rows)
            }
            Some(json) => {
                let ids: Vec<i64> = serde_json::from_str(json)
                    .map_err(|e| anyhow::anyhow!("Некорректный список получателей: {}", e))?;
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    let tg = sqlx::query_scalar::<_, i64>(
                        "SELECT telegram_id FROM users WHERE id = ?",
                    )
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
                    if let Some(tg) = tg {
                        out.push(tg);
                    }
                }
                Ok(out)
            }
        }
    }

    // --- Статистика ---

    pub async fn stats(&self, now: i64) -> Result<Stats, anyhow::Error> {
        let total_users = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        let active_subscriptions = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM users WHERE subscription_end > ?",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        let live_keys = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM outline_keys")
            .fetch_one(&self.pool)
            .await?;
        let open_tickets = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM support_tickets WHERE status = ?",
        )
        .bind(TICKET_OPEN)
        .fetch_one(&self.pool)
        .await?;
        Ok(Stats {
            total_users,
            active_subscriptions,
            live_keys,
            open_tickets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::days_to_secs;

    const NOW: i64 = 1_700_000_000;

    async fn test_db() -> Db {
        Db::open_in_memory().await.unwrap()
    }

    async fn add_user(db: &Db, telegram_id: i64) -> User {
        let (user, created) = db
            .ensure_user(telegram_id, Some("tester"), Some("RU"), None)
            .await
            .unwrap();
        assert!(created);
        user
    }

    #[tokio::test]
    async fn promo_extends_expired_subscription_from_now() {
        let db = test_db().await;
        let user = add_user(&db, 1).await;
        db.set_subscription_end(user.id, Some(NOW - days_to_secs(1)))
            .await
            .unwrap();
        db.create_promo("WEEK", 7, None, None).await.unwrap();

        let redeemed = db.redeem_promo(1, "WEEK", NOW).await.unwrap();
        assert_eq!(redeemed.new_end, NOW + days_to_secs(7));
    }

    #[tokio::test]
    async fn promo_stacks_on_active_subscription() {
        let db = test_db().await;
        let user = add_user(&db, 1).await;
        let current = NOW + days_to_secs(10);
        db.set_subscription_end(user.id, Some(current)).await.unwrap();
        db.create_promo("WEEK", 7, None, None).await.unwrap();

        let redeemed = db.redeem_promo(1, "WEEK", NOW).await.unwrap();
        assert_eq!(redeemed.new_end, current + days_to_secs(7));
    }

    #[tokio::test]
    async fn promo_single_use_ceiling_and_auto_deactivation() {
        let db = test_db().await;
        add_user(&db, 1).await;
        add_user(&db, 2).await;
        db.create_promo("ONCE", 3, Some(1), None).await.unwrap();

        db.redeem_promo(1, "ONCE", NOW).await.unwrap();
        let promo = db.get_promo_by_code("ONCE").await.unwrap().unwrap();
        assert_eq!(promo.used_count, 1);
        assert!(!promo.is_active);

        let err = db.redeem_promo(2, "ONCE", NOW).await.unwrap_err();
        assert!(matches!(err, PromoRedeemError::Inactive));
    }

    #[tokio::test]
    async fn promo_duplicate_redemption_fails_without_side_effects() {
        let db = test_db().await;
        let user = add_user(&db, 1).await;
        db.create_promo("TWICE", 3, Some(10), None).await.unwrap();

        let first = db.redeem_promo(1, "TWICE", NOW).await.unwrap();
        let err = db.redeem_promo(1, "TWICE", NOW).await.unwrap_err();
        assert!(matches!(err, PromoRedeemError::AlreadyUsed));

        // Счётчик не вырос, подписка не продлилась второй раз.
        let promo = db.get_promo_by_code("TWICE").await.unwrap().unwrap();
        assert_eq!(promo.used_count, 1);
        let user = db.get_user_by_telegram(user.telegram_id).await.unwrap().unwrap();
        assert_eq!(user.subscription_end, Some(first.new_end));
    }

    #[tokio::test]
    async fn promo_errors_are_distinct() {
        let db = test_db().await;
        add_user(&db, 1).await;

        let err = db.redeem_promo(1, "NOPE", NOW).await.unwrap_err();
        assert!(matches!(err, PromoRedeemError::NotFound));

        db.create_promo("OLD", 3, None, Some(NOW - 1)).await.unwrap();
        let err = db.redeem_promo(1, "OLD", NOW).await.unwrap_err();
        assert!(matches!(err, PromoRedeemError::Expired));

        let promo = db.create_promo("OFF", 3, None, None).await.unwrap();
        db.set_promo_active(promo.id, false).await.unwrap();
        let err = db.redeem_promo(1, "OFF", NOW).await.unwrap_err();
        assert!(matches!(err, PromoRedeemError::Inactive));
    }

    #[tokio::test]
    async fn promo_redemption_surfaces_db_failure_not_user_not_found() {
        let db = test_db().await;
        add_user(&db, 1).await;
        db.create_promo("WEEK", 7, None, None).await.unwrap();

        // Недоступная БД — инфраструктурная ошибка, а не валидационная.
        db.pool.close().await;
        let err = db.redeem_promo(1, "WEEK", NOW).await.unwrap_err();
        assert!(matches!(err, PromoRedeemError::Db(_)));
    }

    #[tokio::test]
    async fn purchase_debits_and_stacks() {
        let db = test_db().await;
        let user = add_user(&db, 1).await;
        db.apply_payment(1, 500, None, "pay-1").await.unwrap();
        let current = NOW + days_to_secs(10);
        db.set_subscription_end(user.id, Some(current)).await.unwrap();

        let outcome = db.purchase_subscription(1, 180, 30, NOW).await.unwrap();
        assert_eq!(outcome.new_balance, 320);
        assert_eq!(outcome.new_end, current + days_to_secs(30));
    }

    #[tokio::test]
    async fn purchase_reports_shortfall() {
        let db = test_db().await;
        add_user(&db, 1).await;
        db.apply_payment(1, 100, None, "pay-1").await.unwrap();

        let err = db.purchase_subscription(1, 180, 30, NOW).await.unwrap_err();
        match err {
            PurchaseError::InsufficientBalance { missing, balance } => {
                assert_eq!(missing, 80);
                assert_eq!(balance, 100);
            }
            other => panic!("ожидали InsufficientBalance, получили {:?}", other),
        }
    }

    #[tokio::test]
    async fn payment_is_idempotent_per_payload() {
        let db = test_db().await;
        add_user(&db, 1).await;

        let first = db.apply_payment(1, 180, Some(100), "stars-xyz").await.unwrap();
        assert_eq!(first, Some(180));
        let second = db.apply_payment(1, 180, Some(100), "stars-xyz").await.unwrap();
        assert_eq!(second, None);

        let user = db.get_user_by_telegram(1).await.unwrap().unwrap();
        assert_eq!(user.balance, 180);
    }

    #[tokio::test]
    async fn attribution_is_fixed_at_first_contact() {
        let db = test_db().await;
        let referrer = add_user(&db, 10).await;

        let (referred, created) = db
            .ensure_user(20, None, None, Some(RefSource::User(10)))
            .await
            .unwrap();
        assert!(created);
        assert_eq!(referred.referred_by, Some(referrer.id));

        // Повторный /start с другой ссылкой ничего не меняет.
        let (again, created) = db
            .ensure_user(20, None, None, Some(RefSource::Ad("ad-zzz".into())))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(again.referred_by, Some(referrer.id));
        assert_eq!(again.ad_ref_id, None);

        let (total, paid) = db.referral_stats(referrer.id, NOW).await.unwrap();
        assert_eq!((total, paid), (1, 0));
    }

    #[tokio::test]
    async fn ad_link_counters_only_grow() {
        let db = test_db().await;
        let link = db.create_ad_ref_link("весна").await.unwrap();

        assert!(db.increment_ad_click(&link.short_id).await.unwrap());
        assert!(db.increment_ad_click(&link.short_id).await.unwrap());
        assert!(!db.increment_ad_click("missing").await.unwrap());

        db.ensure_user(30, None, None, Some(RefSource::Ad(link.referrer_id.clone())))
            .await
            .unwrap();
        db.apply_payment(30, 500, None, "pay-30").await.unwrap();
        let outcome = db.purchase_subscription(30, 180, 30, NOW).await.unwrap();
        assert_eq!(outcome.first_paid_conversion, Some(link.referrer_id.clone()));

        // Вторая покупка того же пользователя paid уже не увеличивает.
        let outcome = db.purchase_subscription(30, 180, 30, NOW).await.unwrap();
        assert_eq!(outcome.first_paid_conversion, None);

        let links = db.list_ad_ref_links().await.unwrap();
        assert_eq!(links[0].clicks, 2);
        assert_eq!(links[0].registrations, 1);
        assert_eq!(links[0].paid, 1);
    }

    #[tokio::test]
    async fn top_referrers_counts_paid_subset() {
        let db = test_db().await;
        let referrer = add_user(&db, 10).await;
        db.ensure_user(21, None, None, Some(RefSource::User(10))).await.unwrap();
        let (active, _) = db
            .ensure_user(22, None, None, Some(RefSource::User(10)))
            .await
            .unwrap();
        db.set_subscription_end(active.id, Some(NOW + days_to_secs(5)))
            .await
            .unwrap();

        let top = db.top_referrers(NOW, 10).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].referrer_id, referrer.id);
        assert_eq!(top[0].total, 2);
        assert_eq!(top[0].paid, 1);
    }

    #[tokio::test]
    async fn replace_user_key_keeps_single_live_key() {
        let db = test_db().await;
        let user = add_user(&db, 1).await;
        let server = db
            .create_server("nl-1", "NL", "online", "https://x", "ab", 10)
            .await
            .unwrap();

        db.replace_user_key(user.id, server.id, "k1", "ss://one").await.unwrap();
        db.replace_user_key(user.id, server.id, "k2", "ss://two").await.unwrap();

        let keys = db.list_keys_of_user(user.id).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].outline_key_id, "k2");
        assert_eq!(db.count_keys_on_server(server.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn broadcast_finishes_only_once() {
        let db = test_db().await;
        let b = db
            .create_scheduled_broadcast("привет", NOW - 60, None)
            .await
            .unwrap();

        let due = db.due_broadcasts(NOW).await.unwrap();
        assert_eq!(due.len(), 1);

        assert!(db.finish_broadcast(b.id, BROADCAST_COMPLETED, None).await.unwrap());
        assert!(!db.finish_broadcast(b.id, BROADCAST_FAILED, Some("x")).await.unwrap());
        assert!(db.due_broadcasts(NOW).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expiring_users_are_notified_once() {
        let db = test_db().await;
        let user = add_user(&db, 1).await;
        db.set_subscription_end(user.id, Some(NOW + 3600)).await.unwrap();

        let expiring = db.users_expiring_within(NOW, days_to_secs(1)).await.unwrap();
        assert_eq!(expiring.len(), 1);
        db.mark_expiry_notified(user.id).await.unwrap();
        assert!(db.users_expiring_within(NOW, days_to_secs(1)).await.unwrap().is_empty());
    }
}
