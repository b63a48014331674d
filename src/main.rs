//! starvpn-bot — Telegram-бот продажи VPN-подписок с выдачей ключей Outline.

mod api;
mod bot;
mod config;
mod db;
mod outline;
mod provision;
mod subscription;
mod sweep;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use teloxide::dispatching::Dispatcher;
use teloxide::prelude::*;
use tokio::sync::Mutex;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/starvpn-bot.toml"));
    tracing::info!(
        "Starting starvpn-bot with config {}",
        config_path.display()
    );

    let config = Arc::new(config::Config::load(&config_path)?);
    let token = config.bot_token()?;
    tracing::info!(
        admin_count = config.admin_ids.len(),
        db_path = %config.db_path.display(),
        tariffs = config.payments.tariffs.len(),
        star_rate_rub = config.payments.star_rate_rub,
        "Configuration loaded"
    );

    let db = Arc::new(db::Db::open(&config.db_path).await?);
    let key_api: Arc<dyn outline::KeyApi> = Arc::new(outline::OutlineApi::new()?);

    let bot = Bot::new(token);
    let bot_username = match bot.get_me().await {
        Ok(me) => me.user.username.clone(),
        Err(error) => {
            tracing::warn!(
                error = %error,
                "Не удалось получить username бота через getMe"
            );
            None
        }
    };

    tokio::spawn(sweep::run_reconciler(
        db.clone(),
        key_api.clone(),
        config.sweep.reconcile_interval_secs,
    ));
    tokio::spawn(sweep::run_broadcaster(
        bot.clone(),
        db.clone(),
        config.sweep.broadcast_interval_secs,
    ));
    tokio::spawn(sweep::run_expiry_notifier(
        bot.clone(),
        db.clone(),
        config.sweep.notify_interval_secs,
    ));

    match config.admin_api_token() {
        Some(admin_token) => {
            let api_state = Arc::new(api::ApiState {
                db: db.clone(),
                bot: bot.clone(),
                token: admin_token,
            });
            let listen_addr = config.api.listen_addr.clone();
            tokio::spawn(async move {
                if let Err(err) = api::serve(&listen_addr, api_state).await {
                    tracing::error!(error = %err, "Админ-API остановлен");
                }
            });
        }
        None => {
            tracing::warn!("Bearer-токен админ-API не задан, HTTP-сервер не запускается");
        }
    }

    let state = bot::handlers::BotState {
        config,
        db,
        key_api,
        bot_username,
        sessions: Arc::new(Mutex::new(HashMap::new())),
    };
    tracing::info!("Dispatcher initialized, bot is ready");

    Dispatcher::builder(bot, bot::handlers::schema())
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}
