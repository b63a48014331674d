use super::format::welcome_text;
use super::shared::{
    HandlerResult, handle_crypto_return, parse_start_payload, ref_source_from_payload,
};
use super::state::{BotState, is_admin_message, sender_country, sender_user_id, sender_username};
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
pub enum BotCommand {
    #[command(description = "Начать работу с ботом")]
    Start,
    #[command(description = "Справка")]
    Help,
    #[command(description = "Сводка по сервису (только для админов)")]
    Stats,
}

pub fn handler()
-> teloxide::dispatching::UpdateHandler<Box<dyn std::error::Error + Send + Sync + 'static>> {
    teloxide::filter_command::<BotCommand, _>()
        .branch(dptree::case![BotCommand::Start].endpoint(cmd_start))
        .branch(dptree::case![BotCommand::Help].endpoint(cmd_help))
        .branch(dptree::case![BotCommand::Stats].endpoint(cmd_stats))
}

async fn cmd_start(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(tg_user_id) = sender_user_id(&msg) else {
        return Ok(());
    };
    let username = sender_username(&msg);
    let country = sender_country(&msg);
    let payload = parse_start_payload(msg.text().unwrap_or(""));
    tracing::info!(tg_user_id, username = ?username, payload = ?payload, "Получен /start");

    state.clear_session(tg_user_id).await;

    // Атрибуция применяется только при создании записи; для уже
    // известного пользователя ensure_user её игнорирует.
    let (_, created) = state
        .db
        .ensure_user(
            tg_user_id,
            username.as_deref(),
            country.as_deref(),
            ref_source_from_payload(&payload),
        )
        .await?;
    if created {
        tracing::info!(tg_user_id, "Зарегистрирован новый пользователь");
    }

    if let Some(super::shared::StartPayload::CryptoPaid { rub, telegram_id }) = payload {
        // Deep-link оплаты принимаем только от самого плательщика.
        if telegram_id == tg_user_id {
            handle_crypto_return(&bot, msg.chat.id, &state, tg_user_id, rub).await?;
            return Ok(());
        }
        tracing::warn!(tg_user_id, claimed = telegram_id, "Чужой paid-deep-link отклонён");
    }

    bot.send_message(msg.chat.id, welcome_text())
        .reply_markup(crate::bot::keyboards::main_menu())
        .await?;
    Ok(())
}

async fn cmd_stats(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        bot.send_message(msg.chat.id, "Команда доступна только администраторам.")
            .await?;
        return Ok(());
    }
    let now = crate::db::current_unix_timestamp()?;
    let stats = state.db.stats(now).await?;
    bot.send_message(
        msg.chat.id,
        format!(
            "📊 Сводка:\n\
             Пользователей: {}\n\
             Активных подписок: {}\n\
             Выданных ключей: {}\n\
             Открытых тикетов: {}",
            stats.total_users, stats.active_subscriptions, stats.live_keys, stats.open_tickets
        ),
    )
    .await?;
    Ok(())
}

pub async fn cmd_help(bot: Bot, msg: Message, _state: BotState) -> HandlerResult {
    let text = "Команды:\n\
                /start — главное меню\n\
                /help — эта справка\n\n\
                Всё остальное — через кнопки меню: покупка и продление подписки,\n\
                пополнение баланса, промокоды, выбор сервера и ваши ключи.";
    bot.send_message(msg.chat.id, text)
        .reply_markup(crate::bot::keyboards::main_menu())
        .await?;
    Ok(())
}
