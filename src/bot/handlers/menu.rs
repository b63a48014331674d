use super::format::{invite_text, subscription_status_text, usage_guide_text};
use super::shared::{HandlerResult, send_key_with_qr};
use super::state::{BotState, SessionState, sender_user_id};
use crate::db::{self, PromoRedeemError};
use teloxide::prelude::*;

pub async fn handle_menu_buttons(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Some(tg_user_id) = sender_user_id(&msg) else {
        return Ok(());
    };

    // Сначала отрабатываем ожидание ввода, если оно висит на чате.
    // Команда или кнопка меню снимают ожидание: пользователь передумал,
    // и следующий произвольный текст не должен уйти как промокод или тикет.
    if interrupts_session(text) {
        state.clear_session(tg_user_id).await;
    } else if let Some(session) = state.take_session(tg_user_id).await {
        match session {
            SessionState::AwaitingPromoCode => {
                redeem_promo_input(&bot, &msg, &state, tg_user_id, text.trim()).await?;
            }
            SessionState::AwaitingSupportQuestion => {
                create_support_ticket(&bot, &msg, &state, tg_user_id, text.trim()).await?;
            }
        }
        return Ok(());
    }

    match text {
        crate::bot::keyboards::BTN_BUY => {
            bot.send_message(msg.chat.id, "Выберите тариф:")
                .reply_markup(crate::bot::keyboards::tariff_buttons(
                    &state.config.payments.tariffs,
                ))
                .await?;
        }
        crate::bot::keyboards::BTN_TOPUP => {
            bot.send_message(msg.chat.id, "Выберите способ пополнения:")
                .reply_markup(crate::bot::keyboards::topup_method_buttons())
                .await?;
        }
        crate::bot::keyboards::BTN_PROMO => {
            state.set_session(tg_user_id, SessionState::AwaitingPromoCode).await;
            bot.send_message(msg.chat.id, "Введите промокод:").await?;
        }
        crate::bot::keyboards::BTN_STATUS => {
            show_status(&bot, &msg, &state, tg_user_id).await?;
        }
        crate::bot::keyboards::BTN_SERVER => {
            show_server_list(&bot, msg.chat.id, &state).await?;
        }
        crate::bot::keyboards::BTN_KEYS => {
            show_user_keys(&bot, &msg, &state, tg_user_id).await?;
        }
        crate::bot::keyboards::BTN_GUIDE => {
            bot.send_message(msg.chat.id, usage_guide_text())
                .reply_markup(crate::bot::keyboards::main_menu())
                .await?;
        }
        crate::bot::keyboards::BTN_INVITE => {
            show_invite(&bot, &msg, &state, tg_user_id).await?;
        }
        crate::bot::keyboards::BTN_SUPPORT => {
            state
                .set_session(tg_user_id, SessionState::AwaitingSupportQuestion)
                .await;
            bot.send_message(
                msg.chat.id,
                "Опишите проблему одним сообщением — мы ответим здесь же.",
            )
            .await?;
        }
        _ => {
            bot.send_message(msg.chat.id, "Не понял запрос. Используйте кнопки меню ниже.")
                .reply_markup(crate::bot::keyboards::main_menu())
                .await?;
        }
    }
    Ok(())
}

fn interrupts_session(text: &str) -> bool {
    text.starts_with('/') || is_menu_button(text)
}

fn is_menu_button(text: &str) -> bool {
    matches!(
        text,
        crate::bot::keyboards::BTN_BUY
            | crate::bot::keyboards::BTN_TOPUP
            | crate::bot::keyboards::BTN_PROMO
            | crate::bot::keyboards::BTN_STATUS
            | crate::bot::keyboards::BTN_SERVER
            | crate::bot::keyboards::BTN_KEYS
            | crate::bot::keyboards::BTN_GUIDE
            | crate::bot::keyboards::BTN_INVITE
            | crate::bot::keyboards::BTN_SUPPORT
    )
}

async fn redeem_promo_input(
    bot: &Bot,
    msg: &Message,
    state: &BotState,
    tg_user_id: i64,
    code: &str,
) -> HandlerResult {
    let now = db::current_unix_timestamp()?;
    match state.db.redeem_promo(tg_user_id, code, now).await {
        Ok(redeemed) => {
            tracing::info!(tg_user_id, code, days = redeemed.days, "Промокод погашен");
            bot.send_message(
                msg.chat.id,
                format!(
                    "🎁 Промокод принят! Подписка продлена на {} дн. — до {}.",
                    redeemed.days,
                    super::format::format_date(redeemed.new_end)
                ),
            )
            .reply_markup(crate::bot::keyboards::pick_server_button())
            .await?;
        }
        Err(PromoRedeemError::Db(err)) => return Err(err.into()),
        Err(err) => {
            bot.send_message(msg.chat.id, err.to_string()).await?;
        }
    }
    Ok(())
}

async fn create_support_ticket(
    bot: &Bot,
    msg: &Message,
    state: &BotState,
    tg_user_id: i64,
    question: &str,
) -> HandlerResult {
    if question.is_empty() {
        bot.send_message(msg.chat.id, "Пустое сообщение. Попробуйте ещё раз через «Помощь».")
            .await?;
        return Ok(());
    }
    let Some(user) = state.db.get_user_by_telegram(tg_user_id).await? else {
        bot.send_message(msg.chat.id, "Нажмите /start и повторите.").await?;
        return Ok(());
    };
    let ticket_id = state.db.create_ticket(user.id, question).await?;
    tracing::info!(tg_user_id, ticket_id, "Создан тикет поддержки");
    bot.send_message(
        msg.chat.id,
        format!("🆘 Обращение №{} принято. Ответ придёт в этот чат.", ticket_id),
    )
    .reply_markup(crate::bot::keyboards::main_menu())
    .await?;

    for admin_id in &state.config.admin_ids {
        if let Err(err) = bot
            .send_message(
                ChatId(*admin_id),
                format!("Новый тикет №{} от {}:\n\n{}", ticket_id, tg_user_id, question),
            )
            .await
        {
            tracing::warn!(admin_id, error = %err, "Не удалось уведомить админа о тикете");
        }
    }
    Ok(())
}

async fn show_status(bot: &Bot, msg: &Message, state: &BotState, tg_user_id: i64) -> HandlerResult {
    let Some(user) = state.db.get_user_by_telegram(tg_user_id).await? else {
        bot.send_message(msg.chat.id, "Нажмите /start и повторите.").await?;
        return Ok(());
    };
    let now = db::current_unix_timestamp()?;
    bot.send_message(msg.chat.id, subscription_status_text(&user, now))
        .reply_markup(crate::bot::keyboards::buy_after_status_buttons())
        .await?;
    Ok(())
}

pub async fn show_server_list(bot: &Bot, chat_id: ChatId, state: &BotState) -> HandlerResult {
    let servers = state.db.list_online_servers().await?;
    if servers.is_empty() {
        bot.send_message(chat_id, "Сейчас нет доступных серверов, попробуйте позже.")
            .await?;
        return Ok(());
    }
    let mut with_counts = Vec::with_capacity(servers.len());
    for server in servers {
        let live = state.db.count_keys_on_server(server.id).await?;
        with_counts.push((server, live));
    }
    bot.send_message(chat_id, "Выберите сервер:")
        .reply_markup(crate::bot::keyboards::server_buttons(&with_counts))
        .await?;
    Ok(())
}

async fn show_user_keys(
    bot: &Bot,
    msg: &Message,
    state: &BotState,
    tg_user_id: i64,
) -> HandlerResult {
    let Some(user) = state.db.get_user_by_telegram(tg_user_id).await? else {
        bot.send_message(msg.chat.id, "Нажмите /start и повторите.").await?;
        return Ok(());
    };
    let keys = state.db.list_user_keys_with_servers(user.id).await?;
    if keys.is_empty() {
        bot.send_message(
            msg.chat.id,
            "У вас пока нет ключей. Нажмите «Выбрать сервер», чтобы получить ключ.",
        )
        .await?;
        return Ok(());
    }
    for key in keys {
        let caption = format!("🌍 {} — {}", key.server_country, key.server_name);
        send_key_with_qr(bot, msg.chat.id, &key.access_url, &caption).await?;
    }
    Ok(())
}

async fn show_invite(bot: &Bot, msg: &Message, state: &BotState, tg_user_id: i64) -> HandlerResult {
    let Some(bot_username) = state.bot_username.as_deref() else {
        bot.send_message(msg.chat.id, "Реферальные ссылки временно недоступны.")
            .await?;
        return Ok(());
    };
    let Some(user) = state.db.get_user_by_telegram(tg_user_id).await? else {
        bot.send_message(msg.chat.id, "Нажмите /start и повторите.").await?;
        return Ok(());
    };
    let now = db::current_unix_timestamp()?;
    let (total, paid) = state.db.referral_stats(user.id, now).await?;
    bot.send_message(msg.chat.id, invite_text(bot_username, tg_user_id, total, paid))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn menu_buttons_and_commands_cancel_pending_input() {
        assert!(interrupts_session(crate::bot::keyboards::BTN_STATUS));
        assert!(interrupts_session(crate::bot::keyboards::BTN_PROMO));
        assert!(interrupts_session("/start"));
        assert!(interrupts_session("/help"));

        // Произвольный текст — это ввод для висящего ожидания.
        assert!(!interrupts_session("WEEK-2024"));
        assert!(!interrupts_session("не работает ключ"));
    }
}
