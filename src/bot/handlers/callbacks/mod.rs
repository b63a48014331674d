use super::menu::show_server_list;
use super::shared::{
    HandlerResult, create_crypto_invoice, provision_and_deliver, purchase_success_text,
};
use super::state::BotState;
use crate::db::{self, PurchaseError};
use teloxide::prelude::*;
use teloxide::types::LabeledPrice;

/// Все callback-данные бота. Закрытый набор: строка либо разбирается в
/// один из вариантов, либо callback игнорируется.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackIntent {
    Buy,
    PickServer,
    Tariff { days: i64, price_rub: i64 },
    Server { server_id: i64 },
    TopUpStars,
    TopUpCrypto,
    StarsPack { stars: i64, rub: i64 },
    CryptoAmount { rub: i64 },
}

impl CallbackIntent {
    pub fn parse(data: &str) -> Option<Self> {
        let mut parts = data.split(':');
        let head = parts.next()?;
        let intent = match head {
            "buy" => Self::Buy,
            "pick_server" => Self::PickServer,
            "tariff" => Self::Tariff {
                days: parts.next()?.parse().ok()?,
                price_rub: parts.next()?.parse().ok()?,
            },
            "server" => Self::Server {
                server_id: parts.next()?.parse().ok()?,
            },
            "topup" => match parts.next()? {
                "stars" => Self::TopUpStars,
                "crypto" => Self::TopUpCrypto,
                _ => return None,
            },
            "stars" => Self::StarsPack {
                stars: parts.next()?.parse().ok()?,
                rub: parts.next()?.parse().ok()?,
            },
            "crypto" => Self::CryptoAmount {
                rub: parts.next()?.parse().ok()?,
            },
            _ => return None,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(intent)
    }
}

pub fn handler()
-> teloxide::dispatching::UpdateHandler<Box<dyn std::error::Error + Send + Sync + 'static>> {
    Update::filter_callback_query()
        .filter_map(|q: CallbackQuery| q.data.as_deref().and_then(CallbackIntent::parse))
        .endpoint(handle_callback)
}

async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    intent: CallbackIntent,
    state: BotState,
) -> HandlerResult {
    let tg_user_id = q.from.id.0 as i64;
    let Some(chat_id) = q.message.as_ref().map(|m| m.chat().id) else {
        bot.answer_callback_query(q.id.clone()).await?;
        return Ok(());
    };
    bot.answer_callback_query(q.id.clone()).await?;

    match intent {
        CallbackIntent::Buy => {
            bot.send_message(chat_id, "Выберите тариф:")
                .reply_markup(crate::bot::keyboards::tariff_buttons(
                    &state.config.payments.tariffs,
                ))
                .await?;
        }
        CallbackIntent::PickServer => {
            show_server_list(&bot, chat_id, &state).await?;
        }
        CallbackIntent::Tariff { days, price_rub } => {
            buy_tariff(&bot, chat_id, &state, tg_user_id, days, price_rub).await?;
        }
        CallbackIntent::Server { server_id } => {
            provision_and_deliver(&bot, chat_id, &state, tg_user_id, server_id).await?;
        }
        CallbackIntent::TopUpStars => {
            bot.send_message(chat_id, "Выберите пакет звёзд:")
                .reply_markup(crate::bot::keyboards::stars_pack_buttons(
                    &state.config.payments.stars_packs,
                ))
                .await?;
        }
        CallbackIntent::TopUpCrypto => {
            if state.config.cryptobot_token().is_none() {
                bot.send_message(chat_id, "Оплата через CryptoBot временно недоступна.")
                    .await?;
                return Ok(());
            }
            bot.send_message(chat_id, "Выберите сумму:")
                .reply_markup(crate::bot::keyboards::crypto_amount_buttons(
                    &state.config.payments.cryptobot.amounts,
                ))
                .await?;
        }
        CallbackIntent::StarsPack { stars, rub } => {
            send_stars_invoice(&bot, chat_id, &state, stars, rub).await?;
        }
        CallbackIntent::CryptoAmount { rub } => {
            send_crypto_invoice(&bot, chat_id, &state, tg_user_id, rub).await?;
        }
    }
    Ok(())
}

async fn buy_tariff(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    tg_user_id: i64,
    days: i64,
    price_rub: i64,
) -> HandlerResult {
    // Защита от подделанных callback-данных: тариф обязан существовать
    // в конфигурации ровно с этой ценой.
    let known = state
        .config
        .payments
        .tariffs
        .iter()
        .any(|t| t.days == days && t.price_rub == price_rub);
    if !known {
        tracing::warn!(tg_user_id, days, price_rub, "Неизвестный тариф в callback");
        bot.send_message(chat_id, "Этот тариф больше недоступен.").await?;
        return Ok(());
    }

    let now = db::current_unix_timestamp()?;
    match state
        .db
        .purchase_subscription(tg_user_id, price_rub, days, now)
        .await
    {
        Ok(outcome) => {
            tracing::info!(tg_user_id, days, price_rub, "Покупка подписки");
            bot.send_message(
                chat_id,
                purchase_success_text(days, outcome.new_end, outcome.new_balance),
            )
            .reply_markup(crate::bot::keyboards::pick_server_button())
            .await?;
        }
        Err(err @ PurchaseError::InsufficientBalance { .. }) => {
            bot.send_message(chat_id, err.to_string())
                .reply_markup(crate::bot::keyboards::topup_method_buttons())
                .await?;
        }
        Err(err @ PurchaseError::UserNotFound) => {
            bot.send_message(chat_id, err.to_string()).await?;
        }
        Err(PurchaseError::Db(err)) => return Err(err.into()),
    }
    Ok(())
}

async fn send_stars_invoice(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    stars: i64,
    rub: i64,
) -> HandlerResult {
    let known = state
        .config
        .payments
        .stars_packs
        .iter()
        .any(|p| p.stars == stars && p.rub == rub);
    if !known {
        bot.send_message(chat_id, "Этот пакет больше недоступен.").await?;
        return Ok(());
    }

    bot.send_invoice(
        chat_id,
        format!("Пополнение на {} ₽", rub),
        format!("{} звёзд будут зачислены как {} ₽ на баланс.", stars, rub),
        format!("pack_{}_{}", stars, rub),
        "XTR",
        vec![LabeledPrice {
            label: format!("{} ₽", rub),
            amount: stars as u32,
        }],
    )
    .await?;
    Ok(())
}

async fn send_crypto_invoice(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    tg_user_id: i64,
    rub: i64,
) -> HandlerResult {
    let Some(amount) = state
        .config
        .payments
        .cryptobot
        .amounts
        .iter()
        .find(|a| a.rub == rub)
        .cloned()
    else {
        bot.send_message(chat_id, "Эта сумма больше недоступна.").await?;
        return Ok(());
    };

    match create_crypto_invoice(state, tg_user_id, amount.rub, amount.usdt).await {
        Ok(pay_url) => {
            bot.send_message(
                chat_id,
                format!(
                    "Счёт на {} ₽ (~{} USDT, сеть {}).\n\
                     После оплаты вернитесь в бот по кнопке в CryptoBot — баланс\n\
                     зачислится автоматически, плюс бонусный промокод на {} дн.",
                    amount.rub,
                    amount.usdt,
                    state.config.payments.cryptobot.network,
                    amount.bonus_days
                ),
            )
            .reply_markup(crate::bot::keyboards::pay_url_button(&pay_url))
            .await?;
        }
        Err(err) => {
            tracing::error!(tg_user_id, rub, error = %err, "Не удалось создать счёт CryptoBot");
            bot.send_message(chat_id, "Не удалось создать счёт, попробуйте позже.")
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_data_round_trips_into_intents() {
        assert_eq!(
            CallbackIntent::parse("tariff:30:180"),
            Some(CallbackIntent::Tariff {
                days: 30,
                price_rub: 180
            })
        );
        assert_eq!(
            CallbackIntent::parse("server:7"),
            Some(CallbackIntent::Server { server_id: 7 })
        );
        assert_eq!(CallbackIntent::parse("topup:stars"), Some(CallbackIntent::TopUpStars));
        assert_eq!(
            CallbackIntent::parse("stars:100:180"),
            Some(CallbackIntent::StarsPack {
                stars: 100,
                rub: 180
            })
        );
        assert_eq!(
            CallbackIntent::parse("crypto:450"),
            Some(CallbackIntent::CryptoAmount { rub: 450 })
        );
        assert_eq!(CallbackIntent::parse("buy"), Some(CallbackIntent::Buy));
    }

    #[test]
    fn malformed_callback_data_is_ignored() {
        assert_eq!(CallbackIntent::parse(""), None);
        assert_eq!(CallbackIntent::parse("tariff:30"), None);
        assert_eq!(CallbackIntent::parse("tariff:abc:180"), None);
        assert_eq!(CallbackIntent::parse("server:7:extra"), None);
        assert_eq!(CallbackIntent::parse("unknown:1"), None);
        assert_eq!(CallbackIntent::parse("topup:card"), None);
    }
}
