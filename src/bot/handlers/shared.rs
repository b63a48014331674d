//! Общие помощники обработчиков: deep-link /start, доставка ключа с QR,
//! зачисление платежей, счета CryptoBot.

use super::format::format_date;
use super::state::BotState;
use crate::db::RefSource;
use crate::provision::{self, ProvisionError};
use image::{DynamicImage, ImageFormat, Luma};
use qrcode::QrCode;
use serde::Deserialize;
use std::io::Cursor;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::InputFile;

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Разобранный аргумент /start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPayload {
    /// ref_<telegram_id> — личная реферальная ссылка.
    Referral(i64),
    /// ad-<uuid> или короткий id — рекламная ссылка.
    Ad(String),
    /// paid_<rub>_<telegram_id> — возврат после оплаты в CryptoBot.
    CryptoPaid { rub: i64, telegram_id: i64 },
}

pub fn parse_start_payload(text: &str) -> Option<StartPayload> {
    let arg = text.split_whitespace().nth(1)?;
    if let Some(rest) = arg.strip_prefix("ref_") {
        return rest.parse().ok().map(StartPayload::Referral);
    }
    if let Some(rest) = arg.strip_prefix("paid_") {
        let (rub, telegram_id) = rest.split_once('_')?;
        return Some(StartPayload::CryptoPaid {
            rub: rub.parse().ok()?,
            telegram_id: telegram_id.parse().ok()?,
        });
    }
    if arg.starts_with("ad-") {
        return Some(StartPayload::Ad(arg.to_string()));
    }
    None
}

pub fn ref_source_from_payload(payload: &Option<StartPayload>) -> Option<RefSource> {
    match payload {
        Some(StartPayload::Referral(telegram_id)) => Some(RefSource::User(*telegram_id)),
        Some(StartPayload::Ad(id)) => Some(RefSource::Ad(id.clone())),
        _ => None,
    }
}

pub fn build_key_qr_png_bytes(payload: &str) -> Result<Vec<u8>, anyhow::Error> {
    let qr = QrCode::new(payload.as_bytes())?;
    let image = qr
        .render::<Luma<u8>>()
        .quiet_zone(true)
        .min_dimensions(512, 512)
        .build();
    let mut bytes = Vec::new();
    {
        let mut cursor = Cursor::new(&mut bytes);
        DynamicImage::ImageLuma8(image).write_to(&mut cursor, ImageFormat::Png)?;
    }
    Ok(bytes)
}

/// Отправляет ключ текстом и QR-картинкой.
pub async fn send_key_with_qr(
    bot: &Bot,
    chat_id: ChatId,
    access_url: &str,
    caption: &str,
) -> HandlerResult {
    bot.send_message(
        chat_id,
        format!("{}\n\nВаш ключ:\n<code>{}</code>", caption, access_url),
    )
    .parse_mode(teloxide::types::ParseMode::Html)
    .await?;
    match build_key_qr_png_bytes(access_url) {
        Ok(png) => {
            bot.send_photo(chat_id, InputFile::memory(png).file_name("vpn-key.png"))
                .await?;
        }
        Err(err) => {
            tracing::warn!(error = %err, "Не удалось построить QR для ключа");
        }
    }
    Ok(())
}

/// Выдача ключа с ответом пользователю на каждый исход.
pub async fn provision_and_deliver(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    tg_user_id: i64,
    server_id: i64,
) -> HandlerResult {
    let now = crate::db::current_unix_timestamp()?;
    match provision::provision(&state.db, state.key_api.as_ref(), tg_user_id, server_id, now).await
    {
        Ok(issued) => {
            send_key_with_qr(bot, chat_id, &issued.access_url, "🔑 Готово!").await?;
        }
        Err(
            err @ (ProvisionError::SubscriptionRequired
            | ProvisionError::ServerUnavailable
            | ProvisionError::ServerNotFound
            | ProvisionError::CapacityExceeded
            | ProvisionError::UserNotFound),
        ) => {
            bot.send_message(chat_id, err.to_string()).await?;
        }
        Err(err) => {
            tracing::error!(tg_user_id, server_id, error = %err, "Ошибка выдачи ключа");
            bot.send_message(
                chat_id,
                "Не удалось выдать ключ, попробуйте позже или выберите другой сервер.",
            )
            .await?;
        }
    }
    Ok(())
}

/// Зачисление успешного платежа Stars. Повторная доставка того же
/// платежа Telegram'ом зачисляется только один раз.
pub async fn handle_successful_payment(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(payment) = msg.successful_payment() else {
        return Ok(());
    };
    let Some(tg_user_id) = super::state::sender_user_id(&msg) else {
        return Ok(());
    };

    let stars = payment.total_amount as i64;
    let rub = stars * state.config.payments.star_rate_rub;
    let payload = format!(
        "stars:{}:{}",
        payment.invoice_payload, payment.telegram_payment_charge_id
    );

    match state.db.apply_payment(tg_user_id, rub, Some(stars), &payload).await? {
        Some(new_balance) => {
            tracing::info!(tg_user_id, stars, rub, "Зачислен платёж Stars");
            bot.send_message(
                msg.chat.id,
                format!("✅ Баланс пополнен на {} ₽. Текущий баланс: {} ₽.", rub, new_balance),
            )
            .await?;
        }
        None => {
            tracing::warn!(tg_user_id, payload = %payload, "Повторная доставка платежа, пропущена");
        }
    }
    Ok(())
}

/// Возврат из CryptoBot по deep-link: начисляет сумму (идемпотентно по
/// ссылке возврата) и выдаёт одноразовый бонусный промокод пакета.
pub async fn handle_crypto_return(
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
    else {
        bot.send_message(chat_id, "Неизвестная сумма пополнения.").await?;
        return Ok(());
    };

    let payload = format!("crypto:{}:{}", rub, tg_user_id);
    match state.db.apply_payment(tg_user_id, rub, None, &payload).await? {
        Some(new_balance) => {
            let promo = state.db.create_bonus_promo(tg_user_id, amount.bonus_days).await?;
            tracing::info!(tg_user_id, rub, promo = %promo.code, "Зачислено пополнение CryptoBot");
            bot.send_message(
                chat_id,
                format!(
                    "✅ Баланс пополнен на {} ₽ (текущий: {} ₽).\n\n\
                     🎁 Бонус: промокод на {} дн. — <code>{}</code>\n\
                     Активируйте его через «Промокод».",
                    rub, new_balance, amount.bonus_days, promo.code
                ),
            )
            .parse_mode(teloxide::types::ParseMode::Html)
            .await?;
        }
        None => {
            bot.send_message(chat_id, "Это пополнение уже зачислено.").await?;
        }
    }
    Ok(())
}

#[derive(Deserialize)]
struct CryptoInvoiceResponse {
    ok: bool,
    result: Option<CryptoInvoice>,
}

#[derive(Deserialize)]
struct CryptoInvoice {
    pay_url: String,
}

/// Создаёт счёт в CryptoBot и возвращает ссылку на оплату.
pub async fn create_crypto_invoice(
    state: &BotState,
    tg_user_id: i64,
    rub: i64,
    usdt: f64,
) -> Result<String, anyhow::Error> {
    let token = state
        .config
        .cryptobot_token()
        .ok_or_else(|| anyhow::anyhow!("Токен CryptoBot не настроен"))?;
    let return_url = state
        .bot_username
        .as_deref()
        .map(|bot_username| format!("https://t.me/{}?start=paid_{}_{}", bot_username, rub, tg_user_id));

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let mut body = serde_json::json!({
        "asset": state.config.payments.cryptobot.asset,
        "amount": format!("{:.2}", usdt),
        "description": format!("Пополнение баланса на {} ₽", rub),
    });
    if let Some(url) = return_url {
        body["paid_btn_name"] = "callback".into();
        body["paid_btn_url"] = url.into();
    }

    let response = client
        .post("https://pay.crypt.bot/api/createInvoice")
        .header("Crypto-Pay-API-Token", token)
        .json(&body)
        .send()
        .await?
        .json::<CryptoInvoiceResponse>()
        .await?;
    if !response.ok {
        return Err(anyhow::anyhow!("CryptoBot отклонил создание счёта"));
    }
    response
        .result
        .map(|invoice| invoice.pay_url)
        .ok_or_else(|| anyhow::anyhow!("CryptoBot вернул ответ без ссылки на оплату"))
}

/// Итог успешной покупки для пользователя.
pub fn purchase_success_text(days: i64, new_end: i64, new_balance: i64) -> String {
    format!(
        "✅ Подписка продлена на {} дн. — действует до {}.\nБаланс: {} ₽.",
        days,
        format_date(new_end),
        new_balance
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_payload_parses_deep_links() {
        assert_eq!(
            parse_start_payload("/start ref_123"),
            Some(StartPayload::Referral(123))
        );
        assert_eq!(
            parse_start_payload("/start ad-550e8400"),
            Some(StartPayload::Ad("ad-550e8400".into()))
        );
        assert_eq!(
            parse_start_payload("/start paid_450_77"),
            Some(StartPayload::CryptoPaid {
                rub: 450,
                telegram_id: 77
            })
        );
        assert_eq!(parse_start_payload("/start"), None);
        assert_eq!(parse_start_payload("/start junk"), None);
        assert_eq!(parse_start_payload("/start ref_abc"), None);
    }
}
