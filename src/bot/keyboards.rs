//! Клавиатуры бота: inline и постоянные reply-кнопки.

use crate::config::{CryptoAmount, StarsPack, Tariff};
use crate::db::Server;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, KeyboardButton, KeyboardMarkup};

pub const BTN_BUY: &str = "💳 Купить / Продлить";
pub const BTN_TOPUP: &str = "💰 Пополнить баланс";
pub const BTN_PROMO: &str = "🎁 Промокод";
pub const BTN_STATUS: &str = "📅 Моя подписка";
pub const BTN_SERVER: &str = "🌍 Выбрать сервер";
pub const BTN_KEYS: &str = "🔑 Мои ключи";
pub const BTN_GUIDE: &str = "❓ Инструкция";
pub const BTN_INVITE: &str = "🤝 Пригласить друга";
pub const BTN_SUPPORT: &str = "🆘 Помощь";

pub fn main_menu() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![
        vec![KeyboardButton::new(BTN_BUY), KeyboardButton::new(BTN_TOPUP)],
        vec![
            KeyboardButton::new(BTN_PROMO),
            KeyboardButton::new(BTN_STATUS),
        ],
        vec![
            KeyboardButton::new(BTN_SERVER),
            KeyboardButton::new(BTN_KEYS),
        ],
        vec![
            KeyboardButton::new(BTN_GUIDE),
            KeyboardButton::new(BTN_INVITE),
        ],
        vec![KeyboardButton::new(BTN_SUPPORT)],
    ])
    .resize_keyboard()
    .persistent()
}

pub fn tariff_buttons(tariffs: &[Tariff]) -> InlineKeyboardMarkup {
    let mut markup = InlineKeyboardMarkup::default();
    for tariff in tariffs {
        markup = markup.append_row(vec![InlineKeyboardButton::callback(
            format!("{} дн. — {} ₽", tariff.days, tariff.price_rub),
            format!("tariff:{}:{}", tariff.days, tariff.price_rub),
        )]);
    }
    markup
}

/// Кнопки серверов с остатком свободных мест.
pub fn server_buttons(servers: &[(Server, i64)]) -> InlineKeyboardMarkup {
    let mut markup = InlineKeyboardMarkup::default();
    for (server, live) in servers {
        let free = (server.max_keys - live).max(0);
        markup = markup.append_row(vec![InlineKeyboardButton::callback(
            format!("{} {} (свободно {})", server.country, server.name, free),
            format!("server:{}", server.id),
        )]);
    }
    markup
}

pub fn topup_method_buttons() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::default()
        .append_row(vec![InlineKeyboardButton::callback(
            "⭐ Telegram Stars",
            "topup:stars",
        )])
        .append_row(vec![InlineKeyboardButton::callback(
            "💎 CryptoBot (USDT)",
            "topup:crypto",
        )])
}

pub fn stars_pack_buttons(packs: &[StarsPack]) -> InlineKeyboardMarkup {
    let mut markup = InlineKeyboardMarkup::default();
    for pack in packs {
        markup = markup.append_row(vec![InlineKeyboardButton::callback(
            format!("{} ⭐ → {} ₽", pack.stars, pack.rub),
            format!("stars:{}:{}", pack.stars, pack.rub),
        )]);
    }
    markup
}

pub fn crypto_amount_buttons(amounts: &[CryptoAmount]) -> InlineKeyboardMarkup {
    let mut markup = InlineKeyboardMarkup::default();
    for amount in amounts {
        markup = markup.append_row(vec![InlineKeyboardButton::callback(
            format!("{} ₽ (~{} USDT, +{} дн. бонус)", amount.rub, amount.usdt, amount.bonus_days),
            format!("crypto:{}", amount.rub),
        )]);
    }
    markup
}

pub fn buy_after_status_buttons() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::default().append_row(vec![InlineKeyboardButton::callback(
        "💳 Продлить",
        "buy",
    )])
}

pub fn pick_server_button() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::default().append_row(vec![InlineKeyboardButton::callback(
        "🌍 Получить ключ",
        "pick_server",
    )])
}

pub fn pay_url_button(url: &str) -> InlineKeyboardMarkup {
    let parsed = url::Url::parse(url).ok();
    match parsed {
        Some(parsed) => InlineKeyboardMarkup::default()
            .append_row(vec![InlineKeyboardButton::url("Оплатить", parsed)]),
        None => InlineKeyboardMarkup::default(),
    }
}
