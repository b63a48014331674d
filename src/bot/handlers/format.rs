use crate::db::User;
use crate::subscription;
use chrono::{DateTime, Local, Utc};

pub fn format_date(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.with_timezone(&Local).format("%d.%m.%Y").to_string())
        .unwrap_or_else(|| "—".to_string())
}

pub fn subscription_status_text(user: &User, now: i64) -> String {
    match user.subscription_end {
        Some(end) if subscription::is_active(Some(end), now) => {
            let days_left = (end - now) / subscription::DAY_SECS;
            format!(
                "✅ Подписка активна до {}.\nОсталось дней: {}.\nБаланс: {} ₽.",
                format_date(end),
                days_left,
                user.balance
            )
        }
        Some(end) => format!(
            "❌ Подписка закончилась {}.\nБаланс: {} ₽.\nПродлите её, чтобы снова пользоваться VPN.",
            format_date(end),
            user.balance
        ),
        None => format!(
            "У вас ещё нет подписки.\nБаланс: {} ₽.\nНажмите «Купить / Продлить», чтобы начать.",
            user.balance
        ),
    }
}

pub fn welcome_text() -> &'static str {
    "Привет! Это StarShip VPN — быстрый Outline VPN.\n\n\
     💳 Купите подписку, выберите сервер и получите ключ за минуту.\n\
     Используйте кнопки меню ниже."
}

pub fn usage_guide_text() -> &'static str {
    r#"Как подключиться:

1) Установите приложение Outline:
   • iOS / Android — «Outline App» в магазине приложений
   • Windows / macOS — getoutline.org
2) Нажмите «🔑 Мои ключи» и скопируйте ключ (ss://…) или отсканируйте QR.
3) Вставьте ключ в Outline и нажмите «Подключиться».

Ключ работает, пока активна подписка. Если что-то не выходит — кнопка «🆘 Помощь»."#
}

pub fn invite_text(bot_username: &str, telegram_id: i64, total: i64, paid: i64) -> String {
    format!(
        "🤝 Приглашайте друзей по личной ссылке:\n\
         https://t.me/{}?start=ref_{}\n\n\
         Приглашено: {}\nС активной подпиской: {}",
        bot_username, telegram_id, total, paid
    )
}
