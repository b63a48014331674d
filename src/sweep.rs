//! Фоновые циклы: ревизия истёкших ключей, диспетчер отложенных
//! рассылок и напоминания об окончании подписки.
//!
//! Каждый цикл терпим к частичным сбоям: ошибка по одному элементу
//! логируется, остальные обрабатываются. Ревизия идемпотентна — повторный
//! запуск без изменений в БД ничего не делает.

use crate::bot::handlers::format;
use crate::db::{self, Db};
use crate::outline::KeyApi;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;

/// Горизонт напоминания об окончании подписки.
const EXPIRY_NOTICE_SECS: i64 = 24 * 3600;

/// Один проход ревизии: удаляет ключи пользователей с истёкшей подпиской.
/// При ошибке удалённого удаления локальная запись сохраняется и будет
/// повторена следующим проходом. Возвращает число удалённых ключей.
pub async fn remove_expired_keys(db: &Db, key_api: &dyn KeyApi, now: i64) -> usize {
    let keys = match db.list_keys_for_sweep().await {
        Ok(keys) => keys,
        Err(err) => {
            tracing::error!(error = %err, "Ревизия: не удалось загрузить ключи");
            return 0;
        }
    };

    let mut removed = 0;
    for key in keys {
        if crate::subscription::is_active(key.subscription_end, now) {
            continue;
        }
        let server = db::Server {
            id: key.server_id,
            name: String::new(),
            country: String::new(),
            status: db::SERVER_ONLINE.to_string(),
            api_url: key.api_url.clone(),
            cert_sha256: key.cert_sha256.clone(),
            max_keys: 0,
            created_at: 0,
        };
        if let Err(err) = key_api.delete_key(&server, &key.outline_key_id).await {
            tracing::warn!(
                key_id = key.id,
                server_id = key.server_id,
                error = %err,
                "Ревизия: не удалось удалить ключ на сервере, попробуем в следующий проход"
            );
            continue;
        }
        match db.delete_key(key.id).await {
            Ok(_) => {
                removed += 1;
                tracing::info!(key_id = key.id, user_id = key.user_id, "Ревизия: ключ удалён");
            }
            Err(err) => {
                tracing::error!(key_id = key.id, error = %err, "Ревизия: не удалось удалить локальную запись");
            }
        }
    }
    removed
}

/// Один проход диспетчера: доставляет все pending-рассылки, чьё время
/// наступило. Ошибка по отдельному получателю пропускается.
pub async fn process_due_broadcasts(bot: &Bot, db: &Db, now: i64) {
    let due = match db.due_broadcasts(now).await {
        Ok(due) => due,
        Err(err) => {
            tracing::error!(error = %err, "Рассылки: не удалось загрузить очередь");
            return;
        }
    };

    for broadcast in due {
        let recipients = match db.broadcast_recipients(broadcast.user_ids.as_deref()).await {
            Ok(recipients) => recipients,
            Err(err) => {
                tracing::error!(broadcast_id = broadcast.id, error = %err, "Рассылки: некорректный список получателей");
                let _ = db
                    .finish_broadcast(broadcast.id, db::BROADCAST_FAILED, Some(&err.to_string()))
                    .await;
                continue;
            }
        };

        let mut sent = 0usize;
        for telegram_id in &recipients {
            match bot
                .send_message(ChatId(*telegram_id), &broadcast.message)
                .await
            {
                Ok(_) => sent += 1,
                Err(err) => {
                    tracing::warn!(broadcast_id = broadcast.id, telegram_id, error = %err, "Рассылки: получатель пропущен");
                }
            }
        }

        match db.finish_broadcast(broadcast.id, db::BROADCAST_COMPLETED, None).await {
            Ok(_) => {
                tracing::info!(
                    broadcast_id = broadcast.id,
                    sent,
                    total = recipients.len(),
                    "Рассылка доставлена"
                );
            }
            Err(err) => {
                tracing::error!(broadcast_id = broadcast.id, error = %err, "Рассылки: не удалось записать статус");
            }
        }
    }
}

/// Один проход напоминаний: пользователи, чья подписка закончится в
/// ближайшие сутки, получают одно сообщение. Флаг сбрасывается при любом
/// продлении.
pub async fn notify_expiring(bot: &Bot, db: &Db, now: i64) {
    let expiring = match db.users_expiring_within(now, EXPIRY_NOTICE_SECS).await {
        Ok(expiring) => expiring,
        Err(err) => {
            tracing::error!(error = %err, "Напоминания: не удалось загрузить пользователей");
            return;
        }
    };

    for user in expiring {
        let Some(end) = user.subscription_end else {
            continue;
        };
        let text = format!(
            "⏳ Ваша подписка заканчивается {}.\nПродлите её, чтобы ключ продолжил работать.",
            format::format_date(end)
        );
        if let Err(err) = bot.send_message(ChatId(user.telegram_id), text).await {
            tracing::warn!(telegram_id = user.telegram_id, error = %err, "Напоминания: не удалось отправить");
            continue;
        }
        if let Err(err) = db.mark_expiry_notified(user.id).await {
            tracing::error!(user_id = user.id, error = %err, "Напоминания: не удалось отметить отправку");
        }
    }
}

pub async fn run_reconciler(db: Arc<Db>, key_api: Arc<dyn KeyApi>, interval_secs: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        ticker.tick().await;
        let now = match db::current_unix_timestamp() {
            Ok(now) => now,
            Err(err) => {
                tracing::error!(error = %err, "Ревизия: не удалось получить время");
                continue;
            }
        };
        let removed = remove_expired_keys(&db, key_api.as_ref(), now).await;
        if removed > 0 {
            tracing::info!(removed, "Ревизия завершена");
        }
    }
}

pub async fn run_broadcaster(bot: Bot, db: Arc<Db>, interval_secs: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        ticker.tick().await;
        if let Ok(now) = db::current_unix_timestamp() {
            process_due_broadcasts(&bot, &db, now).await;
        }
    }
}

pub async fn run_expiry_notifier(bot: Bot, db: Arc<Db>, interval_secs: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        ticker.tick().await;
        if let Ok(now) = db::current_unix_timestamp() {
            notify_expiring(&bot, &db, now).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::test_stub::StubKeyApi;
    use crate::subscription::days_to_secs;

    const NOW: i64 = 1_700_000_000;

    async fn seed(db: &Db, telegram_id: i64, end: Option<i64>, server_id: i64) -> i64 {
        let (user, _) = db.ensure_user(telegram_id, None, None, None).await.unwrap();
        db.set_subscription_end(user.id, end).await.unwrap();
        db.replace_user_key(user.id, server_id, &format!("k{}", telegram_id), "ss://x")
            .await
            .unwrap();
        user.id
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_keys() {
        let db = Db::open_in_memory().await.unwrap();
        let server = db
            .create_server("nl-1", "NL", "online", "https://s1", "aa", 10)
            .await
            .unwrap();
        let expired = seed(&db, 1, Some(NOW - 10), server.id).await;
        let active = seed(&db, 2, Some(NOW + days_to_secs(5)), server.id).await;
        let api = StubKeyApi::new();

        let removed = remove_expired_keys(&db, &api, NOW).await;
        assert_eq!(removed, 1);
        assert!(db.list_keys_of_user(expired).await.unwrap().is_empty());
        assert_eq!(db.list_keys_of_user(active).await.unwrap().len(), 1);

        // Повторный проход без изменений — no-op.
        let removed = remove_expired_keys(&db, &api, NOW).await;
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn sweep_keeps_local_row_when_remote_delete_fails() {
        let db = Db::open_in_memory().await.unwrap();
        let server = db
            .create_server("nl-1", "NL", "online", "https://s1", "aa", 10)
            .await
            .unwrap();
        let expired = seed(&db, 1, Some(NOW - 10), server.id).await;
        let api = StubKeyApi::failing_delete();

        let removed = remove_expired_keys(&db, &api, NOW).await;
        assert_eq!(removed, 0);
        // Запись осталась — будет повторена следующим проходом.
        assert_eq!(db.list_keys_of_user(expired).await.unwrap().len(), 1);

        let ok_api = StubKeyApi::new();
        let removed = remove_expired_keys(&db, &ok_api, NOW).await;
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn sweep_continues_past_missing_subscription() {
        let db = Db::open_in_memory().await.unwrap();
        let server = db
            .create_server("nl-1", "NL", "online", "https://s1", "aa", 10)
            .await
            .unwrap();
        let no_sub = seed(&db, 1, None, server.id).await;
        let expired = seed(&db, 2, Some(NOW - 10), server.id).await;
        let api = StubKeyApi::new();

        let removed = remove_expired_keys(&db, &api, NOW).await;
        assert_eq!(removed, 2);
        assert!(db.list_keys_of_user(no_sub).await.unwrap().is_empty());
        assert!(db.list_keys_of_user(expired).await.unwrap().is_empty());
    }
}
