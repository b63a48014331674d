//! Выдача ключа с учётом ёмкости сервера.
//!
//! Порядок шагов фиксирован: активная подписка → сервер online → проверка
//! ёмкости → удаление старых ключей на удалённых серверах (ошибки только
//! логируются) → создание ключа на выбранном сервере (решающий шаг: при
//! ошибке локальное состояние не меняется) → локальная замена записей
//! одной транзакцией. У пользователя никогда не остаётся больше одного
//! живого ключа.

use crate::db::Db;
use crate::outline::{IssuedKey, KeyApi, OutlineError};
use crate::subscription;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Пользователь не найден. Нажмите /start.")]
    UserNotFound,
    #[error("Для получения ключа нужна активная подписка.")]
    SubscriptionRequired,
    #[error("Сервер не найден.")]
    ServerNotFound,
    #[error("Сервер временно недоступен, выберите другой.")]
    ServerUnavailable,
    #[error("На сервере закончились свободные места, выберите другой.")]
    CapacityExceeded,
    #[error("Не удалось создать ключ: {0}")]
    Remote(#[from] OutlineError),
    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

pub async fn provision(
    db: &Db,
    key_api: &dyn KeyApi,
    telegram_id: i64,
    server_id: i64,
    now: i64,
) -> Result<IssuedKey, ProvisionError> {
    let user = db
        .get_user_by_telegram(telegram_id)
        .await?
        .ok_or(ProvisionError::UserNotFound)?;
    if !subscription::is_active(user.subscription_end, now) {
        return Err(ProvisionError::SubscriptionRequired);
    }

    let server = db
        .get_server(server_id)
        .await?
        .ok_or(ProvisionError::ServerNotFound)?;
    if server.status != crate::db::SERVER_ONLINE {
        return Err(ProvisionError::ServerUnavailable);
    }

    // Ёмкость проверяется до любых изменений: при отказе ни локальное,
    // ни удалённое состояние не трогаем.
    let live = db.count_keys_on_server(server.id).await?;
    if live >= server.max_keys {
        return Err(ProvisionError::CapacityExceeded);
    }

    // Старые ключи пользователя могут жить на других серверах; каждый
    // удаляется параметрами своего сервера. Ошибка удаления не блокирует
    // выдачу — осиротевший ключ подберёт ревизия.
    let old_keys = db.list_keys_of_user(user.id).await?;
    for old in &old_keys {
        let Some(old_server) = db.get_server(old.server_id).await? else {
            continue;
        };
        if let Err(err) = key_api.delete_key(&old_server, &old.outline_key_id).await {
            tracing::warn!(
                user_id = user.id,
                server_id = old.server_id,
                error = %err,
                "Не удалось удалить старый ключ на сервере"
            );
        }
    }

    // Решающий шаг: без удалённого ключа локальная запись не создаётся.
    let issued = key_api.create_key(&server).await?;

    db.replace_user_key(user.id, server.id, &issued.id, &issued.access_url)
        .await?;

    tracing::info!(
        user_id = user.id,
        server_id = server.id,
        outline_key_id = %issued.id,
        "Выдан новый ключ"
    );
    Ok(issued)
}

#[cfg(test)]
pub(crate) mod test_stub {
    use super::*;
    use crate::db::Server;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Стаб удалённого API: считает вызовы, по желанию падает.
    pub struct StubKeyApi {
        pub next_id: AtomicU64,
        pub fail_create: bool,
        pub fail_delete: bool,
        pub deleted: Mutex<Vec<String>>,
    }

    impl StubKeyApi {
        pub fn new() -> Self {
            Self {
                next_id: AtomicU64::new(1),
                fail_create: false,
                fail_delete: false,
                deleted: Mutex::new(Vec::new()),
            }
        }

        pub fn failing_create() -> Self {
            Self {
                fail_create: true,
                ..Self::new()
            }
        }

        pub fn failing_delete() -> Self {
            Self {
                fail_delete: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl KeyApi for StubKeyApi {
        async fn create_key(&self, server: &Server) -> Result<IssuedKey, OutlineError> {
            if self.fail_create {
                return Err(OutlineError::Status(
                    reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                ));
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(IssuedKey {
                id: id.to_string(),
                access_url: format!("ss://stub@{}/{}", server.id, id),
            })
        }

        async fn delete_key(&self, _server: &Server, key_id: &str) -> Result<(), OutlineError> {
            if self.fail_delete {
                return Err(OutlineError::Status(
                    reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                ));
            }
            self.deleted.lock().unwrap().push(key_id.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_stub::StubKeyApi;
    use super::*;
    use crate::db::Db;
    use crate::subscription::days_to_secs;

    const NOW: i64 = 1_700_000_000;

    async fn setup(max_keys: i64) -> (Db, i64) {
        let db = Db::open_in_memory().await.unwrap();
        let (user, _) = db.ensure_user(1, None, None, None).await.unwrap();
        db.set_subscription_end(user.id, Some(NOW + days_to_secs(30)))
            .await
            .unwrap();
        let server = db
            .create_server("nl-1", "NL", "online", "https://s1", "aa", max_keys)
            .await
            .unwrap();
        (db, server.id)
    }

    #[tokio::test]
    async fn inactive_subscription_is_rejected() {
        let db = Db::open_in_memory().await.unwrap();
        db.ensure_user(1, None, None, None).await.unwrap();
        let server = db
            .create_server("nl-1", "NL", "online", "https://s1", "aa", 10)
            .await
            .unwrap();
        let api = StubKeyApi::new();

        let err = provision(&db, &api, 1, server.id, NOW).await.unwrap_err();
        assert!(matches!(err, ProvisionError::SubscriptionRequired));
    }

    #[tokio::test]
    async fn offline_server_is_rejected() {
        let (db, _) = setup(10).await;
        let offline = db
            .create_server("de-1", "DE", "offline", "https://s2", "bb", 10)
            .await
            .unwrap();
        let api = StubKeyApi::new();

        let err = provision(&db, &api, 1, offline.id, NOW).await.unwrap_err();
        assert!(matches!(err, ProvisionError::ServerUnavailable));
    }

    #[tokio::test]
    async fn full_server_rejected_without_any_mutation() {
        let (db, server_id) = setup(1).await;
        let (other, _) = db.ensure_user(2, None, None, None).await.unwrap();
        db.set_subscription_end(other.id, Some(NOW + days_to_secs(30)))
            .await
            .unwrap();
        let api = StubKeyApi::new();
        provision(&db, &api, 2, server_id, NOW).await.unwrap();

        // Сервер заполнен; у пользователя 1 уже есть ключ на другом сервере.
        let second = db
            .create_server("de-1", "DE", "online", "https://s2", "bb", 10)
            .await
            .unwrap();
        let existing = provision(&db, &api, 1, second.id, NOW).await.unwrap();
        let deleted_before = api.deleted.lock().unwrap().len();

        let err = provision(&db, &api, 1, server_id, NOW).await.unwrap_err();
        assert!(matches!(err, ProvisionError::CapacityExceeded));

        // Существующий ключ не тронут ни локально, ни удалённо.
        let user = db.get_user_by_telegram(1).await.unwrap().unwrap();
        let after = db.list_keys_of_user(user.id).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].outline_key_id, existing.id);
        assert_eq!(api.deleted.lock().unwrap().len(), deleted_before);
    }

    #[tokio::test]
    async fn reprovision_leaves_single_key_and_deletes_old_remote() {
        let (db, server_id) = setup(10).await;
        let api = StubKeyApi::new();

        let first = provision(&db, &api, 1, server_id, NOW).await.unwrap();
        let second = provision(&db, &api, 1, server_id, NOW).await.unwrap();
        assert_ne!(first.id, second.id);

        let user = db.get_user_by_telegram(1).await.unwrap().unwrap();
        let keys = db.list_keys_of_user(user.id).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].outline_key_id, second.id);
        assert_eq!(*api.deleted.lock().unwrap(), vec![first.id]);
    }

    #[tokio::test]
    async fn remote_create_failure_leaves_no_local_row() {
        let (db, server_id) = setup(10).await;
        let api = StubKeyApi::failing_create();

        let err = provision(&db, &api, 1, server_id, NOW).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Remote(_)));

        let user = db.get_user_by_telegram(1).await.unwrap().unwrap();
        assert!(db.list_keys_of_user(user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_remote_delete_failure_does_not_block_issue() {
        let (db, server_id) = setup(10).await;
        let ok_api = StubKeyApi::new();
        provision(&db, &ok_api, 1, server_id, NOW).await.unwrap();

        let api = StubKeyApi::failing_delete();
        let issued = provision(&db, &api, 1, server_id, NOW).await.unwrap();

        let user = db.get_user_by_telegram(1).await.unwrap().unwrap();
        let keys = db.list_keys_of_user(user.id).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].outline_key_id, issued.id);
    }
}
