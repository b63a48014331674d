use crate::config::Config;
use crate::db::Db;
use crate::outline::KeyApi;
use std::collections::HashMap;
use std::sync::Arc;
use teloxide::types::Message;
use tokio::sync::Mutex;

/// Чего бот ждёт от пользователя следующим сообщением.
/// Закрытый enum вместо набора разрозненных флагов: одно состояние на чат.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    AwaitingPromoCode,
    AwaitingSupportQuestion,
}

#[derive(Clone)]
pub struct BotState {
    pub config: Arc<Config>,
    pub db: Arc<Db>,
    pub key_api: Arc<dyn KeyApi>,
    pub bot_username: Option<String>,
    pub sessions: Arc<Mutex<HashMap<i64, SessionState>>>,
}

impl BotState {
    pub async fn set_session(&self, tg_user_id: i64, state: SessionState) {
        self.sessions.lock().await.insert(tg_user_id, state);
    }

    /// Забирает состояние, очищая его: каждое ожидание одноразовое.
    pub async fn take_session(&self, tg_user_id: i64) -> Option<SessionState> {
        self.sessions.lock().await.remove(&tg_user_id)
    }

    pub async fn clear_session(&self, tg_user_id: i64) {
        self.sessions.lock().await.remove(&tg_user_id);
    }
}

pub fn sender_user_id(msg: &Message) -> Option<i64> {
    msg.from.as_ref().map(|user| user.id.0 as i64)
}

pub fn sender_username(msg: &Message) -> Option<String> {
    msg.from.as_ref().and_then(|user| user.username.clone())
}

pub fn sender_country(msg: &Message) -> Option<String> {
    msg.from
        .as_ref()
        .and_then(|user| user.language_code.clone())
        .map(|code| code.to_uppercase())
}

pub fn is_admin_message(msg: &Message, state: &BotState) -> bool {
    sender_user_id(msg).is_some_and(|user_id| state.config.is_admin(user_id))
}
