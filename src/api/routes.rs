//! Обработчики админ-API. Все ответы — JSON; инфраструктурные ошибки
//! превращаются в 500 с текстом в теле.

use super::ApiState;
use crate::db;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use teloxide::prelude::*;

pub struct ApiError(anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "Ошибка админ-API");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(err)
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
pub struct AdClick {
    pub id: String,
}

pub async fn ad_ref_click(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<AdClick>,
) -> ApiResult<StatusCode> {
    let known = state.db.increment_ad_click(&body.id).await?;
    Ok(if known {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    })
}

#[derive(Serialize)]
pub struct StatsBody {
    pub total_users: i64,
    pub active_subscriptions: i64,
    pub live_keys: i64,
    pub open_tickets: i64,
}

pub async fn stats(State(state): State<Arc<ApiState>>) -> ApiResult<Json<StatsBody>> {
    let now = db::current_unix_timestamp()?;
    let stats = state.db.stats(now).await?;
    Ok(Json(StatsBody {
        total_users: stats.total_users,
        active_subscriptions: stats.active_subscriptions,
        live_keys: stats.live_keys,
        open_tickets: stats.open_tickets,
    }))
}

#[derive(Serialize)]
pub struct UserBody {
    pub id: i64,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub balance: i64,
    pub subscription_end: Option<i64>,
    pub country: Option<String>,
    pub referred_by: Option<i64>,
    pub ad_ref_id: Option<String>,
    pub created_at: i64,
}

impl From<db::User> for UserBody {
    fn from(user: db::User) -> Self {
        Self {
            id: user.id,
            telegram_id: user.telegram_id,
            username: user.username,
            balance: user.balance,
            subscription_end: user.subscription_end,
            country: user.country,
            referred_by: user.referred_by,
            ad_ref_id: user.ad_ref_id,
            created_at: user.created_at,
        }
    }
}

pub async fn list_users(State(state): State<Arc<ApiState>>) -> ApiResult<Json<Vec<UserBody>>> {
    let users = state.db.list_users().await?;
    Ok(Json(users.into_iter().map(UserBody::from).collect()))
}

#[derive(Deserialize)]
pub struct PatchUser {
    pub subscription_end: Option<i64>,
}

pub async fn patch_user(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(body): Json<PatchUser>,
) -> ApiResult<Response> {
    match state.db.set_subscription_end(id, body.subscription_end).await? {
        Some(user) => Ok(Json(UserBody::from(user)).into_response()),
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

#[derive(Serialize)]
pub struct ServerBody {
    pub id: i64,
    pub name: String,
    pub country: String,
    pub status: String,
    pub api_url: String,
    pub cert_sha256: String,
    pub max_keys: i64,
    pub live_keys: i64,
    pub created_at: i64,
}

pub async fn list_servers(State(state): State<Arc<ApiState>>) -> ApiResult<Json<Vec<ServerBody>>> {
    let servers = state.db.list_servers().await?;
    let mut out = Vec::with_capacity(servers.len());
    for server in servers {
        let live_keys = state.db.count_keys_on_server(server.id).await?;
        out.push(ServerBody {
            id: server.id,
            name: server.name,
            country: server.country,
            status: server.status,
            api_url: server.api_url,
            cert_sha256: server.cert_sha256,
            max_keys: server.max_keys,
            live_keys,
            created_at: server.created_at,
        });
    }
    Ok(Json(out))
}

#[derive(Deserialize)]
pub struct ServerInput {
    pub name: String,
    pub country: String,
    #[serde(default = "default_server_status")]
    pub status: String,
    pub api_url: String,
    pub cert_sha256: String,
    #[serde(default = "default_max_keys")]
    pub max_keys: i64,
}

fn default_server_status() -> String {
    db::SERVER_ONLINE.to_string()
}

fn default_max_keys() -> i64 {
    100
}

pub async fn create_server(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<ServerInput>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let server = state
        .db
        .create_server(
            &body.name,
            &body.country,
            &body.status,
            &body.api_url,
            &body.cert_sha256,
            body.max_keys,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": server.id }))))
}

pub async fn update_server(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(body): Json<ServerInput>,
) -> ApiResult<StatusCode> {
    let updated = state
        .db
        .update_server(
            id,
            &body.name,
            &body.country,
            &body.status,
            &body.api_url,
            &body.cert_sha256,
            body.max_keys,
        )
        .await?;
    Ok(if updated.is_some() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    })
}

pub async fn delete_server(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    Ok(if state.db.delete_server(id).await? {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    })
}

#[derive(Serialize)]
pub struct KeyBody {
    pub id: i64,
    pub user_id: i64,
    pub server_id: i64,
    pub outline_key_id: String,
    pub access_url: String,
    pub created_at: i64,
}

pub async fn list_keys(State(state): State<Arc<ApiState>>) -> ApiResult<Json<Vec<KeyBody>>> {
    let keys = state.db.list_keys().await?;
    Ok(Json(
        keys.into_iter()
            .map(|key| KeyBody {
                id: key.id,
                user_id: key.user_id,
                server_id: key.server_id,
                outline_key_id: key.outline_key_id,
                access_url: key.access_url,
                created_at: key.created_at,
            })
            .collect(),
    ))
}

#[derive(Serialize)]
pub struct PromoBody {
    pub id: i64,
    pub code: String,
    pub days: i64,
    pub max_uses: Option<i64>,
    pub expires_at: Option<i64>,
    pub used_count: i64,
    pub is_active: bool,
    pub is_auto_generated: bool,
    pub created_at: i64,
}

impl From<db::PromoCode> for PromoBody {
    fn from(promo: db::PromoCode) -> Self {
        Self {
            id: promo.id,
            code: promo.code,
            days: promo.days,
            max_uses: promo.max_uses,
            expires_at: promo.expires_at,
            used_count: promo.used_count,
            is_active: promo.is_active,
            is_auto_generated: promo.is_auto_generated,
            created_at: promo.created_at,
        }
    }
}

pub async fn list_promos(State(state): State<Arc<ApiState>>) -> ApiResult<Json<Vec<PromoBody>>> {
    let promos = state.db.list_promos().await?;
    Ok(Json(promos.into_iter().map(PromoBody::from).collect()))
}

#[derive(Deserialize)]
pub struct PromoInput {
    pub code: String,
    pub days: i64,
    pub max_uses: Option<i64>,
    pub expires_at: Option<i64>,
}

pub async fn create_promo(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<PromoInput>,
) -> ApiResult<(StatusCode, Json<PromoBody>)> {
    let promo = state
        .db
        .create_promo(&body.code, body.days, body.max_uses, body.expires_at)
        .await?;
    Ok((StatusCode::CREATED, Json(PromoBody::from(promo))))
}

#[derive(Deserialize)]
pub struct PatchPromo {
    pub is_active: bool,
}

pub async fn patch_promo(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(body): Json<PatchPromo>,
) -> ApiResult<StatusCode> {
    Ok(if state.db.set_promo_active(id, body.is_active).await? {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    })
}

pub async fn delete_promo(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    Ok(if state.db.delete_promo(id).await? {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    })
}

#[derive(Serialize)]
pub struct TemplateBody {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub created_at: i64,
}

pub async fn list_templates(
    State(state): State<Arc<ApiState>>,
) -> ApiResult<Json<Vec<TemplateBody>>> {
    let templates = state.db.list_templates().await?;
    Ok(Json(
        templates
            .into_iter()
            .map(|t| TemplateBody {
                id: t.id,
                title: t.title,
                content: t.content,
                created_at: t.created_at,
            })
            .collect(),
    ))
}

#[derive(Deserialize)]
pub struct TemplateInput {
    pub title: String,
    pub content: String,
}

pub async fn create_template(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<TemplateInput>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let template = state.db.create_template(&body.title, &body.content).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": template.id }))))
}

pub async fn delete_template(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    Ok(if state.db.delete_template(id).await? {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    })
}

#[derive(Serialize)]
pub struct BroadcastBody {
    pub id: i64,
    pub message: String,
    pub scheduled_at: i64,
    pub user_ids: Option<String>,
    pub status: String,
    pub error: Option<String>,
    pub created_at: i64,
}

pub async fn list_broadcasts(
    State(state): State<Arc<ApiState>>,
) -> ApiResult<Json<Vec<BroadcastBody>>> {
    let broadcasts = state.db.list_scheduled_broadcasts().await?;
    Ok(Json(
        broadcasts
            .into_iter()
            .map(|b| BroadcastBody {
                id: b.id,
                message: b.message,
                scheduled_at: b.scheduled_at,
                user_ids: b.user_ids,
                status: b.status,
                error: b.error,
                created_at: b.created_at,
            })
            .collect(),
    ))
}

#[derive(Deserialize)]
pub struct BroadcastInput {
    pub message: String,
    /// Отсутствие поля — отправить немедленно ближайшим проходом.
    pub scheduled_at: Option<i64>,
    pub user_ids: Option<Vec<i64>>,
}

pub async fn create_broadcast(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<BroadcastInput>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let scheduled_at = match body.scheduled_at {
        Some(at) => at,
        None => db::current_unix_timestamp()?,
    };
    let broadcast = state
        .db
        .create_scheduled_broadcast(&body.message, scheduled_at, body.user_ids.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": broadcast.id }))))
}

pub async fn delete_broadcast(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    Ok(if state.db.delete_scheduled_broadcast(id).await? {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    })
}

#[derive(Serialize)]
pub struct TicketBody {
    pub id: i64,
    pub user_id: i64,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub question: String,
    pub answer: Option<String>,
    pub status: String,
    pub created_at: i64,
    pub answered_at: Option<i64>,
}

pub async fn list_tickets(State(state): State<Arc<ApiState>>) -> ApiResult<Json<Vec<TicketBody>>> {
    let tickets = state.db.list_tickets().await?;
    Ok(Json(
        tickets
            .into_iter()
            .map(|t| TicketBody {
                id: t.id,
                user_id: t.user_id,
                telegram_id: t.telegram_id,
                username: t.username,
                question: t.question,
                answer: t.answer,
                status: t.status,
                created_at: t.created_at,
                answered_at: t.answered_at,
            })
            .collect(),
    ))
}

#[derive(Deserialize)]
pub struct TicketAnswer {
    pub answer: String,
}

/// Сохраняет ответ и доставляет его пользователю через бота.
pub async fn answer_ticket(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(body): Json<TicketAnswer>,
) -> ApiResult<StatusCode> {
    let Some((telegram_id, question)) = state.db.answer_ticket(id, &body.answer).await? else {
        return Ok(StatusCode::NOT_FOUND);
    };
    let text = format!(
        "📩 Ответ поддержки на ваш вопрос:\n\n«{}»\n\n{}",
        question, body.answer
    );
    if let Err(err) = state.bot.send_message(ChatId(telegram_id), text).await {
        tracing::warn!(ticket_id = id, telegram_id, error = %err, "Ответ сохранён, но не доставлен в Telegram");
    }
    Ok(StatusCode::OK)
}

pub async fn delete_ticket(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    Ok(if state.db.delete_ticket(id).await? {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    })
}

#[derive(Serialize)]
pub struct AdRefLinkBody {
    pub id: i64,
    pub referrer_id: String,
    pub short_id: String,
    pub name: String,
    pub clicks: i64,
    pub registrations: i64,
    pub paid: i64,
    pub created_at: i64,
}

impl From<db::AdRefLink> for AdRefLinkBody {
    fn from(link: db::AdRefLink) -> Self {
        Self {
            id: link.id,
            referrer_id: link.referrer_id,
            short_id: link.short_id,
            name: link.name,
            clicks: link.clicks,
            registrations: link.registrations,
            paid: link.paid,
            created_at: link.created_at,
        }
    }
}

pub async fn list_ad_ref_links(
    State(state): State<Arc<ApiState>>,
) -> ApiResult<Json<Vec<AdRefLinkBody>>> {
    let links = state.db.list_ad_ref_links().await?;
    Ok(Json(links.into_iter().map(AdRefLinkBody::from).collect()))
}

#[derive(Deserialize)]
pub struct AdRefLinkInput {
    pub name: String,
}

pub async fn create_ad_ref_link(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<AdRefLinkInput>,
) -> ApiResult<(StatusCode, Json<AdRefLinkBody>)> {
    let link = state.db.create_ad_ref_link(&body.name).await?;
    Ok((StatusCode::CREATED, Json(AdRefLinkBody::from(link))))
}

pub async fn delete_ad_ref_link(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    Ok(if state.db.delete_ad_ref_link(id).await? {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    })
}

#[derive(Deserialize)]
pub struct TopQuery {
    #[serde(default = "default_top_limit")]
    pub limit: i64,
}

fn default_top_limit() -> i64 {
    20
}

#[derive(Serialize)]
pub struct ReferrerBody {
    pub referrer_id: i64,
    pub username: Option<String>,
    pub total: i64,
    pub paid: i64,
}

pub async fn top_referrers(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TopQuery>,
) -> ApiResult<Json<Vec<ReferrerBody>>> {
    let now = db::current_unix_timestamp()?;
    let top = state.db.top_referrers(now, query.limit).await?;
    Ok(Json(
        top.into_iter()
            .map(|r| ReferrerBody {
                referrer_id: r.referrer_id,
                username: r.username,
                total: r.total,
                paid: r.paid,
            })
            .collect(),
    ))
}

pub async fn referred_users(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<UserBody>>> {
    let users = state.db.referred_users(id).await?;
    Ok(Json(users.into_iter().map(UserBody::from).collect()))
}
