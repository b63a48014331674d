//! Админский HTTP-интерфейс: axum-роутер с bearer-авторизацией.
//!
//! Публичны только /health и POST /api/ad-ref-click (счётчик кликов по
//! рекламным ссылкам); всё остальное требует статического токена из
//! конфигурации.

mod routes;

use crate::db::Db;
use axum::Router;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, patch, post, put};
use std::sync::Arc;
use std::time::Duration;
use teloxide::Bot;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct ApiState {
    pub db: Arc<Db>,
    pub bot: Bot,
    pub token: String,
}

async fn require_bearer(
    State(state): State<Arc<ApiState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token == state.token);
    if !authorized {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(request).await)
}

pub fn router(state: Arc<ApiState>) -> Router {
    let admin = Router::new()
        .route("/stats", get(routes::stats))
        .route("/users", get(routes::list_users))
        .route("/users/:id", patch(routes::patch_user))
        .route("/servers", get(routes::list_servers).post(routes::create_server))
        .route("/servers/:id", put(routes::update_server).delete(routes::delete_server))
        .route("/keys", get(routes::list_keys))
        .route("/promos", get(routes::list_promos).post(routes::create_promo))
        .route("/promos/:id", patch(routes::patch_promo).delete(routes::delete_promo))
        .route("/templates", get(routes::list_templates).post(routes::create_template))
        .route("/templates/:id", delete(routes::delete_template))
        .route(
            "/broadcasts",
            get(routes::list_broadcasts).post(routes::create_broadcast),
        )
        .route("/broadcasts/:id", delete(routes::delete_broadcast))
        .route("/tickets", get(routes::list_tickets))
        .route("/tickets/:id/answer", post(routes::answer_ticket))
        .route("/tickets/:id", delete(routes::delete_ticket))
        .route(
            "/ad-ref-links",
            get(routes::list_ad_ref_links).post(routes::create_ad_ref_link),
        )
        .route("/ad-ref-links/:id", delete(routes::delete_ad_ref_link))
        .route("/referrals/top", get(routes::top_referrers))
        .route("/referrals/:id", get(routes::referred_users))
        .layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/ad-ref-click", post(routes::ad_ref_click))
        .nest("/api/admin", admin)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(state)
}

pub async fn serve(listen_addr: &str, state: Arc<ApiState>) -> Result<(), anyhow::Error> {
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Не удалось открыть {}: {}", listen_addr, e))?;
    tracing::info!(addr = listen_addr, "Админ-API запущен");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| anyhow::anyhow!("HTTP-сервер завершился с ошибкой: {}", e))?;
    Ok(())
}
