//! Клиент management-API Outline-серверов.
//!
//! Управляющий endpoint Outline работает на самоподписанном сертификате,
//! который идентифицируется SHA-256-отпечатком из конфигурации сервера,
//! поэтому стандартная проверка TLS отключена. Каждый вызов адресуется
//! параметрами конкретного сервера и ограничен таймаутом.

use crate::db::Server;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum OutlineError {
    #[error("Сервер Outline недоступен: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Сервер Outline ответил статусом {0}")]
    Status(reqwest::StatusCode),
}

/// Ключ, выданный сервером Outline.
#[derive(Debug, Clone, Deserialize)]
pub struct IssuedKey {
    pub id: String,
    #[serde(rename = "accessUrl")]
    pub access_url: String,
}

/// Шов для тестов: провижининг и ревизия работают через этот трейт,
/// а не напрямую через HTTP.
#[async_trait]
pub trait KeyApi: Send + Sync {
    async fn create_key(&self, server: &Server) -> Result<IssuedKey, OutlineError>;
    async fn delete_key(&self, server: &Server, key_id: &str) -> Result<(), OutlineError>;
}

pub struct OutlineApi {
    client: reqwest::Client,
}

impl OutlineApi {
    pub fn new() -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| anyhow::anyhow!("Не удалось создать HTTP-клиент Outline: {}", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl KeyApi for OutlineApi {
    async fn create_key(&self, server: &Server) -> Result<IssuedKey, OutlineError> {
        let url = format!("{}/access-keys", server.api_url.trim_end_matches('/'));
        let response = self.client.post(&url).send().await?;
        if !response.status().is_success() {
            return Err(OutlineError::Status(response.status()));
        }
        let key = response.json::<IssuedKey>().await?;
        Ok(key)
    }

    async fn delete_key(&self, server: &Server, key_id: &str) -> Result<(), OutlineError> {
        let url = format!(
            "{}/access-keys/{}",
            server.api_url.trim_end_matches('/'),
            key_id
        );
        let response = self.client.delete(&url).send().await?;
        // 404 — ключ уже удалён на сервере, считаем успехом.
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(OutlineError::Status(response.status()));
        }
        Ok(())
    }
}
