//! Model marketplace client: pulls the model catalogue from the upstream
//! marketplace and upserts it by model code. The only authenticated call
//! the controller makes; a missing API key is a configuration error
//! surfaced to the caller, never a silent no-op.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use meek_core::error::MeekError;
use meek_core::ports::{ModelStore, Result};
use meek_core::types::NewModel;

#[derive(Debug, Clone, Deserialize)]
struct MarketModel {
    code: String,
    name: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    class_count: i32,
    #[serde(default)]
    classes: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct MarketCatalogue {
    #[serde(default)]
    models: Vec<MarketModel>,
}

pub struct ModelMarket {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ModelMarket {
    pub fn new(base_url: String, api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| MeekError::Internal(anyhow::anyhow!(e)))?;
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_string(), api_key })
    }

    /// Fetch the catalogue and upsert every model; returns how many were
    /// synced.
    pub async fn sync(&self, models: &Arc<dyn ModelStore>) -> Result<usize> {
        if self.api_key.is_empty() {
            return Err(MeekError::Unavailable(
                "model marketplace API key is not configured".into(),
            ));
        }
        let url = format!("{}/api/v1/models", self.base_url);
        let response = self
            .http
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| MeekError::Transport(format!("marketplace request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(MeekError::Transport(format!(
                "marketplace returned {}",
                response.status()
            )));
        }
        let catalogue: MarketCatalogue = response
            .json()
            .await
            .map_err(|e| MeekError::InvalidInput(format!("malformed marketplace payload: {e}")))?;

        let mut synced = 0;
        for m in catalogue.models {
            models
                .upsert_by_code(NewModel {
                    code: m.code,
                    name: m.name,
                    version: m.version,
                    class_count: m.class_count,
                    classes: m.classes,
                })
                .await?;
            synced += 1;
        }
        tracing::info!("synced {synced} models from the marketplace");
        Ok(synced)
    }
}
