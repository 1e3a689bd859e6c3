//! REST client for signal-cli-rest-api
//!
//! - `POST /v2/send` for probes
//! - `GET /v1/receive/<account>` for envelopes in normal/native mode
//!
//! In JSON-RPC mode receive must go through the websocket instead; the
//! service decides which path is live.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

use crate::config::SignalConfig;

#[derive(Clone)]
pub struct SignalRestClient {
    http: reqwest::Client,
    base: String,
    account: String,
}

impl SignalRestClient {
    pub fn new(cfg: &SignalConfig) -> Result<Self> {
        let Some(account) = cfg.account.clone() else {
            bail!("SIGNAL_ACCOUNT missing");
        };
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(35))
            .build()
            .context("build signal http client")?;
        Ok(Self {
            http,
            base: cfg.rest_base.trim_end_matches('/').to_string(),
            account,
        })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub async fn send_text(&self, recipient: &str, message: &str) -> Result<Value> {
        let payload = json!({
            "message": message,
            "number": self.account,
            "recipients": [recipient],
        });
        let resp = self
            .http
            .post(format!("{}/v2/send", self.base))
            .json(&payload)
            .send()
            .await
            .context("signal send request")?
            .error_for_status()
            .context("signal send status")?;
        // Response carries timestamp-ish fields; the exact shape varies by
        // signal-cli version.
        Ok(resp.json().await.context("signal send response body")?)
    }

    /// Remove-reaction frame aimed at our own probe, so the probe stays
    /// invisible in the recipient's chat.
    pub async fn send_reaction(&self, recipient: &str, target_timestamp: i64, reaction: &str) -> Result<Value> {
        let payload = json!({
            "reaction": reaction,
            "recipient": recipient,
            "target_author": self.account,
            "timestamp": target_timestamp,
            "remove": reaction.is_empty(),
        });
        let resp = self
            .http
            .post(format!("{}/v1/reactions/{}", self.base, self.account))
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await.unwrap_or(Value::Null))
    }

    /// Normal/native mode polling endpoint; returns raw envelopes.
    pub async fn receive_http_once(&self) -> Result<Vec<Value>> {
        let resp = self
            .http
            .get(format!("{}/v1/receive/{}", self.base, self.account))
            .send()
            .await
            .context("signal receive request")?
            .error_for_status()
            .context("signal receive status")?;

        let data: Value = resp.json().await.context("signal receive body")?;
        // Some versions return [], some wrap the list.
        if let Value::Array(items) = data {
            return Ok(items);
        }
        if let Some(Value::Array(items)) = data.get("messages").cloned() {
            return Ok(items);
        }
        Ok(Vec::new())
    }
}
