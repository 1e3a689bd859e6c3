//! WhatsApp Cloud (Graph) client

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

use crate::config::WhatsAppConfig;

#[derive(Clone)]
pub struct WhatsAppClient {
    http: reqwest::Client,
    graph_base: String,
    phone_number_id: String,
}

impl WhatsAppClient {
    pub fn new(cfg: &WhatsAppConfig) -> Result<Self> {
        let Some(phone_number_id) = cfg.phone_number_id.clone() else {
            bail!("WHATSAPP_PHONE_NUMBER_ID missing");
        };
        let Some(access_token) = cfg.access_token.clone() else {
            bail!("WHATSAPP_ACCESS_TOKEN missing");
        };

        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {access_token}"))
            .context("access token is not a valid header value")?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(20))
            .default_headers(headers)
            .build()
            .context("build whatsapp http client")?;

        Ok(Self {
            http,
            graph_base: cfg.graph_base.trim_end_matches('/').to_string(),
            phone_number_id,
        })
    }

    async fn post_message(&self, payload: &Value) -> Result<Value> {
        let resp = self
            .http
            .post(format!("{}/{}/messages", self.graph_base, self.phone_number_id))
            .json(payload)
            .send()
            .await
            .context("whatsapp send request")?
            .error_for_status()
            .context("whatsapp send status")?;
        Ok(resp.json().await.context("whatsapp send response body")?)
    }

    pub async fn send_text(&self, to: &str, body: &str) -> Result<Value> {
        let payload = json!({
            "messaging_product": "whatsapp",
            "to": to.trim_start_matches('+'),
            "type": "text",
            "text": { "body": body },
        });
        self.post_message(&payload).await
    }

    /// Revoke frame for a message id the recipient never saw; the platform
    /// still acks it with delivery statuses.
    pub async fn send_delete(&self, to: &str, message_id: &str) -> Result<Value> {
        let recipient = to.trim_start_matches('+');
        let payload = json!({
            "messaging_product": "whatsapp",
            "to": recipient,
            "delete": {
                "remoteJid": recipient,
                "fromMe": true,
                "id": message_id,
            },
        });
        self.post_message(&payload).await
    }
}

/// Typical shape: {"messages":[{"id":"wamid...."}]}
pub fn extract_message_id(resp: &Value) -> Option<String> {
    let msgs = resp.get("messages")?.as_array()?;
    msgs.first()?.get("id")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_wamid() {
        let resp = serde_json::json!({"messages": [{"id": "wamid.ABC=="}]});
        assert_eq!(extract_message_id(&resp).as_deref(), Some("wamid.ABC=="));
    }

    #[test]
    fn missing_id_is_none() {
        assert!(extract_message_id(&serde_json::json!({"messages": []})).is_none());
        assert!(extract_message_id(&serde_json::json!({})).is_none());
    }

    #[test]
    fn construction_requires_credentials() {
        let cfg = WhatsAppConfig {
            enabled: true,
            graph_base: "https://graph.facebook.com/v21.0".into(),
            phone_number_id: None,
            access_token: Some("token".into()),
            verify_token: None,
            app_secret: None,
        };
        assert!(WhatsAppClient::new(&cfg).is_err());
    }
}
