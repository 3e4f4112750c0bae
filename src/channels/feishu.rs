//! Feishu (Lark) channel adapter
//!
//! Outbound adapter over the Feishu open API using a tenant access
//! token. Inbound arrives through the platform's event subscriptions,
//! delivered by an external webhook receiver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::Channel;
use crate::{Error, Result};

const API_BASE: &str = "https://open.feishu.cn/open-apis";

/// Feishu bot adapter
pub struct FeishuChannel {
    client: reqwest::Client,
    app_id: String,
    app_secret: String,
    api_base: String,
    connected: AtomicBool,
    token: Mutex<Option<(String, Instant)>>,
}

impl FeishuChannel {
    /// Create the adapter; `token` is "app_id:app_secret"
    #[must_use]
    pub fn new(credentials: &str, api_url: Option<String>) -> Self {
        let (app_id, app_secret) = credentials
            .split_once(':')
            .map_or((credentials, ""), |(id, secret)| (id, secret));
        Self {
            client: reqwest::Client::new(),
            app_id: app_id.to_string(),
            app_secret: app_secret.to_string(),
            api_base: api_url.unwrap_or_else(|| API_BASE.to_string()),
            connected: AtomicBool::new(false),
            token: Mutex::new(None),
        }
    }

    async fn tenant_token(&self) -> Result<String> {
        {
            let cached = self
                .token
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some((token, at)) = cached.as_ref() {
                if at.elapsed().as_secs() < 30 * 60 {
                    return Ok(token.clone());
                }
            }
        }

        let response: Value = self
            .client
            .post(format!(
                "{}/auth/v3/tenant_access_token/internal",
                self.api_base
            ))
            .json(&json!({"app_id": self.app_id, "app_secret": self.app_secret}))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let token = response
            .get("tenant_access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Channel("feishu token response missing".to_string()))?
            .to_string();
        *self
            .token
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) =
            Some((token.clone(), Instant::now()));
        Ok(token)
    }
}

#[async_trait]
impl Channel for FeishuChannel {
    fn name(&self) -> &'static str {
        "feishu"
    }

    async fn connect(&self) -> Result<()> {
        self.tenant_token().await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_text(&self, chat_id: &str, text: &str, _reply_to: Option<&str>) -> Result<()> {
        let token = self.tenant_token().await?;
        self.client
            .post(format!(
                "{}/im/v1/messages?receive_id_type=chat_id",
                self.api_base
            ))
            .bearer_auth(token)
            .json(&json!({
                "receive_id": chat_id,
                "msg_type": "text",
                "content": json!({"text": text}).to_string(),
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
