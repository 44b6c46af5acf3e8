//! Cloud messaging API channel (graph-style `/{phone_number_id}/messages`).

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::channels::{Channel, SendMessage};

pub struct CloudChannel {
    client: reqwest::Client,
    api_url: String,
    phone_number_id: String,
    access_token: String,
}

impl CloudChannel {
    pub fn new(api_url: &str, phone_number_id: &str, access_token: &str) -> Result<Self> {
        let api_url = api_url.trim().trim_end_matches('/').to_string();
        if api_url.is_empty() {
            anyhow::bail!("cloud channel API URL is empty");
        }
        let phone_number_id = phone_number_id.trim().to_string();
        if phone_number_id.is_empty() {
            anyhow::bail!("cloud channel phone number id is empty");
        }
        let access_token = access_token.trim().to_string();
        if access_token.is_empty() {
            anyhow::bail!("cloud channel access token is empty");
        }
        Ok(Self {
            client: reqwest::Client::new(),
            api_url,
            phone_number_id,
            access_token,
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/{}/messages", self.api_url, self.phone_number_id)
    }
}

#[async_trait]
impl Channel for CloudChannel {
    fn name(&self) -> &str {
        "cloud"
    }

    async fn send(&self, message: &SendMessage) -> anyhow::Result<()> {
        let payload = serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": message.recipient,
            "type": "text",
            "text": {"body": message.content},
        });

        let resp = self
            .client
            .post(self.messages_url())
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await
            .context("cloud channel send request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("cloud channel send failed ({status}): {}", body.trim());
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/{}", self.api_url, self.phone_number_id);
        self.client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map(|resp| resp.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn send_posts_text_payload_with_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pn-42/messages"))
            .and(header("authorization", "Bearer token-1"))
            .and(body_partial_json(serde_json::json!({
                "messaging_product": "whatsapp",
                "to": "4915123456789",
                "text": {"body": "please slow down"},
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [{"id": "wamid.out1"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let channel = CloudChannel::new(&server.uri(), "pn-42", "token-1").unwrap();
        channel
            .send(&SendMessage::new("please slow down", "4915123456789"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn send_surfaces_provider_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pn-42/messages"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .mount(&server)
            .await;

        let channel = CloudChannel::new(&server.uri(), "pn-42", "token-1").unwrap();
        let err = channel
            .send(&SendMessage::new("hello", "49151"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("401"));
    }

    #[test]
    fn constructor_rejects_blank_settings() {
        assert!(CloudChannel::new("", "pn", "token").is_err());
        assert!(CloudChannel::new("https://graph.example.com", " ", "token").is_err());
        assert!(CloudChannel::new("https://graph.example.com", "pn", "").is_err());
    }
}
