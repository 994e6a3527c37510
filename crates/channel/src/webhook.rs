use hmac::{Hmac, Mac};
use reqwest::{header, Client};
use sha2::Sha256;
use url::Url;

use budgetwatch_core::types::NotificationMessage;

use crate::ChannelError;

/// Header carrying the HMAC-SHA256 signature of the request body.
pub const SIGNATURE_HEADER: &str = "X-Budgetwatch-Signature";

type HmacSha256 = Hmac<Sha256>;

/// Delivers threshold notifications to recipient-configured webhook URLs.
///
/// When a signing secret is configured, the JSON body is signed with
/// HMAC-SHA256 and the hex digest is sent as `sha256=<hex>` so receivers can
/// authenticate the payload.
#[derive(Clone)]
pub struct WebhookChannel {
    http: Client,
    signing_secret: Option<Vec<u8>>,
}

impl WebhookChannel {
    /// Creates a webhook channel with the provided HTTP client.
    pub fn new(http: Client, signing_secret: Option<Vec<u8>>) -> Self {
        Self {
            http,
            signing_secret,
        }
    }

    /// POSTs the notification payload to the recipient's endpoint.
    pub async fn send(
        &self,
        endpoint: &str,
        message: &NotificationMessage,
    ) -> Result<(), ChannelError> {
        let url = Url::parse(endpoint)
            .map_err(|err| ChannelError::Permanent(format!("invalid webhook url: {err}")))?;

        let body = serde_json::to_vec(message)
            .map_err(|err| ChannelError::Permanent(format!("payload serialization: {err}")))?;

        let mut request = self
            .http
            .post(url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.clone());

        if let Some(secret) = &self.signing_secret {
            request = request.header(SIGNATURE_HEADER, sign_body(secret, &body)?);
        }

        let response = request
            .send()
            .await
            .map_err(|err| ChannelError::from_reqwest(err, "webhook"))?;

        match ChannelError::from_status(response.status(), "webhook") {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

fn sign_body(secret: &[u8], body: &[u8]) -> Result<String, ChannelError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|err| ChannelError::Permanent(format!("invalid signing key: {err}")))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use budgetwatch_core::types::ThresholdBps;
    use chrono::Utc;
    use httpmock::prelude::*;

    fn message() -> NotificationMessage {
        NotificationMessage {
            campaign_id: "c-1".to_string(),
            threshold: ThresholdBps::new(8_000).unwrap(),
            title: "Campaign budget at 80%".to_string(),
            body: "details".to_string(),
            percent_used: 82.5,
            spend_minor: 8_250,
            budget_minor: 10_000,
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn delivers_signed_json_payload() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/hooks/budget")
                    .header("content-type", "application/json")
                    .header_exists(SIGNATURE_HEADER)
                    .json_body_partial(r#"{"campaign_id": "c-1", "threshold": 8000}"#);
                then.status(200);
            })
            .await;

        let channel = WebhookChannel::new(Client::new(), Some(b"secret".to_vec()));
        channel
            .send(&server.url("/hooks/budget"), &message())
            .await
            .expect("delivery succeeds");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn omits_signature_without_secret() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/hooks/budget");
                then.status(204);
            })
            .await;

        let channel = WebhookChannel::new(Client::new(), None);
        channel
            .send(&server.url("/hooks/budget"), &message())
            .await
            .expect("delivery succeeds");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/hooks/budget");
                then.status(503);
            })
            .await;

        let channel = WebhookChannel::new(Client::new(), None);
        let err = channel
            .send(&server.url("/hooks/budget"), &message())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn client_error_is_permanent() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/hooks/budget");
                then.status(410);
            })
            .await;

        let channel = WebhookChannel::new(Client::new(), None);
        let err = channel
            .send(&server.url("/hooks/budget"), &message())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn malformed_endpoint_is_permanent() {
        let channel = WebhookChannel::new(Client::new(), None);
        let err = channel.send("not a url", &message()).await.unwrap_err();
        assert!(matches!(err, ChannelError::Permanent(_)));
    }
}
