use reqwest::{header, Client};
use serde_json::json;
use url::Url;

use budgetwatch_core::types::NotificationMessage;

use crate::ChannelError;

/// Delivers threshold notifications through an HTTP mail gateway.
///
/// The gateway accepts `{"to", "subject", "text"}` and authenticates with a
/// bearer token.
#[derive(Clone)]
pub struct EmailChannel {
    http: Client,
    gateway_url: Url,
    token: String,
}

impl EmailChannel {
    /// Creates an email channel for the provided gateway.
    pub fn new(http: Client, gateway_url: Url, token: impl Into<String>) -> Self {
        Self {
            http,
            gateway_url,
            token: token.into(),
        }
    }

    /// Sends the notification to the recipient's email address.
    pub async fn send(
        &self,
        address: &str,
        message: &NotificationMessage,
    ) -> Result<(), ChannelError> {
        let body = json!({
            "to": address,
            "subject": message.title,
            "text": message.body,
        });

        let response = self
            .http
            .post(self.gateway_url.clone())
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .json(&body)
            .send()
            .await
            .map_err(|err| ChannelError::from_reqwest(err, "email"))?;

        match ChannelError::from_status(response.status(), "email") {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
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
            threshold: ThresholdBps::new(9_000).unwrap(),
            title: "Campaign budget at 90%".to_string(),
            body: "Campaign c-1 has used 91.0% of its budget.".to_string(),
            percent_used: 91.0,
            spend_minor: 9_100,
            budget_minor: 10_000,
            occurred_at: Utc::now(),
        }
    }

    fn channel(server: &MockServer) -> EmailChannel {
        let gateway = Url::parse(&server.url("/v1/mail")).unwrap();
        EmailChannel::new(Client::new(), gateway, "gateway-token")
    }

    #[tokio::test]
    async fn posts_mail_request_with_bearer_token() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/mail")
                    .header("authorization", "Bearer gateway-token")
                    .json_body(json!({
                        "to": "alice@example.com",
                        "subject": "Campaign budget at 90%",
                        "text": "Campaign c-1 has used 91.0% of its budget.",
                    }));
                then.status(202);
            })
            .await;

        channel(&server)
            .send("alice@example.com", &message())
            .await
            .expect("delivery succeeds");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn gateway_overload_is_transient() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/mail");
                then.status(429);
            })
            .await;

        let err = channel(&server)
            .send("alice@example.com", &message())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn rejected_address_is_permanent() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/mail");
                then.status(400);
            })
            .await;

        let err = channel(&server)
            .send("not-an-address", &message())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
