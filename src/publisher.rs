/// Publisher Module
///
/// Delivers accepted text to X (Twitter) through the v2 `POST /2/tweets`
/// endpoint. A successful call creates a live post that this bot cannot take
/// back, so nothing here retries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BotError;

/// Proof that the platform accepted a post
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub post_id: String,
    pub text: String,
}

/// Receipt id used when the platform confirmed a post without naming it
pub const UNKNOWN_POST_ID: &str = "unknown";

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, text: &str) -> Result<PublishReceipt, BotError>;
}

#[derive(Debug, Serialize)]
struct CreateTweetRequest<'a> {
    text: &'a str,
}

/// Posts with a user-context OAuth 2.0 bearer token
pub struct TwitterPublisher {
    bearer_token: String,
    base_url: String,
    http_client: reqwest::Client,
}

impl TwitterPublisher {
    pub fn new(http_client: reqwest::Client, base_url: &str, bearer_token: &str) -> Self {
        Self {
            bearer_token: bearer_token.trim().to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        }
    }
}

/// Post id and echoed text from a create-post body, if present
///
/// The post is already live when this runs, so an odd body never turns into an error.
fn created_post_fields(body: &str) -> (Option<String>, Option<String>) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return (None, None);
    };
    let data = value.get("data");

    let id = match data.and_then(|d| d.get("id")) {
        Some(serde_json::Value::String(id)) if !id.is_empty() => Some(id.clone()),
        Some(serde_json::Value::Number(id)) => Some(id.to_string()),
        _ => None,
    };
    let text = data
        .and_then(|d| d.get("text"))
        .and_then(|t| t.as_str())
        .map(str::to_string);

    (id, text)
}

/// Human-readable message for a failed create-post call
fn describe_failure(status: u16, body: &str, rate_limit_reset: Option<i64>) -> String {
    match status {
        401 => format!(
            "Unauthorized (401): invalid or expired bearer token. \
            The token must be a user-context token with tweet.write scope. \
            API Response: {}",
            body
        ),
        403 => format!(
            "Forbidden (403): the platform refused this post (duplicate content, \
            missing write permission, or policy). API Response: {}",
            body
        ),
        429 => {
            let reset_info = match rate_limit_reset
                .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
            {
                Some(reset_time) => {
                    let wait_seconds = (reset_time.timestamp() - Utc::now().timestamp()).max(0);
                    format!(
                        " Rate limit resets at {} (in approximately {} seconds).",
                        reset_time.format("%Y-%m-%d %H:%M:%S UTC"),
                        wait_seconds
                    )
                }
                None => String::new(),
            };
            format!("Rate Limited (429): too many posts.{} API Response: {}", reset_info, body)
        }
        _ => format!("Twitter API error: {} - {}", status, body),
    }
}

#[async_trait]
impl Publisher for TwitterPublisher {
    async fn publish(&self, text: &str) -> Result<PublishReceipt, BotError> {
        if text.trim().is_empty() {
            return Err(BotError::Publish {
                status: 0,
                message: "refusing to publish empty text".to_string(),
            });
        }

        let response = self
            .http_client
            .post(format!("{}/2/tweets", self.base_url))
            .header("Authorization", format!("Bearer {}", self.bearer_token))
            .json(&CreateTweetRequest { text })
            .send()
            .await
            .map_err(|e| BotError::publish_transport(format!("request failed: {}", e)))?;

        let rate_limit_reset = response
            .headers()
            .get("x-rate-limit-reset")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok());

        let status = response.status();
        if status != reqwest::StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            return Err(BotError::Publish {
                status: status.as_u16(),
                message: describe_failure(status.as_u16(), &body, rate_limit_reset),
            });
        }

        let body = response.text().await.unwrap_or_default();
        let (post_id, echoed) = created_post_fields(&body);

        let post_id = match post_id {
            Some(id) => {
                log::info!("Post published with id {}", id);
                id
            }
            None => {
                log::warn!("Post published but the response carried no id: {}", body);
                UNKNOWN_POST_ID.to_string()
            }
        };

        Ok(PublishReceipt {
            post_id,
            text: echoed.unwrap_or_else(|| text.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn created_status_returns_receipt() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/2/tweets"))
            .and(header("authorization", "Bearer user-token"))
            .and(body_json(json!({"text": "Prompt engineering is a craft."})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "data": {"id": "1790000000000000000", "text": "Prompt engineering is a craft."}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let publisher = TwitterPublisher::new(reqwest::Client::new(), &server.uri(), " user-token ");
        let receipt = publisher
            .publish("Prompt engineering is a craft.")
            .await
            .unwrap();

        assert_eq!(receipt.post_id, "1790000000000000000");
        assert_eq!(receipt.text, "Prompt engineering is a craft.");
    }

    #[tokio::test]
    async fn non_created_status_is_publish_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/2/tweets"))
            .respond_with(ResponseTemplate::new(403).set_body_string(
                r#"{"detail":"You are not allowed to create a Tweet with duplicate content."}"#,
            ))
            .mount(&server)
            .await;

        let publisher = TwitterPublisher::new(reqwest::Client::new(), &server.uri(), "t");
        let err = publisher.publish("hello").await.unwrap_err();

        match err {
            BotError::Publish { status, message } => {
                assert_eq!(status, 403);
                assert!(message.contains("duplicate content"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ok_without_created_is_still_an_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"id": "1"}})))
            .mount(&server)
            .await;

        let publisher = TwitterPublisher::new(reqwest::Client::new(), &server.uri(), "t");
        let err = publisher.publish("hello").await.unwrap_err();
        assert!(matches!(err, BotError::Publish { status: 200, .. }));
    }

    #[tokio::test]
    async fn created_status_with_numeric_id_still_succeeds() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/2/tweets"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"data": {"id": 123}})))
            .mount(&server)
            .await;

        let publisher = TwitterPublisher::new(reqwest::Client::new(), &server.uri(), "t");
        let receipt = publisher.publish("hello").await.unwrap();

        assert_eq!(receipt.post_id, "123");
        assert_eq!(receipt.text, "hello");
    }

    #[tokio::test]
    async fn created_status_with_unreadable_body_still_succeeds() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/2/tweets"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let publisher = TwitterPublisher::new(reqwest::Client::new(), &server.uri(), "t");
        let receipt = publisher.publish("hello").await.unwrap();

        assert_eq!(receipt.post_id, UNKNOWN_POST_ID);
        assert_eq!(receipt.text, "hello");
    }

    #[test]
    fn created_post_fields_tolerates_odd_shapes() {
        assert_eq!(
            created_post_fields(r#"{"data":{"id":"42","text":"hi"}}"#),
            (Some("42".to_string()), Some("hi".to_string()))
        );
        assert_eq!(created_post_fields(r#"{"data":{"id":""}}"#), (None, None));
        assert_eq!(created_post_fields(r#"{"errors":[]}"#), (None, None));
        assert_eq!(created_post_fields("not json"), (None, None));
    }

    #[tokio::test]
    async fn empty_text_never_reaches_the_platform() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let publisher = TwitterPublisher::new(reqwest::Client::new(), &server.uri(), "t");
        assert!(publisher.publish("   ").await.is_err());
    }

    #[test]
    fn rate_limit_message_includes_reset_time() {
        let msg = describe_failure(429, "{}", Some(4_102_444_800));
        assert!(msg.contains("2100-01-01 00:00:00 UTC"));

        let msg = describe_failure(429, "{}", None);
        assert!(msg.starts_with("Rate Limited (429)"));
    }
}
