use crate::config::Settings;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use std::time::Instant;
use url::Url;

// =============================================================================
// Request Building
// =============================================================================

pub const SYSTEM_PROMPT: &str = "请回答用户问题";

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatPayload<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    stream: bool,
}

/// One fully prepared request. Created per task invocation and dropped once
/// its metrics have been emitted.
#[derive(Debug)]
pub struct RequestAttempt {
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub started: Instant,
}

#[derive(Debug, Clone)]
pub struct RequestBuilder {
    endpoint: Url,
    model: String,
    headers: HeaderMap,
}

impl RequestBuilder {
    pub fn new(endpoint: Url, model: impl Into<String>, bearer: Option<HeaderValue>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        if let Some(bearer) = bearer {
            headers.insert(AUTHORIZATION, bearer);
        }

        Self {
            endpoint,
            model: model.into(),
            headers,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.endpoint.clone(),
            settings.model.clone(),
            settings.bearer.clone(),
        )
    }

    /// Builds the attempt and stamps its start time.
    pub fn build(&self, user_content: &str) -> Result<RequestAttempt, sonic_rs::Error> {
        let payload = ChatPayload {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: user_content,
                },
            ],
            stream: true,
        };

        Ok(RequestAttempt {
            url: self.endpoint.clone(),
            headers: self.headers.clone(),
            body: sonic_rs::to_vec(&payload)?,
            started: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct SentMessage {
        role: String,
        content: String,
    }

    #[derive(Deserialize)]
    struct SentPayload {
        model: String,
        messages: Vec<SentMessage>,
        stream: bool,
    }

    fn builder(bearer: Option<&str>) -> RequestBuilder {
        RequestBuilder::new(
            Url::parse("https://h.example/ai/x").unwrap(),
            "gpt-4o-mini",
            bearer.map(|b| HeaderValue::from_str(b).unwrap()),
        )
    }

    #[test]
    fn payload_shape() {
        let attempt = builder(None).build("你好").unwrap();
        let body: SentPayload = sonic_rs::from_slice(&attempt.body).unwrap();

        assert_eq!(body.model, "gpt-4o-mini");
        assert!(body.stream);
        assert_eq!(body.messages.len(), 2);
        assert_eq!(body.messages[0].role, "system");
        assert_eq!(body.messages[0].content, SYSTEM_PROMPT);
        assert_eq!(body.messages[1].role, "user");
        assert_eq!(body.messages[1].content, "你好");
    }

    #[test]
    fn body_keeps_non_ascii_unescaped() {
        let attempt = builder(None).build("秋天").unwrap();
        let text = String::from_utf8(attempt.body).unwrap();
        assert!(text.contains("秋天"));
    }

    #[test]
    fn headers_without_token() {
        let attempt = builder(None).build("hi").unwrap();
        assert_eq!(attempt.headers[CONTENT_TYPE], "application/json");
        assert_eq!(attempt.headers[ACCEPT], "text/event-stream");
        assert!(attempt.headers.get(AUTHORIZATION).is_none());
        assert_eq!(attempt.url.as_str(), "https://h.example/ai/x");
    }

    #[test]
    fn headers_with_token() {
        let attempt = builder(Some("Bearer sk-1")).build("hi").unwrap();
        assert_eq!(attempt.headers[AUTHORIZATION], "Bearer sk-1");
    }
}
