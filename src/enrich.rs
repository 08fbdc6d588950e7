//! Summarization of a stored page through an OpenAI-compatible chat endpoint.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::{HeadingRow, LinkRow, NewInsight};
use crate::parser::ParsedPage;

pub const MAX_PROMPT_HEADINGS: usize = 20;
pub const MAX_PROMPT_LINKS: usize = 10;
pub const NO_SUMMARY: &str = "No summary available";

pub const SYSTEM_PROMPT: &str = "You are an expert content analyzer. Analyze the provided web page content and generate a concise summary, relevant tags, and key takeaways. Respond in JSON format with: summary_short (1-2 sentences), summary_long (2-4 sentences), tags (array of 3-7 keywords), key_points (array of 3-5 bullet points).";

/// Returns the raw JSON text the model produced for `prompt`.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, prompt: &str) -> Result<String>;
}

/// The parts of a page that go into the prompt.
pub struct PromptSource<'a> {
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub headings: Vec<(u8, &'a str)>,
    pub anchors: Vec<&'a str>,
}

impl<'a> PromptSource<'a> {
    pub fn from_parsed(title: &'a str, description: Option<&'a str>, parsed: &'a ParsedPage) -> Self {
        Self {
            title,
            description,
            headings: parsed
                .headings
                .iter()
                .map(|h| (h.level, h.text.as_str()))
                .collect(),
            anchors: parsed.links.iter().map(|l| l.anchor_text.as_str()).collect(),
        }
    }

    pub fn from_rows(
        title: &'a str,
        description: Option<&'a str>,
        headings: &'a [HeadingRow],
        links: &'a [LinkRow],
    ) -> Self {
        Self {
            title,
            description,
            headings: headings.iter().map(|h| (h.level, h.text.as_str())).collect(),
            anchors: links.iter().map(|l| l.anchor_text.as_str()).collect(),
        }
    }

    pub fn render(&self) -> String {
        let headings = self
            .headings
            .iter()
            .take(MAX_PROMPT_HEADINGS)
            .map(|(level, text)| format!("{} {}", "#".repeat(*level as usize), text))
            .collect::<Vec<_>>()
            .join("\n");
        let anchors = self
            .anchors
            .iter()
            .take(MAX_PROMPT_LINKS)
            .copied()
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Title: {}\n\nMeta Description: {}\n\nHeadings:\n{}\n\nTop Links:\n{}",
            self.title,
            self.description.unwrap_or("N/A"),
            headings,
            anchors
        )
    }
}

/// Validate a model reply and fill in the fallbacks.
pub fn parse_reply(content: &str) -> Result<NewInsight> {
    let reply: Value = serde_json::from_str(content).context("Summarizer reply is not valid JSON")?;
    let Value::Object(fields) = reply else {
        bail!("Summarizer reply is not a JSON object");
    };

    let text = |key: &str| {
        fields
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let list = |key: &str| -> Vec<String> {
        fields
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    Ok(NewInsight {
        summary_short: text("summary_short").unwrap_or_else(|| NO_SUMMARY.to_string()),
        summary_long: text("summary_long"),
        tags: list("tags"),
        key_points: list("key_points"),
    })
}

/// Render the prompt, call the summarizer and normalize its reply.
pub async fn enrich(summarizer: &dyn Summarizer, source: &PromptSource<'_>) -> Result<NewInsight> {
    let prompt = source.render();
    let content = summarizer.summarize(&prompt).await?;
    parse_reply(&content)
}

pub struct OpenAiSummarizer {
    client: Client,
    endpoint: String,
    model: String,
    temperature: f32,
}

impl OpenAiSummarizer {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        temperature: f32,
        timeout: Duration,
    ) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing OpenAI API key");
        anyhow::ensure!(!model.trim().is_empty(), "missing OpenAI model name");
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid OpenAI API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build OpenAI HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.to_string(),
            temperature,
        })
    }
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    async fn summarize(&self, prompt: &str) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            response_format: ResponseFormat { kind: "json_object" },
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .context("failed to call OpenAI chat completions")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            bail!("OpenAI returned {}: {}", status, text);
        }
        let parsed: ChatResponse = resp.json().await.context("failed to parse OpenAI response")?;
        content_of(parsed)
    }
}

/// First non-null message content among the returned choices.
fn content_of(response: ChatResponse) -> Result<String> {
    response
        .choices
        .into_iter()
        .find_map(|choice| choice.message.content)
        .context("OpenAI response contained no message content")
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    response_format: ResponseFormat,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::parser::parse_markdown;

    /// Replays a canned reply and records every prompt it was given.
    pub(crate) struct CannedSummarizer {
        pub reply: Result<String, String>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl CannedSummarizer {
        pub(crate) fn ok(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn failing(message: &str) -> Self {
            Self {
                reply: Err(message.to_string()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Summarizer for CannedSummarizer {
        async fn summarize(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.reply.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }

    #[test]
    fn tags_only_reply_gets_fallbacks() {
        let insight = parse_reply(r#"{"tags":["ai","tools"]}"#).unwrap();
        assert_eq!(
            insight,
            NewInsight {
                summary_short: NO_SUMMARY.into(),
                summary_long: None,
                tags: vec!["ai".into(), "tools".into()],
                key_points: vec![],
            }
        );
    }

    #[test]
    fn blank_summaries_count_as_missing() {
        let insight = parse_reply(r#"{"summary_short":"  ","summary_long":""}"#).unwrap();
        assert_eq!(insight.summary_short, NO_SUMMARY);
        assert_eq!(insight.summary_long, None);
    }

    #[test]
    fn full_reply_is_kept() {
        let insight = parse_reply(
            r#"{"summary_short":"Short.","summary_long":"Longer.","tags":["a"],"key_points":["one","two"]}"#,
        )
        .unwrap();
        assert_eq!(insight.summary_short, "Short.");
        assert_eq!(insight.summary_long.as_deref(), Some("Longer."));
        assert_eq!(insight.key_points, vec!["one", "two"]);
    }

    #[test]
    fn malformed_reply_is_an_error() {
        assert!(parse_reply("not json").is_err());
        assert!(parse_reply("[1,2]").is_err());
    }

    #[test]
    fn prompt_is_bounded_and_prefixed() {
        let mut md = String::new();
        for i in 0..25 {
            md.push_str(&format!("## H{i}\n"));
        }
        for i in 0..15 {
            md.push_str(&format!("[anchor{i}](/{i})\n"));
        }
        let parsed = parse_markdown(&md);
        let prompt = PromptSource::from_parsed("Site", None, &parsed).render();

        assert!(prompt.starts_with("Title: Site\n\nMeta Description: N/A\n\nHeadings:\n## H0\n"));
        assert!(prompt.contains("## H19\n"));
        assert!(!prompt.contains("H20"));
        assert!(prompt.contains("Top Links:\nanchor0\n"));
        assert!(prompt.ends_with("anchor9"));
        assert!(!prompt.contains("anchor10"));
    }

    #[test]
    fn chat_completion_body_yields_message_content() {
        let body = r#"{
            "id": "chatcmpl-9x1",
            "object": "chat.completion",
            "created": 1718000000,
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": "{\"summary_short\":\"A page.\",\"tags\":[\"docs\"]}" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 120, "completion_tokens": 30, "total_tokens": 150 }
        }"#;
        let response: ChatResponse = serde_json::from_str(body).unwrap();
        let content = content_of(response).unwrap();
        let insight = parse_reply(&content).unwrap();
        assert_eq!(insight.summary_short, "A page.");
        assert_eq!(insight.tags, vec!["docs"]);
    }

    #[test]
    fn chat_completion_without_content_is_an_error() {
        let response: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"index":0,"message":{"role":"assistant","content":null},"finish_reason":"length"}]}"#,
        )
        .unwrap();
        assert!(content_of(response).is_err());

        let response: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(content_of(response).is_err());
    }

    #[tokio::test]
    async fn enrich_passes_rendered_prompt() {
        let summarizer = CannedSummarizer::ok(r#"{"summary_short":"ok"}"#);
        let parsed = parse_markdown("### Deep");
        let source = PromptSource::from_parsed("T", Some("D"), &parsed);
        let insight = enrich(&summarizer, &source).await.unwrap();
        assert_eq!(insight.summary_short, "ok");
        let prompts = summarizer.prompts.lock().unwrap();
        assert!(prompts[0].contains("Meta Description: D"));
        assert!(prompts[0].contains("### Deep"));
    }

    #[tokio::test]
    async fn enrich_surfaces_upstream_failure() {
        let summarizer = CannedSummarizer::failing("OpenAI returned 500");
        let parsed = ParsedPage::default();
        let source = PromptSource::from_parsed("T", None, &parsed);
        assert!(enrich(&summarizer, &source).await.is_err());
    }
}
