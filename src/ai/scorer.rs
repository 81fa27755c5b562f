use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{Enrichment, ImpactScore, Tag};

const CLAUDE_API_URL: &str = "https://api.anthropic.com/v1/messages";
const MAX_SUMMARY_CHARS: usize = 150;
const MAX_TAGS: usize = 5;
const MAX_ABSTRACT_CHARS: usize = 10_000;

/// Rates a paper and produces its one-line summary and tags.
#[async_trait]
pub trait PaperScorer: Send + Sync {
    async fn score(&self, title: &str, abstract_text: &str) -> Result<Enrichment>;

    fn model_version(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct MessageRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
    system: Option<String>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    text: Option<String>,
}

pub struct ClaudeScorer {
    client: Client,
    api_key: String,
    model: String,
}

impl ClaudeScorer {
    pub fn new(api_key: String, model: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            api_key,
            model,
        })
    }
}

#[async_trait]
impl PaperScorer for ClaudeScorer {
    async fn score(&self, title: &str, abstract_text: &str) -> Result<Enrichment> {
        let system_prompt = "You rate computer science research papers. Reply with JSON only.";

        let abstract_text: String = abstract_text.chars().take(MAX_ABSTRACT_CHARS).collect();

        let request = MessageRequest {
            model: self.model.clone(),
            max_tokens: 512,
            messages: vec![Message {
                role: "user".to_string(),
                content: scoring_prompt(title, &abstract_text),
            }],
            system: Some(system_prompt.to_string()),
        };

        let response = self
            .client
            .post(CLAUDE_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(AppError::ClaudeApi(format!("API error: {}", error_text)));
        }

        let message_response: MessageResponse = response.json().await?;

        let text = message_response
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("\n");

        parse_enrichment(&text)
    }

    fn model_version(&self) -> &str {
        &self.model
    }
}

fn scoring_prompt(title: &str, abstract_text: &str) -> String {
    let vocabulary = Tag::ALL
        .iter()
        .map(|t| format!("\"{}\"", t))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"Analyze this research paper and provide a JSON response with the following fields:

Title: {title}

Abstract: {abstract_text}

Provide:
1. "score": An integer from 1-10 indicating the paper's potential impact and significance
   - 10: Groundbreaking, likely to change the field
   - 8-9: Very significant contribution with novel insights
   - 6-7: Solid work with notable contributions
   - 4-5: Incremental improvement or niche application
   - 1-3: Limited novelty or impact

2. "tldr": A single concise sentence (max {MAX_SUMMARY_CHARS} chars) summarizing the key contribution

3. "tags": An array of 2-{MAX_TAGS} relevant category tags from this list:
   [{vocabulary}]

Return ONLY valid JSON in this exact format:
{{"score": <number>, "tldr": "<string>", "tags": [<strings>]}}"#
    )
}

#[derive(Debug, Deserialize)]
struct ScoreReply {
    score: Option<serde_json::Value>,
    tldr: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

/// Validates the model's reply. Anything missing or out of range is an
/// error; the caller defers the paper rather than storing a guess.
pub fn parse_enrichment(text: &str) -> Result<Enrichment> {
    let json = extract_json(text)
        .ok_or_else(|| AppError::MalformedLlm(format!("no JSON object in reply: {}", text)))?;
    let reply: ScoreReply = serde_json::from_str(&json)
        .map_err(|e| AppError::MalformedLlm(format!("invalid JSON ({}): {}", e, json)))?;

    let raw_score = reply
        .score
        .ok_or_else(|| AppError::MalformedLlm("missing score".to_string()))?;
    let score = score_value(&raw_score)
        .ok_or_else(|| AppError::MalformedLlm(format!("score is not an integer: {}", raw_score)))?;
    let score = ImpactScore::new(score)
        .map_err(|_| AppError::MalformedLlm(format!("score {} out of range", score)))?;

    let summary = reply
        .tldr
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::MalformedLlm("missing tldr".to_string()))?;
    let summary = truncate_chars(&summary, MAX_SUMMARY_CHARS);

    let mut tags: Vec<Tag> = Vec::new();
    for raw in &reply.tags {
        match raw.parse::<Tag>() {
            Ok(tag) if !tags.contains(&tag) => tags.push(tag),
            Ok(_) => {}
            Err(_) => tracing::debug!("Dropping unknown tag {:?}", raw),
        }
    }
    tags.truncate(MAX_TAGS);
    if tags.is_empty() {
        tags.push(Tag::Other);
    }

    Ok(Enrichment {
        score,
        summary,
        tags,
    })
}

fn extract_json(text: &str) -> Option<String> {
    let fenced = Regex::new(r"(?s)```(?:json)?\s*(.*?)```").ok()?;
    if let Some(body) = fenced.captures(text).and_then(|cap| cap.get(1)) {
        return Some(body.as_str().trim().to_string());
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| text[start..=end].to_string())
}

fn score_value(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max - 1).collect();
    truncated.push('…');
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json_reply() {
        let enrichment = parse_enrichment(
            r#"{"score": 8, "tldr": "A faster tokenizer.", "tags": ["NLP", "LLM"]}"#,
        )
        .unwrap();
        assert_eq!(enrichment.score.get(), 8);
        assert_eq!(enrichment.summary, "A faster tokenizer.");
        assert_eq!(enrichment.tags, vec![Tag::Nlp, Tag::Llm]);
    }

    #[test]
    fn parses_fenced_json_with_chatter() {
        let reply = "Here is the analysis:\n```json\n{\"score\": \"9\", \"tldr\": \"New RL method.\", \"tags\": [\"rl\", \"Robotics\"]}\n```\nHope this helps.";
        let enrichment = parse_enrichment(reply).unwrap();
        assert_eq!(enrichment.score.get(), 9);
        assert_eq!(enrichment.tags, vec![Tag::Rl, Tag::Robotics]);
    }

    #[test]
    fn out_of_range_score_is_malformed() {
        for reply in [
            r#"{"score": 11, "tldr": "x", "tags": []}"#,
            r#"{"score": 0, "tldr": "x", "tags": []}"#,
            r#"{"score": 7.5, "tldr": "x", "tags": []}"#,
        ] {
            assert!(matches!(parse_enrichment(reply), Err(AppError::MalformedLlm(_))), "{}", reply);
        }
    }

    #[test]
    fn missing_fields_are_malformed() {
        assert!(matches!(
            parse_enrichment(r#"{"tldr": "x", "tags": ["ML"]}"#),
            Err(AppError::MalformedLlm(_))
        ));
        assert!(matches!(
            parse_enrichment(r#"{"score": 5, "tldr": "  ", "tags": ["ML"]}"#),
            Err(AppError::MalformedLlm(_))
        ));
        assert!(matches!(
            parse_enrichment("I cannot rate this paper."),
            Err(AppError::MalformedLlm(_))
        ));
    }

    #[test]
    fn unknown_and_duplicate_tags_are_dropped() {
        let enrichment =
            parse_enrichment(r#"{"score": 5, "tldr": "x", "tags": ["Biology", "ML", "ml"]}"#).unwrap();
        assert_eq!(enrichment.tags, vec![Tag::Ml]);

        let enrichment = parse_enrichment(r#"{"score": 5, "tldr": "x", "tags": ["Biology"]}"#).unwrap();
        assert_eq!(enrichment.tags, vec![Tag::Other]);

        let enrichment = parse_enrichment(
            r#"{"score": 5, "tldr": "x", "tags": ["CV", "NLP", "LLM", "RL", "ML", "Theory"]}"#,
        )
        .unwrap();
        assert_eq!(enrichment.tags.len(), MAX_TAGS);
    }

    #[test]
    fn long_summaries_are_truncated() {
        let long = "a".repeat(400);
        let reply = format!(r#"{{"score": 5, "tldr": "{}", "tags": ["ML"]}}"#, long);
        let enrichment = parse_enrichment(&reply).unwrap();
        assert_eq!(enrichment.summary.chars().count(), MAX_SUMMARY_CHARS);
        assert!(enrichment.summary.ends_with('…'));
    }

    #[test]
    fn prompt_lists_the_tag_vocabulary() {
        let prompt = scoring_prompt("T", "A");
        assert!(prompt.contains("\"Transformers\""));
        assert!(prompt.contains("Title: T"));
        assert!(prompt.contains(r#"{"score": <number>"#));
    }
}
