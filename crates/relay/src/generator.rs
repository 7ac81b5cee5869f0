use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::domain::AutoReplyTone;
use storage::ConversationLine;

/// Everything the external generation capability gets to see: who it speaks
/// for, the configured tone, the latest visible conversation lines, and the
/// message being answered.
#[derive(Debug, Clone)]
pub struct ReplyContext {
    pub recipient_name: String,
    pub tone: AutoReplyTone,
    pub history: Vec<ConversationLine>,
    pub last_message: String,
}

#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, context: &ReplyContext) -> Result<String>;
}

/// Posts to a Gemini-style `generateContent` endpoint.
pub struct HttpResponseGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpResponseGenerator {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<RequestContent>,
}

#[derive(Debug, Serialize)]
struct RequestContent {
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
struct RequestPart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl ResponseGenerator for HttpResponseGenerator {
    async fn generate(&self, context: &ReplyContext) -> Result<String> {
        let request = GenerateRequest {
            contents: vec![RequestContent {
                parts: vec![RequestPart {
                    text: build_prompt(context),
                }],
            }],
        };
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .context("generation request failed")?
            .error_for_status()
            .context("generation request rejected")?;
        let body: GenerateResponse = response
            .json()
            .await
            .context("generation response unreadable")?;

        let text = body
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content.parts.into_iter().next())
            .map(|part| part.text)
            .context("generation response had no candidates")?;
        let text = text.trim().to_string();
        if text.is_empty() {
            bail!("generation response was empty");
        }
        Ok(text)
    }
}

fn tone_prompt(tone: AutoReplyTone) -> &'static str {
    match tone {
        AutoReplyTone::Friendly => {
            "You are a friendly and casual chat assistant. Be warm, conversational, and use emojis occasionally. Keep responses brief (1-3 sentences)."
        }
        AutoReplyTone::Professional => {
            "You are a professional assistant. Be formal, clear, and concise. Avoid emojis and slang. Keep responses brief (1-3 sentences)."
        }
        AutoReplyTone::Funny => {
            "You are a witty and humorous assistant. Make clever jokes and puns when appropriate. Be lighthearted and fun. Keep responses brief (1-3 sentences)."
        }
    }
}

pub(crate) fn build_prompt(context: &ReplyContext) -> String {
    let mut prompt = format!(
        "{}\n\nYou are replying on behalf of {}. They are currently away but have auto-reply enabled.",
        tone_prompt(context.tone),
        context.recipient_name
    );
    if !context.history.is_empty() {
        prompt.push_str("\n\nConversation history:\n");
        for line in &context.history {
            prompt.push_str(&format!("{}: {}\n", line.sender_name, line.text));
        }
    }
    if !context.last_message.is_empty() {
        prompt.push_str(&format!("\nThey just received: {}\n", context.last_message));
    }
    prompt.push_str("\nGenerate a brief, contextual auto-reply message:");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_carries_tone_history_and_latest_message() {
        let context = ReplyContext {
            recipient_name: "Bob".to_string(),
            tone: AutoReplyTone::Professional,
            history: vec![ConversationLine {
                sender_name: "Alice".to_string(),
                text: "are you joining the standup?".to_string(),
            }],
            last_message: "are you joining the standup?".to_string(),
        };
        let prompt = build_prompt(&context);
        assert!(prompt.contains("professional assistant"));
        assert!(prompt.contains("on behalf of Bob"));
        assert!(prompt.contains("Alice: are you joining the standup?"));
        assert!(prompt.contains("They just received"));
    }

    #[test]
    fn prompt_omits_empty_sections() {
        let context = ReplyContext {
            recipient_name: "Bob".to_string(),
            tone: AutoReplyTone::Friendly,
            history: Vec::new(),
            last_message: String::new(),
        };
        let prompt = build_prompt(&context);
        assert!(!prompt.contains("Conversation history"));
        assert!(!prompt.contains("They just received"));
    }
}
