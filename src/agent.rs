use crate::consts::{FALLBACK_UTTERANCE, OPENAI_CHAT_URL, OPENAI_MODEL, REPLY_MAX_TOKENS};
use crate::openai_types::{OpenAIBatchResponse, OpenAIMessage, OpenAIPayload};
use crate::session::{CallSession, Speaker};

use tracing::{debug, error, warn};

/// Assemble the chat context for the next reply: a system prompt built from
/// the campaign metadata, then the in-call history as alternating
/// assistant/user messages.
pub fn build_conversation(session: &CallSession) -> Vec<OpenAIMessage> {
    let creator = session.metadata_str("creatorName").unwrap_or("the creator");
    let brand = session.metadata_str("brandName").unwrap_or("the brand");
    let objective = session
        .metadata_str("objective")
        .unwrap_or("discuss a potential collaboration");

    let mut system = format!(
        "You are a friendly outreach agent calling {creator} on behalf of {brand}. \
         Your objective: {objective}. \
         You are speaking on a live phone call. Reply with exactly one short, \
         natural spoken sentence or two. Plain text only: no markdown, no lists, \
         no stage directions."
    );
    if let Some(prior) = session.metadata_str("priorEmailSummary") {
        system.push_str(&format!(" Earlier email conversation, summarized: {prior}"));
    }

    let mut conversation = vec![OpenAIMessage {
        role: "system".to_string(),
        content: system,
    }];
    for turn in &session.history {
        let role = match turn.speaker {
            Speaker::Ai => "assistant",
            Speaker::User => "user",
        };
        conversation.push(OpenAIMessage {
            role: role.to_string(),
            content: turn.text.clone(),
        });
    }

    conversation
}

/// Produce the AI side of the next turn.  Any failure along the way (network,
/// HTTP status, response shape, empty completion) degrades to a fixed neutral
/// utterance so a transient LLM problem can never stall a live call.
pub async fn next_utterance(
    http_client: &reqwest::Client,
    openai_api_key: &str,
    session: &CallSession,
) -> String {
    let conversation = build_conversation(session);
    debug!(call_sid=%session.call_sid, messages = conversation.len(), "requesting next utterance");
    let payload = OpenAIPayload {
        model: OPENAI_MODEL.to_string(),
        messages: conversation,
        max_tokens: Some(REPLY_MAX_TOKENS),
        temperature: Some(0.7),
    };

    let resp = match http_client
        .post(OPENAI_CHAT_URL)
        .header(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {openai_api_key}"),
        )
        .json(&payload)
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            error!(error=%e, "failed to send request to OpenAI");
            return FALLBACK_UTTERANCE.to_string();
        }
    };
    if !resp.status().is_success() {
        error!(status=%resp.status(), "OpenAI returned error status");
        return FALLBACK_UTTERANCE.to_string();
    }
    let resp = match resp.json::<OpenAIBatchResponse>().await {
        Ok(resp) => resp,
        Err(e) => {
            error!(error=%e, "failed to deserialize OpenAI response");
            return FALLBACK_UTTERANCE.to_string();
        }
    };

    match resp.choices.first() {
        Some(choice) => {
            let reply = choice.message.content.trim();
            if reply.is_empty() {
                warn!("OpenAI returned an empty completion");
                FALLBACK_UTTERANCE.to_string()
            } else {
                reply.to_string()
            }
        }
        None => {
            warn!("OpenAI response contained no choices");
            FALLBACK_UTTERANCE.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CallSession;
    use serde_json::{json, Map};

    fn session_with_metadata() -> CallSession {
        let mut metadata = Map::new();
        metadata.insert("creatorName".to_string(), json!("Alex"));
        metadata.insert("brandName".to_string(), json!("Acme"));
        metadata.insert("objective".to_string(), json!("pitch a sponsored video"));
        metadata.insert(
            "priorEmailSummary".to_string(),
            json!("Alex showed interest in rates"),
        );
        let mut s = CallSession::new(
            "CA1".to_string(),
            "o-1".to_string(),
            "Hi Alex, got a minute?",
            metadata,
            None,
        );
        s.append_user_turn("Sure, what's this about?", Some(0.9));
        s
    }

    #[test]
    fn conversation_carries_campaign_context_and_history() {
        let conversation = build_conversation(&session_with_metadata());
        assert_eq!(conversation[0].role, "system");
        assert!(conversation[0].content.contains("Alex"));
        assert!(conversation[0].content.contains("Acme"));
        assert!(conversation[0].content.contains("pitch a sponsored video"));
        assert!(conversation[0].content.contains("Alex showed interest in rates"));
        assert_eq!(conversation[1].role, "assistant");
        assert_eq!(conversation[1].content, "Hi Alex, got a minute?");
        assert_eq!(conversation[2].role, "user");
        assert_eq!(conversation[2].content, "Sure, what's this about?");
    }

    #[test]
    fn conversation_defaults_when_metadata_missing() {
        let s = CallSession::new(
            "CA1".to_string(),
            "o-1".to_string(),
            "Hello?",
            Map::new(),
            None,
        );
        let conversation = build_conversation(&s);
        assert!(conversation[0].content.contains("the creator"));
        assert!(conversation[0].content.contains("the brand"));
    }

    #[tokio::test]
    async fn llm_failure_degrades_to_fallback() {
        // route the request at a closed local port so it fails immediately
        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all("http://127.0.0.1:1").unwrap())
            .build()
            .unwrap();
        let s = session_with_metadata();
        let reply = next_utterance(&client, "test-key", &s).await;
        assert_eq!(reply, FALLBACK_UTTERANCE);
    }
}
