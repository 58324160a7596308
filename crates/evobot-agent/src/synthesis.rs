// ABOUTME: The synthesis capability that turns a collected transcript into draft event fields.
// ABOUTME: Also holds the reply parsing shared by providers: JSON extraction and lenient field coercion.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use evobot_core::DraftFields;
use evobot_core::event::parse_datetime;
use serde_json::Value;
use thiserror::Error;

/// Instructions sent ahead of the transcript.
pub const SYSTEM_PROMPT: &str = "You are EvolutionBOT and you help organise a guild event. \
From the conversation below, reply with ONLY a strict JSON object with the keys: \
name, description, start_time, end_time, location, max_slots. \
Dates use the format DD/MM/YYYY HH:MM. Use null for any missing information.";

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("rate limited")]
    RateLimited,
}

/// Produces draft fields from a transcript of user messages.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, transcript: &[String]) -> Result<DraftFields, SynthesisError>;

    /// Provider name for logging (e.g. "openai").
    fn provider_name(&self) -> &str;
}

/// The user-facing part of the prompt: the transcript, one message per line.
pub fn transcript_prompt(transcript: &[String]) -> String {
    format!("TRANSCRIPT:\n{}", transcript.join("\n"))
}

/// The text between the first `{` and the last `}`, if any.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Parse a model reply into draft fields. Numbers given as strings are
/// accepted for `max_slots`; anything else unusable there becomes `None`.
pub fn fields_from_reply(reply: &str) -> Result<DraftFields, SynthesisError> {
    let raw = extract_json(reply)
        .ok_or_else(|| SynthesisError::InvalidResponse("no JSON object in reply".to_string()))?;
    let mut value: Value =
        serde_json::from_str(raw).map_err(|e| SynthesisError::InvalidResponse(e.to_string()))?;

    let object = value
        .as_object_mut()
        .ok_or_else(|| SynthesisError::InvalidResponse("reply is not a JSON object".to_string()))?;

    let slots = object.get("max_slots").and_then(|slots| match slots {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    });
    object.insert(
        "max_slots".to_string(),
        slots
            .and_then(|n| u32::try_from(n).ok())
            .map_or(Value::Null, Value::from),
    );

    for key in ["name", "description", "start_time", "end_time", "location"] {
        if let Some(field) = object.get_mut(key)
            && !matches!(field, Value::String(_) | Value::Null)
        {
            *field = Value::String(field.to_string());
        }
    }

    serde_json::from_value(value).map_err(|e| SynthesisError::InvalidResponse(e.to_string()))
}

/// First `DD/MM/YYYY HH:MM` date written anywhere in the transcript. Used when
/// the synthesized start lands too close to now.
pub fn date_in_transcript(transcript: &[String], offset: FixedOffset) -> Option<DateTime<Utc>> {
    transcript.iter().find_map(|line| {
        let words: Vec<&str> = line.split_whitespace().collect();
        words.iter().enumerate().find_map(|(i, word)| {
            let day = word.trim_matches(|c: char| !c.is_ascii_digit() && c != '/');
            if day.matches('/').count() != 2 {
                return None;
            }
            // The time may follow directly or after a connector ("à", "at").
            words.iter().skip(i + 1).take(2).find_map(|next| {
                let time = next
                    .trim_matches(|c: char| !c.is_ascii_digit() && c != ':' && c != 'h')
                    .replace('h', ":");
                parse_datetime(&format!("{day} {time}"), offset)
            })
        })
    })
}
