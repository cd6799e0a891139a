// Classification of inbound stream payloads.
//
// A mis-negotiated upstream encoder shows up as raw bytes or as a
// "string" whose characters are all control/high-byte values. Neither
// must ever reach application logic, and neither may kill the stream.

use colloquy_common::protocol::message::ChatMessage;

use crate::transport::StreamPayload;

/// Outcome of decoding one stream payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedPayload {
    /// A well-formed chat message for the application callback.
    Message(ChatMessage),
    /// Raw bytes, or text shaped like raw bytes. Dropped.
    Binary,
    /// Unparsable or content-free text. Dropped, with the reason.
    Malformed(String),
}

/// Classify a payload from the inbound stream.
pub fn decode_payload(payload: &StreamPayload) -> DecodedPayload {
    let text = match payload {
        StreamPayload::Binary(_) => return DecodedPayload::Binary,
        StreamPayload::Text(text) => text,
    };
    if looks_binary(text) {
        return DecodedPayload::Binary;
    }
    match serde_json::from_str::<ChatMessage>(text) {
        Ok(message) if message.has_content() => DecodedPayload::Message(message),
        Ok(_) => DecodedPayload::Malformed("payload names no participant and no text".to_string()),
        Err(error) => DecodedPayload::Malformed(format!("payload is not valid JSON: {error}")),
    }
}

/// Text wholly composed of control or high-byte characters (tab and
/// newline excepted) is an encoding mismatch, not a chat message.
fn looks_binary(text: &str) -> bool {
    !text.is_empty()
        && text
            .chars()
            .all(|c| matches!(c, '\u{00}'..='\u{08}' | '\u{0B}'..='\u{1F}' | '\u{7F}'..='\u{FF}'))
}
