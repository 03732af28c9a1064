//! Raw event filtering (§4.9 bidirectional proxy): the voice model layer
//! sometimes leaks its own low-level, ALL-CAPS event types past the agent
//! and into what would otherwise be forwarded to the client. These must
//! never reach the browser.

/// The wire protocol's own message types are lowercase/camelCase
/// (`transcript`, `tool_use`, `handoff_event`, …); a type that is entirely
/// uppercase letters/underscores (`TEXT`, `AUDIO`, `CONTENT_START`, …) is a
/// raw voice-model event that slipped through and must be dropped.
pub fn is_raw_voice_event(type_field: &str) -> bool {
    !type_field.is_empty()
        && type_field.chars().all(|c| c.is_ascii_uppercase() || c == '_')
        && type_field.chars().any(|c| c.is_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uppercase_types_are_raw_events() {
        for t in ["TEXT", "AUDIO", "TOOL", "CONTENT_START", "CONTENT_END"] {
            assert!(is_raw_voice_event(t), "{t} should be filtered");
        }
    }

    #[test]
    fn wire_protocol_types_are_not_raw_events() {
        for t in ["transcript", "tool_use", "handoff_event", "decision_made", "sessionConfig"] {
            assert!(!is_raw_voice_event(t), "{t} should not be filtered");
        }
    }

    #[test]
    fn empty_type_is_not_a_raw_event() {
        assert!(!is_raw_voice_event(""));
    }
}
