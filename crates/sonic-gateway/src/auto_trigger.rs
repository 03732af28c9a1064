//! Auto-trigger (§4.9): once a session has been handed off and its memory
//! already carries a verified identity and a known intent, the gateway
//! synthesizes a user turn so the receiving agent doesn't have to ask the
//! customer to repeat themselves.

use sonic_schema::session::SessionMemory;

/// Builds the synthetic `"I want to <userIntent>"` message, if the memory
/// is ready for it (verified identity, known intent). The intent string is
/// forwarded verbatim, not humanized.
pub fn auto_trigger_message(memory: &SessionMemory) -> Option<String> {
    if !memory.verified {
        return None;
    }
    let intent = memory.user_intent.as_ref()?;
    Some(format!("I want to {intent}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(verified: bool, intent: Option<&str>) -> SessionMemory {
        let mut m = SessionMemory::default();
        m.verified = verified;
        m.user_intent = intent.map(str::to_string);
        m
    }

    #[test]
    fn fires_when_verified_and_intent_known() {
        let m = memory(true, Some("check_balance"));
        assert_eq!(auto_trigger_message(&m).as_deref(), Some("I want to check_balance"));
    }

    #[test]
    fn does_not_fire_when_unverified() {
        let m = memory(false, Some("check_balance"));
        assert_eq!(auto_trigger_message(&m), None);
    }

    #[test]
    fn does_not_fire_without_known_intent() {
        let m = memory(true, None);
        assert_eq!(auto_trigger_message(&m), None);
    }
}
