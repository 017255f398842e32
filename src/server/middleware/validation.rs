use crate::server::message::{ClientMessage, ProtocolError};

/// Rejects structurally valid payloads whose content cannot be routed.
///
/// A whisper needs a non-empty target and a non-empty text.
pub fn validate_message(msg: &ClientMessage) -> Result<(), ProtocolError> {
    match msg {
        ClientMessage::Whisper { to, text } if to.as_str().is_empty() || text.is_empty() => {
            Err(ProtocolError::InvalidPayload("whisper".into()))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_whisper_fields_are_invalid() {
        let no_target = ClientMessage::Whisper { to: "".into(), text: "hi".into() };
        let no_text = ClientMessage::Whisper { to: "b".into(), text: "".into() };

        assert_eq!(validate_message(&no_target).unwrap_err().to_string(), "Invalid whisper");
        assert!(validate_message(&no_text).is_err());
    }

    #[test]
    fn other_messages_pass() {
        assert!(validate_message(&ClientMessage::Share { text: "".into() }).is_ok());
        assert!(validate_message(&ClientMessage::Whisper { to: "b".into(), text: "x".into() }).is_ok());
    }
}
