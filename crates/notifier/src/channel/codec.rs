//! `recipient|body` payload encoding shared by every topic.

/// Separator between the recipient and the body.
pub const DELIMITER: char = '|';

/// A decoded channel payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub recipient: String,
    pub body: String,
}

pub fn encode_payload(recipient: &str, body: &str) -> String {
    format!("{}{}{}", recipient, DELIMITER, body)
}

/// Split a payload on the first delimiter.
///
/// Returns `None` for malformed payloads: no delimiter, or a blank recipient.
/// The body keeps any further delimiters verbatim.
pub fn decode_payload(payload: &str) -> Option<Envelope> {
    let (recipient, body) = payload.split_once(DELIMITER)?;
    let recipient = recipient.trim();
    if recipient.is_empty() {
        return None;
    }

    Some(Envelope {
        recipient: recipient.to_string(),
        body: body.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_splits_on_first_delimiter() {
        let envelope = decode_payload("alice@example.com|a|b").unwrap();
        assert_eq!(envelope.recipient, "alice@example.com");
        assert_eq!(envelope.body, "a|b");
    }

    #[test]
    fn test_decode_trims_recipient_only() {
        let envelope = decode_payload("  stu1 | hello ").unwrap();
        assert_eq!(envelope.recipient, "stu1");
        assert_eq!(envelope.body, " hello ");
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert_eq!(decode_payload("no delimiter here"), None);
        assert_eq!(decode_payload(""), None);
        assert_eq!(decode_payload("   |body"), None);
    }

    #[test]
    fn test_empty_body_is_allowed() {
        let envelope = decode_payload("stu1|").unwrap();
        assert_eq!(envelope.body, "");
        assert_eq!(encode_payload("stu1", ""), "stu1|");
    }
}
