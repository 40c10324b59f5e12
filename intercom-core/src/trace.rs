use sha1::{Digest, Sha1};

/// Stable trace id for one inbound message: 40-char hex sha1 of
/// `chat_jid + ":" + external_message_id`. Used to key the receipt,
/// attempt, and dead-letter rows for that message.
pub fn trace_id(chat_jid: &str, external_message_id: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(chat_jid.as_bytes());
    hasher.update(b":");
    hasher.update(external_message_id.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_and_forty_hex_chars() {
        let id = trace_id("tg:12345", "m-1");
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, trace_id("tg:12345", "m-1"));
    }

    #[test]
    fn distinct_inputs_differ() {
        assert_ne!(trace_id("tg:1", "m-1"), trace_id("tg:2", "m-1"));
        assert_ne!(trace_id("tg:1", "m-1"), trace_id("tg:1", "m-2"));
    }
}
