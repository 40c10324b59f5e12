use sha1::{Digest, Sha1};

/// Stable, non-reversible per-chat user id used for cost-ledger attribution:
/// `u_` followed by the first 16 hex chars of sha1("chat:" + jid).
pub fn stable_user_id(chat_jid: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(b"chat:");
    hasher.update(chat_jid.as_bytes());
    let digest = hasher.finalize();
    format!("u_{}", hex::encode(digest)[..16].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_and_prefixed() {
        let id = stable_user_id("tg:12345");
        assert!(id.starts_with("u_"));
        assert_eq!(id.len(), 18);
        assert_eq!(id, stable_user_id("tg:12345"));
    }

    #[test]
    fn distinct_jids_differ() {
        assert_ne!(stable_user_id("tg:1"), stable_user_id("tg:2"));
    }
}
