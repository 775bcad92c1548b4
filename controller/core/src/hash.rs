use crate::RuleKey;
use sha2::{Digest, Sha256};

/// Computes the canonical content hash of a rule record.
///
/// The hash covers everything the agents act on — table, priority, owner
/// address, and lifecycle state — so a stored hash equal to the computed one
/// means the record needs no write at all.
pub fn content_hash(key: &RuleKey, state: &str) -> String {
    let data = format!(
        "table={}|priority={}|serviceIP={}|state={}",
        key.table, key.priority, key.owner, state
    );
    hex::encode(Sha256::digest(data.as_bytes()))
}
