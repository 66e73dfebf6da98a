use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::types::{Record, RecordId};

/// SHA-256 over `(id, status, updated_at)` of every record, order independent.
pub fn record_set_checksum(records: &[Record]) -> String {
    let mut rows: Vec<String> = records
        .iter()
        .map(|r| format!("{}|{}|{}", r.id, r.status, r.updated_at.to_rfc3339()))
        .collect();
    rows.sort();

    let mut hasher = Sha256::new();
    for row in &rows {
        hasher.update(row.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Stable identifier for a set of member ids.
pub fn community_fingerprint(members: &[RecordId]) -> String {
    let mut sorted: Vec<&str> = members.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    let digest = Sha256::digest(sorted.join("\n").as_bytes());
    format!("c-{}", &hex::encode(digest)[..16])
}

/// Short hex digest of arbitrary text, used for prompt references and decision ids.
pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Deterministic id for a record the engine derives from `seed`, so that a
/// dry run and a live run over the same input name new records identically.
pub fn derived_record_id(seed: &str) -> RecordId {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecordStatus;
    use chrono::{TimeZone, Utc};

    fn record(id: &str) -> Record {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        Record::new(id, "infra", "t", "b", "kim", at)
    }

    #[test]
    fn checksum_ignores_order() {
        let a = record("a");
        let b = record("b");
        assert_eq!(
            record_set_checksum(&[a.clone(), b.clone()]),
            record_set_checksum(&[b, a])
        );
    }

    #[test]
    fn checksum_tracks_status() {
        let a = record("a");
        let before = record_set_checksum(&[a.clone()]);
        let mut changed = a;
        changed.status = RecordStatus::Superseded;
        assert_ne!(before, record_set_checksum(&[changed]));
    }

    #[test]
    fn fingerprint_ignores_member_order() {
        let x = community_fingerprint(&["b".into(), "a".into()]);
        let y = community_fingerprint(&["a".into(), "b".into()]);
        assert_eq!(x, y);
        assert!(x.starts_with("c-"));
        assert_ne!(x, community_fingerprint(&["a".into(), "c".into()]));
    }

    #[test]
    fn derived_ids_are_stable() {
        assert_eq!(derived_record_id("d1:0"), derived_record_id("d1:0"));
        assert_ne!(derived_record_id("d1:0"), derived_record_id("d1:1"));
    }
}
