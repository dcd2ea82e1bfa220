//! Run identifiers and deterministic content fingerprints.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generates a time-ordered run identifier.
#[must_use]
pub fn generate_run_id() -> Uuid {
    Uuid::now_v7()
}

/// Hashes the canonical JSON form of a value.
///
/// Rows are ordered maps, so equal rows always hash equally.
#[must_use]
pub fn content_fingerprint<T: serde::Serialize + ?Sized>(value: &T) -> String {
    let json = serde_json::to_string(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_id_is_v7() {
        assert_eq!(generate_run_id().get_version_num(), 7);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = content_fingerprint(&json!({"station_id": "S1", "temp": 5.2}));
        let b = content_fingerprint(&json!({"temp": 5.2, "station_id": "S1"}));
        let c = content_fingerprint(&json!({"station_id": "S2", "temp": 5.2}));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }
}
