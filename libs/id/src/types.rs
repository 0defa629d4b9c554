//! Typed ID definitions.

use crate::{define_id, define_key, IdError};

/// Maximum length of an upstream key, in bytes.
pub const MAX_KEY_LEN: usize = 128;

/// Validates an upstream key: non-empty, bounded, restricted charset.
pub fn validate_key(s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }

    if s.len() > MAX_KEY_LEN {
        return Err(IdError::TooLong {
            len: s.len(),
            max: MAX_KEY_LEN,
        });
    }

    if let Some(ch) = s
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')))
    {
        return Err(IdError::InvalidCharacter { ch });
    }

    Ok(())
}

// =============================================================================
// Minted by this system
// =============================================================================

define_id!(AllocationId, "alloc");
define_id!(AttemptId, "att");
define_id!(CommitmentId, "cmt");

// =============================================================================
// Assigned upstream
// =============================================================================

define_key!(PoolId);
define_key!(RequesterId);
define_key!(ReservationId);

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_attempt_id_roundtrip() {
        let id = AttemptId::new();
        let s = id.to_string();
        let parsed: AttemptId = s.parse().unwrap();
        assert_eq!(id, parsed);
        assert!(s.starts_with("att_"));
    }

    #[test]
    fn test_commitment_id_invalid_prefix() {
        let result: Result<CommitmentId, _> = "att_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            IdError::InvalidPrefix { expected: "cmt", .. }
        ));
    }

    #[test]
    fn test_allocation_id_missing_separator() {
        let result: Result<AllocationId, _> = "alloc01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result.unwrap_err(), IdError::MissingSeparator));
    }

    #[test]
    fn test_minted_id_invalid_ulid() {
        let result: Result<AttemptId, _> = "att_invalid".parse();
        assert!(matches!(result.unwrap_err(), IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_minted_id_json_is_string() {
        let id = CommitmentId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: CommitmentId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_attempt_ids_sortable() {
        let id1 = AttemptId::new();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let id2 = AttemptId::new();
        assert!(id1 < id2);
    }

    #[test]
    fn test_pool_key_accepts_upstream_formats() {
        assert_eq!(PoolId::parse("lot_001").unwrap().as_str(), "lot_001");
        assert!(ReservationId::parse("resv-1718000000000").is_ok());
        assert!(RequesterId::parse("user:42").is_ok());
    }

    #[test]
    fn test_key_rejects_empty_and_whitespace() {
        assert!(PoolId::parse("").unwrap_err().is_empty());
        assert!(matches!(
            PoolId::parse("lot 1").unwrap_err(),
            IdError::InvalidCharacter { ch: ' ' }
        ));
    }

    #[test]
    fn test_key_rejects_overlong() {
        let long = "a".repeat(MAX_KEY_LEN + 1);
        let err = RequesterId::parse(&long).unwrap_err();
        assert!(matches!(err, IdError::TooLong { .. }));
        assert!(err.is_key_error());
    }

    #[test]
    fn test_key_deserialize_validates() {
        let ok: PoolId = serde_json::from_str("\"lot_002\"").unwrap();
        assert_eq!(ok.to_string(), "lot_002");
        assert!(serde_json::from_str::<PoolId>("\"bad/key\"").is_err());
    }

    #[test]
    fn test_all_id_prefixes_unique() {
        let prefixes = [AllocationId::PREFIX, AttemptId::PREFIX, CommitmentId::PREFIX];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len(), "Duplicate ID prefixes found!");
    }

    proptest! {
        #[test]
        fn prop_valid_keys_parse(s in "[A-Za-z0-9_.:-]{1,128}") {
            let key = PoolId::parse(&s).unwrap();
            prop_assert_eq!(key.as_str(), s.as_str());
        }
    }
}
