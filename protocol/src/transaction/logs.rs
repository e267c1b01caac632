//! Reading values back out of application logs.
//!
//! The on-chain programs report results as log lines of the form
//! `prefix || value`, e.g. `ModelID:` followed by an 8-byte big-endian
//! integer. Some deployments log the integer as ASCII decimal instead;
//! [`extract_u64`] accepts both. A value of exactly 8 bytes is always read
//! as big-endian.

use super::error::ProtocolError;

/// Raw value following the first log line that starts with `prefix`.
pub fn extract_field(logs: &[Vec<u8>], prefix: &str) -> Result<Vec<u8>, ProtocolError> {
    logs.iter()
        .find_map(|line| line.strip_prefix(prefix.as_bytes()))
        .map(<[u8]>::to_vec)
        .ok_or_else(|| ProtocolError::FieldAbsent(prefix.to_string()))
}

/// Integer value: 8-byte big-endian, or ASCII decimal.
pub fn extract_u64(logs: &[Vec<u8>], prefix: &str) -> Result<u64, ProtocolError> {
    let raw = extract_field(logs, prefix)?;
    if let Ok(be) = <[u8; 8]>::try_from(raw.as_slice()) {
        return Ok(u64::from_be_bytes(be));
    }
    std::str::from_utf8(&raw)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or_else(|| ProtocolError::FieldAbsent(format!("{prefix} (malformed value)")))
}

/// UTF-8 string value.
pub fn extract_string(logs: &[Vec<u8>], prefix: &str) -> Result<String, ProtocolError> {
    String::from_utf8(extract_field(logs, prefix)?)
        .map_err(|_| ProtocolError::FieldAbsent(format!("{prefix} (not utf-8)")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LOG_PREFIX_CID, LOG_PREFIX_MODEL_ID};

    fn line(prefix: &str, value: &[u8]) -> Vec<u8> {
        let mut l = prefix.as_bytes().to_vec();
        l.extend_from_slice(value);
        l
    }

    #[test]
    fn big_endian_model_id() {
        let logs = vec![line(LOG_PREFIX_MODEL_ID, &7u64.to_be_bytes())];
        assert_eq!(extract_u64(&logs, LOG_PREFIX_MODEL_ID).unwrap(), 7);
    }

    #[test]
    fn ascii_model_id() {
        let logs = vec![b"noise".to_vec(), line(LOG_PREFIX_MODEL_ID, b"12345")];
        assert_eq!(extract_u64(&logs, LOG_PREFIX_MODEL_ID).unwrap(), 12345);
    }

    #[test]
    fn first_match_wins() {
        let logs = vec![line(LOG_PREFIX_CID, b"QmA"), line(LOG_PREFIX_CID, b"QmB")];
        assert_eq!(extract_string(&logs, LOG_PREFIX_CID).unwrap(), "QmA");
    }

    #[test]
    fn missing_and_malformed_are_field_absent() {
        assert!(matches!(
            extract_u64(&[], LOG_PREFIX_MODEL_ID),
            Err(ProtocolError::FieldAbsent(_))
        ));
        let logs = vec![line(LOG_PREFIX_MODEL_ID, b"12x")];
        assert!(matches!(
            extract_u64(&logs, LOG_PREFIX_MODEL_ID),
            Err(ProtocolError::FieldAbsent(_))
        ));
    }
}
