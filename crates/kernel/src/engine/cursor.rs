//! Opaque pagination cursors.
//!
//! A cursor carries the sort-key tuple of the last returned row together with
//! its absolute position in the result set, so the next page knows both where
//! to resume (`search_after`) and how many rows came before it.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};

/// Decoded cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    /// Rows returned up to and including this one.
    #[serde(rename = "p")]
    pub position: u64,

    /// Sort values of the row.
    #[serde(rename = "s")]
    pub sort: Vec<Value>,
}

impl Cursor {
    pub fn new(position: u64, sort: Vec<Value>) -> Self {
        Self { position, sort }
    }

    /// Encode to an opaque string.
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decode a string produced by [`Cursor::encode`].
    pub fn decode(cursor: &str) -> EngineResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(cursor.trim())
            .map_err(|_| EngineError::Functional(format!("invalid cursor: {cursor}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|_| EngineError::Functional(format!("invalid cursor: {cursor}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip_preserves_tuple() {
        let tuples = [
            vec![json!("abc")],
            vec![json!(1_700_000_000_000_i64), json!("id-1")],
            vec![json!(null), json!(3.5), json!(true), json!("ünïcode")],
            vec![],
        ];
        for sort in tuples {
            let cursor = Cursor::new(42, sort.clone());
            let decoded = Cursor::decode(&cursor.encode()).unwrap();
            assert_eq!(decoded.sort, sort);
            assert_eq!(decoded.position, 42);
            assert_eq!(decoded.encode(), cursor.encode(), "re-encoding is stable");
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            Cursor::decode("not a cursor!"),
            Err(EngineError::Functional(_))
        ));
        let not_json = URL_SAFE_NO_PAD.encode(b"[1,2]");
        assert!(Cursor::decode(&not_json).is_err());
    }
}
