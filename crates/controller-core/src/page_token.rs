//! Opaque pagination cursor.
//!
//! A token carries the requested page size and an optional `before_id`
//! watermark (return items strictly older than this). Clients round-trip the
//! encoded form without inspecting it.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::{Error, Result};

/// Decoded pagination cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageToken {
    /// Requested page size. Zero means "server default / unbounded".
    pub size: usize,
    /// Return items with an id strictly smaller than this.
    pub before_id: Option<i64>,
}

impl PageToken {
    /// Decodes a token string. Empty input decodes to the zero token.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` on undecodable input, a non-integer size, or
    /// an unparseable before-id.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Ok(Self::default());
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|e| Error::InvalidArgument(format!("malformed page token: {e}")))?;
        let text = String::from_utf8(bytes)
            .map_err(|e| Error::InvalidArgument(format!("malformed page token: {e}")))?;
        let (before, size) = text
            .split_once(':')
            .ok_or_else(|| Error::InvalidArgument("malformed page token".into()))?;
        let before_id = if before.is_empty() {
            None
        } else {
            Some(before.parse::<i64>().map_err(|e| {
                Error::InvalidArgument(format!("malformed page token before-id: {e}"))
            })?)
        };
        let size = size
            .parse::<usize>()
            .map_err(|e| Error::InvalidArgument(format!("malformed page token size: {e}")))?;
        Ok(Self { size, before_id })
    }

    /// Encodes the token as a URL-safe string.
    #[must_use]
    pub fn encode(&self) -> String {
        let before = self.before_id.map(|id| id.to_string()).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(format!("{before}:{}", self.size))
    }

    /// Encodes an optional token; `None` encodes to the empty string.
    #[must_use]
    pub fn encode_opt(token: Option<&PageToken>) -> String {
        token.map(PageToken::encode).unwrap_or_default()
    }
}
