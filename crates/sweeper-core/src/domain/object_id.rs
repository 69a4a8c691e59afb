//! ObjectId - 削除対象オブジェクトの識別子
//!
//! The identifier is also the wire format: a delete instruction on the queue
//! is nothing but the raw UTF-8 bytes of the id. No envelope, no version.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::PayloadError;

/// Identifier of a stored object, e.g. `uploads/3f1c.png`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Result<Self, PayloadError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(PayloadError::Empty);
        }
        Ok(Self(id))
    }

    /// Decode a message body.
    pub fn from_payload(payload: &[u8]) -> Result<Self, PayloadError> {
        let id = std::str::from_utf8(payload)?;
        Self::new(id)
    }

    /// Recover the id from a delivery URL of a previously uploaded object.
    ///
    /// The id is the first `<folder>/<stem>.<ext>` pair of path segments,
    /// where `stem` contains no dot and `ext` is lowercase ASCII letters.
    /// Anything after the extension (size suffixes, query strings) is ignored.
    ///
    /// ```ignore
    /// let id = ObjectId::from_asset_url(
    ///     "https://res.example.com/demo/image/upload/v1700000000/uploads/abc.png",
    /// )?;
    /// assert_eq!(id.as_str(), "uploads/abc.png");
    /// ```
    pub fn from_asset_url(url: &str) -> Result<Self, PayloadError> {
        let segments: Vec<&str> = url.split('/').collect();
        segments
            .windows(2)
            .find_map(|pair| {
                let folder = pair[0];
                if folder.is_empty() {
                    return None;
                }
                let (stem, rest) = pair[1].split_once('.')?;
                if stem.is_empty() {
                    return None;
                }
                let ext_len = rest
                    .bytes()
                    .take_while(|b| b.is_ascii_lowercase())
                    .count();
                if ext_len == 0 {
                    return None;
                }
                Some(format!("{folder}/{stem}.{}", &rest[..ext_len]))
            })
            .map(Self)
            .ok_or_else(|| PayloadError::NoObjectInUrl(url.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Encode as a message body.
    pub fn to_payload(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ObjectId {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ObjectId {
    type Error = PayloadError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}
