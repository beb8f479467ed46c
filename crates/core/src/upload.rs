//! Upload identifiers and session bookkeeping.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Separator between the identifier fields inside the encoded token.
const FIELD_SEPARATOR: char = '/';

/// Upper bound on an encoded token, so hostile input is rejected before decoding.
const MAX_TOKEN_LEN: usize = 4096;

/// Longest `bucket/key/version` string whose unpadded base64 fits in [`MAX_TOKEN_LEN`].
const MAX_RAW_LEN: usize = MAX_TOKEN_LEN / 4 * 3;

/// Identifies the object an upload session writes to.
///
/// Exposed to clients only as an opaque, URL-safe token (see [`UploadIdentifier::encode`]).
/// The bucket and version never contain `/`; the object key may, which keeps the
/// encoding injective.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UploadIdentifier {
    bucket: String,
    object_key: String,
    version: String,
}

impl UploadIdentifier {
    /// Create an identifier, validating every field.
    pub fn new(
        bucket: impl Into<String>,
        object_key: impl Into<String>,
        version: impl Into<String>,
    ) -> crate::Result<Self> {
        let id = Self {
            bucket: bucket.into(),
            object_key: object_key.into(),
            version: version.into(),
        };
        id.validate()?;
        Ok(id)
    }

    fn validate(&self) -> crate::Result<()> {
        check_field("bucket", &self.bucket, false)?;
        check_field("object key", &self.object_key, true)?;
        check_field("version", &self.version, false)?;

        let raw_len = self.bucket.len() + self.object_key.len() + self.version.len() + 2;
        if raw_len > MAX_RAW_LEN {
            return Err(malformed(format!(
                "identifier too long: {raw_len} bytes (max: {MAX_RAW_LEN})"
            )));
        }
        Ok(())
    }

    /// Encode into the opaque token handed to clients.
    pub fn encode(&self) -> String {
        let raw = format!(
            "{}{FIELD_SEPARATOR}{}{FIELD_SEPARATOR}{}",
            self.bucket, self.object_key, self.version
        );
        URL_SAFE_NO_PAD.encode(raw.as_bytes())
    }

    /// Decode a client-supplied token.
    pub fn decode(token: &str) -> crate::Result<Self> {
        if token.is_empty() {
            return Err(malformed("empty token"));
        }
        if token.len() > MAX_TOKEN_LEN {
            return Err(malformed(format!(
                "token too long: {} bytes (max: {MAX_TOKEN_LEN})",
                token.len()
            )));
        }

        let raw = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| malformed(format!("invalid base64: {e}")))?;
        let raw = String::from_utf8(raw).map_err(|_| malformed("token is not valid UTF-8"))?;

        let (bucket, rest) = raw
            .split_once(FIELD_SEPARATOR)
            .ok_or_else(|| malformed("expected bucket, key and version fields"))?;
        let (object_key, version) = rest
            .rsplit_once(FIELD_SEPARATOR)
            .ok_or_else(|| malformed("expected bucket, key and version fields"))?;

        Self::new(bucket, object_key, version)
    }

    /// Bucket the object belongs to.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Object key inside the bucket.
    pub fn object_key(&self) -> &str {
        &self.object_key
    }

    /// Object version being written.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Key used to serialize offset-mutating operations on this upload.
    pub fn resource_id(&self) -> String {
        self.encode()
    }
}

fn check_field(name: &str, value: &str, allow_separator: bool) -> crate::Result<()> {
    if value.is_empty() {
        return Err(malformed(format!("{name} must not be empty")));
    }
    if !allow_separator && value.contains(FIELD_SEPARATOR) {
        return Err(malformed(format!(
            "{name} must not contain '{FIELD_SEPARATOR}': {value:?}"
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(malformed(format!(
            "{name} contains control characters: {value:?}"
        )));
    }
    Ok(())
}

fn malformed(msg: impl Into<String>) -> crate::Error {
    crate::Error::MalformedIdentifier(msg.into())
}

impl TryFrom<String> for UploadIdentifier {
    type Error = crate::Error;

    fn try_from(token: String) -> crate::Result<Self> {
        Self::decode(&token)
    }
}

impl From<UploadIdentifier> for String {
    fn from(id: UploadIdentifier) -> Self {
        id.encode()
    }
}

impl fmt::Debug for UploadIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadIdentifier")
            .field("bucket", &self.bucket)
            .field("object_key", &self.object_key)
            .field("version", &self.version)
            .finish()
    }
}

impl fmt::Display for UploadIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.bucket, self.object_key, self.version)
    }
}

/// A resumable upload session.
///
/// Owned by the protocol engine; this crate only enforces the offset and length
/// rules. `backend_state` is the serialized storage handle and is never inspected here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadSession {
    /// Target object.
    pub id: UploadIdentifier,
    /// Tenant the upload is billed against.
    pub tenant_id: String,
    /// Principal that created the session.
    pub owner_id: Option<String>,
    /// Whether finalizing may overwrite an existing object.
    pub is_upsert: bool,
    offset: u64,
    size: Option<u64>,
    /// Opaque storage backend state.
    pub backend_state: Option<serde_json::Value>,
    /// When the session was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// When the session last accepted bytes.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl UploadSession {
    /// Create a new session at offset zero.
    pub fn new(id: UploadIdentifier, tenant_id: impl Into<String>, size: Option<u64>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id,
            tenant_id: tenant_id.into(),
            owner_id: None,
            is_upsert: false,
            offset: 0,
            size,
            backend_state: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Bytes accepted so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total upload length, if declared.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Declare the total length of a deferred-length upload.
    ///
    /// May be called once; redeclaring the same value is a no-op.
    pub fn declare_size(&mut self, size: u64) -> crate::Result<()> {
        match self.size {
            Some(existing) if existing == size => Ok(()),
            Some(existing) => Err(crate::Error::UploadSession(format!(
                "upload length already declared as {existing}, cannot change to {size}"
            ))),
            None if size < self.offset => Err(crate::Error::UploadSession(format!(
                "declared length {size} is below current offset {}",
                self.offset
            ))),
            None => {
                self.size = Some(size);
                Ok(())
            }
        }
    }

    /// Move the offset forward after a successful write.
    pub fn advance(&mut self, new_offset: u64) -> crate::Result<()> {
        if new_offset < self.offset {
            return Err(crate::Error::UploadSession(format!(
                "offset cannot move backwards: {} -> {new_offset}",
                self.offset
            )));
        }
        if let Some(size) = self.size
            && new_offset > size
        {
            return Err(crate::Error::UploadSession(format!(
                "offset {new_offset} exceeds declared length {size}"
            )));
        }
        self.offset = new_offset;
        self.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    /// Whether every declared byte has been received.
    pub fn is_complete(&self) -> bool {
        self.size == Some(self.offset)
    }
}
