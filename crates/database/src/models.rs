//! Backend-neutral value records.
//!
//! No record owns another: relationships (hotlink to file, session to user)
//! are plain string identifiers. All models round-trip through `serde` so the
//! key-value driver can store them, and through row structs for SQLite.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::UtcDateTime;

/// Current time as unix seconds.
pub fn now() -> i64 {
    UtcDateTime::now().unix_timestamp()
}

/// Permission bitmask attached to an [`ApiKey`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(pub u8);

impl Permissions {
    pub const NONE: Self = Self(0);
    pub const VIEW: Self = Self(1 << 0);
    pub const UPLOAD: Self = Self(1 << 1);
    pub const DELETE: Self = Self(1 << 2);
    pub const API_MANAGE: Self = Self(1 << 3);
    pub const EDIT: Self = Self(1 << 4);
    pub const REPLACE: Self = Self(1 << 5);
    pub const ALL: Self = Self(0b0011_1111);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl From<u8> for Permissions {
    fn from(bits: u8) -> Self {
        Self(bits)
    }
}

/// An API credential.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub friendly_name: String,
    /// Unix seconds of the last authenticated request, `0` if never used.
    pub last_used: i64,
    pub permissions: Permissions,
}

/// A login session. The session token is the lookup key and is not stored
/// on the record itself.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub renew_at: i64,
    pub valid_until: i64,
}

impl Session {
    pub fn is_expired(&self, now: i64) -> bool {
        self.valid_until < now
    }
}

/// Encryption envelope of an uploaded file.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct EncryptionInfo {
    pub is_encrypted: bool,
    pub is_end_to_end_encrypted: bool,
    pub decryption_key: Vec<u8>,
    pub nonce: Vec<u8>,
}

/// Metadata of an uploaded file.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub id: String,
    pub name: String,
    /// Human-readable size, e.g. `"3 kB"`.
    pub size: String,
    /// Content hash.
    pub sha1: String,
    pub password_hash: Option<String>,
    pub hotlink_id: Option<String>,
    pub content_type: String,
    /// Storage bucket tag, `None` for local storage.
    pub bucket: Option<String>,
    pub expire_at_string: String,
    pub expire_at: i64,
    pub size_bytes: u64,
    pub downloads_remaining: i64,
    pub download_count: u64,
    pub encryption: EncryptionInfo,
    pub unlimited_downloads: bool,
    pub unlimited_time: bool,
}

impl File {
    /// Whether the record may be garbage collected: downloads are exhausted
    /// on a limited file, or the expiry has passed on a time-limited file.
    pub fn is_expired(&self, now: i64) -> bool {
        let exhausted = !self.unlimited_downloads && self.downloads_remaining <= 0;
        let timed_out = !self.unlimited_time && self.expire_at < now;
        exhausted || timed_out
    }

    pub fn requires_password(&self) -> bool {
        self.password_hash.as_deref().is_some_and(|hash| !hash.is_empty())
    }
}

/// End-to-end encryption handshake blob (one per installation).
///
/// `available_files` is accepted from callers but never persisted: it is
/// skipped by serde and has no SQL column, so reads always return it empty.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct EndToEndInfo {
    pub version: u8,
    pub nonce: Vec<u8>,
    pub content: Vec<u8>,
    #[serde(skip)]
    pub available_files: Vec<String>,
}

/// Processing stage of an upload, stored as its integer code.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum UploadState {
    #[default]
    HashingOrEncrypting = 0,
    UploadingToCloud = 1,
    Finished = 2,
    Error = 3,
}

/// Error returned when an integer does not name an [`UploadState`].
#[derive(Debug)]
pub struct UnknownUploadState(pub u8);

impl fmt::Display for UnknownUploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown upload state {}", self.0)
    }
}

impl std::error::Error for UnknownUploadState {}

impl TryFrom<u8> for UploadState {
    type Error = UnknownUploadState;
    fn try_from(code: u8) -> Result<Self, UnknownUploadState> {
        match code {
            0 => Ok(Self::HashingOrEncrypting),
            1 => Ok(Self::UploadingToCloud),
            2 => Ok(Self::Finished),
            3 => Ok(Self::Error),
            other => Err(UnknownUploadState(other)),
        }
    }
}

impl From<UploadState> for u8 {
    fn from(state: UploadState) -> Self {
        state as u8
    }
}

/// Progress of a single upload chunk, kept for server-sent-event replay.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct UploadStatus {
    pub chunk_id: String,
    pub status: UploadState,
    pub last_update: i64,
}
