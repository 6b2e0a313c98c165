use crate::error::{Error, ErrorKind};
use crate::models::{ApiKey, EncryptionInfo, EndToEndInfo, File, Permissions, Session, UploadState, UploadStatus};
use exn::ResultExt;

#[derive(sqlx::FromRow)]
pub(crate) struct ApiKeyRow {
    pub(crate) id: String,
    pub(crate) friendly_name: String,
    pub(crate) last_used: i64,
    pub(crate) permissions: i64,
}
impl From<&ApiKey> for ApiKeyRow {
    fn from(key: &ApiKey) -> Self {
        Self {
            id: key.id.clone(),
            friendly_name: key.friendly_name.clone(),
            last_used: key.last_used,
            permissions: i64::from(key.permissions.0),
        }
    }
}
impl TryFrom<ApiKeyRow> for ApiKey {
    type Error = Error;
    fn try_from(row: ApiKeyRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            friendly_name: row.friendly_name,
            last_used: row.last_used,
            permissions: Permissions(u8::try_from(row.permissions).or_raise(|| ErrorKind::InvalidData("permissions"))?),
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct SessionRow {
    pub(crate) renew_at: i64,
    pub(crate) valid_until: i64,
}
impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Self { renew_at: row.renew_at, valid_until: row.valid_until }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct EndToEndRow {
    pub(crate) version: i64,
    pub(crate) nonce: Vec<u8>,
    pub(crate) content: Vec<u8>,
}
impl From<&EndToEndInfo> for EndToEndRow {
    fn from(info: &EndToEndInfo) -> Self {
        // `available_files` is deliberately dropped here: it has no column.
        Self {
            version: i64::from(info.version),
            nonce: info.nonce.clone(),
            content: info.content.clone(),
        }
    }
}
impl TryFrom<EndToEndRow> for EndToEndInfo {
    type Error = Error;
    fn try_from(row: EndToEndRow) -> Result<Self, Self::Error> {
        Ok(Self {
            version: u8::try_from(row.version).or_raise(|| ErrorKind::InvalidData("end-to-end version"))?,
            nonce: row.nonce,
            content: row.content,
            available_files: Vec::new(),
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct UploadStatusRow {
    pub(crate) chunk_id: String,
    pub(crate) current_status: i64,
    pub(crate) last_update: i64,
}
impl From<&UploadStatus> for UploadStatusRow {
    fn from(status: &UploadStatus) -> Self {
        Self {
            chunk_id: status.chunk_id.clone(),
            current_status: i64::from(u8::from(status.status)),
            last_update: status.last_update,
        }
    }
}
impl TryFrom<UploadStatusRow> for UploadStatus {
    type Error = Error;
    fn try_from(row: UploadStatusRow) -> Result<Self, Self::Error> {
        let code = u8::try_from(row.current_status).or_raise(|| ErrorKind::InvalidData("upload status"))?;
        Ok(Self {
            chunk_id: row.chunk_id,
            status: UploadState::try_from(code).or_raise(|| ErrorKind::InvalidData("upload status"))?,
            last_update: row.last_update,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct FileRow {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) size: String,
    pub(crate) sha1: String,
    pub(crate) password_hash: Option<String>,
    pub(crate) hotlink_id: Option<String>,
    pub(crate) content_type: String,
    pub(crate) bucket: Option<String>,
    pub(crate) expire_at_string: String,
    pub(crate) expire_at: i64,
    pub(crate) size_bytes: i64,
    pub(crate) downloads_remaining: i64,
    pub(crate) download_count: i64,
    pub(crate) is_encrypted: bool,
    pub(crate) is_end_to_end_encrypted: bool,
    pub(crate) decryption_key: Vec<u8>,
    pub(crate) nonce: Vec<u8>,
    pub(crate) unlimited_downloads: bool,
    pub(crate) unlimited_time: bool,
}
impl TryFrom<&File> for FileRow {
    type Error = Error;
    fn try_from(file: &File) -> Result<Self, Self::Error> {
        Ok(Self {
            id: file.id.clone(),
            name: file.name.clone(),
            size: file.size.clone(),
            sha1: file.sha1.clone(),
            password_hash: file.password_hash.clone(),
            hotlink_id: file.hotlink_id.clone(),
            content_type: file.content_type.clone(),
            bucket: file.bucket.clone(),
            expire_at_string: file.expire_at_string.clone(),
            expire_at: file.expire_at,
            size_bytes: i64::try_from(file.size_bytes).or_raise(|| ErrorKind::InvalidData("file size"))?,
            downloads_remaining: file.downloads_remaining,
            download_count: i64::try_from(file.download_count).or_raise(|| ErrorKind::InvalidData("download count"))?,
            is_encrypted: file.encryption.is_encrypted,
            is_end_to_end_encrypted: file.encryption.is_end_to_end_encrypted,
            decryption_key: file.encryption.decryption_key.clone(),
            nonce: file.encryption.nonce.clone(),
            unlimited_downloads: file.unlimited_downloads,
            unlimited_time: file.unlimited_time,
        })
    }
}
impl TryFrom<FileRow> for File {
    type Error = Error;
    fn try_from(row: FileRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            size: row.size,
            sha1: row.sha1,
            password_hash: row.password_hash,
            hotlink_id: row.hotlink_id,
            content_type: row.content_type,
            bucket: row.bucket,
            expire_at_string: row.expire_at_string,
            expire_at: row.expire_at,
            size_bytes: u64::try_from(row.size_bytes).or_raise(|| ErrorKind::InvalidData("file size"))?,
            downloads_remaining: row.downloads_remaining,
            download_count: u64::try_from(row.download_count).or_raise(|| ErrorKind::InvalidData("download count"))?,
            encryption: EncryptionInfo {
                is_encrypted: row.is_encrypted,
                is_end_to_end_encrypted: row.is_end_to_end_encrypted,
                decryption_key: row.decryption_key,
                nonce: row.nonce,
            },
            unlimited_downloads: row.unlimited_downloads,
            unlimited_time: row.unlimited_time,
        })
    }
}
