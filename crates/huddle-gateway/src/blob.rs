use std::io::ErrorKind;
use std::path::PathBuf;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use huddle_types::models::MessageKind;

/// 25 MB upload limit for attachments
pub const MAX_BLOB_SIZE: usize = 25 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob rejected: {0}")]
    Rejected(String),

    #[error("blob storage I/O: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub url: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobDeletion {
    Deleted,
    NotFound,
}

/// Where attachment bytes live. Implementations must be safe to share
/// across connections.
pub trait BlobStore: Send + Sync {
    fn store<'a>(&'a self, bytes: Bytes, mime: &'a str, owner: Uuid) -> BoxFuture<'a, Result<StoredBlob, BlobError>>;

    fn delete<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<BlobDeletion, BlobError>>;

    /// Bytes and MIME type of a stored blob, `None` when absent.
    fn open<'a>(
        &'a self,
        category: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<(Bytes, &'static str)>, BlobError>>;
}

// -- Classification --

/// A MIME family and where its blobs are filed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Category {
    pub kind: MessageKind,
    pub folder: &'static str,
}

/// First matching prefix wins; anything unmatched is a generic file.
const CATEGORIES: &[(&str, MessageKind, &str)] = &[
    ("image/", MessageKind::Image, "images"),
    ("audio/", MessageKind::Audio, "audio"),
    ("video/", MessageKind::File, "files"),
    ("text/", MessageKind::File, "files"),
    ("application/", MessageKind::File, "files"),
];

const FALLBACK: Category = Category {
    kind: MessageKind::File,
    folder: "files",
};

/// File extension <-> MIME type, used for blob names and when serving.
const EXTENSIONS: &[(&str, &str)] = &[
    ("image/png", "png"),
    ("image/jpeg", "jpg"),
    ("image/gif", "gif"),
    ("image/webp", "webp"),
    ("audio/mpeg", "mp3"),
    ("audio/ogg", "ogg"),
    ("audio/wav", "wav"),
    ("audio/webm", "weba"),
    ("video/mp4", "mp4"),
    ("application/pdf", "pdf"),
    ("application/zip", "zip"),
    ("text/plain", "txt"),
];

pub fn classify(mime: &str) -> Category {
    let mime = mime.trim().to_ascii_lowercase();
    CATEGORIES
        .iter()
        .find(|(prefix, _, _)| mime.starts_with(prefix))
        .map(|&(_, kind, folder)| Category { kind, folder })
        .unwrap_or(FALLBACK)
}

fn extension_for(mime: &str) -> Option<&'static str> {
    let mime = mime.trim().to_ascii_lowercase();
    EXTENSIONS.iter().find(|(m, _)| *m == mime).map(|&(_, ext)| ext)
}

fn mime_for(name: &str) -> &'static str {
    name.rsplit_once('.')
        .and_then(|(_, ext)| EXTENSIONS.iter().find(|(_, e)| *e == ext))
        .map(|&(mime, _)| mime)
        .unwrap_or("application/octet-stream")
}

fn is_known_folder(folder: &str) -> bool {
    folder == FALLBACK.folder || CATEGORIES.iter().any(|(_, _, f)| *f == folder)
}

/// `{sha256}` or `{sha256}.{ext}`; nothing that could leave the folder.
fn is_valid_name(name: &str) -> bool {
    let (stem, ext) = name.split_once('.').unwrap_or((name, ""));
    stem.len() == 64
        && stem.chars().all(|c| c.is_ascii_hexdigit())
        && ext.chars().all(|c| c.is_ascii_alphanumeric())
}

// -- Local disk --

/// Content-addressed blobs on local disk: `{root}/{folder}/{sha256}.{ext}`,
/// served at `/blobs/{folder}/{name}`. Identical uploads share one file.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub async fn new(root: PathBuf) -> Result<Self, BlobError> {
        fs::create_dir_all(&root).await?;
        info!("Blob storage directory: {}", root.display());
        Ok(Self { root })
    }

    async fn write(&self, bytes: Bytes, mime: &str, owner: Uuid) -> Result<StoredBlob, BlobError> {
        if bytes.is_empty() {
            return Err(BlobError::Rejected("empty upload".into()));
        }
        if bytes.len() > MAX_BLOB_SIZE {
            return Err(BlobError::Rejected(format!(
                "{} bytes exceeds the {} byte limit",
                bytes.len(),
                MAX_BLOB_SIZE
            )));
        }

        let category = classify(mime);
        let digest = hex::encode(Sha256::digest(&bytes));
        let name = match extension_for(mime) {
            Some(ext) => format!("{digest}.{ext}"),
            None => digest,
        };

        let dir = self.root.join(category.folder);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(&name);

        if fs::try_exists(&path).await? {
            debug!("Blob {}/{} already stored, reusing for {}", category.folder, name, owner);
        } else {
            // Write beside the target and rename so readers never see a partial file.
            let tmp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
            fs::write(&tmp, &bytes).await?;
            if let Err(e) = fs::rename(&tmp, &path).await {
                let _ = fs::remove_file(&tmp).await;
                return Err(e.into());
            }
            info!("Stored blob {}/{} ({} bytes) for {}", category.folder, name, bytes.len(), owner);
        }

        Ok(StoredBlob {
            url: format!("/blobs/{}/{}", category.folder, name),
            size: bytes.len() as u64,
        })
    }

    async fn remove(&self, url: &str) -> Result<BlobDeletion, BlobError> {
        let Some((folder, name)) = url.strip_prefix("/blobs/").and_then(|rest| rest.split_once('/')) else {
            return Err(BlobError::Rejected(format!("not a blob url: {url}")));
        };
        if !is_known_folder(folder) || !is_valid_name(name) {
            return Err(BlobError::Rejected(format!("not a blob url: {url}")));
        }

        match fs::remove_file(self.root.join(folder).join(name)).await {
            Ok(()) => {
                info!("Deleted blob {}/{}", folder, name);
                Ok(BlobDeletion::Deleted)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Blob {}/{} already gone", folder, name);
                Ok(BlobDeletion::NotFound)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, folder: &str, name: &str) -> Result<Option<(Bytes, &'static str)>, BlobError> {
        if !is_known_folder(folder) || !is_valid_name(name) {
            return Ok(None);
        }
        match fs::read(self.root.join(folder).join(name)).await {
            Ok(data) => Ok(Some((Bytes::from(data), mime_for(name)))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl BlobStore for LocalBlobStore {
    fn store<'a>(&'a self, bytes: Bytes, mime: &'a str, owner: Uuid) -> BoxFuture<'a, Result<StoredBlob, BlobError>> {
        Box::pin(self.write(bytes, mime, owner))
    }

    fn delete<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<BlobDeletion, BlobError>> {
        Box::pin(self.remove(url))
    }

    fn open<'a>(
        &'a self,
        category: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<(Bytes, &'static str)>, BlobError>> {
        Box::pin(self.read(category, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> LocalBlobStore {
        let root = std::env::temp_dir().join(format!("huddle-blobs-{}", Uuid::new_v4()));
        LocalBlobStore::new(root).await.unwrap()
    }

    #[test]
    fn classification_is_table_driven() {
        assert_eq!(classify("image/png").kind, MessageKind::Image);
        assert_eq!(classify("IMAGE/JPEG").folder, "images");
        assert_eq!(classify("audio/ogg").kind, MessageKind::Audio);
        assert_eq!(classify("application/pdf").kind, MessageKind::File);
        assert_eq!(classify("chemical/x-pdb"), FALLBACK);
    }

    #[test]
    fn names_cannot_escape_the_folder() {
        let digest = "a".repeat(64);
        assert!(is_valid_name(&digest));
        assert!(is_valid_name(&format!("{digest}.png")));
        assert!(!is_valid_name("../../etc/passwd"));
        assert!(!is_valid_name(&format!("{digest}.png/..")));
        assert!(!is_known_folder(".."));
    }

    #[tokio::test]
    async fn identical_content_is_stored_once() {
        let store = temp_store().await;
        let owner = Uuid::new_v4();

        let a = store.store(Bytes::from_static(b"pixels"), "image/png", owner).await.unwrap();
        let b = store.store(Bytes::from_static(b"pixels"), "image/png", Uuid::new_v4()).await.unwrap();
        assert_eq!(a, b);
        assert!(a.url.starts_with("/blobs/images/"));
        assert!(a.url.ends_with(".png"));
        assert_eq!(a.size, 6);

        let (folder, name) = a.url.trim_start_matches("/blobs/").split_once('/').unwrap();
        let (data, mime) = store.open(folder, name).await.unwrap().unwrap();
        assert_eq!(&data[..], b"pixels");
        assert_eq!(mime, "image/png");

        assert_eq!(store.delete(&a.url).await.unwrap(), BlobDeletion::Deleted);
        assert_eq!(store.delete(&a.url).await.unwrap(), BlobDeletion::NotFound);
        assert!(store.open(folder, name).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_empty_and_foreign_urls() {
        let store = temp_store().await;
        assert!(matches!(
            store.store(Bytes::new(), "text/plain", Uuid::new_v4()).await,
            Err(BlobError::Rejected(_))
        ));
        assert!(matches!(store.delete("/etc/passwd").await, Err(BlobError::Rejected(_))));
    }
}
