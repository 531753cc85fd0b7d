use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::dub_core::domain::Upload;
use crate::dub_core::hashing::sha256_hex;
use crate::dub_core::paths::{validate_upload_filename, Layout};
use crate::dub_core::quotas::{QuotaError, QuotaService};
use crate::dub_core::settings::AppSettings;
use crate::dub_core::store::JobStore;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid filename: {0}")]
    InvalidFilename(String),
    #[error("upload too large")]
    TooLarge,
    #[error("unknown upload")]
    NotFound,
    #[error("chunk out of order: expected index {expected}")]
    ChunkOutOfOrder { expected: u32 },
    #[error("chunk offset mismatch: expected {expected}")]
    OffsetMismatch { expected: u64 },
    #[error("chunk hash mismatch")]
    HashMismatch,
    #[error("chunk size mismatch: expected {expected} bytes")]
    SizeMismatch { expected: u64 },
    #[error("upload already completed")]
    AlreadyCompleted,
    #[error("upload incomplete: {received} of {total} bytes")]
    Incomplete { received: u64, total: u64 },
    #[error(transparent)]
    Quota(#[from] QuotaError),
    #[error("upload storage failed: {0}")]
    Io(String),
    #[error("upload lookup failed")]
    Internal,
}

#[derive(Debug, Serialize)]
pub struct UploadStatus {
    pub upload_id: String,
    pub bytes_received: u64,
    pub next_expected_chunk: u32,
    pub total_chunks: u32,
    pub state: &'static str,
}

/// Resumable chunked uploads: strict in-order appends to a `.part` file,
/// per-chunk sha256 verification, atomic promotion to the final path.
pub struct UploadService {
    settings: Arc<AppSettings>,
    layout: Layout,
    store: Arc<JobStore>,
    quotas: Arc<QuotaService>,
}

impl UploadService {
    pub fn new(
        settings: Arc<AppSettings>,
        layout: Layout,
        store: Arc<JobStore>,
        quotas: Arc<QuotaService>,
    ) -> Self {
        Self {
            settings,
            layout,
            store,
            quotas,
        }
    }

    pub fn init(
        &self,
        owner_id: &str,
        filename: &str,
        total_bytes: u64,
    ) -> Result<Upload, UploadError> {
        validate_upload_filename(filename)
            .map_err(|err| UploadError::InvalidFilename(err.to_string()))?;
        if total_bytes == 0 {
            return Err(UploadError::InvalidFilename("empty upload".to_string()));
        }
        let global_cap = self.settings.quotas.max_upload_bytes;
        if global_cap > 0 && total_bytes > global_cap {
            return Err(UploadError::TooLarge);
        }
        self.quotas
            .check_upload(owner_id, total_bytes)
            .map_err(|err| match err {
                QuotaError::UploadTooLarge => UploadError::TooLarge,
                other => UploadError::Quota(other),
            })?;

        let uploads_dir = self.layout.uploads_dir();
        fs::create_dir_all(&uploads_dir).map_err(|err| UploadError::Io(err.to_string()))?;

        let id = uuid::Uuid::new_v4().to_string();
        let upload = Upload {
            part_path: uploads_dir
                .join(format!("{id}.part"))
                .to_string_lossy()
                .into_owned(),
            final_path: uploads_dir
                .join(format!("{id}_{filename}"))
                .to_string_lossy()
                .into_owned(),
            id,
            owner_id: owner_id.to_string(),
            filename: filename.to_string(),
            total_bytes,
            chunk_bytes: self.settings.upload_chunk_bytes.max(1),
            received: BTreeMap::new(),
            received_bytes: 0,
            completed: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store
            .put_upload(&upload)
            .map_err(|_| UploadError::Internal)?;
        Ok(upload)
    }

    fn load(&self, id: &str) -> Result<Upload, UploadError> {
        self.store
            .get_upload(id)
            .map_err(|_| UploadError::Internal)?
            .ok_or(UploadError::NotFound)
    }

    fn expected_chunk_size(upload: &Upload, index: u32) -> u64 {
        let total_chunks = upload.total_chunks();
        if index + 1 == total_chunks {
            let remainder = upload.total_bytes % upload.chunk_bytes;
            if remainder == 0 {
                upload.chunk_bytes
            } else {
                remainder
            }
        } else {
            upload.chunk_bytes
        }
    }

    /// Store one chunk. Re-POSTing an already-stored index with a matching
    /// hash succeeds without a double append; everything else out of order
    /// is a conflict.
    pub fn put_chunk(
        &self,
        id: &str,
        index: u32,
        offset: u64,
        body: &[u8],
        sha256_header: &str,
    ) -> Result<Upload, UploadError> {
        let mut upload = self.load(id)?;
        if upload.completed {
            return Err(UploadError::AlreadyCompleted);
        }
        if index >= upload.total_chunks() {
            return Err(UploadError::ChunkOutOfOrder {
                expected: upload.next_expected_chunk(),
            });
        }

        let body_hash = sha256_hex(body);
        if !sha256_header.eq_ignore_ascii_case(&body_hash) {
            return Err(UploadError::HashMismatch);
        }

        // Idempotent retry of a chunk that is already on disk.
        if let Some(stored) = upload.received.get(&index) {
            if *stored == body.len() as u64 {
                return Ok(upload);
            }
            return Err(UploadError::SizeMismatch { expected: *stored });
        }

        let expected_index = upload.next_expected_chunk();
        if index != expected_index {
            return Err(UploadError::ChunkOutOfOrder {
                expected: expected_index,
            });
        }
        let expected_offset = u64::from(index) * upload.chunk_bytes;
        if offset != expected_offset {
            return Err(UploadError::OffsetMismatch {
                expected: expected_offset,
            });
        }
        let expected_size = Self::expected_chunk_size(&upload, index);
        if body.len() as u64 != expected_size {
            return Err(UploadError::SizeMismatch {
                expected: expected_size,
            });
        }

        let mut part = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&upload.part_path)
            .map_err(|err| UploadError::Io(err.to_string()))?;
        part.write_all(body)
            .map_err(|err| UploadError::Io(err.to_string()))?;
        part.sync_data()
            .map_err(|err| UploadError::Io(err.to_string()))?;

        upload.received.insert(index, body.len() as u64);
        upload.received_bytes += body.len() as u64;
        upload.updated_at = Utc::now();
        self.store
            .put_upload(&upload)
            .map_err(|_| UploadError::Internal)?;
        Ok(upload)
    }

    /// Promote the part file to its final path once every byte has arrived.
    pub fn complete(&self, id: &str) -> Result<Upload, UploadError> {
        let mut upload = self.load(id)?;
        if upload.completed {
            return Ok(upload);
        }
        if upload.received_bytes != upload.total_bytes {
            return Err(UploadError::Incomplete {
                received: upload.received_bytes,
                total: upload.total_bytes,
            });
        }
        fs::rename(&upload.part_path, &upload.final_path)
            .map_err(|err| UploadError::Io(err.to_string()))?;
        upload.completed = true;
        upload.updated_at = Utc::now();
        self.store
            .put_upload(&upload)
            .map_err(|_| UploadError::Internal)?;
        Ok(upload)
    }

    pub fn status(&self, id: &str) -> Result<UploadStatus, UploadError> {
        let upload = self.load(id)?;
        Ok(UploadStatus {
            upload_id: upload.id.clone(),
            bytes_received: upload.received_bytes,
            next_expected_chunk: upload.next_expected_chunk(),
            total_chunks: upload.total_chunks(),
            state: if upload.completed {
                "completed"
            } else if upload.received_bytes == upload.total_bytes {
                "ready"
            } else {
                "receiving"
            },
        })
    }

    pub fn get(&self, id: &str) -> Result<Upload, UploadError> {
        self.load(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(dir: &std::path::Path) -> UploadService {
        let mut settings = AppSettings::default();
        settings.input_dir = dir.join("Input");
        settings.output_dir = dir.join("Output");
        settings.upload_chunk_bytes = 4;
        settings.quotas.max_upload_bytes = 1024;
        settings.min_free_gb = 0;
        let settings = Arc::new(settings);
        let layout = Layout::new(
            settings.output_dir.clone(),
            settings.input_dir.clone(),
            dir.join("logs"),
            settings.output_dir.join("_state"),
        );
        let auth = Arc::new(crate::dub_core::store::AuthStore::open(&dir.join("auth.db")).unwrap());
        let jobs = Arc::new(JobStore::open(&dir.join("jobs.db")).unwrap());
        let quotas = Arc::new(QuotaService::new(settings.clone(), auth, jobs.clone()));
        UploadService::new(settings, layout, jobs, quotas)
    }

    fn sha(body: &[u8]) -> String {
        sha256_hex(body)
    }

    #[test]
    fn full_upload_flow_promotes_part_to_final() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());

        let upload = service.init("u1", "episode.mkv", 10).unwrap();
        assert_eq!(upload.total_chunks(), 3);

        service.put_chunk(&upload.id, 0, 0, b"aaaa", &sha(b"aaaa")).unwrap();
        service.put_chunk(&upload.id, 1, 4, b"bbbb", &sha(b"bbbb")).unwrap();
        service.put_chunk(&upload.id, 2, 8, b"cc", &sha(b"cc")).unwrap();

        let done = service.complete(&upload.id).unwrap();
        assert!(done.completed);
        assert!(std::path::Path::new(&done.final_path).exists());
        assert!(!std::path::Path::new(&done.part_path).exists());
        assert_eq!(std::fs::read(&done.final_path).unwrap(), b"aaaabbbbcc");

        // Completing again is idempotent.
        assert!(service.complete(&upload.id).unwrap().completed);
    }

    #[test]
    fn wrong_hash_is_rejected_and_state_stays_resumable() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let upload = service.init("u1", "episode.mkv", 8).unwrap();

        service.put_chunk(&upload.id, 0, 0, b"aaaa", &sha(b"aaaa")).unwrap();
        let err = service
            .put_chunk(&upload.id, 1, 4, b"bbbb", &sha(b"wrong"))
            .unwrap_err();
        assert!(matches!(err, UploadError::HashMismatch));

        let status = service.status(&upload.id).unwrap();
        assert_eq!(status.bytes_received, 4);
        assert_eq!(status.next_expected_chunk, 1);
        assert_eq!(status.state, "receiving");
    }

    #[test]
    fn repost_of_stored_chunk_does_not_double_append() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let upload = service.init("u1", "episode.mkv", 8).unwrap();

        service.put_chunk(&upload.id, 0, 0, b"aaaa", &sha(b"aaaa")).unwrap();
        let after_retry = service
            .put_chunk(&upload.id, 0, 0, b"aaaa", &sha(b"aaaa"))
            .unwrap();
        assert_eq!(after_retry.received_bytes, 4);
        assert_eq!(std::fs::read(&after_retry.part_path).unwrap(), b"aaaa");
    }

    #[test]
    fn out_of_order_and_bad_offset_are_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let upload = service.init("u1", "episode.mkv", 12).unwrap();

        let err = service
            .put_chunk(&upload.id, 1, 4, b"bbbb", &sha(b"bbbb"))
            .unwrap_err();
        assert!(matches!(err, UploadError::ChunkOutOfOrder { expected: 0 }));

        let err = service
            .put_chunk(&upload.id, 0, 4, b"aaaa", &sha(b"aaaa"))
            .unwrap_err();
        assert!(matches!(err, UploadError::OffsetMismatch { expected: 0 }));
    }

    #[test]
    fn init_rejects_traversal_names_and_oversize() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        assert!(matches!(
            service.init("u1", "../../etc/passwd", 10),
            Err(UploadError::InvalidFilename(_))
        ));
        assert!(matches!(
            service.init("u1", "episode.mkv", 4096),
            Err(UploadError::TooLarge)
        ));
    }

    #[test]
    fn complete_requires_every_byte() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let upload = service.init("u1", "episode.mkv", 8).unwrap();
        service.put_chunk(&upload.id, 0, 0, b"aaaa", &sha(b"aaaa")).unwrap();
        assert!(matches!(
            service.complete(&upload.id),
            Err(UploadError::Incomplete {
                received: 4,
                total: 8
            })
        ));
    }
}
