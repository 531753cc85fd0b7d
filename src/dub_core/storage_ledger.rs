use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::dub_core::paths::Layout;
use crate::dub_core::store::{JobStore, StorageEntry};

/// Recursive size of a directory tree, attributing 0 bytes to any symlink
/// that resolves outside `root` (and logging it) so a planted link cannot
/// inflate another user's bill or leak external file sizes.
pub(crate) fn tree_size_bytes(path: &Path, root: &Path) -> u64 {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return 0;
    };
    if meta.file_type().is_symlink() {
        match path.canonicalize() {
            Ok(target) if target.starts_with(root) => {}
            _ => {
                tracing::warn!(path = %path.display(), "symlink escapes root; counted as 0");
                return 0;
            }
        }
    }
    if meta.is_file() {
        return meta.len();
    }
    if !meta.is_dir() {
        return 0;
    }
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .map(|entry| tree_size_bytes(&entry.path(), root))
        .sum()
}

/// Walk the actual files under the output/uploads roots and swap the ledger
/// to match, atomically. The filesystem is the source of truth; rows for
/// objects that no longer exist disappear with the swap.
pub fn reconcile(layout: &Layout, store: &Arc<JobStore>) -> Result<Vec<StorageEntry>> {
    let mut entries = Vec::new();

    for job in store.list_all_jobs()? {
        if job.work_dir.is_empty() {
            continue;
        }
        let work_dir = Path::new(&job.work_dir);
        let output_dir = work_dir.parent().unwrap_or(work_dir);
        if !output_dir.starts_with(&layout.output_root) || !output_dir.exists() {
            continue;
        }
        let bytes = tree_size_bytes(output_dir, &layout.output_root);
        entries.push(StorageEntry {
            object_id: format!("job:{}", job.id),
            user_id: job.owner_id.clone(),
            bytes,
        });
    }

    for upload in store.list_uploads()? {
        let mut bytes = 0u64;
        for path in [&upload.part_path, &upload.final_path] {
            let path = Path::new(path);
            if path.starts_with(&layout.input_root) && path.exists() {
                bytes += tree_size_bytes(path, &layout.input_root);
            }
        }
        if bytes > 0 {
            entries.push(StorageEntry {
                object_id: format!("upload:{}", upload.id),
                user_id: upload.owner_id.clone(),
                bytes,
            });
        }
    }

    store.replace_storage_accounting(&entries)?;
    Ok(entries)
}
