//! Atomic file writes: write to a `.tmp-<rand>` sibling, then rename over
//! the destination. Both steps must succeed or the tmp file is unlinked
//! (spec §4.1).

use rand::Rng;
use std::path::{Path, PathBuf};
use tokio::fs;

fn random_hex() -> String {
    let bytes: [u8; 8] = rand::rng().random();
    hex::encode(bytes)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".tmp-{}-{}", random_hex(), file_name))
}

/// Writes `content` to `path` via a tmp file + rename. On any failure the
/// tmp file is removed before the error is returned, so no `.tmp-*` file
/// is ever left behind in the target directory.
pub async fn atomic_write(path: &Path, content: &str) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp_path = tmp_path_for(path);

    if let Err(e) = fs::write(&tmp_path, content).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    if let Err(e) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    Ok(())
}
