//! Host data files
//!
//! Input and output tensors are stored as raw little-endian f32 values with
//! no header. Sizes are checked against the engine's binding shapes.

use std::path::Path;
use tokio::fs;
use tracing::debug;

use common::error::{Error, Result};
use common::utils::{f32_from_le_bytes, f32_to_le_bytes, format_bytes};

/// Reads whole samples of `sample_len` values, between 1 and `max_batch`
///
/// Returns the values and the number of samples found.
pub async fn read_samples(path: &Path, sample_len: usize, max_batch: usize) -> Result<(Vec<f32>, usize)> {
    let bytes = fs::read(path)
        .await
        .map_err(|e| Error::io(format!("failed to read {}: {}", path.display(), e)))?;

    let sample_bytes = sample_len * 4;
    if sample_bytes == 0 || bytes.is_empty() || bytes.len() % sample_bytes != 0 {
        return Err(Error::io(format!(
            "{} holds {} bytes, not a whole number of {}-byte samples",
            path.display(),
            bytes.len(),
            sample_bytes
        )));
    }

    let batch = bytes.len() / sample_bytes;
    if batch > max_batch {
        return Err(Error::io(format!(
            "{} holds {} samples but the engine accepts at most {}",
            path.display(),
            batch,
            max_batch
        )));
    }

    let values = f32_from_le_bytes(&bytes, batch * sample_len)?;
    debug!(
        "Read {} samples ({}) from {}",
        batch,
        format_bytes(bytes.len() as u64),
        path.display()
    );
    Ok((values, batch))
}

/// Writes `values` as raw little-endian f32, creating parent directories
pub async fn write_values(path: &Path, values: &[f32]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    let bytes = f32_to_le_bytes(values);
    fs::write(path, &bytes)
        .await
        .map_err(|e| Error::io(format!("failed to write {}: {}", path.display(), e)))?;

    debug!("Wrote {} to {}", format_bytes(bytes.len() as u64), path.display());
    Ok(())
}
