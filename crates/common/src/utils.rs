//! Utility functions for the engine pipeline
//!
//! This module provides utility functions used throughout the pipeline crates.

use std::time::{Duration, Instant};
use crate::error::{Error, Result};

/// Formats a byte size into a human-readable string
///
/// # Examples
///
/// ```
/// use common::utils::format_bytes;
///
/// assert_eq!(format_bytes(1024), "1.0 KiB");
/// assert_eq!(format_bytes(1048576), "1.0 MiB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    bytesize::ByteSize::b(bytes).to_string_as(true)
}

/// Formats a duration into a human-readable string
///
/// # Examples
///
/// ```
/// use common::utils::format_duration;
/// use std::time::Duration;
///
/// assert_eq!(format_duration(Duration::from_millis(1500)), "1.500s");
/// assert_eq!(format_duration(Duration::from_micros(250)), "250µs");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let micros = duration.as_micros();
    if micros < 1_000 {
        format!("{}µs", micros)
    } else if micros < 1_000_000 {
        format!("{:.3}ms", micros as f64 / 1_000.0)
    } else {
        format!("{:.3}s", duration.as_secs_f64())
    }
}

/// Measures the execution time of a function
pub fn measure_execution_time<T, F>(f: F) -> Result<(T, Duration)>
where
    F: FnOnce() -> Result<T>,
{
    let start = Instant::now();
    let result = f()?;
    let duration = start.elapsed();
    Ok((result, duration))
}

/// Decodes raw little-endian f32 bytes, checking the element count
pub fn f32_from_le_bytes(bytes: &[u8], expected_elements: usize) -> Result<Vec<f32>> {
    let expected_bytes = expected_elements * std::mem::size_of::<f32>();
    if bytes.len() != expected_bytes {
        return Err(Error::io(format!(
            "expected {} bytes ({} f32 values), got {} bytes",
            expected_bytes,
            expected_elements,
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Encodes f32 values as raw little-endian bytes
pub fn f32_to_le_bytes(values: &[f32]) -> Vec<u8> {
    if cfg!(target_endian = "little") {
        bytemuck::cast_slice(values).to_vec()
    } else {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_bytes_roundtrip() {
        let values = [0.0f32, -1.5, 3.25, f32::MAX];
        let bytes = f32_to_le_bytes(&values);
        assert_eq!(bytes.len(), 16);
        assert_eq!(f32_from_le_bytes(&bytes, 4).unwrap(), values.to_vec());
    }

    #[test]
    fn test_f32_from_le_bytes_rejects_wrong_size() {
        let err = f32_from_le_bytes(&[0u8; 10], 4).unwrap_err();
        assert!(err.is_io());
    }

    #[test]
    fn test_measure_execution_time() {
        let (value, duration) = measure_execution_time(|| Ok(42)).unwrap();
        assert_eq!(value, 42);
        assert!(duration <= Duration::from_secs(1));
    }
}
