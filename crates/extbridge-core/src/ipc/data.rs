//! Data-channel helpers.
//!
//! The data channel carries raw frames only: one frame of little-endian
//! `f64` samples answering a `readData` reverse call, or a numeric buffer
//! followed by a status buffer after a `readSingle` response.

use super::protocol::{read_frame, write_frame};
use crate::error::{BridgeError, Result};
use tokio::io::{AsyncRead, AsyncWrite};

const F64_SIZE: usize = std::mem::size_of::<f64>();

/// Largest buffer a single frame can carry.
pub const MAX_BUFFER_LENGTH: usize = u32::MAX as usize;

/// Byte length of `samples` elements of `element_size` bytes, if it fits in
/// one frame.
pub fn buffer_length(samples: usize, element_size: usize) -> Result<usize> {
    samples
        .checked_mul(element_size)
        .filter(|&len| len <= MAX_BUFFER_LENGTH)
        .ok_or_else(|| BridgeError::InvalidParams {
            message: format!(
                "{samples} samples of {element_size} bytes exceed the {MAX_BUFFER_LENGTH} byte frame limit"
            ),
        })
}

/// Result of a `readSingle` call: raw elements plus one status byte each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkPayload {
    pub data: Vec<u8>,
    pub status: Vec<u8>,
}

impl BulkPayload {
    /// Zeroed buffers for `samples` elements of `element_size` bytes.
    ///
    /// Fails with `InvalidParams` before allocating if the data buffer would
    /// not fit in one frame.
    pub fn zeroed(samples: usize, element_size: usize) -> Result<Self> {
        let len = buffer_length(samples, element_size)?;
        buffer_length(samples, 1)?;
        Ok(Self {
            data: vec![0; len],
            status: vec![0; samples],
        })
    }

    /// Number of samples, checked against the data buffer length.
    pub fn validate(&self, element_size: usize) -> Result<usize> {
        if element_size == 0 || self.data.len() % element_size != 0 {
            return Err(BridgeError::protocol(format!(
                "data buffer of {} bytes is not a multiple of element size {element_size}",
                self.data.len()
            )));
        }

        let samples = self.data.len() / element_size;
        if samples != self.status.len() {
            return Err(BridgeError::protocol(format!(
                "data buffer holds {samples} samples but status buffer has {} bytes",
                self.status.len()
            )));
        }
        Ok(samples)
    }

    /// Write the numeric buffer then the status buffer, each as one frame.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        write_frame(writer, &self.data).await?;
        write_frame(writer, &self.status).await
    }

    /// Read a numeric and a status frame and check that they agree.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R, element_size: usize) -> Result<Self> {
        let data = read_frame(reader).await?;
        let status = read_frame(reader).await?;
        let payload = Self { data, status };
        payload.validate(element_size)?;
        Ok(payload)
    }

    /// Decode the data buffer as little-endian `f64` samples.
    pub fn samples_f64(&self) -> Result<Vec<f64>> {
        let mut samples = vec![0.0; self.data.len() / F64_SIZE];
        unpack_f64(&self.data, &mut samples)?;
        Ok(samples)
    }

    /// Whether every sample is marked present.
    pub fn all_present(&self) -> bool {
        self.status.iter().all(|&s| s != 0)
    }
}

/// Read one frame that must be exactly `expected` bytes long.
pub async fn read_buffer_exact<R: AsyncRead + Unpin>(reader: &mut R, expected: usize) -> Result<Vec<u8>> {
    let frame = read_frame(reader).await?;
    if frame.len() != expected {
        return Err(BridgeError::protocol(format!(
            "expected a data frame of {expected} bytes, received {}",
            frame.len()
        )));
    }
    Ok(frame)
}

/// Encode samples as little-endian `f64`.
pub fn pack_f64(samples: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * F64_SIZE);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Decode little-endian `f64` bytes into `target`, which must fit exactly.
pub fn unpack_f64(bytes: &[u8], target: &mut [f64]) -> Result<()> {
    if bytes.len() != target.len() * F64_SIZE {
        return Err(BridgeError::protocol(format!(
            "{} bytes do not hold {} f64 samples",
            bytes.len(),
            target.len()
        )));
    }

    for (chunk, slot) in bytes.chunks_exact(F64_SIZE).zip(target.iter_mut()) {
        let mut raw = [0u8; F64_SIZE];
        raw.copy_from_slice(chunk);
        *slot = f64::from_le_bytes(raw);
    }
    Ok(())
}
