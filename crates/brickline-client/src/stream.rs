//! High-level stream assembly.
//!
//! Some device functions move more data than fits into one 64-byte payload.
//! Their generated proxies expose a low-level function that reads or writes
//! one chunk at a time, addressed in elements of a fixed bit width, plus a
//! high-level convenience that loops over the whole payload. The loops live
//! here; the proxies pass their low-level function as an async closure.
//!
//! The device streams chunks statelessly: a reader that starts mid-stream or
//! observes a length change is out of sync. In that case the remaining
//! chunks are drained so the next attempt starts clean, and the operation
//! reports [`DeviceError::OutOfSync`].
//!
//! Only one high-level operation per function index runs at a time per
//! device, guarded by the lock vector on [`Device`].

use brickline_proto::PacketBuf;

use crate::{device::Device, error::DeviceError};

/// Result of one low-level write call.
#[derive(Debug, Clone)]
pub struct LowLevelWrite {
    /// Number of payload bytes the device accepted.
    pub written: u64,
    /// Raw reply packet, carrying any extra return values.
    pub response: PacketBuf,
}

/// Result of one low-level read call.
#[derive(Debug, Clone)]
pub struct LowLevelRead {
    /// Total stream length in elements.
    pub length: u64,
    /// Offset of this chunk in elements.
    pub chunk_offset: u64,
    /// Chunk payload bytes.
    pub chunk_data: Vec<u8>,
    /// Raw reply packet, carrying any extra return values.
    pub response: PacketBuf,
}

impl Device {
    /// Stream `payload` to the device through a chunked low-level setter.
    ///
    /// `low_level` receives the total length in elements, the chunk offset in
    /// elements and the chunk bytes. An empty payload still produces exactly
    /// one call so the device observes the zero length. When the device
    /// reports a short write the loop stops and the result carries the total
    /// number of bytes written so far.
    ///
    /// # Errors
    ///
    /// Fails when the function index is out of range or a low-level call
    /// fails; the first failing call aborts the stream.
    pub async fn set_high_level<F>(
        &self,
        mut low_level: F,
        high_level_function_index: u8,
        element_size_bits: u64,
        chunk_len_bits: u64,
        payload: &[u8],
    ) -> Result<LowLevelWrite, DeviceError>
    where
        F: AsyncFnMut(u64, u64, &[u8]) -> Result<LowLevelWrite, DeviceError>,
    {
        let _guard = self.high_level_lock(high_level_function_index)?.lock().await;

        let total_bits = payload.len() as u64 * 8;
        let length = total_bits / element_size_bits;

        if length == 0 {
            return low_level(0, 0, &[]).await;
        }

        let mut offset_bits: u64 = 0;
        let mut written_bits: u64 = 0;
        loop {
            let to_write_bits = (offset_bits + chunk_len_bits).min(total_bits);
            let chunk = &payload[(offset_bits / 8) as usize..(to_write_bits / 8) as usize];
            let mut result = low_level(length, offset_bits / element_size_bits, chunk).await?;

            let written = result.written * 8;
            written_bits += written;
            if written < chunk_len_bits {
                // Device accepted less than a full chunk; the stream ends
                // here.
                result.written = written_bits / 8;
                return Ok(result);
            }

            offset_bits += chunk_len_bits;
            if offset_bits >= total_bits {
                result.written = total_bits / 8;
                return Ok(result);
            }
        }
    }

    /// Read a complete stream from the device through a chunked low-level
    /// getter.
    ///
    /// The first chunk fixes the stream length and must start at offset 0;
    /// every following chunk must continue where the previous one ended and
    /// report the same length. Returns the assembled payload and the last
    /// reply packet.
    ///
    /// # Errors
    ///
    /// [`DeviceError::OutOfSync`] after draining when the stream position
    /// does not match; low-level failures abort the read.
    pub async fn get_high_level<F>(
        &self,
        mut low_level: F,
        high_level_function_index: u8,
        element_size_bits: u64,
    ) -> Result<(Vec<u8>, PacketBuf), DeviceError>
    where
        F: AsyncFnMut() -> Result<LowLevelRead, DeviceError>,
    {
        let _guard = self.high_level_lock(high_level_function_index)?.lock().await;

        let mut result = low_level().await?;
        let message_length_bits = result.length * element_size_bits;
        let mut out_of_sync = result.chunk_offset != 0;

        if !out_of_sync {
            let mut assembled = Vec::with_capacity((message_length_bits / 8) as usize);
            let mut offset_bits: u64 = 0;

            let first_bits = (result.chunk_data.len() as u64 * 8).min(message_length_bits);
            assembled.extend_from_slice(&result.chunk_data[..(first_bits / 8) as usize]);
            offset_bits += first_bits;

            while offset_bits < message_length_bits {
                result = low_level().await?;
                out_of_sync = result.chunk_offset * element_size_bits != offset_bits
                    || result.length * element_size_bits != message_length_bits;
                if out_of_sync {
                    break;
                }
                let read_bits =
                    (result.chunk_data.len() as u64 * 8).min(message_length_bits - offset_bits);
                assembled.extend_from_slice(&result.chunk_data[..(read_bits / 8) as usize]);
                offset_bits += read_bits;
            }

            if !out_of_sync {
                return Ok((assembled, result.response));
            }
        }

        // Drain what the device still has queued so a retry starts clean.
        // A failing or empty chunk cannot make progress; stop there.
        let mut covered_bits = result.chunk_offset * element_size_bits;
        while covered_bits + result.chunk_data.len() as u64 * 8 < message_length_bits {
            if result.chunk_data.is_empty() {
                break;
            }
            covered_bits += result.chunk_data.len() as u64 * 8;
            match low_level().await {
                Ok(next) => result = next,
                Err(_) => break,
            }
        }
        Err(DeviceError::OutOfSync)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use brickline_proto::MAX_PACKET_SIZE;

    use super::*;
    use crate::connection::IpConnection;

    fn blank_response() -> PacketBuf {
        [0; MAX_PACKET_SIZE]
    }

    fn test_device() -> Device {
        Device::new([2, 0, 0], "62Cdj", &IpConnection::new(), 2, 13, "Test Device")
            .unwrap()
    }

    #[tokio::test]
    async fn empty_write_calls_low_level_exactly_once() {
        let device = test_device();
        let calls = Mutex::new(Vec::new());

        let result = device
            .set_high_level(
                async |length, offset, chunk: &[u8]| {
                    calls.lock().unwrap().push((length, offset, chunk.to_vec()));
                    Ok(LowLevelWrite { written: 0, response: blank_response() })
                },
                0,
                8,
                16 * 8,
                &[],
            )
            .await
            .unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![(0, 0, Vec::new())]);
        assert_eq!(result.written, 0);
    }

    #[tokio::test]
    async fn write_chunks_at_chunk_boundaries() {
        let device = test_device();
        let payload: Vec<u8> = (0..24).collect();
        let calls = Mutex::new(Vec::new());

        let result = device
            .set_high_level(
                async |length, offset, chunk: &[u8]| {
                    calls.lock().unwrap().push((length, offset, chunk.len()));
                    Ok(LowLevelWrite { written: chunk.len() as u64, response: blank_response() })
                },
                0,
                8,
                16 * 8,
                &payload,
            )
            .await
            .unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![(24, 0, 16), (24, 16, 8)]);
        assert_eq!(result.written, 24);
    }

    #[tokio::test]
    async fn short_write_stops_the_stream() {
        let device = test_device();
        let payload = [7u8; 48];
        let calls = Mutex::new(0u32);

        let result = device
            .set_high_level(
                async |_, _, chunk: &[u8]| {
                    let mut calls = calls.lock().unwrap();
                    *calls += 1;
                    let written = if *calls == 1 { chunk.len() as u64 } else { 4 };
                    Ok(LowLevelWrite { written, response: blank_response() })
                },
                0,
                8,
                16 * 8,
                &payload,
            )
            .await
            .unwrap();

        assert_eq!(*calls.lock().unwrap(), 2);
        assert_eq!(result.written, 20);
    }

    #[tokio::test]
    async fn read_assembles_in_order_chunks() {
        let device = test_device();
        let chunks = Mutex::new(vec![
            LowLevelRead {
                length: 5,
                chunk_offset: 0,
                chunk_data: vec![1, 2],
                response: blank_response(),
            },
            LowLevelRead {
                length: 5,
                chunk_offset: 2,
                chunk_data: vec![3, 4],
                response: blank_response(),
            },
            LowLevelRead {
                length: 5,
                chunk_offset: 4,
                chunk_data: vec![5, 99],
                response: blank_response(),
            },
        ]);

        let (assembled, _) = device
            .get_high_level(
                async || Ok(chunks.lock().unwrap().remove(0)),
                0,
                8,
            )
            .await
            .unwrap();

        // The trailing byte past the stream length is not copied.
        assert_eq!(assembled, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn read_starting_mid_stream_drains_and_reports_out_of_sync() {
        let device = test_device();
        let calls = Mutex::new(0u64);

        let result = device
            .get_high_level(
                async || {
                    let mut calls = calls.lock().unwrap();
                    *calls += 1;
                    Ok(LowLevelRead {
                        length: 8,
                        chunk_offset: 2 * *calls,
                        chunk_data: vec![0, 0],
                        response: blank_response(),
                    })
                },
                0,
                8,
            )
            .await;

        assert!(matches!(result, Err(DeviceError::OutOfSync)));
        // First chunk came back at offset 2 of 8, so two more pulls drain
        // the remaining six elements.
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn read_with_length_change_reports_out_of_sync() {
        let device = test_device();
        let calls = Mutex::new(0u64);

        let result = device
            .get_high_level(
                async || {
                    let mut calls = calls.lock().unwrap();
                    *calls += 1;
                    let length = if *calls == 1 { 6 } else { 4 };
                    Ok(LowLevelRead {
                        length,
                        chunk_offset: 2 * (*calls - 1),
                        chunk_data: vec![0, 0],
                        response: blank_response(),
                    })
                },
                0,
                8,
            )
            .await;

        assert!(matches!(result, Err(DeviceError::OutOfSync)));
    }

    #[tokio::test]
    async fn unknown_high_level_function_index_is_rejected() {
        let device = test_device();
        let result = device
            .set_high_level(
                async |_, _, _: &[u8]| {
                    Ok(LowLevelWrite { written: 0, response: blank_response() })
                },
                9,
                8,
                16 * 8,
                &[],
            )
            .await;

        assert!(matches!(result, Err(DeviceError::UnknownFunction(9))));
    }
}
