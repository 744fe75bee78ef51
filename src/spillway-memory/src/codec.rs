//! Host-tier encoding of spilled batches.
//!
//! Spilled batches are kept as Arrow IPC stream bytes, which preserve the
//! column layout and load back without per-value decoding.

use std::io::Cursor;

use arrow_array::{Array, RecordBatch};
use arrow_ipc::reader::StreamReader;
use arrow_ipc::writer::StreamWriter;

use common_error::{SpillwayError, SpillwayResult};

/// Encode one batch as an Arrow IPC stream.
pub fn encode_batch(batch: &RecordBatch) -> SpillwayResult<Vec<u8>> {
    let schema = batch.schema();
    let mut buffer = Vec::new();

    {
        let mut writer = StreamWriter::try_new(&mut buffer, &schema)
            .map_err(|e| SpillwayError::spill(format!("failed to create IPC writer: {e}")))?;
        writer
            .write(batch)
            .map_err(|e| SpillwayError::spill(format!("failed to write batch: {e}")))?;
        writer
            .finish()
            .map_err(|e| SpillwayError::spill(format!("failed to finish IPC stream: {e}")))?;
    }

    Ok(buffer)
}

/// Decode a batch written by [`encode_batch`].
pub fn decode_batch(data: &[u8]) -> SpillwayResult<RecordBatch> {
    let reader = StreamReader::try_new(Cursor::new(data), None)
        .map_err(|e| SpillwayError::spill(format!("failed to create IPC reader: {e}")))?;

    let mut batches = reader
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SpillwayError::spill(format!("failed to read spilled batch: {e}")))?;

    match batches.len() {
        1 => Ok(batches.remove(0)),
        n => Err(SpillwayError::internal(format!(
            "spilled stream holds {n} batches, expected 1"
        ))),
    }
}

/// Bytes of device memory a batch is charged for.
///
/// Only the sliced region of each buffer counts, so halves of a split batch
/// are charged about half of the original.
pub fn batch_size_bytes(batch: &RecordBatch) -> usize {
    batch
        .columns()
        .iter()
        .map(|column| {
            column
                .to_data()
                .get_slice_memory_size()
                .unwrap_or_else(|_| column.get_array_memory_size())
        })
        .sum()
}
