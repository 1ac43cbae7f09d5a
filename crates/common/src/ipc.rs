//! Arrow IPC stream codec used for exchange payloads and spill blocks.

use std::io::Cursor;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use crate::error::{Result, TesseraError};

/// Encode batches as one Arrow IPC stream. An empty slice still carries the
/// schema so the receiver can rebuild an empty batch.
pub fn encode_batches(schema: &SchemaRef, batches: &[RecordBatch]) -> Result<Vec<u8>> {
    let mut out = Vec::<u8>::new();
    {
        let mut writer = arrow::ipc::writer::StreamWriter::try_new(&mut out, schema.as_ref())
            .map_err(|e| TesseraError::Execution(format!("ipc writer init failed: {e}")))?;
        for batch in batches {
            writer
                .write(batch)
                .map_err(|e| TesseraError::Execution(format!("ipc write failed: {e}")))?;
        }
        writer
            .finish()
            .map_err(|e| TesseraError::Execution(format!("ipc finish failed: {e}")))?;
    }
    Ok(out)
}

/// Decode an Arrow IPC stream produced by [`encode_batches`].
pub fn decode_batches(bytes: &[u8]) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let reader = arrow::ipc::reader::StreamReader::try_new(Cursor::new(bytes), None)
        .map_err(|e| TesseraError::Execution(format!("ipc reader init failed: {e}")))?;
    let schema = reader.schema();
    let batches = reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TesseraError::Execution(format!("ipc read failed: {e}")))?;
    Ok((schema, batches))
}
