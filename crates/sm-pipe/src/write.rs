//! Blocking write path
//!
//! Only the serialized worker writes this way. It keeps handing bytes to the pipe and
//! parks on the transmit-idle signal whenever the pipe's buffer is full.

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::PipeError;
use crate::Pipe;

/// Write all of `data`, waiting on `idle` whenever the pipe accepts nothing
///
/// `idle` must be notified on `TransmitIdle` and on `Closed`. Returns the number of
/// bytes sent; if the pipe closes midway the rest is dropped.
pub async fn write_all_blocking(pipe: &dyn Pipe, data: &[u8], idle: &Notify) -> usize {
    let mut sent = 0;
    while sent < data.len() {
        match pipe.transmit(&data[sent..]) {
            Ok(0) => idle.notified().await,
            Ok(n) => sent += n,
            Err(PipeError::NotOpen) | Err(PipeError::AlreadyClosed) => {
                debug!(dropped = data.len() - sent, "pipe closed during write");
                break;
            }
            Err(e) => {
                warn!(dropped = data.len() - sent, "write failed: {}", e);
                break;
            }
        }
    }
    sent
}
