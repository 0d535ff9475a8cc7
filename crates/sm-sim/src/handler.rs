//! Data mode handler that records what it is given

use std::sync::{Arc, Mutex};

use sm_host::{DataModeFlags, DataModeHandler, HostContext};
use sm_pipe::lock;

/// Everything a [`RecordingHandler`] has seen
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recording {
    /// Payload chunks in delivery order
    pub chunks: Vec<Vec<u8>>,
    /// Flags passed with each chunk
    pub flags: Vec<DataModeFlags>,
    /// Flags passed to each exit call
    pub exits: Vec<DataModeFlags>,
}

impl Recording {
    /// All chunks joined
    pub fn payload(&self) -> Vec<u8> {
        self.chunks.concat()
    }
}

/// Records chunks and exits into shared state; clones share the same recording
#[derive(Debug, Clone, Default)]
pub struct RecordingHandler {
    log: Arc<Mutex<Recording>>,
    fail_with: Option<i32>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler whose every send fails with `code`
    pub fn failing(code: i32) -> Self {
        Self {
            fail_with: Some(code),
            ..Self::default()
        }
    }

    /// Snapshot of the recording
    pub fn recording(&self) -> Recording {
        lock(&self.log).clone()
    }

    pub fn clear(&self) {
        *lock(&self.log) = Recording::default();
    }
}

impl DataModeHandler for RecordingHandler {
    fn send(&mut self, data: &[u8], flags: DataModeFlags) -> Result<usize, i32> {
        if let Some(code) = self.fail_with {
            return Err(code);
        }
        let mut log = lock(&self.log);
        log.chunks.push(data.to_vec());
        log.flags.push(flags);
        Ok(data.len())
    }

    fn exit(&mut self, flags: DataModeFlags, _ctx: &mut dyn HostContext) {
        lock(&self.log).exits.push(flags);
    }
}
