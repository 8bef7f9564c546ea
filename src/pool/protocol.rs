//! IPC protocol for worker subprocess communication.
//!
//! Control messages are JSON-serialized and newline-delimited. A completed
//! phase call carries its result as an opaque fixed-layout blob; the blob is
//! decoded by the coordinator, not by the transport.

use serde::{Deserialize, Serialize};

/// Request from parent to worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PhaseRequest {
    /// Claim a rank, set up the worker directory, attach shared state.
    #[serde(rename = "bootstrap")]
    Bootstrap,

    /// Drain the event-index queue until the record count is final.
    #[serde(rename = "execute")]
    Execute,

    /// Wind down: stop and tear down the application lifecycle.
    #[serde(rename = "finalize")]
    Finalize,

    /// Graceful shutdown request.
    #[serde(rename = "exit")]
    Exit,
}

/// Response from worker to parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PhaseResponse {
    /// Worker process is up and reading requests.
    #[serde(rename = "ready")]
    Ready,

    /// A scheduled phase call returned; `result` is the WorkResult blob.
    #[serde(rename = "completed")]
    Completed { result: Vec<u8> },

    /// The worker could not run the phase call at all.
    #[serde(rename = "error")]
    Error { message: String },
}

impl PhaseRequest {
    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("PhaseRequest serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl PhaseResponse {
    /// Create a completed response from a result blob.
    pub fn completed(result: Vec<u8>) -> Self {
        Self::Completed { result }
    }

    /// Create an error response.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("PhaseResponse serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

/// Size of the fixed-layout result blob:
/// `[i32 error_code][i32 phase_tag][i32 payload]`, little-endian.
pub const WORK_RESULT_LEN: usize = 12;

const TAG_BOOTSTRAP: i32 = 0;
const TAG_EXECUTE: i32 = 1;
const TAG_FINALIZE: i32 = 2;

/// Payload value for phases that carry none.
const NO_PAYLOAD: i32 = -1;

/// Decoded phase completion, by phase tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Bootstrap finished; payload is the rank the worker claimed.
    Bootstrap { rank: u32 },
    /// Execute finished; payload is the number of records processed.
    Execute { processed: u32 },
    /// Finalize finished; no payload.
    Finalize,
}

/// A decoded worker phase result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkResult {
    /// Zero on success; any other value marks the phase call as failed.
    pub error_code: i32,
    pub outcome: PhaseOutcome,
}

impl WorkResult {
    pub fn bootstrap(error_code: i32, rank: u32) -> Self {
        Self {
            error_code,
            outcome: PhaseOutcome::Bootstrap { rank },
        }
    }

    pub fn execute(error_code: i32, processed: u32) -> Self {
        Self {
            error_code,
            outcome: PhaseOutcome::Execute { processed },
        }
    }

    pub fn finalize(error_code: i32) -> Self {
        Self {
            error_code,
            outcome: PhaseOutcome::Finalize,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_code == 0
    }

    /// Encode to the fixed 12-byte wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let (tag, payload) = match self.outcome {
            PhaseOutcome::Bootstrap { rank } => (TAG_BOOTSTRAP, rank as i32),
            PhaseOutcome::Execute { processed } => (TAG_EXECUTE, processed as i32),
            PhaseOutcome::Finalize => (TAG_FINALIZE, NO_PAYLOAD),
        };
        let mut buf = Vec::with_capacity(WORK_RESULT_LEN);
        buf.extend_from_slice(&self.error_code.to_le_bytes());
        buf.extend_from_slice(&tag.to_le_bytes());
        buf.extend_from_slice(&payload.to_le_bytes());
        buf
    }

    /// Decode from the fixed wire layout.
    ///
    /// Returns `None` for undersized or unrecognized blobs; callers treat
    /// that as a no-op rather than an error.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < WORK_RESULT_LEN {
            return None;
        }
        let error_code = i32::from_le_bytes(buf[0..4].try_into().ok()?);
        let tag = i32::from_le_bytes(buf[4..8].try_into().ok()?);
        let payload = i32::from_le_bytes(buf[8..12].try_into().ok()?);

        let outcome = match tag {
            TAG_BOOTSTRAP => PhaseOutcome::Bootstrap {
                rank: payload.max(0) as u32,
            },
            TAG_EXECUTE => PhaseOutcome::Execute {
                processed: payload.max(0) as u32,
            },
            TAG_FINALIZE => PhaseOutcome::Finalize,
            _ => return None,
        };
        Some(Self { error_code, outcome })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_request_roundtrip() {
        for req in [
            PhaseRequest::Bootstrap,
            PhaseRequest::Execute,
            PhaseRequest::Finalize,
            PhaseRequest::Exit,
        ] {
            let line = req.to_line();
            assert!(line.ends_with('\n'));
            assert_eq!(PhaseRequest::from_line(&line).unwrap(), req);
        }
    }

    #[test]
    fn test_phase_response_roundtrip() {
        let resp = PhaseResponse::completed(WorkResult::execute(0, 17).encode());
        let line = resp.to_line();
        let parsed = PhaseResponse::from_line(&line).unwrap();
        assert_eq!(parsed, resp);

        let resp = PhaseResponse::error("queue attach failed");
        let parsed = PhaseResponse::from_line(&resp.to_line()).unwrap();
        match parsed {
            PhaseResponse::Error { message } => assert_eq!(message, "queue attach failed"),
            other => panic!("expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_work_result_execute_roundtrip() {
        let result = WorkResult::execute(0, 250);
        let blob = result.encode();
        assert_eq!(blob.len(), WORK_RESULT_LEN);
        assert_eq!(WorkResult::decode(&blob), Some(result));
    }

    #[test]
    fn test_work_result_finalize_roundtrip() {
        let result = WorkResult::finalize(0);
        let blob = result.encode();
        // Finalize carries no payload on the wire.
        assert_eq!(&blob[8..12], &(-1i32).to_le_bytes());
        assert_eq!(WorkResult::decode(&blob), Some(result));
    }

    #[test]
    fn test_work_result_failure_code_survives() {
        let result = WorkResult::execute(3, 7);
        let decoded = WorkResult::decode(&result.encode()).unwrap();
        assert!(!decoded.is_success());
        assert_eq!(decoded.error_code, 3);
        assert_eq!(decoded.outcome, PhaseOutcome::Execute { processed: 7 });
    }

    #[test]
    fn test_undersized_blob_decodes_to_none() {
        assert_eq!(WorkResult::decode(&[]), None);
        assert_eq!(WorkResult::decode(&[0, 0, 0, 0]), None);
        assert_eq!(WorkResult::decode(&[0; WORK_RESULT_LEN - 1]), None);
    }

    #[test]
    fn test_unknown_tag_decodes_to_none() {
        let mut blob = WorkResult::execute(0, 1).encode();
        blob[4..8].copy_from_slice(&99i32.to_le_bytes());
        assert_eq!(WorkResult::decode(&blob), None);
    }

    #[test]
    fn test_oversized_blob_ignores_trailing_bytes() {
        let mut blob = WorkResult::bootstrap(0, 2).encode();
        blob.extend_from_slice(&[0xAA; 4]);
        assert_eq!(WorkResult::decode(&blob), Some(WorkResult::bootstrap(0, 2)));
    }
}
