//! Transfer status codes and messages
//!
//! Every public status query answers with a `(code, message)` pair. Codes
//! are stable integers shared with the front ends.

use serde::{Serialize, Serializer};
use std::fmt;

/// Fixed user-facing messages
pub mod messages {
    pub const UNKNOWN: &str = "Unknown status; internal error.";
    pub const TRANSFER_WRAPPER_NOT_LAUNCHED: &str = "Transfer wrapper has not been launched.";
    pub const OBJECT_IN_CACHE: &str = "Object was in cache; transfer done.";
    pub const WAITING_FOR_SRM: &str = "Waiting for SRM transfer to start";
    pub const GRIDFTP_NO_MOVEMENT: &str = "GridFTP transfer started, but data movement has not begun.";
    pub const TRANSFER_PROCESS_NOT_STARTED: &str = "Transfer process has not started.";
    pub const FILE_DONE: &str = "File completed successfully.";
    pub const TRANSFER_STATUS_UNKNOWN: &str = "Unknown transfer status.";
    pub const LFN_NOT_REQUESTED: &str = "This LFN has not been requested yet!";
    pub const REQUESTED: &str = "Requested.";
    pub const CANCELLED: &str = "File cancelled.";
    pub const RETRYING: &str = "Transfer failed; retrying from another site.";

    /// Progress line while bytes are arriving. `percent` is either empty or
    /// of the form `45.0%,`.
    pub fn in_progress(percent: &str, bytes: u64) -> String {
        let megabytes = bytes as f64 / (1024.0 * 1024.0);
        if percent.is_empty() {
            format!("Data moving; {:.1} MB complete.", megabytes)
        } else {
            format!("Data moving; {} {:.1} MB complete.", percent, megabytes)
        }
    }

    pub fn transfer_failed(code: i32) -> String {
        format!("File failed; transfer status code {}.", code)
    }
}

/// Stable status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    Unknown = -1,
    Done = 0,
    TransferProcessNotStarted = 1,
    InProgress = 2,
    Failed = 3,
    TransferStatusUnknown = 4,
    TransferFailed = 5,
    TransferWrapperNotLaunched = 6,
    LfnNotRequested = 8,
    Requested = 9,
    Cancelled = 10,
}

impl StatusCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_failure(self) -> bool {
        matches!(self, StatusCode::Failed | StatusCode::TransferFailed)
    }

    pub fn is_terminal(self) -> bool {
        self.is_failure() || matches!(self, StatusCode::Done | StatusCode::Cancelled)
    }
}

impl Serialize for StatusCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.code())
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Status code and message pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferStatus {
    pub code: StatusCode,
    pub message: String,
}

impl TransferStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unknown() -> Self {
        Self::new(StatusCode::Unknown, messages::UNKNOWN)
    }

    pub fn not_requested() -> Self {
        Self::new(StatusCode::LfnNotRequested, messages::LFN_NOT_REQUESTED)
    }

    /// Resolved and waiting for a free worker.
    pub fn requested() -> Self {
        Self::new(StatusCode::Requested, messages::REQUESTED)
    }

    pub fn cached() -> Self {
        Self::new(StatusCode::Done, messages::OBJECT_IN_CACHE)
    }

    pub fn done() -> Self {
        Self::new(StatusCode::Done, messages::FILE_DONE)
    }

    pub fn cancelled() -> Self {
        Self::new(StatusCode::Cancelled, messages::CANCELLED)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Failed, message)
    }

    pub fn is_failure(&self) -> bool {
        self.code.is_failure()
    }

    pub fn is_terminal(&self) -> bool {
        self.code.is_terminal()
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(StatusCode::Unknown.code(), -1);
        assert_eq!(StatusCode::Done.code(), 0);
        assert_eq!(StatusCode::InProgress.code(), 2);
        assert_eq!(StatusCode::TransferFailed.code(), 5);
        assert_eq!(StatusCode::Requested.code(), 9);
        assert_eq!(StatusCode::Cancelled.code(), 10);
    }

    #[test]
    fn test_failure_and_terminal() {
        assert!(StatusCode::Failed.is_failure());
        assert!(StatusCode::TransferFailed.is_failure());
        assert!(!StatusCode::Done.is_failure());
        assert!(StatusCode::Done.is_terminal());
        assert!(StatusCode::Cancelled.is_terminal());
        assert!(!StatusCode::InProgress.is_terminal());
        assert!(!StatusCode::TransferStatusUnknown.is_terminal());
    }

    #[test]
    fn test_progress_message() {
        assert_eq!(
            messages::in_progress("45.0%,", 3 * 1024 * 1024),
            "Data moving; 45.0%, 3.0 MB complete."
        );
        assert_eq!(messages::in_progress("", 1024 * 1024 / 2), "Data moving; 0.5 MB complete.");
        assert_eq!(messages::transfer_failed(-15), "File failed; transfer status code -15.");
    }

    #[test]
    fn test_serializes_numeric_code() {
        let json = serde_json::to_value(TransferStatus::cached()).unwrap();
        assert_eq!(json["code"], 0);
        assert_eq!(json["message"], messages::OBJECT_IN_CACHE);
    }
}
