#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,

    /// One or more sessions ended in connect failure, transmit failure, timeout or abort.
    SessionsFailed = 10,

    /// The session script failed validation (duplicate call ids, steps after close, ...).
    ScriptError = 20,

    /// Invalid CLI/profile input (bad flags, unreadable profile, invalid stages or identities).
    InvalidInput = 30,

    /// Internal/runtime error (IO errors, unexpected invariants).
    RuntimeError = 40,
}

impl ExitCode {
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    #[must_use]
    pub fn from_failed_sessions(failed: u64) -> Self {
        if failed > 0 {
            Self::SessionsFailed
        } else {
            Self::Success
        }
    }
}
