use serde::{Deserialize, Serialize};

use crate::sync::SyncCounters;

/// Outcome of one single-host action
///
/// Invariants:
/// - `success` implies `error` is `None`
/// - for exec, `success` iff `exit_code == Some(0)`
/// - a transport fault yields `success == false`, `error` set and `exit_code` absent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
    pub elapsed: std::time::Duration,
    /// counters of a tree sync that completed its walk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncCounters>,
}

/// Results of one fan-out call keyed by host identity
pub type HostResults = std::collections::HashMap<String, OperationResult>;

impl OperationResult {
    /// Result of a remote command that ran to completion
    pub fn from_exit(output: ExecOutput, elapsed: std::time::Duration) -> Self {
        Self {
            success: output.exit_code == 0,
            exit_code: Some(output.exit_code),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            error: None,
            elapsed,
            sync: None,
        }
    }

    /// Successful transfer
    pub fn done(elapsed: std::time::Duration) -> Self {
        Self {
            success: true,
            elapsed,
            ..Default::default()
        }
    }

    /// Fault captured as data
    pub fn fault(error: impl std::fmt::Display, elapsed: std::time::Duration) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            elapsed,
            ..Default::default()
        }
    }

    /// One-line summary suitable for logs
    pub fn short(&self) -> String {
        let secs = self.elapsed.as_secs_f64();
        match (&self.error, self.exit_code) {
            (Some(error), _) => format!("error: {} {:.2}s", error, secs),
            (None, Some(0)) | (None, None) if self.success => format!("ok {:.2}s", secs),
            (None, Some(code)) => format!("exit {} {:.2}s", code, secs),
            (None, None) => format!("failed {:.2}s", secs),
        }
    }
}

impl std::fmt::Display for OperationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.short())
    }
}

/// Fully buffered output of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_decides_success() {
        let ok = OperationResult::from_exit(
            ExecOutput {
                exit_code: 0,
                stdout: b"hi\n".to_vec(),
                stderr: vec![],
            },
            std::time::Duration::from_millis(120),
        );
        assert!(ok.success);
        assert_eq!(ok.exit_code, Some(0));
        assert_eq!(ok.stdout, "hi\n");
        assert!(ok.error.is_none());
        assert_eq!(ok.short(), "ok 0.12s");

        let failed = OperationResult::from_exit(
            ExecOutput {
                exit_code: 3,
                stdout: vec![],
                stderr: b"boom".to_vec(),
            },
            std::time::Duration::ZERO,
        );
        assert!(!failed.success);
        assert_eq!(failed.exit_code, Some(3));
        assert!(failed.error.is_none());
        assert_eq!(failed.short(), "exit 3 0.00s");
    }

    #[test]
    fn fault_has_no_exit_code() {
        let fault = OperationResult::fault("channel closed", std::time::Duration::ZERO);
        assert!(!fault.success);
        assert!(fault.exit_code.is_none());
        assert_eq!(fault.error.as_deref(), Some("channel closed"));
        assert_eq!(fault.short(), "error: channel closed 0.00s");
    }

    #[test]
    fn invalid_utf8_is_decoded_lossily() {
        let result = OperationResult::from_exit(
            ExecOutput {
                exit_code: 0,
                stdout: vec![0x66, 0xff, 0x6f],
                stderr: vec![],
            },
            std::time::Duration::ZERO,
        );
        assert_eq!(result.stdout, "f\u{fffd}o");
    }
}
