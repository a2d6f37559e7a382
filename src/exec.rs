// SPDX-License-Identifier: MIT OR Apache-2.0

use std::io::{self, BufRead, Write};
use std::sync::Mutex;

use log::error;

/// Reasons the exec halts. The code is what lands on the operator console.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopCode {
    ConsoleResponseRequiresReboot,
    DirectoryErrors,
    ExecRequestForMassStorageFailed,
    InitializationSystemConfigurationError,
    InternalExecIOFailed,
}

impl StopCode {
    pub fn code(self) -> u64 {
        match self {
            StopCode::ConsoleResponseRequiresReboot => 0o055,
            StopCode::DirectoryErrors => 0o064,
            StopCode::ExecRequestForMassStorageFailed => 0o052,
            StopCode::InitializationSystemConfigurationError => 0o051,
            StopCode::InternalExecIOFailed => 0o040,
        }
    }
}

/// The seam between the directory subsystem and the rest of the exec:
/// operator messages and the stop switch.
pub trait ExecLink: Send + Sync {
    fn send_read_only_message(&self, message: &str);

    /// Posts a read-reply message and blocks for one of the candidate
    /// replies. Matching is case-insensitive; the canonical candidate is
    /// returned.
    fn send_read_reply_message(&self, message: &str, candidates: &[&str]) -> io::Result<String>;

    fn stop(&self, code: StopCode);

    fn stop_code(&self) -> Option<StopCode>;
}

/// Operator console on stdin/stdout.
pub struct ConsoleExec {
    stopped: Mutex<Option<StopCode>>,
}

impl ConsoleExec {
    pub fn new() -> Self {
        ConsoleExec {
            stopped: Mutex::new(None),
        }
    }
}

impl Default for ConsoleExec {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecLink for ConsoleExec {
    fn send_read_only_message(&self, message: &str) {
        println!("  {}", message);
    }

    fn send_read_reply_message(&self, message: &str, candidates: &[&str]) -> io::Result<String> {
        let stdin = io::stdin();
        loop {
            print!("? {} ", message);
            io::stdout().flush()?;
            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "console closed",
                ));
            }
            let reply = line.trim();
            if let Some(hit) = candidates.iter().find(|c| c.eq_ignore_ascii_case(reply)) {
                return Ok(hit.to_string());
            }
        }
    }

    fn stop(&self, code: StopCode) {
        error!("exec stop {:03o} ({:?})", code.code(), code);
        *self.stopped.lock().unwrap() = Some(code);
    }

    fn stop_code(&self) -> Option<StopCode> {
        *self.stopped.lock().unwrap()
    }
}

/// Console with pre-recorded replies, for unattended initialization and for
/// tests.
pub struct AutoConsole {
    reply: String,
    quiet: bool,
    stopped: Mutex<Option<StopCode>>,
}

impl AutoConsole {
    pub fn replying(reply: &str) -> Self {
        AutoConsole {
            reply: reply.to_string(),
            quiet: false,
            stopped: Mutex::new(None),
        }
    }

    pub fn quiet(reply: &str) -> Self {
        AutoConsole {
            reply: reply.to_string(),
            quiet: true,
            stopped: Mutex::new(None),
        }
    }
}

impl ExecLink for AutoConsole {
    fn send_read_only_message(&self, message: &str) {
        if !self.quiet {
            println!("  {}", message);
        }
    }

    fn send_read_reply_message(&self, message: &str, candidates: &[&str]) -> io::Result<String> {
        if !self.quiet {
            println!("? {} -> {}", message, self.reply);
        }
        candidates
            .iter()
            .find(|c| c.eq_ignore_ascii_case(&self.reply))
            .map(|c| c.to_string())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "no matching canned reply")
            })
    }

    fn stop(&self, code: StopCode) {
        error!("exec stop {:03o} ({:?})", code.code(), code);
        *self.stopped.lock().unwrap() = Some(code);
    }

    fn stop_code(&self) -> Option<StopCode> {
        *self.stopped.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_console_matches_case_insensitively() {
        let console = AutoConsole::quiet("y");
        let reply = console
            .send_read_reply_message("continue?", &["Y", "N"])
            .unwrap();
        assert_eq!(reply, "Y");
    }

    #[test]
    fn stop_code_is_sticky() {
        let console = AutoConsole::quiet("Y");
        assert_eq!(console.stop_code(), None);
        console.stop(StopCode::DirectoryErrors);
        assert_eq!(console.stop_code(), Some(StopCode::DirectoryErrors));
    }
}
