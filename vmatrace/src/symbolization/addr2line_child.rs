//! Long-lived `addr2line` child process per module
//!
//! The child is started as `<helper> -f -C -e <module>` and answers every
//! address written to its stdin with exactly two lines: the function name
//! and `file:line`. Its stdout is switched to non-blocking mode so a child
//! that hangs or dies can never stall the replay; reads are polled up to a
//! bounded number of attempts.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use super::SymbolSource;
use crate::domain::ResolverError;

/// Poll attempts before an answer is considered lost
const DEFAULT_POLL_LIMIT: u32 = 500;
const POLL_INTERVAL: Duration = Duration::from_millis(2);

pub struct Addr2lineChild {
    module: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    pending: Vec<u8>,
    poll_limit: u32,
    closed: bool,
}

impl Addr2lineChild {
    /// Start `<helper> -f -C -e <module>`.
    ///
    /// No `-i`: inline chains vary in length with no terminator, and every
    /// answer must stay exactly two lines.
    ///
    /// # Errors
    /// `ResolverError::Spawn` if the helper cannot be started.
    pub fn spawn(helper: &str, module: &str) -> Result<Self, ResolverError> {
        let mut cmd = Command::new(helper);
        cmd.args(["-f", "-C", "-e", module]);
        Self::from_command(cmd, module)
    }

    /// Start an arbitrary command speaking the two-line protocol.
    ///
    /// # Errors
    /// `ResolverError::Spawn` if the command cannot be started or its pipes
    /// cannot be set up.
    pub fn from_command(mut cmd: Command, module: &str) -> Result<Self, ResolverError> {
        let program = cmd.get_program().to_string_lossy().into_owned();
        let spawn_err = |error: io::Error| ResolverError::Spawn {
            program: program.clone(),
            module: module.to_string(),
            error,
        };

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(spawn_err)?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(spawn_err(io::Error::other("child pipes unavailable")));
        };
        if let Err(e) = set_nonblocking(stdout.as_raw_fd()) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(spawn_err(e));
        }

        debug!("started {program} for {module} (pid {})", child.id());
        Ok(Self {
            module: module.to_string(),
            child,
            stdin: Some(stdin),
            stdout,
            pending: Vec::new(),
            poll_limit: DEFAULT_POLL_LIMIT,
            closed: false,
        })
    }

    /// Override how many times a read is polled before giving up
    #[must_use]
    pub fn with_poll_limit(mut self, limit: u32) -> Self {
        self.poll_limit = limit.max(1);
        self
    }

    fn read_answer(&mut self) -> Result<(String, String), ResolverError> {
        let mut buf = [0u8; 4096];
        let mut attempts = 0;
        loop {
            if let Some(answer) = self.take_two_lines() {
                return Ok(answer);
            }
            match self.stdout.read(&mut buf) {
                Ok(0) => return Err(ResolverError::ChildExited(self.module.clone())),
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.child.try_wait()?.is_some() {
                        return Err(ResolverError::ChildExited(self.module.clone()));
                    }
                    attempts += 1;
                    if attempts >= self.poll_limit {
                        return Err(ResolverError::Timeout(self.module.clone()));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn take_two_lines(&mut self) -> Option<(String, String)> {
        let first = self.pending.iter().position(|&b| b == b'\n')?;
        let second = first + 1 + self.pending[first + 1..].iter().position(|&b| b == b'\n')?;
        let function = String::from_utf8_lossy(&self.pending[..first]).trim().to_string();
        let location = String::from_utf8_lossy(&self.pending[first + 1..second]).trim().to_string();
        self.pending.drain(..=second);
        Some((function, location))
    }
}

impl SymbolSource for Addr2lineChild {
    fn lookup(&mut self, addr: u64) -> Result<String, ResolverError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ResolverError::ChildExited(self.module.clone()))?;
        if let Err(e) = writeln!(stdin, "0x{addr:x}").and_then(|()| stdin.flush()) {
            return Err(if e.kind() == io::ErrorKind::BrokenPipe {
                ResolverError::ChildExited(self.module.clone())
            } else {
                e.into()
            });
        }

        let (function, _location) = self.read_answer()?;
        if function.contains('?') {
            Ok(String::new())
        } else {
            Ok(function)
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // EOF on stdin ends the child's read loop
        drop(self.stdin.take());
        match self.child.try_wait() {
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Err(e) = self.child.wait() {
                    warn!("waiting for resolver of {} failed: {e}", self.module);
                }
            }
            Err(e) => warn!("resolver of {} is not waitable: {e}", self.module),
        }
    }
}

impl Drop for Addr2lineChild {
    fn drop(&mut self) {
        self.close();
    }
}

#[allow(unsafe_code)]
fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: `fd` belongs to a live ChildStdout for the duration of both calls
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above; only the status flags of the descriptor change
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(body: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", body]);
        cmd
    }

    #[test]
    fn test_two_line_protocol() {
        let cmd = script("while read a; do echo fn_$a; echo file.c:1; done");
        let mut child = Addr2lineChild::from_command(cmd, "/bin/fake").unwrap();
        assert_eq!(child.lookup(0x10).unwrap(), "fn_0x10");
        assert_eq!(child.lookup(0xabc).unwrap(), "fn_0xabc");
        child.close();
    }

    #[test]
    fn test_question_marks_become_empty() {
        let cmd = script("while read a; do echo '??'; echo '??:0'; done");
        let mut child = Addr2lineChild::from_command(cmd, "/bin/fake").unwrap();
        assert_eq!(child.lookup(0x10).unwrap(), "");
    }

    #[test]
    fn test_dead_child_is_reported() {
        let cmd = script("exit 0");
        let mut child = Addr2lineChild::from_command(cmd, "/bin/fake").unwrap().with_poll_limit(50);
        thread::sleep(Duration::from_millis(50));
        assert!(matches!(
            child.lookup(0x10),
            Err(ResolverError::ChildExited(_) | ResolverError::Io(_))
        ));
    }

    #[test]
    fn test_silent_child_times_out() {
        let cmd = script("while read a; do :; done");
        let mut child = Addr2lineChild::from_command(cmd, "/bin/fake").unwrap().with_poll_limit(5);
        assert!(matches!(child.lookup(0x10), Err(ResolverError::Timeout(_))));
    }

    #[test]
    fn test_missing_helper_fails_to_spawn() {
        let result = Addr2lineChild::spawn("/nonexistent/addr2line", "/bin/true");
        assert!(matches!(result, Err(ResolverError::Spawn { .. })));
    }
}
