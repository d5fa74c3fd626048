use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::ShellConfig;

/// Manages a pseudo-terminal (PTY) process on Unix.
pub struct PtyProcess {
    /// Master file descriptor of the PTY
    master_fd: OwnedFd,
    /// Child process ID
    pub child_pid: libc::pid_t,
    reaped: AtomicBool,
}

fn c_string(value: &str) -> io::Result<CString> {
    CString::new(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

impl PtyProcess {
    /// Spawn the configured shell on a new PTY of the given size, running in `cwd`.
    pub fn spawn(cols: u16, rows: u16, shell: &ShellConfig, cwd: &Path) -> io::Result<Self> {
        // Everything the child needs is allocated before fork.
        let program = c_string(&shell.program)?;
        let args = std::iter::once(shell.program.as_str())
            .chain(shell.args.iter().map(String::as_str))
            .map(c_string)
            .collect::<io::Result<Vec<_>>>()?;
        let arg_ptrs: Vec<*const libc::c_char> = args
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        let env = std::iter::once(("TERM", "xterm-256color"))
            .chain(shell.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .map(|(k, v)| c_string(&format!("{}={}", k, v)))
            .collect::<io::Result<Vec<_>>>()?;
        let cwd = c_string(&cwd.to_string_lossy())?;

        let mut master_fd: libc::c_int = -1;
        let mut win_size = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        unsafe {
            let child_pid = libc::forkpty(
                &mut master_fd,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut win_size,
            );

            if child_pid < 0 {
                return Err(io::Error::last_os_error());
            }

            if child_pid == 0 {
                // Child process: a failed chdir leaves the shell in the inherited directory
                libc::chdir(cwd.as_ptr());
                for entry in &env {
                    libc::putenv(entry.as_ptr() as *mut _);
                }
                libc::execvp(program.as_ptr(), arg_ptrs.as_ptr());
                libc::_exit(127);
            }

            // Parent process: non-blocking for the async reader, and kept out of
            // any other child we spawn later.
            let flags = libc::fcntl(master_fd, libc::F_GETFL);
            libc::fcntl(master_fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            libc::fcntl(master_fd, libc::F_SETFD, libc::FD_CLOEXEC);

            Ok(Self {
                master_fd: OwnedFd::from_raw_fd(master_fd),
                child_pid,
                reaped: AtomicBool::new(false),
            })
        }
    }

    /// Resize the PTY.
    pub fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        let win_size = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        let result = unsafe { libc::ioctl(self.master_fd.as_raw_fd(), libc::TIOCSWINSZ, &win_size) };

        if result < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Write data to the PTY master (sends input to the shell).
    /// Returns the number of bytes accepted; may be short.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        let fd = self.master_fd.as_raw_fd();
        let result = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        if result < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(result as usize)
        }
    }

    /// Read available output from the PTY master into `buf`.
    /// Fails with `WouldBlock` when nothing is pending; `Ok(0)` or `EIO` once
    /// the child side has hung up.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.master_fd.as_raw_fd();
        let result = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if result < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(result as usize)
        }
    }

    /// Reap the child if it has exited. Returns its exit code (128 + signal
    /// for signal deaths), or `None` while it is still running.
    pub fn try_wait(&self) -> Option<i32> {
        if self.reaped.load(Ordering::Acquire) {
            return None;
        }
        let mut status: libc::c_int = 0;
        let waited = unsafe { libc::waitpid(self.child_pid, &mut status, libc::WNOHANG) };
        if waited != self.child_pid {
            return None;
        }
        self.reaped.store(true, Ordering::Release);
        let code = if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else if libc::WIFSIGNALED(status) {
            128 + libc::WTERMSIG(status)
        } else {
            -1
        };
        Some(code)
    }

    pub fn is_running(&self) -> bool {
        !self.reaped.load(Ordering::Acquire) && self.try_wait().is_none()
    }

    /// Send SIGKILL to the child if it is still running.
    pub fn kill(&self) {
        if self.is_running() {
            unsafe {
                libc::kill(self.child_pid, libc::SIGKILL);
            }
        }
    }
}

impl AsRawFd for PtyProcess {
    fn as_raw_fd(&self) -> RawFd {
        self.master_fd.as_raw_fd()
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if self.reaped.load(Ordering::Acquire) {
            return;
        }
        unsafe {
            // SIGKILL cannot be ignored, so the blocking wait below is short.
            libc::kill(self.child_pid, libc::SIGKILL);
            let mut status: libc::c_int = 0;
            libc::waitpid(self.child_pid, &mut status, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn sh() -> ShellConfig {
        ShellConfig::new("/bin/sh")
    }

    fn read_until(pty: &PtyProcess, needle: &str, timeout: Duration) -> String {
        let deadline = Instant::now() + timeout;
        let mut output = Vec::new();
        let mut buf = [0u8; 4096];
        while Instant::now() < deadline {
            match pty.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => output.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10))
                }
                Err(_) => break,
            }
            if String::from_utf8_lossy(&output).contains(needle) {
                break;
            }
        }
        String::from_utf8_lossy(&output).into_owned()
    }

    #[test]
    fn test_spawn_runs_in_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let pty = PtyProcess::spawn(80, 24, &sh(), dir.path()).unwrap();
        pty.write(b"pwd; echo TERM=$TERM\r").unwrap();
        let out = read_until(&pty, "TERM=xterm-256color", Duration::from_secs(5));
        let dir_name = dir.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(out.contains(&dir_name), "output was: {out}");
        assert!(out.contains("TERM=xterm-256color"), "output was: {out}");
    }

    #[test]
    fn test_extra_env_is_passed() {
        let dir = tempfile::tempdir().unwrap();
        let shell = sh().with_env("TANDEM_MARKER", "marker-value");
        let pty = PtyProcess::spawn(80, 24, &shell, dir.path()).unwrap();
        pty.write(b"echo $TANDEM_MARKER\r").unwrap();
        let out = read_until(&pty, "marker-value\r\n", Duration::from_secs(5));
        assert!(out.contains("marker-value\r\n"), "output was: {out}");
    }

    #[test]
    fn test_kill_and_reap() {
        let dir = tempfile::tempdir().unwrap();
        let pty = PtyProcess::spawn(80, 24, &sh(), dir.path()).unwrap();
        assert!(pty.is_running());
        pty.kill();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut code = None;
        while code.is_none() && Instant::now() < deadline {
            code = pty.try_wait();
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(code, Some(128 + libc::SIGKILL));
        assert!(!pty.is_running());
    }

    #[test]
    fn test_resize_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let pty = PtyProcess::spawn(80, 24, &sh(), dir.path()).unwrap();
        assert!(pty.resize(120, 40).is_ok());
    }
}
