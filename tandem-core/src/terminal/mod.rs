pub mod emulator;
pub mod pty;
pub mod render;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, Notify};

use crate::config::ShellConfig;
use crate::terminal::emulator::VtEmulator;
use crate::terminal::pty::PtyProcess;

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;
const READ_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("failed to spawn shell: {0}")]
    Spawn(#[source] io::Error),
    #[error("terminal already started")]
    AlreadyStarted,
    #[error("terminal is closed")]
    Closed,
    #[error("pty i/o error: {0}")]
    Io(#[from] io::Error),
}

struct TerminalState {
    cols: u16,
    rows: u16,
    emulator: VtEmulator,
    pty: Option<Arc<PtyProcess>>,
    started: bool,
    shut_down: bool,
    subscribers: HashMap<u64, mpsc::Sender<()>>,
    next_subscriber: u64,
    dirty: bool,
    frame: Arc<str>,
}

impl TerminalState {
    fn senders(&self) -> Vec<mpsc::Sender<()>> {
        self.subscribers.values().cloned().collect()
    }
}

/// A shell running on a pty, observed by any number of subscribers.
///
/// Output is parsed into a screen buffer by a single read loop task. Observers
/// get a coalescing "changed" signal and pull the current frame with
/// [`SharedTerminal::render`].
pub struct SharedTerminal {
    cwd: PathBuf,
    shell: ShellConfig,
    state: Mutex<TerminalState>,
    closed: AtomicBool,
    shutdown: Notify,
}

/// Change notifications for one observer. Holds at most one pending signal.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<()>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next change. Returns `false` once the terminal dropped
    /// this queue.
    pub async fn changed(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

fn notify_all(senders: Vec<mpsc::Sender<()>>) {
    for tx in senders {
        // Full means a signal is already pending for that observer.
        let _ = tx.try_send(());
    }
}

impl SharedTerminal {
    /// Create an unstarted terminal. Zero dimensions fall back to 80x24.
    pub fn new(cols: u16, rows: u16, cwd: impl Into<PathBuf>, shell: ShellConfig) -> Arc<Self> {
        let cols = if cols < 1 { DEFAULT_COLS } else { cols };
        let rows = if rows < 1 { DEFAULT_ROWS } else { rows };
        let emulator = VtEmulator::new(cols as usize, rows as usize);
        let frame: Arc<str> = render::render_frame(&emulator).into();
        Arc::new(Self {
            cwd: cwd.into(),
            shell,
            state: Mutex::new(TerminalState {
                cols,
                rows,
                emulator,
                pty: None,
                started: false,
                shut_down: false,
                subscribers: HashMap::new(),
                next_subscriber: 0,
                dirty: false,
                frame,
            }),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    /// Spawn the shell and its read loop. Must be called inside a tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<(), TerminalError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(TerminalError::Spawn(io::Error::new(
                io::ErrorKind::Other,
                "no tokio runtime available for the read loop",
            )));
        }

        let mut state = self.state.lock();
        if state.shut_down {
            return Err(TerminalError::Closed);
        }
        if state.started {
            return Err(TerminalError::AlreadyStarted);
        }

        let pty = PtyProcess::spawn(state.cols, state.rows, &self.shell, &self.cwd)
            .map(Arc::new)
            .map_err(TerminalError::Spawn)?;
        let reader = AsyncFd::new(Arc::clone(&pty)).map_err(TerminalError::Spawn)?;

        log::info!(
            "Terminal started: pid {} running {} in {}",
            pty.child_pid,
            self.shell.program,
            self.cwd.display()
        );
        state.pty = Some(pty);
        state.started = true;
        drop(state);

        let terminal = Arc::clone(self);
        tokio::spawn(async move {
            terminal.read_loop(reader).await;
        });
        Ok(())
    }

    async fn read_loop(&self, reader: AsyncFd<Arc<PtyProcess>>) {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                ready = reader.readable() => {
                    let mut guard = match ready {
                        Ok(guard) => guard,
                        Err(e) => {
                            log::warn!("Terminal readiness error: {}", e);
                            break;
                        }
                    };
                    match guard.try_io(|inner| inner.get_ref().read(&mut buf)) {
                        Ok(Ok(0)) => break,
                        Ok(Ok(n)) => self.ingest(&buf[..n]),
                        Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                        // EIO is the normal hang-up once the shell exits.
                        Ok(Err(e)) => {
                            log::debug!("Terminal read ended: {}", e);
                            break;
                        }
                        Err(_would_block) => continue,
                    }
                }
            }
        }

        self.closed.store(true, Ordering::Release);
        let pty = Arc::clone(reader.get_ref());
        drop(reader);
        match pty.try_wait() {
            Some(code) => log::info!("Terminal shell {} exited with status {}", pty.child_pid, code),
            None => log::info!("Terminal read loop stopped for pid {}", pty.child_pid),
        }

        // Observers re-render once more to see the final screen.
        let senders = self.state.lock().senders();
        notify_all(senders);
    }

    fn ingest(&self, bytes: &[u8]) {
        let senders = {
            let mut state = self.state.lock();
            state.emulator.process(bytes);
            state.dirty = true;
            state.senders()
        };
        notify_all(senders);
    }

    /// Forward input to the shell. Returns the number of bytes accepted; a
    /// terminal without a live pty discards input and returns `Ok(0)`.
    pub fn write(&self, data: &[u8]) -> Result<usize, TerminalError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(0);
        }
        let state = self.state.lock();
        let Some(pty) = state.pty.as_ref() else {
            return Ok(0);
        };

        let mut written = 0;
        while written < data.len() {
            match pty.write(&data[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    log::debug!(
                        "Terminal input buffer full, dropped {} bytes",
                        data.len() - written
                    );
                    break;
                }
                Err(e) if e.raw_os_error() == Some(libc::EIO) => return Ok(written),
                Err(e) => return Err(TerminalError::Io(e)),
            }
        }
        Ok(written)
    }

    /// Resize the screen and the kernel window. Zero dimensions are ignored.
    pub fn resize(&self, cols: u16, rows: u16) {
        if cols < 1 || rows < 1 {
            return;
        }
        let senders = {
            let mut state = self.state.lock();
            state.cols = cols;
            state.rows = rows;
            state.emulator.resize(cols as usize, rows as usize);
            if let Some(pty) = state.pty.as_ref() {
                if let Err(e) = pty.resize(cols, rows) {
                    log::warn!("Failed to resize pty to {}x{}: {}", cols, rows, e);
                }
            }
            state.dirty = true;
            state.senders()
        };
        notify_all(senders);
    }

    /// Register a new observer. A terminal that has already closed hands out
    /// a subscription whose queue is closed.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(1);
        let mut state = self.state.lock();
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        if !state.shut_down {
            state.subscribers.insert(id, tx);
        }
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.state.lock().subscribers.remove(&subscription.id);
    }

    /// Current frame: `rows` lines of `cols` cells with embedded SGR styling.
    pub fn render(&self) -> Arc<str> {
        let mut state = self.state.lock();
        if state.dirty {
            state.frame = render::render_frame(&state.emulator).into();
            state.dirty = false;
        }
        Arc::clone(&state.frame)
    }

    /// Stop the read loop, drop every observer queue and kill the shell.
    /// Safe to call more than once.
    pub fn close(&self) {
        let pty = {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.subscribers.clear();
            state.pty.take()
        };
        self.closed.store(true, Ordering::Release);
        self.shutdown.notify_one();
        if let Some(pty) = pty {
            log::info!("Closing terminal pid {}", pty.child_pid);
            pty.kill();
        }
    }

    pub fn size(&self) -> (u16, u16) {
        let state = self.state.lock();
        (state.cols, state.rows)
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn pid(&self) -> Option<i32> {
        self.state.lock().pty.as_ref().map(|p| p.child_pid)
    }
}

impl Drop for SharedTerminal {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh() -> ShellConfig {
        ShellConfig::new("/bin/sh")
    }

    async fn wait_for(terminal: &SharedTerminal, needle: &str) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if terminal.render().contains(needle) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[test]
    fn test_zero_dimensions_default() {
        let terminal = SharedTerminal::new(0, 0, "/tmp", sh());
        assert_eq!(terminal.size(), (80, 24));
    }

    #[test]
    fn test_blank_frame_before_start() {
        let terminal = SharedTerminal::new(10, 3, "/tmp", sh());
        let frame = terminal.render();
        let lines: Vec<&str> = frame.split('\n').collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1..].iter().all(|l| *l == "          "));
        assert_eq!(terminal.write(b"ignored").unwrap(), 0);
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let terminal = SharedTerminal::new(80, 24, "/tmp", sh());
        assert!(matches!(terminal.start(), Err(TerminalError::Spawn(_))));
        assert!(!terminal.is_started());
    }

    #[test]
    fn test_render_is_cached_until_mutation() {
        let terminal = SharedTerminal::new(20, 5, "/tmp", sh());
        let a = terminal.render();
        let b = terminal.render();
        assert!(Arc::ptr_eq(&a, &b));
        terminal.resize(30, 6);
        let c = terminal.render();
        assert!(!Arc::ptr_eq(&a, &c));
        let lines: Vec<&str> = c.split('\n').collect();
        assert_eq!(lines.len(), 6);
        for line in lines {
            assert_eq!(render::strip_sgr(line).chars().count(), 30);
        }
    }

    #[test]
    fn test_resize_ignores_zero() {
        let terminal = SharedTerminal::new(20, 5, "/tmp", sh());
        terminal.resize(0, 10);
        terminal.resize(10, 0);
        assert_eq!(terminal.size(), (20, 5));
    }

    #[tokio::test]
    async fn test_resize_notifies_subscribers() {
        let terminal = SharedTerminal::new(20, 5, "/tmp", sh());
        let mut sub = terminal.subscribe();
        terminal.resize(40, 10);
        terminal.resize(41, 10);
        // Coalesced into a single pending signal.
        assert!(sub.changed().await);
        assert!(sub.rx.try_recv().is_err());
        terminal.unsubscribe(sub);
        assert_eq!(terminal.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_shell_output_reaches_frame() {
        let dir = tempfile::tempdir().unwrap();
        let terminal = SharedTerminal::new(40, 10, dir.path(), sh());
        terminal.start().unwrap();
        assert!(terminal.pid().is_some());
        let mut sub = terminal.subscribe();

        terminal.write(b"echo $((40+2))\r").unwrap();
        assert!(wait_for(&terminal, "42").await, "frame: {}", terminal.render());
        assert!(sub.changed().await);
        terminal.close();
    }

    #[tokio::test]
    async fn test_start_twice_and_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let terminal = SharedTerminal::new(40, 10, dir.path(), sh());
        terminal.start().unwrap();
        assert!(matches!(terminal.start(), Err(TerminalError::AlreadyStarted)));
        terminal.close();
        assert!(matches!(terminal.start(), Err(TerminalError::Closed)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_closes_queues() {
        let dir = tempfile::tempdir().unwrap();
        let terminal = SharedTerminal::new(40, 10, dir.path(), sh());
        terminal.start().unwrap();
        let mut sub = terminal.subscribe();
        terminal.close();
        terminal.close();
        assert!(terminal.is_closed());
        assert!(terminal.pid().is_none());
        while sub.changed().await {}
        assert_eq!(terminal.write(b"ls\r").unwrap(), 0);

        let mut late = terminal.subscribe();
        assert!(!late.changed().await);
        assert_eq!(terminal.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_shell_exit_marks_closed() {
        let dir = tempfile::tempdir().unwrap();
        let terminal = SharedTerminal::new(40, 10, dir.path(), sh());
        terminal.start().unwrap();
        let mut sub = terminal.subscribe();
        terminal.write(b"exit\r").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !terminal.is_closed() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(terminal.is_closed());
        // The queue stays open after the shell exits.
        assert_eq!(terminal.subscriber_count(), 1);
        assert!(sub.changed().await);
        assert_eq!(terminal.write(b"echo\r").unwrap(), 0);
    }
}
