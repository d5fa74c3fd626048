//! Tandem Core: shared terminals for collaborative rooms.
//!
//! Runs one shell per room on a pseudo-terminal, parses its output into a
//! screen buffer and fans rendered frames out to every connected client.
//! Rooms are tracked by a [`Manager`] that provisions and tears down each
//! room's workspace directory.

pub mod config;
pub mod room;
pub mod session;
pub mod terminal;
pub mod worker;
pub mod workspace;

pub use config::{ManagerConfig, ShellConfig};
pub use room::{Client, Manager, Room, RoomError, RoomEvent, RoomEventKind, RoomSummary};
pub use terminal::{SharedTerminal, Subscription, TerminalError};
pub use worker::{ChatMessage, RoomCleanup, WorkerClient};

/// Initialize logging from `RUST_LOG`. Safe to call more than once.
pub fn init() {
    let _ = env_logger::try_init();
    log::info!("Tandem Core initialized");
}
