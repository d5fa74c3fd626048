use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::config::ManagerConfig;
use crate::room::{Client, Room, RoomEvent, RoomSummary};
use crate::terminal::{SharedTerminal, TerminalError};
use crate::worker::{ChatMessage, RoomCleanup, WorkerClient};
use crate::workspace::{self, WorkspaceError};

const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);
const CLEANUP_ATTEMPTS: u32 = 3;
const CLEANUP_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("room not found: {0}")]
    NotFound(String),
    #[error("failed to provision workspace: {0}")]
    WorkspaceProvision(#[from] WorkspaceError),
    #[error(transparent)]
    Terminal(#[from] TerminalError),
}

/// Process-wide registry of rooms.
pub struct Manager {
    config: ManagerConfig,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    cleanup: Option<Arc<dyn RoomCleanup>>,
}

impl Manager {
    /// Build a manager. A configured worker URL enables teardown
    /// notifications to that worker.
    pub fn new(config: ManagerConfig) -> Self {
        let cleanup = config
            .worker_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .and_then(|url| match WorkerClient::new(url) {
                Ok(client) => Some(Arc::new(client) as Arc<dyn RoomCleanup>),
                Err(e) => {
                    log::warn!("Worker client disabled: {:#}", e);
                    None
                }
            });
        Self {
            config,
            rooms: RwLock::new(HashMap::new()),
            cleanup,
        }
    }

    /// Replace the teardown notifier.
    pub fn with_cleanup(mut self, cleanup: Arc<dyn RoomCleanup>) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Create a room with a freshly provisioned workspace.
    pub fn create_room(&self, host: &str, description: &str) -> Result<Arc<Room>, RoomError> {
        let id = uuid::Uuid::new_v4().to_string();
        let dir = workspace::provision_room(
            &self.config.workspace_root,
            description,
            self.config.template_dir.as_deref(),
        )?;

        let room = Arc::new(Room::new(id.clone(), description, host, dir));
        self.rooms.write().insert(id.clone(), Arc::clone(&room));
        log::info!("Room {} created by {} in {}", id, host, room.workspace_dir().display());
        Ok(room)
    }

    pub fn get_room(&self, room_id: &str) -> Result<Arc<Room>, RoomError> {
        self.rooms
            .read()
            .get(room_id)
            .cloned()
            .ok_or_else(|| RoomError::NotFound(room_id.to_string()))
    }

    /// Add a client to an existing room. Holding the registry lock keeps the
    /// join from racing the room's teardown.
    pub fn join_room(&self, room_id: &str, client: Arc<Client>) -> Result<Arc<Room>, RoomError> {
        let rooms = self.rooms.read();
        let room = rooms
            .get(room_id)
            .cloned()
            .ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;
        room.add_client(client);
        Ok(room)
    }

    /// Remove a client. When that empties the room, the room is torn down:
    /// terminal closed, workspace deleted and the worker notified.
    /// Returns true if the room was torn down.
    pub fn leave_room(&self, room_id: &str, client_id: &str) -> bool {
        let room = {
            let mut rooms = self.rooms.write();
            let Some(room) = rooms.get(room_id) else {
                return false;
            };
            room.remove_client(client_id);
            if room.client_count() > 0 {
                return false;
            }
            match rooms.remove(room_id) {
                Some(room) => room,
                None => return false,
            }
        };

        if let Some(terminal) = room.take_terminal() {
            terminal.close();
        }
        workspace::remove(room.workspace_dir());
        self.spawn_cleanup(room_id);
        log::info!("Room {} torn down", room_id);
        true
    }

    fn spawn_cleanup(&self, room_id: &str) {
        let Some(cleanup) = self.cleanup.clone() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::warn!("No async runtime, skipping cleanup notification for room {}", room_id);
            return;
        };
        let room_id = room_id.to_string();
        handle.spawn(async move {
            for attempt in 1..=CLEANUP_ATTEMPTS {
                match tokio::time::timeout(CLEANUP_TIMEOUT, cleanup.cleanup_room(&room_id)).await {
                    Ok(Ok(())) => {
                        log::debug!("Cleanup notification sent for room {}", room_id);
                        return;
                    }
                    Ok(Err(e)) => log::warn!(
                        "Failed to clean up room {} (attempt {}/{}): {:#}",
                        room_id,
                        attempt,
                        CLEANUP_ATTEMPTS,
                        e
                    ),
                    Err(_) => log::warn!(
                        "Cleanup notification for room {} timed out (attempt {}/{})",
                        room_id,
                        attempt,
                        CLEANUP_ATTEMPTS
                    ),
                }
                if attempt < CLEANUP_ATTEMPTS {
                    tokio::time::sleep(CLEANUP_BACKOFF * attempt).await;
                }
            }
        });
    }

    /// Active rooms, oldest first.
    pub fn list_rooms(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<Arc<Room>> = self.rooms.read().values().cloned().collect();
        rooms.sort_by(|a, b| a.created_at().cmp(&b.created_at()).then_with(|| a.id.cmp(&b.id)));
        rooms.iter().map(|room| room.summary()).collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    /// The room's terminal, started on first use with the given size (or the
    /// configured default when a dimension is 0).
    pub fn attach_terminal(
        &self,
        room_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<Arc<SharedTerminal>, RoomError> {
        let room = self.get_room(room_id)?;
        let cols = if cols == 0 { self.config.default_cols } else { cols };
        let rows = if rows == 0 { self.config.default_rows } else { rows };
        let terminal = room.attach_terminal(cols, rows, &self.config.shell)?;
        self.ensure_registered(&room)?;
        Ok(terminal)
    }

    /// Fails if `room` was torn down, closing any terminal started in it
    /// after teardown already ran.
    fn ensure_registered(&self, room: &Arc<Room>) -> Result<(), RoomError> {
        let registered = self
            .rooms
            .read()
            .get(&room.id)
            .is_some_and(|current| Arc::ptr_eq(current, room));
        if registered {
            return Ok(());
        }
        if let Some(terminal) = room.take_terminal() {
            log::info!("Closing terminal attached to torn down room {}", room.id);
            terminal.close();
        }
        Err(RoomError::NotFound(room.id.clone()))
    }

    pub fn ai_messages(&self, room_id: &str) -> Result<Vec<ChatMessage>, RoomError> {
        Ok(self.get_room(room_id)?.ai_messages())
    }

    pub fn set_ai_messages(&self, room_id: &str, messages: Vec<ChatMessage>) -> Result<(), RoomError> {
        self.get_room(room_id)?.set_ai_messages(messages);
        Ok(())
    }

    pub fn broadcast_event(
        &self,
        room_id: &str,
        event: &RoomEvent,
        exclude: Option<&str>,
    ) -> Result<usize, RoomError> {
        Ok(self.get_room(room_id)?.broadcast_event(event, exclude))
    }
}
