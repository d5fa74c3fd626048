pub mod manager;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::config::ShellConfig;
use crate::terminal::{SharedTerminal, TerminalError};
use crate::worker::ChatMessage;

pub use manager::{Manager, RoomError};

/// Bounded per-client event queue size. Events beyond it are dropped.
pub const EVENT_QUEUE_CAPACITY: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomEventKind {
    Join,
    Leave,
    Typing,
    /// `data` carries the JSON-encoded assistant conversation.
    AiMessages,
    Custom(String),
}

/// Presence or collaboration event delivered to room members.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RoomEvent {
    pub kind: RoomEventKind,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl RoomEvent {
    pub fn new(kind: RoomEventKind, username: impl Into<String>) -> Self {
        Self {
            kind,
            username: username.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }
}

/// A connected participant. The id is issued by the caller and survives
/// reconnects.
#[derive(Debug)]
pub struct Client {
    pub id: String,
    pub username: String,
    pub is_host: bool,
    events: Mutex<Option<mpsc::Sender<RoomEvent>>>,
}

impl Client {
    /// Create a client together with the receiving end of its event queue.
    pub fn new(
        id: impl Into<String>,
        username: impl Into<String>,
        is_host: bool,
    ) -> (Arc<Self>, mpsc::Receiver<RoomEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let client = Arc::new(Self {
            id: id.into(),
            username: username.into(),
            is_host,
            events: Mutex::new(Some(tx)),
        });
        (client, rx)
    }

    /// Queue an event without waiting. Returns false if it was dropped.
    pub fn notify(&self, event: RoomEvent) -> bool {
        match self.events.lock().as_ref() {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Close the event queue. Returns true only for the call that closed it.
    pub fn close_events(&self) -> bool {
        self.events.lock().take().is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.events.lock().is_some()
    }
}

/// Listing entry for an active room.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RoomSummary {
    pub id: String,
    pub description: String,
    pub host: String,
    pub client_count: usize,
    pub has_terminal: bool,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

struct RoomState {
    clients: Vec<Arc<Client>>,
    terminal: Option<Arc<SharedTerminal>>,
    ai_messages: Vec<ChatMessage>,
}

/// A collaborative session: members, at most one shared terminal, a
/// workspace directory and the assistant conversation.
pub struct Room {
    pub id: String,
    pub description: String,
    pub host: String,
    workspace_dir: PathBuf,
    created_at: SystemTime,
    state: RwLock<RoomState>,
}

impl Room {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        host: impl Into<String>,
        workspace_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            host: host.into(),
            workspace_dir: workspace_dir.into(),
            created_at: SystemTime::now(),
            state: RwLock::new(RoomState {
                clients: Vec::new(),
                terminal: None,
                ai_messages: Vec::new(),
            }),
        }
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Register a client. A client whose id is already present replaces the
    /// old registration in place and the old event queue is closed.
    /// Everyone else is told about the join.
    pub fn add_client(&self, client: Arc<Client>) {
        let mut state = self.state.write();
        match state.clients.iter().position(|c| c.id == client.id) {
            Some(pos) => {
                let old = std::mem::replace(&mut state.clients[pos], Arc::clone(&client));
                old.close_events();
                log::info!("Client {} reconnected to room {}", client.id, self.id);
            }
            None => {
                state.clients.push(Arc::clone(&client));
                log::info!("Client {} ({}) joined room {}", client.id, client.username, self.id);
            }
        }

        let event = RoomEvent::new(RoomEventKind::Join, client.username.clone());
        for other in state.clients.iter().filter(|c| c.id != client.id) {
            other.notify(event.clone());
        }
    }

    /// Remove a client and close its queue. Returns false if it was not here.
    pub fn remove_client(&self, client_id: &str) -> bool {
        let mut state = self.state.write();
        let Some(pos) = state.clients.iter().position(|c| c.id == client_id) else {
            return false;
        };
        let client = state.clients.remove(pos);
        client.close_events();
        log::info!("Client {} left room {}", client_id, self.id);

        let event = RoomEvent::new(RoomEventKind::Leave, client.username.clone());
        for other in &state.clients {
            other.notify(event.clone());
        }
        true
    }

    /// Deliver an event to every client except `exclude`. Returns how many
    /// queues accepted it.
    pub fn broadcast_event(&self, event: &RoomEvent, exclude: Option<&str>) -> usize {
        let state = self.state.read();
        state
            .clients
            .iter()
            .filter(|c| Some(c.id.as_str()) != exclude)
            .filter(|c| c.notify(event.clone()))
            .count()
    }

    pub fn client_count(&self) -> usize {
        self.state.read().clients.len()
    }

    /// Current members in attach order.
    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.state.read().clients.clone()
    }

    pub fn summary(&self) -> RoomSummary {
        let state = self.state.read();
        RoomSummary {
            id: self.id.clone(),
            description: self.description.clone(),
            host: self.host.clone(),
            client_count: state.clients.len(),
            has_terminal: state.terminal.is_some(),
            created_at: self
                .created_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        }
    }

    pub fn terminal(&self) -> Option<Arc<SharedTerminal>> {
        self.state.read().terminal.clone()
    }

    /// Return the room's live terminal, starting one in the workspace if
    /// there is none. A terminal whose shell has exited is replaced.
    pub fn attach_terminal(
        &self,
        cols: u16,
        rows: u16,
        shell: &ShellConfig,
    ) -> Result<Arc<SharedTerminal>, TerminalError> {
        if let Some(existing) = self.terminal() {
            if !existing.is_closed() {
                return Ok(existing);
            }
        }

        // Spawned without the room lock held.
        let terminal = SharedTerminal::new(cols, rows, self.workspace_dir.clone(), shell.clone());
        terminal.start()?;

        let mut state = self.state.write();
        if let Some(existing) = state.terminal.as_ref() {
            if !existing.is_closed() {
                let winner = Arc::clone(existing);
                drop(state);
                terminal.close();
                return Ok(winner);
            }
        }
        let previous = state.terminal.replace(Arc::clone(&terminal));
        drop(state);

        if let Some(previous) = previous {
            log::info!("Replacing exited terminal in room {}", self.id);
            previous.close();
        }
        Ok(terminal)
    }

    /// Detach the terminal without closing it.
    pub fn take_terminal(&self) -> Option<Arc<SharedTerminal>> {
        self.state.write().terminal.take()
    }

    pub fn ai_messages(&self) -> Vec<ChatMessage> {
        self.state.read().ai_messages.clone()
    }

    pub fn set_ai_messages(&self, messages: Vec<ChatMessage>) {
        self.state.write().ai_messages = messages;
    }

    pub fn append_ai_message(&self, message: ChatMessage) {
        self.state.write().ai_messages.push(message);
    }

    /// Push the conversation to everyone except `from_client_id`.
    pub fn sync_ai_messages(&self, from_client_id: &str) -> usize {
        let (username, data) = {
            let state = self.state.read();
            let username = state
                .clients
                .iter()
                .find(|c| c.id == from_client_id)
                .map(|c| c.username.clone())
                .unwrap_or_default();
            match serde_json::to_string(&state.ai_messages) {
                Ok(data) => (username, data),
                Err(e) => {
                    log::error!("Failed to serialize ai messages for room {}: {}", self.id, e);
                    return 0;
                }
            }
        };
        let event = RoomEvent::new(RoomEventKind::AiMessages, username).with_data(data);
        self.broadcast_event(&event, Some(from_client_id))
    }
}
