use std::sync::Arc;
use std::time::Duration;

use tandem_core::{Client, Manager, ManagerConfig, RoomError, RoomEventKind, ShellConfig, SharedTerminal};

fn manager(root: &std::path::Path) -> Manager {
    Manager::new(ManagerConfig {
        workspace_root: root.to_path_buf(),
        template_dir: None,
        worker_url: None,
        default_cols: 80,
        default_rows: 24,
        shell: ShellConfig::new("/bin/sh"),
    })
}

async fn wait_for_text(terminal: &SharedTerminal, needle: &str) -> bool {
    for _ in 0..250 {
        if terminal.render().contains(needle) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn two_clients_share_one_terminal() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager(root.path());

    let room = manager.create_room("alice", "Fix Auth Bug").unwrap();
    let workspace = room.workspace_dir().to_path_buf();
    assert_eq!(workspace.file_name().unwrap(), "fix-auth-bug");

    let (alice, mut alice_events) = Client::new("client-a", "alice", true);
    let (bob, _bob_events) = Client::new("client-b", "bob", false);
    manager.join_room(&room.id, alice).unwrap();
    manager.join_room(&room.id, bob).unwrap();
    assert_eq!(alice_events.recv().await.unwrap().kind, RoomEventKind::Join);

    let terminal = manager.attach_terminal(&room.id, 80, 24).unwrap();
    let same = manager.attach_terminal(&room.id, 80, 24).unwrap();
    assert!(Arc::ptr_eq(&terminal, &same));

    let mut sub_a = terminal.subscribe();
    let mut sub_b = terminal.subscribe();

    terminal.write(b"echo hi\r").unwrap();
    let notified = tokio::time::timeout(Duration::from_secs(5), async {
        sub_a.changed().await && sub_b.changed().await
    })
    .await
    .unwrap();
    assert!(notified);

    // "hi" on its own line, after the echoed command.
    assert!(wait_for_text(&terminal, "\nhi ").await, "frame: {}", terminal.render());
    let frame = terminal.render();
    assert_eq!(frame.split('\n').count(), 24);

    assert!(!manager.leave_room(&room.id, "client-b"));
    assert_eq!(room.client_count(), 1);
    assert_eq!(alice_events.recv().await.unwrap().kind, RoomEventKind::Leave);
    terminal.unsubscribe(sub_b);

    assert!(manager.leave_room(&room.id, "client-a"));
    assert!(matches!(manager.get_room(&room.id), Err(RoomError::NotFound(_))));
    assert!(!workspace.exists());
    assert!(terminal.is_closed());
    let drained = tokio::time::timeout(Duration::from_secs(5), async { while sub_a.changed().await {} }).await;
    assert!(drained.is_ok());
}

#[tokio::test]
async fn shell_runs_in_room_workspace() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager(root.path());
    let room = manager.create_room("alice", "").unwrap();
    let (alice, _events) = Client::new("client-a", "alice", true);
    manager.join_room(&room.id, alice).unwrap();

    let terminal = manager.attach_terminal(&room.id, 100, 30).unwrap();
    terminal.write(b"touch marker.txt && echo $((40+2))\r").unwrap();
    assert!(wait_for_text(&terminal, "\n42 ").await, "frame: {}", terminal.render());
    assert!(room.workspace_dir().join("marker.txt").exists());

    terminal.resize(60, 10);
    let frame = terminal.render();
    assert_eq!(frame.split('\n').count(), 10);

    assert!(manager.leave_room(&room.id, "client-a"));
    assert_eq!(manager.room_count(), 0);
}
