//! Streams a shared terminal's frames to one client connection.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

use crate::terminal::SharedTerminal;

const CURSOR_HOME: &[u8] = b"\x1b[H";

fn encode_frame(frame: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(CURSOR_HOME.len() + frame.len() + frame.len() / 8);
    out.extend_from_slice(CURSOR_HOME);
    out.extend_from_slice(frame.replace('\n', "\r\n").as_bytes());
    out
}

/// Write the current frame, then a fresh frame after every change, until the
/// terminal drops this observer or the sink fails.
pub async fn pump_frames<W>(terminal: Arc<SharedTerminal>, mut sink: W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut subscription = terminal.subscribe();
    let result = async {
        sink.write_all(&encode_frame(&terminal.render())).await?;
        sink.flush().await?;
        while subscription.changed().await {
            sink.write_all(&encode_frame(&terminal.render())).await?;
            sink.flush().await?;
        }
        Ok(())
    }
    .await;
    terminal.unsubscribe(subscription);
    result
}

pub fn spawn_frame_pump<W>(terminal: Arc<SharedTerminal>, sink: W) -> JoinHandle<io::Result<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let result = pump_frames(terminal, sink).await;
        if let Err(e) = &result {
            log::debug!("Frame pump stopped: {}", e);
        }
        result
    })
}
