use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::debug;

use super::hub::{ConnectionState, DropReason, Frame, RelayHub};

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(bytes) => Message::Binary(bytes.into()),
        }
    }
}

/// Drives one upgraded observer socket until either side goes away.
///
/// A writer task drains the observer's queue with every write bounded by
/// the hub's send timeout. The reader relays each text or binary frame to
/// the other observers until the hub stops treating it as open. Whichever
/// side stops first ends the connection, and it is removed from the hub
/// exactly once.
pub async fn serve_socket(socket: WebSocket, hub: RelayHub) {
    debug!(state = ?ConnectionState::Connecting, "Observer upgrade complete");

    let (id, mut outbound) = hub.connect();
    let (mut sink, mut stream) = socket.split();
    let send_timeout = hub.config().send_timeout;

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match tokio::time::timeout(send_timeout, sink.send(frame.into())).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(connection_id = %id, error = %err, "Socket write failed");
                    return Some(DropReason::SendFailed);
                }
                Err(_) => return Some(DropReason::WriteTimeout),
            }
        }
        // Queue closed: the hub already removed this observer.
        let _ = sink.close().await;
        None
    });

    let reason = loop {
        // Dropped by the hub, for example as stalled; its queue is closing.
        if hub.state(id) != ConnectionState::Open {
            break None;
        }

        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    hub.broadcast(Some(id), Frame::Text(text.as_str().to_owned()));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    hub.broadcast(Some(id), Frame::Binary(bytes.to_vec()));
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break Some(DropReason::PeerClosed),
                Some(Err(err)) => {
                    debug!(connection_id = %id, error = %err, "Socket read failed");
                    break Some(DropReason::ReceiveFailed);
                }
            },
            finished = &mut writer => {
                break finished.unwrap_or(Some(DropReason::SendFailed));
            }
        }
    };

    hub.mark_closing(id);
    if let Some(reason) = reason {
        hub.disconnect(id, reason);
    }
    writer.abort();
}
