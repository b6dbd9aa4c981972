use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use bytes::Bytes;
use futures::stream::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::Instrument;

pub async fn handler(
    State(sender): State<broadcast::Sender<Bytes>>,
    ws: WebSocketUpgrade,
) -> Response {
    let span = tracing::debug_span!("visibilities");
    let receiver = sender.subscribe();
    ws.on_upgrade(move |socket| handle(socket, receiver).instrument(span))
}

async fn handle(socket: WebSocket, receiver: broadcast::Receiver<Bytes>) {
    if let Err(error) = handle_socket(socket, receiver).await {
        tracing::error!(%error, "client error");
    }
}

// Each visibility is a single JSON document. Browser clients get it as a
// string they can hand to JSON.parse, rather than as a Blob.
fn to_message(item: Result<Bytes, BroadcastStreamRecvError>) -> Option<Message> {
    let json = match item {
        Ok(json) => json,
        Err(BroadcastStreamRecvError::Lagged(lagged)) => {
            tracing::info!(lagged, "client lagged; visibilities dropped");
            return None;
        }
    };
    match String::from_utf8(json.to_vec()) {
        Ok(text) => Some(Message::Text(text)),
        Err(error) => {
            tracing::error!(%error, "visibility is not valid UTF-8");
            None
        }
    }
}

async fn handle_socket(socket: WebSocket, receiver: broadcast::Receiver<Bytes>) -> Result<()> {
    tracing::info!("visibilities client connected");
    let (ws_send, ws_recv) = socket.split();
    let send = BroadcastStream::new(receiver)
        .filter_map(|item| futures::future::ready(to_message(item).map(Ok)))
        .forward(ws_send);
    // Incoming messages are ignored, but they need to be polled so that the
    // lower layers reply to pings.
    let mut receive = ws_recv.skip_while(|r| futures::future::ready(r.is_ok()));
    tokio::select! {
        ret = send => ret?,
        ret = receive.next() => match ret {
            None => tracing::info!("visibilities client disconnected"),
            Some(Ok(_)) => unreachable!(), // all the Ok messages are skipped
            Some(Err(e)) => Err(e)?,
        },
    };
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn messages() {
        let json = Bytes::from_static(br#"{"sequence":3}"#);
        match to_message(Ok(json)) {
            Some(Message::Text(text)) => assert_eq!(text, r#"{"sequence":3}"#),
            other => panic!("unexpected message {other:?}"),
        }
        assert!(to_message(Ok(Bytes::from_static(&[0xff, 0xfe]))).is_none());
        assert!(to_message(Err(BroadcastStreamRecvError::Lagged(5))).is_none());
    }
}
