//! Subscriber socket handler.
//!
//! Each connection is one [`Subscriber`](crate::hub::subscriber::Subscriber)
//! with its own delivery task, so a slow consumer never delays a fast one.
//! Inbound commands adjust the topic filter and the audio/FFT flags; an
//! unknown command gets `{type:"error", error:"unknown command"}` back
//! without closing the connection.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde::Deserialize;

use crate::api::AppState;
use crate::events::HubEvent;
use crate::hub::subscriber::OutboundMessage;

/// Inbound client commands.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientCommand {
    /// Reset the topic filter to the wildcard.
    SubscribeAll,
    /// Union the given keys into the topic filter.
    Subscribe { talkgroups: Vec<u64> },
    /// Subtract the given keys from the topic filter.
    Unsubscribe { talkgroups: Vec<u64> },
    EnableAudio { enabled: bool },
    EnableFft { enabled: bool },
}

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

fn text_message(event: &HubEvent) -> Option<Message> {
    serde_json::to_string(event)
        .ok()
        .map(|json| Message::Text(json.into()))
}

/// Main subscriber connection handler.
async fn handle_ws(mut socket: WebSocket, state: AppState) {
    let Some(subscriber) = state.hub.register() else {
        // Shutting down: no new subscribers.
        let _ = socket.close().await;
        return;
    };
    let subscriber_id = subscriber.id().to_string();
    let (mut sender, mut receiver) = socket.split();

    // Unicast greeting with the recent control-channel backlog.
    let connected = HubEvent::Connected {
        subscriber_id: subscriber_id.clone(),
        recent_control: state.ring.recent(),
    };
    if let Some(msg) = text_message(&connected) {
        if sender.send(msg).await.is_err() {
            state.hub.unregister(&subscriber_id);
            return;
        }
    }

    loop {
        tokio::select! {
            _ = subscriber.cancel_token().cancelled() => {
                if let Some(reason) = subscriber.close_reason() {
                    log::info!("[WS] {} closing: {}", subscriber_id, reason);
                }
                break;
            }
            // Deliver queued broadcasts, preserving enqueue order.
            _ = subscriber.notified() => {
                let mut failed = false;
                for message in subscriber.drain() {
                    let outgoing = match message {
                        OutboundMessage::Text(text) => Message::Text(text.into()),
                        OutboundMessage::Binary(bytes) => Message::Binary(bytes),
                    };
                    if sender.send(outgoing).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    break;
                }
            }
            // Inbound commands.
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientCommand>(&text) {
                        Ok(command) => apply_command(&subscriber, command),
                        Err(_) => {
                            let error = HubEvent::Error {
                                error: "unknown command".into(),
                            };
                            if let Some(msg) = text_message(&error) {
                                let _ = sender.send(msg).await;
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
        }
    }

    state.hub.unregister(&subscriber_id);
}

fn apply_command(subscriber: &crate::hub::subscriber::Subscriber, command: ClientCommand) {
    match command {
        ClientCommand::SubscribeAll => subscriber.subscribe_all(),
        ClientCommand::Subscribe { talkgroups } => subscriber.subscribe(&talkgroups),
        ClientCommand::Unsubscribe { talkgroups } => subscriber.unsubscribe(&talkgroups),
        ClientCommand::EnableAudio { enabled } => subscriber.set_audio_enabled(enabled),
        ClientCommand::EnableFft { enabled } => subscriber.set_fft_enabled(enabled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_from_snake_case_tags() {
        assert!(matches!(
            serde_json::from_str::<ClientCommand>(r#"{"type":"subscribe_all"}"#).unwrap(),
            ClientCommand::SubscribeAll
        ));
        match serde_json::from_str::<ClientCommand>(
            r#"{"type":"subscribe","talkgroups":[927,931]}"#,
        )
        .unwrap()
        {
            ClientCommand::Subscribe { talkgroups } => assert_eq!(talkgroups, vec![927, 931]),
            other => panic!("wrong command: {:?}", other),
        }
        assert!(matches!(
            serde_json::from_str::<ClientCommand>(r#"{"type":"enable_fft","enabled":true}"#)
                .unwrap(),
            ClientCommand::EnableFft { enabled: true }
        ));
        assert!(serde_json::from_str::<ClientCommand>(r#"{"type":"bogus"}"#).is_err());
    }
}
