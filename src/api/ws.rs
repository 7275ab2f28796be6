// =============================================================================
// WebSocket Handler — push-based view updates
// =============================================================================
//
// Clients connect to `/api/v1/ws` and receive:
//   1. The current DashboardView immediately on connect.
//   2. A fresh view every time the dashboard publishes one.
//
// Inbound text frames that parse as a ControlCommand
// (`{"action":"select_timeframe","value":"1Y"}`) are applied and answered
// with a `control` message; anything else is treated as a heartbeat.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::control::{ControlCommand, Selection};
use crate::dashboard::DashboardView;

/// Outbound frame.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Outbound<'a> {
    View {
        seq: u64,
        data: &'a DashboardView,
    },
    Control {
        seq: u64,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        selection: Option<Selection>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Manages a single WebSocket connection lifecycle.
///
/// Two branches run under `tokio::select!`: the push branch waits on the
/// dashboard's view channel, the recv branch handles client frames.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let clients = state.ws_clients.fetch_add(1, Ordering::Relaxed) + 1;
    info!(clients, "WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();
    let mut views = state.dashboard.subscribe();

    let initial = views.borrow_and_update().clone();
    if let Err(e) = send_view(&mut sender, &state, &initial).await {
        warn!(error = %e, "Failed to send initial WebSocket view");
        cleanup(&state);
        return;
    }

    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    info!("dashboard stopped — closing WebSocket");
                    break;
                }
                let view = views.borrow_and_update().clone();
                if let Err(e) = send_view(&mut sender, &state, &view).await {
                    debug!(error = %e, "WebSocket send failed — disconnecting");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ControlCommand>(&text) {
                            Ok(command) => {
                                if let Err(e) = handle_command(&mut sender, &state, command).await {
                                    debug!(error = %e, "Failed to send control reply — disconnecting");
                                    break;
                                }
                            }
                            Err(_) => debug!(msg = %text, "WebSocket text message received (heartbeat)"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "Failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("WebSocket binary message ignored");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    cleanup(&state);
}

// =============================================================================
// Helpers
// =============================================================================

async fn send_json<S>(sender: &mut S, frame: &Outbound<'_>) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(frame) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            // Not a network error; keep the connection.
            warn!(error = %e, "Failed to serialize WebSocket frame");
            Ok(())
        }
    }
}

async fn send_view<S>(
    sender: &mut S,
    state: &AppState,
    view: &DashboardView,
) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let seq = state.next_sequence();
    send_json(sender, &Outbound::View { seq, data: view }).await?;
    debug!(version = view.version, seq, "WebSocket view sent");
    Ok(())
}

async fn handle_command<S>(
    sender: &mut S,
    state: &AppState,
    command: ControlCommand,
) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let seq = state.next_sequence();
    let frame = match state.dashboard.send(command).await {
        Ok(selection) => Outbound::Control {
            seq,
            ok: true,
            selection: Some(selection),
            error: None,
        },
        Err(e) => Outbound::Control {
            seq,
            ok: false,
            selection: None,
            error: Some(format!("{e:#}")),
        },
    };
    send_json(sender, &frame).await
}

fn cleanup(state: &AppState) {
    let remaining = state.ws_clients.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
    info!(clients = remaining, "WebSocket connection closed — cleanup complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;

    #[test]
    fn control_frame_shape() {
        let selection = Selection {
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::Week,
            page: 1,
            analysis_symbol: "BTCUSDT".into(),
        };
        let frame = Outbound::Control {
            seq: 7,
            ok: true,
            selection: Some(selection),
            error: None,
        };
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "control");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["selection"]["timeframe"], "7D");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn inbound_text_parses_as_command_or_heartbeat() {
        let cmd: Result<ControlCommand, _> =
            serde_json::from_str(r#"{"action":"select_instrument","value":"ETHUSDT"}"#);
        assert_eq!(cmd.unwrap(), ControlCommand::SelectInstrument("ETHUSDT".into()));
        assert!(serde_json::from_str::<ControlCommand>("ping").is_err());
    }
}
