//! The web driver: the axum server hosting the WebSocket transport
//! endpoint. The admin API lives on its own listener (see
//! `serve::admin`), so game clients never share a port with it.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::{self, TraceLayer};
use tracing::{debug, info, instrument, Level};

use crate::conn::{Descriptor, OutFrame, Transport};
use crate::prelude::*;
use crate::serve::telnet::handle_line;
use crate::world::World;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_address: String,
}

pub struct Driver;

impl<C: CancelToken> tinymush_core::Driver<World, C> for Driver {
    type Config = Config;

    async fn run(config: Self::Config, world: World, cancel: C) -> Result<(), ServeError> {
        let app = Router::new()
            .route("/ws", get(ws_upgrade))
            .with_state(world)
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                    .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
            );

        let listener = tokio::net::TcpListener::bind(&config.listen_address)
            .await
            .map_err(ServeError::BindError)?;

        info!(addr = %config.listen_address, "web listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(ServeError::ShutdownError)?;

        Ok(())
    }
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(world): State<World>) -> axum::response::Response {
    ws.on_upgrade(move |socket| ws_session(socket, world))
}

/// Inbound WebSocket frames.
#[derive(Debug, Deserialize)]
struct WsCommand {
    #[serde(rename = "type")]
    typ: String,
    #[serde(default)]
    command: String,
}

#[instrument(skip_all)]
async fn ws_session(socket: WebSocket, world: World) {
    let (desc, mut out_rx) = Descriptor::new(
        world.conns.next_id(),
        Transport::WebSocket,
        "websocket",
        world.config.max_retries,
    );
    world.conns.add(desc.clone());

    let (mut sink, mut stream) = {
        use futures_util::StreamExt as _;
        socket.split()
    };

    let writer_desc = desc.clone();
    let writer = tokio::spawn(async move {
        use futures_util::SinkExt as _;

        while let Some(frame) = out_rx.recv().await {
            let payload = encode_ws(&frame);
            if sink.send(Message::Text(payload.into())).await.is_err() {
                writer_desc.close();
                return;
            }
        }
    });

    desc.send(OutFrame::Json(serde_json::json!({
        "type": "text",
        "text": format!(
            "Welcome to {}! Send {{\"type\": \"login\", \"command\": \"connect <name> <password>\"}}.",
            world.config.mud_name
        ),
    })));

    {
        use futures_util::StreamExt as _;

        while let Some(Ok(message)) = stream.next().await {
            let Message::Text(text) = message else {
                continue;
            };

            let Ok(inbound) = serde_json::from_str::<WsCommand>(&text) else {
                debug!("unparseable websocket frame");
                continue;
            };

            match inbound.typ.as_str() {
                "login" | "command" => {
                    if !handle_line(&world, &desc, &inbound.command) {
                        break;
                    }
                }
                other => debug!(typ = other, "unknown websocket frame type"),
            }

            if desc.is_closed() {
                break;
            }
        }
    }

    cleanup_ws(&world, &desc);
    writer.abort();
}

fn encode_ws(frame: &OutFrame) -> String {
    match frame {
        OutFrame::Json(value) => value.to_string(),
        OutFrame::Text(text) => serde_json::json!({ "type": "text", "text": text }).to_string(),
        OutFrame::Gmcp(package, payload) => {
            serde_json::json!({ "type": "oob", "package": package, "data": payload }).to_string()
        }
        OutFrame::Msdp(pairs) => {
            let data: serde_json::Map<String, serde_json::Value> = pairs
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::json!(v)))
                .collect();
            serde_json::json!({ "type": "oob", "data": data }).to_string()
        }
        OutFrame::Raw(bytes) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn cleanup_ws(world: &World, desc: &Arc<Descriptor>) {
    desc.close();
    world.conns.remove(desc.id);
    world.bus.cleanup();
    debug!(id = desc.id, "websocket descriptor cleaned up");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_encoding_wraps_text_frames() {
        let encoded = encode_ws(&OutFrame::Text("hi".into()));
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "text");
        assert_eq!(value["text"], "hi");
    }

    #[test]
    fn ws_inbound_frames_parse() {
        let frame: WsCommand =
            serde_json::from_str(r#"{"type": "login", "command": "connect a b"}"#).unwrap();
        assert_eq!(frame.typ, "login");
        assert_eq!(frame.command, "connect a b");
    }
}
