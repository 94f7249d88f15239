//! Admin panel API. The admin task owns its own listener, separate
//! from every game transport, and only ever talks to the game through
//! the [`ServerController`] seam: reads come from snapshots, mutations
//! are marshalled onto the command queue by the controller
//! implementation.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::{self, TraceLayer};
use tracing::{info, Level};

use crate::prelude::*;
use crate::world::World;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_address: String,
}

pub struct Driver;

impl<C: CancelToken> tinymush_core::Driver<World, C> for Driver {
    type Config = Config;

    async fn run(config: Self::Config, world: World, cancel: C) -> Result<(), ServeError> {
        let app = router::<World>().with_state(world).layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
        );

        let listener = tokio::net::TcpListener::bind(&config.listen_address)
            .await
            .map_err(ServeError::BindError)?;

        info!(target: "admin", addr = %config.listen_address, "admin listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(ServeError::ShutdownError)?;

        Ok(())
    }
}

pub fn router<S>() -> Router<S>
where
    S: ServerController + Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/api/status", get(status::<S>))
        .route("/api/who", get(who::<S>))
        .route("/api/broadcast", post(broadcast::<S>))
        .route("/api/archive", post(trigger_archive::<S>))
        .route("/api/shutdown", post(shutdown::<S>))
}

async fn status<S: ServerController + Clone>(State(ctl): State<S>) -> Json<ServerStatus> {
    Json(ctl.status())
}

async fn who<S: ServerController + Clone>(State(ctl): State<S>) -> Json<Vec<WhoEntry>> {
    Json(ctl.who())
}

#[derive(Deserialize)]
struct BroadcastRequest {
    text: String,
}

async fn broadcast<S: ServerController + Clone>(
    State(ctl): State<S>,
    Json(req): Json<BroadcastRequest>,
) -> Json<serde_json::Value> {
    info!(target: "admin", "broadcast requested");
    ctl.broadcast(&req.text);
    Json(serde_json::json!({ "ok": true }))
}

async fn trigger_archive<S: ServerController + Clone>(
    State(ctl): State<S>,
) -> Json<serde_json::Value> {
    info!(target: "admin", "archive requested");
    ctl.trigger_archive();
    Json(serde_json::json!({ "ok": true }))
}

#[derive(Deserialize)]
struct ShutdownRequest {
    #[serde(default)]
    grace_secs: u64,
}

async fn shutdown<S: ServerController + Clone>(
    State(ctl): State<S>,
    Json(req): Json<ShutdownRequest>,
) -> Json<serde_json::Value> {
    info!(target: "admin", grace_secs = req.grace_secs, "shutdown requested");
    ctl.shutdown(req.grace_secs);
    Json(serde_json::json!({ "ok": true }))
}
