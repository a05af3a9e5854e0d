//! WebSocket progress delivery
//!
//! `GET /ws/{job_id}` upgrades to a WebSocket that first replays the job's
//! durable event history, then forwards live events. Splicing happens on
//! sequence number: the live subscription is opened before the history is
//! read, and live events at or below the last replayed sequence are
//! dropped, so an observer never sees a gap or a duplicate, whatever the
//! connect timing.
//!
//! A slow observer that lags the broadcast channel is resynchronized from
//! the durable log rather than blocking the publisher.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use auris_common::events::ProgressEvent;

use crate::AppState;

/// GET /ws/{job_id}
pub async fn job_progress_ws(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, job_id, socket))
}

async fn send_event(socket: &mut WebSocket, event: &ProgressEvent) -> Result<(), ()> {
    let json = serde_json::to_string(event).map_err(|e| {
        warn!("Failed to serialize progress event: {e}");
    })?;
    socket.send(Message::Text(json)).await.map_err(|_| ())
}

async fn handle_socket(state: AppState, job_id: Uuid, mut socket: WebSocket) {
    let (history, live) = match state.manager.subscribe(job_id).await {
        Ok(subscription) => subscription,
        Err(e) => {
            debug!(job_id = %job_id, error = %e, "WS subscribe failed");
            let _ = socket
                .send(Message::Text(
                    serde_json::json!({
                        "type": "error",
                        "job_id": job_id,
                        "message": "job_not_found",
                    })
                    .to_string(),
                ))
                .await;
            let _ = socket.close().await;
            return;
        }
    };

    debug!(job_id = %job_id, replay = history.len(), "WS observer attached");

    // Replay the durable history first
    let mut last_seq = 0;
    let mut saw_terminal = false;
    for event in &history {
        last_seq = event.sequence();
        saw_terminal |= event.is_terminal();
        if send_event(&mut socket, event).await.is_err() {
            return;
        }
    }

    // Terminal jobs (or jobs with no live channel) end after replay
    let Some(mut rx) = live else {
        let _ = socket.close().await;
        return;
    };
    if saw_terminal {
        let _ = socket.close().await;
        return;
    }

    loop {
        match rx.recv().await {
            Ok(event) => {
                // Duplicate of something already replayed
                if event.sequence() <= last_seq {
                    continue;
                }
                last_seq = event.sequence();
                let terminal = event.is_terminal();
                if send_event(&mut socket, &event).await.is_err() {
                    return;
                }
                if terminal {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Fell behind the broadcast buffer: recover the missed span
                // from the durable log (everything published is persisted
                // first, so the log is always ahead of the channel)
                warn!(job_id = %job_id, skipped, "WS observer lagged, resyncing from store");
                let missed = match state.manager.store().events(job_id, last_seq).await {
                    Ok(missed) => missed,
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "WS resync failed");
                        break;
                    }
                };
                let mut finished = false;
                for event in &missed {
                    last_seq = event.sequence();
                    finished |= event.is_terminal();
                    if send_event(&mut socket, event).await.is_err() {
                        return;
                    }
                }
                if finished {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    let _ = socket.close().await;
}
