//! WebSocket transport for the streaming calls.
//!
//! Every frame is a JSON text message. The first inbound frame of a
//! stream carries the call's opening message (a build request, task
//! request, worker enlist or executor enlist).

use std::future::Future;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::{extract::State, response::Response};
use buildq_core::protocol::{
    BuildRequest, BuildUpdate, ExecutorEnlist, TaskRequest, TaskUpdate, WorkerRequest,
    WorkerUpdate,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::{DeserializeOwned, IgnoredAny};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::services::{SchedulerService, WorkerService};
use crate::state::AppState;

const CHANNEL_CAPACITY: usize = 100;

pub async fn schedule_build(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let service = SchedulerService::new(state.scheduler.clone());
    ws.on_upgrade(move |socket| {
        bridge(
            socket,
            move |request: BuildRequest, _: mpsc::Receiver<IgnoredAny>, out: mpsc::Sender<BuildUpdate>| async move {
                service.schedule_build(request, out).await
            },
        )
    })
}

pub async fn schedule_task(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let service = SchedulerService::new(state.scheduler.clone());
    ws.on_upgrade(move |socket| {
        bridge(
            socket,
            move |request: TaskRequest, _: mpsc::Receiver<IgnoredAny>, out: mpsc::Sender<TaskUpdate>| async move {
                service.schedule_task(request, out).await
            },
        )
    })
}

pub async fn get_instructions(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    let service = worker_service(&state);
    ws.on_upgrade(move |socket| {
        bridge(
            socket,
            move |enlist: WorkerUpdate,
                  inbound: mpsc::Receiver<WorkerUpdate>,
                  out: mpsc::Sender<WorkerRequest>| async move {
                service.get_instructions(enlist, inbound, out).await
            },
        )
    })
}

pub async fn get_tasks(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let service = worker_service(&state);
    ws.on_upgrade(move |socket| {
        bridge(
            socket,
            move |enlist: ExecutorEnlist,
                  inbound: mpsc::Receiver<TaskUpdate>,
                  out: mpsc::Sender<TaskRequest>| async move {
                service.get_tasks(enlist, inbound, out).await
            },
        )
    })
}

fn worker_service(state: &AppState) -> WorkerService {
    WorkerService::new(
        state.scheduler.clone(),
        state.logs.clone(),
        state.executor_init_timeout,
    )
}

/// Run `service` over a socket. The first frame is decoded as `First`, the
/// rest as `In`; outbound messages are encoded from `Out`. The service
/// always runs to completion so it can release what it registered, and a
/// peer disconnect surfaces to it as a closed channel.
async fn bridge<First, In, Out, F, Fut>(socket: WebSocket, service: F)
where
    First: DeserializeOwned + Send + 'static,
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + 'static,
    F: FnOnce(First, mpsc::Receiver<In>, mpsc::Sender<Out>) -> Fut + Send + 'static,
    Fut: Future<Output = buildq_core::Result<()>> + Send,
{
    let (sink, stream) = socket.split();
    let (first_tx, first_rx) = oneshot::channel();
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (done_tx, done_rx) = oneshot::channel();
    let disconnected = CancellationToken::new();

    let reader = tokio::spawn(read_frames(stream, first_tx, in_tx, disconnected.clone()));
    let writer = tokio::spawn(write_frames(sink, out_rx, done_rx, disconnected));

    let result = match first_rx.await {
        Ok(first) => service(first, in_rx, out_tx).await,
        Err(_) => {
            drop(out_tx);
            Ok(())
        }
    };
    if let Err(err) = &result {
        debug!(error = %err, "Stream ended with error");
    }
    let _ = done_tx.send(result.err().map(|err| err.to_string()));

    reader.abort();
    if let Err(err) = writer.await {
        trace!(error = %err, "Writer task failed");
    }
}

/// Decode frames until the peer goes away. Frames the service no longer
/// reads are discarded.
async fn read_frames<First, In>(
    mut stream: SplitStream<WebSocket>,
    first: oneshot::Sender<First>,
    inbound: mpsc::Sender<In>,
    disconnected: CancellationToken,
) where
    First: DeserializeOwned,
    In: DeserializeOwned,
{
    let mut first = Some(first);
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                trace!(error = %err, "Socket read error");
                break;
            }
        };

        if let Some(tx) = first.take() {
            match serde_json::from_str::<First>(&text) {
                Ok(frame) => {
                    let _ = tx.send(frame);
                }
                Err(err) => {
                    warn!(error = %err, "Invalid opening frame");
                    first = Some(tx);
                }
            }
            continue;
        }

        match serde_json::from_str::<In>(&text) {
            Ok(frame) => {
                if inbound.send(frame).await.is_err() {
                    trace!("Inbound frame discarded");
                }
            }
            Err(err) => warn!(error = %err, "Invalid frame"),
        }
    }
    disconnected.cancel();
}

async fn write_frames<Out: Serialize>(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Out>,
    done: oneshot::Receiver<Option<String>>,
    disconnected: CancellationToken,
) {
    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let Some(msg) = msg else {
                    break;
                };
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "Unencodable frame");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    disconnected.cancel();
                    return;
                }
            }
            _ = disconnected.cancelled() => return,
        }
    }

    let frame = match done.await.ok().flatten() {
        Some(reason) => CloseFrame {
            code: close_code::ERROR,
            reason: reason.into(),
        },
        None => CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        },
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
}
