//! The bridge relay between controller and worker.
//!
//! The relay owns the worker task. It forwards envelopes unchanged in both
//! directions with two exceptions. The `terminate` message is intercepted and
//! handled here (the worker primitive is torn down and a fresh one booted in
//! its place, so the worker itself never sees the message), and an uncaught
//! worker failure (fatal loop error or panic) is converted into an `error`
//! message on the controller side.

use std::sync::Arc;

use tokio::sync::mpsc;

use pipeforge_core::{ControllerMessage, ErrorProxy, Result, WorkerMessage};

use crate::resolver::ScriptResolver;
use crate::worker::{spawn_worker, WorkerLink};

pub(crate) async fn run_relay(
    mut from_controller: mpsc::Receiver<WorkerMessage>,
    to_controller: mpsc::Sender<ControllerMessage>,
    resolver: Arc<dyn ScriptResolver>,
    capacity: usize,
) {
    let (mut worker, mut worker_rx) = spawn_worker(Arc::clone(&resolver), capacity);

    loop {
        tokio::select! {
            inbound = from_controller.recv() => match inbound {
                // Controller dropped the environment.
                None => {
                    worker.join.abort();
                    break;
                }
                Some(WorkerMessage::Terminate) => {
                    tracing::info!("terminate intercepted by relay; recycling worker");
                    worker.join.abort();
                    // Fresh worker, fresh module caches. Its `initialized`
                    // signal re-enters the controller's handshake. A fresh
                    // outbound channel guarantees responses of the torn-down
                    // worker's stragglers never reach the controller.
                    let (fresh, fresh_rx) = spawn_worker(Arc::clone(&resolver), capacity);
                    worker = fresh;
                    worker_rx = fresh_rx;
                }
                Some(message) => {
                    if worker.tx.send(message).await.is_err() {
                        tracing::warn!("worker inbound closed; message dropped");
                    }
                }
            },
            outbound = worker_rx.recv() => match outbound {
                Some(message) => {
                    if to_controller.send(message).await.is_err() {
                        worker.join.abort();
                        break;
                    }
                }
                // The worker released its outbound side: it is going down.
                // Await the task to learn how it ended.
                None => {
                    report_exit(&mut worker, &to_controller).await;
                    break;
                }
            },
            exit = &mut worker.join => {
                if let Some(error) = exit_error(exit) {
                    tracing::error!(%error, "worker failed; reporting to controller");
                    let _ = to_controller
                        .send(ControllerMessage::Error { error })
                        .await;
                }
                break;
            }
        }
    }
}

async fn report_exit(worker: &mut WorkerLink, to_controller: &mpsc::Sender<ControllerMessage>) {
    let exit = (&mut worker.join).await;
    if let Some(error) = exit_error(exit) {
        tracing::error!(%error, "worker failed; reporting to controller");
        let _ = to_controller.send(ControllerMessage::Error { error }).await;
    }
}

/// Fold a finished worker task into the error to report, if any.
fn exit_error(exit: std::result::Result<Result<()>, tokio::task::JoinError>) -> Option<ErrorProxy> {
    match exit {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(ErrorProxy::from(err)),
        Err(join_err) if join_err.is_cancelled() => None,
        Err(join_err) => Some(ErrorProxy::new("WorkerPanicError", join_err.to_string())),
    }
}
