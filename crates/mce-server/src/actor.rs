//! VM actor thread (C10's dedicated-thread half): owns the single
//! `mce_core::Engine` and drains a channel of work items, one at a time.
//!
//! Grounded on the teacher's interpreter-pool pattern, collapsed from N
//! slots to a single persistent slot since this engine's namespaces and
//! caches are long-lived rather than per-call.

use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use mce_core::types::Envelope;
use mce_core::Engine;

pub struct WorkItem {
    pub op_name: String,
    pub body: serde_json::Value,
    pub response: tokio::sync::oneshot::Sender<Envelope>,
}

pub struct ActorHandle {
    sender: mpsc::Sender<WorkItem>,
    _join: JoinHandle<()>,
}

impl ActorHandle {
    /// Submits a unit of work to the actor thread and awaits its response.
    /// Returns a framework-level envelope if the actor thread has gone away.
    pub async fn submit(&self, op_name: String, body: serde_json::Value) -> Envelope {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let item = WorkItem { op_name, body, response: tx };
        if self.sender.send(item).is_err() {
            return Envelope::framework_error("engine actor thread is not running");
        }
        rx.await.unwrap_or_else(|_| Envelope::framework_error("engine actor thread dropped the response channel"))
    }
}

/// Spawns the dedicated OS thread that will own the engine for the rest of
/// the process's life, and builds the engine itself on that thread.
///
/// The engine's VM, registry and store are all `Rc`-based and therefore
/// `!Send` (see `mce_core::vm::PyVm`), so it cannot be constructed here and
/// handed across the thread boundary: `db_path` and `check_interval` are
/// sent instead, and `Engine::init` runs on the actor thread itself. Startup
/// failure is reported back over a one-shot channel before `spawn` returns,
/// so the caller never gets a handle to a thread whose engine failed to
/// initialize.
pub fn spawn(db_path: String, check_interval: Duration) -> Result<ActorHandle, mce_core::EngineError> {
    let (sender, receiver) = mpsc::channel::<WorkItem>();
    let (init_tx, init_rx) = mpsc::channel::<Result<(), mce_core::EngineError>>();

    let join = std::thread::Builder::new()
        .name("mce-vm-actor".to_string())
        .spawn(move || {
            let engine = match Engine::init(&db_path, check_interval) {
                Ok(engine) => {
                    let _ = init_tx.send(Ok(()));
                    engine
                }
                Err(e) => {
                    let _ = init_tx.send(Err(e));
                    return;
                }
            };
            run(engine, receiver, check_interval)
        })
        .expect("failed to spawn VM actor thread");

    match init_rx.recv() {
        Ok(Ok(())) => Ok(ActorHandle { sender, _join: join }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(mce_core::EngineError::DispatchError("VM actor thread exited before initializing".to_string())),
    }
}

fn run(engine: Engine, receiver: mpsc::Receiver<WorkItem>, check_interval: Duration) {
    let engine = std::rc::Rc::new(engine);
    let mut last_sweep = std::time::Instant::now();
    loop {
        match receiver.recv_timeout(Duration::from_millis(200)) {
            Ok(item) => {
                let envelope = mce_core::dispatcher::dispatch(&engine, &item.op_name, item.body);
                let _ = item.response.send(envelope);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        if last_sweep.elapsed() >= check_interval {
            engine.sweep_caches();
            last_sweep = std::time::Instant::now();
        }
    }
}
