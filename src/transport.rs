//! Worker transport abstraction (SPEC_FULL.md §15).
//!
//! `Transport` is the seam a concrete worker-hosting strategy implements —
//! spawning an OS thread, a child process, or (outside this crate's scope)
//! a browser worker. `spawn` hands back a [`WorkerConn`], a bidirectional
//! frame channel to that worker. This crate ships one implementation,
//! [`ThreadTransport`], grounded on `kernel::ipc::channel`'s `Sender`/
//! `Receiver` split, generalised from a single-threaded `Rc<RefCell<..>>`
//! pair to a cross-thread pair over `crossbeam_channel`, since workers here
//! run on real OS threads rather than sharing the orchestrator's thread.
//! Process and browser-worker transports are explicit Non-goals (spec.md
//! §1) but the trait is shaped so either is a pure addition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::TryRecvError as ChannelTryRecvError;
use thiserror::Error;

use crate::task::TaskId;

/// What a frame carries across the wire. Heartbeats and shutdown carry no
/// payload; everything else wraps a serialized `Value` (see
/// `crate::serializer`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Call,
    Result,
    Error,
    Cancel,
    Heartbeat,
    Shutdown,
}

/// One message exchanged between the orchestrator and a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub task_id: Option<TaskId>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn call(task_id: TaskId, payload: Vec<u8>) -> Self {
        Frame { kind: FrameKind::Call, task_id: Some(task_id), payload }
    }

    pub fn result(task_id: TaskId, payload: Vec<u8>) -> Self {
        Frame { kind: FrameKind::Result, task_id: Some(task_id), payload }
    }

    pub fn error(task_id: TaskId, payload: Vec<u8>) -> Self {
        Frame { kind: FrameKind::Error, task_id: Some(task_id), payload }
    }

    pub fn cancel(task_id: TaskId) -> Self {
        Frame { kind: FrameKind::Cancel, task_id: Some(task_id), payload: Vec::new() }
    }

    pub fn heartbeat() -> Self {
        Frame { kind: FrameKind::Heartbeat, task_id: None, payload: Vec::new() }
    }

    pub fn shutdown() -> Self {
        Frame { kind: FrameKind::Shutdown, task_id: None, payload: Vec::new() }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Recv(String),
}

/// Parameters needed to host one worker. `handler` stands in for the
/// worker-side method dispatch table — out of scope for this crate (spec.md
/// §1 excludes the concrete worker runtime) but a transport needs *some*
/// function to run on the spawned thread, so callers supply one.
pub struct WorkerParams {
    pub handler: Arc<dyn Fn(Frame) -> Frame + Send + Sync>,
}

/// A strategy for hosting workers and exchanging frames with them.
pub trait Transport: Send + Sync {
    fn spawn(&self, params: WorkerParams) -> Result<Box<dyn WorkerConn>, TransportError>;
}

/// One live connection to a hosted worker.
pub trait WorkerConn: Send {
    fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Non-blocking receive. `Ok(None)` means no frame is queued yet but the
    /// connection is still open.
    fn try_recv(&self) -> Result<Option<Frame>, TransportError>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Spawns one real OS thread per worker, exchanging frames over an
/// unbounded `crossbeam_channel` pair. The only transport this crate ships.
#[derive(Debug, Default)]
pub struct ThreadTransport;

impl ThreadTransport {
    pub fn new() -> Self {
        ThreadTransport
    }
}

struct ThreadWorkerConn {
    tx: crossbeam_channel::Sender<Frame>,
    rx: crossbeam_channel::Receiver<Frame>,
    closed: Arc<AtomicBool>,
}

impl Transport for ThreadTransport {
    fn spawn(&self, params: WorkerParams) -> Result<Box<dyn WorkerConn>, TransportError> {
        let (tx_to_worker, rx_in_worker) = crossbeam_channel::unbounded::<Frame>();
        let (tx_from_worker, rx_from_worker) = crossbeam_channel::unbounded::<Frame>();
        let closed = Arc::new(AtomicBool::new(false));
        let worker_closed = closed.clone();

        thread::Builder::new()
            .name("workpool-worker".into())
            .spawn(move || {
                for frame in rx_in_worker.iter() {
                    if matches!(frame.kind, FrameKind::Shutdown) {
                        break;
                    }
                    let reply = (params.handler)(frame);
                    if tx_from_worker.send(reply).is_err() {
                        break;
                    }
                }
                worker_closed.store(true, Ordering::Release);
            })
            .map_err(|e| TransportError::Send(e.to_string()))?;

        Ok(Box::new(ThreadWorkerConn { tx: tx_to_worker, rx: rx_from_worker, closed }))
    }
}

impl WorkerConn for ThreadWorkerConn {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.tx.send(frame).map_err(|e| TransportError::Send(e.to_string()))
    }

    fn try_recv(&self) -> Result<Option<Frame>, TransportError> {
        match self.rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(ChannelTryRecvError::Empty) => {
                if self.closed.load(Ordering::Acquire) {
                    Err(TransportError::Closed)
                } else {
                    Ok(None)
                }
            }
            Err(ChannelTryRecvError::Disconnected) => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        let _ = self.tx.send(Frame::shutdown());
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn echo_handler() -> Arc<dyn Fn(Frame) -> Frame + Send + Sync> {
        Arc::new(|frame: Frame| match frame.kind {
            FrameKind::Call => Frame::result(frame.task_id.unwrap(), frame.payload),
            _ => Frame::heartbeat(),
        })
    }

    fn poll_recv(conn: &dyn WorkerConn) -> Frame {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(frame) = conn.try_recv().unwrap() {
                return frame;
            }
            assert!(Instant::now() < deadline, "timed out waiting for a frame");
            thread::yield_now();
        }
    }

    #[test]
    fn spawned_worker_echoes_call_payload() {
        let transport = ThreadTransport::new();
        let conn = transport.spawn(WorkerParams { handler: echo_handler() }).unwrap();

        conn.send(Frame::call(TaskId(1), vec![9, 9, 9])).unwrap();
        let reply = poll_recv(conn.as_ref());

        assert_eq!(reply.kind, FrameKind::Result);
        assert_eq!(reply.task_id, Some(TaskId(1)));
        assert_eq!(reply.payload, vec![9, 9, 9]);
    }

    #[test]
    fn try_recv_on_empty_open_connection_returns_none() {
        let transport = ThreadTransport::new();
        let conn = transport.spawn(WorkerParams { handler: echo_handler() }).unwrap();
        assert_eq!(conn.try_recv().unwrap(), None);
    }

    #[test]
    fn closed_connection_rejects_send_and_recv() {
        let transport = ThreadTransport::new();
        let conn = transport.spawn(WorkerParams { handler: echo_handler() }).unwrap();
        conn.close();
        thread::sleep(Duration::from_millis(20));
        assert!(matches!(conn.send(Frame::heartbeat()), Err(TransportError::Closed)));
        assert!(matches!(conn.try_recv(), Err(TransportError::Closed)));
    }
}
