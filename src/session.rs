//! Sticky worker sessions (spec.md §3 "Session").
//!
//! Grounded on `kernel::process`'s dense-index table plus
//! `kernel::timer::Timer`'s deadline/expiry check, combined into one
//! bounded-lifetime record pinned to a single worker. Unlike
//! `AffinityRouter` (which re-routes on expiry), a `Session` never
//! migrates: losing its worker closes it outright (spec.md §3 invariant).

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCloseReason {
    Explicit,
    Timeout,
    TaskLimit,
    WorkerLost,
}

pub struct Session {
    pub id: SessionId,
    pub worker_index: usize,
    pub task_count: u64,
    pub created_at: Instant,
    pub last_activity_at: Instant,
    pub state_blob: Vec<u8>,
    pub timeout: Duration,
    pub max_tasks: Option<u64>,
    pub active: bool,
}

impl Session {
    fn new(id: SessionId, worker_index: usize, now: Instant, timeout: Duration, max_tasks: Option<u64>) -> Self {
        Session {
            id,
            worker_index,
            task_count: 0,
            created_at: now,
            last_activity_at: now,
            state_blob: Vec::new(),
            timeout,
            max_tasks,
            active: true,
        }
    }

    fn is_idle_timed_out(&self, now: Instant) -> bool {
        now.duration_since(self.last_activity_at) >= self.timeout
    }

    fn is_at_task_limit(&self) -> bool {
        self.max_tasks.is_some_and(|max| self.task_count >= max)
    }
}

/// Owns every live session and enforces close-on-timeout/task-limit/
/// worker-loss. Every `exec` issued through a session dispatches to that
/// session's pinned `worker_index`, never anywhere else.
#[derive(Default)]
pub struct SessionManager {
    sessions: HashMap<SessionId, Session>,
    next_id: u64,
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager { sessions: HashMap::new(), next_id: 1 }
    }

    pub fn create(&mut self, worker_index: usize, now: Instant, timeout: Duration, max_tasks: Option<u64>) -> SessionId {
        let id = SessionId(self.next_id);
        self.next_id += 1;
        self.sessions.insert(id, Session::new(id, worker_index, now, timeout, max_tasks));
        id
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id).filter(|s| s.active)
    }

    /// Record a dispatched task against the session, closing it
    /// immediately afterward if this pushed it past its task limit.
    pub fn record_task(&mut self, id: SessionId, now: Instant) -> Option<SessionCloseReason> {
        let session = self.sessions.get_mut(&id)?;
        if !session.active {
            return None;
        }
        session.task_count += 1;
        session.last_activity_at = now;
        if session.is_at_task_limit() {
            session.active = false;
            return Some(SessionCloseReason::TaskLimit);
        }
        None
    }

    pub fn close(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.active = false;
        }
    }

    /// Close every session whose worker has been removed — sessions never
    /// migrate (spec.md §3).
    pub fn close_sessions_for_worker(&mut self, worker_index: usize) -> Vec<SessionId> {
        let mut closed = Vec::new();
        for session in self.sessions.values_mut() {
            if session.active && session.worker_index == worker_index {
                session.active = false;
                closed.push(session.id);
            }
        }
        closed
    }

    /// Close every session idle past its own `timeout`.
    pub fn expire_idle(&mut self, now: Instant) -> Vec<SessionId> {
        let mut closed = Vec::new();
        for session in self.sessions.values_mut() {
            if session.active && session.is_idle_timed_out(now) {
                session.active = false;
                closed.push(session.id);
            }
        }
        closed
    }

    /// Drop closed sessions from the table entirely, reclaiming memory.
    pub fn sweep_closed(&mut self) {
        self.sessions.retain(|_, s| s.active);
    }

    pub fn active_count(&self) -> usize {
        self.sessions.values().filter(|s| s.active).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_get_round_trips() {
        let mut mgr = SessionManager::new();
        let t0 = Instant::now();
        let id = mgr.create(2, t0, Duration::from_secs(60), None);
        let session = mgr.get(id).unwrap();
        assert_eq!(session.worker_index, 2);
        assert!(session.active);
    }

    #[test]
    fn record_task_closes_at_task_limit() {
        let mut mgr = SessionManager::new();
        let t0 = Instant::now();
        let id = mgr.create(0, t0, Duration::from_secs(60), Some(2));
        assert_eq!(mgr.record_task(id, t0), None);
        assert_eq!(mgr.record_task(id, t0), Some(SessionCloseReason::TaskLimit));
        assert!(mgr.get(id).is_none());
    }

    #[test]
    fn expire_idle_closes_sessions_past_timeout() {
        let mut mgr = SessionManager::new();
        let t0 = Instant::now();
        let id = mgr.create(0, t0, Duration::from_millis(10), None);
        let closed = mgr.expire_idle(t0 + Duration::from_millis(50));
        assert_eq!(closed, vec![id]);
        assert!(mgr.get(id).is_none());
    }

    #[test]
    fn losing_a_worker_closes_its_sessions_without_migration() {
        let mut mgr = SessionManager::new();
        let t0 = Instant::now();
        let a = mgr.create(3, t0, Duration::from_secs(60), None);
        let b = mgr.create(4, t0, Duration::from_secs(60), None);
        let closed = mgr.close_sessions_for_worker(3);
        assert_eq!(closed, vec![a]);
        assert!(mgr.get(a).is_none());
        assert!(mgr.get(b).is_some());
    }

    #[test]
    fn sweep_closed_drops_inactive_sessions() {
        let mut mgr = SessionManager::new();
        let t0 = Instant::now();
        let id = mgr.create(0, t0, Duration::from_secs(60), None);
        mgr.close(id);
        assert_eq!(mgr.active_count(), 0);
        mgr.sweep_closed();
        assert!(mgr.get(id).is_none());
    }
}
