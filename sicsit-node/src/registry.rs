//! Concurrent session table.
//!
//! One `Mutex` per session serializes handshake steps on that session while
//! independent sessions proceed in parallel. Each pending session owns a
//! timer task that fails it when its deadline passes.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use sicsit_core::{HandshakeMachine, SitError, SitResult};

/// A session's machine, shared between the registry and its timer.
pub type SharedMachine = Arc<Mutex<HandshakeMachine>>;

/// Session id to machine mapping.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SharedMachine>>,
    timers: std::sync::Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a machine under its session id.
    pub async fn insert(&self, session_id: Uuid, machine: HandshakeMachine) -> SitResult<SharedMachine> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session_id) {
            return Err(SitError::UnexpectedIntentSource(format!(
                "session {} already exists",
                session_id
            )));
        }
        let shared = Arc::new(Mutex::new(machine));
        sessions.insert(session_id, Arc::clone(&shared));
        Ok(shared)
    }

    pub async fn get(&self, session_id: &Uuid) -> Option<SharedMachine> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Spawn a timer that expires the session at `deadline`.
    pub fn arm_deadline(&self, session_id: Uuid, machine: SharedMachine, deadline: Instant) {
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let mut machine = machine.lock().await;
            if machine.expire(Instant::now()) {
                tracing::warn!(%session_id, "Handshake deadline expired");
            }
        });

        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = timers.insert(session_id, handle) {
            previous.abort();
        }
    }

    /// Cancel a session's timer, if armed.
    pub fn disarm(&self, session_id: &Uuid) {
        let handle = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Drop failed and terminated sessions. Returns how many were removed.
    pub async fn reap(&self) -> usize {
        let snapshot: Vec<(Uuid, SharedMachine)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, m)| (*id, Arc::clone(m)))
            .collect();

        let mut finished = Vec::new();
        for (id, machine) in snapshot {
            if machine.lock().await.status().is_terminal() {
                finished.push(id);
            }
        }

        let mut sessions = self.sessions.write().await;
        for id in &finished {
            sessions.remove(id);
            self.disarm(id);
        }
        if !finished.is_empty() {
            tracing::debug!(reaped = finished.len(), "Reaped finished sessions");
        }
        finished.len()
    }
}
