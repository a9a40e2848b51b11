//! Scripted in-memory NmClient for unit tests
//!
//! Keeps a fake connection table, records every mutation in call order, and
//! can be told to fail the next add/delete calls. Like the real daemon it
//! happily stores duplicate ids.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ConnectionSpec, NmClient, NmConnection, NmError};

pub struct MockNm {
    inner: Mutex<Inner>,
}

struct Inner {
    connections: Vec<(String, ConnectionSpec)>,
    log: Vec<String>,
    fail_add: VecDeque<NmError>,
    fail_delete: VecDeque<NmError>,
    running: bool,
    connectivity_check: bool,
    next_uuid: u32,
}

impl MockNm {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                connections: Vec::new(),
                log: Vec::new(),
                fail_add: VecDeque::new(),
                fail_delete: VecDeque::new(),
                running: true,
                connectivity_check: false,
                next_uuid: 0,
            }),
        }
    }

    pub fn set_running(&self, running: bool) {
        self.inner.lock().unwrap().running = running;
    }

    pub fn set_connectivity_check(&self, enabled: bool) {
        self.inner.lock().unwrap().connectivity_check = enabled;
    }

    pub fn connectivity_check(&self) -> bool {
        self.inner.lock().unwrap().connectivity_check
    }

    /// Install a connection as if it predated the test, without logging.
    pub fn seed_connection(&self, spec: ConnectionSpec) {
        let mut inner = self.inner.lock().unwrap();
        let uuid = format!("mock-uuid-{}", inner.next_uuid);
        inner.next_uuid += 1;
        inner.connections.push((uuid, spec));
    }

    pub fn queue_add_failure(&self, err: NmError) {
        self.inner.lock().unwrap().fail_add.push_back(err);
    }

    pub fn queue_delete_failure(&self, err: NmError) {
        self.inner.lock().unwrap().fail_delete.push_back(err);
    }

    pub fn has_connection(&self, id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .connections
            .iter()
            .any(|(_, spec)| spec.id == id)
    }

    pub fn connection_spec(&self, id: &str) -> Option<ConnectionSpec> {
        self.inner
            .lock()
            .unwrap()
            .connections
            .iter()
            .find(|(_, spec)| spec.id == id)
            .map(|(_, spec)| spec.clone())
    }

    /// Mutations in call order, e.g. `["add nmguard-killswitch"]`.
    pub fn log(&self) -> Vec<String> {
        self.inner.lock().unwrap().log.clone()
    }
}

#[async_trait]
impl NmClient for MockNm {
    async fn add_connection(&self, spec: &ConnectionSpec) -> Result<(), NmError> {
        let mut inner = self.inner.lock().unwrap();
        inner.log.push(format!("add {}", spec.id));
        if let Some(err) = inner.fail_add.pop_front() {
            return Err(err);
        }
        let uuid = format!("mock-uuid-{}", inner.next_uuid);
        inner.next_uuid += 1;
        inner.connections.push((uuid, spec.clone()));
        Ok(())
    }

    async fn delete_connection(&self, uuid: &str) -> Result<(), NmError> {
        let mut inner = self.inner.lock().unwrap();
        let position = inner.connections.iter().position(|(u, _)| u == uuid);
        let id = position
            .map(|i| inner.connections[i].1.id.clone())
            .unwrap_or_else(|| uuid.to_string());
        inner.log.push(format!("delete {}", id));
        if let Some(err) = inner.fail_delete.pop_front() {
            return Err(err);
        }
        match position {
            Some(i) => {
                inner.connections.remove(i);
                Ok(())
            }
            None => Err(NmError::NotFound(uuid.to_string())),
        }
    }

    async fn get_connection(&self, id: &str) -> Result<Option<NmConnection>, NmError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .connections
            .iter()
            .find(|(_, spec)| spec.id == id)
            .map(|(uuid, spec)| NmConnection {
                id: spec.id.clone(),
                uuid: uuid.clone(),
                interface: Some(spec.interface.clone()),
            }))
    }

    async fn is_running(&self) -> Result<bool, NmError> {
        Ok(self.inner.lock().unwrap().running)
    }

    async fn connectivity_check_enabled(&self) -> Result<bool, NmError> {
        Ok(self.inner.lock().unwrap().connectivity_check)
    }

    async fn set_connectivity_check(&self, enabled: bool) -> Result<(), NmError> {
        let mut inner = self.inner.lock().unwrap();
        inner.log.push(format!("set-connectivity-check {}", enabled));
        inner.connectivity_check = enabled;
        Ok(())
    }
}
