//! Concurrent registry mapping session ids to live sockets.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::{sid::Sid, socket::Socket};

#[derive(Default)]
pub(crate) struct SessionManager {
    sockets: RwLock<HashMap<Sid, Arc<Socket>>>,
}

impl SessionManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn put(&self, sid: Sid, socket: Arc<Socket>) {
        self.sockets.write().unwrap().insert(sid, socket);
    }

    /// Clones the socket ref out so the lock is never held by callers.
    pub(crate) fn get(&self, sid: Sid) -> Option<Arc<Socket>> {
        self.sockets.read().unwrap().get(&sid).cloned()
    }

    pub(crate) fn remove(&self, sid: Sid) -> Option<Arc<Socket>> {
        self.sockets.write().unwrap().remove(&sid)
    }

    pub(crate) fn len(&self) -> usize {
        self.sockets.read().unwrap().len()
    }

    /// Snapshot the sessions matching `filter`, for callers that will take
    /// the write lock again per session (eviction, server shutdown).
    pub(crate) fn collect(&self, filter: impl Fn(&Arc<Socket>) -> bool) -> Vec<Arc<Socket>> {
        self.sockets
            .read()
            .unwrap()
            .values()
            .filter(|s| filter(s))
            .cloned()
            .collect()
    }
}
