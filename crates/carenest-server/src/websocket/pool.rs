//! Registry of live connections, indexed by user, connection, and family.
//!
//! One connection per user. All three indexes live behind a single lock so
//! supersession and removal are atomic with respect to each other.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use carenest_core::{ConnectionId, FamilyId, SessionError, UserId, close_code};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::connection::Connection;

#[derive(Default)]
struct PoolIndex {
    by_user: HashMap<UserId, Arc<Connection>>,
    by_connection: HashMap<ConnectionId, UserId>,
    by_family: HashMap<FamilyId, HashSet<UserId>>,
}

impl PoolIndex {
    fn detach_user(&mut self, user_id: &UserId) -> Option<Arc<Connection>> {
        let conn = self.by_user.remove(user_id)?;
        let _ = self.by_connection.remove(conn.id());
        if let Some(family_id) = conn.family_id() {
            if let Some(members) = self.by_family.get_mut(family_id) {
                let _ = members.remove(user_id);
                if members.is_empty() {
                    let _ = self.by_family.remove(family_id);
                }
            }
        }
        Some(conn)
    }

    fn register(&mut self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let previous = self.detach_user(conn.user_id());
        if let Some(prev) = &previous {
            let _ = prev.close(close_code::SUPERSEDED, "Session superseded");
            info!(
                user_id = %conn.user_id(),
                old_connection_id = %prev.id(),
                new_connection_id = %conn.id(),
                "connection superseded"
            );
        }
        if !conn.is_active() {
            debug!(connection_id = %conn.id(), "not registering closed connection");
            return previous;
        }
        let user_id = conn.user_id().clone();
        let _ = self.by_connection.insert(conn.id().clone(), user_id.clone());
        if let Some(family_id) = conn.family_id() {
            let _ = self
                .by_family
                .entry(family_id.clone())
                .or_default()
                .insert(user_id.clone());
        }
        let _ = self.by_user.insert(user_id, conn);
        previous
    }
}

/// Registry of live connections.
#[derive(Default)]
pub struct ConnectionPool {
    inner: Mutex<PoolIndex>,
}

impl ConnectionPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, superseding any existing one for the same user.
    ///
    /// The superseded connection is closed with
    /// [`close_code::SUPERSEDED`] and returned. A connection that is already
    /// closed is not registered.
    pub fn add(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        self.inner.lock().register(conn)
    }

    /// Like [`add`](Self::add), but refuses a new user once `limit`
    /// connections are registered.
    ///
    /// The count check and the insert happen under one lock. A reconnect
    /// replaces the user's entry and is admitted at the limit.
    pub fn try_add(
        &self,
        conn: Arc<Connection>,
        limit: usize,
    ) -> Result<Option<Arc<Connection>>, SessionError> {
        let mut index = self.inner.lock();
        if !index.by_user.contains_key(conn.user_id()) && index.by_user.len() >= limit {
            return Err(SessionError::CapacityExceeded { limit });
        }
        Ok(index.register(conn))
    }

    /// Unregister a connection by ID.
    ///
    /// Does nothing if the user's current entry belongs to a different
    /// (newer) connection. Returns the removed connection.
    pub fn remove(&self, connection_id: &ConnectionId) -> Option<Arc<Connection>> {
        let mut index = self.inner.lock();
        let user_id = index.by_connection.get(connection_id)?.clone();
        let is_current = index
            .by_user
            .get(&user_id)
            .is_some_and(|c| c.id() == connection_id);
        if !is_current {
            return None;
        }
        index.detach_user(&user_id)
    }

    /// Unregister and return every connection.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let mut index = self.inner.lock();
        index.by_connection.clear();
        index.by_family.clear();
        index.by_user.drain().map(|(_, conn)| conn).collect()
    }

    /// Connection for a user, if any.
    pub fn get_by_user(&self, user_id: &UserId) -> Option<Arc<Connection>> {
        self.inner.lock().by_user.get(user_id).cloned()
    }

    /// Connection by ID, if registered.
    pub fn get(&self, connection_id: &ConnectionId) -> Option<Arc<Connection>> {
        let index = self.inner.lock();
        let user_id = index.by_connection.get(connection_id)?;
        index.by_user.get(user_id).cloned()
    }

    /// Snapshot of every connection in a family.
    pub fn get_by_family(&self, family_id: &FamilyId) -> Vec<Arc<Connection>> {
        let index = self.inner.lock();
        index
            .by_family
            .get(family_id)
            .map(|users| {
                users
                    .iter()
                    .filter_map(|u| index.by_user.get(u).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of every registered connection.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.lock().by_user.values().cloned().collect()
    }

    /// Number of registered connections.
    pub fn count(&self) -> usize {
        self.inner.lock().by_user.len()
    }

    /// Whether a user has a registered connection.
    pub fn contains_user(&self, user_id: &UserId) -> bool {
        self.inner.lock().by_user.contains_key(user_id)
    }
}
