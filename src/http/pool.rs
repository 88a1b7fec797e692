// Copyright 2023 宋昊文
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

extern crate rustls;
extern crate tokio;

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use tokio::sync::oneshot;

use crate::util::log::{platform_log, platform_warn};

use super::config::{PoolConfig, Timeouts};
use super::connection::Connection;
use super::destination::Route;
use super::error::{ErrorKind, Result};

const LOG_TAG: &str = "http_pool";

/// A checked out slot. Dropping an armed lease gives the slot back as discarded.
struct Lease {
    id: u64,
    route: Route,
    pool: Weak<PoolShared>,
    armed: bool,
}

impl Lease {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.armed {
            if let Some(shared) = self.pool.upgrade() {
                shared.discard_slot(&self.route, self.id);
            }
        }
    }
}

/// What a waiter is woken up with: a slot, plus an idle connection if one
/// was handed over directly.
struct Grant {
    lease: Lease,
    conn: Option<Connection>,
}

struct Waiter {
    tx: oneshot::Sender<Grant>,
    since: Instant,
}

#[derive(Default)]
struct Entry {
    /// Front is the most recently released.
    idle: VecDeque<Connection>,
    /// Lease id to checkout time.
    busy: HashMap<u64, Instant>,
    waiters: VecDeque<Waiter>,
}

impl Entry {
    fn size(&self) -> usize {
        self.idle.len() + self.busy.len()
    }

    fn is_empty(&self) -> bool {
        self.idle.is_empty() && self.busy.is_empty() && self.waiters.is_empty()
    }
}

struct PoolState {
    closed: bool,
    entries: HashMap<Route, Entry>,
    total: usize,
    next_lease: u64,
}

impl PoolState {
    fn lease(&mut self, route: &Route, pool: &Weak<PoolShared>) -> Lease {
        let id = self.next_lease;
        self.next_lease += 1;
        Lease {
            id,
            route: route.clone(),
            pool: pool.clone(),
            armed: true,
        }
    }

    fn size(&self, route: &Route) -> usize {
        self.entries.get(route).map_or(0, |e| e.size())
    }

    fn has_idle_except(&self, route: &Route) -> bool {
        self.entries
            .iter()
            .any(|(r, e)| r != route && !e.idle.is_empty())
    }

    fn can_serve(&self, route: &Route, config: &PoolConfig) -> bool {
        if self.entries.get(route).map_or(false, |e| !e.idle.is_empty()) {
            return true;
        }

        self.size(route) < config.max_per_destination
            && (self.total < config.max_total || self.has_idle_except(route))
    }

    /// Removes the least recently used idle connection of any other route.
    fn evict_lru_idle(&mut self, except: &Route) -> Option<Connection> {
        let mut victim: Option<(&Route, Instant)> = None;
        for (r, e) in &self.entries {
            if r == except {
                continue;
            }
            if let Some(conn) = e.idle.back() {
                if victim.map_or(true, |(_, t)| conn.last_used() < t) {
                    victim = Some((r, conn.last_used()));
                }
            }
        }

        let route = victim.map(|(r, _)| r.clone())?;
        let conn = self.entries.get_mut(&route)?.idle.pop_back()?;
        self.total -= 1;
        self.remove_if_empty(&route);

        platform_log(
            LOG_TAG,
            format!("evicting idle {:?} to make room for {:?}", conn, except),
        );

        Some(conn)
    }

    /// Takes an idle connection or reserves a fresh slot for `route`.
    fn try_take(
        &mut self,
        route: &Route,
        config: &PoolConfig,
        pool: &Weak<PoolShared>,
        to_close: &mut Vec<Connection>,
    ) -> Option<Grant> {
        let idle = self.entries.get_mut(route).and_then(|e| e.idle.pop_front());

        if let Some(conn) = idle {
            let lease = self.lease(route, pool);
            let entry = self.entries.entry(route.clone()).or_default();
            entry.busy.insert(lease.id, Instant::now());
            return Some(Grant {
                lease,
                conn: Some(conn),
            });
        }

        if self.size(route) >= config.max_per_destination {
            return None;
        }

        if self.total >= config.max_total {
            to_close.push(self.evict_lru_idle(route)?);
        }

        let lease = self.lease(route, pool);
        let entry = self.entries.entry(route.clone()).or_default();
        entry.busy.insert(lease.id, Instant::now());
        self.total += 1;

        Some(Grant { lease, conn: None })
    }

    /// Rolls back a grant nobody received.
    fn undo(&mut self, mut grant: Grant) {
        grant.lease.disarm();
        if let Some(entry) = self.entries.get_mut(&grant.lease.route) {
            entry.busy.remove(&grant.lease.id);
            match grant.conn.take() {
                Some(conn) => entry.idle.push_front(conn),
                None => self.total -= 1,
            }
        }
    }

    /// Route of the waiter to serve next: same route first, then the oldest
    /// waiter whose route has room.
    fn next_waiter(&mut self, preferred: Option<&Route>, config: &PoolConfig) -> Option<Route> {
        for entry in self.entries.values_mut() {
            entry.waiters.retain(|w| !w.tx.is_closed());
        }

        if let Some(route) = preferred {
            if self
                .entries
                .get(route)
                .map_or(false, |e| !e.waiters.is_empty())
                && self.can_serve(route, config)
            {
                return Some(route.clone());
            }
        }

        let mut best: Option<(&Route, Instant)> = None;
        for (r, e) in &self.entries {
            if let Some(w) = e.waiters.front() {
                if best.map_or(true, |(_, since)| w.since < since) && self.can_serve(r, config) {
                    best = Some((r, w.since));
                }
            }
        }

        best.map(|(r, _)| r.clone())
    }

    fn dispatch(
        &mut self,
        preferred: Option<&Route>,
        config: &PoolConfig,
        pool: &Weak<PoolShared>,
        to_close: &mut Vec<Connection>,
    ) {
        while let Some(route) = self.next_waiter(preferred, config) {
            let waiter = match self.entries.get_mut(&route).and_then(|e| e.waiters.pop_front()) {
                Some(waiter) => waiter,
                None => break,
            };

            match self.try_take(&route, config, pool, to_close) {
                Some(grant) => {
                    if let Err(grant) = waiter.tx.send(grant) {
                        self.undo(grant);
                    }
                }

                None => {
                    if let Some(entry) = self.entries.get_mut(&route) {
                        entry.waiters.push_front(waiter);
                    }
                    break;
                }
            }
        }
    }

    fn prune_expired(&mut self, config: &PoolConfig, to_close: &mut Vec<Connection>) {
        if let Some(idle_timeout) = config.idle_timeout {
            for entry in self.entries.values_mut() {
                while let Some(conn) = entry.idle.back() {
                    if conn.last_used().elapsed() < idle_timeout {
                        break;
                    }
                    if let Some(conn) = entry.idle.pop_back() {
                        platform_log(LOG_TAG, format!("{:?} idle timeout", conn));
                        to_close.push(conn);
                        self.total -= 1;
                    }
                }
            }
            self.entries.retain(|_, e| !e.is_empty());
        }
    }

    /// Reclaims slots of leases held longer than `config.stale_busy_threshold`.
    fn revoke_stale(&mut self, config: &PoolConfig) -> usize {
        let threshold = match config.stale_busy_threshold {
            Some(threshold) => threshold,
            None => return 0,
        };

        let mut revoked = 0;
        for (route, entry) in self.entries.iter_mut() {
            let before = entry.busy.len();
            entry
                .busy
                .retain(|_, checked_out| checked_out.elapsed() < threshold);
            let n = before - entry.busy.len();
            if n > 0 {
                platform_warn(
                    LOG_TAG,
                    format!("reclaimed {} stale lease(s) for {:?}", n, route),
                );
                revoked += n;
            }
        }

        self.total -= revoked;
        revoked
    }

    fn remove_if_empty(&mut self, route: &Route) {
        if self.entries.get(route).map_or(false, |e| e.is_empty()) {
            self.entries.remove(route);
        }
    }
}

struct PoolShared {
    config: PoolConfig,
    tls: Arc<rustls::ClientConfig>,
    timeouts: Timeouts,
    state: Mutex<PoolState>,
}

fn close_all(connections: Vec<Connection>) {
    for conn in connections {
        conn.close();
    }
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn discard_slot(self: &Arc<Self>, route: &Route, lease_id: u64) {
        let mut to_close = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let freed = state
                .entries
                .get_mut(route)
                .map_or(false, |e| e.busy.remove(&lease_id).is_some());
            if freed {
                state.total -= 1;
            }
            state.dispatch(Some(route), &self.config, &Arc::downgrade(self), &mut to_close);
            state.remove_if_empty(route);
        }
        close_all(to_close);
    }
}

enum Checkout {
    Ready(Grant),
    Wait(oneshot::Receiver<Grant>),
}

/// A connection checked out of the pool.
///
/// Give it back with `ConnectionPool::release`. Dropping it instead discards
/// the socket and frees its slot.
pub struct PooledConnection {
    conn: Connection,
    lease: Lease,
}

impl PooledConnection {
    pub fn lease_id(&self) -> u64 {
        self.lease.id
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

/// Keyed registry of idle connections, bounded per route and in total.
///
/// Bookkeeping never suspends, the only await points are opening a socket
/// and waiting in a route's FIFO queue for a slot.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        tls: Arc<rustls::ClientConfig>,
        timeouts: Timeouts,
    ) -> ConnectionPool {
        ConnectionPool {
            shared: Arc::new(PoolShared {
                config,
                tls,
                timeouts,
                state: Mutex::new(PoolState {
                    closed: false,
                    entries: HashMap::new(),
                    total: 0,
                    next_lease: 1,
                }),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    fn checkout(&self, route: &Route, to_close: &mut Vec<Connection>) -> Result<Checkout> {
        let shared = &self.shared;
        let config = &shared.config;
        let pool = Arc::downgrade(shared);

        let mut guard = shared.lock();
        let state = &mut *guard;

        if state.closed {
            return Err(ErrorKind::PoolClosed);
        }

        state.prune_expired(config, to_close);
        state.dispatch(None, config, &pool, to_close);

        let queued = state
            .entries
            .get(route)
            .map_or(false, |e| e.waiters.iter().any(|w| !w.tx.is_closed()));

        if !queued {
            if let Some(grant) = state.try_take(route, config, &pool, to_close) {
                return Ok(Checkout::Ready(grant));
            }

            if state.revoke_stale(config) > 0 {
                state.dispatch(None, config, &pool, to_close);
                if let Some(grant) = state.try_take(route, config, &pool, to_close) {
                    return Ok(Checkout::Ready(grant));
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        state
            .entries
            .entry(route.clone())
            .or_default()
            .waiters
            .push_back(Waiter {
                tx,
                since: Instant::now(),
            });

        platform_log(
            LOG_TAG,
            format!(
                "waiting for a slot on {:?}, {} open in total",
                route, state.total
            ),
        );

        Ok(Checkout::Wait(rx))
    }

    async fn complete(&self, route: &Route, grant: Grant) -> Result<Option<PooledConnection>> {
        let Grant { lease, conn } = grant;

        match conn {
            Some(mut conn) => {
                if conn.is_alive() {
                    platform_log(LOG_TAG, format!("reusing {:?}", conn));
                    Ok(Some(PooledConnection { conn, lease }))
                } else {
                    platform_log(LOG_TAG, format!("{:?} went stale while idle", conn));
                    conn.close();
                    Ok(None)
                }
            }

            None => {
                let conn = Connection::open(route, &self.shared.tls, self.shared.timeouts).await?;
                Ok(Some(PooledConnection { conn, lease }))
            }
        }
    }

    /// Hands out a live connection for `route`, opening one when capacity
    /// allows and otherwise queueing behind earlier callers.
    ///
    /// Cancelling the returned future at any point leaves no slot behind.
    pub async fn acquire(&self, route: &Route) -> Result<PooledConnection> {
        let deadline = self
            .shared
            .config
            .acquire_timeout
            .map(|t| tokio::time::Instant::now() + t);

        loop {
            let mut to_close = Vec::new();
            let checkout = self.checkout(route, &mut to_close);
            close_all(to_close);

            let grant = match checkout? {
                Checkout::Ready(grant) => grant,

                Checkout::Wait(rx) => {
                    let received = match deadline {
                        Some(deadline) => match tokio::time::timeout_at(deadline, rx).await {
                            Ok(received) => received,
                            Err(_) => {
                                platform_log(LOG_TAG, format!("acquire timeout on {:?}", route));
                                return Err(ErrorKind::PoolTimeout);
                            }
                        },
                        None => rx.await,
                    };

                    match received {
                        Ok(grant) => grant,
                        Err(_) => return Err(ErrorKind::PoolClosed),
                    }
                }
            };

            if let Some(pooled) = self.complete(route, grant).await? {
                return Ok(pooled);
            }
        }
    }

    /// Returns a connection after its response was handled.
    ///
    /// Reusable connections go idle or straight to a waiter of the same
    /// route, anything else is closed.
    pub fn release(&self, pooled: PooledConnection) {
        let PooledConnection { conn, mut lease } = pooled;
        lease.disarm();

        let shared = &self.shared;
        let mut to_close = Vec::new();
        {
            let mut guard = shared.lock();
            let state = &mut *guard;
            let route = &lease.route;

            let active = state
                .entries
                .get_mut(route)
                .map_or(false, |e| e.busy.remove(&lease.id).is_some());

            if !active {
                platform_warn(LOG_TAG, format!("{:?} returned on a revoked lease", conn));
                to_close.push(conn);
            } else if state.closed || !conn.is_reusable() {
                state.total -= 1;
                to_close.push(conn);
            } else {
                platform_log(LOG_TAG, format!("{:?} released", conn));
                let max_idle = shared.config.max_idle_per_destination;
                let entry = state.entries.entry(route.clone()).or_default();
                entry.idle.push_front(conn);
                while entry.idle.len() > max_idle {
                    if let Some(conn) = entry.idle.pop_back() {
                        to_close.push(conn);
                        state.total -= 1;
                    }
                }
            }

            state.prune_expired(&shared.config, &mut to_close);
            state.dispatch(Some(route), &shared.config, &Arc::downgrade(shared), &mut to_close);
            state.remove_if_empty(route);
        }
        close_all(to_close);
    }

    /// Closes the connection and frees its slot.
    pub fn discard(&self, pooled: PooledConnection) {
        let PooledConnection { conn, lease } = pooled;
        platform_log(LOG_TAG, format!("discarding {:?}", conn));
        conn.close();
        drop(lease);
    }

    /// Closes idle connections and refuses new acquires. Busy connections
    /// close as they come back, or right away with `force`.
    pub fn shutdown(&self, force: bool) {
        let mut to_close = Vec::new();
        let mut waiters = Vec::new();
        {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            state.closed = true;

            for entry in state.entries.values_mut() {
                state.total -= entry.idle.len();
                to_close.extend(entry.idle.drain(..));
                waiters.extend(entry.waiters.drain(..));
                if force {
                    state.total -= entry.busy.len();
                    entry.busy.clear();
                }
            }

            state.entries.retain(|_, e| !e.is_empty());

            platform_log(
                LOG_TAG,
                format!("pool shut down, {} connection(s) still busy", state.total),
            );
        }
        drop(waiters);
        close_all(to_close);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn num_idle(&self) -> usize {
        self.shared.lock().entries.values().map(|e| e.idle.len()).sum()
    }

    pub fn num_busy(&self) -> usize {
        self.shared.lock().entries.values().map(|e| e.busy.len()).sum()
    }

    pub fn num_total(&self) -> usize {
        self.shared.lock().total
    }

    pub fn idle_count(&self, route: &Route) -> usize {
        self.shared
            .lock()
            .entries
            .get(route)
            .map_or(0, |e| e.idle.len())
    }

    pub fn busy_count(&self, route: &Route) -> usize {
        self.shared
            .lock()
            .entries
            .get(route)
            .map_or(0, |e| e.busy.len())
    }

    pub fn size(&self, route: &Route) -> usize {
        self.shared.lock().size(route)
    }

    /// Ids of the idle connections for `route`, most recent first.
    pub fn idle_ids(&self, route: &Route) -> Vec<u64> {
        self.shared
            .lock()
            .entries
            .get(route)
            .map_or_else(Vec::new, |e| e.idle.iter().map(|c| c.id()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::net::TcpListener;

    use crate::http::config::TlsConfig;
    use crate::http::destination::{Destination, Scheme};

    async fn sink() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });
        port
    }

    fn route(port: u16, host: &str) -> Route {
        Route::Direct(Destination::new(Scheme::Http, host, port))
    }

    fn pool(config: PoolConfig) -> ConnectionPool {
        ConnectionPool::new(
            config,
            TlsConfig::default().build().unwrap(),
            Timeouts::default(),
        )
    }

    #[tokio::test]
    async fn release_then_reuse() {
        let port = sink().await;
        let r = route(port, "127.0.0.1");
        let pool = pool(PoolConfig::default());

        let conn = pool.acquire(&r).await.unwrap();
        let id = conn.id();
        assert_eq!(pool.busy_count(&r), 1);
        pool.release(conn);
        assert_eq!(pool.idle_count(&r), 1);
        assert_eq!(pool.busy_count(&r), 0);

        let conn = pool.acquire(&r).await.unwrap();
        assert_eq!(conn.id(), id);
        pool.release(conn);
        assert_eq!(pool.num_total(), 1);
    }

    #[tokio::test]
    async fn dropped_lease_frees_slot() {
        let port = sink().await;
        let r = route(port, "127.0.0.1");
        let pool = pool(PoolConfig::default());

        let conn = pool.acquire(&r).await.unwrap();
        drop(conn);
        assert_eq!(pool.num_total(), 0);
        assert_eq!(pool.idle_count(&r), 0);
    }

    #[tokio::test]
    async fn per_route_cap_times_out() {
        let port = sink().await;
        let r = route(port, "127.0.0.1");
        let pool = pool(PoolConfig {
            max_per_destination: 1,
            acquire_timeout: Some(Duration::from_millis(100)),
            ..PoolConfig::default()
        });

        let held = pool.acquire(&r).await.unwrap();
        assert_eq!(pool.acquire(&r).await.err(), Some(ErrorKind::PoolTimeout));
        assert_eq!(pool.size(&r), 1);
        pool.release(held);
        assert!(pool.acquire(&r).await.is_ok());
    }

    #[tokio::test]
    async fn waiter_gets_released_connection() {
        let port = sink().await;
        let r = route(port, "127.0.0.1");
        let pool = pool(PoolConfig {
            max_per_destination: 1,
            ..PoolConfig::default()
        });

        let held = pool.acquire(&r).await.unwrap();
        let id = held.id();

        let waiting = {
            let pool = pool.clone();
            let r = r.clone();
            tokio::spawn(async move { pool.acquire(&r).await.map(|c| c.id()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release(held);
        assert_eq!(waiting.await.unwrap(), Ok(id));
    }

    #[tokio::test]
    async fn waiter_gets_slot_after_discard() {
        let port = sink().await;
        let r = route(port, "127.0.0.1");
        let pool = pool(PoolConfig {
            max_per_destination: 1,
            ..PoolConfig::default()
        });

        let held = pool.acquire(&r).await.unwrap();
        let id = held.id();

        let waiting = {
            let pool = pool.clone();
            let r = r.clone();
            tokio::spawn(async move { pool.acquire(&r).await.map(|c| c.id()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.discard(held);
        let new_id = waiting.await.unwrap().unwrap();
        assert_ne!(new_id, id);
    }

    #[tokio::test]
    async fn global_cap_evicts_other_idle() {
        let a = route(sink().await, "127.0.0.1");
        let b = route(sink().await, "127.0.0.1");
        let pool = pool(PoolConfig {
            max_total: 1,
            ..PoolConfig::default()
        });

        let conn = pool.acquire(&a).await.unwrap();
        pool.release(conn);
        assert_eq!(pool.idle_count(&a), 1);

        let conn = pool.acquire(&b).await.unwrap();
        assert_eq!(pool.idle_count(&a), 0);
        assert_eq!(pool.num_total(), 1);
        pool.release(conn);
    }

    fn tracked_routes(pool: &ConnectionPool) -> usize {
        pool.shared.lock().entries.len()
    }

    #[tokio::test]
    async fn emptied_routes_are_dropped() {
        let a = route(sink().await, "127.0.0.1");
        let b = route(sink().await, "127.0.0.1");
        let c = route(sink().await, "127.0.0.1");
        let pool = pool(PoolConfig {
            max_total: 1,
            idle_timeout: Some(Duration::from_millis(50)),
            ..PoolConfig::default()
        });

        let conn = pool.acquire(&a).await.unwrap();
        pool.release(conn);
        assert_eq!(tracked_routes(&pool), 1);

        let conn = pool.acquire(&b).await.unwrap();
        assert_eq!(tracked_routes(&pool), 1);
        pool.release(conn);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let conn = pool.acquire(&c).await.unwrap();
        assert_eq!(tracked_routes(&pool), 1);
        assert_eq!(pool.size(&b), 0);
        pool.release(conn);
    }

    #[tokio::test]
    async fn idle_timeout_closes_connection() {
        let port = sink().await;
        let r = route(port, "127.0.0.1");
        let pool = pool(PoolConfig {
            idle_timeout: Some(Duration::from_millis(50)),
            ..PoolConfig::default()
        });

        let conn = pool.acquire(&r).await.unwrap();
        let id = conn.id();
        pool.release(conn);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let conn = pool.acquire(&r).await.unwrap();
        assert_ne!(conn.id(), id);
        assert_eq!(pool.num_total(), 1);
    }

    #[tokio::test]
    async fn stale_lease_is_reclaimed() {
        let port = sink().await;
        let r = route(port, "127.0.0.1");
        let pool = pool(PoolConfig {
            max_per_destination: 1,
            stale_busy_threshold: Some(Duration::from_millis(50)),
            ..PoolConfig::default()
        });

        let forgotten = pool.acquire(&r).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let conn = pool.acquire(&r).await.unwrap();
        assert_eq!(pool.busy_count(&r), 1);

        pool.release(forgotten);
        assert_eq!(pool.idle_count(&r), 0);
        assert_eq!(pool.num_total(), 1);

        pool.release(conn);
        assert_eq!(pool.idle_count(&r), 1);
    }

    #[tokio::test]
    async fn shutdown_refuses_and_wakes_waiters() {
        let port = sink().await;
        let r = route(port, "127.0.0.1");
        let pool = pool(PoolConfig {
            max_per_destination: 1,
            ..PoolConfig::default()
        });

        let held = pool.acquire(&r).await.unwrap();
        let waiting = {
            let pool = pool.clone();
            let r = r.clone();
            tokio::spawn(async move { pool.acquire(&r).await.map(|c| c.id()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.shutdown(false);
        assert_eq!(waiting.await.unwrap(), Err(ErrorKind::PoolClosed));
        assert_eq!(pool.acquire(&r).await.err(), Some(ErrorKind::PoolClosed));

        pool.release(held);
        assert_eq!(pool.num_total(), 0);
        assert_eq!(pool.num_idle(), 0);
    }

    #[tokio::test]
    async fn capacity_invariant_under_load() {
        let routes = vec![
            route(sink().await, "127.0.0.1"),
            route(sink().await, "127.0.0.1"),
            route(sink().await, "127.0.0.1"),
        ];
        let config = PoolConfig {
            max_per_destination: 2,
            max_total: 4,
            max_idle_per_destination: 1,
            ..PoolConfig::default()
        };
        let pool = pool(config.clone());

        let mut tasks = Vec::new();
        for i in 0..24 {
            let pool = pool.clone();
            let r = routes[i % routes.len()].clone();
            let routes = routes.clone();
            let config = config.clone();
            tasks.push(tokio::spawn(async move {
                let conn = pool.acquire(&r).await.unwrap();
                for r in &routes {
                    assert!(pool.size(r) <= config.max_per_destination);
                }
                assert!(pool.num_total() <= config.max_total);
                tokio::time::sleep(Duration::from_millis((i % 4) as u64 * 5)).await;
                if i % 3 == 0 {
                    pool.discard(conn);
                } else {
                    pool.release(conn);
                }
                for r in &routes {
                    assert!(pool.size(r) <= config.max_per_destination);
                }
                assert!(pool.num_total() <= config.max_total);
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(pool.num_busy(), 0);
        assert!(pool.num_idle() <= 3);
        assert_eq!(pool.num_total(), pool.num_idle());
    }
}
