use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use ssh2::Session;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::model::Server;

use super::SshPool;

/// Counter state for one pooled connection. Kept separate from the session
/// handle so the reuse/reap rules stay unit-testable without a live socket.
#[derive(Debug, Clone)]
pub(super) struct EntryState {
    pub ref_count: u32,
    pub channel_count: u32,
    pub last_used: Instant,
    pub alive: bool,
}

impl EntryState {
    pub fn fresh() -> Self {
        Self {
            ref_count: 1,
            channel_count: 1,
            last_used: Instant::now(),
            alive: true,
        }
    }

    /// A connection is reusable while it is alive and still has channel
    /// budget. At the ceiling the entry must be torn down and replaced so a
    /// burst against one host cannot starve the transport's channel limit.
    pub fn can_reuse(&self, ceiling: u32) -> bool {
        self.alive && self.channel_count < ceiling
    }

    pub fn mark_acquired(&mut self) {
        self.ref_count += 1;
        self.channel_count += 1;
        self.last_used = Instant::now();
    }

    /// Floors at zero; an unmatched release must never underflow or error.
    pub fn mark_released(&mut self) -> bool {
        let balanced = self.ref_count > 0;
        self.ref_count = self.ref_count.saturating_sub(1);
        self.channel_count = self.channel_count.saturating_sub(1);
        self.last_used = Instant::now();
        balanced
    }

    pub fn is_reapable(&self, now: Instant, idle_timeout: Duration) -> bool {
        self.ref_count == 0 && now.duration_since(self.last_used) >= idle_timeout
    }
}

pub(super) struct PoolEntry {
    pub session: Arc<Mutex<Session>>,
    pub state: EntryState,
}

/// Handle returned by `acquire`. The caller must pass its key back to
/// `release` exactly once when done with the session.
pub struct PooledConnection {
    pub key: String,
    pub session: Arc<Mutex<Session>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolConnectionStats {
    pub key: String,
    pub ref_count: u32,
    pub channel_count: u32,
    pub idle_ms: u64,
    pub alive: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_connections: usize,
    pub connections: Vec<PoolConnectionStats>,
}

pub(super) fn lock_unpoisoned<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("recovering transport pool state from poisoned lock");
            poisoned.into_inner()
        }
    }
}

fn disconnect_quietly(session: &Arc<Mutex<Session>>) {
    let session = lock_unpoisoned(session);
    session
        .disconnect(None, "connection recycled by pool", None)
        .ok();
}

impl SshPool {
    pub(super) fn entries_lock(&self) -> MutexGuard<'_, HashMap<String, PoolEntry>> {
        lock_unpoisoned(&self.entries)
    }

    /// Borrow a pooled connection for one command channel. Reuses a live
    /// entry with channel budget left; recycles the entry when the budget is
    /// spent; connects fresh otherwise. A failed connect never leaves a
    /// half-initialized entry in the map.
    pub fn acquire(&self, server: &Server) -> Result<PooledConnection> {
        let key = server.pool_key();

        {
            let mut entries = self.entries_lock();
            if let Some(entry) = entries.get_mut(&key) {
                if entry.state.can_reuse(self.channel_ceiling) {
                    entry.state.mark_acquired();
                    return Ok(PooledConnection {
                        key,
                        session: entry.session.clone(),
                    });
                }
                // Channel budget spent or connection dead: tear down and
                // reconnect below.
                if let Some(stale) = entries.remove(&key) {
                    disconnect_quietly(&stale.session);
                }
            }
        }

        // Connect outside the critical section; a slow handshake must not
        // stall unrelated hosts.
        let session = self.connect(server)?;
        let session = Arc::new(Mutex::new(session));

        let mut entries = self.entries_lock();
        match entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                // A concurrent acquire for the same key won the race. Prefer
                // its entry when usable so we do not multiply connections
                // needlessly.
                if occupied.get().state.can_reuse(self.channel_ceiling) {
                    occupied.get_mut().state.mark_acquired();
                    disconnect_quietly(&session);
                    Ok(PooledConnection {
                        key,
                        session: occupied.get().session.clone(),
                    })
                } else {
                    let stale = std::mem::replace(
                        occupied.get_mut(),
                        PoolEntry {
                            session: session.clone(),
                            state: EntryState::fresh(),
                        },
                    );
                    disconnect_quietly(&stale.session);
                    Ok(PooledConnection { key, session })
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PoolEntry {
                    session: session.clone(),
                    state: EntryState::fresh(),
                });
                Ok(PooledConnection { key, session })
            }
        }
    }

    /// Return a borrowed connection. Never closes the session (the reaper
    /// does that) and never errors, even on an unmatched release.
    pub fn release(&self, key: &str) {
        let mut entries = self.entries_lock();
        match entries.get_mut(key) {
            Some(entry) => {
                if !entry.state.mark_released() {
                    tracing::warn!(key, "release without matching acquire");
                }
            }
            None => tracing::warn!(key, "release for unknown pool entry"),
        }
    }

    /// Close and evict one entry regardless of refcounts. Used when the
    /// owning server record is deleted or a transport error poisons the
    /// connection.
    pub fn force_close(&self, key: &str) {
        let removed = {
            let mut entries = self.entries_lock();
            entries.remove(key)
        };
        if let Some(entry) = removed {
            disconnect_quietly(&entry.session);
        }
    }

    pub fn close_all(&self) {
        let drained: Vec<PoolEntry> = {
            let mut entries = self.entries_lock();
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            disconnect_quietly(&entry.session);
        }
    }

    /// One reaper pass: close entries with no borrowers that have idled past
    /// the timeout. Active entries are never touched. Returns the number of
    /// connections closed.
    pub fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<PoolEntry> = {
            let mut entries = self.entries_lock();
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.state.is_reapable(now, self.idle_timeout))
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| entries.remove(&key))
                .collect()
        };
        let closed = expired.len();
        for entry in &expired {
            disconnect_quietly(&entry.session);
        }
        if closed > 0 {
            tracing::debug!(closed, "reaped idle ssh connections");
        }
        closed
    }

    /// Periodic reaper, stopped via the cancellation token. Session teardown
    /// is blocking I/O, so each pass runs on the blocking thread pool.
    pub fn spawn_reaper(&self, cancel: CancellationToken) {
        let pool = self.clone();
        let interval = self.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let pool = pool.clone();
                        let _ = tokio::task::spawn_blocking(move || pool.reap_idle()).await;
                    }
                }
            }
        });
    }

    pub fn stats(&self) -> PoolStats {
        let entries = self.entries_lock();
        let now = Instant::now();
        let mut connections: Vec<PoolConnectionStats> = entries
            .iter()
            .map(|(key, entry)| PoolConnectionStats {
                key: key.clone(),
                ref_count: entry.state.ref_count,
                channel_count: entry.state.channel_count,
                idle_ms: now.duration_since(entry.state.last_used).as_millis() as u64,
                alive: entry.state.alive,
            })
            .collect();
        connections.sort_by(|a, b| a.key.cmp(&b.key));
        PoolStats {
            total_connections: connections.len(),
            connections,
        }
    }

    fn connect(&self, server: &Server) -> Result<Session> {
        let address = server.address();
        let addr = address
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve {address}"))?
            .next()
            .ok_or_else(|| anyhow!("no address resolved for {address}"))?;
        let tcp = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .with_context(|| format!("failed to open TCP connection to {address}"))?;
        tcp.set_read_timeout(Some(Duration::from_secs(20))).ok();
        tcp.set_write_timeout(Some(Duration::from_secs(20))).ok();

        let mut session = Session::new().context("failed to create SSH session")?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .with_context(|| format!("SSH handshake with {address} failed"))?;
        session
            .userauth_pubkey_file(&server.username, None, &server.private_key_path, None)
            .with_context(|| {
                format!(
                    "SSH key authentication failed for {} (key {})",
                    server.pool_key(),
                    server.private_key_path.display()
                )
            })?;
        if !session.authenticated() {
            return Err(anyhow!(
                "SSH authentication failed for {}",
                server.pool_key()
            ));
        }
        Ok(session)
    }
}
