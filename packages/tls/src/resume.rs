//! Hostname-keyed TLS session cache backing session resumption
//!
//! Implements the backend's client session store seam so that negotiated
//! sessions survive across connections. Entries carry a fixed 18-hour
//! lifetime; stale entries are dropped on access. A failed lookup simply
//! forces a full handshake.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use rustls::NamedGroup;
use rustls::client::{ClientSessionStore, Tls12ClientSessionValue, Tls13ClientSessionValue};
use rustls::pki_types::ServerName;

const SESSION_TTL: Duration = Duration::from_secs(18 * 3600);
const MAX_TICKETS_PER_HOST: usize = 8;

struct Deposit<T> {
    value: T,
    stored_at: SystemTime,
}

impl<T> Deposit<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            stored_at: SystemTime::now(),
        }
    }

    fn fresh(&self, ttl: Duration) -> bool {
        SystemTime::now()
            .duration_since(self.stored_at)
            .map(|age| age < ttl)
            .unwrap_or(true)
    }
}

#[derive(Default)]
struct HostSessions {
    kx_hint: Option<NamedGroup>,
    tls12: Option<Deposit<Tls12ClientSessionValue>>,
    tls13: VecDeque<Deposit<Tls13ClientSessionValue>>,
}

/// Session store shared between the application and one or more engines.
pub struct SessionCache {
    ttl: Duration,
    hosts: DashMap<String, HostSessions>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::with_ttl(SESSION_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            hosts: DashMap::new(),
        }
    }

    /// Whether any live session data exists for the host.
    pub fn contains(&self, host: &str) -> bool {
        self.hosts
            .get(&host.to_ascii_lowercase())
            .map(|sessions| {
                sessions
                    .tls12
                    .as_ref()
                    .map(|entry| entry.fresh(self.ttl))
                    .unwrap_or(false)
                    || sessions.tls13.iter().any(|entry| entry.fresh(self.ttl))
            })
            .unwrap_or(false)
    }

    /// Drops everything stored for the host.
    pub fn forget(&self, host: &str) {
        self.hosts.remove(&host.to_ascii_lowercase());
    }

    fn key(server_name: &ServerName<'_>) -> String {
        match server_name {
            ServerName::DnsName(dns) => dns.as_ref().to_ascii_lowercase(),
            ServerName::IpAddress(addr) => std::net::IpAddr::from(*addr).to_string(),
            other => format!("{other:?}"),
        }
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCache")
            .field("hosts", &self.hosts.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl ClientSessionStore for SessionCache {
    fn set_kx_hint(&self, server_name: ServerName<'static>, group: NamedGroup) {
        self.hosts
            .entry(Self::key(&server_name))
            .or_default()
            .kx_hint = Some(group);
    }

    fn kx_hint(&self, server_name: &ServerName<'_>) -> Option<NamedGroup> {
        self.hosts
            .get(&Self::key(server_name))
            .and_then(|sessions| sessions.kx_hint)
    }

    fn set_tls12_session(&self, server_name: ServerName<'static>, value: Tls12ClientSessionValue) {
        self.hosts
            .entry(Self::key(&server_name))
            .or_default()
            .tls12 = Some(Deposit::new(value));
    }

    fn tls12_session(&self, server_name: &ServerName<'_>) -> Option<Tls12ClientSessionValue> {
        let sessions = self.hosts.get(&Self::key(server_name))?;
        let deposit = sessions.tls12.as_ref()?;
        if !deposit.fresh(self.ttl) {
            return None;
        }
        Some(deposit.value.clone())
    }

    fn remove_tls12_session(&self, server_name: &ServerName<'_>) {
        if let Some(mut sessions) = self.hosts.get_mut(&Self::key(server_name)) {
            sessions.tls12 = None;
        }
    }

    fn insert_tls13_ticket(&self, server_name: ServerName<'static>, value: Tls13ClientSessionValue) {
        let mut sessions = self.hosts.entry(Self::key(&server_name)).or_default();
        if sessions.tls13.len() >= MAX_TICKETS_PER_HOST {
            sessions.tls13.pop_front();
        }
        sessions.tls13.push_back(Deposit::new(value));
    }

    fn take_tls13_ticket(&self, server_name: &ServerName<'_>) -> Option<Tls13ClientSessionValue> {
        let mut sessions = self.hosts.get_mut(&Self::key(server_name))?;
        while let Some(deposit) = sessions.tls13.pop_front() {
            if deposit.fresh(self.ttl) {
                return Some(deposit.value);
            }
        }
        None
    }
}
