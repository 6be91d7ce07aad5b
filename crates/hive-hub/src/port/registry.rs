//! Port leases shared by every agent on the host.
//!
//! Two kinds of lease live here: the control port each agent's shim listens
//! on (handed out by [`PortRegistry::allocate`]) and service ports agents
//! claim for dev servers (`acquire`/`release`). A busy port can be waited
//! on; waiters are served FIFO and a release hands the lease straight to the
//! next waiter.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, TcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};

use hive_core::{ErrorKind, unix_timestamp};

use crate::events::{EventBus, EventKind};

/// Service name recorded on control-port leases.
pub const CONTROL_SERVICE: &str = "agentapi";

#[derive(Debug, Error)]
pub enum PortError {
    #[error("Port {port} is not leased")]
    NotLeased { port: u16 },

    #[error("Port {port} is leased by {holder}, not {requester}")]
    NotOwner {
        port: u16,
        holder: String,
        requester: String,
    },

    #[error("No free control port in {start}..{end}")]
    Exhausted { start: u16, end: u32 },

    #[error("Port {port} is the control port of agent {agent}; stop or destroy the agent instead")]
    ControlPort { port: u16, agent: String },

    #[error("Invalid port: {0}")]
    Invalid(u16),
}

impl PortError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotLeased { .. } => ErrorKind::NotFound,
            Self::NotOwner { .. } | Self::ControlPort { .. } => ErrorKind::Conflict,
            Self::Exhausted { .. } => ErrorKind::Transient,
            Self::Invalid(_) => ErrorKind::Validation,
        }
    }
}

/// A port currently held by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortLease {
    pub port: u16,
    pub agent_id: String,
    pub agent_name: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub leased_at: i64,
}

/// An agent queued for a busy port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortWaiter {
    pub port: u16,
    pub agent_id: String,
    pub agent_name: String,
    pub service: String,
    pub waiting_since: i64,
    /// Seconds; 0 waits forever.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcquireRequest {
    pub port: u16,
    pub agent_id: String,
    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub wait: bool,
    #[serde(default, alias = "timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquireStatus {
    Acquired,
    Busy,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireResponse {
    pub status: AcquireStatus,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<PortLease>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub held_by: Option<PortLease>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Free,
    Leased,
    Waiting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortStatus {
    pub port: u16,
    pub status: PortState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<PortLease>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub waiters: Vec<PortWaiter>,
}

struct WaitEntry {
    id: u64,
    waiter: PortWaiter,
    grant: oneshot::Sender<PortLease>,
}

#[derive(Default)]
struct Inner {
    leases: HashMap<u16, PortLease>,
    waiters: HashMap<u16, VecDeque<WaitEntry>>,
}

pub struct PortRegistry {
    base_port: u16,
    end_port: u32,
    inner: Mutex<Inner>,
    next_waiter: AtomicU64,
    events: EventBus,
}

impl std::fmt::Debug for PortRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortRegistry")
            .field("base_port", &self.base_port)
            .field("end_port", &self.end_port)
            .finish_non_exhaustive()
    }
}

impl PortRegistry {
    /// Control ports are drawn from `[base_port, base_port + range)`.
    pub fn new(base_port: u16, range: u16, events: EventBus) -> Self {
        Self {
            base_port,
            end_port: u32::from(base_port) + u32::from(range),
            inner: Mutex::new(Inner::default()),
            next_waiter: AtomicU64::new(1),
            events,
        }
    }

    /// Lease the first free control port for an agent.
    ///
    /// A port is free when nobody holds a lease on it and a trial bind on
    /// loopback succeeds. The lock is held across the scan so concurrent
    /// callers always receive distinct ports.
    pub async fn allocate(&self, agent_id: &str, agent_name: &str) -> Result<u16, PortError> {
        let mut inner = self.inner.lock().await;
        for candidate in u32::from(self.base_port)..self.end_port {
            let Ok(port) = u16::try_from(candidate) else {
                break;
            };
            if inner.leases.contains_key(&port) || !bindable(port) {
                continue;
            }
            let lease = PortLease {
                port,
                agent_id: agent_id.to_string(),
                agent_name: agent_name.to_string(),
                service: CONTROL_SERVICE.to_string(),
                pid: None,
                leased_at: unix_timestamp(),
            };
            inner.leases.insert(port, lease.clone());
            drop(inner);
            debug!(agent = agent_name, port, "Allocated control port");
            self.emit(EventKind::PortAcquired, &lease);
            return Ok(port);
        }
        Err(PortError::Exhausted {
            start: self.base_port,
            end: self.end_port,
        })
    }

    /// Claim a specific port, optionally queueing until it frees up.
    pub async fn acquire(&self, req: AcquireRequest) -> Result<AcquireResponse, PortError> {
        if req.port == 0 {
            return Err(PortError::Invalid(0));
        }
        let (id, rx, held_by) = {
            let mut inner = self.inner.lock().await;
            match inner.leases.get(&req.port).cloned() {
                None => {
                    let lease = PortLease {
                        port: req.port,
                        agent_id: req.agent_id.clone(),
                        agent_name: req.agent_name.clone(),
                        service: req.service.clone(),
                        pid: None,
                        leased_at: unix_timestamp(),
                    };
                    inner.leases.insert(req.port, lease.clone());
                    drop(inner);
                    self.emit(EventKind::PortAcquired, &lease);
                    return Ok(acquired(lease));
                }
                Some(existing) if !req.wait => {
                    return Ok(AcquireResponse {
                        status: AcquireStatus::Busy,
                        port: req.port,
                        lease: None,
                        message: format!("port {} is held by {}", req.port, existing.agent_name),
                        held_by: Some(existing),
                    });
                }
                Some(existing) => {
                    let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = oneshot::channel();
                    let waiter = PortWaiter {
                        port: req.port,
                        agent_id: req.agent_id.clone(),
                        agent_name: req.agent_name.clone(),
                        service: req.service.clone(),
                        waiting_since: unix_timestamp(),
                        timeout_secs: req.timeout_secs,
                    };
                    inner.waiters.entry(req.port).or_default().push_back(WaitEntry {
                        id,
                        waiter,
                        grant: tx,
                    });
                    (id, rx, existing)
                }
            }
        };

        info!(
            port = req.port,
            agent = %req.agent_name,
            holder = %held_by.agent_name,
            "Waiting for port"
        );
        self.events.publish(
            EventKind::PortWaiting,
            json!({
                "port": req.port,
                "agent_id": req.agent_id,
                "agent_name": req.agent_name,
                "service": req.service,
                "held_by": held_by,
            }),
        );

        let mut rx = rx;
        let timeout = (req.timeout_secs > 0).then(|| Duration::from_secs(req.timeout_secs));
        let granted = match timeout {
            None => rx.await.ok(),
            Some(limit) => {
                tokio::select! {
                    granted = &mut rx => granted.ok(),
                    () = tokio::time::sleep(limit) => {
                        if self.remove_waiter(req.port, id).await {
                            None
                        } else {
                            // Handed the lease just as the timer fired.
                            rx.await.ok()
                        }
                    }
                }
            }
        };

        if let Some(lease) = granted {
            return Ok(acquired(lease));
        }

        self.events.publish(
            EventKind::PortTimeout,
            json!({
                "port": req.port,
                "agent_id": req.agent_id,
                "agent_name": req.agent_name,
            }),
        );
        Ok(AcquireResponse {
            status: AcquireStatus::Timeout,
            port: req.port,
            lease: None,
            held_by: None,
            message: format!("timeout waiting for port {}", req.port),
        })
    }

    /// Release a lease held by `agent_id`.
    pub async fn release(&self, port: u16, agent_id: &str) -> Result<(), PortError> {
        let mut inner = self.inner.lock().await;
        let lease = inner.leases.get(&port).ok_or(PortError::NotLeased { port })?;
        if lease.agent_id != agent_id {
            return Err(PortError::NotOwner {
                port,
                holder: lease.agent_id.clone(),
                requester: agent_id.to_string(),
            });
        }
        refuse_control(lease)?;
        let released = inner.leases.remove(&port);
        let granted = hand_off(&mut inner, port);
        drop(inner);
        self.announce_release(released, granted);
        Ok(())
    }

    /// Drop a service lease regardless of owner, terminating the recorded
    /// process. Control ports are freed only by stopping their agent.
    pub async fn force_release(&self, port: u16) -> Result<PortLease, PortError> {
        let mut inner = self.inner.lock().await;
        refuse_control(inner.leases.get(&port).ok_or(PortError::NotLeased { port })?)?;
        let lease = inner.leases.remove(&port).ok_or(PortError::NotLeased { port })?;
        let granted = hand_off(&mut inner, port);
        drop(inner);

        if let Some(pid) = lease.pid {
            warn!(port, pid, holder = %lease.agent_name, "Force-releasing port, terminating holder");
            #[cfg(unix)]
            if let Err(e) = crate::agent::process::signal_group(pid, libc::SIGTERM) {
                warn!(port, pid, error = %e, "Failed to signal port holder");
            }
        }
        self.announce_release(Some(lease.clone()), granted);
        Ok(lease)
    }

    /// Release every lease held by an agent and drop its pending waits.
    pub async fn release_all_for_agent(&self, agent_id: &str) -> Vec<u16> {
        let mut inner = self.inner.lock().await;
        let mut ports: Vec<u16> = inner
            .leases
            .values()
            .filter(|l| l.agent_id == agent_id)
            .map(|l| l.port)
            .collect();
        ports.sort_unstable();

        let mut announcements = Vec::with_capacity(ports.len());
        for port in &ports {
            let released = inner.leases.remove(port);
            let granted = hand_off(&mut inner, *port);
            announcements.push((released, granted));
        }

        for queue in inner.waiters.values_mut() {
            queue.retain(|entry| entry.waiter.agent_id != agent_id);
        }
        inner.waiters.retain(|_, queue| !queue.is_empty());
        drop(inner);

        for (released, granted) in announcements {
            self.announce_release(released, granted);
        }
        ports
    }

    /// Re-insert a lease recovered from persisted state.
    pub async fn reserve(&self, lease: PortLease) {
        let mut inner = self.inner.lock().await;
        inner.leases.insert(lease.port, lease);
    }

    /// Record the process behind a lease so force-release can stop it.
    pub async fn set_pid(&self, port: u16, pid: u32) -> Result<(), PortError> {
        let mut inner = self.inner.lock().await;
        let lease = inner.leases.get_mut(&port).ok_or(PortError::NotLeased { port })?;
        lease.pid = Some(pid);
        Ok(())
    }

    pub async fn status(&self, port: u16) -> PortStatus {
        let inner = self.inner.lock().await;
        let lease = inner.leases.get(&port).cloned();
        let waiters: Vec<PortWaiter> = inner
            .waiters
            .get(&port)
            .map(|q| q.iter().map(|e| e.waiter.clone()).collect())
            .unwrap_or_default();
        let status = match (&lease, waiters.is_empty()) {
            (Some(_), _) => PortState::Leased,
            (None, false) => PortState::Waiting,
            (None, true) => PortState::Free,
        };
        PortStatus {
            port,
            status,
            lease,
            waiters,
        }
    }

    /// All leases, ordered by port.
    pub async fn leases(&self) -> Vec<PortLease> {
        let inner = self.inner.lock().await;
        let mut leases: Vec<PortLease> = inner.leases.values().cloned().collect();
        leases.sort_by_key(|l| l.port);
        leases
    }

    pub async fn leases_for_agent(&self, agent_id: &str) -> Vec<PortLease> {
        let mut leases = self.leases().await;
        leases.retain(|l| l.agent_id == agent_id);
        leases
    }

    pub async fn waiters(&self) -> Vec<PortWaiter> {
        let inner = self.inner.lock().await;
        let mut waiters: Vec<PortWaiter> = inner
            .waiters
            .values()
            .flat_map(|q| q.iter().map(|e| e.waiter.clone()))
            .collect();
        waiters.sort_by_key(|w| (w.port, w.waiting_since));
        waiters
    }

    pub async fn leased_count(&self) -> usize {
        self.inner.lock().await.leases.len()
    }

    async fn remove_waiter(&self, port: u16, id: u64) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(queue) = inner.waiters.get_mut(&port) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|entry| entry.id != id);
        let removed = queue.len() != before;
        if queue.is_empty() {
            inner.waiters.remove(&port);
        }
        removed
    }

    fn announce_release(&self, released: Option<PortLease>, granted: Option<PortLease>) {
        if let Some(lease) = released {
            debug!(port = lease.port, agent = %lease.agent_name, "Released port");
            self.emit(EventKind::PortReleased, &lease);
        }
        if let Some(lease) = granted {
            info!(port = lease.port, agent = %lease.agent_name, "Port handed to waiter");
            self.emit(EventKind::PortAcquired, &lease);
        }
    }

    fn emit(&self, kind: EventKind, lease: &PortLease) {
        self.events.publish(kind, lease);
    }
}

fn refuse_control(lease: &PortLease) -> Result<(), PortError> {
    if lease.service == CONTROL_SERVICE {
        return Err(PortError::ControlPort {
            port: lease.port,
            agent: lease.agent_name.clone(),
        });
    }
    Ok(())
}

/// Pass a freed port to the first waiter still listening.
fn hand_off(inner: &mut Inner, port: u16) -> Option<PortLease> {
    let queue = inner.waiters.get_mut(&port)?;
    let mut granted = None;
    while let Some(entry) = queue.pop_front() {
        let lease = PortLease {
            port,
            agent_id: entry.waiter.agent_id.clone(),
            agent_name: entry.waiter.agent_name.clone(),
            service: entry.waiter.service.clone(),
            pid: None,
            leased_at: unix_timestamp(),
        };
        if entry.grant.send(lease.clone()).is_ok() {
            granted = Some(lease);
            break;
        }
    }
    if queue.is_empty() {
        inner.waiters.remove(&port);
    }
    if let Some(lease) = &granted {
        inner.leases.insert(port, lease.clone());
    }
    granted
}

fn acquired(lease: PortLease) -> AcquireResponse {
    AcquireResponse {
        status: AcquireStatus::Acquired,
        port: lease.port,
        message: format!("port {} acquired", lease.port),
        lease: Some(lease),
        held_by: None,
    }
}

fn bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
