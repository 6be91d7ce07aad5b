//! Questions raised by agents that need a decision from the Queen.
//!
//! A solicitation stays `Open` until it is answered or dismissed. An agent
//! that blocked on it through [`SolicitationManager::create_and_wait`] is
//! woken with the final record; if its timeout fires first the solicitation
//! becomes `Expired`.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{RwLock, oneshot};
use tracing::{info, warn};

use hive_core::{ErrorKind, short_id, unix_timestamp};

use crate::events::{EventBus, EventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SolicitationKind {
    /// Technical blocker such as a failing dependency.
    Blocker,
    /// Unclear requirements.
    Ambiguity,
    /// A choice between options.
    Decision,
    /// Work needs sign-off before continuing.
    Validation,
    #[default]
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl SolicitationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Blocker => "blocker",
            Self::Ambiguity => "ambiguity",
            Self::Decision => "decision",
            Self::Validation => "validation",
            Self::Info => "info",
        }
    }
}

impl Urgency {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolicitationStatus {
    Open,
    Answered,
    Dismissed,
    Expired,
}

impl SolicitationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Answered => "answered",
            Self::Dismissed => "dismissed",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for SolicitationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SolicitationStatus {
    type Err = SolicitationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" | "pending" => Ok(Self::Open),
            "answered" | "responded" => Ok(Self::Answered),
            "dismissed" => Ok(Self::Dismissed),
            "expired" => Ok(Self::Expired),
            other => Err(SolicitationError::Validation(format!(
                "unknown solicitation status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Solicitation {
    pub id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub kind: SolicitationKind,
    pub urgency: Urgency,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    pub status: SolicitationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateSolicitationRequest {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub agent_name: String,
    #[serde(default, alias = "type")]
    pub kind: SolicitationKind,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(alias = "message")]
    pub question: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Error)]
pub enum SolicitationError {
    #[error("Solicitation not found: {0}")]
    NotFound(String),

    #[error("Invalid solicitation: {0}")]
    Validation(String),

    #[error("Solicitation {id} is already {status}")]
    NotOpen {
        id: String,
        status: SolicitationStatus,
    },
}

impl SolicitationError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Validation(_) | Self::NotOpen { .. } => ErrorKind::Validation,
        }
    }
}

#[derive(Default)]
struct Inner {
    items: HashMap<String, Solicitation>,
    waiters: HashMap<String, oneshot::Sender<Solicitation>>,
}

pub struct SolicitationManager {
    inner: RwLock<Inner>,
    events: EventBus,
}

impl std::fmt::Debug for SolicitationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolicitationManager").finish_non_exhaustive()
    }
}

impl SolicitationManager {
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            events,
        }
    }

    pub async fn create(&self, req: CreateSolicitationRequest) -> Result<Solicitation, SolicitationError> {
        let (sol, _) = self.insert(req, false).await?;
        Ok(sol)
    }

    /// Create a solicitation and block until it leaves `Open`.
    ///
    /// With `timeout` set, an unanswered solicitation is marked `Expired` and
    /// returned in that state.
    pub async fn create_and_wait(
        &self,
        req: CreateSolicitationRequest,
        timeout: Option<Duration>,
    ) -> Result<Solicitation, SolicitationError> {
        let (sol, rx) = self.insert(req, true).await?;
        let Some(mut rx) = rx else {
            return Ok(sol);
        };

        let resolved = match timeout {
            None => (&mut rx).await.ok(),
            Some(limit) => tokio::time::timeout(limit, &mut rx).await.ok().and_then(Result::ok),
        };
        if let Some(done) = resolved {
            return Ok(done);
        }

        match self.expire(&sol.id).await {
            Ok(expired) => Ok(expired),
            // Resolved between the timer firing and the expiry.
            Err(SolicitationError::NotOpen { .. }) => {
                let done = rx.try_recv().ok();
                match done {
                    Some(done) => Ok(done),
                    None => self.get(&sol.id).await,
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Solicitation, SolicitationError> {
        self.inner
            .read()
            .await
            .items
            .get(id)
            .cloned()
            .ok_or_else(|| SolicitationError::NotFound(id.to_string()))
    }

    /// Open solicitations, most urgent first, then oldest first.
    pub async fn list_open(&self) -> Vec<Solicitation> {
        self.list(Some(SolicitationStatus::Open)).await
    }

    pub async fn list(&self, status: Option<SolicitationStatus>) -> Vec<Solicitation> {
        let inner = self.inner.read().await;
        let mut out: Vec<Solicitation> = inner
            .items
            .values()
            .filter(|s| status.is_none_or(|st| s.status == st))
            .cloned()
            .collect();
        drop(inner);
        out.sort_by(|a, b| {
            b.urgency
                .cmp(&a.urgency)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    pub async fn open_count(&self) -> usize {
        self.inner
            .read()
            .await
            .items
            .values()
            .filter(|s| s.status == SolicitationStatus::Open)
            .count()
    }

    /// Open → Answered, waking the creator if it is waiting.
    pub async fn respond(&self, id: &str, answer: impl Into<String>) -> Result<Solicitation, SolicitationError> {
        let answer = answer.into();
        if answer.trim().is_empty() {
            return Err(SolicitationError::Validation("response is required".to_string()));
        }
        let sol = self
            .close(id, SolicitationStatus::Answered, Some(answer))
            .await?;
        info!(solicitation = %sol.id, agent = %sol.agent_name, "Solicitation answered");
        self.events.publish(EventKind::SolicitationResponded, &sol);
        Ok(sol)
    }

    /// Open → Dismissed. `reason`, if any, is recorded as the answer.
    pub async fn dismiss(&self, id: &str, reason: Option<String>) -> Result<Solicitation, SolicitationError> {
        let sol = self
            .close(id, SolicitationStatus::Dismissed, reason.filter(|r| !r.is_empty()))
            .await?;
        info!(solicitation = %sol.id, agent = %sol.agent_name, "Solicitation dismissed");
        self.events.publish(EventKind::SolicitationDismissed, &sol);
        Ok(sol)
    }

    /// Dismiss everything an agent still has open.
    pub async fn dismiss_all_for_agent(&self, agent_id: &str, reason: &str) -> usize {
        let open: Vec<String> = self
            .list_open()
            .await
            .into_iter()
            .filter(|s| s.agent_id == agent_id)
            .map(|s| s.id)
            .collect();
        let mut dismissed = 0;
        for id in open {
            if self.dismiss(&id, Some(reason.to_string())).await.is_ok() {
                dismissed += 1;
            }
        }
        dismissed
    }

    pub async fn restore(&self, items: Vec<Solicitation>) {
        let mut inner = self.inner.write().await;
        for sol in items {
            inner.items.insert(sol.id.clone(), sol);
        }
    }

    async fn expire(&self, id: &str) -> Result<Solicitation, SolicitationError> {
        let sol = self.close(id, SolicitationStatus::Expired, None).await?;
        warn!(solicitation = %sol.id, agent = %sol.agent_name, "Solicitation expired unanswered");
        self.events.publish(EventKind::SolicitationExpired, &sol);
        Ok(sol)
    }

    async fn insert(
        &self,
        req: CreateSolicitationRequest,
        wait: bool,
    ) -> Result<(Solicitation, Option<oneshot::Receiver<Solicitation>>), SolicitationError> {
        if req.agent_id.trim().is_empty() {
            return Err(SolicitationError::Validation("agent_id is required".to_string()));
        }
        let question = req.question.trim();
        if question.is_empty() {
            return Err(SolicitationError::Validation("question is required".to_string()));
        }
        let sol = Solicitation {
            id: short_id(),
            agent_name: if req.agent_name.is_empty() {
                req.agent_id.clone()
            } else {
                req.agent_name
            },
            agent_id: req.agent_id,
            kind: req.kind,
            urgency: req.urgency,
            question: question.to_string(),
            context: req.context.filter(|c| !c.is_empty()),
            options: req.options,
            status: SolicitationStatus::Open,
            answer: None,
            created_at: unix_timestamp(),
            responded_at: None,
        };

        let rx = {
            let mut inner = self.inner.write().await;
            inner.items.insert(sol.id.clone(), sol.clone());
            wait.then(|| {
                let (tx, rx) = oneshot::channel();
                inner.waiters.insert(sol.id.clone(), tx);
                rx
            })
        };

        info!(
            solicitation = %sol.id,
            agent = %sol.agent_name,
            urgency = ?sol.urgency,
            wait,
            "Solicitation raised"
        );
        self.events.publish(EventKind::SolicitationCreated, &sol);
        Ok((sol, rx))
    }

    async fn close(
        &self,
        id: &str,
        status: SolicitationStatus,
        answer: Option<String>,
    ) -> Result<Solicitation, SolicitationError> {
        let mut inner = self.inner.write().await;
        let sol = inner
            .items
            .get_mut(id)
            .ok_or_else(|| SolicitationError::NotFound(id.to_string()))?;
        if sol.status != SolicitationStatus::Open {
            return Err(SolicitationError::NotOpen {
                id: id.to_string(),
                status: sol.status,
            });
        }
        sol.status = status;
        sol.answer = answer;
        sol.responded_at = Some(unix_timestamp());
        let sol = sol.clone();

        if let Some(waiter) = inner.waiters.remove(id) {
            // The waiter may already have given up.
            let _ = waiter.send(sol.clone());
        }
        Ok(sol)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn manager() -> SolicitationManager {
        SolicitationManager::new(EventBus::new(32))
    }

    fn ask(question: &str, urgency: Urgency) -> CreateSolicitationRequest {
        CreateSolicitationRequest {
            agent_id: "a1".to_string(),
            agent_name: "drone-1".to_string(),
            kind: SolicitationKind::Decision,
            urgency,
            question: question.to_string(),
            context: None,
            options: vec!["postgres".into(), "sqlite".into()],
        }
    }

    #[tokio::test]
    async fn respond_moves_open_to_answered() {
        let mgr = manager();
        let sol = mgr.create(ask("Which DB?", Urgency::Medium)).await.unwrap();
        assert_eq!(sol.status, SolicitationStatus::Open);

        let sol = mgr.respond(&sol.id, "postgres").await.unwrap();
        assert_eq!(sol.status, SolicitationStatus::Answered);
        assert_eq!(sol.answer.as_deref(), Some("postgres"));
        assert!(sol.responded_at.is_some());
        assert_eq!(mgr.get(&sol.id).await.unwrap().answer.as_deref(), Some("postgres"));
    }

    #[tokio::test]
    async fn answered_solicitation_cannot_be_answered_again() {
        let mgr = manager();
        let sol = mgr.create(ask("q", Urgency::Low)).await.unwrap();
        mgr.respond(&sol.id, "yes").await.unwrap();

        let err = mgr.respond(&sol.id, "no").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(mgr.dismiss(&sol.id, None).await.is_err());
    }

    #[tokio::test]
    async fn missing_fields_are_rejected() {
        let mgr = manager();
        let mut req = ask("", Urgency::Low);
        assert!(matches!(
            mgr.create(req.clone()).await,
            Err(SolicitationError::Validation(_))
        ));
        req.question = "q".into();
        req.agent_id.clear();
        assert!(mgr.create(req).await.is_err());

        assert!(matches!(
            mgr.respond("nope", "x").await,
            Err(SolicitationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn open_list_orders_by_urgency_then_age() {
        let mgr = manager();
        let low = mgr.create(ask("low", Urgency::Low)).await.unwrap();
        let critical = mgr.create(ask("critical", Urgency::Critical)).await.unwrap();
        let high = mgr.create(ask("high", Urgency::High)).await.unwrap();
        let answered = mgr.create(ask("done", Urgency::Critical)).await.unwrap();
        mgr.respond(&answered.id, "ok").await.unwrap();

        let ids: Vec<String> = mgr.list_open().await.into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![critical.id, high.id, low.id]);
        assert_eq!(mgr.open_count().await, 3);
    }

    #[tokio::test]
    async fn create_and_wait_returns_the_answer() {
        let mgr = Arc::new(manager());
        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move {
                mgr.create_and_wait(ask("Ship it?", Urgency::High), Some(Duration::from_secs(5)))
                    .await
            })
        };

        let id = loop {
            if let Some(s) = mgr.list_open().await.first() {
                break s.id.clone();
            }
            tokio::task::yield_now().await;
        };
        mgr.respond(&id, "ship").await.unwrap();

        let sol = waiter.await.unwrap().unwrap();
        assert_eq!(sol.status, SolicitationStatus::Answered);
        assert_eq!(sol.answer.as_deref(), Some("ship"));
    }

    #[tokio::test]
    async fn create_and_wait_expires_on_timeout() {
        let mgr = manager();
        let sol = mgr
            .create_and_wait(ask("anyone?", Urgency::Low), Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(sol.status, SolicitationStatus::Expired);
        assert!(mgr.list_open().await.is_empty());
    }

    #[tokio::test]
    async fn dismiss_wakes_the_waiter() {
        let mgr = Arc::new(manager());
        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.create_and_wait(ask("q", Urgency::Low), None).await })
        };
        let id = loop {
            if let Some(s) = mgr.list_open().await.first() {
                break s.id.clone();
            }
            tokio::task::yield_now().await;
        };
        mgr.dismiss(&id, Some("not needed".into())).await.unwrap();

        let sol = waiter.await.unwrap().unwrap();
        assert_eq!(sol.status, SolicitationStatus::Dismissed);
    }

    #[test]
    fn request_accepts_legacy_field_names() {
        let req: CreateSolicitationRequest = serde_json::from_str(
            r#"{"agent_id":"a1","type":"blocker","urgency":"critical","message":"npm fails"}"#,
        )
        .unwrap();
        assert_eq!(req.kind, SolicitationKind::Blocker);
        assert_eq!(req.urgency, Urgency::Critical);
        assert_eq!(req.question, "npm fails");
    }
}
