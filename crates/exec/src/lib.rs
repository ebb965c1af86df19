//! Piceli exec: drives a leveled plan against a live cluster with
//! bounded per-level concurrency, retries, readiness waits, and
//! journal-backed rollback.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use piceli_compare::{decide, Action};
use piceli_core::{K8sObject, ObjectId};
use piceli_plan::Plan;

pub mod journal;
pub mod readiness;
pub mod transport;

pub use journal::{Journal, JournalEntry, RollbackStepFailed};
pub use readiness::Readiness;
pub use transport::{ClusterClient, TransportError};

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_opt_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Executor tuning. Every knob has an env override in the
/// `from_env` constructor; the readiness timeout deliberately has no
/// coded default.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Concurrent applies per level; 0 means unbounded.
    pub parallelism: usize,
    /// Retry budget per object for transient transport errors.
    pub retry_max_attempts: u32,
    /// Cap for the doubling retry backoff.
    pub backoff_max: Duration,
    /// Sleep between readiness probes.
    pub readiness_poll: Duration,
    /// Per-object readiness deadline; `None` polls until the deploy
    /// budget (if any) runs out.
    pub readiness_timeout: Option<Duration>,
    /// Overall deploy budget.
    pub deploy_timeout: Option<Duration>,
    /// How long a replace waits for the old object to disappear.
    pub delete_timeout: Duration,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            parallelism: 0,
            retry_max_attempts: 5,
            backoff_max: Duration::from_secs(30),
            readiness_poll: Duration::from_secs(2),
            readiness_timeout: None,
            deploy_timeout: None,
            delete_timeout: Duration::from_secs(60),
        }
    }
}

impl ExecConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            parallelism: env_u64("PICELI_APPLY_PARALLELISM", defaults.parallelism as u64) as usize,
            retry_max_attempts: env_u64(
                "PICELI_RETRY_MAX_ATTEMPTS",
                defaults.retry_max_attempts as u64,
            ) as u32,
            backoff_max: Duration::from_secs(env_u64(
                "PICELI_BACKOFF_MAX_SECS",
                defaults.backoff_max.as_secs(),
            )),
            readiness_poll: Duration::from_secs(env_u64(
                "PICELI_READINESS_POLL_SECS",
                defaults.readiness_poll.as_secs(),
            )),
            readiness_timeout: env_opt_u64("PICELI_READINESS_TIMEOUT_SECS")
                .map(Duration::from_secs),
            deploy_timeout: env_opt_u64("PICELI_DEPLOY_TIMEOUT_SECS").map(Duration::from_secs),
            delete_timeout: Duration::from_secs(env_u64(
                "PICELI_DELETE_TIMEOUT_SECS",
                defaults.delete_timeout.as_secs(),
            )),
        }
    }
}

/// Deploy-level state machine. Terminal states are `Completed`,
/// `RolledBack`, and `RollbackFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

/// Per-object outcome for reporting.
#[derive(Debug, Clone, Serialize)]
pub enum ObjectResult {
    /// Mutation applied and (where applicable) readiness reached.
    Completed,
    /// Live already matched desired; nothing submitted.
    NoAction,
    Failed(String),
    /// Never started: the level aborted first.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjectOutcome {
    pub id: ObjectId,
    pub verb: String,
    pub attempts: u32,
    pub result: ObjectResult,
}

/// Final result of one deploy invocation.
#[derive(Debug, Serialize)]
pub struct DeployReport {
    pub status: ExecutionStatus,
    pub outcomes: Vec<ObjectOutcome>,
    pub rollback_failures: Vec<String>,
}

impl DeployReport {
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Level-by-level apply engine. Levels are strictly sequential; within
/// a level, objects apply concurrently up to the configured bound.
pub struct Executor {
    client: Arc<dyn ClusterClient>,
    config: ExecConfig,
    journal: Arc<Journal>,
    abort: Arc<AtomicBool>,
    status: Mutex<ExecutionStatus>,
}

impl Executor {
    pub fn new(client: Arc<dyn ClusterClient>, config: ExecConfig) -> Self {
        Self {
            client,
            config,
            journal: Arc::new(Journal::new()),
            abort: Arc::new(AtomicBool::new(false)),
            status: Mutex::new(ExecutionStatus::Pending),
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn status(&self) -> ExecutionStatus {
        *self.status.lock().expect("status lock poisoned")
    }

    /// External cancellation: flips the deploy into the failure path,
    /// which runs the normal rollback.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    fn set_status(&self, status: ExecutionStatus) {
        *self.status.lock().expect("status lock poisoned") = status;
    }

    pub async fn deploy(&self, plan: &Plan) -> DeployReport {
        self.set_status(ExecutionStatus::Running);
        let deadline = self.config.deploy_timeout.map(|budget| Instant::now() + budget);
        let mut outcomes: Vec<ObjectOutcome> = Vec::new();
        let mut failed = false;
        for (index, level) in plan.levels().iter().enumerate() {
            info!(level = index, objects = level.len(), "level starting");
            let t0 = Instant::now();
            let level_outcomes = self.run_level(plan, level, deadline).await;
            histogram!("deploy_level_ms", t0.elapsed().as_secs_f64() * 1000.0);
            let level_failed = level_outcomes
                .iter()
                .any(|o| matches!(o.result, ObjectResult::Failed(_)));
            outcomes.extend(level_outcomes);
            if level_failed || self.abort.load(Ordering::SeqCst) {
                failed = true;
                break;
            }
            info!(level = index, "level completed");
        }

        if !failed {
            self.set_status(ExecutionStatus::Completed);
            return DeployReport {
                status: ExecutionStatus::Completed,
                outcomes,
                rollback_failures: Vec::new(),
            };
        }

        self.set_status(ExecutionStatus::Failed);
        warn!(journal_entries = self.journal.len(), "deployment failed; rolling back");
        self.set_status(ExecutionStatus::RollingBack);
        let failures = self.journal.replay(self.client.as_ref()).await;
        let status = if failures.is_empty() {
            ExecutionStatus::RolledBack
        } else {
            ExecutionStatus::RollbackFailed
        };
        self.set_status(status);
        DeployReport {
            status,
            outcomes,
            rollback_failures: failures.iter().map(|f| f.to_string()).collect(),
        }
    }

    async fn run_level(
        &self,
        plan: &Plan,
        level: &[ObjectId],
        deadline: Option<Instant>,
    ) -> Vec<ObjectOutcome> {
        let permits = if self.config.parallelism == 0 {
            Semaphore::MAX_PERMITS
        } else {
            self.config.parallelism
        };
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut join = JoinSet::new();
        for id in level {
            let desired = match plan.object(id) {
                Some(obj) => obj.clone(),
                None => continue,
            };
            let client = Arc::clone(&self.client);
            let journal = Arc::clone(&self.journal);
            let abort = Arc::clone(&self.abort);
            let config = self.config.clone();
            let semaphore = Arc::clone(&semaphore);
            join.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                if abort.load(Ordering::SeqCst) {
                    return ObjectOutcome {
                        id: desired.id(),
                        verb: "skipped".to_string(),
                        attempts: 0,
                        result: ObjectResult::Skipped,
                    };
                }
                apply_object(client.as_ref(), &journal, &config, &abort, &desired, deadline).await
            });
        }
        let mut outcomes = Vec::new();
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok(outcome) => {
                    if matches!(outcome.result, ObjectResult::Failed(_)) {
                        warn!(id = %outcome.id, "object failed; aborting level");
                        self.abort.store(true, Ordering::SeqCst);
                    }
                    outcomes.push(outcome);
                }
                Err(e) => warn!(error = %e, "apply task aborted"),
            }
        }
        outcomes.sort_by(|a, b| a.id.cmp(&b.id));
        outcomes
    }
}

fn past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, y) => x.or(y),
    }
}

/// Full per-object loop: read-modify-write with retries, then
/// readiness. Transient errors re-read the live object before the next
/// attempt so the decision stays fresh.
async fn apply_object(
    client: &dyn ClusterClient,
    journal: &Journal,
    config: &ExecConfig,
    abort: &AtomicBool,
    desired: &K8sObject,
    deadline: Option<Instant>,
) -> ObjectOutcome {
    let id = desired.id();
    let mut attempts = 0u32;
    let mut backoff = Duration::from_secs(1);
    let mut journaled = false;
    counter!("apply_attempts", 1u64);
    let verb = loop {
        attempts += 1;
        match try_apply(client, journal, config, &id, desired, &mut journaled, deadline).await {
            Ok(verb) => break verb,
            Err(e) if e.is_transient() && attempts < config.retry_max_attempts => {
                counter!("apply_retries_total", 1u64);
                let pause = backoff.min(config.backoff_max);
                debug!(id = %id, attempt = attempts, error = %e, pause_ms = pause.as_millis() as u64, "transient error; backing off");
                tokio::time::sleep(pause).await;
                backoff = (backoff * 2).min(config.backoff_max);
            }
            Err(e) => {
                counter!("apply_errors_total", 1u64);
                return ObjectOutcome {
                    id,
                    verb: "apply".to_string(),
                    attempts,
                    result: ObjectResult::Failed(e.to_string()),
                };
            }
        }
    };

    if verb == "no-action" {
        return ObjectOutcome { id, verb, attempts, result: ObjectResult::NoAction };
    }

    match wait_ready(client, config, abort, &id, deadline).await {
        Ok(()) => {
            info!(id = %id, verb = %verb, attempts, "object completed");
            ObjectOutcome { id, verb, attempts, result: ObjectResult::Completed }
        }
        Err(reason) => {
            counter!("readiness_failures_total", 1u64);
            ObjectOutcome { id, verb, attempts, result: ObjectResult::Failed(reason) }
        }
    }
}

/// One submission attempt: fresh GET, decision, journal pre-image,
/// transport call. The pre-image is journaled once, on the first
/// mutating attempt, so rollback restores the true pre-deploy state.
async fn try_apply(
    client: &dyn ClusterClient,
    journal: &Journal,
    config: &ExecConfig,
    id: &ObjectId,
    desired: &K8sObject,
    journaled: &mut bool,
    deadline: Option<Instant>,
) -> Result<String, TransportError> {
    if past(deadline) {
        return Err(TransportError::Timeout("deploy budget exhausted".to_string()));
    }
    let live = match client.get(id).await {
        Ok(live) => live,
        Err(TransportError::NotFound) => None,
        Err(e) => return Err(e),
    };
    let decision = decide(desired, live.as_ref());
    let verb = decision.action.verb().to_string();
    if !decision.action.is_mutating() {
        debug!(id = %id, "live object already satisfies desired");
        return Ok(verb);
    }
    if !*journaled {
        journal.append(JournalEntry {
            id: id.clone(),
            pre_image: live.clone(),
            action: verb.clone(),
        });
        *journaled = true;
    }
    info!(id = %id, verb = %verb, "submitting");
    match decision.action {
        Action::Create { body, .. } => client.create(id, &body).await?,
        Action::Patch { patch, .. } => client.patch_merge(id, &patch).await?,
        Action::Replace { body, .. } => {
            match client.delete(id).await {
                Ok(()) | Err(TransportError::NotFound) => {}
                Err(e) => return Err(e),
            }
            wait_gone(client, config, id, deadline).await?;
            client.create(id, &body).await?;
        }
        Action::NoAction { .. } => {}
    }
    Ok(verb)
}

/// Poll until the deleted object disappears; a replace cannot create
/// over a body that is still terminating.
async fn wait_gone(
    client: &dyn ClusterClient,
    config: &ExecConfig,
    id: &ObjectId,
    deadline: Option<Instant>,
) -> Result<(), TransportError> {
    let stop = earliest(Some(Instant::now() + config.delete_timeout), deadline);
    loop {
        match client.get(id).await {
            Ok(None) | Err(TransportError::NotFound) => return Ok(()),
            Ok(Some(_)) => {}
            Err(e) if e.is_transient() => {}
            Err(e) => return Err(e),
        }
        if past(stop) {
            return Err(TransportError::Terminal(format!(
                "replace blocked: {} still present after {}s",
                id,
                config.delete_timeout.as_secs()
            )));
        }
        tokio::time::sleep(config.readiness_poll).await;
    }
}

/// Poll the live object until its kind-specific readiness holds.
async fn wait_ready(
    client: &dyn ClusterClient,
    config: &ExecConfig,
    abort: &AtomicBool,
    id: &ObjectId,
    deadline: Option<Instant>,
) -> Result<(), String> {
    if !readiness::has_semantics(&id.kind) {
        // Apply-acknowledged counts as ready.
        return Ok(());
    }
    let stop = earliest(
        config.readiness_timeout.map(|t| Instant::now() + t),
        deadline,
    );
    loop {
        if abort.load(Ordering::SeqCst) {
            return Err("aborted while waiting for readiness".to_string());
        }
        match client.get(id).await {
            Ok(Some(live)) => match readiness::check(&id.kind, &live) {
                Readiness::Ready => return Ok(()),
                Readiness::Failed(reason) => return Err(format!("workload failed: {}", reason)),
                Readiness::Pending(hint) => debug!(id = %id, hint = %hint, "still waiting"),
            },
            Ok(None) => debug!(id = %id, "object not visible yet"),
            Err(e) if e.is_transient() => debug!(id = %id, error = %e, "transient read during readiness"),
            Err(TransportError::NotFound) => debug!(id = %id, "object not visible yet"),
            Err(e) => return Err(e.to_string()),
        }
        if past(stop) {
            return Err(format!("readiness timeout for {}", id));
        }
        tokio::time::sleep(config.readiness_poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_leave_readiness_unbounded() {
        let config = ExecConfig::default();
        assert_eq!(config.parallelism, 0);
        assert_eq!(config.retry_max_attempts, 5);
        assert!(config.readiness_timeout.is_none());
        assert!(config.deploy_timeout.is_none());
    }

    #[test]
    fn earliest_picks_the_sooner_deadline() {
        let now = Instant::now();
        let soon = now + Duration::from_secs(1);
        let later = now + Duration::from_secs(60);
        assert_eq!(earliest(Some(soon), Some(later)), Some(soon));
        assert_eq!(earliest(None, Some(later)), Some(later));
        assert_eq!(earliest(None, None), None);
    }
}
