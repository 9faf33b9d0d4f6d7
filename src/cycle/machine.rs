//! Cycle State Machine
//!
//! Sequences one cognitive cycle: curate -> plan -> propose -> approve ->
//! apply -> reflect. Every state-mutating step is gated behind either the
//! autonomous-context policy (the single permitted bypass) or an
//! explicit decision through the approval broker. Goals queue; cycles
//! never interleave.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::changeset::{to_bundle, validate_change_set};
use crate::dispatch::DispatchEngine;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::store::ArtifactStore;
use crate::types::{
    AppliedChange, ApprovalOutcome, ApprovalStatus, CycleContext, CycleOutcome, CyclePolicy,
    CycleState, Goal, ProposedChangeSet, ReasoningClient, ToolError, ToolInvocation,
};

use super::approvals::ApprovalBroker;

/// Bounded count of reflected outcomes kept on the runner.
const OUTCOME_HISTORY_CAPACITY: usize = 32;

/// Fired on every state transition; the seam for whatever surface
/// renders progress.
pub type StateChangeCallback = Box<dyn Fn(CycleState) + Send + Sync>;

pub struct CycleRunner {
    engine: Arc<DispatchEngine>,
    store: Arc<Mutex<ArtifactStore>>,
    approvals: ApprovalBroker,
    reasoning: Arc<dyn ReasoningClient>,
    policy: CyclePolicy,
    state: CycleState,
    queue: VecDeque<Goal>,
    history: VecDeque<CycleOutcome>,
    halted: bool,
    cancel_requested: Arc<AtomicBool>,
    on_state_change: Option<StateChangeCallback>,
}

impl CycleRunner {
    pub fn new(
        engine: Arc<DispatchEngine>,
        store: Arc<Mutex<ArtifactStore>>,
        approvals: ApprovalBroker,
        reasoning: Arc<dyn ReasoningClient>,
        policy: CyclePolicy,
    ) -> Self {
        Self {
            engine,
            store,
            approvals,
            reasoning,
            policy,
            state: CycleState::Idle,
            queue: VecDeque::new(),
            history: VecDeque::new(),
            halted: false,
            cancel_requested: Arc::new(AtomicBool::new(false)),
            on_state_change: None,
        }
    }

    pub fn set_on_state_change(&mut self, callback: StateChangeCallback) {
        self.on_state_change = Some(callback);
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn history(&self) -> Vec<CycleOutcome> {
        self.history.iter().cloned().collect()
    }

    /// Shared flag for user-initiated cancellation; checked at state
    /// boundaries and between changes.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_requested)
    }

    /// Clear the halted latch after an operator has reviewed the cause.
    pub fn reset(&mut self) {
        self.halted = false;
        self.state = CycleState::Idle;
    }

    // ---- Goal Intake -------------------------------------------------------

    /// Queue a goal. Goals submitted while a cycle is in flight wait
    /// their turn; a full queue or a halted runner rejects the goal.
    pub fn submit_goal(&mut self, goal: Goal) -> CoreResult<usize> {
        if self.halted {
            return Err(CoreError::Rejected(
                "runner halted by run-limit guard or integrity failure; reset required".to_string(),
            ));
        }
        if self.queue.len() >= self.policy.max_queued_goals {
            return Err(CoreError::Rejected(format!(
                "goal queue full ({} pending)",
                self.queue.len()
            )));
        }
        self.queue.push_back(goal);
        Ok(self.queue.len())
    }

    /// Run one goal immediately. Fails if a cycle is already in flight.
    pub async fn run_goal(&mut self, goal: Goal) -> CoreResult<CycleOutcome> {
        if self.halted {
            return Err(CoreError::Rejected(
                "runner halted; reset required".to_string(),
            ));
        }
        if self.state != CycleState::Idle {
            return Err(CoreError::Rejected(format!(
                "cycle in flight (state {:?})",
                self.state
            )));
        }
        Ok(self.run_cycle(goal).await)
    }

    /// Drain the goal queue, one full cycle at a time.
    pub async fn run_pending(&mut self) -> Vec<CycleOutcome> {
        let mut outcomes = Vec::new();
        while !self.halted {
            let Some(goal) = self.queue.pop_front() else {
                break;
            };
            outcomes.push(self.run_cycle(goal).await);
        }
        outcomes
    }

    // ---- The Cycle ---------------------------------------------------------

    async fn run_cycle(&mut self, goal: Goal) -> CycleOutcome {
        let start = Instant::now();
        let mut ctx = CycleContext::new(goal);
        info!(goal = %ctx.goal.id, "cycle started: {}", ctx.goal.description);

        // Curation is read-only: nothing here mutates artifacts, so
        // there is nothing to roll back if the plan later goes bad.
        self.set_state(CycleState::CuratingContext);
        match self.curate(&ctx.goal) {
            Ok(paths) => ctx.curated_paths = paths,
            Err(err) => return self.reflect(ctx, start, Some(as_tool_error(err)), false, None),
        }

        if self.policy.autonomous_context {
            // The only transition permitted to bypass human approval.
            self.set_state(CycleState::Planning);
        } else {
            self.set_state(CycleState::AwaitingContextApproval);
            let payload = json!({
                "goalId": ctx.goal.id,
                "goal": ctx.goal.description,
                "curatedPaths": ctx.curated_paths,
            });
            match self
                .approvals
                .request(
                    "cycle:context",
                    "approve_context",
                    payload,
                    self.policy.approval_timeout_ms,
                )
                .await
            {
                ApprovalOutcome::Approved(_) => self.set_state(CycleState::Planning),
                ApprovalOutcome::Rejected(feedback) => {
                    let failure = rejection(feedback.unwrap_or_else(|| "context rejected".into()));
                    return self.reflect(ctx, start, Some(failure), false, None);
                }
                ApprovalOutcome::TimedOut => {
                    let failure = rejection("context approval timed out".into());
                    return self.reflect(ctx, start, Some(failure), false, None);
                }
            }
        }

        // Plan -> propose -> approve, bounded by the run-limit guard.
        let mut iterations: u32 = 0;
        let mut revision_feedback: Option<String> = None;
        let approved: ProposedChangeSet = loop {
            if self.cancel_pending() {
                return self.cancel_cycle(ctx, start).await;
            }

            iterations += 1;
            if iterations > self.policy.max_iterations_per_goal {
                self.halted = true;
                warn!(
                    goal = %ctx.goal.id,
                    limit = self.policy.max_iterations_per_goal,
                    "run-limit guard tripped; runner halted pending explicit restart"
                );
                let failure = ToolError {
                    kind: ErrorKind::ExecutionFailed,
                    message: format!(
                        "run limit reached after {} iterations",
                        self.policy.max_iterations_per_goal
                    ),
                    checkpoint_id: None,
                };
                return self.reflect(ctx, start, Some(failure), false, None);
            }
            if iterations > 1 {
                self.set_state(CycleState::Planning);
            }

            self.set_state(CycleState::GeneratingProposal);
            let snapshot = {
                let store = self.store.lock().expect("artifact store lock");
                let selection: Vec<&str> = ctx.curated_paths.iter().map(String::as_str).collect();
                match store.snapshot(Some(&selection)) {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        drop(store);
                        return self.reflect(ctx, start, Some(as_tool_error(err)), false, None);
                    }
                }
            };

            let mut prompt_goal = ctx.goal.clone();
            if let Some(ref feedback) = revision_feedback {
                prompt_goal.description =
                    format!("{}\n\nReviewer feedback: {}", prompt_goal.description, feedback);
            }

            let raw = match self
                .reasoning
                .propose_change_set(&prompt_goal, &snapshot)
                .await
            {
                Ok(raw) => raw,
                Err(err) => {
                    let failure = ToolError {
                        kind: ErrorKind::ExecutionFailed,
                        message: format!("reasoning collaborator failed: {err}"),
                        checkpoint_id: None,
                    };
                    return self.reflect(ctx, start, Some(failure), false, None);
                }
            };

            // Untrusted output: the schema gate runs before anything else.
            let set = match validate_change_set(&raw) {
                Ok(set) => set,
                Err(err) => return self.reflect(ctx, start, Some(as_tool_error(err)), false, None),
            };
            ctx.proposed = Some(set.clone());

            // Hard invariant: this state never auto-advances. The only
            // exits are an explicit decision or the timeout-as-rejection
            // path back to idle; policy flags play no part here.
            self.set_state(CycleState::AwaitingProposalApproval);
            let payload = json!({
                "goalId": ctx.goal.id,
                "confidence": set.confidence,
                "changes": to_bundle(&set),
            });
            match self
                .approvals
                .request(
                    "cycle:proposal",
                    "apply_change_set",
                    payload,
                    self.policy.approval_timeout_ms,
                )
                .await
            {
                ApprovalOutcome::Approved(_) => {
                    ctx.approval_status = ApprovalStatus::Approved;
                    break set;
                }
                ApprovalOutcome::Rejected(Some(feedback)) => {
                    ctx.approval_status = ApprovalStatus::Rejected;
                    debug!(goal = %ctx.goal.id, "proposal rejected for revision: {feedback}");
                    revision_feedback = Some(feedback);
                    continue;
                }
                ApprovalOutcome::Rejected(None) => {
                    ctx.approval_status = ApprovalStatus::Rejected;
                    return self.reflect(ctx, start, Some(rejection("proposal rejected".into())), false, None);
                }
                ApprovalOutcome::TimedOut => {
                    ctx.approval_status = ApprovalStatus::TimedOut;
                    let failure = rejection("proposal approval timed out".into());
                    return self.reflect(ctx, start, Some(failure), false, None);
                }
            }
        };

        // Apply the approved set, one change at a time, through the
        // dispatch engine. A failure aborts the remainder; whatever was
        // already applied is reported, never hidden.
        self.set_state(CycleState::ApplyingChangeset);
        let confidence = approved.confidence;

        let cycle_checkpoint = {
            let mut store = self.store.lock().expect("artifact store lock");
            store.create_checkpoint(&format!("cycle:{}", ctx.goal.id))
        };
        match cycle_checkpoint {
            Ok(checkpoint) => ctx.last_checkpoint_id = Some(checkpoint.id),
            Err(err) => return self.reflect(ctx, start, Some(as_tool_error(err)), false, confidence),
        }

        let mut failure: Option<ToolError> = None;
        for change in &approved.changes {
            if self.cancel_pending() {
                return self.cancel_cycle(ctx, start).await;
            }

            let args = match serde_json::to_value(change) {
                Ok(args) => args,
                Err(err) => {
                    failure = Some(as_tool_error(err.into()));
                    break;
                }
            };
            let result = self
                .engine
                .dispatch(ToolInvocation::new("apply_change", args))
                .await;

            if result.success {
                let version = result
                    .data
                    .as_ref()
                    .and_then(|data| data.get("version"))
                    .and_then(|v| v.as_u64());
                ctx.applied_changes.push(AppliedChange {
                    op: change.op,
                    path: change.path.clone(),
                    version,
                    checkpoint_id: result.checkpoint_id,
                });
            } else {
                let err = result.error.unwrap_or(ToolError {
                    kind: ErrorKind::ExecutionFailed,
                    message: "dispatch failed without detail".to_string(),
                    checkpoint_id: result.checkpoint_id,
                });
                if err.kind == ErrorKind::Integrity {
                    // The durability guarantee itself is broken; stop
                    // driving autonomous cycles.
                    self.halted = true;
                    error!(goal = %ctx.goal.id, "integrity failure, halting: {}", err.message);
                }
                failure = Some(err);
                break;
            }
        }

        self.reflect(ctx, start, failure, false, confidence)
    }

    // ---- Steps -------------------------------------------------------------

    /// Read-only context curation: select live paths under the goal's
    /// prefixes (all paths when none are given).
    fn curate(&self, goal: &Goal) -> CoreResult<Vec<String>> {
        let store = self.store.lock().expect("artifact store lock");
        let mut paths = store.list_paths()?;
        if !goal.context_paths.is_empty() {
            paths.retain(|p| goal.context_paths.iter().any(|prefix| p.starts_with(prefix)));
        }
        Ok(paths)
    }

    fn cancel_pending(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Cancellation path: roll back the cycle checkpoint if one is
    /// open, then reflect as cancelled and return to idle.
    async fn cancel_cycle(&mut self, ctx: CycleContext, start: Instant) -> CycleOutcome {
        self.cancel_requested.store(false, Ordering::SeqCst);
        info!(goal = %ctx.goal.id, "cycle cancelled by user");

        if let Some(ref checkpoint_id) = ctx.last_checkpoint_id {
            let rolled_back = {
                let mut store = self.store.lock().expect("artifact store lock");
                store.rollback(checkpoint_id)
            };
            match rolled_back {
                Ok(applied) => debug!(checkpoint = %checkpoint_id, applied, "cancelled cycle rolled back"),
                Err(CoreError::Integrity(detail)) => {
                    self.halted = true;
                    error!("integrity failure during cancellation rollback: {detail}");
                }
                Err(other) => error!("cancellation rollback failed: {other}"),
            }
        }

        self.reflect(ctx, start, None, true, None)
    }

    /// Record the cycle outcome and return to idle. The context itself
    /// is dropped here; the outcome is its archive.
    fn reflect(
        &mut self,
        ctx: CycleContext,
        start: Instant,
        failure: Option<ToolError>,
        cancelled: bool,
        confidence: Option<f64>,
    ) -> CycleOutcome {
        self.set_state(CycleState::Reflecting);

        let outcome = CycleOutcome {
            goal_id: ctx.goal.id.clone(),
            success: failure.is_none() && !cancelled,
            cancelled,
            applied: ctx.applied_changes.clone(),
            failure,
            duration_ms: start.elapsed().as_millis() as u64,
            confidence,
            finished_at: Utc::now().to_rfc3339(),
        };

        info!(
            goal = %outcome.goal_id,
            success = outcome.success,
            cancelled = outcome.cancelled,
            applied = outcome.applied.len(),
            duration_ms = outcome.duration_ms,
            "cycle reflected"
        );

        if self.history.len() == OUTCOME_HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(outcome.clone());

        self.set_state(CycleState::Idle);
        outcome
    }

    fn set_state(&mut self, state: CycleState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "cycle transition");
        }
        self.state = state;
        if let Some(ref callback) = self.on_state_change {
            callback(state);
        }
    }
}

fn as_tool_error(err: CoreError) -> ToolError {
    ToolError {
        kind: err.kind(),
        message: err.to_string(),
        checkpoint_id: None,
    }
}

fn rejection(message: String) -> ToolError {
    ToolError {
        kind: ErrorKind::Rejected,
        message,
        checkpoint_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxRunner;
    use crate::types::{ApprovalDecision, ApprovalRequest, StoreSnapshot};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    /// Returns scripted proposals in order; counts how often it is asked.
    struct ScriptedReasoner {
        proposals: Mutex<VecDeque<Value>>,
        calls: AtomicUsize,
    }

    impl ScriptedReasoner {
        fn new(proposals: Vec<Value>) -> Arc<Self> {
            Arc::new(Self {
                proposals: Mutex::new(proposals.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReasoningClient for ScriptedReasoner {
        async fn propose_change_set(
            &self,
            _goal: &Goal,
            _context: &StoreSnapshot,
        ) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.proposals
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("no scripted proposal left"))
        }
    }

    fn spawn_responder<F>(
        broker: ApprovalBroker,
        mut rx: mpsc::UnboundedReceiver<ApprovalRequest>,
        decide: F,
    ) where
        F: Fn(&ApprovalRequest) -> Option<ApprovalDecision> + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                if let Some(decision) = decide(&request) {
                    let _ = broker.resolve(&request.id, decision);
                }
            }
        });
    }

    fn build_runner<F>(
        policy: CyclePolicy,
        reasoner: Arc<ScriptedReasoner>,
        decide: F,
    ) -> (CycleRunner, Arc<Mutex<ArtifactStore>>, ApprovalBroker)
    where
        F: Fn(&ApprovalRequest) -> Option<ApprovalDecision> + Send + Sync + 'static,
    {
        let store = Arc::new(Mutex::new(ArtifactStore::open_in_memory().unwrap()));
        let sandbox = Arc::new(SandboxRunner::new(1_000));
        let (broker, rx) = ApprovalBroker::new(32);
        spawn_responder(broker.clone(), rx, decide);
        let engine = Arc::new(DispatchEngine::new(
            Arc::clone(&store),
            sandbox,
            broker.clone(),
            policy.approval_timeout_ms,
        ));
        let runner = CycleRunner::new(
            engine,
            Arc::clone(&store),
            broker.clone(),
            reasoner,
            policy,
        );
        (runner, store, broker)
    }

    fn create_proposal(path: &str, content: &str) -> Value {
        json!({
            "changes": [{
                "op": "CREATE",
                "path": path,
                "content": content,
                "reason": "scripted test change"
            }],
            "confidence": 0.9
        })
    }

    fn approve_all(_: &ApprovalRequest) -> Option<ApprovalDecision> {
        Some(ApprovalDecision::Approve { data: None })
    }

    #[tokio::test]
    async fn test_full_cycle_applies_approved_proposal() {
        let reasoner = ScriptedReasoner::new(vec![create_proposal("/src/hello.txt", "hi")]);
        let policy = CyclePolicy {
            autonomous_context: true,
            approval_timeout_ms: Some(1_000),
            ..Default::default()
        };
        let (mut runner, store, _broker) = build_runner(policy, Arc::clone(&reasoner), approve_all);

        let states: Arc<Mutex<Vec<CycleState>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&states);
        runner.set_on_state_change(Box::new(move |state| seen.lock().unwrap().push(state)));

        let outcome = runner.run_goal(Goal::new("add greeting")).await.unwrap();

        assert!(outcome.success, "{outcome:?}");
        assert_eq!(outcome.applied.len(), 1);
        assert_eq!(outcome.confidence, Some(0.9));
        assert_eq!(
            store.lock().unwrap().read("/src/hello.txt").unwrap().content,
            b"hi"
        );

        let states = states.lock().unwrap();
        assert!(states.contains(&CycleState::AwaitingProposalApproval));
        assert!(!states.contains(&CycleState::AwaitingContextApproval)); // autonomous bypass
        assert_eq!(*states.last().unwrap(), CycleState::Idle);
    }

    #[tokio::test]
    async fn test_proposal_approval_never_auto_advances() {
        // Maximal autonomy plus a deaf approval surface: the proposal
        // gate must still hold until its timeout resolves to rejection.
        let reasoner = ScriptedReasoner::new(vec![create_proposal("/src/hello.txt", "hi")]);
        let policy = CyclePolicy {
            autonomous_context: true,
            approval_timeout_ms: Some(50),
            ..Default::default()
        };
        let (mut runner, store, broker) = build_runner(policy, reasoner, |_| None);

        let outcome = runner.run_goal(Goal::new("add greeting")).await.unwrap();

        assert!(!outcome.success);
        assert!(outcome.applied.is_empty());
        assert_eq!(outcome.failure.unwrap().kind, ErrorKind::Rejected);
        assert!(store.lock().unwrap().read("/src/hello.txt").is_err());
        assert_eq!(broker.stats().timed_out, 1);
        assert_eq!(runner.state(), CycleState::Idle);
    }

    #[tokio::test]
    async fn test_context_gate_blocks_before_reasoning() {
        let reasoner = ScriptedReasoner::new(vec![create_proposal("/a.txt", "x")]);
        let policy = CyclePolicy {
            autonomous_context: false,
            approval_timeout_ms: Some(1_000),
            ..Default::default()
        };
        let (mut runner, _store, _broker) =
            build_runner(policy, Arc::clone(&reasoner), |request| {
                if request.capability == "cycle:context" {
                    Some(ApprovalDecision::Reject { feedback: None })
                } else {
                    Some(ApprovalDecision::Approve { data: None })
                }
            });

        let outcome = runner.run_goal(Goal::new("blocked at context")).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.failure.unwrap().kind, ErrorKind::Rejected);
        assert_eq!(reasoner.calls(), 0);
    }

    #[tokio::test]
    async fn test_rejection_with_feedback_revises_proposal() {
        let reasoner = ScriptedReasoner::new(vec![
            create_proposal("/a.txt", "draft"),
            create_proposal("/a.txt", "final"),
        ]);
        let policy = CyclePolicy {
            autonomous_context: true,
            approval_timeout_ms: Some(1_000),
            ..Default::default()
        };
        let rejected_once = AtomicUsize::new(0);
        let (mut runner, store, _broker) =
            build_runner(policy, Arc::clone(&reasoner), move |request| {
                if request.capability == "cycle:proposal"
                    && rejected_once.fetch_add(1, Ordering::SeqCst) == 0
                {
                    Some(ApprovalDecision::Reject {
                        feedback: Some("tighten the wording".to_string()),
                    })
                } else {
                    Some(ApprovalDecision::Approve { data: None })
                }
            });

        let outcome = runner.run_goal(Goal::new("revise until approved")).await.unwrap();

        assert!(outcome.success, "{outcome:?}");
        assert_eq!(reasoner.calls(), 2);
        assert_eq!(store.lock().unwrap().read("/a.txt").unwrap().content, b"final");
    }

    #[tokio::test]
    async fn test_run_limit_guard_halts_runner() {
        let reasoner = ScriptedReasoner::new(vec![
            create_proposal("/a.txt", "1"),
            create_proposal("/a.txt", "2"),
            create_proposal("/a.txt", "3"),
        ]);
        let policy = CyclePolicy {
            autonomous_context: true,
            max_iterations_per_goal: 2,
            approval_timeout_ms: Some(1_000),
            ..Default::default()
        };
        let (mut runner, _store, _broker) = build_runner(policy, reasoner, |request| {
            if request.capability == "cycle:proposal" {
                Some(ApprovalDecision::Reject {
                    feedback: Some("still not right".to_string()),
                })
            } else {
                Some(ApprovalDecision::Approve { data: None })
            }
        });

        let outcome = runner.run_goal(Goal::new("never good enough")).await.unwrap();

        assert!(!outcome.success);
        assert!(runner.halted());
        // Halted runner refuses new goals until reset.
        assert!(matches!(
            runner.submit_goal(Goal::new("one more")),
            Err(CoreError::Rejected(_))
        ));
        runner.reset();
        assert!(runner.submit_goal(Goal::new("after reset")).is_ok());
    }

    #[tokio::test]
    async fn test_queued_goals_run_in_order_without_interleaving() {
        let reasoner = ScriptedReasoner::new(vec![
            create_proposal("/one.txt", "1"),
            create_proposal("/two.txt", "2"),
        ]);
        let policy = CyclePolicy {
            autonomous_context: true,
            approval_timeout_ms: Some(1_000),
            ..Default::default()
        };
        let (mut runner, store, _broker) = build_runner(policy, reasoner, approve_all);

        let states: Arc<Mutex<Vec<CycleState>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&states);
        runner.set_on_state_change(Box::new(move |state| seen.lock().unwrap().push(state)));

        let first = Goal::new("first");
        let second = Goal::new("second");
        let first_id = first.id.clone();
        let second_id = second.id.clone();
        runner.submit_goal(first).unwrap();
        runner.submit_goal(second).unwrap();

        let outcomes = runner.run_pending().await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].goal_id, first_id);
        assert_eq!(outcomes[1].goal_id, second_id);
        assert!(store.lock().unwrap().read("/one.txt").is_ok());
        assert!(store.lock().unwrap().read("/two.txt").is_ok());

        // The second cycle starts only after the first returned to idle.
        let states = states.lock().unwrap();
        let first_idle = states
            .iter()
            .position(|s| *s == CycleState::Idle)
            .unwrap();
        let second_curating = states
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == CycleState::CuratingContext)
            .nth(1)
            .map(|(i, _)| i)
            .unwrap();
        assert!(second_curating > first_idle);
    }

    #[tokio::test]
    async fn test_goal_queue_is_bounded() {
        let reasoner = ScriptedReasoner::new(vec![]);
        let policy = CyclePolicy {
            max_queued_goals: 1,
            ..Default::default()
        };
        let (mut runner, _store, _broker) = build_runner(policy, reasoner, approve_all);

        assert!(runner.submit_goal(Goal::new("fits")).is_ok());
        assert!(matches!(
            runner.submit_goal(Goal::new("overflows")),
            Err(CoreError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_verification_failure_aborts_remaining_changes() {
        let proposal = json!({
            "changes": [
                {
                    "op": "CREATE",
                    "path": "/a.txt",
                    "content": "x",
                    "reason": "first change fails verification",
                    "verify": {
                        "checks": [
                            { "check": "equals", "path": "/a.txt", "expected": "y" }
                        ]
                    }
                },
                {
                    "op": "CREATE",
                    "path": "/b.txt",
                    "content": "never applied",
                    "reason": "second change must not run"
                }
            ]
        });
        let reasoner = ScriptedReasoner::new(vec![proposal]);
        let policy = CyclePolicy {
            autonomous_context: true,
            approval_timeout_ms: Some(1_000),
            ..Default::default()
        };
        let (mut runner, store, _broker) = build_runner(policy, reasoner, approve_all);

        let outcome = runner.run_goal(Goal::new("doomed set")).await.unwrap();

        assert!(!outcome.success);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.kind, ErrorKind::VerificationFailed);
        assert!(failure.checkpoint_id.is_some());
        // First change rolled back, second never attempted.
        assert!(store.lock().unwrap().read("/a.txt").is_err());
        assert!(store.lock().unwrap().read("/b.txt").is_err());
        assert!(outcome.applied.is_empty());
    }

    #[tokio::test]
    async fn test_partial_apply_is_reported_not_hidden() {
        let proposal = json!({
            "changes": [
                {
                    "op": "CREATE",
                    "path": "/ok.txt",
                    "content": "good",
                    "reason": "first change applies"
                },
                {
                    "op": "MODIFY",
                    "path": "/missing.txt",
                    "content": "x",
                    "reason": "second change fails"
                }
            ]
        });
        let reasoner = ScriptedReasoner::new(vec![proposal]);
        let policy = CyclePolicy {
            autonomous_context: true,
            approval_timeout_ms: Some(1_000),
            ..Default::default()
        };
        let (mut runner, store, _broker) = build_runner(policy, reasoner, approve_all);

        let outcome = runner.run_goal(Goal::new("partial apply")).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.applied.len(), 1);
        assert_eq!(outcome.applied[0].path, "/ok.txt");
        assert_eq!(outcome.failure.unwrap().kind, ErrorKind::NotFound);
        // The applied prefix stays applied; the failure is reported.
        assert!(store.lock().unwrap().read("/ok.txt").is_ok());
    }

    #[tokio::test]
    async fn test_cancellation_rolls_back_open_checkpoint() {
        let reasoner = ScriptedReasoner::new(vec![create_proposal("/a.txt", "x")]);
        let policy = CyclePolicy {
            autonomous_context: true,
            approval_timeout_ms: Some(1_000),
            ..Default::default()
        };

        // Approve the proposal but request cancellation at the same
        // moment, so the apply loop observes the flag.
        let cancel_flag: Arc<Mutex<Option<Arc<AtomicBool>>>> = Arc::new(Mutex::new(None));
        let flag_for_responder = Arc::clone(&cancel_flag);
        let (mut runner, store, _broker) =
            build_runner(policy, reasoner, move |request| {
                if request.capability == "cycle:proposal" {
                    if let Some(ref flag) = *flag_for_responder.lock().unwrap() {
                        flag.store(true, Ordering::SeqCst);
                    }
                }
                Some(ApprovalDecision::Approve { data: None })
            });
        *cancel_flag.lock().unwrap() = Some(runner.cancel_handle());

        let outcome = runner.run_goal(Goal::new("cancelled mid-flight")).await.unwrap();

        assert!(outcome.cancelled);
        assert!(!outcome.success);
        assert_eq!(runner.state(), CycleState::Idle);
        assert!(store.lock().unwrap().read("/a.txt").is_err());
        // The flag was consumed; the runner accepts new work.
        assert!(!runner.cancel_handle().load(Ordering::SeqCst));
        assert!(runner.submit_goal(Goal::new("next")).is_ok());
    }
}
