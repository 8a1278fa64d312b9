//! Per-instance dispatch
//!
//! One [`Dispatcher`] drives one owned instance: it walks the node graph
//! level by level, dispatches ready units into a bounded pool, applies
//! retry ladders and timeouts, honors cooperative cancellation with a
//! grace window, and persists every transition through the store.
//!
//! Levels and groups. A *level* is a set of nodes related by `depends_on`
//! (the top-level graph, or a static-loop iteration body). A *group* is a
//! set of independent sibling units (parallel children, dynamic-loop
//! expansions) governed by a join policy. Composite nodes run as single
//! units of their level and drive their own children recursively.
//!
//! Concurrency. Each level/group dispatches at most its cap of units at
//! once; every executor call additionally holds a permit of the engine's
//! global in-flight semaphore, so one busy instance cannot starve others
//! (tokio semaphores wake waiters FIFO).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::definition::{
    DefinitionRef, ErrorMode, JoinType, Node, NodeKind, RetrySpec, WorkflowDefinition,
};
use crate::error::{EngineError, ErrorKind, FailureInfo, TaskError};
use crate::events::{EventKind, EventRecord};
use crate::interpreter::{depth_map, iteration_key, select_arm, NodeTracker};
use crate::persistence::{NodeInstance, NodeStatus, StoreError, WorkflowInstance, WorkflowStore};
use crate::registry::ExecutorRegistry;
use crate::scope::{FrameId, ScopeArena};
use crate::task::{CancellationHandle, ExecutionContext, ProgressUpdate};
use crate::template;

/// Control signal fed to a running dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Run,
    Pause,
    Cancel,
    OwnerLost,
}

/// Why a dispatcher suspended without reaching a terminal status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendKind {
    Paused,
    OwnerLost,
}

/// Final outcome of one dispatch run
#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    Failed(FailureInfo),
    Cancelled,
    Suspended(SuspendKind),
}

/// Outcome of one unit of work
#[derive(Debug)]
enum UnitOutcome {
    Completed(Value),
    Failed { error: TaskError, attempt: u32 },
    Cancelled,
    Suspended,
}

/// Outcome of one level (dependency graph) run
#[derive(Debug)]
enum LevelOutcome {
    Completed,
    Failed {
        node_id: String,
        attempt: u32,
        error: TaskError,
    },
    Cancelled,
    Suspended(SuspendKind),
}

/// How a child instance of a sub-workflow node is created and driven
///
/// Implemented by the engine; kept as a trait so the dispatcher does not
/// depend on the engine module.
#[async_trait]
pub trait ChildDriver: Send + Sync + 'static {
    /// Create a child instance of the referenced definition
    async fn create_child(
        &self,
        definition: &DefinitionRef,
        inputs: Value,
    ) -> Result<Uuid, EngineError>;

    /// Drive the child to a terminal status
    async fn drive_child(&self, id: Uuid) -> Result<WorkflowInstance, EngineError>;

    /// Cancel the child (parent cancelled or torn down)
    async fn cancel_child(&self, id: Uuid, reason: &str) -> Result<(), EngineError>;
}

/// One child of a group (parallel / dynamic-loop expansion)
struct GroupChild {
    node: Node,
    frame: FrameId,
    iteration: String,
}

/// Per-child result slot of a group run
#[derive(Debug, Clone)]
enum GroupEntry {
    NotRun,
    Completed(Value),
    Failed(TaskError),
    Cancelled,
}

struct GroupResult {
    entries: Vec<GroupEntry>,
    suspended: bool,
    winner: Option<usize>,
    first_failure: Option<(usize, TaskError)>,
    any_cancelled: bool,
}

/// Unit key in the cancel registry: `<iteration>/<node_id>`, or the bare
/// node id at the top level
fn unit_key(iteration: &str, node_id: &str) -> String {
    if iteration.is_empty() {
        node_id.to_string()
    } else {
        format!("{iteration}/{node_id}")
    }
}

/// Per-instance dispatcher
pub struct Dispatcher {
    store: Arc<dyn WorkflowStore>,
    registry: Arc<ExecutorRegistry>,
    children: Arc<dyn ChildDriver>,
    config: EngineConfig,
    instance_id: Uuid,
    inputs: Value,
    definition: Arc<WorkflowDefinition>,
    scope: Mutex<ScopeArena>,
    control: watch::Receiver<Control>,
    owner_ok: Arc<AtomicBool>,
    global_slots: Arc<Semaphore>,
    cancel_handles: Mutex<HashMap<String, CancellationHandle>>,
    recovered: HashMap<String, NodeInstance>,
    instance_cap: usize,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        registry: Arc<ExecutorRegistry>,
        children: Arc<dyn ChildDriver>,
        config: EngineConfig,
        instance: &WorkflowInstance,
        definition: Arc<WorkflowDefinition>,
        scope: ScopeArena,
        control: watch::Receiver<Control>,
        owner_ok: Arc<AtomicBool>,
        global_slots: Arc<Semaphore>,
        recovered_rows: Vec<NodeInstance>,
    ) -> Self {
        let instance_cap = if instance.max_concurrency > 0 {
            instance.max_concurrency.min(config.default_max_concurrency)
        } else {
            config.default_max_concurrency
        };

        // Only top-level rows participate in recovery; composite innards
        // re-expand and re-run (at-least-once)
        let recovered = recovered_rows
            .into_iter()
            .filter(|r| r.iteration.is_empty())
            .map(|r| (r.node_id.clone(), r))
            .collect();

        Self {
            store,
            registry,
            children,
            config,
            instance_id: instance.id,
            inputs: instance.input_data.clone(),
            definition,
            scope: Mutex::new(scope),
            control,
            owner_ok,
            global_slots,
            cancel_handles: Mutex::new(HashMap::new()),
            recovered,
            instance_cap,
        }
    }

    /// Drive the instance until terminal, cancelled, or suspended
    pub async fn run(self: &Arc<Self>) -> Result<RunOutcome, EngineError> {
        let nodes = self.definition.nodes.clone();
        let root = self.scope.lock().root();

        let outcome = self
            .clone()
            .run_level(nodes, root, String::new(), self.instance_cap, true)
            .await?;

        Ok(match outcome {
            LevelOutcome::Completed => RunOutcome::Completed,
            LevelOutcome::Failed {
                node_id,
                attempt,
                error,
            } => RunOutcome::Failed(FailureInfo::from_task_error(&node_id, attempt, &error)),
            LevelOutcome::Cancelled => RunOutcome::Cancelled,
            LevelOutcome::Suspended(kind) => RunOutcome::Suspended(kind),
        })
    }

    /// Serialize the current scope (for final output evaluation)
    pub fn scope_snapshot(&self) -> ScopeArena {
        self.scope.lock().clone()
    }

    // =========================================================================
    // Levels: nodes related by depends_on
    // =========================================================================

    fn run_level(
        self: Arc<Self>,
        nodes: Vec<Node>,
        frame: FrameId,
        prefix: String,
        cap: usize,
        top_level: bool,
    ) -> BoxFuture<'static, Result<LevelOutcome, EngineError>> {
        Box::pin(async move {
            let mut tracker = NodeTracker::new(&nodes);
            if top_level {
                for (id, row) in &self.recovered {
                    tracker.restore(id, row.status);
                }
            }

            let depths = depth_map(&nodes);
            let order: HashMap<String, usize> = nodes
                .iter()
                .enumerate()
                .map(|(i, n)| (n.id.clone(), i))
                .collect();

            let cap = cap.max(1);
            let mut joinset: JoinSet<Result<(String, UnitOutcome), EngineError>> = JoinSet::new();
            let mut inflight: HashSet<String> = HashSet::new();
            let mut control = self.control.clone();
            let mut suspend: Option<SuspendKind> = None;
            let mut failure: Option<(String, u32, TaskError)> = None;
            let mut cancelled = false;
            let mut grace_deadline: Option<Instant> = None;

            // A cancel may have landed before this level started
            if *control.borrow() == Control::Cancel {
                cancelled = true;
            }

            loop {
                let stopping = suspend.is_some() || failure.is_some() || cancelled;

                if !stopping {
                    // Skip propagation runs to a fixed point before dispatch
                    loop {
                        let skippable = tracker.newly_skippable(&nodes);
                        if skippable.is_empty() {
                            break;
                        }
                        for id in skippable {
                            tracker.set(&id, NodeStatus::Skipped);
                            self.commit_terminal_row(&id, &prefix, NodeStatus::Skipped, 0, None, None)
                                .await?;
                            self.emit(EventRecord::node(
                                self.instance_id,
                                id.clone(),
                                EventKind::NodeSkipped,
                                json!({"iteration": prefix}),
                            ))
                            .await;
                        }
                    }

                    // Branches resolve inline; they never occupy a pool slot
                    let mut ready = tracker.ready(&nodes);
                    ready.sort_by_key(|id| (depths.get(id).copied().unwrap_or(0), order[id]));

                    if let Some(branch_id) = ready
                        .iter()
                        .find(|id| {
                            matches!(
                                node_by_id(&nodes, id.as_str()).map(|n| &n.kind),
                                Some(NodeKind::Branch { .. })
                            )
                        })
                        .cloned()
                    {
                        let node = node_by_id(&nodes, &branch_id)
                            .expect("ready node exists in level")
                            .clone();
                        match self
                            .resolve_branch(&node, &mut tracker, frame, &prefix, top_level)
                            .await?
                        {
                            Ok(()) => continue,
                            Err(error) => {
                                tracker.set(&branch_id, NodeStatus::Failed);
                                failure = Some((branch_id, 1, error));
                                self.cancel_level_inflight(&inflight, &prefix);
                                grace_deadline =
                                    Some(Instant::now() + self.config.cancel_grace);
                                continue;
                            }
                        }
                    }

                    for id in ready {
                        if inflight.len() >= cap {
                            break;
                        }
                        let node = node_by_id(&nodes, &id)
                            .expect("ready node exists in level")
                            .clone();
                        tracker.set(&id, NodeStatus::Ready);
                        inflight.insert(id.clone());

                        let this = self.clone();
                        let prefix = prefix.clone();
                        joinset.spawn(async move { this.run_unit(node, frame, prefix).await });
                    }
                }

                if joinset.is_empty() {
                    if let Some(kind) = suspend {
                        return Ok(LevelOutcome::Suspended(kind));
                    }
                    if cancelled {
                        return Ok(LevelOutcome::Cancelled);
                    }
                    if let Some((node_id, attempt, error)) = failure.take() {
                        return Ok(LevelOutcome::Failed {
                            node_id,
                            attempt,
                            error,
                        });
                    }
                    if tracker.all_terminal(&nodes) {
                        return Ok(LevelOutcome::Completed);
                    }
                    if tracker.ready(&nodes).is_empty()
                        && tracker.newly_skippable(&nodes).is_empty()
                    {
                        return Err(EngineError::Stalled(self.instance_id));
                    }
                    // Ready work exists; dispatch on the next pass
                    continue;
                }

                tokio::select! {
                    biased;

                    changed = control.changed() => {
                        if changed.is_ok() {
                            match *control.borrow() {
                                Control::Pause => {
                                    suspend.get_or_insert(SuspendKind::Paused);
                                }
                                Control::OwnerLost => {
                                    suspend = Some(SuspendKind::OwnerLost);
                                }
                                Control::Cancel => {
                                    if !cancelled {
                                        cancelled = true;
                                        self.cancel_level_inflight(&inflight, &prefix);
                                        grace_deadline =
                                            Some(Instant::now() + self.config.cancel_grace);
                                    }
                                }
                                Control::Run => {}
                            }
                        }
                    }

                    _ = sleep_until_opt(grace_deadline), if grace_deadline.is_some() => {
                        // Grace elapsed: discard whatever the stragglers produce
                        joinset.abort_all();
                        while joinset.join_next().await.is_some() {}
                        for id in inflight.drain() {
                            tracker.set(&id, NodeStatus::Cancelled);
                            self.commit_terminal_row(&id, &prefix, NodeStatus::Cancelled, 0, None, None)
                                .await?;
                            self.emit(EventRecord::node(
                                self.instance_id,
                                id,
                                EventKind::NodeCancelled,
                                json!({"reason": "grace elapsed"}),
                            ))
                            .await;
                        }
                        grace_deadline = None;
                    }

                    joined = joinset.join_next() => {
                        match joined {
                            None => {}
                            Some(Err(join_err)) => {
                                if join_err.is_panic() {
                                    // Panics are infrastructure bugs: yield the
                                    // lease and crash the dispatcher
                                    let _ = self
                                        .store
                                        .release_lease(self.instance_id, &self.config.engine_id)
                                        .await;
                                    std::panic::resume_unwind(join_err.into_panic());
                                }
                                // Aborted tasks are accounted via `inflight`
                            }
                            Some(Ok(Err(e))) => return Err(e),
                            Some(Ok(Ok((id, outcome)))) => {
                                inflight.remove(&id);
                                match outcome {
                                    UnitOutcome::Completed(output) => {
                                        tracker.set(&id, NodeStatus::Completed);
                                        self.commit_success(&id, frame, output, top_level).await?;
                                    }
                                    UnitOutcome::Failed { error, attempt } => {
                                        tracker.set(&id, NodeStatus::Failed);
                                        if failure.is_none() {
                                            failure = Some((id, attempt, error));
                                            self.cancel_level_inflight(&inflight, &prefix);
                                            grace_deadline =
                                                Some(Instant::now() + self.config.cancel_grace);
                                        }
                                    }
                                    UnitOutcome::Cancelled => {
                                        tracker.set(&id, NodeStatus::Cancelled);
                                        // A cancelled unit means this level is
                                        // being torn down
                                        if !cancelled && failure.is_none() && suspend.is_none() {
                                            cancelled = true;
                                            self.cancel_level_inflight(&inflight, &prefix);
                                            grace_deadline =
                                                Some(Instant::now() + self.config.cancel_grace);
                                        }
                                    }
                                    UnitOutcome::Suspended => {
                                        tracker.set(&id, NodeStatus::Waiting);
                                        let kind = match *control.borrow() {
                                            Control::OwnerLost => SuspendKind::OwnerLost,
                                            _ => SuspendKind::Paused,
                                        };
                                        suspend.get_or_insert(kind);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    /// Evaluate a branch node inline
    ///
    /// Returns `Ok(Err(error))` when the arm expression is invalid.
    async fn resolve_branch(
        &self,
        node: &Node,
        tracker: &mut NodeTracker,
        frame: FrameId,
        prefix: &str,
        top_level: bool,
    ) -> Result<Result<(), TaskError>, EngineError> {
        let NodeKind::Branch { arms, else_nodes } = &node.kind else {
            return Ok(Ok(()));
        };

        tracker.set(&node.id, NodeStatus::Running);

        let selection = {
            let scope = self.scope.lock();
            select_arm(arms, else_nodes, &scope, frame)
        };

        let selection = match selection {
            Ok(s) => s,
            Err(e) => {
                let error = TaskError::from(e);
                self.commit_terminal_row(
                    &node.id,
                    prefix,
                    NodeStatus::Failed,
                    1,
                    None,
                    Some(error.clone()),
                )
                .await?;
                self.emit(EventRecord::node(
                    self.instance_id,
                    node.id.clone(),
                    EventKind::NodeFailed,
                    json!({"error": error.message}),
                ))
                .await;
                return Ok(Err(error));
            }
        };

        debug!(
            instance_id = %self.instance_id,
            node_id = %node.id,
            arm = ?selection.arm_index,
            "branch selected"
        );

        let output = json!({
            "arm": selection.arm_index,
            "selected": selection.selected,
        });

        tracker.set(&node.id, NodeStatus::Completed);
        for target in &selection.skipped {
            tracker.set(target, NodeStatus::Skipped);
            self.commit_terminal_row(target, prefix, NodeStatus::Skipped, 0, None, None)
                .await?;
            self.emit(EventRecord::node(
                self.instance_id,
                target.clone(),
                EventKind::NodeSkipped,
                json!({"branch": node.id}),
            ))
            .await;
        }

        self.commit_terminal_row(
            &node.id,
            prefix,
            NodeStatus::Completed,
            1,
            Some(output.clone()),
            None,
        )
        .await?;
        self.emit(EventRecord::node(
            self.instance_id,
            node.id.clone(),
            EventKind::NodeCompleted,
            json!({"arm": selection.arm_index}),
        ))
        .await;
        self.commit_success(&node.id, frame, output, top_level).await?;

        Ok(Ok(()))
    }

    // =========================================================================
    // Units
    // =========================================================================

    fn run_unit(
        self: Arc<Self>,
        node: Node,
        frame: FrameId,
        iteration: String,
    ) -> BoxFuture<'static, Result<(String, UnitOutcome), EngineError>> {
        Box::pin(async move {
        let id = node.id.clone();
        let outcome = match &node.kind {
            NodeKind::Task { executor, config } => {
                self.run_task(&node, executor, config, frame, &iteration)
                    .await?
            }
            NodeKind::Parallel {
                nodes,
                max_concurrency,
                join_type,
                error_handling,
            } => {
                self.run_parallel(
                    &node,
                    nodes,
                    *max_concurrency,
                    *join_type,
                    *error_handling,
                    frame,
                    &iteration,
                )
                .await?
            }
            NodeKind::Loop {
                iterations,
                nodes,
                max_concurrency,
            } => {
                self.run_static_loop(&node, *iterations, nodes, *max_concurrency, frame, &iteration)
                    .await?
            }
            NodeKind::ForEach {
                source_expression,
                task_template,
                max_concurrency,
                join_type,
                error_handling,
            } => {
                self.run_for_each(
                    &node,
                    source_expression,
                    task_template,
                    *max_concurrency,
                    *join_type,
                    *error_handling,
                    frame,
                    &iteration,
                )
                .await?
            }
            NodeKind::SubWorkflow {
                definition,
                input_mapping,
            } => {
                self.run_subworkflow(&node, definition, input_mapping, frame, &iteration)
                    .await?
            }
            // Branches are resolved inline by the level loop
            NodeKind::Branch { .. } => UnitOutcome::Completed(Value::Null),
        };

        Ok((id, outcome))
        })
    }

    /// Run a task node through its retry ladder
    async fn run_task(
        &self,
        node: &Node,
        executor_name: &str,
        config: &Value,
        frame: FrameId,
        iteration: &str,
    ) -> Result<UnitOutcome, EngineError> {
        let retry = node.retry.clone().unwrap_or_else(|| RetrySpec {
            max_attempts: 1,
            ..Default::default()
        });
        let max_attempts = retry.max_attempts.max(1);

        // Crash recovery continues the attempt count of the interrupted run
        let base_attempt = if iteration.is_empty() {
            self.recovered
                .get(&node.id)
                .map(|r| r.attempt)
                .unwrap_or(0)
        } else {
            0
        };
        let mut attempt = base_attempt + 1;
        let key = unit_key(iteration, &node.id);

        loop {
            // Resolve the config against the current scope
            let resolved = {
                let scope = self.scope.lock();
                template::resolve(config, &scope, frame)
            };
            let resolved = match resolved {
                Ok(v) => v,
                Err(e) => {
                    let error = TaskError::from(e);
                    self.record_node_failure(node, iteration, attempt, &error, false)
                        .await?;
                    return Ok(UnitOutcome::Failed { error, attempt });
                }
            };

            let executor = match self.registry.resolve(executor_name) {
                Ok(e) => e,
                Err(e) => {
                    let error =
                        TaskError::non_retryable(e.to_string()).with_kind(ErrorKind::NotFound);
                    self.record_node_failure(node, iteration, attempt, &error, false)
                        .await?;
                    return Ok(UnitOutcome::Failed { error, attempt });
                }
            };

            let mut row = NodeInstance::new(self.instance_id, node.id.clone(), iteration);
            row.status = NodeStatus::Running;
            row.attempt = attempt;
            row.started_at = Some(Utc::now());
            row.input_snapshot = Some(resolved.clone());
            self.persist_row(&row).await?;
            self.emit(EventRecord::node(
                self.instance_id,
                node.id.clone(),
                EventKind::NodeStarted,
                json!({"attempt": attempt, "iteration": iteration, "executor": executor_name}),
            ))
            .await;

            // Progress updates become audit events, best effort
            let (progress_tx, mut progress_rx) = tokio::sync::mpsc::channel::<ProgressUpdate>(16);
            {
                let store = self.store.clone();
                let instance_id = self.instance_id;
                let node_id = node.id.clone();
                tokio::spawn(async move {
                    while let Some(update) = progress_rx.recv().await {
                        let payload = update.details.unwrap_or(Value::Null);
                        let _ = store
                            .append_event(EventRecord::node(
                                instance_id,
                                node_id.clone(),
                                EventKind::NodeProgress,
                                payload,
                            ))
                            .await;
                    }
                });
            }

            let ctx = ExecutionContext::new(
                self.instance_id,
                node.id.clone(),
                iteration,
                attempt,
                max_attempts,
                resolved,
                self.inputs.clone(),
            )
            .with_progress(progress_tx);
            let handle = ctx.cancellation_handle();
            self.cancel_handles.lock().insert(key.clone(), handle.clone());

            // Every executor call holds a global in-flight permit
            let permit = self
                .global_slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| EngineError::Stalled(self.instance_id))?;

            enum Exec {
                Done(Result<Value, TaskError>),
                Cancelled,
            }

            let execution = async {
                match node.timeout {
                    Some(t) => match tokio::time::timeout(t, executor.execute(ctx)).await {
                        Ok(result) => result,
                        Err(_) => Err(TaskError::timeout(format!(
                            "task exceeded {}ms",
                            t.as_millis()
                        ))),
                    },
                    None => executor.execute(ctx).await,
                }
            };

            let result = tokio::select! {
                r = execution => Exec::Done(r),
                _ = handle.cancelled() => Exec::Cancelled,
            };

            drop(permit);
            self.cancel_handles.lock().remove(&key);

            match result {
                Exec::Done(Ok(output)) => {
                    let mut row = row;
                    row.status = NodeStatus::Completed;
                    row.finished_at = Some(Utc::now());
                    row.output = Some(output.clone());
                    self.persist_row(&row).await?;
                    self.emit(EventRecord::node(
                        self.instance_id,
                        node.id.clone(),
                        EventKind::NodeCompleted,
                        json!({"attempt": attempt, "iteration": iteration}),
                    ))
                    .await;
                    return Ok(UnitOutcome::Completed(output));
                }

                Exec::Done(Err(error)) => {
                    let will_retry =
                        error.retryable && retry.has_attempts_remaining(attempt);
                    self.record_node_failure(node, iteration, attempt, &error, will_retry)
                        .await?;

                    if !will_retry {
                        return Ok(UnitOutcome::Failed { error, attempt });
                    }

                    let delay = retry.delay_after_attempt(attempt);
                    self.emit(EventRecord::node(
                        self.instance_id,
                        node.id.clone(),
                        EventKind::NodeRetryScheduled,
                        json!({
                            "attempt": attempt,
                            "next_attempt": attempt + 1,
                            "delay_ms": delay.as_millis() as u64,
                        }),
                    ))
                    .await;

                    // Retry sleeps are a cancellation point
                    let slept = tokio::select! {
                        _ = tokio::time::sleep(delay) => true,
                        _ = handle.cancelled() => false,
                    };
                    if !slept {
                        self.commit_terminal_row(
                            &node.id,
                            iteration,
                            NodeStatus::Cancelled,
                            attempt,
                            None,
                            None,
                        )
                        .await?;
                        return Ok(UnitOutcome::Cancelled);
                    }

                    // Back to ready; the attempt field carries the history
                    let mut row = row.clone();
                    row.status = NodeStatus::Ready;
                    self.persist_row(&row).await?;
                    attempt += 1;
                }

                Exec::Cancelled => {
                    self.commit_terminal_row(
                        &node.id,
                        iteration,
                        NodeStatus::Cancelled,
                        attempt,
                        None,
                        None,
                    )
                    .await?;
                    self.emit(EventRecord::node(
                        self.instance_id,
                        node.id.clone(),
                        EventKind::NodeCancelled,
                        json!({"attempt": attempt, "iteration": iteration}),
                    ))
                    .await;
                    return Ok(UnitOutcome::Cancelled);
                }
            }
        }
    }

    /// Run a parallel node's inline children as a group
    #[allow(clippy::too_many_arguments)]
    async fn run_parallel(
        self: &Arc<Self>,
        node: &Node,
        children: &[Node],
        max_concurrency: usize,
        join: JoinType,
        mode: ErrorMode,
        frame: FrameId,
        iteration: &str,
    ) -> Result<UnitOutcome, EngineError> {
        self.begin_composite(node, iteration).await?;

        let specs: Vec<GroupChild> = children
            .iter()
            .enumerate()
            .map(|(i, child)| {
                let child_frame = self.scope.lock().push_frame(frame, Map::new());
                GroupChild {
                    node: child.clone(),
                    frame: child_frame,
                    iteration: iteration_key(iteration, &node.id, i),
                }
            })
            .collect();

        let result = self
            .run_group(node, specs, max_concurrency, join, mode, iteration)
            .await?;

        if result.suspended {
            return Ok(UnitOutcome::Suspended);
        }

        let children_json: Vec<Value> = result
            .entries
            .iter()
            .map(|e| match e {
                GroupEntry::Completed(v) => v.clone(),
                GroupEntry::Failed(err) => json!({"error": err}),
                GroupEntry::Cancelled | GroupEntry::NotRun => Value::Null,
            })
            .collect();

        let outcome = match join {
            JoinType::All => {
                if let (ErrorMode::FailFast, Some((_, error))) =
                    (mode, result.first_failure.clone())
                {
                    UnitOutcome::Failed { error, attempt: 1 }
                } else if result.any_cancelled && result.first_failure.is_none() {
                    UnitOutcome::Cancelled
                } else {
                    UnitOutcome::Completed(json!({"children": children_json}))
                }
            }
            JoinType::Any => match result.winner {
                Some(i) => match &result.entries[i] {
                    GroupEntry::Completed(v) => UnitOutcome::Completed(v.clone()),
                    _ => UnitOutcome::Cancelled,
                },
                None => match result.first_failure {
                    Some((_, error)) => UnitOutcome::Failed { error, attempt: 1 },
                    None => UnitOutcome::Cancelled,
                },
            },
            JoinType::Race => match result.winner {
                Some(i) => match result.entries[i].clone() {
                    GroupEntry::Completed(v) => UnitOutcome::Completed(v),
                    GroupEntry::Failed(error) => UnitOutcome::Failed { error, attempt: 1 },
                    _ => UnitOutcome::Cancelled,
                },
                None => UnitOutcome::Cancelled,
            },
        };

        self.finish_composite(node, iteration, &outcome).await?;
        Ok(outcome)
    }

    /// Run a static loop: `iterations` expansions of the body level
    async fn run_static_loop(
        self: &Arc<Self>,
        node: &Node,
        iterations: u32,
        body: &[Node],
        max_concurrency: usize,
        frame: FrameId,
        iteration: &str,
    ) -> Result<UnitOutcome, EngineError> {
        self.begin_composite(node, iteration).await?;

        let overlap = max_concurrency.max(1);
        let mut results: Vec<Option<Value>> = vec![None; iterations as usize];
        let mut failed: Option<TaskError> = None;
        let mut cancelled = false;
        let mut suspended = false;

        let mut joinset: JoinSet<Result<(usize, LevelOutcome, FrameId), EngineError>> =
            JoinSet::new();
        let mut next: usize = 0;
        let total = iterations as usize;

        loop {
            while !suspended && !cancelled && failed.is_none()
                && joinset.len() < overlap
                && next < total
            {
                let child_frame = {
                    let mut scope = self.scope.lock();
                    let mut vars = Map::new();
                    vars.insert("index".to_string(), json!(next));
                    scope.push_frame(frame, vars)
                };
                let child_prefix = iteration_key(iteration, &node.id, next);
                let this = self.clone();
                let body = body.to_vec();
                let cap = body.len().max(1);
                let i = next;
                joinset.spawn(async move {
                    let outcome = this
                        .run_level(body, child_frame, child_prefix, cap, false)
                        .await?;
                    Ok((i, outcome, child_frame))
                });
                next += 1;
            }

            let Some(joined) = joinset.join_next().await else {
                break;
            };

            match joined {
                Err(join_err) => {
                    if join_err.is_panic() {
                        let _ = self
                            .store
                            .release_lease(self.instance_id, &self.config.engine_id)
                            .await;
                        std::panic::resume_unwind(join_err.into_panic());
                    }
                }
                Ok(Err(e)) => return Err(e),
                Ok(Ok((i, outcome, child_frame))) => match outcome {
                    LevelOutcome::Completed => {
                        results[i] = Some(self.collect_frame_outputs(child_frame, body));
                    }
                    LevelOutcome::Failed { error, .. } => {
                        if failed.is_none() {
                            failed = Some(error);
                            self.cancel_subtree(&subtree_prefix(iteration, &node.id));
                        }
                    }
                    LevelOutcome::Cancelled => cancelled = true,
                    LevelOutcome::Suspended(_) => suspended = true,
                },
            }
        }

        let outcome = if suspended {
            UnitOutcome::Suspended
        } else if let Some(error) = failed {
            UnitOutcome::Failed { error, attempt: 1 }
        } else if cancelled {
            UnitOutcome::Cancelled
        } else {
            let ordered: Vec<Value> = results
                .into_iter()
                .map(|r| r.unwrap_or(Value::Null))
                .collect();
            {
                let mut scope = self.scope.lock();
                scope.set_loop_results(frame, &node.id, ordered.clone());
            }
            UnitOutcome::Completed(json!({"results": ordered}))
        };

        self.finish_composite(node, iteration, &outcome).await?;
        Ok(outcome)
    }

    /// Run a dynamic loop: one task per element of the source array
    #[allow(clippy::too_many_arguments)]
    async fn run_for_each(
        self: &Arc<Self>,
        node: &Node,
        source_expression: &str,
        task_template: &Node,
        max_concurrency: usize,
        join: JoinType,
        mode: ErrorMode,
        frame: FrameId,
        iteration: &str,
    ) -> Result<UnitOutcome, EngineError> {
        self.begin_composite(node, iteration).await?;

        let source = {
            let scope = self.scope.lock();
            template::resolve(&Value::String(source_expression.to_string()), &scope, frame)
        };

        let items: Vec<Value> = match source {
            Ok(Value::Array(items)) => items,
            Ok(Value::Null) => vec![],
            Ok(other) => {
                let error = TaskError::non_retryable(format!(
                    "source expression produced {} instead of an array",
                    type_name(&other)
                ))
                .with_kind(ErrorKind::Validation);
                let outcome = UnitOutcome::Failed { error, attempt: 1 };
                self.finish_composite(node, iteration, &outcome).await?;
                return Ok(outcome);
            }
            Err(e) => {
                let error = TaskError::from(e);
                let outcome = UnitOutcome::Failed { error, attempt: 1 };
                self.finish_composite(node, iteration, &outcome).await?;
                return Ok(outcome);
            }
        };

        // An empty source completes immediately with an empty result set
        if items.is_empty() {
            self.scope.lock().set_loop_results(frame, &node.id, vec![]);
            let outcome = UnitOutcome::Completed(json!({"results": []}));
            self.finish_composite(node, iteration, &outcome).await?;
            return Ok(outcome);
        }

        let specs: Vec<GroupChild> = items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let child_frame = {
                    let mut scope = self.scope.lock();
                    let mut vars = Map::new();
                    vars.insert("item".to_string(), item.clone());
                    vars.insert("index".to_string(), json!(i));
                    scope.push_frame(frame, vars)
                };
                GroupChild {
                    node: task_template.clone(),
                    frame: child_frame,
                    iteration: iteration_key(iteration, &node.id, i),
                }
            })
            .collect();

        let result = self
            .run_group(node, specs, max_concurrency, join, mode, iteration)
            .await?;

        if result.suspended {
            return Ok(UnitOutcome::Suspended);
        }

        // Results are committed in input (index) order regardless of
        // completion order
        let ordered: Vec<Value> = result
            .entries
            .iter()
            .map(|e| match e {
                GroupEntry::Completed(v) => v.clone(),
                GroupEntry::Failed(err) => json!({"error": err}),
                GroupEntry::Cancelled | GroupEntry::NotRun => Value::Null,
            })
            .collect();

        let outcome = match join {
            JoinType::All => {
                if let (ErrorMode::FailFast, Some((_, error))) =
                    (mode, result.first_failure.clone())
                {
                    UnitOutcome::Failed { error, attempt: 1 }
                } else if result.any_cancelled && result.first_failure.is_none() {
                    UnitOutcome::Cancelled
                } else {
                    self.scope
                        .lock()
                        .set_loop_results(frame, &node.id, ordered.clone());
                    UnitOutcome::Completed(json!({"results": ordered}))
                }
            }
            JoinType::Any => match result.winner {
                Some(_) => {
                    self.scope
                        .lock()
                        .set_loop_results(frame, &node.id, ordered.clone());
                    UnitOutcome::Completed(json!({"results": ordered}))
                }
                None => match result.first_failure {
                    Some((_, error)) => UnitOutcome::Failed { error, attempt: 1 },
                    None => UnitOutcome::Cancelled,
                },
            },
            JoinType::Race => match result.winner {
                Some(i) => match result.entries[i].clone() {
                    GroupEntry::Completed(_) => {
                        self.scope
                            .lock()
                            .set_loop_results(frame, &node.id, ordered.clone());
                        UnitOutcome::Completed(json!({"results": ordered}))
                    }
                    GroupEntry::Failed(error) => UnitOutcome::Failed { error, attempt: 1 },
                    _ => UnitOutcome::Cancelled,
                },
                None => UnitOutcome::Cancelled,
            },
        };

        self.finish_composite(node, iteration, &outcome).await?;
        Ok(outcome)
    }

    /// Run a sub-workflow node through its retry ladder
    async fn run_subworkflow(
        self: &Arc<Self>,
        node: &Node,
        definition: &DefinitionRef,
        input_mapping: &Value,
        frame: FrameId,
        iteration: &str,
    ) -> Result<UnitOutcome, EngineError> {
        let retry = node.retry.clone().unwrap_or_else(|| RetrySpec {
            max_attempts: 1,
            ..Default::default()
        });
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt: u32 = 1;
        let key = unit_key(iteration, &node.id);

        loop {
            let inputs = {
                let scope = self.scope.lock();
                template::resolve(input_mapping, &scope, frame)
            };
            let inputs = match inputs {
                Ok(v) => v,
                Err(e) => {
                    let error = TaskError::from(e);
                    self.record_node_failure(node, iteration, attempt, &error, false)
                        .await?;
                    return Ok(UnitOutcome::Failed { error, attempt });
                }
            };

            let mut row = NodeInstance::new(self.instance_id, node.id.clone(), iteration);
            row.status = NodeStatus::Running;
            row.attempt = attempt;
            row.started_at = Some(Utc::now());
            row.input_snapshot = Some(inputs.clone());
            self.persist_row(&row).await?;
            self.emit(EventRecord::node(
                self.instance_id,
                node.id.clone(),
                EventKind::NodeStarted,
                json!({"attempt": attempt, "sub_workflow": definition.to_string()}),
            ))
            .await;

            let handle = CancellationHandle::standalone();
            self.cancel_handles.lock().insert(key.clone(), handle.clone());

            let child_id = match self.children.create_child(definition, inputs).await {
                Ok(id) => id,
                Err(e) => {
                    self.cancel_handles.lock().remove(&key);
                    let error = TaskError::non_retryable(e.to_string()).with_kind(e.kind());
                    self.record_node_failure(node, iteration, attempt, &error, false)
                        .await?;
                    return Ok(UnitOutcome::Failed { error, attempt });
                }
            };

            enum ChildEnd {
                Done(Result<WorkflowInstance, EngineError>),
                Cancelled,
            }

            let result = tokio::select! {
                r = self.children.drive_child(child_id) => ChildEnd::Done(r),
                _ = handle.cancelled() => ChildEnd::Cancelled,
            };

            self.cancel_handles.lock().remove(&key);

            let error = match result {
                ChildEnd::Cancelled => {
                    let _ = self
                        .children
                        .cancel_child(child_id, "parent cancelled")
                        .await;
                    self.commit_terminal_row(
                        &node.id,
                        iteration,
                        NodeStatus::Cancelled,
                        attempt,
                        None,
                        None,
                    )
                    .await?;
                    return Ok(UnitOutcome::Cancelled);
                }
                ChildEnd::Done(Ok(child)) => match child.status {
                    crate::persistence::InstanceStatus::Completed => {
                        let output = child.output_data.unwrap_or(Value::Null);
                        let mut row = row;
                        row.status = NodeStatus::Completed;
                        row.finished_at = Some(Utc::now());
                        row.output = Some(output.clone());
                        self.persist_row(&row).await?;
                        self.emit(EventRecord::node(
                            self.instance_id,
                            node.id.clone(),
                            EventKind::NodeCompleted,
                            json!({"attempt": attempt, "child_instance": child_id}),
                        ))
                        .await;
                        return Ok(UnitOutcome::Completed(output));
                    }
                    crate::persistence::InstanceStatus::Cancelled => {
                        self.commit_terminal_row(
                            &node.id,
                            iteration,
                            NodeStatus::Cancelled,
                            attempt,
                            None,
                            None,
                        )
                        .await?;
                        return Ok(UnitOutcome::Cancelled);
                    }
                    _ => {
                        // Child failure retries when the parent declares a
                        // retry ladder
                        let message = child
                            .failure
                            .as_ref()
                            .map(|f| f.message.clone())
                            .unwrap_or_else(|| "sub-workflow failed".to_string());
                        TaskError {
                            message,
                            kind: child
                                .failure
                                .as_ref()
                                .map(|f| f.kind)
                                .unwrap_or(ErrorKind::Executor),
                            retryable: true,
                            details: Some(json!({"child_instance": child_id})),
                        }
                    }
                },
                ChildEnd::Done(Err(e)) => {
                    TaskError::retryable(e.to_string()).with_kind(e.kind())
                }
            };

            let will_retry = retry.has_attempts_remaining(attempt);
            self.record_node_failure(node, iteration, attempt, &error, will_retry)
                .await?;
            if !will_retry {
                return Ok(UnitOutcome::Failed { error, attempt });
            }

            let delay = retry.delay_after_attempt(attempt);
            let slept = tokio::select! {
                _ = tokio::time::sleep(delay) => true,
                _ = handle.cancelled() => false,
            };
            if !slept {
                self.commit_terminal_row(
                    &node.id,
                    iteration,
                    NodeStatus::Cancelled,
                    attempt,
                    None,
                    None,
                )
                .await?;
                return Ok(UnitOutcome::Cancelled);
            }
            attempt += 1;
        }
    }

    // =========================================================================
    // Groups: independent siblings under a join policy
    // =========================================================================

    async fn run_group(
        self: &Arc<Self>,
        parent: &Node,
        specs: Vec<GroupChild>,
        max_concurrency: usize,
        join: JoinType,
        mode: ErrorMode,
        parent_iteration: &str,
    ) -> Result<GroupResult, EngineError> {
        let total = specs.len();
        let cap = if max_concurrency == 0 {
            total
        } else {
            max_concurrency.clamp(1, total.max(1))
        };

        let mut entries: Vec<GroupEntry> = vec![GroupEntry::NotRun; total];
        let mut inflight: HashMap<usize, String> = HashMap::new();
        let mut joinset: JoinSet<Result<(usize, UnitOutcome), EngineError>> = JoinSet::new();
        let mut control = self.control.clone();
        let mut specs: Vec<Option<GroupChild>> = specs.into_iter().map(Some).collect();
        let spec_ids: Vec<(String, String)> = specs
            .iter()
            .map(|s| {
                let s = s.as_ref().expect("spec present before dispatch");
                (s.node.id.clone(), s.iteration.clone())
            })
            .collect();

        let mut next = 0;
        let mut stop_spawning = false;
        let mut suspended = false;
        let mut winner: Option<usize> = None;
        let mut first_failure: Option<(usize, TaskError)> = None;
        let mut any_cancelled = false;
        let mut grace_deadline: Option<Instant> = None;

        if *control.borrow() == Control::Cancel {
            stop_spawning = true;
        }

        loop {
            while !stop_spawning && joinset.len() < cap && next < total {
                let spec = specs[next].take().expect("spec not yet dispatched");
                inflight.insert(next, unit_key(&spec.iteration, &spec.node.id));
                let this = self.clone();
                let i = next;
                joinset.spawn(async move {
                    let (_, outcome) = this.run_unit(spec.node, spec.frame, spec.iteration).await?;
                    Ok((i, outcome))
                });
                next += 1;
            }

            if joinset.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                changed = control.changed() => {
                    if changed.is_ok() {
                        match *control.borrow() {
                            Control::Pause | Control::OwnerLost => {
                                // In-flight children finish; nothing new starts
                                stop_spawning = true;
                                suspended = true;
                            }
                            Control::Cancel => {
                                if grace_deadline.is_none() {
                                    stop_spawning = true;
                                    self.cancel_group_inflight(&inflight);
                                    grace_deadline =
                                        Some(Instant::now() + self.config.cancel_grace);
                                }
                            }
                            Control::Run => {}
                        }
                    }
                }

                _ = sleep_until_opt(grace_deadline), if grace_deadline.is_some() => {
                    joinset.abort_all();
                    while joinset.join_next().await.is_some() {}
                    for (i, _) in inflight.drain() {
                        entries[i] = GroupEntry::Cancelled;
                        any_cancelled = true;
                        let (node_id, iteration) = &spec_ids[i];
                        self.commit_terminal_row(node_id, iteration, NodeStatus::Cancelled, 0, None, None)
                            .await?;
                    }
                    grace_deadline = None;
                }

                joined = joinset.join_next() => {
                    match joined {
                        None => {}
                        Some(Err(join_err)) => {
                            if join_err.is_panic() {
                                let _ = self
                                    .store
                                    .release_lease(self.instance_id, &self.config.engine_id)
                                    .await;
                                std::panic::resume_unwind(join_err.into_panic());
                            }
                        }
                        Some(Ok(Err(e))) => return Err(e),
                        Some(Ok(Ok((i, outcome)))) => {
                            inflight.remove(&i);
                            match outcome {
                                UnitOutcome::Completed(v) => {
                                    entries[i] = GroupEntry::Completed(v);
                                    let settles = match join {
                                        JoinType::Any | JoinType::Race => winner.is_none(),
                                        JoinType::All => false,
                                    };
                                    if settles {
                                        winner = Some(i);
                                        stop_spawning = true;
                                        self.cancel_group_inflight(&inflight);
                                        if !inflight.is_empty() && grace_deadline.is_none() {
                                            grace_deadline =
                                                Some(Instant::now() + self.config.cancel_grace);
                                        }
                                    }
                                }
                                UnitOutcome::Failed { error, .. } => {
                                    entries[i] = GroupEntry::Failed(error.clone());
                                    let settles = match join {
                                        JoinType::Race => winner.is_none(),
                                        JoinType::All | JoinType::Any => false,
                                    };
                                    if settles {
                                        winner = Some(i);
                                    }
                                    if first_failure.is_none() {
                                        first_failure = Some((i, error));
                                    }
                                    let tear_down = settles
                                        || (join == JoinType::All && mode == ErrorMode::FailFast);
                                    if tear_down && grace_deadline.is_none() {
                                        stop_spawning = true;
                                        self.cancel_group_inflight(&inflight);
                                        if !inflight.is_empty() {
                                            grace_deadline =
                                                Some(Instant::now() + self.config.cancel_grace);
                                        }
                                    }
                                }
                                UnitOutcome::Cancelled => {
                                    entries[i] = GroupEntry::Cancelled;
                                    any_cancelled = true;
                                }
                                UnitOutcome::Suspended => {
                                    entries[i] = GroupEntry::NotRun;
                                    suspended = true;
                                    stop_spawning = true;
                                }
                            }
                        }
                    }
                }
            }
        }

        debug!(
            instance_id = %self.instance_id,
            node_id = %parent.id,
            iteration = %parent_iteration,
            total,
            ?winner,
            "group drained"
        );

        Ok(GroupResult {
            entries,
            suspended,
            winner,
            first_failure,
            any_cancelled,
        })
    }

    // =========================================================================
    // Commit helpers
    // =========================================================================

    /// Record a node output in the scope and, at the top level, persist the
    /// context under the ownership check
    async fn commit_success(
        &self,
        node_id: &str,
        frame: FrameId,
        output: Value,
        top_level: bool,
    ) -> Result<(), EngineError> {
        let context = {
            let mut scope = self.scope.lock();
            scope.set_node_output(frame, node_id, output);
            top_level.then(|| scope.to_json())
        };

        if let Some(context) = context {
            self.save_context(context, Some(node_id.to_string())).await?;
        }
        Ok(())
    }

    async fn begin_composite(&self, node: &Node, iteration: &str) -> Result<(), EngineError> {
        let mut row = NodeInstance::new(self.instance_id, node.id.clone(), iteration);
        row.status = NodeStatus::Running;
        row.attempt = 1;
        row.started_at = Some(Utc::now());
        self.persist_row(&row).await?;
        self.emit(EventRecord::node(
            self.instance_id,
            node.id.clone(),
            EventKind::NodeStarted,
            json!({"iteration": iteration}),
        ))
        .await;
        Ok(())
    }

    async fn finish_composite(
        &self,
        node: &Node,
        iteration: &str,
        outcome: &UnitOutcome,
    ) -> Result<(), EngineError> {
        let (status, output, error, kind) = match outcome {
            UnitOutcome::Completed(v) => (
                NodeStatus::Completed,
                Some(v.clone()),
                None,
                EventKind::NodeCompleted,
            ),
            UnitOutcome::Failed { error, .. } => (
                NodeStatus::Failed,
                None,
                Some(error.clone()),
                EventKind::NodeFailed,
            ),
            UnitOutcome::Cancelled => {
                (NodeStatus::Cancelled, None, None, EventKind::NodeCancelled)
            }
            // Suspended composites stay running and re-expand on resume
            UnitOutcome::Suspended => return Ok(()),
        };

        self.commit_terminal_row(&node.id, iteration, status, 1, output, error)
            .await?;
        self.emit(EventRecord::node(
            self.instance_id,
            node.id.clone(),
            kind,
            json!({"iteration": iteration}),
        ))
        .await;
        Ok(())
    }

    /// Persist a node failure row and its event
    async fn record_node_failure(
        &self,
        node: &Node,
        iteration: &str,
        attempt: u32,
        error: &TaskError,
        will_retry: bool,
    ) -> Result<(), EngineError> {
        self.commit_terminal_row(
            &node.id,
            iteration,
            NodeStatus::Failed,
            attempt,
            None,
            Some(error.clone()),
        )
        .await?;
        self.emit(EventRecord::node(
            self.instance_id,
            node.id.clone(),
            EventKind::NodeFailed,
            json!({
                "attempt": attempt,
                "iteration": iteration,
                "error": error.message,
                "kind": error.kind,
                "will_retry": will_retry,
            }),
        ))
        .await;
        Ok(())
    }

    /// Upsert a node row with the given terminal (or intermediate) status
    async fn commit_terminal_row(
        &self,
        node_id: &str,
        iteration: &str,
        status: NodeStatus,
        attempt: u32,
        output: Option<Value>,
        error: Option<TaskError>,
    ) -> Result<(), EngineError> {
        let mut row = NodeInstance::new(self.instance_id, node_id, iteration);
        row.status = status;
        row.attempt = attempt;
        row.output = output;
        row.error = error;
        if status.is_terminal() {
            row.finished_at = Some(Utc::now());
        }
        self.persist_row(&row).await
    }

    /// Store write with bounded retry; suppressed after ownership loss
    async fn persist_row(&self, row: &NodeInstance) -> Result<(), EngineError> {
        if !self.owner_ok.load(Ordering::Acquire) {
            debug!(
                instance_id = %self.instance_id,
                node_id = %row.node_id,
                "ownership lost, suppressing node write"
            );
            return Ok(());
        }

        let store = self.store.clone();
        let row = row.clone();
        self.with_storage_retry(move || {
            let store = store.clone();
            let row = row.clone();
            async move { store.upsert_node_instance(&row).await }
        })
        .await
    }

    async fn save_context(
        &self,
        context: Value,
        current_node_id: Option<String>,
    ) -> Result<(), EngineError> {
        if !self.owner_ok.load(Ordering::Acquire) {
            return Ok(());
        }

        let store = self.store.clone();
        let id = self.instance_id;
        let owner = self.config.engine_id.clone();
        let result = self
            .with_storage_retry(move || {
                let store = store.clone();
                let context = context.clone();
                let owner = owner.clone();
                let current = current_node_id.clone();
                async move { store.save_context(id, &owner, context, current).await }
            })
            .await;

        match result {
            // Losing the lease between heartbeats surfaces here; suspend
            // cooperatively instead of failing the run
            Err(EngineError::Store(StoreError::Conflict(_))) => {
                self.owner_ok.store(false, Ordering::Release);
                Ok(())
            }
            other => other,
        }
    }

    /// Append an audit event, best effort
    async fn emit(&self, event: EventRecord) {
        if !self.owner_ok.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.store.append_event(event).await {
            warn!(instance_id = %self.instance_id, error = %e, "failed to append event");
        }
    }

    /// Retry store mutations with exponential backoff; exhaustion means the
    /// engine yields its lease
    async fn with_storage_retry<F, Fut, T>(&self, op: F) -> Result<T, EngineError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let mut delay = self.config.storage_retry_base_delay;
        let attempts = self.config.storage_retry_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(StoreError::Database(e)) => {
                    warn!(
                        instance_id = %self.instance_id,
                        attempt,
                        error = %e,
                        "store mutation failed, backing off"
                    );
                    last_error = e;
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                }
                Err(other) => return Err(other.into()),
            }
        }

        // Terminal persistence failure: yield the lease so a peer can take over
        let _ = self
            .store
            .release_lease(self.instance_id, &self.config.engine_id)
            .await;
        self.owner_ok.store(false, Ordering::Release);
        info!(
            instance_id = %self.instance_id,
            "persistent storage failure, lease yielded"
        );
        Err(EngineError::StorageExhausted(last_error))
    }

    // =========================================================================
    // Cancellation plumbing
    // =========================================================================

    /// Flag the cancel handles of this level's in-flight units (and their
    /// descendants)
    fn cancel_level_inflight(&self, inflight: &HashSet<String>, prefix: &str) {
        for id in inflight {
            self.cancel_subtree(&unit_key(prefix, id));
        }
    }

    fn cancel_group_inflight(&self, inflight: &HashMap<usize, String>) {
        for key in inflight.values() {
            self.cancel_subtree(key);
        }
    }

    /// Cancel a unit and everything expanded beneath it
    ///
    /// Descendant keys extend the parent's with `[index]` path segments, so
    /// a prefix match on `key[` is exact.
    fn cancel_subtree(&self, key: &str) {
        let child_prefix = format!("{key}[");
        let handles = self.cancel_handles.lock();
        for (k, handle) in handles.iter() {
            if k == key || k.starts_with(&child_prefix) {
                handle.cancel();
            }
        }
    }

    /// Collect `{node_id: output}` from a completed iteration frame
    ///
    /// A single-node body contributes its output directly.
    fn collect_frame_outputs(&self, frame: FrameId, body: &[Node]) -> Value {
        let scope = self.scope.lock();

        if body.len() == 1 {
            return scope
                .node_output(frame, &body[0].id)
                .cloned()
                .unwrap_or(Value::Null);
        }

        let mut out = Map::new();
        for node in body {
            out.insert(
                node.id.clone(),
                scope.node_output(frame, &node.id).cloned().unwrap_or(Value::Null),
            );
        }
        Value::Object(out)
    }
}

/// Subtree prefix of a composite's expansions
fn subtree_prefix(iteration: &str, node_id: &str) -> String {
    unit_key(iteration, node_id)
}

fn node_by_id<'a>(nodes: &'a [Node], id: &str) -> Option<&'a Node> {
    nodes.iter().find(|n| n.id == id)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
