//! The central message pump (§4.3): the one place in the crate that moves
//! a message from "preprocessed" to "delivered to a handler" and back out
//! again. Everything else in this crate is a pure function or a passive
//! data structure; `Pipeline` is the only thing that runs.
//!
//! Mirrors this codebase's `AgentPipeline` adapter shape one layer down:
//! `Pipeline::new(registry, threads)`, `inject`, `run`, `shutdown`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PumpConfig;
use crate::config::SchedulingPolicy;
use crate::envelope::build_envelope;
use crate::error::PumpError;
use crate::handler::{HandlerMetadata, HandlerResponse, PayloadValue, TokenReporter, ValidatedPayload};
use crate::preprocessing::{self, IngressedMessage};
use crate::registry::{Listener, ListenerRegistry, ListenerSpec};
use crate::system::{self, SystemErrorCode};
use crate::thread_registry::ThreadRegistry;

/// Where a built envelope goes once a handler has returned: back into this
/// pipeline's own ready queue (the target is a registered listener) or out
/// of the crate entirely (the target is the original external sender, or
/// anything else this pipeline doesn't own). Transport is out of scope
/// (§1); `Pipeline::take_egress` is the seam the embedding application
/// drains.
enum Delivery {
    Internal(Vec<u8>),
    Egress(Vec<u8>),
}

/// Per-thread (lane) FIFO queues with breadth-first round-robin or
/// depth-first draining (§4.3, §8 invariant 7). Breadth-first services up
/// to `fairness_window` consecutive messages from one lane before rotating
/// it to the back, so no other ready lane waits longer than that window.
struct ReadyQueue {
    policy: SchedulingPolicy,
    fairness_window: usize,
    lanes: VecDeque<String>,
    per_lane: HashMap<String, VecDeque<IngressedMessage>>,
    current_lane: Option<String>,
    streak: usize,
}

impl ReadyQueue {
    fn new(policy: SchedulingPolicy, fairness_window: usize) -> Self {
        Self {
            policy,
            fairness_window: fairness_window.max(1),
            lanes: VecDeque::new(),
            per_lane: HashMap::new(),
            current_lane: None,
            streak: 0,
        }
    }

    fn push(&mut self, lane: String, msg: IngressedMessage) {
        let already_tracked =
            self.per_lane.contains_key(&lane) || self.current_lane.as_deref() == Some(lane.as_str());
        if !already_tracked {
            self.lanes.push_back(lane.clone());
        }
        self.per_lane.entry(lane).or_default().push_back(msg);
    }

    fn pop(&mut self) -> Option<IngressedMessage> {
        match self.policy {
            SchedulingPolicy::BreadthFirst => {
                let lane = match self.current_lane.clone() {
                    Some(l) if self.per_lane.contains_key(&l) && self.streak < self.fairness_window => l,
                    _ => {
                        self.streak = 0;
                        self.lanes.pop_front()?
                    }
                };
                let queue = self.per_lane.get_mut(&lane)?;
                let msg = queue.pop_front();
                if queue.is_empty() {
                    self.per_lane.remove(&lane);
                    self.current_lane = None;
                    self.streak = 0;
                } else {
                    self.streak += 1;
                    if self.streak >= self.fairness_window {
                        self.lanes.push_back(lane);
                        self.current_lane = None;
                        self.streak = 0;
                    } else {
                        self.current_lane = Some(lane);
                    }
                }
                msg
            }
            SchedulingPolicy::DepthFirst => loop {
                let lane = match self.current_lane.clone() {
                    Some(l) if self.per_lane.contains_key(&l) => l,
                    _ => {
                        let l = self.lanes.pop_front()?;
                        self.current_lane = Some(l.clone());
                        l
                    }
                };
                let queue = self.per_lane.get_mut(&lane)?;
                match queue.pop_front() {
                    Some(msg) => {
                        if queue.is_empty() {
                            self.per_lane.remove(&lane);
                            self.current_lane = None;
                            self.lanes.retain(|l| l != &lane);
                        }
                        return Some(msg);
                    }
                    None => {
                        self.per_lane.remove(&lane);
                        self.current_lane = None;
                    }
                }
            },
        }
    }

    fn is_empty(&self) -> bool {
        self.per_lane.is_empty()
    }
}

/// Best-effort extraction of a `<from>` tag from bytes too malformed for
/// [`crate::envelope::repair`] to salvage, so a `<huh>` for an
/// envelope-malformed failure has somewhere to go (§4.2 Scenario C). Not a
/// parser: a plain substring scan, exactly as forgiving as the situation
/// calls for.
fn best_effort_sender(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let start = text.find("<from>")? + "<from>".len();
    let end = text[start..].find("</from>")? + start;
    let name = text[start..end].trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

struct Inner {
    registry: RwLock<ListenerRegistry>,
    threads: AsyncMutex<ThreadRegistry>,
    config: PumpConfig,
    ready: StdMutex<ReadyQueue>,
    budgets: StdMutex<HashMap<String, TokenReporter>>,
    egress: StdMutex<VecDeque<Vec<u8>>>,
    /// Bounds how many handler invocations run at once (§4.3 "concurrency
    /// of dispatch is bounded by a configurable maximum"). A permit is held
    /// for the lifetime of one handler's spawn-and-await in [`Inner::dispatch`].
    dispatch_permits: Arc<Semaphore>,
    /// A weak handle back to the surrounding `Arc<Inner>`, upgraded when a
    /// method needs to hand an owned, `'static` reference to `tokio::spawn`
    /// (broadcast fan-out in [`Inner::route_message`]) — `&self` alone
    /// can't outlive the borrow once the task is detached.
    self_ref: Weak<Inner>,
}

impl Inner {
    /// §4.3/§5: "per-listener configurable timeout (default applies if
    /// unspecified)".
    fn handler_timeout(&self, listener: &Listener) -> Duration {
        Duration::from_secs(
            listener
                .timeout_seconds
                .unwrap_or(self.config.handler_timeout_default_seconds),
        )
    }

    fn token_reporter_for(&self, root_uuid: &str) -> TokenReporter {
        self.budgets
            .lock()
            .unwrap()
            .entry(root_uuid.to_string())
            .or_insert_with(|| TokenReporter::new(self.config.thread_token_budget_default))
            .clone()
    }

    fn push_egress(&self, bytes: Vec<u8>) {
        self.egress.lock().unwrap().push_back(bytes);
    }

    /// Resolve a pump-built envelope's destination: a still-registered
    /// listener goes back through this pipeline's own ingress; anything
    /// else (a dangling unregistered name, or the original external
    /// sender) is handed to egress (§4.1 "unregister leaves dangling peers
    /// unreachable", §4.3 step 5).
    async fn route(&self, to: &str, bytes: Vec<u8>) -> Delivery {
        let known = self.registry.read().await.lookup_by_name(to).is_some();
        if known {
            Delivery::Internal(bytes)
        } else {
            Delivery::Egress(bytes)
        }
    }

    async fn deliver(&self, to: &str, bytes: Vec<u8>) {
        match self.route(to, bytes).await {
            Delivery::Internal(bytes) => self.inject(bytes).await,
            Delivery::Egress(bytes) => self.push_egress(bytes),
        }
    }

    /// Stages 1-4 (§4.2) plus lane assignment. Preprocessing failures never
    /// reach a handler; they resolve immediately into a `<huh>` addressed
    /// back to whatever sender could be recovered (§4.2 Scenario C, §8
    /// invariant 5: exactly one `<huh>` per malformed/unroutable message).
    async fn inject(&self, raw: Vec<u8>) {
        match preprocessing::ingress(&raw) {
            Ok(msg) => {
                let lane = msg
                    .envelope
                    .thread
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                self.ready.lock().unwrap().push(lane, msg);
            }
            Err(err) => {
                let sender = best_effort_sender(&raw);
                if let Some(sender) = sender {
                    let huh = system::build_huh(&err, &raw);
                    let envelope = build_envelope("core", "", Some(&sender), &huh);
                    self.push_egress(envelope);
                }
                // otherwise: no recoverable sender, silent drop (§4.2 Scenario C).
            }
        }
    }

    /// Pop one ready message and run it to however far it gets this tick:
    /// root-tag routing (with broadcast fan-out) for messages without a
    /// resolvable in-flight thread, or direct dispatch for continuations.
    async fn step(&self) -> bool {
        let msg = match self.ready.lock().unwrap().pop() {
            Some(m) => m,
            None => return false,
        };
        self.route_message(msg).await;
        true
    }

    async fn route_message(&self, msg: IngressedMessage) {
        let matches = self.registry.read().await.lookup_by_root(&msg.root_tag);
        if matches.is_empty() {
            let huh = system::build_huh(
                &crate::error::PreprocessError::UnknownRootTag(msg.root_tag.clone()),
                msg.envelope.payload.as_bytes(),
            );
            let envelope = build_envelope("core", "", Some(&msg.envelope.from), &huh);
            self.push_egress(envelope);
            return;
        }

        // Broadcast fan-out: every matching listener's dispatch is spawned
        // as its own task, so all N are initiated before any of them
        // completes (§5, Scenario E: "both pipelines execute concurrently")
        // rather than awaited one at a time.
        let inner = self
            .self_ref
            .upgrade()
            .expect("Inner outlives any in-flight route_message call");
        let mut handles = Vec::with_capacity(matches.len());
        for listener in matches {
            let inner = inner.clone();
            let payload_xml = msg.envelope.payload.clone();
            let from = msg.envelope.from.clone();
            let thread = msg.envelope.thread.clone();
            handles.push(tokio::spawn(async move {
                match preprocessing::validate_and_deserialize(&listener, &payload_xml) {
                    Ok(validated) => inner.dispatch_fresh(listener, from, thread, validated).await,
                    Err(err) => {
                        let huh = system::build_huh(&err, payload_xml.as_bytes());
                        let envelope = build_envelope("core", "", Some(&from), &huh);
                        inner.push_egress(envelope);
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Resolve (or allocate) the thread UUID for a freshly-routed message,
    /// then dispatch.
    async fn dispatch_fresh(
        &self,
        listener: Arc<Listener>,
        from: String,
        thread: Option<String>,
        payload: ValidatedPayload,
    ) {
        let existing = match &thread {
            Some(t) => self.threads.lock().await.lookup(t).is_some(),
            None => false,
        };
        let thread_id = if existing {
            thread.unwrap()
        } else {
            self.threads.lock().await.start_chain(&from, &listener.name)
        };
        self.dispatch(listener, thread_id, from, payload).await;
    }

    /// The dispatch sequence proper (§4.3): build `HandlerMetadata`,
    /// enforce the token budget, invoke the handler under a timeout, and
    /// route whatever it returns.
    ///
    /// Delivering a `Respond` recurses back into this same method for an
    /// internal caller (§4.3 step 5 applies uniformly to every re-injected
    /// message, responses included). Plain `async fn` recursion has no
    /// finite size, so this one is hand-boxed to break the cycle with
    /// [`Inner::apply_response`].
    fn dispatch<'a>(
        &'a self,
        listener: Arc<Listener>,
        thread_id: String,
        from_id: String,
        payload: ValidatedPayload,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let root_uuid = self
                .threads
                .lock()
                .await
                .root_of(&thread_id)
                .map(|s| s.to_string())
                .unwrap_or_else(|| thread_id.clone());
            let tokens = self.token_reporter_for(&root_uuid);

            if tokens.remaining() < 0 {
                self.fail_budget(&thread_id, &listener.name).await;
                return;
            }

            let is_self_call = self
                .threads
                .lock()
                .await
                .lookup(&thread_id)
                .map(|chain| chain.len() >= 2 && chain[chain.len() - 2] == listener.name)
                .unwrap_or(false);

            // Materialized at registration (§4.1); reading the live field
            // instead of recomputing keeps every dispatch from re-walking
            // every peer's prompt fragment.
            let usage_instructions = listener.cached_usage_instructions.clone();

            let cancellation = self
                .threads
                .lock()
                .await
                .token_for(&thread_id)
                .unwrap_or_else(CancellationToken::new);

            let ctx = HandlerMetadata {
                thread_id: thread_id.clone(),
                from_id,
                own_name: if listener.is_agent { Some(listener.name.clone()) } else { None },
                is_self_call,
                usage_instructions,
                tokens: tokens.clone(),
                cancellation: cancellation.clone(),
            };

            let permit = self
                .dispatch_permits
                .clone()
                .acquire_owned()
                .await
                .expect("dispatch semaphore is never closed");

            let handler = listener.handler.clone();
            let task: JoinHandle<HandlerResponse> =
                tokio::spawn(async move { handler.handle(payload, ctx).await });
            let abort_handle = task.abort_handle();

            let outcome = tokio::time::timeout(self.handler_timeout(&listener), task).await;
            drop(permit);

            match outcome {
                Err(_elapsed) => {
                    // The handler coroutine is cancelled, not merely
                    // abandoned (§5): cooperative cancellation for handlers
                    // that check the token, and a hard `abort` regardless.
                    cancellation.cancel();
                    abort_handle.abort();
                    self.fail_timeout(&thread_id, &listener.name).await;
                }
                Ok(Err(_join_error)) => self.fail_internal(&thread_id, &listener.name).await,
                Ok(Ok(response)) => self.apply_response(listener, thread_id, response).await,
            }
        })
    }

    async fn apply_response(&self, listener: Arc<Listener>, thread_id: String, response: HandlerResponse) {
        match response {
            HandlerResponse::Terminate => {
                self.threads.lock().await.terminate(&thread_id);
            }
            HandlerResponse::Respond { type_name, payload } => {
                let (caller_thread, caller_name) = match self.threads.lock().await.prune_for_response(&thread_id) {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let root_tag = crate::registry::derive_root_tag(&listener.name, &type_name);
                // A response's shape is the responder's own, not the
                // caller's registered input contract, so it cannot be
                // routed back through root-tag lookup or re-validated
                // against the caller's schema (§6). It is pump-trusted
                // already: deliver it straight to the caller's handler.
                match self.registry.read().await.lookup_by_name(&caller_name) {
                    Some(caller_listener) => {
                        let validated = ValidatedPayload { root_tag, value: payload };
                        self.dispatch(caller_listener, caller_thread, listener.name.clone(), validated)
                            .await;
                    }
                    None => {
                        let payload_xml = format!("<{root_tag}>{}</{root_tag}>", payload.to_xml_fields());
                        let bytes = build_envelope(&listener.name, &caller_thread, Some(&caller_name), &payload_xml);
                        self.push_egress(bytes);
                    }
                }
            }
            HandlerResponse::Forward { payload, to } => {
                if to == listener.name {
                    self.forward_self(listener, thread_id, payload).await;
                    return;
                }
                if listener.is_agent && !listener.peers.contains(&to) {
                    self.fail_routing(&thread_id, &listener.name).await;
                    return;
                }
                let target = self.registry.read().await.lookup_by_name(&to);
                let root_tag = match &target {
                    Some(t) => t.root_tag.clone(),
                    None => crate::registry::derive_root_tag(&to, "forward"),
                };
                let payload_xml = format!("<{root_tag}>{}</{root_tag}>", payload.to_xml_fields());
                let new_thread = match self.threads.lock().await.extend_chain(&thread_id, &to) {
                    Ok(t) => t,
                    Err(_) => return,
                };
                let bytes = build_envelope(&listener.name, &new_thread, Some(&to), &payload_xml);
                self.deliver(&to, bytes).await;
            }
        }
    }

    /// Self-iteration (Scenario F): a handler forwarding to its own name
    /// extends the chain rather than responding, and the extension is
    /// recorded so the next dispatch observes `is_self_call`.
    async fn forward_self(&self, listener: Arc<Listener>, thread_id: String, payload: PayloadValue) {
        let new_thread = match self.threads.lock().await.extend_chain(&thread_id, &listener.name) {
            Ok(t) => t,
            Err(_) => return,
        };
        let payload_xml = format!(
            "<{tag}>{body}</{tag}>",
            tag = listener.root_tag,
            body = payload.to_xml_fields(),
        );
        let bytes = build_envelope(&listener.name, &new_thread, Some(&listener.name), &payload_xml);
        self.deliver(&listener.name, bytes).await;
    }

    /// Runtime-error paths (§4.5, §7): a `SystemError` re-addressed to the
    /// offending listener's own thread, leaving the chain alive for retry
    /// except on budget exhaustion, which terminates it.
    async fn fail_timeout(&self, thread_id: &str, listener_name: &str) {
        self.emit_system_error(thread_id, listener_name, SystemErrorCode::Timeout, "handler timed out")
            .await;
    }

    async fn fail_internal(&self, thread_id: &str, listener_name: &str) {
        self.emit_system_error(
            thread_id,
            listener_name,
            SystemErrorCode::Validation,
            "handler failed internally",
        )
        .await;
    }

    async fn fail_routing(&self, thread_id: &str, listener_name: &str) {
        self.emit_system_error(
            thread_id,
            listener_name,
            SystemErrorCode::Routing,
            "forward target is not a declared peer",
        )
        .await;
    }

    async fn fail_budget(&self, thread_id: &str, listener_name: &str) {
        self.emit_system_error(
            thread_id,
            listener_name,
            SystemErrorCode::Budget,
            "thread token budget exhausted",
        )
        .await;
        self.threads.lock().await.terminate(thread_id);
    }

    /// `SystemError`s carry a core-namespace shape that never matches any
    /// listener's own registered schema, so — like `<huh>` — they bypass
    /// the handler dispatch path entirely and surface directly on egress
    /// for the embedding application to observe (§4.5, §9: the statically
    /// typed [`crate::handler::Handler`] surface has no slot for a shape
    /// outside a listener's own declared contract).
    async fn emit_system_error(&self, thread_id: &str, listener_name: &str, code: SystemErrorCode, message: &str) {
        let body = system::build_system_error(code, message);
        let bytes = build_envelope("core", thread_id, Some(listener_name), &body);
        self.push_egress(bytes);
    }
}

/// The pump. Owns the listener catalog, the thread registry, and the
/// ready queue; the only thing in this crate that runs on its own.
pub struct Pipeline {
    inner: Arc<Inner>,
    runner: StdMutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    pub fn new(registry: ListenerRegistry, threads: ThreadRegistry) -> Self {
        Self::with_config(registry, threads, PumpConfig::default())
    }

    pub fn with_config(registry: ListenerRegistry, threads: ThreadRegistry, config: PumpConfig) -> Self {
        let policy = config.thread_scheduling;
        let fairness_window = config.fairness_window;
        let max_concurrent_dispatch = config.max_concurrent_dispatch;
        let inner = Arc::new_cyclic(|weak| Inner {
            registry: RwLock::new(registry),
            threads: AsyncMutex::new(threads),
            config,
            ready: StdMutex::new(ReadyQueue::new(policy, fairness_window)),
            budgets: StdMutex::new(HashMap::new()),
            egress: StdMutex::new(VecDeque::new()),
            dispatch_permits: Arc::new(Semaphore::new(max_concurrent_dispatch.max(1))),
            self_ref: weak.clone(),
        });
        Self {
            inner,
            runner: StdMutex::new(None),
        }
    }

    pub async fn register(&self, spec: ListenerSpec) -> Result<(), PumpError> {
        self.inner.registry.write().await.register(spec).map_err(PumpError::from)
    }

    pub async fn unregister(&self, name: &str) -> Result<(), PumpError> {
        self.inner.registry.write().await.unregister(name).map_err(PumpError::from)
    }

    /// Submit raw bytes at the crate's one front door.
    pub async fn inject(&self, raw: Vec<u8>) -> Result<(), PumpError> {
        self.inner.inject(raw).await;
        Ok(())
    }

    /// Process exactly one ready message, if any. `true` if something ran.
    pub async fn run_one(&self) -> bool {
        self.inner.step().await
    }

    /// Drain the ready queue until empty. Every handler invocation that
    /// produces a follow-up message re-queues it, so this returns only
    /// once a round of dispatch has gone fully quiet — the shape this
    /// crate's test suite drives instead of a literal infinite loop.
    pub async fn run_until_quiescent(&self) {
        while self.inner.step().await {}
    }

    /// Start the background pump loop (mirrors `AgentPipeline::run`).
    /// Polls the ready queue, yielding briefly when it's empty so the
    /// loop doesn't spin a core for no reason.
    pub fn run(&self) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                if !inner.step().await {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        });
        *self.runner.lock().unwrap() = Some(handle);
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.runner.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Drain every envelope this pipeline has routed outside itself since
    /// the last call — `<huh>`s and `SystemError`s to unrecognized
    /// senders, and ordinary responses to non-listener targets.
    pub fn take_egress(&self) -> Vec<Vec<u8>> {
        self.inner.egress.lock().unwrap().drain(..).collect()
    }

    pub fn ready_is_empty(&self) -> bool {
        self.inner.ready.lock().unwrap().is_empty()
    }
}
