//! Auto-responder pipeline
//!
//! Glues the match engine, the script runner and the delivery queue together.
//! Matching happens synchronously on the caller; everything after a match
//! runs in its own task so ingestion never waits on scripts or the radio.

use super::config::{ResponseType, TriggerDefinition};
use super::engine::{MatchResult, TriggerSet, TriggerStore};
use super::tokens;
use crate::logging::preview;
use crate::messages::{DeliveryQueue, NodeNum, QueueError, ReplyEnvelope};
use crate::scripts::{
    interpret, ExecutionContext, Position, ReplyPolicy, ScriptError, ScriptInvocation, ScriptRunner,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Characters of message text included in log lines
const LOG_PREVIEW_CHARS: usize = 60;

/// Errors raised while producing or queueing replies
#[derive(Debug, Error)]
pub enum ResponderError {
    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl ResponderError {
    pub fn is_soft(&self) -> bool {
        match self {
            Self::Script(e) => e.is_soft(),
            Self::Queue(_) => false,
        }
    }
}

/// A text message received from the mesh
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    pub text: String,
    pub from: NodeNum,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_id: Option<u32>,
    /// Last known position of the sender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl IncomingMessage {
    pub fn new(text: impl Into<String>, from: NodeNum) -> Self {
        Self {
            text: text.into(),
            from,
            packet_id: None,
            position: None,
        }
    }
}

/// Facts about the local radio, shared by every invocation
#[derive(Debug, Clone, Default)]
pub struct MeshContext {
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub local_position: Option<Position>,
    pub node_count: Option<usize>,
}

/// A direct script run from a timer or geofence
#[derive(Debug, Clone, Default)]
pub struct ScriptRequest {
    pub target: String,
    pub arguments: Option<String>,
    /// Node the run concerns
    pub node: Option<NodeNum>,
    /// Geofence name and event (`entry` / `exit`)
    pub geofence: Option<(String, String)>,
    /// Where to send any replies; `None` discards them
    pub reply_to: Option<NodeNum>,
}

impl ScriptRequest {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }
}

/// What happened to one incoming message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    NoMatch,
    /// Replies handed to the delivery queue
    Queued {
        trigger_id: String,
        replies: usize,
        evicted: usize,
    },
    /// Matched, but produced nothing to send
    NoReply { trigger_id: String },
    Failed {
        trigger_id: String,
        error: String,
        soft: bool,
    },
}

/// The auto-responder
pub struct AutoResponder {
    triggers: Arc<TriggerStore>,
    runner: Arc<dyn ScriptRunner>,
    queue: Arc<DeliveryQueue>,
    policy: ReplyPolicy,
    mesh: RwLock<MeshContext>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for AutoResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoResponder")
            .field("triggers", &self.triggers.snapshot().len())
            .field("queue", &self.queue)
            .field("policy", &self.policy)
            .field("mesh", &*self.mesh.read())
            .finish()
    }
}

impl AutoResponder {
    pub fn new(
        triggers: Arc<TriggerStore>,
        runner: Arc<dyn ScriptRunner>,
        queue: Arc<DeliveryQueue>,
        policy: ReplyPolicy,
    ) -> Self {
        Self {
            triggers,
            runner,
            queue,
            policy,
            mesh: RwLock::new(MeshContext::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_mesh_context(self, mesh: MeshContext) -> Self {
        *self.mesh.write() = mesh;
        self
    }

    /// Current local radio facts
    pub fn mesh_context(&self) -> MeshContext {
        self.mesh.read().clone()
    }

    /// Replace the local radio facts
    pub fn set_mesh_context(&self, mesh: MeshContext) {
        *self.mesh.write() = mesh;
    }

    pub fn triggers(&self) -> &Arc<TriggerStore> {
        &self.triggers
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    /// Swap in a new trigger list; in-flight matches keep their snapshot
    pub fn reload(&self, definitions: Vec<TriggerDefinition>) -> Arc<TriggerSet> {
        self.triggers.reload(definitions)
    }

    /// Cancel running scripts and stop accepting replies
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.queue.close();
    }

    /// Match synchronously and respond in the background.
    ///
    /// Returns `None` when no trigger matches.
    pub fn handle_message(self: &Arc<Self>, message: IncomingMessage) -> Option<JoinHandle<ResponseOutcome>> {
        let matched = self.triggers.snapshot().find_match(&message.text)?;
        let responder = Arc::clone(self);
        Some(tokio::spawn(async move {
            responder.dispatch(&message, &matched).await
        }))
    }

    /// Match and respond, waiting for the replies to be queued
    pub async fn respond(&self, message: &IncomingMessage) -> ResponseOutcome {
        match self.triggers.snapshot().find_match(&message.text) {
            Some(matched) => self.dispatch(message, &matched).await,
            None => ResponseOutcome::NoMatch,
        }
    }

    async fn dispatch(&self, message: &IncomingMessage, matched: &MatchResult) -> ResponseOutcome {
        let trigger_id = matched.trigger_id().to_string();
        match self.process(message, matched).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let soft = e.is_soft();
                if soft {
                    warn!(
                        trigger_id = %trigger_id,
                        node = %message.from,
                        message = %preview(&message.text, LOG_PREVIEW_CHARS),
                        error = %e,
                        "no reply sent"
                    );
                } else {
                    error!(
                        trigger_id = %trigger_id,
                        node = %message.from,
                        message = %preview(&message.text, LOG_PREVIEW_CHARS),
                        error = %e,
                        "trigger failed"
                    );
                }
                ResponseOutcome::Failed {
                    trigger_id,
                    error: e.to_string(),
                    soft,
                }
            }
        }
    }

    /// Produce replies for a match and queue them for the sender
    pub async fn process(
        &self,
        message: &IncomingMessage,
        matched: &MatchResult,
    ) -> Result<ResponseOutcome, ResponderError> {
        let trigger = &matched.trigger;
        info!(
            trigger_id = %trigger.id,
            node = %message.from,
            pattern = %matched.pattern,
            message = %preview(&message.text, LOG_PREVIEW_CHARS),
            "trigger matched"
        );

        let context = self.message_context(message, matched);
        let replies = match trigger.response_type {
            ResponseType::StaticText => {
                let text = tokens::expand(&trigger.response, &context.token_values());
                self.policy.apply(vec![text])
            }
            ResponseType::Script => {
                let invocation = ScriptInvocation::new(trigger.response.clone(), context)
                    .with_arguments(trigger.arguments.clone());
                self.run(&invocation).await?
            }
        };

        self.enqueue(message.from, replies, &trigger.id)
    }

    /// Run a script outside of message matching
    pub async fn run_script(&self, request: ScriptRequest) -> Result<Vec<String>, ResponderError> {
        let mesh = self.mesh.read().clone();
        let mut context = ExecutionContext::standalone()
            .with_mesh_endpoint(mesh.ip, mesh.port)
            .with_local_position(mesh.local_position);
        if let Some(count) = mesh.node_count {
            context = context.with_node_count(count);
        }
        if let Some(node) = request.node {
            context = context.with_node(node);
        }
        if let Some((name, event)) = request.geofence {
            context = context.with_geofence(name, event);
        }

        let invocation = ScriptInvocation::new(request.target.clone(), context)
            .with_arguments(request.arguments);
        let replies = self.run(&invocation).await?;

        match request.reply_to {
            Some(destination) => {
                self.enqueue(destination, replies.clone(), &request.target)?;
            }
            None if !replies.is_empty() => {
                debug!(script = %request.target, count = replies.len(), "replies discarded, no destination");
            }
            None => {}
        }
        Ok(replies)
    }

    async fn run(&self, invocation: &ScriptInvocation) -> Result<Vec<String>, ScriptError> {
        let result = self
            .runner
            .run(invocation, self.cancel.child_token())
            .await?;
        interpret(&result, &self.policy)
    }

    fn message_context(&self, message: &IncomingMessage, matched: &MatchResult) -> ExecutionContext {
        let mesh = self.mesh.read().clone();
        let mut context = ExecutionContext::for_message(message.text.clone(), message.from)
            .with_from_position(message.position)
            .with_local_position(mesh.local_position)
            .with_mesh_endpoint(mesh.ip, mesh.port)
            .with_match(matched.pattern.clone(), matched.bindings.clone());
        if let Some(id) = message.packet_id {
            context = context.with_packet_id(id);
        }
        if let Some(count) = mesh.node_count {
            context = context.with_node_count(count);
        }
        context
    }

    fn enqueue(
        &self,
        destination: NodeNum,
        replies: Vec<String>,
        trigger_id: &str,
    ) -> Result<ResponseOutcome, ResponderError> {
        if replies.is_empty() {
            debug!(trigger_id = %trigger_id, "nothing to send");
            return Ok(ResponseOutcome::NoReply {
                trigger_id: trigger_id.to_string(),
            });
        }

        let count = replies.len();
        let batch = ReplyEnvelope::batch(destination, replies, Some(trigger_id));
        let report = self.queue.enqueue_batch(batch)?;
        debug!(
            trigger_id = %trigger_id,
            node = %destination,
            replies = count,
            pending = self.queue.len(),
            "replies queued"
        );

        Ok(ResponseOutcome::Queued {
            trigger_id: trigger_id.to_string(),
            replies: count,
            evicted: report.evicted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::OverflowPolicy;
    use crate::scripts::ScriptResult;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Runner that returns canned stdout and records invocations
    struct CannedRunner {
        stdout: String,
        exit_code: i32,
        seen: Mutex<Vec<ScriptInvocation>>,
    }

    impl CannedRunner {
        fn new(stdout: &str) -> Self {
            Self::exiting(stdout, 0)
        }

        fn exiting(stdout: &str, exit_code: i32) -> Self {
            Self {
                stdout: stdout.to_string(),
                exit_code,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ScriptRunner for CannedRunner {
        async fn run(
            &self,
            invocation: &ScriptInvocation,
            _cancel: CancellationToken,
        ) -> Result<ScriptResult, ScriptError> {
            self.seen.lock().push(invocation.clone());
            Ok(ScriptResult {
                exit_code: Some(self.exit_code),
                success: self.exit_code == 0,
                stdout: self.stdout.as_bytes().to_vec(),
                stderr: Vec::new(),
                duration: Duration::from_millis(1),
                truncated: false,
            })
        }
    }

    fn responder(triggers: Vec<TriggerDefinition>, runner: Arc<dyn ScriptRunner>) -> AutoResponder {
        AutoResponder::new(
            Arc::new(TriggerStore::new(triggers)),
            runner,
            Arc::new(DeliveryQueue::new(10, OverflowPolicy::RejectNew)),
            ReplyPolicy::default(),
        )
    }

    fn drain(queue: &DeliveryQueue) -> Vec<ReplyEnvelope> {
        std::iter::from_fn(|| queue.pop()).collect()
    }

    #[tokio::test]
    async fn test_static_text_reply_with_tokens() {
        let r = responder(
            vec![TriggerDefinition::text("hi", "hello {name}", "Hi {name}, v{VERSION}")],
            Arc::new(CannedRunner::new("{}")),
        );

        let outcome = r.respond(&IncomingMessage::new("hello bob", NodeNum(5))).await;
        assert_eq!(
            outcome,
            ResponseOutcome::Queued {
                trigger_id: "hi".to_string(),
                replies: 1,
                evicted: 0
            }
        );
        let sent = drain(r.queue());
        assert_eq!(sent[0].text, format!("Hi bob, v{}", env!("CARGO_PKG_VERSION")));
        assert_eq!(sent[0].destination, NodeNum(5));
    }

    #[tokio::test]
    async fn test_node_count_update_reaches_static_text() {
        let r = responder(
            vec![TriggerDefinition::text("nodes", "nodes", "{NODECOUNT} nodes heard")],
            Arc::new(CannedRunner::new("{}")),
        );

        r.respond(&IncomingMessage::new("nodes", NodeNum(1))).await;
        assert_eq!(r.queue().pop().unwrap().text, " nodes heard");

        let mut mesh = r.mesh_context();
        mesh.node_count = Some(17);
        r.set_mesh_context(mesh);

        r.respond(&IncomingMessage::new("nodes", NodeNum(1))).await;
        assert_eq!(r.queue().pop().unwrap().text, "17 nodes heard");
    }

    #[tokio::test]
    async fn test_script_replies_queued_in_order() {
        let runner = Arc::new(CannedRunner::new(r#"{"responses":["a","b","c"]}"#));
        let r = responder(
            vec![TriggerDefinition::script("lorem", "lorem", "lorem.py")],
            runner.clone(),
        );

        r.respond(&IncomingMessage::new("lorem", NodeNum(9))).await;
        let texts: Vec<_> = drain(r.queue()).into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_script_receives_params_and_mesh_context() {
        let runner = Arc::new(CannedRunner::new(r#"{"response":"ok"}"#));
        let r = responder(
            vec![TriggerDefinition::script("w", "weather {location:.+}", "weather.py")
                .with_arguments("--at {location} --host {IP}")],
            runner.clone(),
        )
        .with_mesh_context(MeshContext {
            ip: Some("10.0.0.5".to_string()),
            port: Some(4403),
            ..MeshContext::default()
        });

        let mut msg = IncomingMessage::new("weather Austin TX", NodeNum(0xabcd));
        msg.packet_id = Some(42);
        r.respond(&msg).await;

        let seen = runner.seen.lock();
        let inv = &seen[0];
        assert_eq!(inv.target, "weather.py");
        assert_eq!(inv.argv(), vec!["--at", "Austin", "TX", "--host", "10.0.0.5"]);
        let env: std::collections::HashMap<_, _> = inv.context.env().into_iter().collect();
        assert_eq!(env["PARAM_location"], "Austin TX");
        assert_eq!(env["PACKET_ID"], "42");
        assert_eq!(env["TRIGGER"], "weather {location:.+}");
        assert_eq!(env["MESHTASTIC_PORT"], "4403");
    }

    #[tokio::test]
    async fn test_no_match() {
        let r = Arc::new(responder(
            vec![TriggerDefinition::text("hi", "hello", "hey")],
            Arc::new(CannedRunner::new("{}")),
        ));
        assert_eq!(
            r.respond(&IncomingMessage::new("goodbye", NodeNum(1))).await,
            ResponseOutcome::NoMatch
        );
        assert!(r.handle_message(IncomingMessage::new("goodbye", NodeNum(1))).is_none());
    }

    #[tokio::test]
    async fn test_soft_failure_sends_nothing() {
        let r = responder(
            vec![TriggerDefinition::script("admin", "admin {cmd}", "remote-admin.py")],
            Arc::new(CannedRunner::exiting(r#"{"success":false,"error":"no host"}"#, 1)),
        );
        let outcome = r.respond(&IncomingMessage::new("admin reboot", NodeNum(1))).await;
        assert!(matches!(outcome, ResponseOutcome::Failed { soft: true, .. }));
        assert!(r.queue().is_empty());
    }

    #[tokio::test]
    async fn test_hard_failure_sends_nothing() {
        let r = responder(
            vec![TriggerDefinition::script("crash", "crash", "crash.py")],
            Arc::new(CannedRunner::exiting("Traceback", 2)),
        );
        let outcome = r.respond(&IncomingMessage::new("crash", NodeNum(1))).await;
        assert!(matches!(outcome, ResponseOutcome::Failed { soft: false, .. }));
        assert!(r.queue().is_empty());
    }

    #[tokio::test]
    async fn test_empty_responses_is_no_reply() {
        let r = responder(
            vec![TriggerDefinition::script("quiet", "quiet", "quiet.sh")],
            Arc::new(CannedRunner::new(r#"{"responses":[]}"#)),
        );
        assert_eq!(
            r.respond(&IncomingMessage::new("quiet", NodeNum(1))).await,
            ResponseOutcome::NoReply {
                trigger_id: "quiet".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_handle_message_runs_in_background() {
        let r = Arc::new(responder(
            vec![TriggerDefinition::text("ping", "ping", "pong")],
            Arc::new(CannedRunner::new("{}")),
        ));
        let handle = r
            .handle_message(IncomingMessage::new("ping", NodeNum(3)))
            .unwrap();
        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, ResponseOutcome::Queued { replies: 1, .. }));
    }

    #[tokio::test]
    async fn test_run_script_geofence_context() {
        let runner = Arc::new(CannedRunner::new(r#"{"response":"entered"}"#));
        let r = responder(Vec::new(), runner.clone());

        let replies = r
            .run_script(ScriptRequest {
                node: Some(NodeNum(0xbeef)),
                geofence: Some(("Home".to_string(), "entry".to_string())),
                reply_to: Some(NodeNum(0xbeef)),
                ..ScriptRequest::new("geofence.sh")
            })
            .await
            .unwrap();
        assert_eq!(replies, vec!["entered"]);
        assert_eq!(r.queue().len(), 1);

        let env: std::collections::HashMap<_, _> =
            runner.seen.lock()[0].context.env().into_iter().collect();
        assert_eq!(env["GEOFENCE_NAME"], "Home");
        assert_eq!(env["GEOFENCE_EVENT"], "entry");
        assert_eq!(env["NODE_ID"], "!0000beef");
        assert!(!env.contains_key("MESSAGE"));
    }

    #[tokio::test]
    async fn test_queue_full_is_hard_failure() {
        let r = AutoResponder::new(
            Arc::new(TriggerStore::new(vec![TriggerDefinition::script(
                "many", "many", "many.sh",
            )])),
            Arc::new(CannedRunner::new(r#"{"responses":["1","2","3"]}"#)),
            Arc::new(DeliveryQueue::new(2, OverflowPolicy::RejectNew)),
            ReplyPolicy::default(),
        );
        let outcome = r.respond(&IncomingMessage::new("many", NodeNum(1))).await;
        assert!(matches!(outcome, ResponseOutcome::Failed { soft: false, .. }));
    }

    #[tokio::test]
    async fn test_reload_changes_matching() {
        let r = responder(
            vec![TriggerDefinition::text("a", "one", "first")],
            Arc::new(CannedRunner::new("{}")),
        );
        r.reload(vec![TriggerDefinition::text("b", "two", "second")]);
        assert_eq!(
            r.respond(&IncomingMessage::new("one", NodeNum(1))).await,
            ResponseOutcome::NoMatch
        );
        assert!(matches!(
            r.respond(&IncomingMessage::new("two", NodeNum(1))).await,
            ResponseOutcome::Queued { .. }
        ));
    }
}
