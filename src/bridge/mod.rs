//! Execution bridge: owns the sandbox's state machine and connects the
//! message channel to the engine.
//!
//! `Uninitialized → Ready → Executing → Ready`. All state lives on the
//! event loop in [`ExecutionBridge::run`]; executions run as separate
//! tasks and report back through an internal channel, so a slow render
//! never blocks the next message. Executions themselves run one at a
//! time, in arrival order.
pub mod session;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::capabilities::CapabilityScope;
use crate::config::Config;
use crate::engine::mount::MountPoint;
use crate::engine::{ExecutionEngine, Failure, Outcome, SUCCESS_MESSAGE};
use crate::frame::{MessageListener, MessagePort};
use crate::protocol::{Envelope, EnvelopeValidator, FrameEvent};

pub use session::{ExecutionSession, SessionStatus, StatusLine};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeState {
    Uninitialized,
    Ready,
    Executing { execution_id: String },
}

/// Outcome of one execution, tagged with the request it answers.
#[derive(Debug)]
pub struct Completion {
    pub execution_id: String,
    pub outcome: Outcome,
}

/// Per-broadcast delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub delivered: usize,
    pub failed: usize,
}

pub struct ExecutionBridge {
    config: Arc<Config>,
    validator: EnvelopeValidator,
    scope: Arc<CapabilityScope>,
    engine: Arc<dyn ExecutionEngine>,
    port: Arc<dyn MessagePort>,
    state: BridgeState,
    session: Option<ExecutionSession>,
    status: StatusLine,
    mount: MountPoint,
    /// Single permit, held for the whole engine run.
    execution_slot: Arc<Semaphore>,
    outcome_tx: mpsc::UnboundedSender<Completion>,
    outcome_rx: mpsc::UnboundedReceiver<Completion>,
}

enum Step {
    Event(Option<FrameEvent>),
    Completed(Completion),
}

impl ExecutionBridge {
    pub fn new(
        config: Arc<Config>,
        scope: Arc<CapabilityScope>,
        engine: Arc<dyn ExecutionEngine>,
        port: Arc<dyn MessagePort>,
    ) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            validator: EnvelopeValidator::new(config.clone()),
            config,
            scope,
            engine,
            port,
            state: BridgeState::Uninitialized,
            session: None,
            status: StatusLine::Waiting,
            mount: MountPoint::new(),
            execution_slot: Arc::new(Semaphore::new(1)),
            outcome_tx,
            outcome_rx,
        }
    }

    pub fn state(&self) -> &BridgeState {
        &self.state
    }

    pub fn session(&self) -> Option<&ExecutionSession> {
        self.session.as_ref()
    }

    pub fn status(&self) -> &StatusLine {
        &self.status
    }

    pub fn mount_point(&self) -> &MountPoint {
        &self.mount
    }

    /// Announces readiness to every allowed origin. Only the first call
    /// has any effect.
    pub fn start(&mut self) {
        if self.state != BridgeState::Uninitialized {
            debug!("Bridge already started");
            return;
        }
        let report = self.relay(&Envelope::ready());
        self.state = BridgeState::Ready;
        self.status = StatusLine::Waiting;
        info!(
            delivered = report.delivered,
            failed = report.failed,
            "Sandbox ready message sent"
        );
    }

    /// Handles one inbound message event. Rejected events are dropped
    /// without a reply.
    pub fn on_message(&mut self, event: FrameEvent) {
        if self.state == BridgeState::Uninitialized {
            debug!(origin = %event.origin, "Bridge not started, message dropped");
            return;
        }
        let Ok(request) = self.validator.validate(&event) else {
            return;
        };

        if request.code.is_empty() {
            info!(execution_id = %request.execution_id, "Request carried no code");
            self.status = StatusLine::NoCode;
            return;
        }

        if let BridgeState::Executing { execution_id } = &self.state {
            debug!(
                superseded = %execution_id,
                execution_id = %request.execution_id,
                "New request supersedes the running execution"
            );
        }

        let session = ExecutionSession::new(&request.execution_id, &request.code);
        info!(
            execution_id = %session.execution_id,
            "Executing code: {}",
            session.preview().chars().take(100).collect::<String>()
        );
        self.status = StatusLine::Executing(session.execution_id.clone());
        self.state = BridgeState::Executing {
            execution_id: session.execution_id.clone(),
        };
        self.spawn_execution(&session);
        self.session = Some(session);
    }

    fn spawn_execution(&self, session: &ExecutionSession) {
        let engine = self.engine.clone();
        let scope = self.scope.clone();
        let slot = self.execution_slot.clone();
        let outcome_tx = self.outcome_tx.clone();
        let execution_id = session.execution_id.clone();
        let code = session.source_code.clone();

        tokio::spawn(async move {
            // FIFO: queued requests run in the order they arrived.
            let Ok(_permit) = slot.acquire_owned().await else {
                error!(execution_id = %execution_id, "Execution slot closed");
                return;
            };
            debug!(execution_id = %execution_id, "Execution slot acquired");
            let outcome = match AssertUnwindSafe(engine.execute(&code, scope))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(execution_id = %execution_id, "Execution engine panicked");
                    Outcome::Failed(Failure::Render("execution engine crashed".to_string()))
                }
            };
            // The receiver lives as long as the bridge.
            let _ = outcome_tx.send(Completion {
                execution_id,
                outcome,
            });
        });
    }

    /// Relays the outcome under its own id. Only the current session's
    /// outcome moves the state machine.
    pub fn complete(&mut self, completion: Completion) {
        let Completion {
            execution_id,
            outcome,
        } = completion;
        let Some(report) = outcome.report() else {
            return;
        };
        self.relay(&Envelope::result(&execution_id, report));

        let current = matches!(
            &self.state,
            BridgeState::Executing { execution_id: id } if *id == execution_id
        );
        if !current {
            info!(execution_id = %execution_id, "Relayed result of a superseded execution");
            return;
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        match outcome {
            Outcome::Rendered(tree) => {
                session.succeed(SUCCESS_MESSAGE);
                self.mount.mount(&execution_id, tree);
                self.status = StatusLine::Completed;
            }
            Outcome::Failed(failure) => {
                let message = failure.to_string();
                session.fail(&message);
                self.mount.unmount();
                self.status = StatusLine::Failed(message);
            }
            Outcome::NoCode => {}
        }
        self.state = BridgeState::Ready;
    }

    /// Broadcasts `envelope` once per allowed origin. A failed send is
    /// logged and never retried; the remaining origins are still tried.
    pub fn relay(&self, envelope: &Envelope) -> RelayReport {
        let mut report = RelayReport::default();
        for origin in &self.config.sandbox.allowed_origins {
            match self.port.post_message(envelope, origin) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(origin = %origin, "Failed to send message: {e}");
                }
            }
        }
        debug!(
            message_type = ?envelope.kind,
            execution_id = %envelope.execution_id,
            delivered = report.delivered,
            "Message sent to allowed origins"
        );
        report
    }

    /// Runs the bridge until the listener closes, then detaches it and
    /// returns to `Uninitialized`.
    pub async fn run(mut self, mut listener: MessageListener) -> anyhow::Result<()> {
        self.start();
        info!("Execution bridge started, waiting for messages...");

        loop {
            let step = tokio::select! {
                event = listener.recv() => Step::Event(event),
                Some(completion) = self.outcome_rx.recv() => Step::Completed(completion),
            };
            match step {
                Step::Event(Some(event)) => self.on_message(event),
                Step::Event(None) => break,
                Step::Completed(completion) => self.complete(completion),
            }
        }

        drop(listener);
        self.teardown();
        info!("Message channel closed, bridge stopped");
        Ok(())
    }

    fn teardown(&mut self) {
        self.session = None;
        self.mount.unmount();
        self.state = BridgeState::Uninitialized;
    }
}
