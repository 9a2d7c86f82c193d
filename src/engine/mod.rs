//! Execution engine: renders submitted components inside a fresh V8
//! isolate that can only see the capability scope.
//!
//! Each execution gets a brand new isolate on a dedicated thread
//! (isolates are `!Send`). The public API is async and `Send`-safe.
//!
//! Reporting follows two paths that never both fire for one request:
//!
//! - synchronous: compile, module evaluation and render either produce a
//!   tree (`"Component rendered successfully"`) or throw
//!   (`"React execution error: <message>"`);
//! - deferred: a failure that was not surfaced by the synchronous pass
//!   (the tree does not fit the container, or the worker died before
//!   reporting) is reported after `deferred_error_delay` as
//!   `"Render error: <message>"`.
//!
//! Effects scheduled during render run after the synchronous report.
//! Their failures are logged and dropped: the request is already answered.
pub mod compile;
pub mod jsx;
pub mod mount;
pub mod ops;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::capabilities::CapabilityScope;
use crate::config::EngineConfig;
use crate::protocol::Report;

use compile::Program;
use mount::{MountLimits, RenderTree};
use ops::{sandbox_ext, EffectError, RenderReport};

pub const SUCCESS_MESSAGE: &str = "Component rendered successfully";

pub const NO_CODE_MESSAGE: &str =
    "No code to execute. Make sure your code contains a React component.";

const HOST_RUNTIME: &str = include_str!("host.js");

/// Result of one `execute` call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Empty source. Informational only, never relayed.
    NoCode,
    Rendered(RenderTree),
    Failed(Failure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// Surfaced by the synchronous pass.
    Execution(String),
    /// Surfaced after the synchronous pass, via the deferred path.
    Render(String),
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Execution(message) => write!(f, "React execution error: {message}"),
            Self::Render(message) => write!(f, "Render error: {message}"),
        }
    }
}

impl Outcome {
    /// What gets relayed to the parent, if anything.
    pub fn report(&self) -> Option<Report> {
        match self {
            Self::NoCode => None,
            Self::Rendered(_) => Some(Report::Success(SUCCESS_MESSAGE.to_string())),
            Self::Failed(failure) => Some(Report::Failure(failure.to_string())),
        }
    }
}

/// Runs submitted source against a capability scope.
///
/// Implementations must produce exactly one outcome per call and must
/// never panic on hostile input.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn execute(&self, source: &str, scope: Arc<CapabilityScope>) -> Outcome;
}

/// V8-backed engine. One isolate per execution; nothing survives between calls.
pub struct IsolateEngine {
    config: EngineConfig,
}

impl IsolateEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    fn limits(&self) -> MountLimits {
        MountLimits {
            max_nodes: self.config.max_mount_nodes,
            max_depth: self.config.max_render_depth + 1,
            max_bytes: self.config.max_mount_bytes,
        }
    }

    async fn deferred(&self, message: String) -> Outcome {
        tokio::time::sleep(self.config.deferred_error_delay()).await;
        warn!("Component render failed after initial pass: {message}");
        Outcome::Failed(Failure::Render(message))
    }
}

#[async_trait]
impl ExecutionEngine for IsolateEngine {
    async fn execute(&self, source: &str, scope: Arc<CapabilityScope>) -> Outcome {
        if source.is_empty() {
            info!("{NO_CODE_MESSAGE}");
            return Outcome::NoCode;
        }
        if source.len() > self.config.max_code_size {
            return Outcome::Failed(Failure::Execution(format!(
                "Source is {} bytes, limit is {}",
                source.len(),
                self.config.max_code_size
            )));
        }

        let program = match compile::lower(source) {
            Ok(program) => program,
            Err(e) => return Outcome::Failed(Failure::Execution(e.to_string())),
        };
        if let Some(missing) = program
            .imports
            .iter()
            .find(|specifier| scope.resolve_import(specifier).is_none())
        {
            return Outcome::Failed(Failure::Execution(format!("Module not found: {missing}")));
        }

        let script = build_script(&program, &scope, self.config.max_render_depth);
        debug!(code_len = source.len(), "Rendering component");

        let (sync_rx, late_rx) = match spawn_worker(self.config.clone(), script) {
            Ok(channels) => channels,
            Err(e) => return self.deferred(format!("engine worker unavailable: {e}")).await,
        };

        match sync_rx.await {
            Ok(Ok(json)) => match RenderTree::from_json(&json, &self.limits()) {
                Ok(tree) => {
                    info!(nodes = tree.node_count(), "React component rendered successfully");
                    tokio::spawn(async move {
                        if let Ok(message) = late_rx.await {
                            warn!("Effect failed after render was reported, suppressed: {message}");
                        }
                    });
                    Outcome::Rendered(tree)
                }
                Err(e) => self.deferred(e.to_string()).await,
            },
            Ok(Err(message)) => {
                warn!("React execution failed: {message}");
                Outcome::Failed(Failure::Execution(message))
            }
            Err(_) => {
                let message = late_rx
                    .await
                    .unwrap_or_else(|_| "engine worker exited without reporting".to_string());
                self.deferred(message).await
            }
        }
    }
}

/// Assembles the single script run in the isolate: the host runtime
/// invoked with the capability table, the import map and the lowered body.
fn build_script(program: &Program, scope: &CapabilityScope, max_depth: usize) -> String {
    let capabilities = scope
        .capabilities()
        .map(|c| format!("{}: ({})", Value::String(c.symbol.clone()), c.source))
        .collect::<Vec<_>>()
        .join(",\n");
    let imports: serde_json::Map<String, Value> = scope
        .imports()
        .map(|(specifier, symbol)| (specifier.to_string(), Value::String(symbol.to_string())))
        .collect();
    let params: Vec<Value> = scope
        .symbols()
        .map(|symbol| Value::String(symbol.to_string()))
        .collect();

    format!(
        "({HOST_RUNTIME})(Deno.core.ops, Function, {{\n\
         capabilities: (host) => ({{\n{capabilities}\n}}),\n\
         imports: {},\n\
         params: {},\n\
         code: {},\n\
         maxDepth: {max_depth},\n\
         }});",
        Value::Object(imports),
        Value::Array(params),
        Value::String(program.body.clone()),
    )
}

type SyncReceiver = oneshot::Receiver<Result<String, String>>;
type LateReceiver = oneshot::Receiver<String>;

fn spawn_worker(
    config: EngineConfig,
    script: String,
) -> std::io::Result<(SyncReceiver, LateReceiver)> {
    let (sync_tx, sync_rx) = oneshot::channel();
    let (late_tx, late_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("sandbox-isolate".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = sync_tx.send(Err(format!("engine runtime unavailable: {e}")));
                    return;
                }
            };
            rt.block_on(run_isolate(&config, script, sync_tx, late_tx));
        })?;

    Ok((sync_rx, late_rx))
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// Terminates execution when the isolate nears its heap ceiling and
/// grants 1MB so the termination can propagate instead of aborting.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the boxed `HeapLimitState` owned by
    // `run_isolate`, which outlives the isolate's script execution.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

fn create_runtime(max_heap_size: usize) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, max_heap_size);
    JsRuntime::new(RuntimeOptions {
        extensions: vec![sandbox_ext::init()],
        create_params: Some(create_params),
        ..Default::default()
    })
}

/// Runs on the worker thread. Sends the synchronous result on `sync_tx`
/// as soon as the render pass finishes, then drives pending effects and
/// sends their first failure, if any, on `late_tx`.
async fn run_isolate(
    config: &EngineConfig,
    script: String,
    sync_tx: oneshot::Sender<Result<String, String>>,
    late_tx: oneshot::Sender<String>,
) {
    let mut runtime = create_runtime(config.max_heap_bytes());

    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog_timed_out = timed_out.clone();
    let timeout = config.timeout();
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();
    let watchdog = std::thread::spawn(move || {
        if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
            watchdog_timed_out.store(true, Ordering::SeqCst);
            watchdog_handle.terminate_execution();
        }
    });

    let executed = runtime.execute_script("[sandbox:render]", script);
    let report = runtime.op_state().borrow_mut().try_take::<RenderReport>();

    let interrupted = if heap_state.triggered.load(Ordering::SeqCst) {
        Some("Memory limit exceeded".to_string())
    } else if timed_out.load(Ordering::SeqCst) {
        Some(format!("Execution timed out after {}ms", config.timeout_ms))
    } else {
        None
    };

    let sync = match (report, executed) {
        (Some(RenderReport::Mounted(tree)), _) if interrupted.is_none() => Some(Ok(tree)),
        (Some(RenderReport::Failed(message)), _) => Some(Err(message)),
        (_, Err(e)) => Some(Err(interrupted.unwrap_or_else(|| e.to_string()))),
        (_, Ok(_)) => None,
    };

    match sync {
        Some(Ok(tree)) => {
            let _ = sync_tx.send(Ok(tree));
            let settled = tokio::time::timeout(
                timeout,
                runtime.run_event_loop(PollEventLoopOptions::default()),
            )
            .await;
            let effect_error = runtime.op_state().borrow_mut().try_take::<EffectError>();
            let late = match (effect_error, settled) {
                (Some(EffectError(message)), _) => Some(message),
                (None, Ok(Err(e))) => Some(e.to_string()),
                (None, Err(_)) => Some("effects did not settle before the timeout".to_string()),
                (None, Ok(Ok(()))) => None,
            };
            if let Some(message) = late {
                let _ = late_tx.send(message);
            }
        }
        Some(Err(message)) => {
            let _ = sync_tx.send(Err(message));
        }
        None => {
            drop(sync_tx);
            let _ = late_tx.send("component finished without producing output".to_string());
        }
    }

    // The watchdog holds an isolate handle; it must exit before the runtime drops.
    let _ = cancel_tx.send(());
    let _ = watchdog.join();

    // The isolate keeps a raw pointer to `heap_state` until it is disposed.
    drop(runtime);
    drop(heap_state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn engine() -> IsolateEngine {
        IsolateEngine::new(EngineConfig::default())
    }

    async fn run(engine: &IsolateEngine, source: &str) -> Outcome {
        engine
            .execute(source, Arc::new(CapabilityScope::builtin()))
            .await
    }

    fn failure(outcome: &Outcome) -> String {
        match outcome {
            Outcome::Failed(f) => f.to_string(),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    fn rendered(outcome: Outcome) -> RenderTree {
        match outcome {
            Outcome::Rendered(tree) => tree,
            other => panic!("expected rendered tree, got {other:?}"),
        }
    }

    #[test]
    fn test_engine_is_object_safe() {
        fn _assert_object_safe(_: &dyn ExecutionEngine) {}
    }

    #[test]
    fn test_outcome_reports() {
        assert_eq!(Outcome::NoCode.report(), None);
        assert_eq!(
            Outcome::Rendered(RenderTree::default()).report(),
            Some(Report::Success("Component rendered successfully".into()))
        );
        assert_eq!(
            Outcome::Failed(Failure::Execution("boom".into())).report(),
            Some(Report::Failure("React execution error: boom".into()))
        );
        assert_eq!(
            Outcome::Failed(Failure::Render("late".into())).report(),
            Some(Report::Failure("Render error: late".into()))
        );
    }

    #[tokio::test]
    async fn test_empty_source_is_no_code() {
        assert_eq!(run(&engine(), "").await, Outcome::NoCode);
    }

    #[tokio::test]
    async fn test_null_component_renders() {
        let tree = rendered(run(&engine(), "export default () => null;").await);
        assert!(tree.is_empty());
    }

    #[tokio::test]
    async fn test_throwing_component() {
        let outcome = run(
            &engine(),
            "export default () => { throw new Error('boom'); }",
        )
        .await;
        assert_eq!(failure(&outcome), "React execution error: boom");
    }

    #[tokio::test]
    async fn test_syntax_error_is_execution_error() {
        let outcome = run(&engine(), "export default () => {{;").await;
        assert!(failure(&outcome).starts_with("React execution error: "));
    }

    #[tokio::test]
    async fn test_missing_default_export() {
        let outcome = run(&engine(), "const App = () => null;").await;
        assert!(failure(&outcome).contains("No default export"));
    }

    #[tokio::test]
    async fn test_unregistered_import() {
        let outcome = run(&engine(), "import fs from 'fs';\nexport default () => null;").await;
        assert_eq!(failure(&outcome), "React execution error: Module not found: fs");
    }

    #[tokio::test]
    async fn test_renders_with_imported_capability() {
        let source = r#"
import React, { useState } from 'react';

export default function Counter() {
  const [count] = useState(3);
  return React.createElement('div', { className: 'counter' }, 'Count: ', count);
}
"#;
        let tree = rendered(run(&engine(), source).await);
        assert_eq!(tree.text(), "Count: 3");
        assert_eq!(tree.node_count(), 3);
    }

    #[tokio::test]
    async fn test_scope_symbols_without_imports() {
        let source = r#"
export default () => React.createElement(Recharts.LineChart, { width: 400 },
  React.createElement(ReactMarkdown, null, '# Title'));
"#;
        let tree = rendered(run(&engine(), source).await);
        match &tree.roots()[0] {
            mount::RenderNode::Element { kind, props, children } => {
                assert_eq!(kind, "LineChart");
                assert_eq!(props["width"], 400);
                assert_eq!(children.len(), 1);
            }
            other => panic!("unexpected root {other:?}"),
        }
        assert_eq!(tree.text(), "# Title");
    }

    #[tokio::test]
    async fn test_class_component() {
        let source = r#"
export default class Hello extends React.Component {
  render() { return React.createElement('p', null, 'hi ', this.props.name || 'there'); }
}
"#;
        let tree = rendered(run(&engine(), source).await);
        assert_eq!(tree.text(), "hi there");
    }

    #[tokio::test]
    async fn test_ambient_globals_are_unreachable() {
        let source = r#"
export default () => [
  typeof Deno,
  typeof __bootstrap,
  typeof __infra,
  typeof fetch,
  typeof eval,
  typeof Function,
  String((() => {}).constructor),
  String((async () => {}).constructor),
  String((function* () {}).constructor),
  String((async function* () {}).constructor),
].join(',');
"#;
        let tree = rendered(run(&engine(), source).await);
        assert_eq!(tree.text(), vec!["undefined"; 10].join(","));
    }

    #[tokio::test]
    async fn test_function_constructor_call_fails() {
        let outcome = run(&engine(), "export default () => Function('return 1')();").await;
        assert!(failure(&outcome).starts_with("React execution error: "));
    }

    #[tokio::test]
    async fn test_ops_unreachable_so_a_throw_cannot_be_masked() {
        let source = r#"
export default () => {
  try { __bootstrap.core.ops.op_sandbox_mount('["forged"]'); } catch (e) {}
  try { Deno.core.ops.op_sandbox_mount('["forged"]'); } catch (e) {}
  throw new Error('boom');
};
"#;
        assert_eq!(failure(&run(&engine(), source).await), "React execution error: boom");
    }

    #[tokio::test]
    async fn test_console_is_routed_away_from_stdout() {
        let source = r#"
export default () => {
  console.log(JSON.stringify({ targetOrigin: 'https://evil.example', message: {} }));
  console.error('x', { a: 1 }, undefined);
  console.log = null;
  globalThis.console = { log: () => {} };
  const log = String(console.log);
  return [log.includes('op_print'), log.includes('op_sandbox_console'), Object.isFrozen(console)].join(',');
};
"#;
        assert_eq!(rendered(run(&engine(), source).await).text(), "false,true,true");
    }

    #[tokio::test]
    async fn test_jsx_component_renders() {
        let source = r#"
import React from 'react';

export default function Greeting() {
  const items = ['a', 'b'];
  return (
    <div className="greeting">
      Hello <b>world</b>
      <ul>{items.map((item) => <li key={item}>{item}</li>)}</ul>
    </div>
  );
}
"#;
        let tree = rendered(run(&engine(), source).await);
        assert_eq!(tree.text(), "Hello worldab");
        match &tree.roots()[0] {
            mount::RenderNode::Element { kind, props, .. } => {
                assert_eq!(kind, "div");
                assert_eq!(props["className"], "greeting");
            }
            other => panic!("unexpected root {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_anonymous_class_component() {
        let source = r#"
export default class extends React.Component {
  render() { return <p>anon</p>; }
}
"#;
        assert_eq!(rendered(run(&engine(), source).await).text(), "anon");
    }

    #[tokio::test]
    async fn test_capabilities_are_frozen() {
        let source = "export default () => { React.createElement = null; return null; };";
        let outcome = run(&engine(), source).await;
        // Sloppy-mode assignment to a frozen property is silently ignored,
        // so the render still succeeds and the capability is intact.
        assert!(matches!(outcome, Outcome::Rendered(_)));

        let strict = "'use strict';\nexport default () => { React.createElement = null; return null; };";
        assert!(failure(&run(&engine(), strict).await).starts_with("React execution error: "));
    }

    #[tokio::test]
    async fn test_effect_failure_does_not_double_report() {
        let source = r#"
export default () => {
  React.useEffect(() => { throw new Error('late'); });
  return 'ok';
};
"#;
        let tree = rendered(run(&engine(), source).await);
        assert_eq!(tree.text(), "ok");
    }

    #[tokio::test]
    async fn test_mount_overflow_uses_deferred_path() {
        let engine = IsolateEngine::new(EngineConfig {
            max_mount_nodes: 1,
            deferred_error_delay_ms: 50,
            ..EngineConfig::default()
        });
        let started = Instant::now();
        let outcome = run(&engine, "export default () => ['a', 'b', 'c'];").await;
        assert!(failure(&outcome).starts_with("Render error: "));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let engine = IsolateEngine::new(EngineConfig {
            timeout_ms: 200,
            ..EngineConfig::default()
        });
        let outcome = run(&engine, "export default () => { while (true) {} };").await;
        assert_eq!(
            failure(&outcome),
            "React execution error: Execution timed out after 200ms"
        );
    }

    #[tokio::test]
    async fn test_heap_exhaustion_then_next_execution() {
        let engine = IsolateEngine::new(EngineConfig {
            max_heap_mb: 10,
            timeout_ms: 30_000,
            ..EngineConfig::default()
        });
        let hog = r#"export default () => { const keep = []; while (true) { keep.push(new Array(100000).fill("x")); } };"#;
        for _ in 0..3 {
            let outcome = run(&engine, hog).await;
            assert!(failure(&outcome).starts_with("React execution error: "));
            // Each isolate is torn down before its heap state; the next one starts clean.
            let tree = rendered(run(&engine, "export default () => 'after';").await);
            assert_eq!(tree.text(), "after");
        }
    }

    #[tokio::test]
    async fn test_oversized_source_rejected() {
        let engine = IsolateEngine::new(EngineConfig {
            max_code_size: 16,
            ..EngineConfig::default()
        });
        let outcome = run(&engine, "export default () => 'this is long';").await;
        assert!(failure(&outcome).contains("limit is 16"));
    }

    #[tokio::test]
    async fn test_isolates_do_not_share_state() {
        let engine = engine();
        let first = "globalThis.leak = 'x';\nexport default () => null;";
        rendered(run(&engine, first).await);
        let second = "export default () => typeof globalThis.leak;";
        assert_eq!(rendered(run(&engine, second).await).text(), "undefined");
    }
}
