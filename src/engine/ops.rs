//! Ops the host runtime uses to report back to Rust. They are only
//! reachable from the host closure: `Deno` is deleted before user code runs.
use deno_core::{op2, OpState};
use tracing::debug;

/// Outcome of the synchronous render pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderReport {
    /// Serialized render tree.
    Mounted(String),
    Failed(String),
}

/// First error thrown by an effect after the synchronous pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectError(pub String);

#[op2(fast)]
pub fn op_sandbox_mount(state: &mut OpState, #[string] tree: &str) {
    if !state.has::<RenderReport>() {
        state.put(RenderReport::Mounted(tree.to_string()));
    }
}

#[op2(fast)]
pub fn op_sandbox_fail(state: &mut OpState, #[string] message: &str) {
    if !state.has::<RenderReport>() {
        state.put(RenderReport::Failed(message.to_string()));
    }
}

#[op2(fast)]
pub fn op_sandbox_effect_error(state: &mut OpState, #[string] message: &str) {
    if !state.has::<EffectError>() {
        state.put(EffectError(message.to_string()));
    }
}

/// Backs the `console` shim. Executed code never writes to stdout.
#[op2(fast)]
pub fn op_sandbox_console(#[string] level: &str, #[string] message: &str) {
    debug!(target: "frame_sandbox::console", console_level = level, "{message}");
}

deno_core::extension!(
    sandbox_ext,
    ops = [
        op_sandbox_mount,
        op_sandbox_fail,
        op_sandbox_effect_error,
        op_sandbox_console,
    ],
);
