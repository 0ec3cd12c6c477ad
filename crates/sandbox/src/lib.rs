//! Sandboxed evaluation of operator-authored sources.
//!
//! Two kinds of source run here: embedded-expression templates (subjects and
//! HTML bodies) and resumable flow programs. Each call builds a fresh rhai
//! engine with resource limits and no filesystem or network capability, and
//! disposes of it afterwards; no user code is ever cached.

mod flow;
mod template;
mod value;

use rhai::Engine;
use segflow_core::{EngineError, SegflowResult};

pub use flow::StepOutcome;

#[derive(Debug, Clone, Default)]
pub struct Sandbox;

impl Sandbox {
    pub fn new() -> Self {
        Self
    }

    fn engine() -> Engine {
        let mut engine = Engine::new();
        engine.set_max_operations(1_000_000);
        engine.set_max_call_levels(64);
        engine.set_max_string_size(1_000_000);
        engine.set_max_array_size(10_000);
        engine.set_max_map_size(10_000);
        engine
    }

    /// Render an embedded-expression template. `<%= expr %>` interpolates,
    /// `<% stmt %>` splices statements. The preamble runs before the body and
    /// its variables stay in scope; each entry of `vars` is bound as a
    /// top-level name.
    pub fn render(
        &self,
        source: &str,
        preamble: &str,
        vars: &[(&str, &serde_json::Value)],
    ) -> SegflowResult<String> {
        template::render(&Self::engine(), source, preamble, vars)
    }

    /// Drive a flow program from its beginning up to yield `target_index`,
    /// binding `attr_states[i]` to `ctx.attributes` just before the i-th
    /// yield. Returns the command produced at the target yield, or
    /// `done = true` when the program returns first.
    pub fn step_flow(
        &self,
        flow_source: &str,
        attr_states: &[serde_json::Value],
        target_index: usize,
    ) -> SegflowResult<StepOutcome> {
        flow::step_flow(Self::engine(), flow_source, attr_states, target_index)
    }

    /// Syntax-check an authored source without running it.
    pub fn compile_check(&self, source: &str) -> SegflowResult<()> {
        Self::engine()
            .compile(source)
            .map(|_| ())
            .map_err(|e| EngineError::Validation(format!("script does not compile: {e}")))
    }
}
