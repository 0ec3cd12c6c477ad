//! Resumable flow stepping.
//!
//! A flow program is replayed from the top on every step. The yield points
//! `send_email`, `wait` and `send_sms` count yields as the replay passes
//! them; the attributes observed between historical yields come from the
//! recorded snapshots, not from whatever the program wrote, so conditional
//! branches reproduce exactly. Reaching the target yield captures its
//! command and unwinds the script.

use std::cell::RefCell;
use std::rc::Rc;

use rhai::{Dynamic, Engine, EvalAltResult, Map, Position, Scope};
use segflow_core::command::{Command, WaitSpec};
use segflow_core::{EngineError, SegflowResult};

use crate::value::{from_dynamic, to_dynamic};

/// Result of advancing a flow by one yield.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Command produced at the target yield; `None` when the program
    /// returned first.
    pub command: Option<Command>,
    pub done: bool,
    /// The attribute document as the program left it.
    pub attributes: serde_json::Value,
}

const HALT_TOKEN: &str = "__segflow_step_halt";

struct StepState {
    yields_seen: usize,
    target: usize,
    attr_states: Vec<serde_json::Value>,
    attrs: Rc<RefCell<Dynamic>>,
    command: Option<Command>,
}

/// Bound as `ctx` in flow scope; `ctx.attributes` reads and writes the
/// shared attribute document.
#[derive(Clone)]
struct FlowCtx {
    attrs: Rc<RefCell<Dynamic>>,
}

pub(crate) fn step_flow(
    mut engine: Engine,
    flow_source: &str,
    attr_states: &[serde_json::Value],
    target_index: usize,
) -> SegflowResult<StepOutcome> {
    if attr_states.len() != target_index + 1 {
        return Err(EngineError::Sandbox(format!(
            "expected {} attribute snapshots for step {}, got {}",
            target_index + 1,
            target_index,
            attr_states.len()
        )));
    }

    let attrs = Rc::new(RefCell::new(to_dynamic(&attr_states[0])?));
    let state = Rc::new(RefCell::new(StepState {
        yields_seen: 0,
        target: target_index,
        attr_states: attr_states.to_vec(),
        attrs: attrs.clone(),
        command: None,
    }));

    engine
        .register_type_with_name::<FlowCtx>("FlowCtx")
        .register_get("attributes", |ctx: &mut FlowCtx| ctx.attrs.borrow().clone())
        .register_set("attributes", |ctx: &mut FlowCtx, value: Dynamic| {
            *ctx.attrs.borrow_mut() = value;
        });

    {
        let st = state.clone();
        engine.register_fn(
            "send_email",
            move |template_id: &str| -> Result<(), Box<EvalAltResult>> {
                yield_command(
                    &st,
                    Command::SendEmail {
                        template_id: template_id.to_string(),
                    },
                )
            },
        );
    }
    {
        let st = state.clone();
        engine.register_fn("wait", move |spec: Map| -> Result<(), Box<EvalAltResult>> {
            let duration = parse_wait_spec(spec)?;
            yield_command(&st, Command::Wait { duration })
        });
    }
    {
        let st = state.clone();
        engine.register_fn(
            "send_sms",
            move |message: &str| -> Result<(), Box<EvalAltResult>> {
                yield_command(
                    &st,
                    Command::SendSms {
                        message: message.to_string(),
                    },
                )
            },
        );
    }

    let mut scope = Scope::new();
    scope.push("ctx", FlowCtx {
        attrs: attrs.clone(),
    });

    let result = engine.eval_with_scope::<Dynamic>(&mut scope, flow_source);

    let attributes = from_dynamic(&attrs.borrow())?;
    match result {
        Ok(_) => Ok(StepOutcome {
            command: None,
            done: true,
            attributes,
        }),
        Err(err) if is_halt(&err) => {
            let command = state.borrow_mut().command.take();
            Ok(StepOutcome {
                command,
                done: false,
                attributes,
            })
        }
        Err(err) => Err(EngineError::Sandbox(err.to_string())),
    }
}

fn yield_command(
    state: &Rc<RefCell<StepState>>,
    command: Command,
) -> Result<(), Box<EvalAltResult>> {
    let mut st = state.borrow_mut();
    let index = st.yields_seen;
    st.yields_seen += 1;

    // >= instead of ==: a program that catches the halt and keeps yielding
    // is halted again rather than indexed past the snapshots.
    if index >= st.target {
        if st.command.is_none() {
            st.command = Some(command);
        }
        return Err(runtime_error(HALT_TOKEN));
    }

    // Historical replay: the next step observes its recorded snapshot.
    let next = st.attr_states[index + 1].clone();
    let rebound = rhai::serde::to_dynamic(&next).map_err(|e| runtime_error(&e.to_string()))?;
    *st.attrs.borrow_mut() = rebound;
    Ok(())
}

fn parse_wait_spec(map: Map) -> Result<WaitSpec, Box<EvalAltResult>> {
    let mut spec = WaitSpec::default();
    for (key, value) in map {
        let amount = value.as_int().map_err(|actual| {
            runtime_error(&format!(
                "wait component `{key}` must be an integer, got {actual}"
            ))
        })?;
        match key.as_str() {
            "seconds" => spec.seconds = amount,
            "minutes" => spec.minutes = amount,
            "hours" => spec.hours = amount,
            "days" => spec.days = amount,
            "weeks" => spec.weeks = amount,
            other => return Err(runtime_error(&format!("unknown wait component `{other}`"))),
        }
    }
    Ok(spec)
}

fn runtime_error(message: &str) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(message.to_string()),
        Position::NONE,
    ))
}

fn is_halt(err: &EvalAltResult) -> bool {
    match err {
        EvalAltResult::ErrorRuntime(token, _) => token
            .clone()
            .into_string()
            .map(|s| s == HALT_TOKEN)
            .unwrap_or(false),
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => is_halt(inner),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Sandbox;
    use serde_json::json;

    fn attrs(value: serde_json::Value) -> serde_json::Value {
        value
    }

    #[test]
    fn first_yield_produces_command() {
        let sandbox = Sandbox::new();
        let outcome = sandbox
            .step_flow(
                r#"send_email("welcome");"#,
                &[attrs(json!({"email": "a@x"}))],
                0,
            )
            .unwrap();
        assert!(!outcome.done);
        assert_eq!(
            outcome.command,
            Some(Command::SendEmail {
                template_id: "welcome".to_string()
            })
        );
    }

    #[test]
    fn program_return_reports_done() {
        let sandbox = Sandbox::new();
        let flow = r#"send_email("welcome");"#;
        let history = json!({"email": "a@x"});
        let live = json!({"email": "a@x"});
        let outcome = sandbox.step_flow(flow, &[history, live], 1).unwrap();
        assert!(outcome.done);
        assert!(outcome.command.is_none());
    }

    #[test]
    fn replay_reaches_later_yields() {
        let sandbox = Sandbox::new();
        let flow = r#"
            send_email("welcome");
            wait(#{seconds: 60});
            send_email("welcome");
        "#;
        let snapshot = json!({"email": "a@x"});
        let outcome = sandbox
            .step_flow(flow, &[snapshot.clone(), snapshot.clone()], 1)
            .unwrap();
        assert_eq!(
            outcome.command,
            Some(Command::Wait {
                duration: WaitSpec {
                    seconds: 60,
                    ..WaitSpec::default()
                }
            })
        );

        let outcome = sandbox
            .step_flow(flow, &[snapshot.clone(), snapshot.clone(), snapshot], 2)
            .unwrap();
        assert_eq!(
            outcome.command,
            Some(Command::SendEmail {
                template_id: "welcome".to_string()
            })
        );
    }

    #[test]
    fn attributes_rebind_between_yields() {
        let sandbox = Sandbox::new();
        // Branches on the attribute value observed at the second yield.
        let flow = r#"
            send_email("first");
            if ctx.attributes.vip == true {
                send_email("vip");
            } else {
                send_email("basic");
            }
        "#;
        let outcome = sandbox
            .step_flow(
                flow,
                &[json!({"vip": false}), json!({"vip": true})],
                1,
            )
            .unwrap();
        assert_eq!(
            outcome.command,
            Some(Command::SendEmail {
                template_id: "vip".to_string()
            })
        );
    }

    #[test]
    fn attribute_mutations_are_returned() {
        let sandbox = Sandbox::new();
        let flow = r#"
            ctx.attributes.welcomed = true;
            send_email("welcome");
        "#;
        let outcome = sandbox
            .step_flow(flow, &[json!({"email": "a@x"})], 0)
            .unwrap();
        assert_eq!(outcome.attributes["welcomed"], json!(true));
        assert_eq!(outcome.attributes["email"], json!("a@x"));
    }

    #[test]
    fn historical_snapshot_overrides_mutation_on_replay() {
        let sandbox = Sandbox::new();
        // The mutation happened before yield 0 on the first run; on replay
        // the recorded snapshot for step 1 is what the program observes.
        let flow = r#"
            ctx.attributes.counter = 99;
            send_email("first");
            if ctx.attributes.counter == 1 {
                send_email("recorded");
            } else {
                send_email("other");
            }
        "#;
        let outcome = sandbox
            .step_flow(flow, &[json!({"counter": 0}), json!({"counter": 1})], 1)
            .unwrap();
        assert_eq!(
            outcome.command,
            Some(Command::SendEmail {
                template_id: "recorded".to_string()
            })
        );
    }

    #[test]
    fn wait_accepts_all_components() {
        let sandbox = Sandbox::new();
        let outcome = sandbox
            .step_flow(
                r#"wait(#{days: 1, hours: 2});"#,
                &[json!({})],
                0,
            )
            .unwrap();
        assert_eq!(
            outcome.command,
            Some(Command::Wait {
                duration: WaitSpec {
                    days: 1,
                    hours: 2,
                    ..WaitSpec::default()
                }
            })
        );
    }

    #[test]
    fn unknown_wait_component_is_an_error() {
        let sandbox = Sandbox::new();
        let err = sandbox
            .step_flow(r#"wait(#{fortnights: 1});"#, &[json!({})], 0)
            .unwrap_err();
        assert!(matches!(err, EngineError::Sandbox(_)));
    }

    #[test]
    fn thrown_errors_surface_as_sandbox_errors() {
        let sandbox = Sandbox::new();
        let err = sandbox
            .step_flow(r#"throw "boom";"#, &[json!({})], 0)
            .unwrap_err();
        assert!(matches!(err, EngineError::Sandbox(_)));
    }

    #[test]
    fn send_sms_yields_its_command() {
        let sandbox = Sandbox::new();
        let outcome = sandbox
            .step_flow(r#"send_sms("hi");"#, &[json!({})], 0)
            .unwrap();
        assert_eq!(
            outcome.command,
            Some(Command::SendSms {
                message: "hi".to_string()
            })
        );
    }
}
