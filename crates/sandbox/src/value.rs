use rhai::Dynamic;
use segflow_core::{EngineError, SegflowResult};

pub(crate) fn to_dynamic(value: &serde_json::Value) -> SegflowResult<Dynamic> {
    rhai::serde::to_dynamic(value).map_err(|e| EngineError::Sandbox(e.to_string()))
}

pub(crate) fn from_dynamic(value: &Dynamic) -> SegflowResult<serde_json::Value> {
    rhai::serde::from_dynamic(value).map_err(|e| EngineError::Sandbox(e.to_string()))
}
