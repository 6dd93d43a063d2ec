//! Seam over the WASM runtime.
//!
//! The runtime itself is an external collaborator; the evaluator only
//! needs something that folds one hydrated message into a memory image.
//! Runtime output crosses a trust boundary and is schema-validated
//! before the evaluator consumes it.

use ao_core::message::{AoGlobal, EvalOutputRecord};
use ao_core::{Message, OutboundMessage};
use async_trait::async_trait;
use base64::prelude::*;
use serde::Deserialize;

use crate::error::{CuError, CuResult};

/// The validated result of folding one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WasmOutput {
    /// The next memory image. Replaces the current memory wholesale;
    /// modules receive ownership of the old image and hand back the new.
    pub memory: Option<Vec<u8>>,
    pub messages: Vec<OutboundMessage>,
    pub spawns: Vec<OutboundMessage>,
    pub output: serde_json::Value,
    /// Deterministic process-reported error. Recorded, never halts.
    pub error: Option<serde_json::Value>,
}

impl WasmOutput {
    pub fn into_record(self) -> (Option<Vec<u8>>, EvalOutputRecord) {
        let WasmOutput {
            memory,
            messages,
            spawns,
            output,
            error,
        } = self;
        (
            memory,
            EvalOutputRecord {
                messages,
                spawns,
                output,
                error,
            },
        )
    }
}

#[async_trait]
pub trait ProcessModule: Send + Sync {
    /// Fold `message` into `memory` under `env`, producing the next
    /// memory image and any outbound work.
    async fn eval(
        &self,
        memory: Option<Vec<u8>>,
        message: &Message,
        env: &AoGlobal,
    ) -> CuResult<WasmOutput>;
}

/// Parse and validate raw runtime output (memory transported as
/// base64). Malformed output is a schema violation, not a deterministic
/// process error.
pub fn parse_output(raw: serde_json::Value) -> CuResult<WasmOutput> {
    #[derive(Deserialize)]
    struct RawOutput {
        #[serde(default, rename = "Memory")]
        memory: Option<String>,
        #[serde(default, rename = "Messages")]
        messages: Vec<OutboundMessage>,
        #[serde(default, rename = "Spawns")]
        spawns: Vec<OutboundMessage>,
        #[serde(default, rename = "Output")]
        output: serde_json::Value,
        #[serde(default, rename = "Error")]
        error: Option<serde_json::Value>,
    }

    let parsed: RawOutput = serde_json::from_value(raw)
        .map_err(|e| CuError::schema("wasm evaluator output", e))?;
    let memory = parsed
        .memory
        .map(|b64| {
            BASE64_STANDARD
                .decode(b64)
                .map_err(|e| CuError::schema("wasm evaluator memory", e))
        })
        .transpose()?;
    Ok(WasmOutput {
        memory,
        messages: parsed.messages,
        spawns: parsed.spawns,
        output: parsed.output,
        error: parsed.error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn output_parses_with_defaults() {
        let out = parse_output(json!({ "Output": "ok" })).unwrap();
        assert!(out.memory.is_none());
        assert!(out.messages.is_empty());
        assert_eq!(out.output, json!("ok"));
    }

    #[test]
    fn memory_decodes_from_base64() {
        let out = parse_output(json!({
            "Memory": BASE64_STANDARD.encode(b"image"),
            "Messages": [{ "Target": "proc-2", "Tags": [] }],
        }))
        .unwrap();
        assert_eq!(out.memory.as_deref(), Some(b"image".as_ref()));
        assert_eq!(out.messages[0].target, "proc-2");
    }

    #[test]
    fn malformed_output_is_a_schema_violation() {
        let err = parse_output(json!({ "Messages": "not-a-list" })).unwrap_err();
        assert!(matches!(err, CuError::Schema { .. }));

        let err = parse_output(json!({ "Memory": "!!!" })).unwrap_err();
        assert!(matches!(err, CuError::Schema { .. }));
    }
}
