//! Resolution of a step's input payload from trigger data, static config and
//! upstream outputs.

use crate::error::{Result, WorkflowError};
use crate::types::{Payload, StepDeclaration, StepId};
use crate::workflow::context::ExecutionContext;
use crate::workflow::dag::DependencyGraph;
use serde_json::Value;

/// Reserved producer id addressing the run's trigger payload
pub const TRIGGER_REF: &str = "trigger";

/// Config key holding a step's static input
pub const STATIC_INPUT_KEY: &str = "input_data";

/// Outcome of resolving one mapping value
#[derive(Debug, Clone, PartialEq)]
enum Resolved {
    Value(Value),
    /// Reference to a producer that has no data (not run yet, or failed)
    Missing(String),
}

/// Builds the input payload for a step.
///
/// Layering, lowest first: trigger payload (entry steps only), each resolved
/// `input_mapping` entry, then the step's static `config.input_data`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InputCollector {
    strict: bool,
}

impl InputCollector {
    /// Missing references are dropped from the input
    pub fn new() -> Self {
        Self { strict: false }
    }

    /// Missing references become `InputResolution` errors
    pub fn strict() -> Self {
        Self { strict: true }
    }

    pub fn with_strict(strict: bool) -> Self {
        Self { strict }
    }

    pub fn collect(
        &self,
        ctx: &ExecutionContext,
        graph: &DependencyGraph,
        step: &StepDeclaration,
    ) -> Result<Payload> {
        let mut input = Payload::new();

        if step.dependencies.is_empty() {
            input.extend(ctx.trigger().clone());
        }

        for (key, source) in &step.input_mapping {
            match resolve_source(ctx, graph, source) {
                Resolved::Value(value) => {
                    input.insert(key.clone(), value);
                }
                Resolved::Missing(reference) => {
                    if self.strict {
                        return Err(WorkflowError::InputResolution {
                            step_id: step.step_id.clone(),
                            key: key.clone(),
                            reference,
                        });
                    }
                    tracing::debug!(
                        "Omitting input {} for step {}: {} has no data",
                        key,
                        step.step_id,
                        reference
                    );
                }
            }
        }

        if let Some(Value::Object(static_input)) = step.config.get(STATIC_INPUT_KEY) {
            input.extend(static_input.clone());
        }

        Ok(input)
    }
}

fn resolve_source(ctx: &ExecutionContext, graph: &DependencyGraph, source: &Value) -> Resolved {
    let Value::String(reference) = source else {
        return Resolved::Value(source.clone());
    };

    // Bare producer reference
    if let Some(resolved) = lookup(ctx, graph, reference, None) {
        return resolved;
    }

    // `producer.field`
    if let Some((producer, field)) = reference.split_once('.') {
        if let Some(resolved) = lookup(ctx, graph, producer, Some(field)) {
            return resolved;
        }
    }

    Resolved::Value(source.clone())
}

/// Look up a producer's output. Returns `None` when `producer` does not name a
/// step of the workflow (or the trigger), meaning the string is a literal.
fn lookup(
    ctx: &ExecutionContext,
    graph: &DependencyGraph,
    producer: &str,
    field: Option<&str>,
) -> Option<Resolved> {
    let data = if producer == TRIGGER_REF {
        Value::Object(ctx.trigger().clone())
    } else {
        let producer_id = StepId::new(producer);
        match ctx.step_output(&producer_id) {
            Some(data) => data.clone(),
            None if graph.contains(&producer_id) => {
                return Some(Resolved::Missing(producer.to_string()))
            }
            None => return None,
        }
    };

    let Some(field) = field else {
        return Some(Resolved::Value(data));
    };

    match data.get(field) {
        Some(value) if data.is_object() => Some(Resolved::Value(value.clone())),
        // Degrade to the whole producer output when the field is absent
        _ => Some(Resolved::Value(data)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionId;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn setup(trigger: Value) -> (ExecutionContext, DependencyGraph) {
        let steps = vec![
            StepDeclaration::new("a", "data_input"),
            StepDeclaration::new("z", "data_input"),
            StepDeclaration::new("consumer", "transformation").depends_on(["a"]),
        ];
        let graph = DependencyGraph::build(&steps).unwrap();
        let mut ctx = ExecutionContext::new(ExecutionId::new(), payload(trigger));
        ctx.mark_completed(&StepId::new("a"), json!({"x": 1, "y": 2}));
        (ctx, graph)
    }

    fn consumer() -> StepDeclaration {
        StepDeclaration::new("consumer", "transformation").depends_on(["a"])
    }

    #[test]
    fn test_field_reference_resolves_value() {
        let (ctx, graph) = setup(json!({}));
        let step = consumer().map_input("foo", "a.y");

        let input = InputCollector::new().collect(&ctx, &graph, &step).unwrap();
        assert_eq!(Value::Object(input), json!({"foo": 2}));
    }

    #[test]
    fn test_bare_reference_resolves_whole_output() {
        let (ctx, graph) = setup(json!({}));
        let step = consumer().map_input("foo", "a");

        let input = InputCollector::new().collect(&ctx, &graph, &step).unwrap();
        assert_eq!(Value::Object(input), json!({"foo": {"x": 1, "y": 2}}));
    }

    #[test]
    fn test_missing_producer_is_omitted() {
        let (ctx, graph) = setup(json!({}));
        let step = consumer().map_input("foo", "z.w").map_input("bar", "a.x");

        let input = InputCollector::new().collect(&ctx, &graph, &step).unwrap();
        assert_eq!(Value::Object(input), json!({"bar": 1}));
    }

    #[test]
    fn test_strict_mode_rejects_missing_producer() {
        let (ctx, graph) = setup(json!({}));
        let step = consumer().map_input("foo", "z.w");

        let result = InputCollector::strict().collect(&ctx, &graph, &step);
        match result {
            Err(WorkflowError::InputResolution { key, reference, .. }) => {
                assert_eq!(key, "foo");
                assert_eq!(reference, "z");
            }
            other => panic!("expected input resolution error, got {other:?}"),
        }
    }

    #[test]
    fn test_absent_field_falls_back_to_whole_output() {
        let (ctx, graph) = setup(json!({}));
        let step = consumer().map_input("foo", "a.nope");

        let input = InputCollector::new().collect(&ctx, &graph, &step).unwrap();
        assert_eq!(input["foo"], json!({"x": 1, "y": 2}));
    }

    #[test]
    fn test_non_reference_values_pass_through() {
        let (ctx, graph) = setup(json!({}));
        let step = consumer()
            .map_input("version", "v1.2")
            .map_input("mode", "fast")
            .map_input("limit", 5);

        let input = InputCollector::new().collect(&ctx, &graph, &step).unwrap();
        assert_eq!(
            Value::Object(input),
            json!({"version": "v1.2", "mode": "fast", "limit": 5})
        );
    }

    #[test]
    fn test_trigger_is_base_layer_for_entry_steps_only() {
        let (ctx, graph) = setup(json!({"text": "hello", "history": []}));

        let entry = StepDeclaration::new("z", "data_input")
            .with_config(STATIC_INPUT_KEY, json!({"history": ["seed"], "lang": "en"}));
        let input = InputCollector::new().collect(&ctx, &graph, &entry).unwrap();
        assert_eq!(
            Value::Object(input),
            json!({"text": "hello", "history": ["seed"], "lang": "en"})
        );

        let input = InputCollector::new().collect(&ctx, &graph, &consumer()).unwrap();
        assert!(input.is_empty());
    }

    #[test]
    fn test_trigger_reference_resolves_from_payload() {
        let (ctx, graph) = setup(json!({"query": "what is rust"}));
        let step = consumer()
            .map_input("q", "trigger.query")
            .map_input("all", "trigger");

        let input = InputCollector::new().collect(&ctx, &graph, &step).unwrap();
        assert_eq!(input["q"], json!("what is rust"));
        assert_eq!(input["all"], json!({"query": "what is rust"}));
    }

    #[test]
    fn test_static_input_overrides_mapping() {
        let (ctx, graph) = setup(json!({}));
        let step = consumer()
            .with_config(STATIC_INPUT_KEY, json!({"foo": "static", "keep": true}))
            .map_input("foo", "a.x");

        let input = InputCollector::new().collect(&ctx, &graph, &step).unwrap();
        assert_eq!(Value::Object(input), json!({"foo": "static", "keep": true}));
    }

    #[test]
    fn test_unresolved_mapping_keeps_static_value() {
        let (ctx, graph) = setup(json!({}));
        let step = consumer()
            .with_config(STATIC_INPUT_KEY, json!({"foo": "static", "bar": "static"}))
            .map_input("foo", "z.w")
            .map_input("bar", "a.x");

        let input = InputCollector::new().collect(&ctx, &graph, &step).unwrap();
        assert_eq!(Value::Object(input), json!({"foo": "static", "bar": "static"}));
    }

    #[test]
    fn test_unresolved_mapping_keeps_trigger_value() {
        let (ctx, graph) = setup(json!({"text": "from trigger"}));
        let entry = StepDeclaration::new("z", "data_input").map_input("text", "consumer.text");

        let input = InputCollector::new().collect(&ctx, &graph, &entry).unwrap();
        assert_eq!(input["text"], json!("from trigger"));
    }
}
