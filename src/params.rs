//! Parameter schemas and the recursive parameter decoder.
//!
//! A macro declares its parameters as an ordered list of [`ParamSpec`]s:
//! typed scalars, possibly with string defaults, and repeat groups that
//! consume a variable number of repetitions of a nested schema. Clients
//! submit parameters as a flat token list; [`decode`] walks the schema and
//! the tokens together, producing typed values or a parameter error before
//! anything is enqueued.
//!
//! Decoding rules:
//!
//! - A scalar consumes one token through its type handler. When tokens are
//!   exhausted, its default is resolved instead; no default is a
//!   missing-parameter error.
//! - A repeat group consumes repetitions greedily: each repetition decodes
//!   the nested member schema once. The group stops at its `max` bound, at
//!   token exhaustion, or when the next repetition fails to decode after
//!   `min` has been satisfied (remaining tokens are left to the following
//!   schema entry). Fewer than `min` repetitions is an error; `min == 0`
//!   with no tokens contributes nothing.
//! - Each top-level repetition contributes one sequence value to the output.
//!   For groups nested inside another group, a repetition whose member
//!   schema decodes to exactly one value contributes that bare value (legacy
//!   single-member collapse, kept for compatibility and deliberately not
//!   generalized).
//! - Leftover tokens after the whole schema is satisfied are an error.

use serde::{Deserialize, Serialize};

use crate::error::{MacroError, MacroResult};
use crate::types::{ParamValue, TypeRegistry};

/// One entry of a macro parameter schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamSpec {
    /// A typed scalar parameter.
    Scalar {
        /// Parameter name, used in error messages.
        name: String,
        /// Registered parameter type name.
        type_name: String,
        /// Raw default token, resolved through the type handler when the
        /// token list is exhausted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
        /// Human-readable description.
        #[serde(default, skip_serializing_if = "String::is_empty")]
        description: String,
    },
    /// A repeat-parameter group.
    Repeat {
        /// Group name, used in error messages.
        name: String,
        /// Minimum number of repetitions.
        min: usize,
        /// Maximum number of repetitions; `None` is unbounded.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<usize>,
        /// Member schema decoded once per repetition.
        members: Vec<ParamSpec>,
        /// Human-readable description.
        #[serde(default, skip_serializing_if = "String::is_empty")]
        description: String,
    },
}

impl ParamSpec {
    /// Build a scalar spec.
    pub fn scalar(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        ParamSpec::Scalar {
            name: name.into(),
            type_name: type_name.into(),
            default: None,
            description: String::new(),
        }
    }

    /// Build a repeat group with `min = 1` and no upper bound.
    pub fn repeat(name: impl Into<String>, members: Vec<ParamSpec>) -> Self {
        ParamSpec::Repeat {
            name: name.into(),
            min: 1,
            max: None,
            members,
            description: String::new(),
        }
    }

    /// Set the default token of a scalar spec. No effect on groups.
    pub fn with_default(mut self, token: impl Into<String>) -> Self {
        if let ParamSpec::Scalar { default, .. } = &mut self {
            *default = Some(token.into());
        }
        self
    }

    /// Set the repetition bounds of a repeat group. No effect on scalars.
    pub fn with_bounds(mut self, new_min: usize, new_max: Option<usize>) -> Self {
        if let ParamSpec::Repeat { min, max, .. } = &mut self {
            *min = new_min;
            *max = new_max;
        }
        self
    }

    /// Set the description.
    pub fn with_description(mut self, text: impl Into<String>) -> Self {
        match &mut self {
            ParamSpec::Scalar { description, .. } | ParamSpec::Repeat { description, .. } => {
                *description = text.into();
            }
        }
        self
    }

    /// Parameter or group name.
    pub fn name(&self) -> &str {
        match self {
            ParamSpec::Scalar { name, .. } | ParamSpec::Repeat { name, .. } => name,
        }
    }
}

/// Decode a flat token list against a parameter schema.
///
/// All parameter errors surface here, before the macro is instantiated or
/// enqueued. On success every token has been consumed.
pub fn decode(
    specs: &[ParamSpec],
    tokens: &[String],
    types: &TypeRegistry,
) -> MacroResult<Vec<ParamValue>> {
    let (consumed, values) = decode_normal(specs, tokens, types, 0)?;
    if consumed < tokens.len() {
        return Err(MacroError::WrongParam(format!(
            "{} unexpected extra parameter(s), starting at '{}'",
            tokens.len() - consumed,
            tokens[consumed]
        )));
    }
    Ok(values)
}

/// Decode one pass of a schema, returning consumed token count and values.
/// Repeat-group repetitions are spliced into the output list.
fn decode_normal(
    specs: &[ParamSpec],
    tokens: &[String],
    types: &TypeRegistry,
    depth: usize,
) -> MacroResult<(usize, Vec<ParamValue>)> {
    let mut idx = 0;
    let mut values = Vec::with_capacity(specs.len());

    for spec in specs {
        if idx == tokens.len() {
            match spec {
                ParamSpec::Scalar {
                    name,
                    type_name,
                    default,
                    ..
                } => match default {
                    Some(token) => values.push(types.get(type_name)?.resolve(token)?),
                    None => {
                        return Err(MacroError::MissingParam(format!("'{name}' not specified")))
                    }
                },
                ParamSpec::Repeat { name, min, .. } => {
                    if *min > 0 {
                        return Err(MacroError::MissingParam(format!(
                            "'{name}' demands at least {min} repetition(s)"
                        )));
                    }
                    // min == 0 contributes nothing
                }
            }
            continue;
        }

        match spec {
            ParamSpec::Scalar {
                name, type_name, ..
            } => {
                let value = types.get(type_name)?.resolve(&tokens[idx]).map_err(|e| {
                    annotate_scalar_error(e, name)
                })?;
                idx += 1;
                values.push(value);
            }
            ParamSpec::Repeat { .. } => {
                let (consumed, repetitions) =
                    decode_repeat(spec, &tokens[idx..], types, depth)?;
                idx += consumed;
                values.extend(repetitions);
            }
        }
    }

    Ok((idx, values))
}

/// Greedily decode the repetitions of a repeat group.
fn decode_repeat(
    spec: &ParamSpec,
    tokens: &[String],
    types: &TypeRegistry,
    depth: usize,
) -> MacroResult<(usize, Vec<ParamValue>)> {
    let ParamSpec::Repeat {
        name,
        min,
        max,
        members,
        ..
    } = spec
    else {
        return Err(MacroError::WrongParam(format!(
            "'{}' is not a repeat group",
            spec.name()
        )));
    };

    let mut consumed = 0;
    let mut repetitions = Vec::new();

    while consumed < tokens.len() {
        if let Some(max) = max {
            if repetitions.len() == *max {
                break;
            }
        }
        match decode_normal(members, &tokens[consumed..], types, depth + 1) {
            Ok((used, member_values)) => {
                consumed += used;
                // Nested single-member repetitions collapse to the bare
                // value; top-level repetitions stay sequences.
                let repetition = if depth > 0 && member_values.len() == 1 {
                    member_values
                        .into_iter()
                        .next()
                        .unwrap_or(ParamValue::Seq(Vec::new()))
                } else {
                    ParamValue::Seq(member_values)
                };
                repetitions.push(repetition);
            }
            Err(e) => {
                // Once min is satisfied a failed repetition ends the group
                // and leaves its tokens to the next schema entry.
                if repetitions.len() >= *min {
                    break;
                }
                return Err(e);
            }
        }
    }

    if repetitions.len() < *min {
        return Err(MacroError::WrongParam(format!(
            "found {} repetition(s) of '{}', minimum is {}",
            repetitions.len(),
            name,
            min
        )));
    }

    Ok((consumed, repetitions))
}

fn annotate_scalar_error(err: MacroError, name: &str) -> MacroError {
    match err {
        MacroError::WrongParamType(msg) => {
            MacroError::WrongParamType(format!("parameter '{name}': {msg}"))
        }
        MacroError::UnknownParamObj(msg) => {
            MacroError::UnknownParamObj(format!("parameter '{name}': {msg}"))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::mock::MockElement;
    use crate::element::ElementRegistry;
    use std::sync::Arc;

    fn session_types() -> TypeRegistry {
        let elements = Arc::new(ElementRegistry::new());
        elements.register(Arc::new(MockElement::new("mot01", "Motor")));
        elements.register(Arc::new(MockElement::new("mot02", "Motor")));
        let types = TypeRegistry::with_builtins();
        types.register_element_kinds(&["Motor"], &elements);
        types
    }

    fn tokens(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn scan_schema() -> Vec<ParamSpec> {
        vec![
            ParamSpec::scalar("motor", "Motor"),
            ParamSpec::scalar("start", "Float"),
            ParamSpec::scalar("stop", "Float"),
            ParamSpec::scalar("nb_points", "Integer"),
            ParamSpec::scalar("integ_time", "Float"),
        ]
    }

    #[test]
    fn test_scan_like_schema_decodes_in_order() {
        let types = session_types();
        let values = decode(
            &scan_schema(),
            &tokens(&["mot01", "0", "10", "11", "0.2"]),
            &types,
        )
        .unwrap();

        assert_eq!(values.len(), 5);
        assert_eq!(values[0].as_element().unwrap().name(), "mot01");
        assert_eq!(values[1].as_float().unwrap(), 0.0);
        assert_eq!(values[2].as_float().unwrap(), 10.0);
        assert_eq!(values[3].as_integer().unwrap(), 11);
        assert_eq!(values[4].as_float().unwrap(), 0.2);
    }

    #[test]
    fn test_default_used_on_exhausted_tokens() {
        let types = session_types();
        let schema = vec![
            ParamSpec::scalar("motor", "Motor"),
            ParamSpec::scalar("integ_time", "Float").with_default("1.0"),
        ];
        let values = decode(&schema, &tokens(&["mot01"]), &types).unwrap();
        assert_eq!(values[1].as_float().unwrap(), 1.0);
    }

    #[test]
    fn test_missing_scalar_without_default() {
        let types = session_types();
        let schema = vec![ParamSpec::scalar("motor", "Motor")];
        assert!(matches!(
            decode(&schema, &tokens(&[]), &types),
            Err(MacroError::MissingParam(msg)) if msg.contains("motor")
        ));
    }

    #[test]
    fn test_repeat_group_one_sequence_per_repetition() {
        let types = session_types();
        let schema = vec![ParamSpec::repeat(
            "motors",
            vec![ParamSpec::scalar("name", "String")],
        )];
        let values = decode(&schema, &tokens(&["m1", "m2", "m3"]), &types).unwrap();

        assert_eq!(values.len(), 3);
        for (value, expected) in values.iter().zip(["m1", "m2", "m3"]) {
            let rep = value.as_seq().unwrap();
            assert_eq!(rep.len(), 1);
            assert_eq!(rep[0].as_str().unwrap(), expected);
        }
    }

    #[test]
    fn test_repeat_group_pairs() {
        let types = session_types();
        let schema = vec![ParamSpec::repeat(
            "moveables",
            vec![
                ParamSpec::scalar("motor", "Motor"),
                ParamSpec::scalar("position", "Float"),
            ],
        )];
        let values = decode(&schema, &tokens(&["mot01", "1.0", "mot02", "2.5"]), &types).unwrap();

        assert_eq!(values.len(), 2);
        let first = values[0].as_seq().unwrap();
        assert_eq!(first[0].as_element().unwrap().name(), "mot01");
        assert_eq!(first[1].as_float().unwrap(), 1.0);
        let second = values[1].as_seq().unwrap();
        assert_eq!(second[0].as_element().unwrap().name(), "mot02");
        assert_eq!(second[1].as_float().unwrap(), 2.5);
    }

    #[test]
    fn test_repeat_max_leaves_tokens_to_sibling() {
        let types = session_types();
        let schema = vec![
            ParamSpec::repeat("counters", vec![ParamSpec::scalar("name", "String")])
                .with_bounds(1, Some(2)),
            ParamSpec::scalar("integ_time", "Float"),
        ];
        let values = decode(&schema, &tokens(&["c1", "c2", "0.1"]), &types).unwrap();

        assert_eq!(values.len(), 3);
        assert_eq!(values[0].as_seq().unwrap()[0].as_str().unwrap(), "c1");
        assert_eq!(values[1].as_seq().unwrap()[0].as_str().unwrap(), "c2");
        assert_eq!(values[2].as_float().unwrap(), 0.1);
    }

    #[test]
    fn test_repeat_failed_repetition_ends_group_after_min() {
        let types = session_types();
        let schema = vec![
            ParamSpec::repeat("motors", vec![ParamSpec::scalar("motor", "Motor")]),
            ParamSpec::scalar("integ_time", "Float"),
        ];
        // "0.5" is not a motor name, so the group ends and the float takes it.
        let values = decode(&schema, &tokens(&["mot01", "0.5"]), &types).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[1].as_float().unwrap(), 0.5);
    }

    #[test]
    fn test_repeat_min_violated() {
        let types = session_types();
        let schema = vec![
            ParamSpec::repeat("motors", vec![ParamSpec::scalar("motor", "Motor")])
                .with_bounds(2, None),
        ];
        assert!(matches!(
            decode(&schema, &tokens(&["mot01"]), &types),
            Err(MacroError::WrongParam(msg)) if msg.contains("minimum is 2")
        ));
        assert!(matches!(
            decode(&schema, &tokens(&[]), &types),
            Err(MacroError::MissingParam(_))
        ));
    }

    #[test]
    fn test_repeat_min_zero_contributes_nothing() {
        let types = session_types();
        let schema = vec![
            ParamSpec::repeat("counters", vec![ParamSpec::scalar("name", "String")])
                .with_bounds(0, None),
        ];
        let values = decode(&schema, &tokens(&[]), &types).unwrap();
        assert!(values.is_empty());
    }

    #[test]
    fn test_nested_single_member_collapse() {
        let types = session_types();
        let schema = vec![ParamSpec::repeat(
            "groups",
            vec![
                ParamSpec::scalar("label", "String"),
                ParamSpec::repeat("values", vec![ParamSpec::scalar("v", "Integer")])
                    .with_bounds(1, Some(2)),
            ],
        )];
        let values = decode(&schema, &tokens(&["a", "1", "2"]), &types).unwrap();

        assert_eq!(values.len(), 1);
        let rep = values[0].as_seq().unwrap();
        assert_eq!(rep[0].as_str().unwrap(), "a");
        // Inner repetitions collapsed to bare integers.
        assert_eq!(rep[1].as_integer().unwrap(), 1);
        assert_eq!(rep[2].as_integer().unwrap(), 2);
    }

    #[test]
    fn test_leftover_tokens_are_an_error() {
        let types = session_types();
        let schema = vec![ParamSpec::scalar("integ_time", "Float")];
        assert!(matches!(
            decode(&schema, &tokens(&["0.1", "extra"]), &types),
            Err(MacroError::WrongParam(msg)) if msg.contains("extra")
        ));
    }

    #[test]
    fn test_unknown_element_token() {
        let types = session_types();
        let schema = vec![ParamSpec::scalar("motor", "Motor")];
        assert!(matches!(
            decode(&schema, &tokens(&["mot99"]), &types),
            Err(MacroError::UnknownParamObj(_))
        ));
    }
}
