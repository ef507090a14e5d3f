//! Parameter values and the parameter type registry.
//!
//! Macro parameters arrive as flat string tokens and are decoded into typed
//! [`ParamValue`]s through named type handlers. Builtin handlers cover the
//! scalar types; element-kind handlers resolve tokens to live elements
//! through the session [`ElementRegistry`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::element::{Element, ElementRegistry};
use crate::error::{MacroError, MacroResult};

/// A decoded macro parameter value.
#[derive(Clone)]
pub enum ParamValue {
    /// Integer scalar.
    Integer(i64),
    /// Floating point scalar.
    Float(f64),
    /// Boolean scalar.
    Boolean(bool),
    /// String scalar.
    Str(String),
    /// A resolved hardware element.
    Element(Arc<dyn Element>),
    /// One repetition of a repeat-parameter group.
    Seq(Vec<ParamValue>),
}

impl ParamValue {
    /// Integer accessor.
    pub fn as_integer(&self) -> MacroResult<i64> {
        match self {
            ParamValue::Integer(v) => Ok(*v),
            other => Err(wrong_type("integer", other)),
        }
    }

    /// Float accessor. Integers widen to float.
    pub fn as_float(&self) -> MacroResult<f64> {
        match self {
            ParamValue::Float(v) => Ok(*v),
            ParamValue::Integer(v) => Ok(*v as f64),
            other => Err(wrong_type("float", other)),
        }
    }

    /// Boolean accessor.
    pub fn as_boolean(&self) -> MacroResult<bool> {
        match self {
            ParamValue::Boolean(v) => Ok(*v),
            other => Err(wrong_type("boolean", other)),
        }
    }

    /// String accessor.
    pub fn as_str(&self) -> MacroResult<&str> {
        match self {
            ParamValue::Str(v) => Ok(v),
            other => Err(wrong_type("string", other)),
        }
    }

    /// Element accessor.
    pub fn as_element(&self) -> MacroResult<Arc<dyn Element>> {
        match self {
            ParamValue::Element(e) => Ok(e.clone()),
            other => Err(wrong_type("element", other)),
        }
    }

    /// Repetition accessor.
    pub fn as_seq(&self) -> MacroResult<&[ParamValue]> {
        match self {
            ParamValue::Seq(v) => Ok(v),
            other => Err(wrong_type("sequence", other)),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            ParamValue::Integer(_) => "integer",
            ParamValue::Float(_) => "float",
            ParamValue::Boolean(_) => "boolean",
            ParamValue::Str(_) => "string",
            ParamValue::Element(_) => "element",
            ParamValue::Seq(_) => "sequence",
        }
    }
}

fn wrong_type(wanted: &str, got: &ParamValue) -> MacroError {
    MacroError::WrongParamType(format!(
        "expected {wanted}, got {} ({got})",
        got.kind_name()
    ))
}

impl std::fmt::Debug for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Integer(v) => write!(f, "Integer({v})"),
            ParamValue::Float(v) => write!(f, "Float({v})"),
            ParamValue::Boolean(v) => write!(f, "Boolean({v})"),
            ParamValue::Str(v) => write!(f, "Str({v:?})"),
            ParamValue::Element(e) => write!(f, "Element({})", e.name()),
            ParamValue::Seq(v) => f.debug_list().entries(v.iter()).finish(),
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Integer(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Boolean(v) => write!(f, "{v}"),
            ParamValue::Str(v) => write!(f, "{v}"),
            ParamValue::Element(e) => write!(f, "{}", e.name()),
            ParamValue::Seq(v) => {
                write!(f, "[")?;
                for (i, item) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl PartialEq for ParamValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ParamValue::Integer(a), ParamValue::Integer(b)) => a == b,
            (ParamValue::Float(a), ParamValue::Float(b)) => a == b,
            (ParamValue::Boolean(a), ParamValue::Boolean(b)) => a == b,
            (ParamValue::Str(a), ParamValue::Str(b)) => a == b,
            (ParamValue::Element(a), ParamValue::Element(b)) => a.name() == b.name(),
            (ParamValue::Seq(a), ParamValue::Seq(b)) => a == b,
            _ => false,
        }
    }
}

/// A named parameter type handler, resolving one raw token into a value.
pub trait ParamType: Send + Sync {
    /// Type name as referenced by parameter schemas (e.g. `"Integer"`,
    /// `"Motor"`).
    fn name(&self) -> &str;

    /// Resolve one token. Implementations report unparsable tokens as
    /// `WrongParamType` and unresolvable object names as `UnknownParamObj`.
    fn resolve(&self, token: &str) -> MacroResult<ParamValue>;
}

struct IntegerType;

impl ParamType for IntegerType {
    fn name(&self) -> &str {
        "Integer"
    }

    fn resolve(&self, token: &str) -> MacroResult<ParamValue> {
        token.parse::<i64>().map(ParamValue::Integer).map_err(|_| {
            MacroError::WrongParamType(format!("could not parse '{token}' as an integer"))
        })
    }
}

struct FloatType;

impl ParamType for FloatType {
    fn name(&self) -> &str {
        "Float"
    }

    fn resolve(&self, token: &str) -> MacroResult<ParamValue> {
        token.parse::<f64>().map(ParamValue::Float).map_err(|_| {
            MacroError::WrongParamType(format!("could not parse '{token}' as a float"))
        })
    }
}

struct BooleanType;

impl ParamType for BooleanType {
    fn name(&self) -> &str {
        "Boolean"
    }

    fn resolve(&self, token: &str) -> MacroResult<ParamValue> {
        match token.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Ok(ParamValue::Boolean(true)),
            "false" | "no" | "0" | "off" => Ok(ParamValue::Boolean(false)),
            _ => Err(MacroError::WrongParamType(format!(
                "could not parse '{token}' as a boolean"
            ))),
        }
    }
}

struct StringType;

impl ParamType for StringType {
    fn name(&self) -> &str {
        "String"
    }

    fn resolve(&self, token: &str) -> MacroResult<ParamValue> {
        Ok(ParamValue::Str(token.to_string()))
    }
}

/// Handler for one element kind, resolving tokens through the session
/// element registry.
pub struct ElementParamType {
    kind: String,
    elements: Arc<ElementRegistry>,
}

impl ElementParamType {
    /// Create a handler for the given element kind.
    pub fn new(kind: impl Into<String>, elements: Arc<ElementRegistry>) -> Self {
        Self {
            kind: kind.into(),
            elements,
        }
    }
}

impl ParamType for ElementParamType {
    fn name(&self) -> &str {
        &self.kind
    }

    fn resolve(&self, token: &str) -> MacroResult<ParamValue> {
        self.elements
            .get_of_kind(token, &self.kind)
            .map(ParamValue::Element)
            .ok_or_else(|| {
                MacroError::UnknownParamObj(format!("no {} named '{}'", self.kind, token))
            })
    }
}

/// Registry of parameter type handlers, keyed by type name.
pub struct TypeRegistry {
    types: RwLock<HashMap<String, Arc<dyn ParamType>>>,
}

impl TypeRegistry {
    /// Create a registry pre-populated with the builtin scalar types.
    pub fn with_builtins() -> Self {
        let registry = Self {
            types: RwLock::new(HashMap::new()),
        };
        registry.register(Arc::new(IntegerType));
        registry.register(Arc::new(FloatType));
        registry.register(Arc::new(BooleanType));
        registry.register(Arc::new(StringType));
        registry
    }

    /// Register a handler under its own name, replacing any previous one.
    pub fn register(&self, param_type: Arc<dyn ParamType>) {
        let name = param_type.name().to_string();
        if let Ok(mut map) = self.types.write() {
            map.insert(name, param_type);
        }
    }

    /// Register element handlers for each of the given kinds.
    pub fn register_element_kinds(&self, kinds: &[&str], elements: &Arc<ElementRegistry>) {
        for kind in kinds {
            self.register(Arc::new(ElementParamType::new(*kind, elements.clone())));
        }
    }

    /// Look up a handler, failing with `WrongParamType` for unknown names.
    pub fn get(&self, name: &str) -> MacroResult<Arc<dyn ParamType>> {
        self.types
            .read()
            .ok()
            .and_then(|m| m.get(name).cloned())
            .ok_or_else(|| MacroError::WrongParamType(format!("unknown parameter type '{name}'")))
    }

    /// Sorted list of registered type names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .types
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}
