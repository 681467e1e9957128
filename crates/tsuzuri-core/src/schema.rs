//! Schema validation.
//!
//! The engine depends on no validation library. A schema is anything
//! implementing [`Schema`]; two adapters cover the two shapes validators
//! come in:
//!
//! - [`SafeSchema`] for validators that report problems as a result value,
//! - [`FallibleSchema`] for validators that signal problems by failing.
//!
//! [`TypedSchema`] validates by deserializing into a Rust type.

use crate::error::{BoxError, SchemaError, ValidationTarget};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Why a schema rejected a value.
#[derive(Debug)]
pub enum SchemaViolation {
    /// The value has the wrong shape.
    Mismatch(Vec<String>),
    /// The validator itself failed.
    Validator(BoxError),
}

/// A validate-or-fail contract over JSON values.
///
/// A schema may normalize the value it accepts (fill defaults, coerce
/// types); the returned value replaces the original.
pub trait Schema: Send + Sync + fmt::Debug {
    /// Checks `value`, returning the accepted value.
    fn validate(&self, value: Value) -> Result<Value, SchemaViolation>;

    /// Short name shown by the inspector.
    fn name(&self) -> &str;
}

/// Result of a non-failing validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// The value is acceptable.
    Valid,
    /// The value is not acceptable, for these reasons.
    Invalid(Vec<String>),
}

impl Validation {
    /// Creates an Invalid result with a single issue.
    pub fn invalid(issue: impl Into<String>) -> Self {
        Self::Invalid(vec![issue.into()])
    }
}

type CheckFn = dyn Fn(&Value) -> Validation + Send + Sync;

/// Adapter for validators that return a [`Validation`] instead of failing.
///
/// ```
/// use tsuzuri_core::{SafeSchema, Schema, Validation};
/// use serde_json::json;
///
/// let positive = SafeSchema::new("positive", |v| match v.as_f64() {
///     Some(n) if n > 0.0 => Validation::Valid,
///     _ => Validation::invalid("expected a positive number"),
/// });
///
/// assert!(positive.validate(json!(3)).is_ok());
/// assert!(positive.validate(json!(-3)).is_err());
/// ```
#[derive(Clone)]
pub struct SafeSchema {
    name: String,
    check: Arc<CheckFn>,
}

impl fmt::Debug for SafeSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeSchema").field("name", &self.name).finish()
    }
}

impl SafeSchema {
    /// Wraps a non-failing check.
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Value) -> Validation + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }
}

impl Schema for SafeSchema {
    fn validate(&self, value: Value) -> Result<Value, SchemaViolation> {
        match (self.check)(&value) {
            Validation::Valid => Ok(value),
            Validation::Invalid(issues) => Err(SchemaViolation::Mismatch(issues)),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

type ParseFn = dyn Fn(Value) -> Result<Value, BoxError> + Send + Sync;

/// Adapter for validators that fail with their own error.
///
/// The validator's error is kept as the source of the resulting
/// [`SchemaError::Validator`].
#[derive(Clone)]
pub struct FallibleSchema {
    name: String,
    parse: Arc<ParseFn>,
}

impl fmt::Debug for FallibleSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallibleSchema")
            .field("name", &self.name)
            .finish()
    }
}

impl FallibleSchema {
    /// Wraps a failing parser.
    pub fn new<F>(name: impl Into<String>, parse: F) -> Self
    where
        F: Fn(Value) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            parse: Arc::new(parse),
        }
    }
}

impl Schema for FallibleSchema {
    fn validate(&self, value: Value) -> Result<Value, SchemaViolation> {
        (self.parse)(value).map_err(SchemaViolation::Validator)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Schema accepting exactly the values that deserialize into `T`.
///
/// The accepted value is re-serialized from `T`, so serde defaults are
/// filled in and unknown fields follow `T`'s serde attributes.
///
/// ```
/// use tsuzuri_core::{Schema, TypedSchema};
/// use serde::{Deserialize, Serialize};
/// use serde_json::json;
///
/// #[derive(Serialize, Deserialize)]
/// struct Order {
///     id: u64,
///     #[serde(default)]
///     priority: bool,
/// }
///
/// let schema = TypedSchema::<Order>::new();
/// let accepted = schema.validate(json!({"id": 7})).unwrap();
/// assert_eq!(accepted, json!({"id": 7, "priority": false}));
/// assert!(schema.validate(json!({"id": "seven"})).is_err());
/// ```
pub struct TypedSchema<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for TypedSchema<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedSchema").field("name", &self.name).finish()
    }
}

impl<T> Default for TypedSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TypedSchema<T> {
    /// Creates a schema named after `T`.
    pub fn new() -> Self {
        let full_name = std::any::type_name::<T>();
        let short_name = full_name.rsplit("::").next().unwrap_or(full_name);
        Self {
            name: short_name.to_string(),
            _marker: PhantomData,
        }
    }
}

impl<T> Schema for TypedSchema<T>
where
    T: DeserializeOwned + Serialize,
{
    fn validate(&self, value: Value) -> Result<Value, SchemaViolation> {
        let typed: T = serde_json::from_value(value)
            .map_err(|e| SchemaViolation::Mismatch(vec![e.to_string()]))?;
        serde_json::to_value(typed).map_err(|e| SchemaViolation::Validator(Box::new(e)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Validates `value` against an optional schema.
///
/// Without a schema the value is accepted unchanged.
pub fn parse_with_schema(
    schema: Option<&dyn Schema>,
    value: Value,
    target: &ValidationTarget,
) -> Result<Value, SchemaError> {
    let Some(schema) = schema else {
        return Ok(value);
    };

    schema.validate(value).map_err(|violation| match violation {
        SchemaViolation::Mismatch(issues) => SchemaError::Mismatch {
            target: target.clone(),
            issues,
        },
        SchemaViolation::Validator(source) => SchemaError::Validator {
            target: target.clone(),
            source,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepId;
    use serde::Deserialize;
    use serde_json::json;
    use std::error::Error as _;

    fn target() -> ValidationTarget {
        ValidationTarget::StepInput(StepId::new("s"))
    }

    #[test]
    fn test_no_schema_accepts_anything() {
        let value = parse_with_schema(None, json!({"a": 1}), &target()).expect("accepted");
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn test_safe_schema_reports_mismatch() {
        let schema = SafeSchema::new("object", |v| {
            if v.is_object() {
                Validation::Valid
            } else {
                Validation::invalid("expected object")
            }
        });

        let error = parse_with_schema(Some(&schema), json!(1), &target()).expect_err("rejected");
        match error {
            SchemaError::Mismatch { target, issues } => {
                assert_eq!(target, ValidationTarget::StepInput(StepId::new("s")));
                assert_eq!(issues, vec!["expected object".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_fallible_schema_keeps_validator_error() {
        let schema = FallibleSchema::new("strict", |_| Err("validator crashed".into()));

        let error = parse_with_schema(Some(&schema), json!(1), &target()).expect_err("rejected");
        assert!(matches!(error, SchemaError::Validator { .. }));
        assert_eq!(
            error.source().map(|s| s.to_string()).as_deref(),
            Some("validator crashed")
        );
    }

    #[test]
    fn test_fallible_schema_can_normalize() {
        let schema = FallibleSchema::new("trim", |v| match v {
            Value::String(s) => Ok(Value::String(s.trim().to_string())),
            other => Ok(other),
        });

        let value = parse_with_schema(Some(&schema), json!("  hi "), &target()).expect("accepted");
        assert_eq!(value, json!("hi"));
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_typed_schema() {
        let schema = TypedSchema::<Point>::new();
        assert_eq!(schema.name(), "Point");

        assert!(parse_with_schema(Some(&schema), json!({"x": 1, "y": 2}), &target()).is_ok());

        let error =
            parse_with_schema(Some(&schema), json!({"x": 1}), &target()).expect_err("rejected");
        assert!(error.to_string().contains("missing field `y`"));
    }
}
