//! Query-argument validation
//!
//! Best-effort checks that a filter argument fits the declared type of the
//! field it targets. A rejected argument is advisory: the dispatcher logs a
//! warning and the caller decides what to do with it.

mod validators;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bson::Bson;
use once_cell::sync::Lazy;

use crate::codec::MappedValue;
use crate::mapping::{ContainerShape, FieldDescriptor, StorageKind, ValueType};

pub use validators::{
    AllOperationValidator, ElemMatchOperationValidator, ExistsOperationValidator,
    GeoWithinOperationValidator, InOperationValidator, ModOperationValidator,
    NotInOperationValidator, RegexOperationValidator, SizeOperationValidator,
    TypeOperationValidator,
};

/// Filter operators understood by the validators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    In,
    NotIn,
    All,
    Size,
    Exists,
    Type,
    Mod,
    Regex,
    ElemMatch,
    GeoWithin,
    GeoIntersects,
    Near,
    NearSphere,
}

impl FilterOperator {
    const ALL: [FilterOperator; 19] = [
        FilterOperator::Equal,
        FilterOperator::NotEqual,
        FilterOperator::GreaterThan,
        FilterOperator::GreaterThanOrEqual,
        FilterOperator::LessThan,
        FilterOperator::LessThanOrEqual,
        FilterOperator::In,
        FilterOperator::NotIn,
        FilterOperator::All,
        FilterOperator::Size,
        FilterOperator::Exists,
        FilterOperator::Type,
        FilterOperator::Mod,
        FilterOperator::Regex,
        FilterOperator::ElemMatch,
        FilterOperator::GeoWithin,
        FilterOperator::GeoIntersects,
        FilterOperator::Near,
        FilterOperator::NearSphere,
    ];

    /// Operator as written in a filter document
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Equal => "$eq",
            FilterOperator::NotEqual => "$ne",
            FilterOperator::GreaterThan => "$gt",
            FilterOperator::GreaterThanOrEqual => "$gte",
            FilterOperator::LessThan => "$lt",
            FilterOperator::LessThanOrEqual => "$lte",
            FilterOperator::In => "$in",
            FilterOperator::NotIn => "$nin",
            FilterOperator::All => "$all",
            FilterOperator::Size => "$size",
            FilterOperator::Exists => "$exists",
            FilterOperator::Type => "$type",
            FilterOperator::Mod => "$mod",
            FilterOperator::Regex => "$regex",
            FilterOperator::ElemMatch => "$elemMatch",
            FilterOperator::GeoWithin => "$geoWithin",
            FilterOperator::GeoIntersects => "$geoIntersects",
            FilterOperator::Near => "$near",
            FilterOperator::NearSphere => "$nearSphere",
        }
    }

    pub fn parse(operator: &str) -> Option<FilterOperator> {
        Self::ALL.into_iter().find(|op| op.as_str() == operator)
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared type of a queried field
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeclaredType {
    pub kind: StorageKind,
    pub container: ContainerShape,
    pub element: ValueType,
}

impl DeclaredType {
    pub fn of<T: MappedValue>() -> Self {
        let shape = T::shape();
        Self {
            kind: shape.kind,
            container: shape.container,
            element: shape.element,
        }
    }
}

impl From<&FieldDescriptor> for DeclaredType {
    fn from(field: &FieldDescriptor) -> Self {
        Self {
            kind: field.kind(),
            container: field.container(),
            element: field.element_type(),
        }
    }
}

/// Check of one operator's argument
pub trait OperationValidator: Send + Sync {
    fn operator(&self) -> FilterOperator;

    /// True if `value` is an acceptable argument for a field of `declared` type
    fn accepts(&self, declared: &DeclaredType, value: &Bson) -> bool;

    /// True only if the operator matches and the argument is acceptable
    fn validate(&self, declared: &DeclaredType, operator: FilterOperator, value: &Bson) -> bool {
        operator == self.operator() && self.accepts(declared, value)
    }
}

/// Outcome of dispatching an argument to the validators of its operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// At least one validator accepted the argument
    Accepted,
    /// Validators exist for the operator and none accepted
    Rejected,
    /// No validator is registered for the operator
    Unchecked,
}

/// Validators grouped by operator
#[derive(Clone)]
pub struct QueryValidators {
    by_operator: HashMap<FilterOperator, Vec<Arc<dyn OperationValidator>>>,
    warn_on_reject: bool,
}

impl Default for QueryValidators {
    fn default() -> Self {
        let mut validators = Self::empty();
        validators.register(SizeOperationValidator);
        validators.register(AllOperationValidator);
        validators.register(InOperationValidator);
        validators.register(NotInOperationValidator);
        validators.register(ExistsOperationValidator);
        validators.register(ModOperationValidator);
        validators.register(RegexOperationValidator);
        validators.register(ElemMatchOperationValidator);
        validators.register(GeoWithinOperationValidator);
        validators.register(TypeOperationValidator);
        validators
    }
}

impl QueryValidators {
    /// Dispatcher with no validators
    pub fn empty() -> Self {
        Self {
            by_operator: HashMap::new(),
            warn_on_reject: true,
        }
    }

    pub fn register<V: OperationValidator + 'static>(&mut self, validator: V) {
        self.by_operator
            .entry(validator.operator())
            .or_default()
            .push(Arc::new(validator));
    }

    /// Log rejected arguments at warn level (default) or debug level
    pub fn set_warn_on_reject(&mut self, warn: bool) {
        self.warn_on_reject = warn;
    }

    pub fn has_validator(&self, operator: FilterOperator) -> bool {
        self.by_operator.contains_key(&operator)
    }

    pub fn validate(&self, declared: &DeclaredType, operator: FilterOperator, value: &Bson) -> Validation {
        let Some(validators) = self.by_operator.get(&operator) else {
            return Validation::Unchecked;
        };
        if validators
            .iter()
            .any(|validator| validator.validate(declared, operator, value))
        {
            return Validation::Accepted;
        }

        if self.warn_on_reject {
            tracing::warn!(
                operator = operator.as_str(),
                element = declared.element.name(),
                value = %value,
                "Query argument rejected by every validator"
            );
        } else {
            tracing::debug!(operator = operator.as_str(), value = %value, "Query argument rejected");
        }
        Validation::Rejected
    }
}

static DEFAULT_VALIDATORS: Lazy<QueryValidators> = Lazy::new(QueryValidators::default);

/// Validate an argument with the built-in validators
///
/// Operators without a validator pass.
pub fn validate(declared: &DeclaredType, operator: FilterOperator, value: &Bson) -> bool {
    DEFAULT_VALIDATORS.validate(declared, operator, value) != Validation::Rejected
}
