//! Equality predicates: AND/OR trees of attribute conditions.
//!
//! The same tree is evaluated in memory against any [`AttributeSource`] and
//! rendered as a store filter, so empty-value normalization happens once, when
//! a condition is constructed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::attributes::{Attribute, AttributeSource};
use crate::entity::{CanonicalEntity, EntityKind};
use crate::{AttributeValue, Variant};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PredicateError {
    #[error("cannot evaluate a {expected} predicate against a {found} record")]
    VariantMismatch { expected: Variant, found: Variant },
    #[error("unknown {variant} attribute '{field}'")]
    UnknownAttribute { variant: Variant, field: String },
    #[error("{op:?} on '{field}' requires a value")]
    MissingOperand { field: &'static str, op: ConditionOp },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionOp {
    Equal,
    NotEqual,
    IsAbsent,
    IsPresent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    attribute: Attribute,
    op: ConditionOp,
    value: Option<AttributeValue>,
}

impl Condition {
    /// `attribute == value`; a missing or blank value becomes `IsAbsent`.
    pub fn equal(attribute: Attribute, value: Option<AttributeValue>) -> Self {
        match value.filter(|v| !v.is_blank()) {
            Some(v) => Self {
                attribute,
                op: ConditionOp::Equal,
                value: Some(v),
            },
            None => Self::is_absent(attribute),
        }
    }

    /// `attribute != value`; a missing or blank value becomes `IsPresent`.
    pub fn not_equal(attribute: Attribute, value: Option<AttributeValue>) -> Self {
        match value.filter(|v| !v.is_blank()) {
            Some(v) => Self {
                attribute,
                op: ConditionOp::NotEqual,
                value: Some(v),
            },
            None => Self::is_present(attribute),
        }
    }

    pub fn is_absent(attribute: Attribute) -> Self {
        Self {
            attribute,
            op: ConditionOp::IsAbsent,
            value: None,
        }
    }

    pub fn is_present(attribute: Attribute) -> Self {
        Self {
            attribute,
            op: ConditionOp::IsPresent,
            value: None,
        }
    }

    pub fn attribute(&self) -> Attribute {
        self.attribute
    }

    pub fn op(&self) -> ConditionOp {
        self.op
    }

    pub fn value(&self) -> Option<&AttributeValue> {
        self.value.as_ref()
    }

    fn evaluate(&self, target: &dyn AttributeSource) -> Result<bool, PredicateError> {
        if self.attribute.variant() != target.variant() {
            return Err(PredicateError::VariantMismatch {
                expected: self.attribute.variant(),
                found: target.variant(),
            });
        }
        let actual = target.value(self.attribute).filter(|v| !v.is_blank());
        let result = match self.op {
            ConditionOp::IsAbsent => actual.is_none(),
            ConditionOp::IsPresent => actual.is_some(),
            ConditionOp::Equal | ConditionOp::NotEqual => {
                let expected = self.value.as_ref().ok_or(PredicateError::MissingOperand {
                    field: self.attribute.field(),
                    op: self.op,
                })?;
                match actual {
                    None => false,
                    Some(actual) if self.op == ConditionOp::Equal => actual.matches(expected),
                    Some(actual) => !actual.matches(expected),
                }
            }
        };
        Ok(result)
    }

    fn render(&self, out: &mut String) {
        let field = self.attribute.field();
        match (self.op, &self.value) {
            (ConditionOp::Equal, Some(v)) => {
                out.push_str(&format!("{field} eq {}", filter_literal(v)));
            }
            (ConditionOp::NotEqual, Some(v)) => {
                out.push_str(&format!("{field} ne {}", filter_literal(v)));
            }
            (ConditionOp::IsAbsent, _) | (ConditionOp::Equal, None) => {
                out.push_str(&format!("{field} eq null"));
            }
            (ConditionOp::IsPresent, _) | (ConditionOp::NotEqual, None) => {
                out.push_str(&format!("{field} ne null"));
            }
        }
    }
}

fn filter_literal(value: &AttributeValue) -> String {
    match value {
        AttributeValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
        AttributeValue::Integer(i) => i.to_string(),
        AttributeValue::Flag(b) => b.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Condition(Condition),
}

impl Predicate {
    pub fn and(children: Vec<Predicate>) -> Self {
        Self::And(children)
    }

    pub fn or(children: Vec<Predicate>) -> Self {
        Self::Or(children)
    }

    pub fn equal(attribute: Attribute, value: Option<AttributeValue>) -> Self {
        Self::Condition(Condition::equal(attribute, value))
    }

    /// Number of leaf conditions, the unit the store's query ceiling counts.
    pub fn condition_count(&self) -> usize {
        match self {
            Predicate::Condition(_) => 1,
            Predicate::And(children) | Predicate::Or(children) => {
                children.iter().map(Predicate::condition_count).sum()
            }
        }
    }

    /// Depth-first evaluation. An empty AND is true, an empty OR is false.
    pub fn evaluate(&self, target: &dyn AttributeSource) -> Result<bool, PredicateError> {
        match self {
            Predicate::Condition(c) => c.evaluate(target),
            Predicate::And(children) => {
                for child in children {
                    if !child.evaluate(target)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Or(children) => {
                for child in children {
                    if child.evaluate(target)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Render as a store filter expression, e.g. `a eq 'x' and (b eq null or c ne 1)`.
    pub fn to_filter(&self) -> String {
        let mut out = String::new();
        self.render(&mut out, false);
        out
    }

    fn render(&self, out: &mut String, nested: bool) {
        let (children, joiner) = match self {
            Predicate::Condition(c) => {
                c.render(out);
                return;
            }
            Predicate::And(children) => (children, " and "),
            Predicate::Or(children) => (children, " or "),
        };
        if children.len() == 1 {
            children[0].render(out, nested);
            return;
        }
        if nested {
            out.push('(');
        }
        for (i, child) in children.iter().enumerate() {
            if i > 0 {
                out.push_str(joiner);
            }
            child.render(out, true);
        }
        if nested {
            out.push(')');
        }
    }
}

/// Structural equality predicate for one canonical entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EqualityPredicate {
    variant: Variant,
    root: Predicate,
}

impl EqualityPredicate {
    /// Individuals and groups match on their natural key. Facilities have none:
    /// `Name AND (AddressId OR (Line1 AND (Line2 OR Line2Suppressed)))`.
    pub fn for_kind(kind: &EntityKind) -> Self {
        let root = match kind {
            EntityKind::Individual(i) => {
                Predicate::equal(Attribute::EnrollmentId, AttributeValue::non_blank(&i.enrollment_id))
            }
            EntityKind::Group(g) => {
                Predicate::equal(Attribute::GroupId, AttributeValue::non_blank(&g.group_id))
            }
            EntityKind::Facility(f) => {
                let a = &f.address;
                Predicate::and(vec![
                    Predicate::equal(Attribute::FacilityName, AttributeValue::non_blank(&f.name)),
                    Predicate::or(vec![
                        Predicate::equal(Attribute::AddressId, AttributeValue::non_blank(&a.id)),
                        Predicate::and(vec![
                            Predicate::equal(Attribute::AddressLine1, AttributeValue::non_blank(&a.line1)),
                            Predicate::or(vec![
                                Predicate::equal(Attribute::AddressLine2, AttributeValue::non_blank(&a.line2)),
                                Predicate::equal(
                                    Attribute::Line2Suppressed,
                                    Some(AttributeValue::Flag(a.line2_suppressed)),
                                ),
                            ]),
                        ]),
                    ]),
                ])
            }
        };
        Self {
            variant: kind.variant(),
            root,
        }
    }

    pub fn for_entity(entity: &CanonicalEntity) -> Self {
        Self::for_kind(&entity.kind)
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn root(&self) -> &Predicate {
        &self.root
    }

    /// Evaluating against a record of another variant is a programming error.
    pub fn evaluate(&self, target: &dyn AttributeSource) -> Result<bool, PredicateError> {
        if target.variant() != self.variant {
            return Err(PredicateError::VariantMismatch {
                expected: self.variant,
                found: target.variant(),
            });
        }
        self.root.evaluate(target)
    }
}

/// Group predicates into OR-queries of at most `limit` conditions each.
///
/// Input order is preserved. A single predicate larger than the limit is
/// emitted on its own; it cannot be split without changing its meaning.
pub fn split_by_condition_limit<'a>(
    predicates: impl IntoIterator<Item = &'a Predicate>,
    limit: usize,
) -> Vec<Predicate> {
    let limit = limit.max(1);
    let mut queries = Vec::new();
    let mut current: Vec<Predicate> = Vec::new();
    let mut current_count = 0usize;

    for predicate in predicates {
        let count = predicate.condition_count();
        if !current.is_empty() && current_count + count > limit {
            queries.push(Predicate::or(std::mem::take(&mut current)));
            current_count = 0;
        }
        current.push(predicate.clone());
        current_count += count;
    }
    if !current.is_empty() {
        queries.push(Predicate::or(current));
    }
    queries
}
