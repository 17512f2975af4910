use std::marker::PhantomData;

use crate::{Entity, Key, Operator, Predicate, Value, WhereCriteria, error::Error};

pub enum BoundCondition {
    Value(Value),
    Range(Value, Value),
    Compare(Operator, Value),
    In(Vec<Key>),
    Null,
    NotNull,
}

/// Typed filter over the columns of `T`. Field names are checked when the
/// filter is turned into a [`Predicate`].
pub struct Filter<T> {
    conditions: Vec<(String, BoundCondition)>,
    _marker: PhantomData<T>,
}

impl<T: Entity> Default for Filter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> Filter<T> {
    pub fn new() -> Self {
        Self {
            conditions: Vec::new(),
            _marker: PhantomData,
        }
    }

    pub fn with(mut self, field_name: impl Into<String>, bound_condition: BoundCondition) -> Self {
        self.conditions.push((field_name.into(), bound_condition));
        self
    }

    pub fn eq(self, field_name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field_name, BoundCondition::Value(value.into()))
    }

    /// Inclusive range.
    pub fn range(
        self,
        field_name: impl Into<String>,
        start: impl Into<Value>,
        end: impl Into<Value>,
    ) -> Self {
        self.with(field_name, BoundCondition::Range(start.into(), end.into()))
    }

    pub fn compare(
        self,
        field_name: impl Into<String>,
        op: Operator,
        value: impl Into<Value>,
    ) -> Self {
        self.with(field_name, BoundCondition::Compare(op, value.into()))
    }

    pub fn in_list(
        self,
        field_name: impl Into<String>,
        values: impl IntoIterator<Item = Key>,
    ) -> Self {
        self.with(field_name, BoundCondition::In(values.into_iter().collect()))
    }

    pub fn is_null(self, field_name: impl Into<String>) -> Self {
        self.with(field_name, BoundCondition::Null)
    }

    pub fn not_null(self, field_name: impl Into<String>) -> Self {
        self.with(field_name, BoundCondition::NotNull)
    }

    /// Only rows whose deleted flag is normal. No-op for entities without one.
    pub fn normal(self) -> Self {
        match T::meta().deleted_flag_field {
            Some(field) => self.eq(field, crate::DELETED_FLAG_NORMAL),
            None => self,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn into_predicate(self) -> Result<Predicate, Error> {
        let meta = T::meta();
        let mut predicates = Vec::with_capacity(self.conditions.len());
        for (field, condition) in self.conditions {
            let column = meta.column(&field).ok_or_else(|| Error::InvalidCriteriaField {
                entity: meta.name,
                field: field.clone(),
            })?;
            let compare = |op, value| Predicate::Compare { column, op, value };
            match condition {
                BoundCondition::Value(value) => predicates.push(compare(Operator::Equal, value)),
                BoundCondition::Range(start, end) => {
                    predicates.push(compare(Operator::Ge, start));
                    predicates.push(compare(Operator::Le, end));
                }
                BoundCondition::Compare(op, value) => predicates.push(compare(op, value)),
                BoundCondition::In(values) => predicates.push(Predicate::in_list(column, values)),
                BoundCondition::Null => predicates.push(Predicate::IsNull(column)),
                BoundCondition::NotNull => predicates.push(Predicate::NotNull(column)),
            }
        }
        Ok(Predicate::all(predicates))
    }

    /// Same conditions as aggregation criteria.
    pub fn into_criteria(self) -> Vec<WhereCriteria> {
        self.conditions
            .into_iter()
            .flat_map(|(field, condition)| match condition {
                BoundCondition::Value(value) => {
                    vec![WhereCriteria::new::<T>(field, Operator::Equal, value)]
                }
                BoundCondition::Range(start, end) => vec![
                    WhereCriteria::new::<T>(field.clone(), Operator::Ge, start),
                    WhereCriteria::new::<T>(field, Operator::Le, end),
                ],
                BoundCondition::Compare(op, value) => {
                    vec![WhereCriteria::new::<T>(field, op, value)]
                }
                BoundCondition::In(values) => vec![WhereCriteria::in_list::<T>(field, values)],
                BoundCondition::Null => {
                    vec![WhereCriteria::new::<T>(field, Operator::IsNull, Value::Null)]
                }
                BoundCondition::NotNull => {
                    vec![WhereCriteria::new::<T>(field, Operator::NotNull, Value::Null)]
                }
            })
            .collect()
    }
}
