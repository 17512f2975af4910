use std::{collections::HashMap, fmt};

use crate::{Entity, EntityMeta, Key, Value, error::Error, find_entity};

/// Extra aggregation filters keyed by the relation target field they apply to.
pub type CriteriaMap = HashMap<String, Vec<WhereCriteria>>;

/// Fully qualified column reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Column {
    pub table: &'static str,
    pub column: &'static str,
}

impl Column {
    pub const fn new(table: &'static str, column: &'static str) -> Self {
        Self { table, column }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Equal,
    NotEqual,
    Ge,
    Gt,
    Le,
    Lt,
    Like,
    In,
    NotNull,
    IsNull,
}

impl Operator {
    fn symbol(&self) -> &'static str {
        match self {
            Operator::Equal => "=",
            Operator::NotEqual => "<>",
            Operator::Ge => ">=",
            Operator::Gt => ">",
            Operator::Le => "<=",
            Operator::Lt => "<",
            Operator::Like => "LIKE",
            Operator::In => "IN",
            Operator::NotNull => "IS NOT NULL",
            Operator::IsNull => "IS NULL",
        }
    }
}

/// Structured where clause. Adapters render or evaluate it; the engine never
/// produces query text of its own.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    True,
    And(Vec<Predicate>),
    Compare {
        column: Column,
        op: Operator,
        value: Value,
    },
    InList {
        column: Column,
        values: Vec<Key>,
    },
    IsNull(Column),
    NotNull(Column),
    ColumnsEqual(Column, Column),
}

impl Predicate {
    pub fn eq(column: Column, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            column,
            op: Operator::Equal,
            value: value.into(),
        }
    }

    pub fn in_list(column: Column, values: impl IntoIterator<Item = Key>) -> Self {
        Predicate::InList {
            column,
            values: values.into_iter().collect(),
        }
    }

    /// Conjunction that flattens nested `And`s and drops `True`.
    pub fn all(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        let mut flat = Vec::new();
        for predicate in predicates {
            match predicate {
                Predicate::True => {}
                Predicate::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Predicate::True,
            1 => flat.remove(0),
            _ => Predicate::And(flat),
        }
    }

    pub fn and(self, other: Predicate) -> Self {
        Predicate::all([self, other])
    }

    /// Tables referenced anywhere in the predicate, in first-seen order.
    pub fn tables(&self) -> Vec<&'static str> {
        let mut tables = Vec::new();
        self.collect_tables(&mut tables);
        tables
    }

    fn collect_tables(&self, tables: &mut Vec<&'static str>) {
        match self {
            Predicate::True => {}
            Predicate::And(inner) => {
                for predicate in inner {
                    predicate.collect_tables(tables);
                }
            }
            Predicate::Compare { column, .. }
            | Predicate::InList { column, .. }
            | Predicate::IsNull(column)
            | Predicate::NotNull(column) => push_table(tables, column.table),
            Predicate::ColumnsEqual(a, b) => {
                push_table(tables, a.table);
                push_table(tables, b.table);
            }
        }
    }
}

fn push_table(tables: &mut Vec<&'static str>, table: &'static str) {
    if !tables.contains(&table) {
        tables.push(table);
    }
}

impl Default for Predicate {
    fn default() -> Self {
        Predicate::True
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::True => write!(f, "1 = 1"),
            Predicate::And(inner) => {
                for (i, predicate) in inner.iter().enumerate() {
                    if i > 0 {
                        write!(f, " AND ")?;
                    }
                    write!(f, "{}", predicate)?;
                }
                Ok(())
            }
            Predicate::Compare { column, op, value } => {
                write!(f, "{} {} {}", column, op.symbol(), value)
            }
            Predicate::InList { column, values } => {
                write!(f, "{} IN (", column)?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", value)?;
                }
                write!(f, ")")
            }
            Predicate::IsNull(column) => write!(f, "{} IS NULL", column),
            Predicate::NotNull(column) => write!(f, "{} IS NOT NULL", column),
            Predicate::ColumnsEqual(a, b) => write!(f, "{} = {}", a, b),
        }
    }
}

/// Caller supplied filter on one field of one entity type.
#[derive(Clone, Debug)]
pub struct WhereCriteria {
    pub entity: &'static EntityMeta,
    pub field: String,
    pub operator: Operator,
    pub value: Value,
    pub values: Vec<Key>,
}

impl WhereCriteria {
    pub fn new<E: Entity>(
        field: impl Into<String>,
        operator: Operator,
        value: impl Into<Value>,
    ) -> Self {
        Self::for_meta(E::meta(), field, operator, value)
    }

    pub fn in_list<E: Entity>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = Key>,
    ) -> Self {
        Self {
            entity: E::meta(),
            field: field.into(),
            operator: Operator::In,
            value: Value::Null,
            values: values.into_iter().collect(),
        }
    }

    /// Criteria on an entity known only by name, e.g. when decoded from a request.
    pub fn by_name(
        entity: &str,
        field: impl Into<String>,
        operator: Operator,
        value: impl Into<Value>,
    ) -> Result<Self, Error> {
        let meta = find_entity(entity).ok_or_else(|| Error::UnknownEntity(entity.to_string()))?;
        Ok(Self::for_meta(meta, field, operator, value))
    }

    fn for_meta(
        entity: &'static EntityMeta,
        field: impl Into<String>,
        operator: Operator,
        value: impl Into<Value>,
    ) -> Self {
        let value = value.into();
        // 标量 IN 视为单元素列表
        let values = match (operator, value.as_key()) {
            (Operator::In, Some(key)) => vec![key],
            _ => Vec::new(),
        };
        Self {
            entity,
            field: field.into(),
            operator,
            value,
            values,
        }
    }

    pub fn references(&self, meta: &EntityMeta) -> bool {
        self.entity.is(meta)
    }

    pub fn to_predicate(&self) -> Result<Predicate, Error> {
        let column = self
            .entity
            .column(&self.field)
            .ok_or_else(|| Error::InvalidCriteriaField {
                entity: self.entity.name,
                field: self.field.clone(),
            })?;
        Ok(match self.operator {
            Operator::In if self.values.is_empty() => {
                return Err(Error::InvalidCriteriaValue {
                    entity: self.entity.name,
                    field: self.field.clone(),
                    reason: "IN needs at least one value".to_string(),
                });
            }
            Operator::In => Predicate::InList {
                column,
                values: self.values.clone(),
            },
            Operator::IsNull => Predicate::IsNull(column),
            Operator::NotNull => Predicate::NotNull(column),
            op => Predicate::Compare {
                column,
                op,
                value: self.value.clone(),
            },
        })
    }

    /// Renders a criteria list into one conjunction.
    pub fn combine(criteria: &[WhereCriteria]) -> Result<Predicate, Error> {
        let predicates = criteria
            .iter()
            .map(WhereCriteria::to_predicate)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Predicate::all(predicates))
    }
}
