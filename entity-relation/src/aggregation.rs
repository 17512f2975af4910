use std::{fmt, str::FromStr};

use crate::{
    AggregationHost, Column, DELETED_FLAG_NORMAL, EntityMeta, Key, ManyToManyAggregation,
    OneToManyAggregation, Predicate, WhereCriteria, error::Error,
};

/// Alias of the grouping column in a grouped select.
pub const GROUPED_KEY: &str = "groupedKey";
/// Alias of the aggregate column in a grouped select.
pub const AGGREGATED_VALUE: &str = "aggregatedValue";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AggregationType {
    Sum,
    Count,
    Avg,
    Min,
    Max,
}

impl AggregationType {
    pub const ALL: [AggregationType; 5] = [
        AggregationType::Sum,
        AggregationType::Count,
        AggregationType::Avg,
        AggregationType::Min,
        AggregationType::Max,
    ];

    pub const fn code(&self) -> i32 {
        match self {
            AggregationType::Sum => 0,
            AggregationType::Count => 1,
            AggregationType::Avg => 2,
            AggregationType::Min => 3,
            AggregationType::Max => 4,
        }
    }

    pub const fn function(&self) -> &'static str {
        match self {
            AggregationType::Sum => "SUM",
            AggregationType::Count => "COUNT",
            AggregationType::Avg => "AVG",
            AggregationType::Min => "MIN",
            AggregationType::Max => "MAX",
        }
    }
}

impl fmt::Display for AggregationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.function())
    }
}

impl TryFrom<i32> for AggregationType {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        AggregationType::ALL
            .into_iter()
            .find(|t| t.code() == code)
            .ok_or_else(|| code.to_string())
    }
}

impl FromStr for AggregationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        AggregationType::ALL
            .into_iter()
            .find(|t| t.function().eq_ignore_ascii_case(name))
            .ok_or_else(|| s.to_string())
    }
}

/// Aggregation type as declared, checked against the legal set at registration.
#[derive(Clone, Debug, PartialEq)]
pub enum AggregationSpec {
    Type(AggregationType),
    Code(i32),
    Name(String),
}

impl AggregationSpec {
    pub fn resolve(&self, model: &EntityMeta) -> Result<AggregationType, Error> {
        let parsed = match self {
            AggregationSpec::Type(t) => Ok(*t),
            AggregationSpec::Code(code) => AggregationType::try_from(*code),
            AggregationSpec::Name(name) => name.parse(),
        };
        parsed.map_err(|value| Error::InvalidAggregationType {
            entity: model.name,
            value,
        })
    }
}

impl From<AggregationType> for AggregationSpec {
    fn from(t: AggregationType) -> Self {
        AggregationSpec::Type(t)
    }
}

impl From<i32> for AggregationSpec {
    fn from(code: i32) -> Self {
        AggregationSpec::Code(code)
    }
}

impl From<&str> for AggregationSpec {
    fn from(name: &str) -> Self {
        AggregationSpec::Name(name.to_string())
    }
}

/// Master ids an aggregation is computed for.
#[derive(Clone, Debug, PartialEq)]
pub enum MasterScope {
    One(Key),
    Many(Vec<Key>),
}

impl MasterScope {
    fn predicate(&self, column: Column) -> Predicate {
        match self {
            MasterScope::One(id) => Predicate::eq(column, id.clone()),
            MasterScope::Many(ids) => Predicate::in_list(column, ids.iter().cloned()),
        }
    }
}

/// Structured `SELECT key, FN(col) ... GROUP BY key` specification.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupedQuery {
    pub tables: Vec<&'static str>,
    pub group_key: Column,
    pub function: AggregationType,
    pub aggregated: Column,
    pub filter: Predicate,
}

impl GroupedQuery {
    pub fn select_list(&self) -> String {
        format!(
            "{} {}, {}({}) {}",
            self.group_key, GROUPED_KEY, self.function, self.aggregated, AGGREGATED_VALUE
        )
    }

    pub fn group_by(&self) -> String {
        self.group_key.to_string()
    }

    pub fn joins(&self, table: &str) -> bool {
        self.tables.contains(&table)
    }
}

impl fmt::Display for GroupedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SELECT {} FROM {} WHERE {} GROUP BY {}",
            self.select_list(),
            self.tables.join(", "),
            self.filter,
            self.group_by()
        )
    }
}

fn mapped_column(meta: &EntityMeta, field: &str, role: &str) -> Result<Column, Error> {
    meta.column(field).ok_or_else(|| Error::InvalidRelation {
        entity: meta.name,
        field: field.to_string(),
        reason: format!("{} field is not a persistent field of {}", role, meta.name),
    })
}

fn aggregated_column(meta: &EntityMeta, field: &str) -> Result<Column, Error> {
    meta.column(field).ok_or_else(|| Error::InvalidAggregationField {
        entity: meta.name,
        field: field.to_string(),
    })
}

fn normal_rows(meta: &EntityMeta) -> Predicate {
    meta.deleted_flag_column()
        .map(|column| Predicate::eq(column, DELETED_FLAG_NORMAL))
        .unwrap_or_default()
}

/// Builds grouped aggregate queries for the two aggregation relation kinds.
///
/// Filter terms are ordered: join predicate, master id scope, soft-delete
/// terms, caller criteria.
pub struct AggregationQueryBuilder<'a> {
    scope: &'a MasterScope,
    criteria: &'a [WhereCriteria],
}

impl<'a> AggregationQueryBuilder<'a> {
    pub fn new(scope: &'a MasterScope, criteria: &'a [WhereCriteria]) -> Self {
        Self { scope, criteria }
    }

    pub fn one_to_many(&self, relation: &OneToManyAggregation) -> Result<GroupedQuery, Error> {
        let slave = relation.slave;
        let group_key = mapped_column(slave, &relation.slave_id_field, "slave id")?;
        let aggregated = aggregated_column(slave, &relation.aggregation_field)?;

        let mut filter = vec![self.scope.predicate(group_key), normal_rows(slave)];
        filter.push(WhereCriteria::combine(self.criteria)?);

        Ok(GroupedQuery {
            tables: vec![slave.table],
            group_key,
            function: relation.aggregation,
            aggregated,
            filter: Predicate::all(filter),
        })
    }

    pub fn many_to_many(&self, relation: &ManyToManyAggregation) -> Result<GroupedQuery, Error> {
        let bridge = relation.bridge;
        let slave = relation.slave;
        let group_key = mapped_column(bridge, &relation.bridge_master_field, "bridge master")?;
        let bridge_slave = mapped_column(bridge, &relation.bridge_slave_field, "bridge slave")?;
        let slave_id = mapped_column(slave, &relation.slave_id_field, "slave id")?;
        let aggregated = match relation.host {
            AggregationHost::Bridge => aggregated_column(bridge, &relation.aggregation_field)?,
            AggregationHost::Slave => aggregated_column(slave, &relation.aggregation_field)?,
        };

        // 聚合字段在中间表且过滤条件不涉及从表时，省略从表关联
        // Without the join the far side's deleted flag is not applied: bridge
        // rows pointing at soft-deleted far-side rows are still aggregated.
        let join_slave = relation.host == AggregationHost::Slave
            || self.criteria.iter().any(|c| c.references(slave));

        let mut tables = vec![bridge.table];
        let mut filter = Vec::new();
        if join_slave {
            tables.push(slave.table);
            filter.push(Predicate::ColumnsEqual(bridge_slave, slave_id));
        }
        filter.push(self.scope.predicate(group_key));
        filter.push(normal_rows(bridge));
        if join_slave {
            filter.push(normal_rows(slave));
        }
        filter.push(WhereCriteria::combine(self.criteria)?);

        Ok(GroupedQuery {
            tables,
            group_key,
            function: relation.aggregation,
            aggregated,
            filter: Predicate::all(filter),
        })
    }
}
