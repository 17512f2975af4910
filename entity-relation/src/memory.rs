use std::{
    cmp::Ordering,
    collections::HashMap,
    marker::PhantomData,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::future::{self, BoxFuture};
use log::debug;

use crate::{
    AggregationType, Column, DELETED_FLAG_NORMAL, DynEntity, Entity, EntityMeta, GroupedQuery,
    GroupedRow, Key, Operator, Predicate, QueryContext, Repository, Value, error::Error,
};

type RowPolicy = Arc<dyn Fn(&dyn DynEntity) -> bool + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RepositoryCall {
    GetById,
    GetAllNormal,
    SelectInList,
    Count,
    GroupedSelect,
    ConditionSelect,
}

/// One repository round trip, with the data-permission flag seen at call time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallRecord {
    pub table: &'static str,
    pub call: RepositoryCall,
    pub data_filter: bool,
}

#[derive(Default)]
struct Store {
    tables: HashMap<&'static str, Vec<Box<dyn DynEntity>>>,
    policies: HashMap<&'static str, RowPolicy>,
    journal: Vec<CallRecord>,
}

impl Store {
    fn record(&mut self, table: &'static str, call: RepositoryCall, ctx: &QueryContext) {
        self.journal.push(CallRecord {
            table,
            call,
            data_filter: ctx.data_filter_enabled(),
        });
    }

    /// Rows of `table` the context is allowed to see.
    fn visible(&self, table: &str, ctx: &QueryContext) -> Vec<&dyn DynEntity> {
        let Some(rows) = self.tables.get(table) else {
            return Vec::new();
        };
        let policy = self
            .policies
            .get(table)
            .filter(|_| ctx.data_filter_enabled());
        rows.iter()
            .map(|row| &**row)
            .filter(|row| policy.is_none_or(|allow| allow(*row)))
            .collect()
    }
}

/// In-memory store implementing [`Repository`] for any derived entity.
///
/// Each table may carry a row policy standing in for row-level data
/// permissions; it only applies while the context's data filter is on.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    store: Arc<Mutex<Store>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn repository<E: Entity>(&self) -> MemoryRepository<E> {
        MemoryRepository {
            db: self.clone(),
            _marker: PhantomData,
        }
    }

    /// Inserts `row`, replacing the row with the same id.
    pub fn insert<E: Entity>(&self, row: E) {
        let mut store = self.lock();
        let rows = store.tables.entry(E::meta().table).or_default();
        let id = row.id();
        let existing = id.as_ref().and_then(|id| {
            rows.iter().position(|r| {
                r.field_value(E::meta().id_field).and_then(|v| v.as_key()).as_ref() == Some(id)
            })
        });
        let boxed: Box<dyn DynEntity> = Box::new(row);
        match existing {
            Some(pos) => rows[pos] = boxed,
            None => rows.push(boxed),
        }
    }

    pub fn insert_all<E: Entity>(&self, rows: impl IntoIterator<Item = E>) {
        for row in rows {
            self.insert(row);
        }
    }

    /// Every stored row of `E`, deleted ones included.
    pub fn rows<E: Entity>(&self) -> Vec<E> {
        self.lock()
            .tables
            .get(E::meta().table)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.as_any().downcast_ref::<E>().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_row_policy<E: Entity>(&self, policy: impl Fn(&E) -> bool + Send + Sync + 'static) {
        let policy: RowPolicy = Arc::new(move |row: &dyn DynEntity| {
            row.as_any().downcast_ref::<E>().is_some_and(&policy)
        });
        self.lock().policies.insert(E::meta().table, policy);
    }

    pub fn clear_row_policy<E: Entity>(&self) {
        self.lock().policies.remove(E::meta().table);
    }

    pub fn journal(&self) -> Vec<CallRecord> {
        self.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    /// Number of journaled calls of one kind against one table.
    pub fn calls(&self, table: &str, call: RepositoryCall) -> usize {
        self.lock()
            .journal
            .iter()
            .filter(|record| record.table == table && record.call == call)
            .count()
    }
}

pub struct MemoryRepository<E> {
    db: MemoryDatabase,
    _marker: PhantomData<fn() -> E>,
}

impl<E> Clone for MemoryRepository<E> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            _marker: PhantomData,
        }
    }
}

fn is_normal(row: &dyn DynEntity) -> bool {
    match row.entity_meta().deleted_flag_field {
        Some(field) => row.field_value(field) == Some(Value::Int(DELETED_FLAG_NORMAL)),
        None => true,
    }
}

fn downcast<E: Entity>(rows: Vec<&dyn DynEntity>) -> Vec<E> {
    rows.into_iter()
        .filter_map(|row| row.as_any().downcast_ref::<E>().cloned())
        .collect()
}

fn check_fields(meta: &EntityMeta, fields: &[&str]) -> Result<(), Error> {
    match fields.iter().find(|f| meta.column(f).is_none()) {
        Some(field) => Err(Error::InvalidCriteriaField {
            entity: meta.name,
            field: field.to_string(),
        }),
        None => Ok(()),
    }
}

impl<E: Entity> MemoryRepository<E> {
    fn sorted(&self, mut rows: Vec<&dyn DynEntity>, order_by: &[&str]) -> Vec<E> {
        if !order_by.is_empty() {
            rows.sort_by(|a, b| {
                order_by.iter().fold(Ordering::Equal, |acc, field| {
                    acc.then_with(|| {
                        order_values(
                            &a.field_value(field).unwrap_or_default(),
                            &b.field_value(field).unwrap_or_default(),
                        )
                    })
                })
            });
        }
        downcast(rows)
    }

    fn run_select_in_list(
        &self,
        ctx: &QueryContext,
        field: &str,
        ids: &[Key],
        order_by: &[&str],
    ) -> Result<Vec<E>, Error> {
        let meta = E::meta();
        check_fields(meta, &[field])?;
        check_fields(meta, order_by)?;
        let mut store = self.db.lock();
        store.record(meta.table, RepositoryCall::SelectInList, ctx);
        let rows = store
            .visible(meta.table, ctx)
            .into_iter()
            .filter(|row| is_normal(*row))
            .filter(|row| {
                row.field_value(field)
                    .and_then(|v| v.as_key())
                    .is_some_and(|key| ids.contains(&key))
            })
            .collect();
        Ok(self.sorted(rows, order_by))
    }

    fn run_condition_select(
        &self,
        ctx: &QueryContext,
        filter: &Predicate,
        order_by: &[&str],
    ) -> Result<Vec<E>, Error> {
        let meta = E::meta();
        check_fields(meta, order_by)?;
        let mut store = self.db.lock();
        store.record(meta.table, RepositoryCall::ConditionSelect, ctx);
        let rows = store
            .visible(meta.table, ctx)
            .into_iter()
            .filter(|row| eval(filter, &[*row]))
            .collect();
        Ok(self.sorted(rows, order_by))
    }

    fn run_grouped_select(&self, ctx: &QueryContext, query: &GroupedQuery) -> Vec<GroupedRow> {
        let mut store = self.db.lock();
        store.record(E::meta().table, RepositoryCall::GroupedSelect, ctx);
        debug!("memory grouped select: {}", query);

        // 笛卡尔积后按谓词过滤
        let mut joined: Vec<Vec<&dyn DynEntity>> = vec![Vec::new()];
        for table in &query.tables {
            let rows = store.visible(table, ctx);
            joined = joined
                .into_iter()
                .flat_map(|prefix| {
                    rows.iter().map(move |row| {
                        let mut combined = prefix.clone();
                        combined.push(*row);
                        combined
                    })
                })
                .collect();
        }

        let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();
        let mut index: HashMap<Option<Key>, usize> = HashMap::new();
        for combined in joined.iter().filter(|combined| eval(&query.filter, combined)) {
            let key = column_value(combined, &query.group_key);
            let slot = *index.entry(key.as_key()).or_insert_with(|| {
                groups.push((key.clone(), Vec::new()));
                groups.len() - 1
            });
            let value = column_value(combined, &query.aggregated);
            if !value.is_null() {
                groups[slot].1.push(value);
            }
        }

        groups
            .into_iter()
            .map(|(key, values)| GroupedRow::new(key, aggregate(query.function, values)))
            .collect()
    }
}

impl<E: Entity> Repository<E> for MemoryRepository<E> {
    fn get_by_id<'a>(
        &'a self,
        ctx: &'a QueryContext,
        id: &'a Key,
    ) -> BoxFuture<'a, Result<Option<E>, Error>> {
        let meta = E::meta();
        let mut store = self.db.lock();
        store.record(meta.table, RepositoryCall::GetById, ctx);
        let found = store
            .visible(meta.table, ctx)
            .into_iter()
            .filter(|row| is_normal(*row))
            .find(|row| {
                row.field_value(meta.id_field)
                    .and_then(|v| v.as_key())
                    .as_ref()
                    == Some(id)
            })
            .and_then(|row| row.as_any().downcast_ref::<E>().cloned());
        Box::pin(future::ready(Ok(found)))
    }

    fn get_all_normal<'a>(&'a self, ctx: &'a QueryContext) -> BoxFuture<'a, Result<Vec<E>, Error>> {
        let meta = E::meta();
        let mut store = self.db.lock();
        store.record(meta.table, RepositoryCall::GetAllNormal, ctx);
        let rows: Vec<&dyn DynEntity> = store
            .visible(meta.table, ctx)
            .into_iter()
            .filter(|row| is_normal(*row))
            .collect();
        Box::pin(future::ready(Ok(downcast(rows))))
    }

    fn select_in_list<'a>(
        &'a self,
        ctx: &'a QueryContext,
        field: &'a str,
        ids: &'a [Key],
        order_by: &'a [&'a str],
    ) -> BoxFuture<'a, Result<Vec<E>, Error>> {
        Box::pin(future::ready(self.run_select_in_list(ctx, field, ids, order_by)))
    }

    fn count<'a>(
        &'a self,
        ctx: &'a QueryContext,
        filter: &'a Predicate,
    ) -> BoxFuture<'a, Result<u64, Error>> {
        let meta = E::meta();
        let mut store = self.db.lock();
        store.record(meta.table, RepositoryCall::Count, ctx);
        let count = store
            .visible(meta.table, ctx)
            .into_iter()
            .filter(|row| eval(filter, &[*row]))
            .count();
        Box::pin(future::ready(Ok(count as u64)))
    }

    fn grouped_select<'a>(
        &'a self,
        ctx: &'a QueryContext,
        query: &'a GroupedQuery,
    ) -> BoxFuture<'a, Result<Vec<GroupedRow>, Error>> {
        Box::pin(future::ready(Ok(self.run_grouped_select(ctx, query))))
    }

    fn condition_select<'a>(
        &'a self,
        ctx: &'a QueryContext,
        _select_fields: &'a [&'a str],
        filter: &'a Predicate,
        order_by: &'a [&'a str],
    ) -> BoxFuture<'a, Result<Vec<E>, Error>> {
        Box::pin(future::ready(self.run_condition_select(ctx, filter, order_by)))
    }
}

fn column_value(rows: &[&dyn DynEntity], column: &Column) -> Value {
    rows.iter()
        .find(|row| row.entity_meta().table == column.table)
        .and_then(|row| {
            row.entity_meta()
                .field_of_column(column.column)
                .and_then(|field| row.field_value(field))
        })
        .unwrap_or_default()
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

// NULL 排在最前
fn order_values(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => compare(a, b).unwrap_or(Ordering::Equal),
    }
}

fn like(text: &[char], pattern: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('%', rest)) => (0..=text.len()).any(|i| like(&text[i..], rest)),
        Some(('_', rest)) => !text.is_empty() && like(&text[1..], rest),
        Some((c, rest)) => text.first() == Some(c) && like(&text[1..], rest),
    }
}

fn eval(predicate: &Predicate, rows: &[&dyn DynEntity]) -> bool {
    match predicate {
        Predicate::True => true,
        Predicate::And(inner) => inner.iter().all(|p| eval(p, rows)),
        Predicate::Compare { column, op, value } => {
            let actual = column_value(rows, column);
            match op {
                Operator::IsNull => actual.is_null(),
                Operator::NotNull => !actual.is_null(),
                Operator::Like => match (&actual, value) {
                    (Value::Text(text), Value::Text(pattern)) => {
                        let text: Vec<char> = text.chars().collect();
                        let pattern: Vec<char> = pattern.chars().collect();
                        like(&text, &pattern)
                    }
                    _ => false,
                },
                op => compare(&actual, value).is_some_and(|ord| match op {
                    Operator::Equal | Operator::In => ord == Ordering::Equal,
                    Operator::NotEqual => ord != Ordering::Equal,
                    Operator::Ge => ord != Ordering::Less,
                    Operator::Gt => ord == Ordering::Greater,
                    Operator::Le => ord != Ordering::Greater,
                    Operator::Lt => ord == Ordering::Less,
                    _ => false,
                }),
            }
        }
        Predicate::InList { column, values } => column_value(rows, column)
            .as_key()
            .is_some_and(|key| values.contains(&key)),
        Predicate::IsNull(column) => column_value(rows, column).is_null(),
        Predicate::NotNull(column) => !column_value(rows, column).is_null(),
        Predicate::ColumnsEqual(a, b) => {
            compare(&column_value(rows, a), &column_value(rows, b)) == Some(Ordering::Equal)
        }
    }
}

fn aggregate(function: AggregationType, values: Vec<Value>) -> Value {
    if function == AggregationType::Count {
        return Value::Int(values.len() as i64);
    }
    if values.is_empty() {
        return Value::Null;
    }
    let all_int = values.iter().all(|v| matches!(v, Value::Int(_)));
    let numbers = || values.iter().filter_map(Value::as_f64);
    match function {
        AggregationType::Sum if all_int => Value::Int(
            values
                .iter()
                .map(|v| if let Value::Int(n) = v { *n } else { 0 })
                .sum(),
        ),
        AggregationType::Sum => Value::Float(numbers().sum()),
        AggregationType::Avg => Value::Float(numbers().sum::<f64>() / values.len() as f64),
        AggregationType::Min => values
            .iter()
            .min_by(|a, b| order_values(a, b))
            .cloned()
            .unwrap_or_default(),
        AggregationType::Max => values
            .iter()
            .max_by(|a, b| order_values(a, b))
            .cloned()
            .unwrap_or_default(),
        AggregationType::Count => Value::Int(values.len() as i64),
    }
}
