use futures::future::BoxFuture;

use crate::{Entity, GroupedQuery, Key, Predicate, Value, error::Error};

/// Per-call context handed to every repository operation.
///
/// A context is never changed once built; a call that must read past the
/// caller's row scope derives its own with [`QueryContext::unfiltered`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryContext {
    data_filter: bool,
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryContext {
    /// Context with the row-level data-permission filter on.
    pub fn new() -> Self {
        Self::with_data_filter(true)
    }

    pub fn with_data_filter(enabled: bool) -> Self {
        Self {
            data_filter: enabled,
        }
    }

    pub fn data_filter_enabled(&self) -> bool {
        self.data_filter
    }

    /// Copy of this context with the data-permission filter off.
    pub fn unfiltered(&self) -> Self {
        let mut ctx = self.clone();
        ctx.data_filter = false;
        ctx
    }
}

/// One row of a grouped select.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupedRow {
    pub grouped_key: Value,
    pub aggregated_value: Value,
}

impl GroupedRow {
    pub fn new(grouped_key: impl Into<Value>, aggregated_value: impl Into<Value>) -> Self {
        Self {
            grouped_key: grouped_key.into(),
            aggregated_value: aggregated_value.into(),
        }
    }
}

/// Storage port for one entity type.
///
/// `get_by_id`, `get_all_normal` and `select_in_list` skip soft-deleted rows;
/// the predicate based operations apply exactly the filter they are given.
pub trait Repository<E: Entity>: Send + Sync {
    fn get_by_id<'a>(
        &'a self,
        ctx: &'a QueryContext,
        id: &'a Key,
    ) -> BoxFuture<'a, Result<Option<E>, Error>>;

    fn get_all_normal<'a>(&'a self, ctx: &'a QueryContext) -> BoxFuture<'a, Result<Vec<E>, Error>>;

    /// Rows whose `field` is one of `ids`, ordered by `order_by` fields.
    fn select_in_list<'a>(
        &'a self,
        ctx: &'a QueryContext,
        field: &'a str,
        ids: &'a [Key],
        order_by: &'a [&'a str],
    ) -> BoxFuture<'a, Result<Vec<E>, Error>>;

    fn count<'a>(
        &'a self,
        ctx: &'a QueryContext,
        filter: &'a Predicate,
    ) -> BoxFuture<'a, Result<u64, Error>>;

    fn exists_by_filter<'a>(
        &'a self,
        ctx: &'a QueryContext,
        filter: &'a Predicate,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move { Ok(self.count(ctx, filter).await? > 0) })
    }

    fn grouped_select<'a>(
        &'a self,
        ctx: &'a QueryContext,
        query: &'a GroupedQuery,
    ) -> BoxFuture<'a, Result<Vec<GroupedRow>, Error>>;

    /// Rows matching `filter`. `select_fields` is a projection hint; an empty
    /// slice selects everything.
    fn condition_select<'a>(
        &'a self,
        ctx: &'a QueryContext,
        select_fields: &'a [&'a str],
        filter: &'a Predicate,
        order_by: &'a [&'a str],
    ) -> BoxFuture<'a, Result<Vec<E>, Error>>;
}
