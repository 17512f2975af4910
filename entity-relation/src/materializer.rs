use std::collections::{BTreeSet, HashMap};

use log::{debug, warn};

use crate::{
    AggregationQueryBuilder, CriteriaMap, DictItem, DictRelation, DynEntity, Entity, GroupedQuery,
    GroupedRow, Key, MasterScope, QueryContext, Related, RelationRegistry, Repository, Value,
    WhereCriteria, error::Error,
};

/// How far a materialization pass goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Constant and foreign dictionaries only.
    DictOnly,
    /// Dictionaries, one-to-one objects and, where requested, aggregates.
    Full,
}

/// Batched relation fill for records of one entity type.
///
/// Every relation costs at most one repository round trip per call, however
/// many records are passed. Within one call one-to-one objects are loaded
/// before dictionaries so a dictionary marked `equal_one_to_one` can read its
/// item from the nested object; aggregates run last. Every fetch runs on an
/// unfiltered copy of the caller's context, which itself is left untouched.
pub struct Materializer<'a, E: Entity> {
    relations: &'a RelationRegistry,
    repository: &'a dyn Repository<E>,
    ctx: QueryContext,
}

/// Sorted distinct keys of `field` across `records`.
fn collect_keys<E: Entity>(records: &[E], field: &str) -> Vec<Key> {
    records
        .iter()
        .filter_map(|record| record.key(field))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn criteria_for<'c>(criteria: Option<&'c CriteriaMap>, field: &str) -> &'c [WhereCriteria] {
    criteria
        .and_then(|map| map.get(field))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn dict_item(object: &dyn DynEntity, relation: &DictRelation) -> Option<DictItem> {
    let id = object.field_value(&relation.slave_id_field)?.as_key()?;
    let label = object
        .field_value(&relation.label_field)
        .map(|v| v.to_label())
        .unwrap_or_default();
    Some(DictItem { id, label })
}

impl<'a, E: Entity> Materializer<'a, E> {
    pub fn new(
        relations: &'a RelationRegistry,
        repository: &'a dyn Repository<E>,
        ctx: &QueryContext,
    ) -> Self {
        Self {
            relations,
            repository,
            ctx: ctx.unfiltered(),
        }
    }

    /// Dictionary relations, plus one-to-one objects in [`Mode::Full`].
    pub async fn build_relations(&self, records: &mut [E], mode: Mode) -> Result<(), Error> {
        if records.is_empty() || self.relations.is_empty() {
            return Ok(());
        }
        if mode == Mode::Full {
            self.build_one_to_ones(records).await?;
        }
        self.build_const_dicts(records)?;
        self.build_dicts(records, mode).await
    }

    /// One-to-many and many-to-many aggregates, one grouped query per relation.
    pub async fn build_aggregations(
        &self,
        records: &mut [E],
        criteria: Option<&CriteriaMap>,
    ) -> Result<(), Error> {
        if records.is_empty() || !self.relations.has_aggregations() {
            return Ok(());
        }

        for relation in &self.relations.many_to_many {
            let ids = collect_keys(records, &relation.master_id_field);
            if ids.is_empty() {
                continue;
            }
            let scope = MasterScope::Many(ids);
            let extra = criteria_for(criteria, &relation.field);
            let query = AggregationQueryBuilder::new(&scope, extra).many_to_many(relation)?;
            let rows = self.grouped(&relation.field, &query).await?;
            merge_grouped(records, &relation.master_id_field, &relation.field, rows)?;
        }
        for relation in &self.relations.one_to_many {
            let ids = collect_keys(records, &relation.master_id_field);
            if ids.is_empty() {
                continue;
            }
            let scope = MasterScope::Many(ids);
            let extra = criteria_for(criteria, &relation.field);
            let query = AggregationQueryBuilder::new(&scope, extra).one_to_many(relation)?;
            let rows = self.grouped(&relation.field, &query).await?;
            merge_grouped(records, &relation.master_id_field, &relation.field, rows)?;
        }
        Ok(())
    }

    /// Single record variant of [`Self::build_aggregations`], scoped by equality.
    pub async fn build_aggregation(
        &self,
        record: &mut E,
        criteria: Option<&CriteriaMap>,
    ) -> Result<(), Error> {
        if !self.relations.has_aggregations() {
            return Ok(());
        }

        for relation in &self.relations.many_to_many {
            let Some(id) = record.key(&relation.master_id_field) else {
                continue;
            };
            let scope = MasterScope::One(id);
            let extra = criteria_for(criteria, &relation.field);
            let query = AggregationQueryBuilder::new(&scope, extra).many_to_many(relation)?;
            let rows = self.grouped(&relation.field, &query).await?;
            assign_single(record, &relation.field, rows)?;
        }
        for relation in &self.relations.one_to_many {
            let Some(id) = record.key(&relation.master_id_field) else {
                continue;
            };
            let scope = MasterScope::One(id);
            let extra = criteria_for(criteria, &relation.field);
            let query = AggregationQueryBuilder::new(&scope, extra).one_to_many(relation)?;
            let rows = self.grouped(&relation.field, &query).await?;
            assign_single(record, &relation.field, rows)?;
        }
        Ok(())
    }

    /// Everything `mode` covers; aggregates only in [`Mode::Full`].
    pub async fn materialize(
        &self,
        records: &mut [E],
        mode: Mode,
        criteria: Option<&CriteriaMap>,
    ) -> Result<(), Error> {
        self.build_relations(records, mode).await?;
        if mode == Mode::Full {
            self.build_aggregations(records, criteria).await?;
        }
        Ok(())
    }

    pub async fn materialize_one(
        &self,
        record: &mut E,
        mode: Mode,
        criteria: Option<&CriteriaMap>,
    ) -> Result<(), Error> {
        self.build_relations(std::slice::from_mut(record), mode).await?;
        if mode == Mode::Full {
            self.build_aggregation(record, criteria).await?;
        }
        Ok(())
    }

    async fn grouped(
        &self,
        field: &str,
        query: &GroupedQuery,
    ) -> Result<Vec<GroupedRow>, Error> {
        debug!("{}.{}: {}", E::meta().name, field, query);
        self.repository.grouped_select(&self.ctx, query).await
    }

    async fn build_one_to_ones(&self, records: &mut [E]) -> Result<(), Error> {
        for relation in &self.relations.one_to_ones {
            let ids = collect_keys(records, &relation.master_id_field);
            if ids.is_empty() {
                continue;
            }
            debug!(
                "{}.{}: fetching {} objects from {}",
                E::meta().name,
                relation.field,
                ids.len(),
                relation.target.name()
            );
            let objects = relation
                .target
                .fetch_related(&self.ctx, &relation.slave_id_field, &ids, relation.load_slave_dict)
                .await?;
            let by_id: HashMap<Key, Box<dyn DynEntity>> = objects
                .into_iter()
                .filter_map(|object| {
                    let id = object.field_value(&relation.slave_id_field)?.as_key()?;
                    Some((id, object))
                })
                .collect();
            for record in records.iter_mut() {
                let Some(object) = record
                    .key(&relation.master_id_field)
                    .and_then(|id| by_id.get(&id))
                else {
                    continue;
                };
                record.assign(&relation.field, Related::Object(object.clone_boxed()))?;
            }
        }
        Ok(())
    }

    fn build_const_dicts(&self, records: &mut [E]) -> Result<(), Error> {
        for relation in &self.relations.const_dicts {
            for record in records.iter_mut() {
                let Some(id) = record.key(&relation.master_id_field) else {
                    continue;
                };
                let Some(label) = relation.dictionary.label(&id) else {
                    continue;
                };
                let item = DictItem::new(id, label);
                record.assign(&relation.field, Related::Dict(item))?;
            }
        }
        Ok(())
    }

    async fn build_dicts(&self, records: &mut [E], mode: Mode) -> Result<(), Error> {
        for relation in &self.relations.dicts {
            let reuse = match (&relation.equal_one_to_one, mode) {
                (Some(nested), Mode::Full) => Some(nested.as_str()),
                _ => None,
            };

            // 已加载一对一对象的记录直接取其字典项，其余记录批量查询
            let mut items: Vec<Option<DictItem>> = Vec::with_capacity(records.len());
            let mut pending = BTreeSet::new();
            for record in records.iter() {
                let item = reuse
                    .and_then(|nested| record.nested(nested))
                    .and_then(|object| dict_item(object, relation));
                if item.is_none() {
                    if let Some(id) = record.key(&relation.master_id_field) {
                        pending.insert(id);
                    }
                }
                items.push(item);
            }

            let mut fetched: HashMap<Key, DictItem> = HashMap::new();
            if !pending.is_empty() {
                let ids: Vec<Key> = pending.into_iter().collect();
                debug!(
                    "{}.{}: fetching {} dictionary items from {}",
                    E::meta().name,
                    relation.field,
                    ids.len(),
                    relation.target.name()
                );
                let objects = relation
                    .target
                    .fetch_related(&self.ctx, &relation.slave_id_field, &ids, false)
                    .await?;
                for object in &objects {
                    if let Some(item) = dict_item(&**object, relation) {
                        fetched.insert(item.id.clone(), item);
                    }
                }
            }

            for (record, item) in records.iter_mut().zip(items) {
                let item = item.or_else(|| {
                    record
                        .key(&relation.master_id_field)
                        .and_then(|id| fetched.get(&id).cloned())
                });
                if let Some(item) = item {
                    record.assign(&relation.field, Related::Dict(item))?;
                }
            }
        }
        Ok(())
    }
}

fn merge_grouped<E: Entity>(
    records: &mut [E],
    master_id_field: &str,
    field: &str,
    rows: Vec<GroupedRow>,
) -> Result<(), Error> {
    let mut values: HashMap<Key, Value> = HashMap::with_capacity(rows.len());
    for row in rows {
        match row.grouped_key.as_key() {
            Some(key) if !row.aggregated_value.is_null() => {
                values.insert(key, row.aggregated_value);
            }
            Some(_) => {}
            None => warn!(
                "{}.{}: dropping grouped row without a usable key: {}",
                E::meta().name,
                field,
                row.grouped_key
            ),
        }
    }
    for record in records.iter_mut() {
        let Some(value) = record
            .key(master_id_field)
            .and_then(|id| values.get(&id).cloned())
        else {
            continue;
        };
        record.assign(field, Related::Aggregate(value))?;
    }
    Ok(())
}

fn assign_single<E: Entity>(
    record: &mut E,
    field: &str,
    rows: Vec<GroupedRow>,
) -> Result<(), Error> {
    match rows.into_iter().next() {
        Some(row) if !row.aggregated_value.is_null() => {
            record.assign(field, Related::Aggregate(row.aggregated_value))
        }
        _ => Ok(()),
    }
}
