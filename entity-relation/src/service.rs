use std::{
    collections::BTreeSet,
    fmt,
    sync::{Arc, OnceLock},
};

use futures::future::BoxFuture;
use log::{debug, info};

use crate::{
    CriteriaMap, DELETED_FLAG_NORMAL, DictionaryCache, DynEntity, Entity, EntityMeta, GroupedQuery,
    GroupedRow, Key, Materializer, Mode, Predicate, QueryContext, RelationDecl, RelationRegistry,
    Repository, ServiceRegistry, Value, error::Error,
};

/// Object-safe face of an entity service, used by relations pointing at it.
pub trait RelationTarget: Send + Sync {
    fn name(&self) -> &str;

    fn meta(&self) -> &'static EntityMeta;

    fn resolve_relations(&self, services: &ServiceRegistry) -> Result<(), Error>;

    fn load_cache<'a>(&'a self, ctx: &'a QueryContext) -> BoxFuture<'a, Result<(), Error>>;

    /// Normal rows whose `field` is in `ids`, dictionary-enriched on request.
    fn fetch_related<'a>(
        &'a self,
        ctx: &'a QueryContext,
        field: &'a str,
        ids: &'a [Key],
        dict_enrich: bool,
    ) -> BoxFuture<'a, Result<Vec<Box<dyn DynEntity>>, Error>>;
}

#[derive(Clone, Debug)]
pub struct ServiceOptions {
    /// Fill the dictionary cache during [`ServiceRegistry::initialize`].
    pub load_on_startup: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            load_on_startup: true,
        }
    }
}

type CriteriaHook = Box<dyn Fn() -> CriteriaMap + Send + Sync>;

/// Read service of one entity type: plain reads, enriched reads and, when a
/// dictionary cache is attached, cache backed lookups.
pub struct EntityService<E: Entity> {
    name: String,
    repository: Arc<dyn Repository<E>>,
    declared: Vec<RelationDecl>,
    relations: OnceLock<RelationRegistry>,
    dictionary: Option<Arc<dyn DictionaryCache<Key, E>>>,
    options: ServiceOptions,
    aggregation_criteria: Option<CriteriaHook>,
}

impl<E: Entity> fmt::Debug for EntityService<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityService")
            .field("name", &self.name)
            .field("entity", &E::meta().name)
            .field("relations", &self.relations.get())
            .field("dictionary", &self.dictionary.is_some())
            .field("options", &self.options)
            .finish()
    }
}

fn normal_rows(meta: &EntityMeta, filter: Predicate) -> Predicate {
    match meta.deleted_flag_column() {
        Some(column) => filter.and(Predicate::eq(column, DELETED_FLAG_NORMAL)),
        None => filter,
    }
}

fn distinct(ids: &[Key]) -> Vec<Key> {
    ids.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect()
}

impl<E: Entity> EntityService<E> {
    pub fn new(name: impl Into<String>, repository: Arc<dyn Repository<E>>) -> Self {
        Self {
            name: name.into(),
            repository,
            declared: Vec::new(),
            relations: OnceLock::new(),
            dictionary: None,
            options: ServiceOptions::default(),
            aggregation_criteria: None,
        }
    }

    pub fn with_relation(mut self, decl: impl Into<RelationDecl>) -> Self {
        self.declared.push(decl.into());
        self
    }

    /// Turns this into a dictionary service backed by `cache`.
    pub fn with_dictionary_cache(mut self, cache: Arc<dyn DictionaryCache<Key, E>>) -> Self {
        self.dictionary = Some(cache);
        self
    }

    pub fn with_options(mut self, options: ServiceOptions) -> Self {
        self.options = options;
        self
    }

    /// Default aggregation criteria used by the enriched reads.
    pub fn with_aggregation_criteria(
        mut self,
        hook: impl Fn() -> CriteriaMap + Send + Sync + 'static,
    ) -> Self {
        self.aggregation_criteria = Some(Box::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn repository(&self) -> &dyn Repository<E> {
        self.repository.as_ref()
    }

    pub fn dictionary_cache(&self) -> Option<&Arc<dyn DictionaryCache<Key, E>>> {
        self.dictionary.as_ref()
    }

    pub fn is_dictionary(&self) -> bool {
        self.dictionary.is_some()
    }

    pub fn relations(&self) -> Result<&RelationRegistry, Error> {
        self.relations
            .get()
            .ok_or(Error::RelationsNotLoaded(E::meta().name))
    }

    pub fn load_relations(&self, services: &ServiceRegistry) -> Result<(), Error> {
        let registry = RelationRegistry::register(E::meta(), &self.declared, services)?;
        let count = registry.len();
        self.relations
            .set(registry)
            .map_err(|_| Error::RelationsAlreadyLoaded(E::meta().name))?;
        info!("{}: resolved {} relations for {}", self.name, count, E::meta().name);
        Ok(())
    }

    fn materializer<'a>(&'a self, ctx: &'a QueryContext) -> Result<Materializer<'a, E>, Error> {
        Ok(Materializer::new(self.relations()?, self.repository.as_ref(), ctx))
    }

    fn default_criteria(&self) -> Option<CriteriaMap> {
        self.aggregation_criteria.as_ref().map(|hook| hook())
    }

    // ---- plain reads ----------------------------------------------------

    pub async fn get_by_id(&self, ctx: &QueryContext, id: &Key) -> Result<Option<E>, Error> {
        let Some(cache) = &self.dictionary else {
            return self.repository.get_by_id(ctx, id).await;
        };
        if let Some(hit) = cache.get(id) {
            return Ok(Some(hit));
        }
        let fetched = self.repository.get_by_id(ctx, id).await?;
        if let Some(row) = &fetched {
            cache.put(id.clone(), row.clone());
        }
        Ok(fetched)
    }

    pub async fn exist_id(&self, ctx: &QueryContext, id: &Key) -> Result<bool, Error> {
        Ok(self.get_by_id(ctx, id).await?.is_some())
    }

    pub async fn get_all_list(&self, ctx: &QueryContext) -> Result<Vec<E>, Error> {
        self.repository.get_all_normal(ctx).await
    }

    pub async fn get_all_list_by_order(
        &self,
        ctx: &QueryContext,
        order_by: &[&str],
    ) -> Result<Vec<E>, Error> {
        let filter = normal_rows(E::meta(), Predicate::True);
        self.repository
            .condition_select(ctx, &[], &filter, order_by)
            .await
    }

    /// Rows by id. Dictionary services answer from the cache and backfill misses.
    pub async fn get_in_list(&self, ctx: &QueryContext, ids: &[Key]) -> Result<Vec<E>, Error> {
        let ids = distinct(ids);
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let id_field = E::meta().id_field;
        let Some(cache) = &self.dictionary else {
            return self.repository.select_in_list(ctx, id_field, &ids, &[]).await;
        };

        let mut rows = cache.get_in_list(&ids);
        if rows.len() < ids.len() {
            let cached: BTreeSet<Key> = rows.iter().filter_map(|row| row.id()).collect();
            let missing: Vec<Key> = ids.into_iter().filter(|id| !cached.contains(id)).collect();
            debug!("{}: backfilling {} dictionary entries", self.name, missing.len());
            let fetched = self
                .repository
                .select_in_list(ctx, id_field, &missing, &[])
                .await?;
            for row in &fetched {
                if let Some(id) = row.id() {
                    cache.put(id, row.clone());
                }
            }
            rows.extend(fetched);
        }
        Ok(rows)
    }

    pub async fn get_in_list_by_field(
        &self,
        ctx: &QueryContext,
        field: &str,
        values: &[Key],
    ) -> Result<Vec<E>, Error> {
        if field == E::meta().id_field {
            return self.get_in_list(ctx, values).await;
        }
        let values = distinct(values);
        if values.is_empty() {
            return Ok(Vec::new());
        }
        self.repository.select_in_list(ctx, field, &values, &[]).await
    }

    /// Whether every distinct value of `values` exists in `field`.
    pub async fn exist_unique_key_list(
        &self,
        ctx: &QueryContext,
        field: &str,
        values: &[Key],
    ) -> Result<bool, Error> {
        let expected = distinct(values);
        let found: BTreeSet<Key> = self
            .get_in_list_by_field(ctx, field, &expected)
            .await?
            .iter()
            .filter_map(|row| row.key(field))
            .collect();
        Ok(found.len() == expected.len())
    }

    pub async fn get_count_by_filter(
        &self,
        ctx: &QueryContext,
        filter: Predicate,
    ) -> Result<u64, Error> {
        let filter = normal_rows(E::meta(), filter);
        self.repository.count(ctx, &filter).await
    }

    pub async fn exist_by_filter(
        &self,
        ctx: &QueryContext,
        filter: Predicate,
    ) -> Result<bool, Error> {
        let filter = normal_rows(E::meta(), filter);
        self.repository.exists_by_filter(ctx, &filter).await
    }

    pub async fn get_list_by_filter(
        &self,
        ctx: &QueryContext,
        filter: Predicate,
        order_by: &[&str],
    ) -> Result<Vec<E>, Error> {
        let filter = normal_rows(E::meta(), filter);
        self.repository
            .condition_select(ctx, &[], &filter, order_by)
            .await
    }

    /// Raw conditional select; soft-deleted rows are only excluded when `filter` says so.
    pub async fn get_list_by_condition(
        &self,
        ctx: &QueryContext,
        select_fields: &[&str],
        filter: Predicate,
        order_by: &[&str],
    ) -> Result<Vec<E>, Error> {
        self.repository
            .condition_select(ctx, select_fields, &filter, order_by)
            .await
    }

    pub async fn get_grouped_list(
        &self,
        ctx: &QueryContext,
        query: &GroupedQuery,
    ) -> Result<Vec<GroupedRow>, Error> {
        self.repository.grouped_select(ctx, query).await
    }

    /// Whether `field` of `data` carries a new non-empty value that must be validated.
    pub fn needs_verify(&self, data: &E, original: Option<&E>, field: &str) -> bool {
        let value = data.value(field).unwrap_or_default();
        match &value {
            Value::Null => return false,
            Value::Text(text) if text.is_empty() => return false,
            _ => {}
        }
        match original {
            None => true,
            Some(original) => original.value(field).unwrap_or_default() != value,
        }
    }

    // ---- enriched reads -------------------------------------------------

    pub async fn get_by_id_with_relation(
        &self,
        ctx: &QueryContext,
        id: &Key,
        mode: Mode,
    ) -> Result<Option<E>, Error> {
        let Some(mut row) = self.get_by_id(ctx, id).await? else {
            return Ok(None);
        };
        let criteria = self.default_criteria();
        self.build_all_relation_for_data(ctx, &mut row, mode, criteria.as_ref())
            .await?;
        Ok(Some(row))
    }

    /// All normal rows with dictionary (and, in full mode, one-to-one) relations.
    pub async fn get_all_list_with_relation(
        &self,
        ctx: &QueryContext,
        mode: Mode,
    ) -> Result<Vec<E>, Error> {
        let mut rows = self.get_all_list(ctx).await?;
        self.build_relation_for_data_list(ctx, &mut rows, mode).await?;
        Ok(rows)
    }

    pub async fn get_list_with_relation_by_filter(
        &self,
        ctx: &QueryContext,
        filter: Predicate,
        order_by: &[&str],
        mode: Mode,
    ) -> Result<Vec<E>, Error> {
        let mut rows = self.get_list_by_filter(ctx, filter, order_by).await?;
        let criteria = self.default_criteria();
        self.build_all_relation_for_data_list(ctx, &mut rows, mode, criteria.as_ref())
            .await?;
        Ok(rows)
    }

    // ---- materialization ------------------------------------------------

    pub async fn build_relation_for_data_list(
        &self,
        ctx: &QueryContext,
        rows: &mut [E],
        mode: Mode,
    ) -> Result<(), Error> {
        self.materializer(ctx)?.build_relations(rows, mode).await
    }

    pub async fn build_relation_for_data(
        &self,
        ctx: &QueryContext,
        row: &mut E,
        mode: Mode,
    ) -> Result<(), Error> {
        self.materializer(ctx)?
            .build_relations(std::slice::from_mut(row), mode)
            .await
    }

    pub async fn build_aggregation_relation_for_data_list(
        &self,
        ctx: &QueryContext,
        rows: &mut [E],
        criteria: Option<&CriteriaMap>,
    ) -> Result<(), Error> {
        self.materializer(ctx)?
            .build_aggregations(rows, criteria)
            .await
    }

    pub async fn build_aggregation_relation_for_data(
        &self,
        ctx: &QueryContext,
        row: &mut E,
        criteria: Option<&CriteriaMap>,
    ) -> Result<(), Error> {
        self.materializer(ctx)?
            .build_aggregation(row, criteria)
            .await
    }

    pub async fn build_all_relation_for_data_list(
        &self,
        ctx: &QueryContext,
        rows: &mut [E],
        mode: Mode,
        criteria: Option<&CriteriaMap>,
    ) -> Result<(), Error> {
        self.materializer(ctx)?
            .materialize(rows, mode, criteria)
            .await
    }

    pub async fn build_all_relation_for_data(
        &self,
        ctx: &QueryContext,
        row: &mut E,
        mode: Mode,
        criteria: Option<&CriteriaMap>,
    ) -> Result<(), Error> {
        self.materializer(ctx)?
            .materialize_one(row, mode, criteria)
            .await
    }

    // ---- dictionary -----------------------------------------------------

    /// Loads the dictionary cache if this service is configured to load on startup.
    pub async fn load_cached_data(&self, ctx: &QueryContext) -> Result<(), Error> {
        if self.dictionary.is_none() {
            return Ok(());
        }
        if !self.options.load_on_startup {
            info!("{}: dictionary cache left cold", self.name);
            return Ok(());
        }
        self.reload_cached_data(ctx, false).await
    }

    /// Refills the dictionary cache from the repository. Without `force` a
    /// non-empty cache keeps its content.
    pub async fn reload_cached_data(&self, ctx: &QueryContext, force: bool) -> Result<(), Error> {
        let Some(cache) = &self.dictionary else {
            return Ok(());
        };
        let rows = self.repository.get_all_normal(&ctx.unfiltered()).await?;
        cache.reload(rows, force);
        info!("{}: dictionary cache holds {} entries", self.name, cache.count());
        Ok(())
    }

    pub fn put_dictionary_cache(&self, row: &E) {
        if let (Some(cache), Some(id)) = (&self.dictionary, row.id()) {
            cache.put(id, row.clone());
        }
    }

    pub fn remove_dictionary_cache(&self, id: &Key) -> Option<E> {
        self.dictionary.as_ref().and_then(|cache| cache.invalidate(id))
    }

    pub fn cached_count(&self) -> usize {
        self.dictionary.as_ref().map_or(0, |cache| cache.count())
    }

    pub fn get_all_list_from_cache(&self) -> Vec<E> {
        self.dictionary
            .as_ref()
            .map(|cache| cache.get_all())
            .unwrap_or_default()
    }

    /// Children of `parent_id`. Tree dictionaries answer from the cache; any
    /// other service queries `parent_field`.
    pub async fn get_list_by_parent_id(
        &self,
        ctx: &QueryContext,
        parent_field: &str,
        parent_id: Option<&Key>,
    ) -> Result<Vec<E>, Error> {
        if let Some(children) = self
            .dictionary
            .as_ref()
            .and_then(|cache| cache.get_list_by_parent_id(parent_id))
        {
            return Ok(children);
        }
        let meta = E::meta();
        let column = meta.column(parent_field).ok_or_else(|| Error::InvalidCriteriaField {
            entity: meta.name,
            field: parent_field.to_string(),
        })?;
        let filter = match parent_id {
            Some(id) => Predicate::eq(column, id.clone()),
            None => Predicate::IsNull(column),
        };
        self.get_list_by_filter(ctx, filter, &[]).await
    }
}

impl<E: Entity> RelationTarget for EntityService<E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn meta(&self) -> &'static EntityMeta {
        E::meta()
    }

    fn resolve_relations(&self, services: &ServiceRegistry) -> Result<(), Error> {
        self.load_relations(services)
    }

    fn load_cache<'a>(&'a self, ctx: &'a QueryContext) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(self.load_cached_data(ctx))
    }

    fn fetch_related<'a>(
        &'a self,
        ctx: &'a QueryContext,
        field: &'a str,
        ids: &'a [Key],
        dict_enrich: bool,
    ) -> BoxFuture<'a, Result<Vec<Box<dyn DynEntity>>, Error>> {
        Box::pin(async move {
            let mut rows = self.get_in_list_by_field(ctx, field, ids).await?;
            if dict_enrich && !rows.is_empty() {
                self.build_relation_for_data_list(ctx, &mut rows, Mode::DictOnly)
                    .await?;
            }
            Ok(rows
                .into_iter()
                .map(|row| Box::new(row) as Box<dyn DynEntity>)
                .collect())
        })
    }
}
