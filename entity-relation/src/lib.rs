extern crate self as entity_relation;

mod aggregation;
mod cache;
mod criteria;
mod error;
mod filter;
mod materializer;
mod memory;
mod registry;
mod repository;
mod service;
mod value;

use std::any::Any;

pub use aggregation::{
    AGGREGATED_VALUE, AggregationQueryBuilder, AggregationSpec, AggregationType, GROUPED_KEY,
    GroupedQuery, MasterScope,
};
pub use cache::{DictionaryCache, MapDictionaryCache, MapTreeDictionaryCache};
pub use criteria::{Column, CriteriaMap, Operator, Predicate, WhereCriteria};
pub use entity_relation_derive::Entity;
pub use error::Error;
pub use filter::{BoundCondition, Filter};
pub use materializer::{Materializer, Mode};
pub use memory::{CallRecord, MemoryDatabase, MemoryRepository, RepositoryCall};
pub use registry::{
    AggregationHost, ConstDictDecl, ConstDictRelation, ConstDictionary, DictDecl, DictRelation,
    ManyToManyAggregation, ManyToManyDecl, OneToManyAggregation, OneToManyDecl, OneToOneDecl,
    OneToOneRelation, RelationDecl, RelationRegistry, ServiceRegistry,
};
pub use repository::{GroupedRow, QueryContext, Repository};
pub use service::{EntityService, RelationTarget, ServiceOptions};
pub use value::{DictItem, FromValue, Key, Related, ToValue, Value};

#[doc(hidden)]
pub use inventory;

/// 逻辑删除字段的正常值
pub const DELETED_FLAG_NORMAL: i64 = 1;
/// 逻辑删除字段的删除值
pub const DELETED_FLAG_DELETED: i64 = -1;

/// One persistent field and the column it maps to.
#[derive(Debug)]
pub struct FieldMeta {
    pub name: &'static str,
    pub column: &'static str,
}

/// Static schema of an entity type, generated by `#[derive(Entity)]`.
#[derive(Debug)]
pub struct EntityMeta {
    pub name: &'static str,
    pub type_path: &'static str,
    pub table: &'static str,
    pub id_field: &'static str,
    pub deleted_flag_field: Option<&'static str>,
    pub update_time_field: Option<&'static str>,
    pub fields: &'static [FieldMeta],
    pub relation_fields: &'static [&'static str],
}

impl EntityMeta {
    /// Column of a persistent field. Relation fields and unknown names have none.
    pub fn column_name(&self, field: &str) -> Option<&'static str> {
        self.fields
            .iter()
            .find(|f| f.name == field)
            .map(|f| f.column)
    }

    pub fn column(&self, field: &str) -> Option<Column> {
        self.column_name(field).map(|column| Column::new(self.table, column))
    }

    pub fn field_of_column(&self, column: &str) -> Option<&'static str> {
        self.fields
            .iter()
            .find(|f| f.column == column)
            .map(|f| f.name)
    }

    pub fn id_column(&self) -> Column {
        Column::new(
            self.table,
            self.column_name(self.id_field).unwrap_or(self.id_field),
        )
    }

    pub fn deleted_flag_column(&self) -> Option<Column> {
        self.deleted_flag_field.and_then(|f| self.column(f))
    }

    pub fn has_relation_field(&self, field: &str) -> bool {
        self.relation_fields.contains(&field)
    }

    pub fn is(&self, other: &EntityMeta) -> bool {
        self.type_path == other.type_path
    }
}

/// Entity trait 定义了参与关联物化的实体的基本接口
pub trait Entity: Clone + Send + Sync + 'static {
    fn meta() -> &'static EntityMeta;

    /// Reads a persistent field.
    fn value(&self, field: &str) -> Option<Value>;

    /// Writes a relation target field.
    fn assign(&mut self, field: &str, related: Related) -> Result<(), Error>;

    /// Borrows an already materialized one-to-one object.
    fn nested(&self, field: &str) -> Option<&dyn DynEntity>;

    fn id(&self) -> Option<Key> {
        self.value(Self::meta().id_field).and_then(|v| v.as_key())
    }

    fn key(&self, field: &str) -> Option<Key> {
        self.value(field).and_then(|v| v.as_key())
    }
}

/// Object-safe view of an [`Entity`], used across entity types.
pub trait DynEntity: Send + Sync {
    fn entity_meta(&self) -> &'static EntityMeta;
    fn field_value(&self, field: &str) -> Option<Value>;
    fn clone_boxed(&self) -> Box<dyn DynEntity>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Entity> DynEntity for T {
    fn entity_meta(&self) -> &'static EntityMeta {
        T::meta()
    }

    fn field_value(&self, field: &str) -> Option<Value> {
        self.value(field)
    }

    fn clone_boxed(&self) -> Box<dyn DynEntity> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

// 定义实体注册信息
pub struct EntityRegistration {
    pub meta: fn() -> &'static EntityMeta,
}

impl std::fmt::Debug for EntityRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let meta = (self.meta)();
        write!(
            f,
            "EntityRegistration {{ type_path: {}, table: {} }}",
            meta.type_path, meta.table
        )
    }
}

// 使用 inventory 收集所有实体
inventory::collect!(EntityRegistration);

// 获取所有已注册的实体
pub fn all_entities() -> Vec<&'static EntityMeta> {
    inventory::iter::<EntityRegistration>()
        .map(|registration| (registration.meta)())
        .collect()
}

/// Finds a registered entity by type path, then by type name, then by table.
pub fn find_entity(name: &str) -> Option<&'static EntityMeta> {
    let entities = all_entities();
    entities
        .iter()
        .find(|meta| meta.type_path == name)
        .or_else(|| entities.iter().find(|meta| meta.name == name))
        .or_else(|| entities.iter().find(|meta| meta.table == name))
        .copied()
}
