use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use log::info;

use crate::{
    AggregationQueryBuilder, AggregationType, Entity, EntityMeta, EntityService, Key, MasterScope,
    QueryContext, RelationTarget, aggregation::AggregationSpec, error::Error,
};

/// In-process constant dictionary, e.g. a status code table.
#[derive(Debug, Default)]
pub struct ConstDictionary {
    entries: BTreeMap<Key, String>,
}

impl ConstDictionary {
    pub fn new<K: Into<Key>, S: Into<String>>(entries: impl IntoIterator<Item = (K, S)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn label(&self, id: &Key) -> Option<&str> {
        self.entries.get(id).map(String::as_str)
    }

    pub fn is_valid(&self, id: &Key) -> bool {
        self.entries.contains_key(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Key, &str)> {
        self.entries.iter().map(|(k, v)| (k, v.as_str()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregationHost {
    /// The aggregated column lives on the bridge table.
    Bridge,
    /// The aggregated column lives on the far side entity.
    Slave,
}

// ---- declarations -------------------------------------------------------

pub struct ConstDictDecl {
    field: String,
    master_id_field: String,
    dictionary: &'static ConstDictionary,
}

pub struct DictDecl {
    field: String,
    master_id_field: String,
    service: String,
    slave_id_field: Option<String>,
    label_field: String,
    equal_one_to_one: Option<String>,
}

impl DictDecl {
    /// Field of the target used as the dictionary id. Defaults to its id field.
    pub fn slave_id_field(mut self, field: impl Into<String>) -> Self {
        self.slave_id_field = Some(field.into());
        self
    }

    /// Reuse the object loaded by this one-to-one relation instead of fetching again.
    pub fn equal_one_to_one(mut self, field: impl Into<String>) -> Self {
        self.equal_one_to_one = Some(field.into());
        self
    }
}

pub struct OneToOneDecl {
    field: String,
    master_id_field: String,
    service: String,
    slave_id_field: Option<String>,
    load_slave_dict: bool,
}

impl OneToOneDecl {
    pub fn slave_id_field(mut self, field: impl Into<String>) -> Self {
        self.slave_id_field = Some(field.into());
        self
    }

    /// Whether the nested object gets its own dictionary relations. On by default.
    pub fn load_slave_dict(mut self, load: bool) -> Self {
        self.load_slave_dict = load;
        self
    }
}

pub struct OneToManyDecl {
    field: String,
    master_id_field: String,
    service: String,
    slave: &'static EntityMeta,
    slave_id_field: String,
    aggregation: AggregationSpec,
    aggregation_field: Option<String>,
}

impl OneToManyDecl {
    pub fn aggregate(
        mut self,
        aggregation: impl Into<AggregationSpec>,
        field: impl Into<String>,
    ) -> Self {
        self.aggregation = aggregation.into();
        self.aggregation_field = Some(field.into());
        self
    }
}

pub struct ManyToManyDecl {
    field: String,
    master_id_field: String,
    service: String,
    bridge: &'static EntityMeta,
    bridge_master_field: String,
    bridge_slave_field: String,
    slave: &'static EntityMeta,
    slave_id_field: Option<String>,
    host: AggregationHost,
    aggregation: AggregationSpec,
    aggregation_field: Option<String>,
}

impl ManyToManyDecl {
    pub fn slave_id_field(mut self, field: impl Into<String>) -> Self {
        self.slave_id_field = Some(field.into());
        self
    }

    pub fn aggregate(
        mut self,
        host: AggregationHost,
        aggregation: impl Into<AggregationSpec>,
        field: impl Into<String>,
    ) -> Self {
        self.host = host;
        self.aggregation = aggregation.into();
        self.aggregation_field = Some(field.into());
        self
    }
}

/// Relation declared on an entity service, resolved when the registry starts.
pub enum RelationDecl {
    ConstDict(ConstDictDecl),
    Dict(DictDecl),
    OneToOne(OneToOneDecl),
    OneToManyAggregation(OneToManyDecl),
    ManyToManyAggregation(ManyToManyDecl),
}

impl RelationDecl {
    pub fn const_dict(
        field: impl Into<String>,
        master_id_field: impl Into<String>,
        dictionary: &'static ConstDictionary,
    ) -> ConstDictDecl {
        ConstDictDecl {
            field: field.into(),
            master_id_field: master_id_field.into(),
            dictionary,
        }
    }

    pub fn dict(
        field: impl Into<String>,
        master_id_field: impl Into<String>,
        service: impl Into<String>,
        label_field: impl Into<String>,
    ) -> DictDecl {
        DictDecl {
            field: field.into(),
            master_id_field: master_id_field.into(),
            service: service.into(),
            slave_id_field: None,
            label_field: label_field.into(),
            equal_one_to_one: None,
        }
    }

    pub fn one_to_one(
        field: impl Into<String>,
        master_id_field: impl Into<String>,
        service: impl Into<String>,
    ) -> OneToOneDecl {
        OneToOneDecl {
            field: field.into(),
            master_id_field: master_id_field.into(),
            service: service.into(),
            slave_id_field: None,
            load_slave_dict: true,
        }
    }

    /// Aggregate over the `S` rows whose `slave_id_field` points at the master.
    /// Counts `S`'s id field unless [`OneToManyDecl::aggregate`] says otherwise.
    pub fn one_to_many<S: Entity>(
        field: impl Into<String>,
        master_id_field: impl Into<String>,
        service: impl Into<String>,
        slave_id_field: impl Into<String>,
    ) -> OneToManyDecl {
        OneToManyDecl {
            field: field.into(),
            master_id_field: master_id_field.into(),
            service: service.into(),
            slave: S::meta(),
            slave_id_field: slave_id_field.into(),
            aggregation: AggregationType::Count.into(),
            aggregation_field: None,
        }
    }

    /// Aggregate across the bridge `B` linking the master to `S`.
    /// Counts bridge rows unless [`ManyToManyDecl::aggregate`] says otherwise.
    pub fn many_to_many<B: Entity, S: Entity>(
        field: impl Into<String>,
        master_id_field: impl Into<String>,
        service: impl Into<String>,
        bridge_master_field: impl Into<String>,
        bridge_slave_field: impl Into<String>,
    ) -> ManyToManyDecl {
        ManyToManyDecl {
            field: field.into(),
            master_id_field: master_id_field.into(),
            service: service.into(),
            bridge: B::meta(),
            bridge_master_field: bridge_master_field.into(),
            bridge_slave_field: bridge_slave_field.into(),
            slave: S::meta(),
            slave_id_field: None,
            host: AggregationHost::Bridge,
            aggregation: AggregationType::Count.into(),
            aggregation_field: None,
        }
    }

    fn field(&self) -> &str {
        match self {
            RelationDecl::ConstDict(d) => &d.field,
            RelationDecl::Dict(d) => &d.field,
            RelationDecl::OneToOne(d) => &d.field,
            RelationDecl::OneToManyAggregation(d) => &d.field,
            RelationDecl::ManyToManyAggregation(d) => &d.field,
        }
    }

    fn master_id_field(&self) -> &str {
        match self {
            RelationDecl::ConstDict(d) => &d.master_id_field,
            RelationDecl::Dict(d) => &d.master_id_field,
            RelationDecl::OneToOne(d) => &d.master_id_field,
            RelationDecl::OneToManyAggregation(d) => &d.master_id_field,
            RelationDecl::ManyToManyAggregation(d) => &d.master_id_field,
        }
    }
}

macro_rules! impl_decl_into {
    ($($Decl:ident => $variant:ident),+) => {
        $(
            impl From<$Decl> for RelationDecl {
                fn from(decl: $Decl) -> Self {
                    RelationDecl::$variant(decl)
                }
            }
        )+
    };
}

impl_decl_into!(
    ConstDictDecl => ConstDict,
    DictDecl => Dict,
    OneToOneDecl => OneToOne,
    OneToManyDecl => OneToManyAggregation,
    ManyToManyDecl => ManyToManyAggregation
);

// ---- resolved descriptors -----------------------------------------------

#[derive(Debug)]
pub struct ConstDictRelation {
    pub field: String,
    pub master_id_field: String,
    pub dictionary: &'static ConstDictionary,
}

pub struct DictRelation {
    pub field: String,
    pub master_id_field: String,
    pub target: Arc<dyn RelationTarget>,
    pub slave_id_field: String,
    pub label_field: String,
    pub equal_one_to_one: Option<String>,
}

pub struct OneToOneRelation {
    pub field: String,
    pub master_id_field: String,
    pub target: Arc<dyn RelationTarget>,
    pub slave_id_field: String,
    pub load_slave_dict: bool,
}

pub struct OneToManyAggregation {
    pub field: String,
    pub master_id_field: String,
    pub target: Arc<dyn RelationTarget>,
    pub slave: &'static EntityMeta,
    pub slave_id_field: String,
    pub aggregation: AggregationType,
    pub aggregation_field: String,
}

pub struct ManyToManyAggregation {
    pub field: String,
    pub master_id_field: String,
    pub target: Arc<dyn RelationTarget>,
    pub bridge: &'static EntityMeta,
    pub bridge_master_field: String,
    pub bridge_slave_field: String,
    pub slave: &'static EntityMeta,
    pub slave_id_field: String,
    pub host: AggregationHost,
    pub aggregation: AggregationType,
    pub aggregation_field: String,
}

/// Relation descriptors of one entity type, partitioned by kind.
#[derive(Default)]
pub struct RelationRegistry {
    pub const_dicts: Vec<ConstDictRelation>,
    pub dicts: Vec<DictRelation>,
    pub one_to_ones: Vec<OneToOneRelation>,
    pub one_to_many: Vec<OneToManyAggregation>,
    pub many_to_many: Vec<ManyToManyAggregation>,
}

impl fmt::Debug for RelationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn fields<'r>(names: impl Iterator<Item = &'r String>) -> String {
            names.map(String::as_str).collect::<Vec<_>>().join(", ")
        }
        f.debug_struct("RelationRegistry")
            .field("const_dicts", &fields(self.const_dicts.iter().map(|r| &r.field)))
            .field("dicts", &fields(self.dicts.iter().map(|r| &r.field)))
            .field("one_to_ones", &fields(self.one_to_ones.iter().map(|r| &r.field)))
            .field("one_to_many", &fields(self.one_to_many.iter().map(|r| &r.field)))
            .field("many_to_many", &fields(self.many_to_many.iter().map(|r| &r.field)))
            .finish()
    }
}

impl RelationRegistry {
    /// Resolves the declarations of `master` against the registered services.
    pub fn register(
        master: &'static EntityMeta,
        decls: &[RelationDecl],
        services: &ServiceRegistry,
    ) -> Result<Self, Error> {
        let mut registry = RelationRegistry::default();
        let invalid = |field: &str, reason: String| Error::InvalidRelation {
            entity: master.name,
            field: field.to_string(),
            reason,
        };

        for decl in decls {
            let field = decl.field();
            if !master.has_relation_field(field) {
                return Err(Error::UnknownRelationField {
                    entity: master.name,
                    field: field.to_string(),
                });
            }
            if registry.contains(field) {
                return Err(invalid(field, "declared twice".to_string()));
            }
            if master.column(decl.master_id_field()).is_none() {
                return Err(invalid(
                    field,
                    format!("master id field '{}' is not persistent", decl.master_id_field()),
                ));
            }
            let resolve = |service: &str| {
                services
                    .target(service)
                    .ok_or_else(|| Error::UnresolvedRelationTarget {
                        entity: master.name,
                        field: field.to_string(),
                        service: service.to_string(),
                    })
            };
            let persistent = |meta: &EntityMeta, name: &str, role: &str| {
                if meta.column(name).is_some() {
                    Ok(())
                } else {
                    Err(invalid(
                        field,
                        format!(
                            "{} field '{}' is not a persistent field of {}",
                            role, name, meta.name
                        ),
                    ))
                }
            };

            match decl {
                RelationDecl::ConstDict(d) => registry.const_dicts.push(ConstDictRelation {
                    field: d.field.clone(),
                    master_id_field: d.master_id_field.clone(),
                    dictionary: d.dictionary,
                }),
                RelationDecl::Dict(d) => {
                    let target = resolve(&d.service)?;
                    let target_meta = target.meta();
                    let slave_id_field = d
                        .slave_id_field
                        .clone()
                        .unwrap_or_else(|| target_meta.id_field.to_string());
                    persistent(target_meta, &slave_id_field, "slave id")?;
                    persistent(target_meta, &d.label_field, "label")?;
                    registry.dicts.push(DictRelation {
                        field: d.field.clone(),
                        master_id_field: d.master_id_field.clone(),
                        target,
                        slave_id_field,
                        label_field: d.label_field.clone(),
                        equal_one_to_one: d.equal_one_to_one.clone(),
                    });
                }
                RelationDecl::OneToOne(d) => {
                    let target = resolve(&d.service)?;
                    let slave_id_field = d
                        .slave_id_field
                        .clone()
                        .unwrap_or_else(|| target.meta().id_field.to_string());
                    persistent(target.meta(), &slave_id_field, "slave id")?;
                    registry.one_to_ones.push(OneToOneRelation {
                        field: d.field.clone(),
                        master_id_field: d.master_id_field.clone(),
                        target,
                        slave_id_field,
                        load_slave_dict: d.load_slave_dict,
                    });
                }
                RelationDecl::OneToManyAggregation(d) => {
                    let target = resolve(&d.service)?;
                    if !target.meta().is(d.slave) {
                        return Err(invalid(
                            field,
                            format!("service '{}' does not serve {}", d.service, d.slave.name),
                        ));
                    }
                    let relation = OneToManyAggregation {
                        field: d.field.clone(),
                        master_id_field: d.master_id_field.clone(),
                        target,
                        slave: d.slave,
                        slave_id_field: d.slave_id_field.clone(),
                        aggregation: d.aggregation.resolve(d.slave)?,
                        aggregation_field: d
                            .aggregation_field
                            .clone()
                            .unwrap_or_else(|| d.slave.id_field.to_string()),
                    };
                    // 启动期校验聚合字段与外键映射
                    let scope = MasterScope::Many(Vec::new());
                    AggregationQueryBuilder::new(&scope, &[]).one_to_many(&relation)?;
                    registry.one_to_many.push(relation);
                }
                RelationDecl::ManyToManyAggregation(d) => {
                    let target = resolve(&d.service)?;
                    if !target.meta().is(d.slave) {
                        return Err(invalid(
                            field,
                            format!("service '{}' does not serve {}", d.service, d.slave.name),
                        ));
                    }
                    let host_meta = match d.host {
                        AggregationHost::Bridge => d.bridge,
                        AggregationHost::Slave => d.slave,
                    };
                    let relation = ManyToManyAggregation {
                        field: d.field.clone(),
                        master_id_field: d.master_id_field.clone(),
                        target,
                        bridge: d.bridge,
                        bridge_master_field: d.bridge_master_field.clone(),
                        bridge_slave_field: d.bridge_slave_field.clone(),
                        slave: d.slave,
                        slave_id_field: d
                            .slave_id_field
                            .clone()
                            .unwrap_or_else(|| d.slave.id_field.to_string()),
                        host: d.host,
                        aggregation: d.aggregation.resolve(host_meta)?,
                        aggregation_field: d
                            .aggregation_field
                            .clone()
                            .unwrap_or_else(|| d.bridge_master_field.clone()),
                    };
                    let scope = MasterScope::Many(Vec::new());
                    AggregationQueryBuilder::new(&scope, &[]).many_to_many(&relation)?;
                    registry.many_to_many.push(relation);
                }
            }
        }

        registry.check_equal_one_to_one(master)?;
        Ok(registry)
    }

    // A dictionary that reuses a one-to-one object must read the same target
    // through the same key, so both paths yield the same item.
    fn check_equal_one_to_one(&self, master: &'static EntityMeta) -> Result<(), Error> {
        for dict in &self.dicts {
            let Some(name) = dict.equal_one_to_one.as_deref() else {
                continue;
            };
            let reason = match self.one_to_ones.iter().find(|o| o.field == name) {
                None => format!("'{}' is not a one-to-one relation", name),
                Some(o) if !o.target.meta().is(dict.target.meta()) => {
                    format!("'{}' targets another entity", name)
                }
                Some(o) if o.master_id_field != dict.master_id_field => {
                    format!("'{}' uses another master id field", name)
                }
                Some(o) if o.slave_id_field != dict.slave_id_field => {
                    format!("'{}' uses another slave id field", name)
                }
                Some(_) => continue,
            };
            return Err(Error::InvalidRelation {
                entity: master.name,
                field: dict.field.clone(),
                reason,
            });
        }
        Ok(())
    }

    fn contains(&self, field: &str) -> bool {
        self.const_dicts.iter().any(|r| r.field == field)
            || self.dicts.iter().any(|r| r.field == field)
            || self.one_to_ones.iter().any(|r| r.field == field)
            || self.one_to_many.iter().any(|r| r.field == field)
            || self.many_to_many.iter().any(|r| r.field == field)
    }

    pub fn len(&self) -> usize {
        self.const_dicts.len()
            + self.dicts.len()
            + self.one_to_ones.len()
            + self.one_to_many.len()
            + self.many_to_many.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_aggregations(&self) -> bool {
        !self.one_to_many.is_empty() || !self.many_to_many.is_empty()
    }
}

struct Registered {
    target: Arc<dyn RelationTarget>,
    typed: Arc<dyn Any + Send + Sync>,
}

/// Name to service map. Services are registered first and resolve their
/// relations against each other in [`ServiceRegistry::initialize`].
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Registered>,
    order: Vec<String>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<E: Entity>(
        &mut self,
        service: EntityService<E>,
    ) -> Result<Arc<EntityService<E>>, Error> {
        let name = service.name().to_string();
        if self.services.contains_key(&name) {
            return Err(Error::DuplicateService(name));
        }
        let service = Arc::new(service);
        let target: Arc<dyn RelationTarget> = service.clone();
        let typed: Arc<dyn Any + Send + Sync> = service.clone();
        self.services.insert(name.clone(), Registered { target, typed });
        self.order.push(name);
        Ok(service)
    }

    pub fn target(&self, name: &str) -> Option<Arc<dyn RelationTarget>> {
        self.services.get(name).map(|r| Arc::clone(&r.target))
    }

    pub fn service<E: Entity>(&self, name: &str) -> Result<Arc<EntityService<E>>, Error> {
        self.services
            .get(name)
            .and_then(|r| Arc::clone(&r.typed).downcast::<EntityService<E>>().ok())
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Resolves the relations of every registered service.
    pub fn load_relations(&self) -> Result<(), Error> {
        for name in &self.order {
            if let Some(registered) = self.services.get(name) {
                registered.target.resolve_relations(self)?;
            }
        }
        Ok(())
    }

    /// Loads every dictionary cache marked for startup loading.
    pub async fn load_cached_data(&self, ctx: &QueryContext) -> Result<(), Error> {
        for name in &self.order {
            if let Some(registered) = self.services.get(name) {
                registered.target.load_cache(ctx).await?;
            }
        }
        Ok(())
    }

    /// Second startup phase: relations first, then caches.
    pub async fn initialize(&self, ctx: &QueryContext) -> Result<(), Error> {
        self.load_relations()?;
        self.load_cached_data(ctx).await?;
        info!("initialized {} services", self.order.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::LazyLock;

    use super::*;
    use crate::{MemoryDatabase, Related};

    static STATUS: LazyLock<ConstDictionary> =
        LazyLock::new(|| ConstDictionary::new([(1, "Active"), (2, "Closed")]));

    #[derive(Clone, Debug, Default, Entity)]
    #[entity(table = "zz_grade")]
    struct Grade {
        #[entity(id)]
        grade_id: i64,
        grade_name: String,
    }

    #[derive(Clone, Debug, Default, Entity)]
    #[entity(table = "zz_teacher")]
    struct Teacher {
        #[entity(id)]
        teacher_id: i64,
        grade_id: i64,
        teacher_name: String,
    }

    #[derive(Clone, Debug, Default, Entity)]
    #[entity(table = "zz_course")]
    struct Course {
        #[entity(id)]
        course_id: i64,
        status: i64,
        grade_id: i64,
        teacher_id: i64,
        #[relation(dict)]
        status_dict: Option<crate::DictItem>,
        #[relation(dict)]
        grade_dict: Option<crate::DictItem>,
        #[relation(dict)]
        teacher_dict: Option<crate::DictItem>,
        #[relation(object)]
        teacher: Option<Teacher>,
        #[relation(aggregate)]
        section_count: Option<i64>,
    }

    #[derive(Clone, Debug, Default, Entity)]
    #[entity(table = "zz_section")]
    struct Section {
        #[entity(id)]
        section_id: i64,
        course_id: i64,
    }

    fn services(db: &MemoryDatabase) -> ServiceRegistry {
        let mut services = ServiceRegistry::new();
        services
            .register(EntityService::new("gradeService", Arc::new(db.repository::<Grade>())))
            .unwrap();
        services
            .register(EntityService::new("teacherService", Arc::new(db.repository::<Teacher>())))
            .unwrap();
        services
            .register(EntityService::new("sectionService", Arc::new(db.repository::<Section>())))
            .unwrap();
        services
    }

    #[test]
    fn relations_are_partitioned_by_kind() {
        let services = services(&MemoryDatabase::new());
        let decls: Vec<RelationDecl> = vec![
            RelationDecl::const_dict("status_dict", "status", &STATUS).into(),
            RelationDecl::dict("grade_dict", "grade_id", "gradeService", "grade_name").into(),
            RelationDecl::one_to_one("teacher", "teacher_id", "teacherService").into(),
            RelationDecl::dict("teacher_dict", "teacher_id", "teacherService", "teacher_name")
                .equal_one_to_one("teacher")
                .into(),
            RelationDecl::one_to_many::<Section>(
                "section_count",
                "course_id",
                "sectionService",
                "course_id",
            )
            .into(),
        ];
        let registry = RelationRegistry::register(Course::meta(), &decls, &services).unwrap();
        assert_eq!(registry.const_dicts.len(), 1);
        assert_eq!(registry.dicts.len(), 2);
        assert_eq!(registry.one_to_ones.len(), 1);
        assert_eq!(registry.one_to_many.len(), 1);
        assert!(registry.many_to_many.is_empty());
        assert_eq!(registry.dicts[0].slave_id_field, "grade_id");
        assert_eq!(registry.one_to_many[0].aggregation, AggregationType::Count);
        assert_eq!(registry.one_to_many[0].aggregation_field, "section_id");
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn unknown_service_fails_registration() {
        let services = services(&MemoryDatabase::new());
        let decls: Vec<RelationDecl> = vec![
            RelationDecl::dict("grade_dict", "grade_id", "missingService", "grade_name").into(),
        ];
        let err = RelationRegistry::register(Course::meta(), &decls, &services).unwrap_err();
        assert!(matches!(
            err,
            Error::UnresolvedRelationTarget { service, .. } if service == "missingService"
        ));
    }

    #[test]
    fn relation_field_must_exist_on_the_entity() {
        let services = services(&MemoryDatabase::new());
        let decls: Vec<RelationDecl> =
            vec![RelationDecl::const_dict("grade_id", "status", &STATUS).into()];
        let err = RelationRegistry::register(Course::meta(), &decls, &services).unwrap_err();
        assert!(matches!(err, Error::UnknownRelationField { .. }));
    }

    #[test]
    fn invalid_aggregation_settings_fail_at_registration() {
        let services = services(&MemoryDatabase::new());
        let decls: Vec<RelationDecl> = vec![
            RelationDecl::one_to_many::<Section>(
                "section_count",
                "course_id",
                "sectionService",
                "course_id",
            )
            .aggregate(42, "section_id")
            .into(),
        ];
        let err = RelationRegistry::register(Course::meta(), &decls, &services).unwrap_err();
        assert!(matches!(err, Error::InvalidAggregationType { .. }));

        let decls: Vec<RelationDecl> = vec![
            RelationDecl::one_to_many::<Section>(
                "section_count",
                "course_id",
                "sectionService",
                "course_id",
            )
            .aggregate(AggregationType::Sum, "hours")
            .into(),
        ];
        let err = RelationRegistry::register(Course::meta(), &decls, &services).unwrap_err();
        assert!(matches!(err, Error::InvalidAggregationField { field, .. } if field == "hours"));
    }

    #[test]
    fn equal_one_to_one_must_name_a_matching_relation() {
        let services = services(&MemoryDatabase::new());
        let decls: Vec<RelationDecl> = vec![
            RelationDecl::dict("teacher_dict", "teacher_id", "teacherService", "teacher_name")
                .equal_one_to_one("teacher")
                .into(),
        ];
        let err = RelationRegistry::register(Course::meta(), &decls, &services).unwrap_err();
        assert!(matches!(err, Error::InvalidRelation { .. }));

        let decls: Vec<RelationDecl> = vec![
            RelationDecl::one_to_one("teacher", "grade_id", "teacherService").into(),
            RelationDecl::dict("teacher_dict", "teacher_id", "teacherService", "teacher_name")
                .equal_one_to_one("teacher")
                .into(),
        ];
        let err = RelationRegistry::register(Course::meta(), &decls, &services).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidRelation { reason, .. } if reason.contains("master id")
        ));
    }

    #[test]
    fn typed_lookup_and_duplicates() {
        let db = MemoryDatabase::new();
        let mut services = services(&db);
        assert!(services.service::<Grade>("gradeService").is_ok());
        assert!(matches!(
            services.service::<Teacher>("gradeService"),
            Err(Error::ServiceNotFound(_))
        ));
        let err = services
            .register(EntityService::new("gradeService", Arc::new(db.repository::<Grade>())))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateService(name) if name == "gradeService"));
        assert_eq!(
            services.names().collect::<Vec<_>>(),
            vec!["gradeService", "teacherService", "sectionService"]
        );
    }

    #[test]
    fn const_dictionary_lookup() {
        assert_eq!(STATUS.label(&Key::Int(2)), Some("Closed"));
        assert!(!STATUS.is_valid(&Key::Int(3)));
        let mut course = Course::default();
        course
            .assign("status_dict", Related::Dict(crate::DictItem::new(1, "Active")))
            .unwrap();
        assert_eq!(course.status_dict.map(|d| d.label), Some("Active".to_string()));
    }
}
