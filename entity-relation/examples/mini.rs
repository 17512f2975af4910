use std::sync::{Arc, LazyLock};

use entity_relation::{
    ConstDictionary, DELETED_FLAG_NORMAL, DictItem, Entity, EntityService, Error, Key,
    MapDictionaryCache, MemoryDatabase, Mode, QueryContext, RelationDecl, ServiceRegistry,
};

static COURSE_STATUS: LazyLock<ConstDictionary> =
    LazyLock::new(|| ConstDictionary::new([(1, "Active"), (2, "Closed")]));

#[derive(Clone, Debug, Entity)]
pub struct Grade {
    #[entity(id)]
    pub grade_id: i64,
    pub grade_name: String,
    #[entity(deleted_flag)]
    pub deleted_flag: i64,
}

#[derive(Clone, Debug, Entity)]
pub struct Course {
    #[entity(id)]
    pub course_id: i64,
    pub course_name: String,
    pub status: i64,
    pub grade_id: i64,
    #[entity(deleted_flag)]
    pub deleted_flag: i64,
    #[relation(dict)]
    pub status_dict: Option<DictItem>,
    #[relation(dict)]
    pub grade_dict: Option<DictItem>,
    #[relation(aggregate)]
    pub section_count: Option<i64>,
}

#[derive(Clone, Debug, Entity)]
pub struct Section {
    #[entity(id)]
    pub section_id: i64,
    pub course_id: i64,
    #[entity(deleted_flag)]
    pub deleted_flag: i64,
}

fn seed(db: &MemoryDatabase) {
    db.insert_all([(1, "Freshman"), (2, "Sophomore")].map(|(id, name)| Grade {
        grade_id: id,
        grade_name: name.to_string(),
        deleted_flag: DELETED_FLAG_NORMAL,
    }));
    db.insert_all([(1, "Rust", 1, 1), (2, "Go", 2, 2)].map(|(id, name, status, grade)| Course {
        course_id: id,
        course_name: name.to_string(),
        status,
        grade_id: grade,
        deleted_flag: DELETED_FLAG_NORMAL,
        status_dict: None,
        grade_dict: None,
        section_count: None,
    }));
    db.insert_all([(10, 1), (11, 1), (12, 2)].map(|(id, course)| Section {
        section_id: id,
        course_id: course,
        deleted_flag: DELETED_FLAG_NORMAL,
    }));
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let db = MemoryDatabase::new();
    seed(&db);

    let mut services = ServiceRegistry::new();
    services.register(
        EntityService::new("courseService", Arc::new(db.repository::<Course>()))
            .with_relation(RelationDecl::const_dict("status_dict", "status", &COURSE_STATUS))
            .with_relation(RelationDecl::dict(
                "grade_dict",
                "grade_id",
                "gradeService",
                "grade_name",
            ))
            .with_relation(RelationDecl::one_to_many::<Section>(
                "section_count",
                "course_id",
                "sectionService",
                "course_id",
            )),
    )?;
    services.register(
        EntityService::new("gradeService", Arc::new(db.repository::<Grade>()))
            .with_dictionary_cache(Arc::new(MapDictionaryCache::<Key, Grade>::for_entity())),
    )?;
    services.register(EntityService::new(
        "sectionService",
        Arc::new(db.repository::<Section>()),
    ))?;

    let ctx = QueryContext::new();
    services.initialize(&ctx).await?;

    let courses = services.service::<Course>("courseService")?;
    let mut rows = courses.get_all_list(&ctx).await?;
    courses
        .build_all_relation_for_data_list(&ctx, &mut rows, Mode::Full, None)
        .await?;
    for course in &rows {
        println!("{:?}", course);
    }

    let one = courses
        .get_by_id_with_relation(&ctx, &Key::Int(2), Mode::Full)
        .await?;
    println!("{:?}", one);

    Ok(())
}
