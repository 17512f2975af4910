use std::sync::{Arc, LazyLock};

use entity_relation::{
    AggregationHost, AggregationQueryBuilder, AggregationType, ConstDictionary, CriteriaMap,
    DELETED_FLAG_DELETED, DELETED_FLAG_NORMAL, DictItem, Entity, EntityService, Error, Filter, Key,
    MapDictionaryCache, MasterScope, MemoryDatabase, Mode, Operator, QueryContext, RelationDecl,
    GroupedQuery, GroupedRow, Predicate, Repository, RepositoryCall, ServiceRegistry,
    WhereCriteria,
};
use futures::future::{self, BoxFuture};
use uuid::Uuid;

static COURSE_STATUS: LazyLock<ConstDictionary> =
    LazyLock::new(|| ConstDictionary::new([(1, "Active"), (2, "Closed")]));

#[derive(Clone, Debug, Entity)]
#[entity(table = "zz_grade")]
struct Grade {
    #[entity(id)]
    grade_id: String,
    grade_name: String,
    #[entity(deleted_flag)]
    deleted_flag: i64,
}

#[derive(Clone, Debug, Default, Entity)]
#[entity(table = "zz_course")]
struct Course {
    #[entity(id)]
    course_id: i64,
    course_name: String,
    status: i64,
    grade_id: Option<String>,
    #[entity(deleted_flag)]
    deleted_flag: i64,
    #[relation(dict)]
    status_dict: Option<DictItem>,
    #[relation(dict)]
    grade_dict: Option<DictItem>,
    #[relation(aggregate)]
    section_count: Option<i64>,
    #[relation(aggregate)]
    student_count: Option<i64>,
    #[relation(aggregate)]
    oldest_student: Option<i64>,
}

#[derive(Clone, Debug, Entity)]
#[entity(table = "zz_section")]
struct Section {
    #[entity(id)]
    section_id: i64,
    course_id: i64,
    #[entity(deleted_flag)]
    deleted_flag: i64,
}

#[derive(Clone, Debug, Entity)]
#[entity(table = "zz_student")]
struct Student {
    #[entity(id)]
    student_id: i64,
    age: i64,
    #[entity(deleted_flag)]
    deleted_flag: i64,
}

#[derive(Clone, Debug, Entity)]
#[entity(table = "zz_course_student")]
struct CourseStudent {
    #[entity(id)]
    id: i64,
    course_id: i64,
    student_id: i64,
}

struct Fixture {
    db: MemoryDatabase,
    services: ServiceRegistry,
    grades: Vec<String>,
}

fn course(id: i64, status: i64, grade_id: Option<&str>) -> Course {
    Course {
        course_id: id,
        course_name: format!("course-{}", id),
        status,
        grade_id: grade_id.map(str::to_string),
        deleted_flag: DELETED_FLAG_NORMAL,
        ..Default::default()
    }
}

fn section(id: i64, course_id: i64) -> Section {
    Section {
        section_id: id,
        course_id,
        deleted_flag: DELETED_FLAG_NORMAL,
    }
}

fn student(id: i64, age: i64, deleted_flag: i64) -> Student {
    Student {
        student_id: id,
        age,
        deleted_flag,
    }
}

fn enrolment(id: i64, course_id: i64, student_id: i64) -> CourseStudent {
    CourseStudent {
        id,
        course_id,
        student_id,
    }
}

fn course_service(db: &MemoryDatabase) -> EntityService<Course> {
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
        ))
        .with_relation(
            RelationDecl::many_to_many::<CourseStudent, Student>(
                "student_count",
                "course_id",
                "studentService",
                "course_id",
                "student_id",
            )
            .aggregate(AggregationHost::Bridge, AggregationType::Count, "student_id"),
        )
        .with_relation(
            RelationDecl::many_to_many::<CourseStudent, Student>(
                "oldest_student",
                "course_id",
                "studentService",
                "course_id",
                "student_id",
            )
            .aggregate(AggregationHost::Slave, "MAX", "age"),
        )
}

async fn fixture() -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let db = MemoryDatabase::new();
    let grades: Vec<String> = (0..3).map(|_| Uuid::new_v4().to_string()).collect();
    db.insert_all([
        Grade {
            grade_id: grades[0].clone(),
            grade_name: "Freshman".into(),
            deleted_flag: DELETED_FLAG_NORMAL,
        },
        Grade {
            grade_id: grades[1].clone(),
            grade_name: "Sophomore".into(),
            deleted_flag: DELETED_FLAG_NORMAL,
        },
        Grade {
            grade_id: grades[2].clone(),
            grade_name: "Retired".into(),
            deleted_flag: DELETED_FLAG_DELETED,
        },
    ]);
    db.insert_all([course(1, 1, Some(grades[0].as_str())), course(2, 2, Some(grades[1].as_str()))]);
    db.insert_all([section(10, 1), section(11, 1), section(12, 2)]);
    db.insert_all([student(100, 19, DELETED_FLAG_NORMAL), student(101, 17, DELETED_FLAG_NORMAL)]);
    db.insert(student(102, 40, DELETED_FLAG_DELETED));
    db.insert_all([
        enrolment(1, 1, 100),
        enrolment(2, 1, 101),
        enrolment(3, 1, 102),
        enrolment(4, 2, 101),
    ]);

    let mut services = ServiceRegistry::new();
    // 先注册依赖方，验证前向引用
    services.register(course_service(&db)).unwrap();
    services
        .register(
            EntityService::new("gradeService", Arc::new(db.repository::<Grade>()))
                .with_dictionary_cache(Arc::new(MapDictionaryCache::<Key, Grade>::for_entity())),
        )
        .unwrap();
    services
        .register(EntityService::new(
            "sectionService",
            Arc::new(db.repository::<Section>()),
        ))
        .unwrap();
    services
        .register(EntityService::new(
            "studentService",
            Arc::new(db.repository::<Student>()),
        ))
        .unwrap();
    services.initialize(&QueryContext::new()).await.unwrap();

    Fixture {
        db,
        services,
        grades,
    }
}

#[tokio::test]
async fn section_count_per_course() {
    let fx = fixture().await;
    let courses = fx.services.service::<Course>("courseService").unwrap();
    let ctx = QueryContext::new();

    let mut rows = courses.get_all_list(&ctx).await.unwrap();
    courses
        .build_aggregation_relation_for_data_list(&ctx, &mut rows, None)
        .await
        .unwrap();

    let counts: Vec<(i64, Option<i64>)> =
        rows.iter().map(|c| (c.course_id, c.section_count)).collect();
    assert_eq!(counts, vec![(1, Some(2)), (2, Some(1))]);
}

#[tokio::test]
async fn constant_dictionary_labels() {
    let fx = fixture().await;
    let courses = fx.services.service::<Course>("courseService").unwrap();
    let ctx = QueryContext::new();

    let mut rows = vec![course(1, 1, None), course(2, 2, None), course(3, 3, None)];
    courses
        .build_relation_for_data_list(&ctx, &mut rows, Mode::DictOnly)
        .await
        .unwrap();

    assert_eq!(rows[0].status_dict, Some(DictItem::new(1, "Active")));
    assert_eq!(rows[1].status_dict, Some(DictItem::new(2, "Closed")));
    assert_eq!(rows[2].status_dict, None);
}

#[tokio::test]
async fn dictionary_is_served_from_the_startup_cache() {
    let fx = fixture().await;
    let courses = fx.services.service::<Course>("courseService").unwrap();
    let grades = fx.services.service::<Grade>("gradeService").unwrap();
    let ctx = QueryContext::new();
    assert_eq!(grades.cached_count(), 2);

    fx.db.clear_journal();
    let mut rows = vec![
        course(1, 1, Some(fx.grades[0].as_str())),
        course(2, 1, Some(fx.grades[1].as_str())),
        course(3, 1, Some(fx.grades[0].as_str())),
    ];
    courses
        .build_relation_for_data_list(&ctx, &mut rows, Mode::Full)
        .await
        .unwrap();

    assert_eq!(
        rows[0].grade_dict,
        Some(DictItem::new(fx.grades[0].as_str(), "Freshman"))
    );
    assert_eq!(rows[1].grade_dict.as_ref().map(|d| d.label.as_str()), Some("Sophomore"));
    assert_eq!(rows[2].grade_dict, rows[0].grade_dict);
    assert!(fx.db.journal().is_empty());
}

#[tokio::test]
async fn soft_deleted_targets_never_show_up() {
    let fx = fixture().await;
    let courses = fx.services.service::<Course>("courseService").unwrap();
    let grades = fx.services.service::<Grade>("gradeService").unwrap();
    let ctx = QueryContext::new();

    let mut gone = section(13, 2);
    gone.deleted_flag = DELETED_FLAG_DELETED;
    fx.db.insert(gone);

    let mut rows = vec![course(1, 1, Some(fx.grades[2].as_str())), course(2, 1, None)];
    courses
        .build_all_relation_for_data_list(&ctx, &mut rows, Mode::Full, None)
        .await
        .unwrap();

    // the deleted grade is neither cached nor fetched
    assert_eq!(rows[0].grade_dict, None);
    assert_eq!(grades.cached_count(), 2);
    assert_eq!(rows[1].section_count, Some(1));
    // the deleted student is excluded once the far side is joined
    assert_eq!(rows[0].oldest_student, Some(19));
}

#[tokio::test]
async fn bridge_count_skips_the_far_side_until_criteria_need_it() {
    let fx = fixture().await;
    let courses = fx.services.service::<Course>("courseService").unwrap();
    let ctx = QueryContext::new();
    let relation = &courses.relations().unwrap().many_to_many[0];
    assert_eq!(relation.field, "student_count");

    let scope = MasterScope::Many(vec![Key::Int(1), Key::Int(2)]);
    let bridge_only = AggregationQueryBuilder::new(&scope, &[])
        .many_to_many(relation)
        .unwrap();
    assert_eq!(bridge_only.tables, vec!["zz_course_student"]);
    assert_eq!(bridge_only.filter.tables(), vec!["zz_course_student"]);

    let adults = [WhereCriteria::new::<Student>("age", Operator::Ge, 18)];
    let joined = AggregationQueryBuilder::new(&scope, &adults)
        .many_to_many(relation)
        .unwrap();
    assert_eq!(joined.tables, vec!["zz_course_student", "zz_student"]);

    let mut plain = courses.get_all_list(&ctx).await.unwrap();
    courses
        .build_aggregation_relation_for_data_list(&ctx, &mut plain, None)
        .await
        .unwrap();
    // no join: bridge rows count even when the far side (student 102) is soft-deleted
    assert_eq!(plain[0].student_count, Some(3));
    assert_eq!(plain[1].student_count, Some(1));

    let mut criteria = CriteriaMap::new();
    criteria.insert("student_count".to_string(), adults.to_vec());
    let mut filtered = courses.get_all_list(&ctx).await.unwrap();
    courses
        .build_aggregation_relation_for_data_list(&ctx, &mut filtered, Some(&criteria))
        .await
        .unwrap();
    assert_eq!(filtered[0].student_count, Some(1));
    // course 2 has no adult students: the field stays unset
    assert_eq!(filtered[1].student_count, None);
}

#[tokio::test]
async fn round_trips_do_not_grow_with_the_batch() {
    let fx = fixture().await;
    let courses = fx.services.service::<Course>("courseService").unwrap();
    let ctx = QueryContext::new();

    for batch in [2_i64, 200] {
        fx.db.clear_journal();
        let mut rows: Vec<Course> = (1..=batch)
            .map(|i| course(i, i % 3 + 1, Some(fx.grades[(i % 2) as usize].as_str())))
            .collect();
        courses
            .build_all_relation_for_data_list(&ctx, &mut rows, Mode::Full, None)
            .await
            .unwrap();
        // three grouped queries, dictionary answered by the cache
        assert_eq!(fx.db.calls("zz_course", RepositoryCall::GroupedSelect), 3);
        assert_eq!(fx.db.journal().len(), 3);
    }
}

#[tokio::test]
async fn row_policy_does_not_leak_into_relation_data() {
    let fx = fixture().await;
    let courses = fx.services.service::<Course>("courseService").unwrap();
    fx.db.set_row_policy(|s: &Section| s.course_id != 1);
    fx.db.set_row_policy(|c: &CourseStudent| c.course_id != 1);
    let ctx = QueryContext::new();

    let visible = fx
        .services
        .service::<Section>("sectionService")
        .unwrap()
        .get_count_by_filter(&ctx, Filter::<Section>::new().into_predicate().unwrap())
        .await
        .unwrap();
    assert_eq!(visible, 1);

    fx.db.clear_journal();
    let mut rows = courses.get_all_list(&ctx).await.unwrap();
    courses
        .build_all_relation_for_data_list(&ctx, &mut rows, Mode::Full, None)
        .await
        .unwrap();
    assert_eq!(rows[0].section_count, Some(2));
    assert_eq!(rows[0].student_count, Some(3));
    assert!(ctx.data_filter_enabled());

    let journal = fx.db.journal();
    assert!(journal[0].data_filter, "caller's own read stays filtered");
    assert!(journal[1..].iter().all(|call| !call.data_filter));
}

/// Memory repository that yields to the executor before every call.
struct Yielding<E>(entity_relation::MemoryRepository<E>);

impl<E: Entity> Repository<E> for Yielding<E> {
    fn get_by_id<'a>(
        &'a self,
        ctx: &'a QueryContext,
        id: &'a Key,
    ) -> BoxFuture<'a, Result<Option<E>, Error>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.0.get_by_id(ctx, id).await
        })
    }

    fn get_all_normal<'a>(&'a self, ctx: &'a QueryContext) -> BoxFuture<'a, Result<Vec<E>, Error>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.0.get_all_normal(ctx).await
        })
    }

    fn select_in_list<'a>(
        &'a self,
        ctx: &'a QueryContext,
        field: &'a str,
        ids: &'a [Key],
        order_by: &'a [&'a str],
    ) -> BoxFuture<'a, Result<Vec<E>, Error>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.0.select_in_list(ctx, field, ids, order_by).await
        })
    }

    fn count<'a>(
        &'a self,
        ctx: &'a QueryContext,
        filter: &'a Predicate,
    ) -> BoxFuture<'a, Result<u64, Error>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.0.count(ctx, filter).await
        })
    }

    fn grouped_select<'a>(
        &'a self,
        ctx: &'a QueryContext,
        query: &'a GroupedQuery,
    ) -> BoxFuture<'a, Result<Vec<GroupedRow>, Error>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.0.grouped_select(ctx, query).await
        })
    }

    fn condition_select<'a>(
        &'a self,
        ctx: &'a QueryContext,
        select_fields: &'a [&'a str],
        filter: &'a Predicate,
        order_by: &'a [&'a str],
    ) -> BoxFuture<'a, Result<Vec<E>, Error>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.0.condition_select(ctx, select_fields, filter, order_by).await
        })
    }
}

#[tokio::test]
async fn concurrent_reads_keep_their_row_scope() {
    let _ = env_logger::builder().is_test(true).try_init();
    let db = MemoryDatabase::new();
    db.insert_all([course(1, 1, None), course(2, 1, None)]);
    db.insert_all([section(10, 1), section(11, 1), section(12, 2)]);
    db.set_row_policy(|s: &Section| s.course_id == 2);

    let mut services = ServiceRegistry::new();
    services
        .register(
            EntityService::new("courseService", Arc::new(Yielding(db.repository::<Course>())))
                .with_relation(RelationDecl::one_to_many::<Section>(
                    "section_count",
                    "course_id",
                    "sectionService",
                    "course_id",
                )),
        )
        .unwrap();
    services
        .register(EntityService::new(
            "sectionService",
            Arc::new(Yielding(db.repository::<Section>())),
        ))
        .unwrap();
    services.initialize(&QueryContext::new()).await.unwrap();
    let courses = services.service::<Course>("courseService").unwrap();
    let sections = services.service::<Section>("sectionService").unwrap();

    let ctx = QueryContext::new();
    let alone = sections.get_count_by_filter(&ctx, Predicate::True).await.unwrap();
    assert_eq!(alone, 1);

    let mut rows = vec![course(1, 1, None), course(2, 1, None)];
    let (built, visible) = futures::join!(
        courses.build_all_relation_for_data_list(&ctx, &mut rows, Mode::Full, None),
        sections.get_count_by_filter(&ctx, Predicate::True),
    );
    built.unwrap();
    assert_eq!(visible.unwrap(), alone);
    assert_eq!(rows[0].section_count, Some(2));
    assert_eq!(rows[1].section_count, Some(1));
    assert!(ctx.data_filter_enabled());

    let filtered: Vec<bool> = db
        .journal()
        .iter()
        .filter(|call| call.call == RepositoryCall::Count)
        .map(|call| call.data_filter)
        .collect();
    assert_eq!(filtered, vec![true, true]);
}

#[tokio::test]
async fn single_record_matches_the_batch_result() {
    let fx = fixture().await;
    let courses = fx.services.service::<Course>("courseService").unwrap();
    let ctx = QueryContext::new();

    let one = courses
        .get_by_id_with_relation(&ctx, &Key::Int(1), Mode::Full)
        .await
        .unwrap()
        .unwrap();
    let mut batch = courses.get_all_list(&ctx).await.unwrap();
    courses
        .build_all_relation_for_data_list(&ctx, &mut batch, Mode::Full, None)
        .await
        .unwrap();

    assert_eq!(one.section_count, batch[0].section_count);
    assert_eq!(one.student_count, batch[0].student_count);
    assert_eq!(one.oldest_student, batch[0].oldest_student);
    assert_eq!(one.grade_dict, batch[0].grade_dict);
    assert_eq!(one.status_dict, Some(DictItem::new(1, "Active")));
}

#[tokio::test]
async fn default_criteria_hook_feeds_enriched_reads() {
    let db = MemoryDatabase::new();
    db.insert_all([course(1, 1, None)]);
    db.insert_all([student(100, 19, DELETED_FLAG_NORMAL), student(101, 17, DELETED_FLAG_NORMAL)]);
    db.insert_all([enrolment(1, 1, 100), enrolment(2, 1, 101)]);

    let mut services = ServiceRegistry::new();
    services
        .register(course_service(&db).with_aggregation_criteria(|| {
            let mut criteria = CriteriaMap::new();
            criteria.insert(
                "student_count".to_string(),
                vec![WhereCriteria::new::<Student>("age", Operator::Lt, 18)],
            );
            criteria
        }))
        .unwrap();
    services
        .register(EntityService::new("gradeService", Arc::new(db.repository::<Grade>())))
        .unwrap();
    services
        .register(EntityService::new("sectionService", Arc::new(db.repository::<Section>())))
        .unwrap();
    services
        .register(EntityService::new("studentService", Arc::new(db.repository::<Student>())))
        .unwrap();
    services.initialize(&QueryContext::new()).await.unwrap();

    let courses = services.service::<Course>("courseService").unwrap();
    let ctx = QueryContext::new();
    let rows = courses
        .get_list_with_relation_by_filter(
            &ctx,
            Filter::<Course>::new().into_predicate().unwrap(),
            &[],
            Mode::Full,
        )
        .await
        .unwrap();
    assert_eq!(rows[0].student_count, Some(1));
    assert_eq!(rows[0].section_count, None);
}

#[tokio::test]
async fn missing_target_service_fails_startup() {
    let db = MemoryDatabase::new();
    let mut services = ServiceRegistry::new();
    services.register(course_service(&db)).unwrap();
    services
        .register(EntityService::new("gradeService", Arc::new(db.repository::<Grade>())))
        .unwrap();

    let err = services.initialize(&QueryContext::new()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::UnresolvedRelationTarget { ref field, ref service, .. }
            if field == "section_count" && service == "sectionService"
    ));
}

#[tokio::test]
async fn reload_only_replaces_when_forced() {
    let fx = fixture().await;
    let grades = fx.services.service::<Grade>("gradeService").unwrap();
    let ctx = QueryContext::new();

    let extra = Uuid::new_v4().to_string();
    fx.db.insert(Grade {
        grade_id: extra.clone(),
        grade_name: "Junior".into(),
        deleted_flag: DELETED_FLAG_NORMAL,
    });
    grades.reload_cached_data(&ctx, false).await.unwrap();
    assert_eq!(grades.cached_count(), 2);
    grades.reload_cached_data(&ctx, true).await.unwrap();
    assert_eq!(grades.cached_count(), 3);
    assert!(grades.get_all_list_from_cache().iter().any(|g| g.grade_id == extra));
}

#[derive(Clone, Debug, Entity)]
#[entity(table = "zz_teacher")]
struct Teacher {
    #[entity(id)]
    teacher_id: i64,
}

#[derive(Clone, Debug, Default, Entity)]
#[entity(table = "zz_lesson")]
struct Lesson {
    #[entity(id)]
    lesson_id: i64,
    teacher_id: i64,
    #[relation(object)]
    teacher: Option<Teacher>,
}

struct Unreachable;

impl Repository<Teacher> for Unreachable {
    fn get_by_id<'a>(
        &'a self,
        _ctx: &'a QueryContext,
        _id: &'a Key,
    ) -> BoxFuture<'a, Result<Option<Teacher>, Error>> {
        Box::pin(future::ready(Err(Error::Repository("connection reset".into()))))
    }

    fn get_all_normal<'a>(
        &'a self,
        _ctx: &'a QueryContext,
    ) -> BoxFuture<'a, Result<Vec<Teacher>, Error>> {
        Box::pin(future::ready(Err(Error::Repository("connection reset".into()))))
    }

    fn select_in_list<'a>(
        &'a self,
        _ctx: &'a QueryContext,
        _field: &'a str,
        _ids: &'a [Key],
        _order_by: &'a [&'a str],
    ) -> BoxFuture<'a, Result<Vec<Teacher>, Error>> {
        Box::pin(future::ready(Err(Error::Repository("connection reset".into()))))
    }

    fn count<'a>(
        &'a self,
        _ctx: &'a QueryContext,
        _filter: &'a Predicate,
    ) -> BoxFuture<'a, Result<u64, Error>> {
        Box::pin(future::ready(Err(Error::Repository("connection reset".into()))))
    }

    fn grouped_select<'a>(
        &'a self,
        _ctx: &'a QueryContext,
        _query: &'a GroupedQuery,
    ) -> BoxFuture<'a, Result<Vec<GroupedRow>, Error>> {
        Box::pin(future::ready(Err(Error::Repository("connection reset".into()))))
    }

    fn condition_select<'a>(
        &'a self,
        _ctx: &'a QueryContext,
        _select_fields: &'a [&'a str],
        _filter: &'a Predicate,
        _order_by: &'a [&'a str],
    ) -> BoxFuture<'a, Result<Vec<Teacher>, Error>> {
        Box::pin(future::ready(Err(Error::Repository("connection reset".into()))))
    }
}

#[tokio::test]
async fn repository_errors_propagate_and_restore_the_scope() {
    let db = MemoryDatabase::new();
    let mut services = ServiceRegistry::new();
    services
        .register(EntityService::new("teacherService", Arc::new(Unreachable)))
        .unwrap();
    services
        .register(
            EntityService::new("lessonService", Arc::new(db.repository::<Lesson>()))
                .with_relation(RelationDecl::one_to_one("teacher", "teacher_id", "teacherService")),
        )
        .unwrap();
    services.initialize(&QueryContext::new()).await.unwrap();

    let lessons = services.service::<Lesson>("lessonService").unwrap();
    let ctx = QueryContext::new();
    let mut rows = vec![Lesson {
        lesson_id: 1,
        teacher_id: 7,
        teacher: None,
    }];
    let err = lessons
        .build_relation_for_data_list(&ctx, &mut rows, Mode::Full)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Repository(ref msg) if msg == "connection reset"));
    assert!(ctx.data_filter_enabled());
    assert!(rows[0].teacher.is_none());
}
