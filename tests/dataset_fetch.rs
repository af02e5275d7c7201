//! End-to-end dataset resolution against the scripted driver: grouping,
//! keying, augments, static broadcast, procedures, hooks and error
//! isolation over a small product/texts fixture.

mod helpers;

use std::collections::HashMap;
use std::sync::Arc;

use entity_datasets::dataset::hooks::{PostHookFn, PostOutcome, ProcedureFn};
use entity_datasets::dataset::Request;
use entity_datasets::db::memory::MemoryDatabase;
use entity_datasets::error::DatasetError;
use entity_datasets::value::{EntityId, Value};

use helpers::{engine_with, i, map, s, seq, write_recipe};

const TEXTS_RECIPE: &str = r#"
query.sql: >
    SELECT ProductId, Title, Status
    FROM Products
    WHERE {{ID:ProductId}}
query.columns: [ ProductId, Title, Status ]
query.id: [ ProductId ]
query.key: [ ProductId ]
query.augment:
    Identifiers:
        query.sql: SELECT ProductId, IDValue FROM ProductIdentifiers WHERE {{ID:ProductId}}
        query.columns: [ ProductId, IDValue ]
        query.id: [ ProductId ]
        query.group: [ ProductId ]
    TextsHash:
        query.sql: SELECT ProductId, TextRole, TextContent FROM ProductTexts WHERE {{ID:ProductId}}
        query.columns: [ ProductId, TextRole, TextContent ]
        query.id: [ ProductId ]
        query.group: [ ProductId ]
        query.key: [ ProductId, TextRole ]
    TextsList:
        query.sql: SELECT ProductId, TextRole, TextContent FROM ProductTexts WHERE {{ID:ProductId}}
        query.columns: [ ProductId, TextRole, TextContent ]
        query.id: [ ProductId ]
        query.group: [ ProductId ]
"#;

fn script_products(db: &MemoryDatabase) {
    db.script(
        "SELECT ProductId, Title, Status FROM Products WHERE ProductId IN (1, 2, 3)",
        &["ProductId", "Title", "Status"],
        vec![
            vec![i(1), s("Title 1"), s("OK")],
            vec![i(2), s("Title 2"), s("ER")],
            vec![i(3), s("Title 3"), s("OK")],
        ],
    );
    db.script(
        "SELECT ProductId, IDValue FROM ProductIdentifiers WHERE ProductId IN (1, 2, 3)",
        &["ProductId", "IDValue"],
        vec![
            vec![i(1), s("8050443322")],
            vec![i(1), s("97880504433221")],
            vec![i(2), s("9090443343")],
            vec![i(3), s("97832989052232")],
        ],
    );
    db.script(
        "SELECT ProductId, TextRole, TextContent FROM ProductTexts WHERE ProductId IN (1, 2, 3)",
        &["ProductId", "TextRole", "TextContent"],
        vec![
            vec![i(1), s("01"), s("text for 1/01")],
            vec![i(1), s("18"), s("text for 1/18")],
            vec![i(1), s("26"), s("text for 1/26")],
            vec![i(2), s("01"), s("text for 2/01")],
            vec![i(2), s("18"), s("text for 2/18")],
            vec![i(3), s("01"), s("text for 3/01")],
        ],
    );
}

fn text_row(product: i64, role: &str) -> Value {
    map(vec![
        ("ProductId", i(product)),
        ("TextRole", s(role)),
        ("TextContent", s(&format!("text for {}/{}", product, role))),
    ])
}

#[tokio::test]
async fn augment_with_group_and_key() {
    let dir = tempfile::tempdir().unwrap();
    write_recipe(dir.path(), "PROD", "texts", TEXTS_RECIPE);
    let db = MemoryDatabase::new();
    script_products(&db);
    let engine = engine_with(db, dir.path());

    let results = engine
        .fetch(vec![
            Request::new("PROD", 1, "texts"),
            Request::new("PROD", 2, "texts"),
            Request::new("PROD", 3, "texts"),
        ])
        .await;

    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|entry| !entry.failed()));

    let expected_1 = map(vec![
        ("ProductId", i(1)),
        ("Title", s("Title 1")),
        ("Status", s("OK")),
        (
            "Identifiers",
            seq(vec![
                map(vec![("ProductId", i(1)), ("IDValue", s("8050443322"))]),
                map(vec![("ProductId", i(1)), ("IDValue", s("97880504433221"))]),
            ]),
        ),
        (
            "TextsHash",
            map(vec![
                ("01", text_row(1, "01")),
                ("18", text_row(1, "18")),
                ("26", text_row(1, "26")),
            ]),
        ),
        (
            "TextsList",
            seq(vec![text_row(1, "01"), text_row(1, "18"), text_row(1, "26")]),
        ),
    ]);
    assert_eq!(results[0].data(), Some(&expected_1));

    let expected_3 = map(vec![
        ("ProductId", i(3)),
        ("Title", s("Title 3")),
        ("Status", s("OK")),
        (
            "Identifiers",
            seq(vec![map(vec![
                ("ProductId", i(3)),
                ("IDValue", s("97832989052232")),
            ])]),
        ),
        ("TextsHash", map(vec![("01", text_row(3, "01"))])),
        ("TextsList", seq(vec![text_row(3, "01")])),
    ]);
    assert_eq!(results[2].data(), Some(&expected_3));
}

#[tokio::test]
async fn order_is_preserved_and_ids_deduplicated() {
    let dir = tempfile::tempdir().unwrap();
    write_recipe(
        dir.path(),
        "PROD",
        "plain",
        r#"
query.sql: SELECT ProductId, Title FROM Products WHERE {{ID:ProductId}}
query.columns: [ ProductId, Title ]
query.id: [ ProductId ]
query.key: [ ProductId ]
"#,
    );
    let db = MemoryDatabase::new();
    // Ids deduplicate in first-seen order, so the one main query says (3, 1, 2).
    db.script(
        "SELECT ProductId, Title FROM Products WHERE ProductId IN (3, 1, 2)",
        &["ProductId", "Title"],
        vec![
            vec![i(1), s("Title 1")],
            vec![i(2), s("Title 2")],
            vec![i(3), s("Title 3")],
        ],
    );
    let engine = engine_with(db.clone(), dir.path());

    let requests = vec![
        Request::new("PROD", 3, "plain"),
        Request::new("PROD", 1, "plain"),
        Request::new("PROD", 3, "plain"),
        Request::new("PROD", 2, "plain"),
    ];
    let results = engine.fetch(requests.clone()).await;

    assert_eq!(results.len(), requests.len());
    for (request, entry) in requests.iter().zip(&results) {
        assert_eq!(entry.entity_type, request.entity_type);
        assert_eq!(entry.entity_id, request.entity_id);
        assert!(!entry.failed());
    }
    // Duplicate ids share one payload, and the group cost one query.
    assert_eq!(results[0].data(), results[2].data());
    assert_eq!(db.executed().len(), 1);
}

#[tokio::test]
async fn coalescing_issues_one_main_query_per_group() {
    let dir = tempfile::tempdir().unwrap();
    write_recipe(
        dir.path(),
        "PROD",
        "plain",
        r#"
query.sql: SELECT ProductId, Title FROM Products WHERE {{ID:ProductId}}
query.columns: [ ProductId, Title ]
query.id: [ ProductId ]
query.key: [ ProductId ]
"#,
    );
    write_recipe(
        dir.path(),
        "CONT",
        "plain",
        r#"
query.sql: SELECT ContributorId, Name FROM Contributors WHERE {{ID:ContributorId}}
query.columns: [ ContributorId, Name ]
query.id: [ ContributorId ]
query.key: [ ContributorId ]
"#,
    );
    let db = MemoryDatabase::new();
    db.script(
        "SELECT ProductId, Title FROM Products WHERE ProductId IN (1, 2)",
        &["ProductId", "Title"],
        vec![vec![i(1), s("Title 1")], vec![i(2), s("Title 2")]],
    );
    db.script(
        "SELECT ContributorId, Name FROM Contributors WHERE ContributorId IN (7)",
        &["ContributorId", "Name"],
        vec![vec![i(7), s("Someone")]],
    );
    let engine = engine_with(db.clone(), dir.path());

    let results = engine
        .fetch(vec![
            Request::new("PROD", 1, "plain"),
            Request::new("CONT", 7, "plain"),
            Request::new("PROD", 2, "plain"),
            Request::new("PROD", 1, "plain"),
        ])
        .await;

    assert!(results.iter().all(|entry| !entry.failed()));
    // Two distinct (EntityType, DatasetName) groups: exactly two queries.
    assert_eq!(db.executed().len(), 2);
}

#[tokio::test]
async fn static_augment_broadcasts_to_every_row() {
    let dir = tempfile::tempdir().unwrap();
    write_recipe(
        dir.path(),
        "PROD",
        "totals",
        r#"
query.sql: SELECT ProductId FROM Products WHERE {{ID:ProductId}}
query.columns: [ ProductId ]
query.id: [ ProductId ]
query.key: [ ProductId ]
query.augment:
    TotalCount:
        query.sql: SELECT 4 AS Total, 1 AS Min, 4 AS Max
        query.columns: [ Total, Min, Max ]
        query.static: true
"#,
    );
    let db = MemoryDatabase::new();
    db.script(
        "SELECT ProductId FROM Products WHERE ProductId IN (1, 2)",
        &["ProductId"],
        vec![vec![i(1)], vec![i(2)]],
    );
    db.script(
        "SELECT 4 AS Total, 1 AS Min, 4 AS Max",
        &["Total", "Min", "Max"],
        vec![vec![i(4), i(1), i(4)]],
    );
    let engine = engine_with(db, dir.path());

    let results = engine
        .fetch(vec![
            Request::new("PROD", 1, "totals"),
            Request::new("PROD", 2, "totals"),
        ])
        .await;

    let totals = map(vec![("Total", i(4)), ("Min", i(1)), ("Max", i(4))]);
    for entry in &results {
        let Some(Value::Map(payload)) = entry.data() else {
            panic!("expected a payload map");
        };
        assert_eq!(payload["TotalCount"], totals);
    }
}

#[tokio::test]
async fn single_dataset_broadcasts_merged_augments() {
    let dir = tempfile::tempdir().unwrap();
    write_recipe(
        dir.path(),
        "PAGE",
        "augments",
        r#"
single: true
augment:
    Set1:
        query.sql: SELECT ProductId, Title FROM Products WHERE Status = 'OK'
        query.columns: [ ProductId, Title ]
        query.output: list
    Set2:
        query.sql: SELECT ProductId, Title FROM Products WHERE Status = 'ER'
        query.columns: [ ProductId, Title ]
        query.output: list
"#,
    );
    let db = MemoryDatabase::new();
    db.script(
        "SELECT ProductId, Title FROM Products WHERE Status = 'OK'",
        &["ProductId", "Title"],
        vec![vec![i(1), s("Title 1")], vec![i(3), s("Title 3")]],
    );
    db.script(
        "SELECT ProductId, Title FROM Products WHERE Status = 'ER'",
        &["ProductId", "Title"],
        vec![vec![i(2), s("Title 2")]],
    );
    let engine = engine_with(db, dir.path());

    let results = engine
        .fetch(vec![
            Request::new("PAGE", 1, "augments"),
            Request::new("PAGE", 2, "augments"),
        ])
        .await;

    let expected = map(vec![
        (
            "Set1",
            seq(vec![
                map(vec![("ProductId", i(1)), ("Title", s("Title 1"))]),
                map(vec![("ProductId", i(3)), ("Title", s("Title 3"))]),
            ]),
        ),
        (
            "Set2",
            seq(vec![map(vec![("ProductId", i(2)), ("Title", s("Title 2"))])]),
        ),
    ]);
    // Broadcast: every id in the group carries a structurally equal payload.
    assert_eq!(results[0].data(), Some(&expected));
    assert_eq!(results[1].data(), Some(&expected));
}

#[tokio::test]
async fn loose_types_coerce_per_recipe() {
    let dir = tempfile::tempdir().unwrap();
    write_recipe(
        dir.path(),
        "PROD",
        "coerced",
        r#"
query.sql: SELECT ProductId, CoerceBool, CoerceDatetime, CoerceFloat FROM Loose WHERE {{ID:ProductId}}
query.columns: [ ProductId, CoerceBool, CoerceDatetime, CoerceFloat ]
query.id: [ ProductId ]
query.key: [ ProductId ]
query.coerce:
    boolean: [ CoerceBool ]
    CoerceDatetime:
        type: datetime
    CoerceFloat:
        type: float
        mode: ok-or-none
"#,
    );
    let db = MemoryDatabase::new_loose();
    db.script(
        "SELECT ProductId, CoerceBool, CoerceDatetime, CoerceFloat FROM Loose WHERE ProductId IN (1)",
        &["ProductId", "CoerceBool", "CoerceDatetime", "CoerceFloat"],
        vec![vec![
            i(1),
            s("1"),
            s("2011-12-02T16:34:45.453Z"),
            s("abc"),
        ]],
    );
    let engine = engine_with(db, dir.path());

    let results = engine.fetch(vec![Request::new("PROD", 1, "coerced")]).await;
    let Some(Value::Map(payload)) = results[0].data() else {
        panic!("expected a payload map");
    };
    assert_eq!(payload["CoerceBool"], Value::Bool(true));
    assert_eq!(
        payload["CoerceDatetime"],
        Value::DateTime(
            chrono::NaiveDate::from_ymd_opt(2011, 12, 2)
                .unwrap()
                .and_hms_micro_opt(16, 34, 45, 453_000)
                .unwrap()
        )
    );
    // ok-or-none turns the unparsable float into null.
    assert_eq!(payload["CoerceFloat"], Value::Null);
}

#[tokio::test]
async fn procedure_recipes_call_registered_hooks() {
    let dir = tempfile::tempdir().unwrap();
    write_recipe(dir.path(), "PROD", "hash", "code.name: hashmod.md5Hash\n");
    let engine = engine_with(MemoryDatabase::new(), dir.path());

    let md5_hash: Arc<ProcedureFn> = Arc::new(|_recipe, _entity, _dataset, ids| {
        let mut result = HashMap::new();
        for id in ids {
            let digest = md5::compute(id.to_string().as_bytes());
            result.insert(id.clone(), Value::Str(format!("{:x}", digest)));
        }
        Ok(result)
    });
    engine.procedures().register("hashmod", "md5Hash", md5_hash);

    let results = engine
        .fetch(vec![
            Request::new("PROD", 1, "hash"),
            Request::new("PROD", 2, "hash"),
            Request::new("PROD", 3, "hash"),
            Request::new("PROD", 4, "hash"),
        ])
        .await;

    let digests: Vec<_> = results
        .iter()
        .map(|entry| entry.data().unwrap().to_string())
        .collect();
    assert_eq!(
        digests,
        vec![
            "c4ca4238a0b923820dcc509a6f75849b",
            "c81e728d9d4c2f636f067f89cc14862c",
            "eccbc87e4b5ce2fe28308fd9f2a7baf3",
            "a87ff679a2f3e71d9181a67b7542122c",
        ]
    );
}

#[tokio::test]
async fn unknown_procedure_fails_the_group() {
    let dir = tempfile::tempdir().unwrap();
    write_recipe(dir.path(), "PROD", "hash", "code.name: nomodule.nothing\n");
    let engine = engine_with(MemoryDatabase::new(), dir.path());

    let results = engine.fetch(vec![Request::new("PROD", 1, "hash")]).await;
    assert!(matches!(
        results[0].error(),
        Some(DatasetError::UnknownHook(_))
    ));
}

#[tokio::test]
async fn hook_failure_is_contained_to_its_group() {
    let dir = tempfile::tempdir().unwrap();
    write_recipe(
        dir.path(),
        "PROD",
        "plain",
        r#"
query.sql: SELECT ProductId, Title FROM Products WHERE {{ID:ProductId}}
query.columns: [ ProductId, Title ]
query.id: [ ProductId ]
query.key: [ ProductId ]
"#,
    );
    write_recipe(
        dir.path(),
        "PROD",
        "broken",
        r#"
query.sql: SELECT ProductId, Title FROM Products WHERE {{ID:ProductId}}
query.columns: [ ProductId, Title ]
query.id: [ ProductId ]
query.key: [ ProductId ]
query.post: fixes.explode
"#,
    );
    let db = MemoryDatabase::new();
    db.script(
        "SELECT ProductId, Title FROM Products WHERE ProductId IN (1, 3)",
        &["ProductId", "Title"],
        vec![vec![i(1), s("Title 1")], vec![i(3), s("Title 3")]],
    );
    db.script(
        "SELECT ProductId, Title FROM Products WHERE ProductId IN (2)",
        &["ProductId", "Title"],
        vec![vec![i(2), s("Title 2")]],
    );
    let engine = engine_with(db, dir.path());

    let explode: Arc<PostHookFn> =
        Arc::new(|_row| Err(DatasetError::Runtime("hook blew up".to_string())));
    engine.post_hooks().register("fixes", "explode", explode);

    let results = engine
        .fetch(vec![
            Request::new("PROD", 1, "plain"),
            Request::new("PROD", 2, "broken"),
            Request::new("PROD", 3, "plain"),
        ])
        .await;

    assert!(!results[0].failed());
    assert!(matches!(results[1].error(), Some(DatasetError::Runtime(_))));
    assert!(!results[2].failed());
    // Ordering still matches the request order.
    assert_eq!(results[1].entity_id, EntityId::Int(2));
}

#[tokio::test]
async fn dropped_rows_become_missing_keys() {
    let dir = tempfile::tempdir().unwrap();
    write_recipe(
        dir.path(),
        "PROD",
        "onlyok",
        r#"
query.sql: SELECT ProductId, Title, Status FROM Products WHERE {{ID:ProductId}}
query.columns: [ ProductId, Title, Status ]
query.id: [ ProductId ]
query.key: [ ProductId ]
query.post: fixes.drop_errors
"#,
    );
    let db = MemoryDatabase::new();
    db.script(
        "SELECT ProductId, Title, Status FROM Products WHERE ProductId IN (1, 2)",
        &["ProductId", "Title", "Status"],
        vec![
            vec![i(1), s("Title 1"), s("OK")],
            vec![i(2), s("Title 2"), s("ER")],
        ],
    );
    let engine = engine_with(db, dir.path());

    let drop_errors: Arc<PostHookFn> = Arc::new(|row| {
        if row.get("Status").and_then(|v| v.as_str()) == Some("ER") {
            Ok(PostOutcome::Drop)
        } else {
            Ok(PostOutcome::Row(row))
        }
    });
    engine.post_hooks().register("fixes", "drop_errors", drop_errors);

    let results = engine
        .fetch(vec![
            Request::new("PROD", 1, "onlyok"),
            Request::new("PROD", 2, "onlyok"),
        ])
        .await;

    assert!(!results[0].failed());
    assert!(matches!(
        results[1].error(),
        Some(DatasetError::MissingKey(_))
    ));
}

#[tokio::test]
async fn missing_recipe_marks_every_id_in_the_group() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(MemoryDatabase::new(), dir.path());

    let results = engine
        .fetch(vec![
            Request::new("PROD", 1, "nothing"),
            Request::new("PROD", 2, "nothing"),
        ])
        .await;

    for entry in &results {
        assert!(matches!(
            entry.error(),
            Some(DatasetError::RecipeNotFound { .. })
        ));
    }
}

#[tokio::test]
async fn pre_process_rewrites_requests() {
    let dir = tempfile::tempdir().unwrap();
    write_recipe(dir.path(), "SUBJ", "category", "single: true\n");
    let engine = engine_with(MemoryDatabase::new(), dir.path());

    let rewrite: Arc<entity_datasets::dataset::PreProcessFn> =
        Arc::new(|requests: Vec<Request>, _app: &str| {
            requests
                .into_iter()
                .map(|mut request| {
                    if request.dataset == "generic" {
                        request.dataset = "category".to_string();
                    }
                    request
                })
                .collect()
        });
    let previous = engine.set_pre_process(Some(rewrite));
    assert!(previous.is_none());

    let results = engine.fetch(vec![Request::new("SUBJ", 1, "generic")]).await;
    assert!(!results[0].failed());
}
