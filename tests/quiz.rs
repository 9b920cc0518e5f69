//! End-to-end coverage over a quiz-domain fixture: collections of
//! questions with tags, attachments, games and per-player answers.

use fieldbind::{
    AttrKind, AttributeMeta, Blob, BlobMap, Choice, Engine, EntityType, FieldSpec,
    FilterExpression, InclusionEntry, Instance, MemoryProvider, PersistenceProvider, Written,
    WriteTarget,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::HashMap;

fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn text() -> AttrKind {
    AttrKind::Text {
        max_length: None,
        choices: vec![],
    }
}

fn text_max(max: u32) -> AttrKind {
    AttrKind::Text {
        max_length: Some(max),
        choices: vec![],
    }
}

fn choice_text(choices: &[(&str, &str)]) -> AttrKind {
    AttrKind::Text {
        max_length: None,
        choices: choices.iter().map(|(v, l)| Choice::new(*v, *l)).collect(),
    }
}

fn belongs_to(target: &str) -> AttrKind {
    AttrKind::BelongsTo {
        target: target.into(),
    }
}

fn has_many(target: &str, fk: &str) -> AttrKind {
    AttrKind::HasMany {
        target: target.into(),
        foreign_key: fk.into(),
    }
}

fn quiz_provider() -> MemoryProvider {
    MemoryProvider::new(vec![
        EntityType::new("category", vec![AttributeMeta::new("name", "Name", text())]),
        EntityType::new("tag", vec![AttributeMeta::new("name", "Name", text())]),
        EntityType::new(
            "attachment",
            vec![
                AttributeMeta::new("name", "Name", text()),
                AttributeMeta::new("document", "Document", AttrKind::File),
            ],
        ),
        EntityType::new(
            "collection",
            vec![
                AttributeMeta::new("name", "Name", text_max(120)).required(),
                AttributeMeta::new("kind", "Kind", text()),
                AttributeMeta::new("category", "Category", belongs_to("category")),
                AttributeMeta::new(
                    "tags",
                    "Tags",
                    AttrKind::ManyToMany {
                        target: "tag".into(),
                    },
                ),
                AttributeMeta::new(
                    "attachments",
                    "Attachments",
                    AttrKind::ManyToMany {
                        target: "attachment".into(),
                    },
                ),
                AttributeMeta::new("questions", "Questions", has_many("question", "collection")),
                AttributeMeta::new("labels", "Labels", has_many("collection_label", "collection")),
            ],
        ),
        EntityType::new(
            "collection_label",
            vec![
                AttributeMeta::new("collection", "Collection", belongs_to("collection")),
                AttributeMeta::new("label", "Label", belongs_to("tag")),
            ],
        ),
        EntityType::new(
            "player",
            vec![
                AttributeMeta::new("name", "Name", text()).required(),
                AttributeMeta::new(
                    "channels",
                    "Channels",
                    AttrKind::TextArray {
                        choices: vec![Choice::new("email", "Email"), Choice::new("sms", "SMS")],
                    },
                ),
                AttributeMeta::new("settings", "Settings", has_many("player_settings", "player")),
            ],
        ),
        EntityType::new(
            "player_settings",
            vec![
                AttributeMeta::new("player", "Player", belongs_to("player")),
                AttributeMeta::new("notify", "Notify", AttrKind::Bool),
            ],
        ),
        EntityType::new(
            "question",
            vec![
                AttributeMeta::new("collection", "Collection", belongs_to("collection")),
                AttributeMeta::new("text", "Text", AttrKind::LongText).required(),
                AttributeMeta::new(
                    "order",
                    "Order",
                    AttrKind::Integer {
                        min: None,
                        max: None,
                    },
                ),
                AttributeMeta::new(
                    "points",
                    "Points",
                    AttrKind::Integer {
                        min: Some(0),
                        max: Some(100),
                    },
                ),
                AttributeMeta::new(
                    "correct",
                    "Correct answer",
                    choice_text(&[("1", "Answer 1"), ("2", "Answer 2"), ("3", "Answer 3"), ("4", "Answer 4")]),
                ),
                AttributeMeta::new(
                    "question_type",
                    "Type",
                    choice_text(&[("text", "Text"), ("numeric", "Numeric")]),
                ),
                AttributeMeta::new("hint_text", "Hint", text()),
                AttributeMeta::new(
                    "precision",
                    "Precision",
                    AttrKind::Integer {
                        min: None,
                        max: None,
                    },
                ),
                AttributeMeta::new("photo_file", "Photo", AttrKind::File),
            ],
        ),
        EntityType::new(
            "game",
            vec![
                AttributeMeta::new("collection", "Collection", belongs_to("collection")),
                AttributeMeta::new("player", "Player", belongs_to("player")),
                AttributeMeta::new("finished", "Finished", AttrKind::Bool),
                AttributeMeta::new("played", "Played", AttrKind::Date),
                AttributeMeta::new(
                    "score",
                    "Score",
                    AttrKind::Integer {
                        min: None,
                        max: None,
                    },
                ),
                AttributeMeta::new("period_from", "Period from", AttrKind::Date),
                AttributeMeta::new("period_to", "Period to", AttrKind::Date),
            ],
        ),
    ])
}

fn spec(v: Value) -> FieldSpec {
    serde_json::from_value(v).unwrap()
}

fn question_form() -> FieldSpec {
    spec(json!({
        "type": "Fields",
        "fields": [
            { "from_field": "id" },
            { "from_field": "text" },
            { "from_field": "points" },
            { "from_field": "correct" },
            { "from_field": "collection.name", "key": "collection_name" },
        ]
    }))
}

fn no_blobs() -> BlobMap {
    HashMap::new()
}

#[test]
fn question_form_resolves_with_kinds_and_validators() {
    trace_init();
    let provider = quiz_provider();
    let engine = Engine::new(&provider);
    let schema = engine.resolve(&question_form(), "question").unwrap();
    let schema = serde_json::to_value(&schema).unwrap();

    let children = schema["children"].as_array().unwrap();
    assert_eq!(children[0]["kind"], json!("hidden"));
    assert_eq!(children[1]["kind"], json!("textarea"));
    assert_eq!(children[1]["required"], json!(true));
    assert_eq!(
        children[2]["validators"],
        json!([
            { "type": "minNumber", "value": 0 },
            { "type": "maxNumber", "value": 100 }
        ])
    );
    assert_eq!(children[3]["kind"], json!("select"));
    assert_eq!(children[3]["options"][1]["label"], json!("Answer 2"));
    // The dotted leaf remembers its relation hop.
    assert_eq!(children[4]["path"], json!(["collection"]));
}

#[test]
fn resolving_twice_yields_the_same_schema() {
    let provider = quiz_provider();
    provider.seed("category", json!({ "name": "General" })).unwrap();
    provider
        .seed("collection", json!({ "name": "Capitals", "category": 1 }))
        .unwrap();
    let engine = Engine::new(&provider);
    let form = spec(json!({
        "type": "Fields",
        "fields": [{ "from_field": "collection" }, { "from_field": "played" }]
    }));
    let a = engine.resolve(&form, "game").unwrap();
    let b = engine.resolve(&form, "game").unwrap();
    assert_eq!(serde_json::to_value(&a).unwrap(), serde_json::to_value(&b).unwrap());
}

#[test]
fn write_then_read_round_trips_scalars_and_choices() {
    let provider = quiz_provider();
    let engine = Engine::new(&provider);
    let data = json!({ "text": "Capital of France?", "points": "10", "correct": "2" });
    let written = engine
        .write(
            &question_form(),
            WriteTarget::Instance(Instance::new("question")),
            &data,
            &no_blobs(),
        )
        .unwrap();
    let Written::One(saved) = written else {
        panic!("expected a single instance");
    };

    let form = engine.resolve_and_read(&question_form(), &saved).unwrap();
    assert_eq!(form.data["text"], json!("Capital of France?"));
    assert_eq!(form.data["points"], json!(10));
    assert_eq!(form.data["correct"], json!({ "value": "2", "label": "Answer 2" }));
    assert_eq!(form.data["collection_name"], Value::Null);
    assert_eq!(form.data["id"], json!(saved.id.unwrap()));
}

#[test]
fn relation_select_reads_value_label_pairs() {
    let provider = quiz_provider();
    let collection = provider
        .seed("collection", json!({ "name": "Capitals" }))
        .unwrap();
    let engine = Engine::new(&provider);
    let form = spec(json!({
        "type": "Fields",
        "fields": [{ "from_field": "collection" }]
    }));
    let written = engine
        .write(
            &form,
            WriteTarget::Instance(Instance::new("game")),
            &json!({ "collection": { "value": collection } }),
            &no_blobs(),
        )
        .unwrap();
    let Written::One(game) = written else { panic!() };
    let read = engine.resolve_and_read(&form, &game).unwrap();
    assert_eq!(
        read.data["collection"],
        json!({ "value": collection, "label": "Capitals" })
    );
}

#[test]
fn relation_options_group_by_a_related_attribute() {
    let provider = quiz_provider();
    let geo = provider.seed("category", json!({ "name": "Geography" })).unwrap();
    let hist = provider.seed("category", json!({ "name": "History" })).unwrap();
    provider
        .seed("collection", json!({ "name": "Capitals", "category": geo }))
        .unwrap();
    provider
        .seed("collection", json!({ "name": "Rivers", "category": geo }))
        .unwrap();
    provider
        .seed("collection", json!({ "name": "Kings", "category": hist }))
        .unwrap();
    let engine = Engine::new(&provider);
    let form = spec(json!({
        "type": "Fields",
        "fields": [{ "from_field": "collection", "option_group": "category" }]
    }));
    let schema = engine.resolve(&form, "game").unwrap();
    let options = serde_json::to_value(&schema.children[0].options).unwrap();
    assert_eq!(options[0]["label"], json!("Geography"));
    assert_eq!(options[0]["options"].as_array().unwrap().len(), 2);
    assert_eq!(options[1]["label"], json!("History"));
}

#[test]
fn unchanged_memberships_issue_no_relation_calls() {
    let provider = quiz_provider();
    let t1 = provider.seed("tag", json!({ "name": "easy" })).unwrap();
    let t2 = provider.seed("tag", json!({ "name": "fun" })).unwrap();
    let collection = provider
        .seed("collection", json!({ "name": "Capitals" }))
        .unwrap();
    let engine = Engine::new(&provider);
    let form = spec(json!({
        "type": "Fields",
        "fields": [{ "from_field": "tags" }]
    }));
    let target = || {
        WriteTarget::Instance(provider.get("collection", collection).unwrap().unwrap())
    };
    let data = json!({ "tags": [{ "value": t1 }, { "value": t2 }] });
    engine.write(&form, target(), &data, &no_blobs()).unwrap();
    let ops_after_first = provider.relation_op_count();

    engine.write(&form, target(), &data, &no_blobs()).unwrap();
    assert_eq!(provider.relation_op_count(), ops_after_first);

    // Dropping one member costs exactly one removal.
    engine
        .write(&form, target(), &json!({ "tags": [{ "value": t1 }] }), &no_blobs())
        .unwrap();
    assert_eq!(provider.relation_op_count(), ops_after_first + 1);
}

fn collection_with_questions() -> FieldSpec {
    spec(json!({
        "type": "Fields",
        "fields": [
            { "from_field": "name" },
            {
                "type": "ForeignKeyListField",
                "key": "questions",
                "ordered": true,
                "fields": [
                    { "from_field": "id" },
                    { "from_field": "text" },
                    { "from_field": "points" },
                ]
            }
        ]
    }))
}

#[test]
fn nested_collection_reconciles_by_id() {
    let provider = quiz_provider();
    let engine = Engine::new(&provider);
    let form = collection_with_questions();

    let written = engine
        .write(
            &form,
            WriteTarget::Instance(Instance::new("collection")),
            &json!({
                "name": "Capitals",
                "questions": [
                    { "text": "A?", "points": 1 },
                    { "text": "B?", "points": 2 },
                    { "text": "C?", "points": 3 },
                ]
            }),
            &no_blobs(),
        )
        .unwrap();
    let Written::One(collection) = written else { panic!() };

    let read = engine.resolve_and_read(&form, &collection).unwrap();
    let first = read.data["questions"][0].clone();
    assert_eq!(first["text"], json!("A?"));
    let a_id = first["id"].as_i64().unwrap();

    // Resubmit keeping A (modified) and adding D: B and C must go.
    engine
        .write(
            &form,
            WriteTarget::Instance(provider.get("collection", collection.id.unwrap()).unwrap().unwrap()),
            &json!({
                "name": "Capitals",
                "questions": [
                    { "id": a_id, "text": "A, reworded?", "points": 5 },
                    { "text": "D?", "points": 4 },
                ]
            }),
            &no_blobs(),
        )
        .unwrap();

    let read = engine.resolve_and_read(&form, &collection).unwrap();
    let questions = read.data["questions"].as_array().unwrap();
    assert_eq!(questions.len(), 2);
    assert_eq!(questions[0]["id"], json!(a_id));
    assert_eq!(questions[0]["text"], json!("A, reworded?"));
    assert_eq!(questions[1]["text"], json!("D?"));

    // Ordered collections stamp 1..n in submission order.
    let a = provider.get("question", a_id).unwrap().unwrap();
    assert_eq!(a.get("order"), Some(&json!(1)));
    let d_id = questions[1]["id"].as_i64().unwrap();
    let d = provider.get("question", d_id).unwrap().unwrap();
    assert_eq!(d.get("order"), Some(&json!(2)));
}

#[test]
fn stale_item_ids_are_skipped_quietly() {
    let provider = quiz_provider();
    let engine = Engine::new(&provider);
    let form = collection_with_questions();
    let written = engine
        .write(
            &form,
            WriteTarget::Instance(Instance::new("collection")),
            &json!({
                "name": "Capitals",
                "questions": [
                    { "id": 9999, "text": "ghost?", "points": 1 },
                    { "text": "real?", "points": 2 },
                ]
            }),
            &no_blobs(),
        )
        .unwrap();
    let Written::One(collection) = written else { panic!() };
    let read = engine.resolve_and_read(&form, &collection).unwrap();
    let questions = read.data["questions"].as_array().unwrap();
    assert_eq!(questions.len(), 1);
    assert_eq!(questions[0]["text"], json!("real?"));
}

#[test]
fn bulk_collection_is_scoped_by_criteria() {
    let provider = quiz_provider();
    let quiz = provider
        .seed("collection", json!({ "name": "Capitals", "kind": "quiz" }))
        .unwrap();
    let survey = provider
        .seed("collection", json!({ "name": "Feedback", "kind": "survey" }))
        .unwrap();
    let engine = Engine::new(&provider);
    let form = spec(json!({
        "type": "ListField",
        "entity": "collection",
        "criteria": { "kind": "quiz" },
        "fields": [{ "from_field": "id" }, { "from_field": "name" }]
    }));

    let read = engine.resolve_and_read_bulk(&form).unwrap();
    let items = read.data.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["name"], json!("Capitals"));

    // Writing an empty submission deletes within the criteria only.
    engine
        .write(&form, WriteTarget::Bulk, &json!([{ "name": "Flags" }]), &no_blobs())
        .unwrap();
    assert!(provider.get("collection", quiz).unwrap().is_none());
    assert!(provider.get("collection", survey).unwrap().is_some());

    // New rows are stamped with the criteria.
    let read = engine.resolve_and_read_bulk(&form).unwrap();
    let items = read.data.as_array().unwrap();
    assert_eq!(items.len(), 1);
    let flags = provider
        .get("collection", items[0]["id"].as_i64().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(flags.get("kind"), Some(&json!("quiz")));
}

#[test]
fn item_outside_the_criteria_fails_the_write() {
    let provider = quiz_provider();
    let survey = provider
        .seed("collection", json!({ "name": "Feedback", "kind": "survey" }))
        .unwrap();
    let engine = Engine::new(&provider);
    let form = spec(json!({
        "type": "ListField",
        "entity": "collection",
        "criteria": { "kind": "quiz" },
        "fields": [{ "from_field": "id" }, { "from_field": "name" }]
    }));
    let err = engine
        .write(
            &form,
            WriteTarget::Bulk,
            &json!([{ "id": survey, "name": "Hijacked" }]),
            &no_blobs(),
        )
        .unwrap_err();
    assert!(matches!(err, fieldbind::BindError::Consistency(_)));
    // Nothing changed.
    let row = provider.get("collection", survey).unwrap().unwrap();
    assert_eq!(row.get("name"), Some(&json!("Feedback")));
}

#[test]
fn unique_item_is_created_once_and_reused() {
    let provider = quiz_provider();
    let engine = Engine::new(&provider);
    let form = spec(json!({
        "type": "Fields",
        "fields": [
            { "from_field": "name" },
            {
                "type": "ForeignKeyUniqueItem",
                "key": "settings",
                "fields": [{ "from_field": "notify" }]
            }
        ]
    }));
    let written = engine
        .write(
            &form,
            WriteTarget::Instance(Instance::new("player")),
            &json!({ "name": "Ada", "settings": { "notify": true } }),
            &no_blobs(),
        )
        .unwrap();
    let Written::One(player) = written else { panic!() };

    engine
        .write(
            &form,
            WriteTarget::Instance(provider.get("player", player.id.unwrap()).unwrap().unwrap()),
            &json!({ "name": "Ada", "settings": { "notify": false } }),
            &no_blobs(),
        )
        .unwrap();

    let rows = provider
        .query("player_settings", &FilterExpression::new())
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("notify"), Some(&json!(false)));

    let read = engine
        .resolve_and_read(&form, &provider.get("player", player.id.unwrap()).unwrap().unwrap())
        .unwrap();
    assert_eq!(read.data["settings"], json!({ "notify": false }));
}

#[test]
fn flattened_relation_reconciles_link_rows() {
    let provider = quiz_provider();
    let t1 = provider.seed("tag", json!({ "name": "easy" })).unwrap();
    let t2 = provider.seed("tag", json!({ "name": "fun" })).unwrap();
    let t3 = provider.seed("tag", json!({ "name": "hard" })).unwrap();
    let collection = provider
        .seed("collection", json!({ "name": "Capitals" }))
        .unwrap();
    let engine = Engine::new(&provider);
    let form = spec(json!({
        "type": "Fields",
        "fields": [{ "via": "flat_many", "from_field": "labels" }]
    }));
    let target = || {
        WriteTarget::Instance(provider.get("collection", collection).unwrap().unwrap())
    };
    engine
        .write(
            &form,
            target(),
            &json!({ "labels": [{ "value": t1 }, { "value": t2 }] }),
            &no_blobs(),
        )
        .unwrap();
    engine
        .write(
            &form,
            target(),
            &json!({ "labels": [{ "value": t2 }, { "value": t3 }] }),
            &no_blobs(),
        )
        .unwrap();

    let rows = provider
        .query("collection_label", &FilterExpression::new())
        .unwrap();
    let mut values: Vec<i64> = rows.iter().filter_map(|r| r.get_id("label")).collect();
    values.sort_unstable();
    assert_eq!(values, vec![t2, t3]);

    let read = engine
        .resolve_and_read(&form, &provider.get("collection", collection).unwrap().unwrap())
        .unwrap();
    let labels = read.data["labels"].as_array().unwrap();
    let mut names: Vec<&str> = labels.iter().filter_map(|l| l["label"].as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["fun", "hard"]);
}

#[test]
fn attachments_detach_and_upload() {
    let provider = quiz_provider();
    let collection = provider
        .seed("collection", json!({ "name": "Capitals" }))
        .unwrap();
    let engine = Engine::new(&provider);
    let form = spec(json!({
        "type": "Fields",
        "fields": [{ "type": "AttachmentsField", "from_field": "attachments" }]
    }));
    let mut blobs: BlobMap = HashMap::new();
    blobs.insert(
        "tok-1".into(),
        Blob {
            name: "rules.pdf".into(),
            bytes: b"%PDF".to_vec(),
        },
    );
    let target = || {
        WriteTarget::Instance(provider.get("collection", collection).unwrap().unwrap())
    };
    engine
        .write(
            &form,
            target(),
            &json!({ "attachments": { "existing": [], "added": [{ "upload": "tok-1" }] } }),
            &blobs,
        )
        .unwrap();

    let read = engine
        .resolve_and_read(&form, &provider.get("collection", collection).unwrap().unwrap())
        .unwrap();
    let existing = read.data["attachments"]["existing"].as_array().unwrap();
    assert_eq!(existing.len(), 1);
    assert_eq!(existing[0]["name"], json!("rules.pdf"));
    let attachment_id = existing[0]["id"].as_i64().unwrap();

    // Resubmitting without it detaches.
    engine
        .write(
            &form,
            target(),
            &json!({ "attachments": { "existing": [], "added": [] } }),
            &no_blobs(),
        )
        .unwrap();
    let ids = provider
        .relation_ids("collection", collection, "attachments")
        .unwrap();
    assert!(ids.is_empty());
    // The row itself survives detachment.
    assert!(provider.get("attachment", attachment_id).unwrap().is_some());
}

#[test]
fn unknown_upload_token_is_a_validation_error() {
    let provider = quiz_provider();
    let engine = Engine::new(&provider);
    let form = spec(json!({
        "type": "Fields",
        "fields": [{ "from_field": "text" }, { "from_field": "photo_file" }]
    }));
    let err = engine
        .write(
            &form,
            WriteTarget::Instance(Instance::new("question")),
            &json!({ "text": "Q?", "photo_file": { "upload": "nope" } }),
            &no_blobs(),
        )
        .unwrap_err();
    assert!(matches!(err, fieldbind::BindError::Validation(_)));
}

fn defined_question_form() -> FieldSpec {
    spec(json!({
        "type": "Fields",
        "fields": [
            { "from_field": "text" },
            { "from_field": "question_type" },
            {
                "via": "defined_field",
                "key": "extra",
                "discriminator": "question_type",
                "branches": {
                    "text": { "type": "Fields", "fields": [{ "from_field": "hint_text" }] },
                    "numeric": { "type": "Fields", "fields": [{ "from_field": "precision" }] }
                }
            }
        ]
    }))
}

#[test]
fn defined_field_follows_the_discriminator() {
    let provider = quiz_provider();
    let engine = Engine::new(&provider);
    let form = defined_question_form();
    let written = engine
        .write(
            &form,
            WriteTarget::Instance(Instance::new("question")),
            &json!({
                "text": "Q?",
                "question_type": "text",
                "extra": { "hint_text": "starts with P" }
            }),
            &no_blobs(),
        )
        .unwrap();
    let Written::One(question) = written else { panic!() };
    let read = engine.resolve_and_read(&form, &question).unwrap();
    assert_eq!(read.data["extra"], json!({ "hint_text": "starts with P" }));
}

#[test]
fn unmapped_discriminant_omits_the_branch_key() {
    let provider = quiz_provider();
    let id = provider
        .seed("question", json!({ "text": "Q?", "question_type": "boolean" }))
        .unwrap();
    let engine = Engine::new(&provider);
    let read = engine
        .resolve_and_read(
            &defined_question_form(),
            &provider.get("question", id).unwrap().unwrap(),
        )
        .unwrap();
    assert!(read.data.get("extra").is_none());
}

#[test]
fn unsaved_instances_read_empty_shapes() {
    let provider = quiz_provider();
    let engine = Engine::new(&provider);
    let form = spec(json!({
        "type": "Fields",
        "fields": [
            { "from_field": "name" },
            { "from_field": "tags" },
            { "type": "AttachmentsField", "from_field": "attachments" },
            {
                "type": "ForeignKeyListField",
                "key": "questions",
                "fields": [{ "from_field": "text" }]
            }
        ]
    }));
    let read = engine
        .resolve_and_read(&form, &Instance::new("collection"))
        .unwrap();
    assert_eq!(read.data["name"], json!(""));
    assert_eq!(read.data["tags"], json!([]));
    assert_eq!(read.data["attachments"], json!({ "existing": [] }));
    assert_eq!(read.data["questions"], json!([]));
}

#[test]
fn failed_writes_roll_back_completely() {
    let provider = quiz_provider();
    let collection = provider
        .seed("collection", json!({ "name": "Capitals" }))
        .unwrap();
    let engine = Engine::new(&provider);
    let form = collection_with_questions();
    let err = engine
        .write(
            &form,
            WriteTarget::Instance(provider.get("collection", collection).unwrap().unwrap()),
            &json!({
                "name": "Renamed",
                "questions": [
                    { "text": "fine?", "points": 1 },
                    { "text": "broken?", "points": "not a number" },
                ]
            }),
            &no_blobs(),
        )
        .unwrap_err();
    assert!(matches!(err, fieldbind::BindError::Validation(_)));
    // Neither the rename nor the first child survived.
    let row = provider.get("collection", collection).unwrap().unwrap();
    assert_eq!(row.get("name"), Some(&json!("Capitals")));
    let questions = provider
        .query("question", &FilterExpression::new())
        .unwrap();
    assert!(questions.is_empty());
}

#[test]
fn text_array_multi_select_stores_chosen_values() {
    let provider = quiz_provider();
    let engine = Engine::new(&provider);
    let form = spec(json!({
        "type": "Fields",
        "fields": [
            { "from_field": "name" },
            { "via": "multiple_choices_select", "from_field": "channels" }
        ]
    }));
    let written = engine
        .write(
            &form,
            WriteTarget::Instance(Instance::new("player")),
            &json!({ "name": "Ada", "channels": [{ "value": "email" }, { "value": "sms" }] }),
            &no_blobs(),
        )
        .unwrap();
    let Written::One(player) = written else { panic!() };
    assert_eq!(player.get("channels"), Some(&json!(["email", "sms"])));
    let read = engine.resolve_and_read(&form, &player).unwrap();
    let chosen = read.data["channels"].as_array().unwrap();
    assert_eq!(chosen.len(), 2);
    assert_eq!(chosen[0]["label"], json!("Email"));
}

fn game_search_form() -> FieldSpec {
    spec(json!({
        "type": "Fields",
        "fields": [
            { "via": "filter_from_to", "from_field": "played", "plus_days": 3 },
            { "via": "filter_from_to_month", "from_field": "played", "key": "month" },
            { "via": "filter_multiple_select", "from_field": "collection" },
            { "from_field": "finished" }
        ]
    }))
}

fn all_optional(d: &fieldbind::FieldDescriptor) -> bool {
    !d.required
        && d.children.iter().all(all_optional)
        && d.branches.iter().all(|(_, b)| all_optional(b))
        && d.create_form.as_deref().map_or(true, all_optional)
}

#[test]
fn search_schema_relaxes_every_required_flag() {
    let provider = quiz_provider();
    let engine = Engine::new(&provider);
    let (form, _) = engine
        .build_search(&game_search_form(), "game", &HashMap::new())
        .unwrap();
    assert!(all_optional(&form.schema));
}

#[test]
fn search_relaxation_reaches_branches_and_create_forms() {
    let provider = quiz_provider();
    let engine = Engine::new(&provider);
    let form = spec(json!({
        "type": "Fields",
        "fields": [
            {
                "from_field": "collection",
                "create_form": {
                    "type": "Fields",
                    "fields": [{ "from_field": "name" }]
                }
            },
            {
                "via": "defined_field",
                "key": "extra",
                "discriminator": "question_type",
                "branches": {
                    "text": {
                        "type": "Fields",
                        "fields": [{ "from_field": "hint_text", "required": true }]
                    }
                }
            }
        ]
    }));
    let schema = engine.resolve(&form, "question").unwrap();
    let extra = schema.children.iter().find(|c| c.key.as_deref() == Some("extra")).unwrap();
    assert!(extra.branch("text").unwrap().children[0].required);

    let (search, _) = engine.build_search(&form, "question", &HashMap::new()).unwrap();
    assert!(all_optional(&search.schema));
}

#[test]
fn plus_days_widens_the_date_range() {
    let provider = quiz_provider();
    let engine = Engine::new(&provider);
    let raw: HashMap<String, String> = [
        ("played_from", "2024-01-01"),
        ("played_to", "2024-01-10"),
        ("played__plus", "yes"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let (_, filters) = engine.build_search(&game_search_form(), "game", &raw).unwrap();
    assert_eq!(filters.get("played__gte").map(|c| &c.value), Some(&json!("2023-12-29")));
    assert_eq!(filters.get("played__lte").map(|c| &c.value), Some(&json!("2024-01-13")));
    // The checkbox itself never reaches the provider.
    assert!(filters.get("played__plus").is_none());
}

#[test]
fn reversed_bounds_are_flipped_before_widening() {
    let provider = quiz_provider();
    let engine = Engine::new(&provider);
    let raw: HashMap<String, String> = [
        ("played_from", "2024-05-01"),
        ("played_to", "2024-01-01"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let (_, filters) = engine.build_search(&game_search_form(), "game", &raw).unwrap();
    assert_eq!(filters.get("played__gte").map(|c| &c.value), Some(&json!("2024-01-01")));
    assert_eq!(filters.get("played__lte").map(|c| &c.value), Some(&json!("2024-05-01")));
}

#[test]
fn search_runs_month_and_membership_constraints() {
    let provider = quiz_provider();
    let capitals = provider
        .seed("collection", json!({ "name": "Capitals" }))
        .unwrap();
    let rivers = provider
        .seed("collection", json!({ "name": "Rivers" }))
        .unwrap();
    provider
        .seed("game", json!({ "collection": capitals, "played": "2024-03-10", "finished": true }))
        .unwrap();
    provider
        .seed("game", json!({ "collection": rivers, "played": "2024-03-22", "finished": true }))
        .unwrap();
    provider
        .seed("game", json!({ "collection": capitals, "played": "2024-04-02", "finished": true }))
        .unwrap();
    let engine = Engine::new(&provider);

    let mut raw = HashMap::new();
    raw.insert("month__month".to_string(), "2024-03".to_string());
    raw.insert("collection".to_string(), capitals.to_string());
    let (form, rows) = engine.search(&game_search_form(), "game", &raw).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("played"), Some(&json!("2024-03-10")));
    // The echoed data names the selected collection.
    assert_eq!(form.data["collection"][0]["label"], json!("Capitals"));
}

#[test]
fn related_subtree_prefixes_constraints_with_the_relation() {
    let provider = quiz_provider();
    let easy = provider.seed("collection", json!({ "name": "Easy" })).unwrap();
    let hard = provider.seed("collection", json!({ "name": "Hard" })).unwrap();
    provider
        .seed("question", json!({ "text": "2+2?", "collection": easy, "points": 5 }))
        .unwrap();
    provider
        .seed("question", json!({ "text": "P=NP?", "collection": hard, "points": 90 }))
        .unwrap();
    let engine = Engine::new(&provider);
    let form = spec(json!({
        "type": "Fields",
        "fields": [
            { "from_field": "name" },
            {
                "type": "FilterOfRelated",
                "from_field": "questions",
                "fields": [{ "from_field": "points" }]
            }
        ]
    }));

    let mut raw = HashMap::new();
    raw.insert("questions__points".to_string(), "90".to_string());
    let (_, filters) = engine.build_search(&form, "collection", &raw).unwrap();
    let points = filters.get("questions__points").unwrap();
    assert_eq!(points.path, vec!["questions".to_string(), "points".to_string()]);

    let (_, rows) = engine.search(&form, "collection", &raw).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name"), Some(&json!("Hard")));
}

#[test]
fn boolean_filters_apply_only_when_checked() {
    let provider = quiz_provider();
    provider
        .seed("game", json!({ "played": "2024-03-10", "finished": true }))
        .unwrap();
    provider
        .seed("game", json!({ "played": "2024-03-11", "finished": false }))
        .unwrap();
    let engine = Engine::new(&provider);

    let raw: HashMap<String, String> =
        [("finished".to_string(), "yes".to_string())].into_iter().collect();
    let (_, rows) = engine.search(&game_search_form(), "game", &raw).unwrap();
    assert_eq!(rows.len(), 1);

    let (_, rows) = engine.search(&game_search_form(), "game", &HashMap::new()).unwrap();
    assert_eq!(rows.len(), 2);
}

#[test]
fn range_pair_writes_both_bounds() {
    let provider = quiz_provider();
    let engine = Engine::new(&provider);
    let form = spec(json!({
        "type": "Fields",
        "fields": [{ "via": "from_to", "from_field": "period" }]
    }));
    let written = engine
        .write(
            &form,
            WriteTarget::Instance(Instance::new("game")),
            &json!({ "period": { "from": "2024-01-01", "to": "2024-02-01" } }),
            &no_blobs(),
        )
        .unwrap();
    let Written::One(game) = written else { panic!() };
    assert_eq!(game.get("period_from"), Some(&json!("2024-01-01")));
    assert_eq!(game.get("period_to"), Some(&json!("2024-02-01")));
    let read = engine.resolve_and_read(&form, &game).unwrap();
    assert_eq!(read.data["period"], json!({ "from": "2024-01-01", "to": "2024-02-01" }));
}

#[test]
fn projection_prunes_by_inclusion_and_keeps_required() {
    let provider = quiz_provider();
    let engine = Engine::new(&provider);
    let form = spec(json!({
        "type": "Fields",
        "fields": [
            { "from_field": "text" },
            { "from_field": "points" },
            { "from_field": "hint_text" }
        ]
    }));
    let schema = engine.resolve(&form, "question").unwrap();

    let (options, forced) = engine.inclusion_options(&schema);
    let values: Vec<&str> = options.iter().map(|o| o.value.as_str()).collect();
    assert_eq!(values, vec!["text", "points", "hint_text"]);
    assert_eq!(forced, vec!["text".to_string()]);

    let mut included = HashMap::new();
    included.insert(
        "points".to_string(),
        InclusionEntry {
            available: true,
            required: true,
        },
    );
    let projected = engine.project(&schema, &included).unwrap();
    let keys: Vec<&str> = projected
        .children
        .iter()
        .filter_map(|c| c.key.as_deref())
        .collect();
    assert_eq!(keys, vec!["text", "points"]);
    assert!(projected.children[1].required);

    // Nothing available and nothing required: the whole tree vanishes.
    let optional_only = spec(json!({
        "type": "Fields",
        "fields": [{ "from_field": "hint_text" }]
    }));
    let schema = engine.resolve(&optional_only, "question").unwrap();
    assert!(engine.project(&schema, &HashMap::new()).is_none());
}

#[test]
fn dotted_leaves_read_through_and_never_write() {
    let provider = quiz_provider();
    let collection = provider
        .seed("collection", json!({ "name": "Capitals" }))
        .unwrap();
    let id = provider
        .seed("question", json!({ "collection": collection, "text": "Q?" }))
        .unwrap();
    let engine = Engine::new(&provider);
    let question = provider.get("question", id).unwrap().unwrap();

    let read = engine.resolve_and_read(&question_form(), &question).unwrap();
    assert_eq!(read.data["collection_name"], json!("Capitals"));

    engine
        .write(
            &question_form(),
            WriteTarget::Instance(question),
            &json!({ "text": "Q?", "collection_name": "Vandalized" }),
            &no_blobs(),
        )
        .unwrap();
    let row = provider.get("collection", collection).unwrap().unwrap();
    assert_eq!(row.get("name"), Some(&json!("Capitals")));
}
