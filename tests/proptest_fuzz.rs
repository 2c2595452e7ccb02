//! Property-based tests (fuzzing) for parser and coercion resilience.
//!
//! Uses proptest to generate random/malformed inputs and verify the crate
//! never panics, only returns clean errors.
//!
//! Run with: `cargo test --test proptest_fuzz`

use proptest::prelude::*;
use serde_json::{json, Value};

use index_sync::batching::{Batch, BatchConfig, SizedItem};
use index_sync::coerce::{coerce, FieldType};
use index_sync::event::ChangeSet;
use index_sync::mapping::MappingFile;
use index_sync::schema::parse;
use index_sync::{DocumentOp, IndexIdentity, Row};

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Generate arbitrary JSON values (including invalid structures)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(
        4,   // depth
        64,  // max nodes
        10,  // items per collection
        |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..10)
                    .prop_map(Value::Array),
                prop::collection::hash_map(".*", inner, 0..10)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        },
    )
}

/// Flat rows with a handful of well-known column names.
fn row_strategy() -> impl Strategy<Value = Row> {
    prop::collection::hash_map(
        prop_oneof![Just("id"), Just("name"), Just("tag_id"), Just("age")].prop_map(str::to_string),
        prop_oneof![
            Just(Value::Null),
            any::<i32>().prop_map(|n| json!(n)),
            "[a-z]{0,6}".prop_map(Value::String),
        ],
        0..4,
    )
    .prop_map(|m| m.into_iter().collect())
}

/// Views assembled from valid pieces: aliases, columns, joins.
fn view_sql_strategy() -> impl Strategy<Value = String> {
    (
        prop::collection::btree_set("[a-z]{1,6}", 1..5),
        any::<bool>(),
        prop_oneof![Just(""), Just("LEFT "), Just("INNER ")],
    )
        .prop_map(|(columns, join, kind)| {
            let mut fields: Vec<String> = vec!["a.id".into()];
            fields.extend(columns.iter().map(|c| format!("a.{c}_col")));
            let mut sql = String::from("SELECT ");
            if join {
                fields.push("b.name AS joined_name".into());
            }
            sql.push_str(&fields.join(", "));
            sql.push_str(" FROM main_table a");
            if join {
                sql.push_str(&format!(" {kind}JOIN other_table b ON a.other_id = b.id"));
            }
            sql
        })
}

fn op_strategy() -> impl Strategy<Value = DocumentOp> {
    ("[a-z0-9]{1,12}", prop::collection::vec(".{0,40}", 0..8)).prop_map(|(id, values)| {
        let doc: Row = values
            .into_iter()
            .enumerate()
            .map(|(i, v)| (format!("f{i}"), Value::String(v)))
            .collect();
        DocumentOp::Index {
            index: IndexIdentity::new("fuzz", None),
            id,
            doc,
            routing: None,
        }
    })
}

// =============================================================================
// Parser Fuzz Tests
// =============================================================================

proptest! {
    /// The view parser should never panic on arbitrary text
    #[test]
    fn fuzz_parse_random_text(sql in ".{0,200}") {
        let _ = parse(&sql);
    }

    /// Arbitrary text after SELECT should fail cleanly or parse
    #[test]
    fn fuzz_parse_select_prefix(rest in "[a-zA-Z0-9_ ,.()=*'`]{0,120}") {
        let _ = parse(&format!("SELECT {rest}"));
    }

    /// Well-formed views always parse, with one field per select item
    #[test]
    fn prop_generated_views_parse(sql in view_sql_strategy()) {
        let graph = parse(&sql).expect("generated view should parse");
        prop_assert_eq!(graph.main_table().table.as_str(), "main_table");
        prop_assert!(graph.field("id").is_some());
        prop_assert_eq!(graph.is_single_table(), !sql.contains("JOIN"));
    }

    /// Mapping files should never panic on arbitrary YAML-ish input
    #[test]
    fn fuzz_mapping_file_from_random_text(text in ".{0,300}") {
        let _ = MappingFile::from_yaml(&text);
    }
}

// =============================================================================
// Coercion Invariant Tests
// =============================================================================

proptest! {
    /// Coercion never panics, whatever the value and target
    #[test]
    fn fuzz_coerce_arbitrary_json(value in arbitrary_json_strategy()) {
        for ty in [
            FieldType::Text,
            FieldType::Keyword,
            FieldType::Long,
            FieldType::Double,
            FieldType::Boolean,
            FieldType::Date,
            FieldType::Binary,
        ] {
            let _ = coerce(value.clone(), Some(&ty));
        }
    }

    /// Null stays null for every declared type
    #[test]
    fn prop_null_is_preserved(name in "[a-z]{1,10}") {
        let ty = FieldType::from_name(&name);
        prop_assert_eq!(coerce(Value::Null, Some(&ty)), Value::Null);
    }

    /// No declared type means no change
    #[test]
    fn prop_untyped_passes_through(value in arbitrary_json_strategy()) {
        prop_assert_eq!(coerce(value.clone(), None), value);
    }

    /// Integers coerce to keyword text and back to the same long
    #[test]
    fn prop_integer_keyword_long(n in any::<i64>()) {
        let text = coerce(json!(n), Some(&FieldType::Keyword));
        prop_assert_eq!(&text, &Value::String(n.to_string()));
        prop_assert_eq!(coerce(text, Some(&FieldType::Long)), json!(n));
    }

    /// Single-byte flags become booleans
    #[test]
    fn prop_byte_flags_are_booleans(b in 0u8..=1) {
        prop_assert_eq!(coerce(json!(b), Some(&FieldType::Boolean)), json!(b == 1));
        prop_assert_eq!(coerce(json!([b]), Some(&FieldType::Boolean)), json!(b == 1));
    }
}

// =============================================================================
// Change Set and Batch Invariant Tests
// =============================================================================

proptest! {
    /// A column is changed exactly when its old value differs from the new one
    #[test]
    fn prop_change_set_matches_old_image(new in row_strategy(), old in row_strategy()) {
        let changes = ChangeSet::between(&new, &old);
        for (column, previous) in &old {
            let differs = new.get(column) != Some(previous);
            prop_assert_eq!(changes.contains(column), differs);
            prop_assert_eq!(changes.contains(&column.to_ascii_uppercase()), differs);
        }
        prop_assert!(changes.len() <= old.len());
    }

    /// A batch never holds more than the count threshold once flushed on readiness
    #[test]
    fn prop_batch_respects_count(
        ops in prop::collection::vec(op_strategy(), 0..60),
        flush_count in 1usize..10,
    ) {
        let config = BatchConfig { flush_count, flush_bytes: usize::MAX };
        let mut batch = Batch::new();
        let mut committed = 0;
        for op in ops.iter().cloned() {
            batch.push(op);
            if batch.ready(&config).is_some() {
                let taken = batch.take();
                prop_assert!(taken.len() <= flush_count);
                committed += taken.len();
            }
        }
        committed += batch.take().len();
        prop_assert_eq!(committed, ops.len());
    }

    /// Estimated size grows with content
    #[test]
    fn prop_op_size_includes_content(size in 0usize..50_000) {
        let mut doc = Row::new();
        doc.insert("data".into(), Value::String("x".repeat(size)));
        let op = DocumentOp::Index {
            index: IndexIdentity::new("fuzz", None),
            id: "1".into(),
            doc,
            routing: None,
        };
        prop_assert!(op.estimated_bytes() >= size);
        prop_assert!(op.size_bytes() >= size);
    }
}
