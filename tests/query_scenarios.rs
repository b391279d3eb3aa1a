//! End-to-end query scenarios driven through the command layer.

use rookdb::{doc, dispatch, CommandRequest, Database, Document, OperationContext, ServerOptions, Value};
use std::sync::Arc;

fn open() -> Arc<Database> {
    Database::open(ServerOptions::default()).unwrap()
}

fn run(db: &Database, body: Document) -> Document {
    let name = body.keys().next().unwrap().to_string();
    let request = CommandRequest {
        name,
        body,
        sequences: Vec::new(),
    };
    dispatch(db, &request, &OperationContext::new())
}

fn run_ok(db: &Database, body: Document) -> Document {
    let response = run(db, body);
    assert_eq!(
        response.get("ok"),
        Some(&Value::Int32(1)),
        "command failed: {}",
        response
    );
    response
}

fn run_err(db: &Database, body: Document) -> Document {
    let response = run(db, body);
    assert_eq!(
        response.get("ok"),
        Some(&Value::Int32(0)),
        "command unexpectedly succeeded: {}",
        response
    );
    response
}

fn first_batch(response: &Document) -> Vec<Document> {
    let Some(Value::Document(cursor)) = response.get("cursor") else {
        panic!("response has no cursor: {}", response);
    };
    let batch = cursor
        .get("firstBatch")
        .or_else(|| cursor.get("nextBatch"));
    match batch {
        Some(Value::Array(docs)) => docs
            .iter()
            .map(|v| match v {
                Value::Document(d) => d.clone(),
                other => panic!("non-document in batch: {}", other),
            })
            .collect(),
        other => panic!("bad batch: {:?}", other),
    }
}

fn int_field(doc: &Document, name: &str) -> i64 {
    match doc.get(name) {
        Some(Value::Int32(n)) => *n as i64,
        Some(Value::Int64(n)) => *n,
        other => panic!("field {} not an int: {:?}", name, other),
    }
}

#[test]
fn compound_index_equality_plus_range() {
    let db = open();
    run_ok(
        &db,
        doc! {
            "createIndexes": "c", "$db": "t",
            "indexes": [ { "key": { "a": 1, "b": 1 }, "name": "a_1_b_1" } ]
        },
    );
    run_ok(
        &db,
        doc! {
            "insert": "c", "$db": "t",
            "documents": [
                { "a": 1, "b": 1 }, { "a": 1, "b": 5 },
                { "a": 1, "b": 10 }, { "a": 2, "b": 5 }
            ]
        },
    );
    let response = run_ok(
        &db,
        doc! { "find": "c", "$db": "t", "filter": { "a": 1, "b": { "$gte": 5 } } },
    );
    let batch = first_batch(&response);
    assert_eq!(batch.len(), 2);
    assert_eq!(int_field(&batch[0], "b"), 5);
    assert_eq!(int_field(&batch[1], "b"), 10);

    // Collection and index are enumerated in the durable catalog.
    let entries = db.catalog_entries();
    assert!(entries.iter().any(|e| e == "coll/t.c"));
    assert!(entries.iter().any(|e| e == "index/t.c/a_1_b_1"));
}

#[test]
fn parallel_array_insert_is_rejected_and_rolled_back() {
    let db = open();
    run_ok(
        &db,
        doc! {
            "createIndexes": "c", "$db": "t",
            "indexes": [ { "key": { "x": 1, "y": 1 }, "name": "xy" } ]
        },
    );
    let response = run_err(
        &db,
        doc! {
            "insert": "c", "$db": "t",
            "documents": [ { "x": [1, 2], "y": [3, 4] } ]
        },
    );
    assert_eq!(
        response.get("codeName"),
        Some(&Value::String("CannotIndexParallelArrays".into()))
    );
    // The collection must remain empty.
    let find = run_ok(&db, doc! { "find": "c", "$db": "t", "filter": {} });
    assert!(first_batch(&find).is_empty());
}

#[test]
fn cursor_survives_concurrent_delete_across_get_more() {
    let db = open();
    run_ok(
        &db,
        doc! {
            "createIndexes": "c", "$db": "t",
            "indexes": [ { "key": { "a": 1 }, "name": "a_1" } ]
        },
    );
    let docs: Vec<Value> = (1..=1000)
        .map(|i| Value::Document(doc! { "a": i }))
        .collect();
    let mut insert = doc! { "insert": "c", "$db": "t" };
    insert.push("documents", Value::Array(docs));
    run_ok(&db, insert);

    // Read the first 500 through the cursor.
    let response = run_ok(
        &db,
        doc! {
            "find": "c", "$db": "t",
            "filter": { "a": { "$gte": 1 } }, "batchSize": 500
        },
    );
    let batch = first_batch(&response);
    assert_eq!(batch.len(), 500);
    assert_eq!(int_field(batch.last().unwrap(), "a"), 500);
    let Some(Value::Document(cursor)) = response.get("cursor") else {
        panic!("no cursor");
    };
    let cursor_id = match cursor.get("id") {
        Some(Value::Int64(id)) => *id,
        other => panic!("bad cursor id {:?}", other),
    };
    assert!(cursor_id != 0);

    // A concurrent session deletes the next document the cursor would
    // visit.
    run_ok(
        &db,
        doc! {
            "delete": "c", "$db": "t",
            "deletes": [ { "q": { "a": 501 }, "limit": 1 } ]
        },
    );

    // The resumed cursor returns the next surviving key, no duplicates, no
    // skips.
    let more = run_ok(
        &db,
        doc! { "getMore": (cursor_id), "$db": "t", "collection": "c", "batchSize": 1000 },
    );
    let rest = first_batch(&more);
    let values: Vec<i64> = rest.iter().map(|d| int_field(d, "a")).collect();
    let expected: Vec<i64> = (502..=1000).collect();
    assert_eq!(values, expected);
}

#[test]
fn plan_cache_hits_same_shape_and_invalidates_on_drop_index() {
    let db = open();
    for name in ["a_1", "b_1"] {
        let field = &name[..1];
        run_ok(
            &db,
            doc! {
                "createIndexes": "c", "$db": "t",
                "indexes": [ { "key": { field: 1 }, "name": name } ]
            },
        );
    }
    let docs: Vec<Value> = (0..50)
        .map(|i| Value::Document(doc! { "a": i, "b": (i % 3), "s": (i % 7) }))
        .collect();
    let mut insert = doc! { "insert": "c", "$db": "t" };
    insert.push("documents", Value::Array(docs));
    run_ok(&db, insert);

    let query = |gt: i32, b: i32| {
        doc! {
            "find": "c", "$db": "t",
            "filter": { "a": { "$gt": gt }, "b": b },
            "sort": { "s": 1 }
        }
    };
    run_ok(&db, query(5, 0));
    let coll = db
        .catalog()
        .get(&rookdb::NamespaceString::parse("t.c").unwrap())
        .unwrap();
    assert_eq!(coll.plan_cache().len(), 1);

    // Identical shape, different values: still one cached shape.
    run_ok(&db, query(20, 1));
    assert_eq!(coll.plan_cache().len(), 1);

    // Dropping the chosen index invalidates the cache.
    run_ok(&db, doc! { "dropIndexes": "c", "$db": "t", "index": "a_1" });
    assert!(coll.plan_cache().is_empty());
}

#[test]
fn aggregate_group_and_out() {
    let db = open();
    run_ok(
        &db,
        doc! {
            "insert": "orders", "$db": "t",
            "documents": [
                { "item": "a", "qty": 5 },
                { "item": "b", "qty": 10 },
                { "item": "a", "qty": 7 }
            ]
        },
    );
    let response = run_ok(
        &db,
        doc! {
            "aggregate": "orders", "$db": "t",
            "pipeline": [
                { "$match": { "qty": { "$gt": 0 } } },
                { "$group": { "_id": "$item", "total": { "$sum": "$qty" } } },
                { "$sort": { "_id": 1 } }
            ]
        },
    );
    let batch = first_batch(&response);
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].get("_id"), Some(&Value::String("a".into())));
    assert_eq!(int_field(&batch[0], "total"), 12);
    assert_eq!(int_field(&batch[1], "total"), 10);

    // $out materializes into another collection.
    run_ok(
        &db,
        doc! {
            "aggregate": "orders", "$db": "t",
            "pipeline": [
                { "$match": { "item": "a" } },
                { "$out": "only_a" }
            ]
        },
    );
    let out = run_ok(&db, doc! { "find": "only_a", "$db": "t", "filter": {} });
    assert_eq!(first_batch(&out).len(), 2);
}

#[test]
fn find_and_modify_round_trip() {
    let db = open();
    run_ok(
        &db,
        doc! {
            "insert": "c", "$db": "t",
            "documents": [ { "k": 1, "v": 10 } ]
        },
    );
    // Old image by default.
    let response = run_ok(
        &db,
        doc! {
            "findAndModify": "c", "$db": "t",
            "query": { "k": 1 },
            "update": { "$set": { "v": 11 } }
        },
    );
    let Some(Value::Document(value)) = response.get("value") else {
        panic!("no value: {}", response);
    };
    assert_eq!(int_field(value, "v"), 10);

    // New image on request.
    let response = run_ok(
        &db,
        doc! {
            "findAndModify": "c", "$db": "t",
            "query": { "k": 1 },
            "update": { "$set": { "v": 12 } },
            "new": true
        },
    );
    let Some(Value::Document(value)) = response.get("value") else {
        panic!("no value: {}", response);
    };
    assert_eq!(int_field(value, "v"), 12);

    // Remove returns the removed document.
    let response = run_ok(
        &db,
        doc! {
            "findAndModify": "c", "$db": "t",
            "query": { "k": 1 },
            "remove": true
        },
    );
    assert!(matches!(response.get("value"), Some(Value::Document(_))));
    let find = run_ok(&db, doc! { "find": "c", "$db": "t", "filter": {} });
    assert!(first_batch(&find).is_empty());
}

#[test]
fn unknown_command_and_duplicate_key_errors() {
    let db = open();
    let response = run_err(&db, doc! { "frobnicate": 1, "$db": "t" });
    assert_eq!(
        response.get("codeName"),
        Some(&Value::String("CommandNotFound".into()))
    );

    run_ok(
        &db,
        doc! {
            "createIndexes": "c", "$db": "t",
            "indexes": [ { "key": { "u": 1 }, "name": "u_1", "unique": true } ]
        },
    );
    run_ok(
        &db,
        doc! { "insert": "c", "$db": "t", "documents": [ { "u": 7 } ] },
    );
    let response = run_err(
        &db,
        doc! { "insert": "c", "$db": "t", "documents": [ { "u": 7 } ] },
    );
    assert_eq!(
        response.get("codeName"),
        Some(&Value::String("DuplicateKey".into()))
    );
    // The failed write performed nothing, and the label says so.
    match response.get("errorLabels") {
        Some(Value::Array(labels)) => {
            assert!(labels.contains(&Value::String("NoWritesPerformed".into())));
        }
        other => panic!("expected error labels, got {:?}", other),
    }
}

#[test]
fn wire_round_trip_through_handle_message() {
    let db = open();
    let insert = rookdb::OpMsg::with_body(doc! {
        "insert": "c", "$db": "t",
        "documents": [ { "n": 1 } ]
    });
    let reply = rookdb::handle_message(&db, &insert.encode(7, 0).unwrap()).unwrap();
    let (header, msg) = rookdb::OpMsg::decode(&reply).unwrap();
    assert_eq!(header.response_to, 7);
    assert_eq!(msg.body.get("ok"), Some(&Value::Int32(1)));
    assert!(msg.body.get("$clusterTime").is_some());
    assert!(msg.body.get("operationTime").is_some());
}
