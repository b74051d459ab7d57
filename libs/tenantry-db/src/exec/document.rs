//! Document execution through the `MongoDB` driver.

use futures::TryStreamExt;
use mongodb::Database;
use mongodb::bson::{self, Bson, Document, doc};
use serde_json::Value;

use super::{ExecOutcome, Fields, ScopedOp, SortKey, StructuredOp};
use crate::descriptor::Engine;
use crate::error::DataError;

fn to_document(fields: &Fields) -> crate::Result<Document> {
    bson::to_document(fields).map_err(|e| DataError::InvalidOperation(e.to_string()))
}

fn sort_document(sort: &[SortKey]) -> Document {
    sort.iter()
        .map(|k| (k.field.clone(), Bson::Int32(k.order.direction())))
        .collect()
}

/// Relaxed extended JSON, so `ObjectId` and dates stay readable.
pub(crate) fn to_json(doc: Document) -> Value {
    Bson::Document(doc).into_relaxed_extjson()
}

fn driver_err(err: &mongodb::error::Error) -> DataError {
    DataError::from_mongo(err)
}

pub(crate) async fn run(db: &Database, op: &ScopedOp) -> crate::Result<ExecOutcome> {
    let coll = db.collection::<Document>(op.entity());
    match op.op() {
        StructuredOp::Insert { documents, .. } => {
            let docs = documents
                .iter()
                .map(to_document)
                .collect::<crate::Result<Vec<_>>>()?;
            let res = coll.insert_many(docs).await.map_err(|e| driver_err(&e))?;
            Ok(ExecOutcome::Affected(
                u64::try_from(res.inserted_ids.len()).unwrap_or(u64::MAX),
            ))
        }
        StructuredOp::Find {
            filter,
            sort,
            limit,
            skip,
            ..
        } => {
            let mut find = coll.find(to_document(filter)?);
            if !sort.is_empty() {
                find = find.sort(sort_document(sort));
            }
            if let Some(limit) = limit {
                find = find.limit(i64::try_from(*limit).unwrap_or(i64::MAX));
            }
            if let Some(skip) = skip {
                find = find.skip(*skip);
            }
            let cursor = find.await.map_err(|e| driver_err(&e))?;
            let docs: Vec<Document> = cursor.try_collect().await.map_err(|e| driver_err(&e))?;
            Ok(ExecOutcome::Rows(docs.into_iter().map(to_json).collect()))
        }
        StructuredOp::Count { filter, .. } => {
            let n = coll
                .count_documents(to_document(filter)?)
                .await
                .map_err(|e| driver_err(&e))?;
            Ok(ExecOutcome::Count(n))
        }
        StructuredOp::Update { filter, set, .. } => {
            let res = coll
                .update_many(to_document(filter)?, doc! { "$set": to_document(set)? })
                .await
                .map_err(|e| driver_err(&e))?;
            Ok(ExecOutcome::Affected(res.modified_count))
        }
        StructuredOp::Delete { filter, .. } => {
            let res = coll
                .delete_many(to_document(filter)?)
                .await
                .map_err(|e| driver_err(&e))?;
            Ok(ExecOutcome::Affected(res.deleted_count))
        }
    }
}

/// Runs a command that already passed the raw gate and shapes the reply.
pub(crate) async fn run_command(db: &Database, command: Fields) -> crate::Result<ExecOutcome> {
    let name = command.keys().next().cloned().unwrap_or_default();
    let reply = db
        .run_command(to_document(&command)?)
        .await
        .map_err(|e| driver_err(&e))?;
    shape_reply(&name, reply)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn counter(value: Option<&Bson>) -> u64 {
    match value {
        Some(Bson::Int32(n)) => u64::try_from(*n).unwrap_or_default(),
        Some(Bson::Int64(n)) => u64::try_from(*n).unwrap_or_default(),
        Some(Bson::Double(n)) if *n >= 0.0 => n.round() as u64,
        _ => 0,
    }
}

fn shape_reply(command: &str, reply: Document) -> crate::Result<ExecOutcome> {
    let int = |key: &str| counter(reply.get(key));
    match command {
        "find" | "aggregate" => {
            let batch = reply
                .get_document("cursor")
                .and_then(|c| c.get_array("firstBatch"))
                .map_err(|e| DataError::Backend {
                    engine: Engine::MongoDb,
                    message: format!("unexpected {command} reply: {e}"),
                })?;
            Ok(ExecOutcome::Rows(
                batch.iter().cloned().map(Bson::into_relaxed_extjson).collect(),
            ))
        }
        "count" => Ok(ExecOutcome::Count(int("n"))),
        "distinct" => {
            let values = reply.get_array("values").map_err(|e| DataError::Backend {
                engine: Engine::MongoDb,
                message: format!("unexpected distinct reply: {e}"),
            })?;
            Ok(ExecOutcome::Rows(
                values.iter().cloned().map(Bson::into_relaxed_extjson).collect(),
            ))
        }
        "update" => Ok(ExecOutcome::Affected(int("nModified"))),
        _ => Ok(ExecOutcome::Affected(int("n"))),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::schema::KeyOrder;
    use serde_json::json;

    #[test]
    fn command_key_order_survives_conversion() {
        let fields: Fields = serde_json::from_value(json!({
            "find": "products", "filter": {"userId": "t"}, "limit": 1
        }))
        .unwrap();
        let doc = to_document(&fields).unwrap();
        assert_eq!(doc.keys().next().map(String::as_str), Some("find"));
    }

    #[test]
    fn sort_uses_numeric_directions() {
        let sort = vec![
            SortKey {
                field: "createdAt".to_owned(),
                order: KeyOrder::Desc,
            },
            SortKey {
                field: "name".to_owned(),
                order: KeyOrder::Asc,
            },
        ];
        assert_eq!(sort_document(&sort), doc! { "createdAt": -1, "name": 1 });
    }

    #[test]
    fn shapes_cursor_and_write_replies() {
        let reply = doc! { "cursor": { "firstBatch": [ { "name": "a" } ], "id": 0_i64 }, "ok": 1.0 };
        assert_eq!(
            shape_reply("find", reply).unwrap(),
            ExecOutcome::Rows(vec![json!({"name": "a"})])
        );
        assert_eq!(
            shape_reply("update", doc! { "n": 2, "nModified": 1, "ok": 1.0 }).unwrap(),
            ExecOutcome::Affected(1)
        );
        assert_eq!(
            shape_reply("count", doc! { "n": 7, "ok": 1.0 }).unwrap(),
            ExecOutcome::Count(7)
        );
        assert!(shape_reply("find", doc! { "ok": 1.0 }).is_err());
    }
}
