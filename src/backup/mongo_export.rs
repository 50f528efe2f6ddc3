// backuptool/src/backup/mongo_export.rs
use std::io::{BufWriter, Write};
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::Client;
use mongodb::bson::{Bson, Document};
use tempfile::NamedTempFile;
use tracing::info;

use crate::config::MongoConfig;
use crate::errors::{BackupError, Result};

const COLLECTION: &str = "images";

/// Exports the document store to a JSON file.
///
/// Every document in the `images` collection is read through a cursor and
/// streamed to the destination one document at a time, so blob payloads are
/// never all held in memory at once. Binary fields are base64-encoded; all
/// other fields pass through. The export is an object with `collection`,
/// `exportDate`, a `data` array in cursor order, and a `count` tallied from
/// the documents actually written.
pub struct MongoExporter {
    config: MongoConfig,
}

impl MongoExporter {
    pub fn new(config: MongoConfig) -> Self {
        Self { config }
    }

    pub async fn export(&self, dest_path: &Path) -> Result<()> {
        let client = Client::with_uri_str(&self.config.uri).await.map_err(|e| {
            BackupError::Connection(format!(
                "Failed to connect to MongoDB at {}: {}",
                self.config.uri, e
            ))
        })?;
        let collection = client
            .database(&self.config.database)
            .collection::<Document>(COLLECTION);

        let mut cursor = collection.find(None, None).await?;

        let parent = dest_path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = NamedTempFile::new_in(parent)?;
        let count;
        {
            let writer = BufWriter::new(tmp.as_file());
            let mut export = JsonArrayExport::begin(writer, COLLECTION, Utc::now())?;
            while let Some(document) = cursor.try_next().await? {
                export.push(&document_to_json(document))?;
            }
            count = export.finish()?;
        }

        tmp.persist(dest_path).map_err(|e| {
            BackupError::Export(format!(
                "Failed to finalize JSON export at {}: {}",
                dest_path.display(),
                e
            ))
        })?;

        info!(
            dest = %dest_path.display(),
            documents = count,
            "MongoDB export completed"
        );
        Ok(())
    }
}

/// Incremental writer for the export envelope.
///
/// `count` is tallied from the documents pushed and written in the closing
/// brace, so it always matches the length of the `data` array even when the
/// collection changes under the scan.
struct JsonArrayExport<W: Write> {
    writer: W,
    count: u64,
}

impl<W: Write> JsonArrayExport<W> {
    fn begin(mut writer: W, collection: &str, export_date: DateTime<Utc>) -> Result<Self> {
        write!(
            writer,
            "{{\"collection\":{},\"exportDate\":{},\"data\":[",
            serde_json::Value::String(collection.to_string()),
            serde_json::Value::String(export_date.to_rfc3339()),
        )?;
        Ok(Self { writer, count: 0 })
    }

    fn push(&mut self, value: &serde_json::Value) -> Result<()> {
        if self.count > 0 {
            self.writer.write_all(b",")?;
        }
        self.writer.write_all(b"\n")?;
        serde_json::to_writer(&mut self.writer, value)?;
        self.count += 1;
        Ok(())
    }

    fn finish(mut self) -> Result<u64> {
        write!(self.writer, "\n],\"count\":{}}}\n", self.count)?;
        self.writer.flush()?;
        Ok(self.count)
    }
}

fn document_to_json(document: Document) -> serde_json::Value {
    serde_json::Value::Object(
        document
            .into_iter()
            .map(|(key, value)| (key, bson_to_json(value)))
            .collect(),
    )
}

/// Converts a BSON value to export JSON: binary payloads become base64
/// strings, dates become RFC 3339 strings, object ids become hex strings,
/// everything else maps through the relaxed extended-JSON conversion.
fn bson_to_json(value: Bson) -> serde_json::Value {
    match value {
        Bson::Binary(binary) => serde_json::Value::String(BASE64.encode(&binary.bytes)),
        Bson::Document(document) => document_to_json(document),
        Bson::Array(values) => {
            serde_json::Value::Array(values.into_iter().map(bson_to_json).collect())
        }
        Bson::DateTime(dt) => serde_json::Value::String(
            dt.try_to_rfc3339_string().unwrap_or_else(|_| dt.to_string()),
        ),
        Bson::ObjectId(oid) => serde_json::Value::String(oid.to_hex()),
        other => other.into_relaxed_extjson(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::spec::BinarySubtype;
    use mongodb::bson::{Binary, doc, oid::ObjectId};

    fn write_envelope(documents: &[serde_json::Value]) -> serde_json::Value {
        let mut buf = Vec::new();
        let mut export =
            JsonArrayExport::begin(&mut buf, COLLECTION, Utc::now()).expect("begin envelope");
        for document in documents {
            export.push(document).expect("push document");
        }
        export.finish().expect("finish envelope");
        serde_json::from_slice(&buf).expect("envelope is valid JSON")
    }

    #[test]
    fn test_envelope_count_matches_emitted_documents() {
        let docs = vec![
            serde_json::json!({"imageId": "img-1"}),
            serde_json::json!({"imageId": "img-2"}),
            serde_json::json!({"imageId": "img-3"}),
        ];
        let envelope = write_envelope(&docs);

        assert_eq!(envelope["collection"], COLLECTION);
        assert_eq!(envelope["data"].as_array().map(Vec::len), Some(3));
        assert_eq!(envelope["count"], 3);
        assert_eq!(envelope["data"][1]["imageId"], "img-2");
    }

    #[test]
    fn test_empty_envelope_counts_zero() {
        let envelope = write_envelope(&[]);
        assert_eq!(envelope["data"].as_array().map(Vec::len), Some(0));
        assert_eq!(envelope["count"], 0);
    }

    #[test]
    fn test_binary_fields_are_base64_encoded() {
        let document = doc! {
            "imageId": "img-1",
            "imageData": Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: vec![0xde, 0xad, 0xbe, 0xef],
            }),
            "size": 4i64,
        };

        let json = document_to_json(document);
        assert_eq!(json["imageId"], "img-1");
        assert_eq!(json["imageData"], BASE64.encode([0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(json["size"], 4);
    }

    #[test]
    fn test_scalars_pass_through() {
        let document = doc! {
            "name": "cat.png",
            "mimeType": "image/png",
            "width": 640i32,
            "ratio": 1.5f64,
            "flagged": false,
            "note": Bson::Null,
        };

        let json = document_to_json(document);
        assert_eq!(json["name"], "cat.png");
        assert_eq!(json["mimeType"], "image/png");
        assert_eq!(json["width"], 640);
        assert_eq!(json["ratio"], 1.5);
        assert_eq!(json["flagged"], false);
        assert!(json["note"].is_null());
    }

    #[test]
    fn test_nested_documents_and_ids_convert() {
        let oid = ObjectId::new();
        let document = doc! {
            "_id": oid,
            "meta": { "tags": ["a", "b"] },
        };

        let json = document_to_json(document);
        assert_eq!(json["_id"], oid.to_hex());
        assert_eq!(json["meta"]["tags"][0], "a");
    }
}
