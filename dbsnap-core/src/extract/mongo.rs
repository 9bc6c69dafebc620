//! MongoDB extractor. Documents are written as relaxed extended JSON so
//! ObjectIds, dates and binary values survive a restore.

use super::{finish, header_record, Extraction, ExtractionMetadata, Extractor};
use crate::engine::{ConnectionOptions, Engine};
use crate::format::{Record, RecordSink, SchemaObject, StructureSchema};
use crate::utils::errors::{Result, SnapError};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::{Client, Database};
use serde_json::{json, Value};

pub struct MongoExtractor;

#[async_trait]
impl Extractor for MongoExtractor {
    fn engine(&self) -> Engine {
        Engine::Mongodb
    }

    async fn extract(&self, options: &ConnectionOptions) -> Result<Extraction> {
        let client = Client::with_uri_str(options.url(Engine::Mongodb))
            .await
            .map_err(|e| SnapError::SourceConnection(e.to_string()))?;
        let db = client.database(&options.database);

        // The driver connects lazily; listing collections is the first round trip.
        let collections: Vec<String> = match db.list_collection_names().await {
            Ok(names) => names.into_iter().filter(|n| !n.starts_with("system.")).collect(),
            Err(e) => {
                client.shutdown().await;
                return Err(SnapError::SourceConnection(e.to_string()));
            }
        };
        tracing::info!(database = %options.database, collections = collections.len(), "Starting MongoDB extraction");

        let (sink, stream) = RecordSink::channel();
        let structures = collections.clone();

        tokio::spawn(async move {
            let mut records = 0u64;
            let result = stream_collections(&db, &collections, &sink, &mut records).await;
            client.shutdown().await;
            finish(Engine::Mongodb, &sink, records, result).await;
        });

        Ok(Extraction {
            stream,
            metadata: ExtractionMetadata {
                engine: Engine::Mongodb,
                structures,
            },
        })
    }
}

async fn stream_collections(
    db: &Database,
    collections: &[String],
    sink: &RecordSink,
    records: &mut u64,
) -> Result<()> {
    sink.emit(&header_record(Engine::Mongodb, collections)).await?;

    for name in collections {
        let collection = db.collection::<Document>(name);

        let mut indexes = Vec::new();
        let mut cursor = collection.list_indexes().await.map_err(source_err)?;
        while let Some(model) = cursor.try_next().await.map_err(source_err)? {
            let index_name = model
                .options
                .as_ref()
                .and_then(|o| o.name.clone())
                .unwrap_or_default();
            let keys = Bson::Document(model.keys).into_relaxed_extjson();
            indexes.push(SchemaObject::new(index_name, json!({ "key": keys })));
        }

        sink.emit(&Record::StructureStart {
            name: name.clone(),
            schema: StructureSchema {
                indexes,
                constraints: Vec::new(),
            },
        })
        .await?;

        let mut cursor = collection.find(doc! {}).await.map_err(source_err)?;
        let mut count = 0u64;
        while let Some(document) = cursor.try_next().await.map_err(source_err)? {
            if let Value::Object(data) = Bson::Document(document).into_relaxed_extjson() {
                sink.emit(&Record::Document {
                    collection: name.clone(),
                    data,
                })
                .await?;
                count += 1;
            }
        }

        sink.emit(&Record::StructureEnd { name: name.clone() }).await?;
        *records += count;
        tracing::debug!(collection = %name, documents = count, "Collection extracted");
    }

    Ok(())
}

fn source_err(e: mongodb::error::Error) -> SnapError {
    SnapError::Source(e.to_string())
}
