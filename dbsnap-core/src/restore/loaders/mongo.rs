//! MongoDB loader. Documents arrive as extended JSON and are converted back
//! to BSON, so ObjectIds and dates keep their types.

use super::{destination_err, not_connected};
use crate::engine::{ConnectionOptions, Engine};
use crate::format::RecordData;
use crate::restore::{Loader, RestoreMode};
use crate::utils::errors::{Result, SnapError};
use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document};
use mongodb::{Client, Database};
use serde_json::Value;

#[derive(Default)]
pub struct MongoLoader {
    client: Option<Client>,
    db: Option<Database>,
}

impl MongoLoader {
    fn database(&self) -> Result<&Database> {
        self.db.as_ref().ok_or_else(not_connected)
    }
}

#[async_trait]
impl Loader for MongoLoader {
    async fn connect(&mut self, options: &ConnectionOptions) -> Result<()> {
        let client = Client::with_uri_str(options.url(Engine::Mongodb))
            .await
            .map_err(destination_err)?;
        let db = client.database(&options.database);
        // The driver connects lazily; ping so a bad target fails here.
        if let Err(e) = db.run_command(doc! { "ping": 1 }).await {
            client.shutdown().await;
            return Err(destination_err(e));
        }
        self.client = Some(client);
        self.db = Some(db);
        Ok(())
    }

    async fn prepare_structure(&mut self, name: &str, mode: RestoreMode) -> Result<()> {
        if mode != RestoreMode::Overwrite {
            return Ok(());
        }
        let deleted = self
            .database()?
            .collection::<Document>(name)
            .delete_many(doc! {})
            .await
            .map_err(destination_err)?;
        tracing::debug!(collection = %name, deleted = deleted.deleted_count, "Cleared destination collection");
        Ok(())
    }

    async fn load_record(&mut self, name: &str, data: RecordData) -> Result<()> {
        let document = to_document(data)?;
        self.database()?
            .collection::<Document>(name)
            .insert_one(document)
            .await
            .map_err(destination_err)?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.db = None;
        if let Some(client) = self.client.take() {
            client.shutdown().await;
        }
        Ok(())
    }
}

/// Parses extended JSON (relaxed or canonical) into a BSON document.
fn to_document(data: RecordData) -> Result<Document> {
    match Bson::try_from(Value::Object(data)) {
        Ok(Bson::Document(document)) => Ok(document),
        Ok(other) => Err(SnapError::Destination(format!(
            "record is not a document: {:?}",
            other.element_type()
        ))),
        Err(e) => Err(destination_err(e)),
    }
}
