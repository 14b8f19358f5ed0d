//! Postgres + pgvector backed store.
//!
//! Each collection is its own table; manifests live in a shared catalog table.
//! The store owns a small tokio runtime so its blocking API can be called from
//! ingestion jobs and from `spawn_blocking` in the HTTP server alike.

use pgvector::Vector;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Mutex;
use tokio_postgres::types::{Json, ToSql};
use tokio_postgres::{Client, NoTls};
use tracing::{error, info};

use super::{StoreHit, StoredRecord, VectorStore};
use crate::error::StoreError;
use crate::manifest::CollectionManifest;
use crate::metadata::{Metadata, MetadataFilter, LIST_DELIMITER};

const CATALOG_TABLE: &str = "portfolio_collections";
const TABLE_PREFIX: &str = "rag_";

/// Fully-qualified Postgres table name (schema + table).
#[derive(Debug, Clone)]
pub struct TableName {
    schema: String,
    table: String,
}

impl TableName {
    /// Builds a new table identifier.
    pub fn new<S, T>(schema: S, table: T) -> Result<Self, StoreError>
    where
        S: Into<String>,
        T: Into<String>,
    {
        let schema = schema.into();
        let table = table.into();
        if schema.trim().is_empty() {
            return Err(StoreError::Backend("schema name is required".into()));
        }
        if table.trim().is_empty() {
            return Err(StoreError::Backend("table name is required".into()));
        }
        Ok(Self { schema, table })
    }

    /// Table holding the records of `collection`.
    pub fn for_collection(schema: &str, collection: &str) -> Result<Self, StoreError> {
        Self::new(schema, format!("{TABLE_PREFIX}{}", sanitize_ident(collection)))
    }

    /// Fully-qualified table reference with quoted identifiers.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// Returns the raw table string.
    pub fn table(&self) -> &str {
        &self.table
    }
}

/// Quotes Postgres identifiers, escaping embedded quotes.
pub fn quote_ident(input: &str) -> String {
    let escaped = input.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

fn sanitize_ident(input: &str) -> String {
    input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Vector store backed by a pgvector-enabled Postgres database.
pub struct PgVectorStore {
    runtime: Runtime,
    client: Mutex<Client>,
    schema: String,
    max_batch: usize,
}

impl PgVectorStore {
    /// Connects and prepares the extension, schema and catalog table.
    pub fn connect(database_url: &str, schema: &str, max_batch: usize) -> Result<Self, StoreError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .map_err(|err| StoreError::Backend(format!("failed to start postgres runtime: {err}")))?;
        let (client, connection) = runtime.block_on(tokio_postgres::connect(database_url, NoTls))?;
        runtime.spawn(async move {
            if let Err(err) = connection.await {
                error!(error = %err, "postgres connection error");
            }
        });

        let store = Self {
            runtime,
            client: Mutex::new(client),
            schema: schema.to_string(),
            max_batch: max_batch.max(1),
        };
        store.ensure_catalog()?;
        info!(schema = %store.schema, "connected to pgvector store");
        Ok(store)
    }

    fn catalog(&self) -> Result<TableName, StoreError> {
        TableName::new(self.schema.clone(), CATALOG_TABLE)
    }

    fn ensure_catalog(&self) -> Result<(), StoreError> {
        let catalog = self.catalog()?;
        let sql = format!(
            "CREATE EXTENSION IF NOT EXISTS vector;
             CREATE SCHEMA IF NOT EXISTS {schema};
             CREATE TABLE IF NOT EXISTS {catalog} (
                 name TEXT PRIMARY KEY,
                 manifest JSONB NOT NULL
             );",
            schema = quote_ident(&self.schema),
            catalog = catalog.qualified(),
        );
        self.runtime.block_on(async {
            let client = self.client.lock().await;
            client.batch_execute(&sql).await
        })?;
        Ok(())
    }
}

impl VectorStore for PgVectorStore {
    fn reset_collection(
        &self,
        collection: &str,
        manifest: &CollectionManifest,
    ) -> Result<(), StoreError> {
        let table = TableName::for_collection(&self.schema, collection)?;
        let catalog = self.catalog()?;
        let vector_type = match manifest.dimensions {
            Some(dims) if dims > 0 => format!("VECTOR({dims})"),
            _ => "VECTOR".to_string(),
        };
        let ddl = format!(
            "DROP TABLE IF EXISTS {table};
             CREATE TABLE {table} (
                 position BIGSERIAL,
                 id TEXT PRIMARY KEY,
                 document_text TEXT NOT NULL,
                 metadata JSONB NOT NULL,
                 embedding {vector_type} NOT NULL
             );",
            table = table.qualified(),
        );
        let upsert = format!(
            "INSERT INTO {} (name, manifest) VALUES ($1, $2)
             ON CONFLICT (name) DO UPDATE SET manifest = EXCLUDED.manifest",
            catalog.qualified()
        );
        let manifest = CollectionManifest {
            collection: collection.to_string(),
            ..manifest.clone()
        };

        self.runtime.block_on(async {
            let mut client = self.client.lock().await;
            let transaction = client.transaction().await?;
            transaction.batch_execute(&ddl).await?;
            transaction
                .execute(&upsert, &[&collection, &Json(&manifest)])
                .await?;
            transaction.commit().await
        })?;
        info!(collection, table = %table.qualified(), "reset collection");
        Ok(())
    }

    fn add(&self, collection: &str, records: &[StoredRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let Some(mut manifest) = self.manifest(collection)? else {
            return Err(StoreError::MissingCollection(collection.to_string()));
        };
        let expected = manifest.dimensions.unwrap_or(records[0].vector.len());
        if let Some(bad) = records.iter().find(|r| r.vector.len() != expected) {
            return Err(StoreError::Dimension {
                expected,
                actual: bad.vector.len(),
            });
        }
        let learned_dimensions = manifest.dimensions.is_none();
        manifest.dimensions = Some(expected);

        let table = TableName::for_collection(&self.schema, collection)?;
        let insert = format!(
            "INSERT INTO {} (id, document_text, metadata, embedding) VALUES ($1, $2, $3, $4)",
            table.qualified()
        );
        let update_manifest = format!(
            "UPDATE {} SET manifest = $2 WHERE name = $1",
            self.catalog()?.qualified()
        );

        self.runtime.block_on(async {
            let mut client = self.client.lock().await;
            let transaction = client.transaction().await?;
            let statement = transaction.prepare(&insert).await?;
            for record in records {
                let vector = Vector::from(record.vector.clone());
                transaction
                    .execute(
                        &statement,
                        &[
                            &record.id,
                            &record.document_text,
                            &Json(&record.metadata),
                            &vector,
                        ],
                    )
                    .await?;
            }
            if learned_dimensions {
                transaction
                    .execute(&update_manifest, &[&collection, &Json(&manifest)])
                    .await?;
            }
            transaction.commit().await
        })?;
        Ok(())
    }

    fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<StoreHit>, StoreError> {
        if self.manifest(collection)?.is_none() {
            return Err(StoreError::MissingCollection(collection.to_string()));
        }
        let table = TableName::for_collection(&self.schema, collection)?;
        let limit = i64::try_from(k)
            .map_err(|_| StoreError::Backend(format!("result limit {k} exceeds i64 range")))?;

        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = vec![
            Box::new(Vector::from(vector.to_vec())),
            Box::new(limit),
        ];
        let predicate = match filter {
            Some(filter) => filter_sql(filter, &mut params),
            None => "TRUE".to_string(),
        };
        let sql = format!(
            "SELECT id, document_text, metadata, (embedding <=> $1) AS distance
             FROM {}
             WHERE {predicate}
             ORDER BY embedding <=> $1 ASC, position ASC
             LIMIT $2",
            table.qualified()
        );

        let rows = self.runtime.block_on(async {
            let client = self.client.lock().await;
            let refs: Vec<&(dyn ToSql + Sync)> = params
                .iter()
                .map(|param| &**param as &(dyn ToSql + Sync))
                .collect();
            client.query(&sql, &refs).await
        })?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(metadata): Json<Metadata> = row.try_get("metadata")?;
            let distance: f64 = row.try_get("distance")?;
            hits.push(StoreHit {
                id: row.try_get("id")?,
                document_text: row.try_get("document_text")?,
                metadata,
                distance: distance as f32,
            });
        }
        Ok(hits)
    }

    fn manifest(&self, collection: &str) -> Result<Option<CollectionManifest>, StoreError> {
        let sql = format!(
            "SELECT manifest FROM {} WHERE name = $1",
            self.catalog()?.qualified()
        );
        let row = self.runtime.block_on(async {
            let client = self.client.lock().await;
            client.query_opt(&sql, &[&collection]).await
        })?;
        match row {
            Some(row) => {
                let Json(manifest): Json<CollectionManifest> = row.try_get("manifest")?;
                Ok(Some(manifest))
            }
            None => Ok(None),
        }
    }

    fn count(&self, collection: &str) -> Result<usize, StoreError> {
        if self.manifest(collection)?.is_none() {
            return Err(StoreError::MissingCollection(collection.to_string()));
        }
        let table = TableName::for_collection(&self.schema, collection)?;
        let sql = format!("SELECT COUNT(*) FROM {}", table.qualified());
        let row = self.runtime.block_on(async {
            let client = self.client.lock().await;
            client.query_one(&sql, &[]).await
        })?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as usize)
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch
    }
}

/// Renders a filter as a SQL predicate, appending its parameters.
fn filter_sql(filter: &MetadataFilter, params: &mut Vec<Box<dyn ToSql + Sync + Send>>) -> String {
    match filter {
        MetadataFilter::Equals { key, value } => {
            let mut needle = serde_json::Map::new();
            needle.insert(key.clone(), serde_json::json!(value));
            params.push(Box::new(Json(serde_json::Value::Object(needle))));
            format!("metadata @> ${}", params.len())
        }
        MetadataFilter::Contains { key, value } => {
            params.push(Box::new(value.clone()));
            let value_idx = params.len();
            params.push(Box::new(key.clone()));
            let key_idx = params.len();
            format!(
                "${value_idx} = ANY(string_to_array(metadata ->> ${key_idx}, '{LIST_DELIMITER}'))"
            )
        }
        MetadataFilter::All { filters } => {
            if filters.is_empty() {
                return "TRUE".to_string();
            }
            let parts: Vec<String> = filters
                .iter()
                .map(|nested| format!("({})", filter_sql(nested, params)))
                .collect();
            parts.join(" AND ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Primitive;

    #[test]
    fn collection_tables_are_prefixed_and_quoted() {
        let table = TableName::for_collection("public", "Resume Data").unwrap();
        assert_eq!(table.table(), "rag_resume_data");
        assert_eq!(table.qualified(), "\"public\".\"rag_resume_data\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert!(TableName::for_collection("  ", "resume").is_err());
    }

    #[test]
    fn filters_render_numbered_placeholders() {
        let filter = MetadataFilter::All {
            filters: vec![
                MetadataFilter::Equals {
                    key: "source_document".into(),
                    value: Primitive::Text("resume.md".into()),
                },
                MetadataFilter::Contains {
                    key: "skills".into(),
                    value: "Rust".into(),
                },
            ],
        };
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> =
            vec![Box::new(0i64), Box::new(0i64)];
        let sql = filter_sql(&filter, &mut params);
        assert_eq!(
            sql,
            "(metadata @> $3) AND ($4 = ANY(string_to_array(metadata ->> $5, '; ')))"
        );
        assert_eq!(params.len(), 5);
    }
}
