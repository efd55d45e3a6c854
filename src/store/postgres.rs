//! Postgres-backed document store.
//!
//! Every document lives in one `documents` table keyed by collection path and
//! id, with its fields in a JSONB column. A trigger publishes the collection
//! path on `documents_changed` after each row change; live queries LISTEN on
//! that channel and re-run their query whenever their collection changes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{log, Level};
use serde_json::{Map, Value};
use sqlx::{
    postgres::{PgListener, PgPoolOptions, PgQueryResult},
    query, query_as,
    types::Json,
    Pool, Postgres, QueryBuilder, Transaction,
};

use super::{
    new_document_id, ChangeFeed, Document, DocumentStore, StoreError, StoreResult,
};
use crate::schema::query::{
    CollectionPath, Direction, DocumentPath, Query, Target, CREATED_AT,
};

const CHANGE_CHANNEL: &str = "documents_changed";

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: String,
    data: Json<Map<String, Value>>,
    created_at: DateTime<Utc>,
}

impl From<DocumentRow> for Document {
    fn from(row: DocumentRow) -> Self {
        Document {
            id: row.id,
            data: row.data.0,
            created_at: row.created_at,
        }
    }
}

fn classify(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::RowNotFound => StoreError::NotFound(e.to_string()),
        sqlx::Error::Database(db) if db.code().as_deref() == Some("42501") => {
            StoreError::Denied(db.message().to_string())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Malformed(e.to_string())
        }
        _ => StoreError::Unavailable(e.to_string()),
    }
}

fn log_query<T>(result: Result<T, sqlx::Error>) -> StoreResult<T> {
    result.map_err(|e| {
        log!(Level::Warn, "DB Query failed: {}", e);
        classify(e)
    })
}

async fn open_transaction(db: &Pool<Postgres>) -> StoreResult<Transaction<'static, Postgres>> {
    match db.begin().await {
        Ok(t) => Ok(t),
        Err(e) => {
            log!(Level::Error, "Failed to open transaction");
            Err(classify(e))
        }
    }
}

async fn rollback(tx: Transaction<'_, Postgres>) {
    if let Err(e) = tx.rollback().await {
        log!(Level::Error, "Transaction failed to rollback: {}", e);
    }
}

fn require_row(result: PgQueryResult, doc: &DocumentPath) -> StoreResult<()> {
    if result.rows_affected() == 0 {
        Err(StoreError::NotFound(doc.to_string()))
    } else {
        Ok(())
    }
}

async fn run_query(db: &Pool<Postgres>, q: &Query) -> StoreResult<Vec<Document>> {
    let mut builder: QueryBuilder<Postgres> =
        QueryBuilder::new("SELECT id, data, created_at FROM documents WHERE collection = ");
    builder.push_bind(q.target.collection().as_str().to_string());
    if let Target::Document(doc) = &q.target {
        builder.push(" AND id = ").push_bind(doc.id.clone());
    }
    if let Some(filter) = &q.filter {
        builder
            .push(" AND data -> ")
            .push_bind(filter.field.clone())
            .push(" = ")
            .push_bind(Json(filter.value.clone()));
    }
    builder.push(" ORDER BY ");
    if let Some(order) = &q.order {
        if order.field == CREATED_AT {
            builder.push("created_at");
        } else {
            builder.push("data -> ").push_bind(order.field.clone());
        }
        builder.push(match order.direction {
            Direction::Ascending => " ASC, ",
            Direction::Descending => " DESC, ",
        });
    }
    builder.push("created_at ASC, id ASC");

    let rows: Vec<DocumentRow> =
        log_query(builder.build_query_as::<DocumentRow>().fetch_all(db).await)?;
    Ok(rows.into_iter().map(Document::from).collect())
}

pub struct PgStore {
    db: Pool<Postgres>,
}

impl PgStore {
    /// Connects and brings the schema up to date.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let db = PgPoolOptions::new().connect(database_url).await?;
        sqlx::migrate!("./migrations").run(&db).await?;
        log!(Level::Info, "Successfully connected to database");
        Ok(Self { db })
    }

    pub fn from_pool(db: Pool<Postgres>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn listen(&self, q: &Query) -> StoreResult<ChangeFeed> {
        let mut listener = log_query(PgListener::connect_with(&self.db).await)?;
        log_query(listener.listen(CHANGE_CHANNEL).await)?;

        let (tx, feed) = ChangeFeed::channel();
        let _ = tx.send(Ok(run_query(&self.db, q).await?));

        let db = self.db.clone();
        let q = q.clone();
        tokio::spawn(async move {
            let collection = q.target.collection().as_str().to_string();
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    received = listener.try_recv() => match received {
                        Ok(Some(notification)) => {
                            if notification.payload() != collection {
                                continue;
                            }
                            let snapshot = run_query(&db, &q).await;
                            let failed = snapshot.is_err();
                            if tx.send(snapshot).is_err() || failed {
                                break;
                            }
                        }
                        Ok(None) => {
                            log!(Level::Error, "Live query on {collection} lost its connection");
                            let _ = tx.send(Err(StoreError::Unavailable(
                                "listener connection lost".to_string(),
                            )));
                            break;
                        }
                        Err(e) => {
                            log!(Level::Error, "Live query on {collection} failed: {e}");
                            let _ = tx.send(Err(classify(e)));
                            break;
                        }
                    }
                }
            }
            log!(Level::Debug, "Live query on {collection} closed");
        });

        Ok(feed)
    }

    async fn get(&self, doc: &DocumentPath) -> StoreResult<Option<Document>> {
        let row = log_query(
            query_as::<_, DocumentRow>(
                "SELECT id, data, created_at FROM documents WHERE collection = $1 AND id = $2",
            )
            .bind(doc.collection.as_str())
            .bind(&doc.id)
            .fetch_optional(&self.db)
            .await,
        )?;
        Ok(row.map(Document::from))
    }

    async fn create(
        &self,
        collection: &CollectionPath,
        data: Map<String, Value>,
    ) -> StoreResult<String> {
        let mut transaction = open_transaction(&self.db).await?;

        if let Some(parent) = collection.parent() {
            let found = query(
                "SELECT 1 FROM documents WHERE collection = $1 AND id = $2 FOR SHARE",
            )
            .bind(parent.collection.as_str())
            .bind(&parent.id)
            .fetch_optional(&mut *transaction)
            .await;
            match log_query(found) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    rollback(transaction).await;
                    return Err(StoreError::MissingParent(parent.to_string()));
                }
                Err(e) => {
                    rollback(transaction).await;
                    return Err(e);
                }
            }
        }

        let id = new_document_id();
        let inserted = query("INSERT INTO documents (collection, id, data) VALUES ($1, $2, $3)")
            .bind(collection.as_str())
            .bind(&id)
            .bind(Json(data))
            .execute(&mut *transaction)
            .await;
        if let Err(e) = log_query(inserted) {
            rollback(transaction).await;
            return Err(e);
        }
        log!(Level::Trace, "created a new document in {collection}");

        match transaction.commit().await {
            Ok(_) => Ok(id),
            Err(e) => {
                log!(Level::Error, "Transaction failed to commit");
                Err(classify(e))
            }
        }
    }

    async fn set(&self, doc: &DocumentPath, data: Map<String, Value>) -> StoreResult<()> {
        log_query(
            query(
                "INSERT INTO documents (collection, id, data) VALUES ($1, $2, $3)
                ON CONFLICT (collection, id) DO UPDATE SET data = EXCLUDED.data",
            )
            .bind(doc.collection.as_str())
            .bind(&doc.id)
            .bind(Json(data))
            .execute(&self.db)
            .await,
        )?;
        Ok(())
    }

    async fn update(&self, doc: &DocumentPath, fields: Map<String, Value>) -> StoreResult<()> {
        let result = log_query(
            query("UPDATE documents SET data = data || $3 WHERE collection = $1 AND id = $2")
                .bind(doc.collection.as_str())
                .bind(&doc.id)
                .bind(Json(fields))
                .execute(&self.db)
                .await,
        )?;
        require_row(result, doc)
    }

    async fn delete(&self, doc: &DocumentPath) -> StoreResult<()> {
        log_query(
            query("DELETE FROM documents WHERE collection = $1 AND id = $2")
                .bind(doc.collection.as_str())
                .bind(&doc.id)
                .execute(&self.db)
                .await,
        )?;
        Ok(())
    }

    async fn add_to_set(&self, doc: &DocumentPath, field: &str, value: &str) -> StoreResult<()> {
        let result = log_query(
            query(
                "UPDATE documents SET data = CASE
                    WHEN COALESCE(data -> $3, '[]'::jsonb) @> jsonb_build_array($4::text) THEN data
                    ELSE jsonb_set(data, ARRAY[$3::text],
                        COALESCE(data -> $3, '[]'::jsonb) || jsonb_build_array($4::text))
                END
                WHERE collection = $1 AND id = $2",
            )
            .bind(doc.collection.as_str())
            .bind(&doc.id)
            .bind(field)
            .bind(value)
            .execute(&self.db)
            .await,
        )?;
        require_row(result, doc)
    }

    async fn remove_from_set(
        &self,
        doc: &DocumentPath,
        field: &str,
        value: &str,
    ) -> StoreResult<()> {
        let result = log_query(
            query(
                "UPDATE documents
                SET data = jsonb_set(data, ARRAY[$3::text], COALESCE(data -> $3, '[]'::jsonb) - $4::text)
                WHERE collection = $1 AND id = $2",
            )
            .bind(doc.collection.as_str())
            .bind(&doc.id)
            .bind(field)
            .bind(value)
            .execute(&self.db)
            .await,
        )?;
        require_row(result, doc)
    }
}
