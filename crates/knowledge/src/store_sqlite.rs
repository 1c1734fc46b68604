//! SQLite document backend (`sqlx`), with FTS5 for keyword search.

use std::{str::FromStr, time::Duration};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    sqlx::{
        Row, SqlitePool,
        sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    },
    tracing::{debug, warn},
};

use crate::{
    document::{Collection, DocFilter, DocType, Document},
    error::{KnowledgeError, Result},
    schema::run_migrations,
    store::{DocumentStore, query_terms},
};

const COLUMNS: &[&str] = &[
    "id",
    "title",
    "content",
    "doc_type",
    "category",
    "tags",
    "embedding",
    "metadata",
    "confidence",
    "source_url",
    "created_at",
    "updated_at",
];

pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) the database at `db_path` and run migrations.
    /// `:memory:` opens a private in-memory database on a single connection.
    pub async fn connect(db_path: &str, max_connections: u32) -> Result<Self> {
        let pool = if db_path == ":memory:" {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
                .await?
        } else {
            let options = SqliteConnectOptions::new()
                .filename(db_path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5));
            SqlitePoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .connect_with(options)
                .await?
        };
        run_migrations(&pool).await?;
        debug!(db_path, "document store ready");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn column_list(prefix: &str) -> String {
    COLUMNS
        .iter()
        .map(|c| format!("{prefix}{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `AND ... IN (...)` clauses for a filter, plus the values to bind in order.
fn filter_clause(filter: &DocFilter, prefix: &str) -> (String, Vec<String>) {
    let mut sql = String::new();
    let mut binds = Vec::new();
    if !filter.doc_types.is_empty() {
        sql.push_str(&format!(
            " AND {prefix}doc_type IN ({})",
            placeholders(filter.doc_types.len())
        ));
        binds.extend(filter.doc_types.iter().map(|t| t.as_str().to_string()));
    }
    if !filter.categories.is_empty() {
        sql.push_str(&format!(
            " AND {prefix}category IN ({})",
            placeholders(filter.categories.len())
        ));
        binds.extend(filter.categories.iter().cloned());
    }
    (sql, binds)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

fn micros_to_datetime(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| KnowledgeError::backend(format!("timestamp out of range: {micros}")))
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let id: String = row.try_get("id")?;
    let doc_type: String = row.try_get("doc_type")?;
    let doc_type = DocType::from_str(&doc_type)
        .map_err(|e| KnowledgeError::backend(format!("corrupt row {id}: {e}")))?;
    let tags: String = row.try_get("tags")?;
    let metadata: String = row.try_get("metadata")?;
    let embedding: Option<Vec<u8>> = row.try_get("embedding")?;
    let confidence: f64 = row.try_get("confidence")?;

    let mut doc = Document::restore(
        id,
        row.try_get("title")?,
        row.try_get("content")?,
        doc_type,
        row.try_get("category")?,
        micros_to_datetime(row.try_get("created_at")?)?,
        micros_to_datetime(row.try_get("updated_at")?)?,
    )
    .with_tags(serde_json::from_str::<Vec<String>>(&tags)?)
    .with_metadata(serde_json::from_str(&metadata)?)
    .with_confidence(confidence as f32)
    .with_source_url(row.try_get("source_url")?);

    doc.embedding = match embedding {
        Some(blob) => {
            let decoded = blob_to_embedding(&blob);
            if decoded.is_none() {
                warn!(id = doc.id(), bytes = blob.len(), "ignoring malformed embedding blob");
            }
            decoded
        },
        None => None,
    };
    Ok(doc)
}

/// Merge order for full-text hits. bm25 statistics are per FTS table, so
/// scores from different collections are only roughly comparable.
fn rank_hits(hits: &mut [(Document, f32)]) {
    hits.sort_by(|a, b| {
        b.1.total_cmp(&a.1)
            .then_with(|| b.0.updated_at.cmp(&a.0.updated_at))
            .then_with(|| a.0.id().cmp(b.0.id()))
    });
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn put(&self, doc: &Document) -> Result<()> {
        let collection = doc.collection();
        let table = collection.table_name();
        let mut sql = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            column_list(""),
            placeholders(COLUMNS.len())
        );
        if !collection.is_insert_only() {
            sql.push_str(
                " ON CONFLICT(id) DO UPDATE SET \
                 title = excluded.title, content = excluded.content, \
                 doc_type = excluded.doc_type, category = excluded.category, \
                 tags = excluded.tags, embedding = excluded.embedding, \
                 metadata = excluded.metadata, confidence = excluded.confidence, \
                 source_url = excluded.source_url, updated_at = excluded.updated_at",
            );
        }

        let tags = serde_json::to_string(&doc.tags)?;
        let metadata = serde_json::to_string(&doc.metadata)?;
        let result = sqlx::query(&sql)
            .bind(doc.id())
            .bind(&doc.title)
            .bind(&doc.content)
            .bind(doc.doc_type.as_str())
            .bind(&doc.category)
            .bind(tags)
            .bind(doc.embedding.as_deref().map(embedding_to_blob))
            .bind(metadata)
            .bind(f64::from(doc.confidence()))
            .bind(doc.source_url.as_deref())
            .bind(doc.created_at.timestamp_micros())
            .bind(doc.updated_at.timestamp_micros())
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(KnowledgeError::DuplicateId(doc.id().to_string()))
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Document>> {
        for collection in Collection::ALL {
            let sql = format!(
                "SELECT {} FROM {} WHERE id = ?",
                column_list(""),
                collection.table_name()
            );
            if let Some(row) = sqlx::query(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            {
                return row_to_document(&row).map(Some);
            }
        }
        Ok(None)
    }

    async fn scan(&self, filter: &DocFilter) -> Result<Vec<Document>> {
        let (clause, binds) = filter_clause(filter, "");
        let mut docs = Vec::new();
        for collection in filter.collections() {
            let sql = format!(
                "SELECT {} FROM {} WHERE 1 = 1{clause} ORDER BY seq",
                column_list(""),
                collection.table_name()
            );
            let mut query = sqlx::query(&sql);
            for value in &binds {
                query = query.bind(value.as_str());
            }
            for row in query.fetch_all(&self.pool).await? {
                docs.push(row_to_document(&row)?);
            }
        }
        Ok(docs)
    }

    async fn full_text_search(
        &self,
        query: &str,
        filter: &DocFilter,
        limit: usize,
    ) -> Result<Vec<(Document, f32)>> {
        let terms = query_terms(query);
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let match_expr = terms
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(" OR ");

        let (clause, binds) = filter_clause(filter, "t.");
        let mut hits = Vec::new();
        for collection in filter.collections() {
            let table = collection.table_name();
            let sql = format!(
                "SELECT {}, bm25({table}_fts) AS relevance \
                 FROM {table}_fts JOIN {table} t ON t.seq = {table}_fts.rowid \
                 WHERE {table}_fts MATCH ?{clause} \
                 ORDER BY relevance LIMIT ?",
                column_list("t.")
            );
            let mut q = sqlx::query(&sql).bind(match_expr.as_str());
            for value in &binds {
                q = q.bind(value.as_str());
            }
            let rows = q.bind(limit as i64).fetch_all(&self.pool).await?;
            for row in rows {
                // bm25() is lower-is-better; negate so higher wins.
                let relevance: f64 = row.try_get("relevance")?;
                hits.push((row_to_document(&row)?, (-relevance) as f32));
            }
        }
        rank_hits(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn count(&self, filter: &DocFilter) -> Result<usize> {
        let (clause, binds) = filter_clause(filter, "");
        let mut total = 0usize;
        for collection in filter.collections() {
            let sql = format!(
                "SELECT COUNT(*) FROM {} WHERE 1 = 1{clause}",
                collection.table_name()
            );
            let mut q = sqlx::query_scalar::<_, i64>(&sql);
            for value in &binds {
                q = q.bind(value.as_str());
            }
            total += q.fetch_one(&self.pool).await? as usize;
        }
        Ok(total)
    }

    async fn distinct_categories(&self) -> Result<Vec<String>> {
        let categories = sqlx::query_scalar::<_, String>(
            "SELECT category FROM knowledge_base \
             UNION SELECT category FROM conversations \
             ORDER BY category",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(categories)
    }

    async fn delete_oldest(&self, collection: Collection, n: usize) -> Result<usize> {
        if n == 0 {
            return Ok(0);
        }
        let table = collection.table_name();
        let sql = format!(
            "DELETE FROM {table} WHERE seq IN \
             (SELECT seq FROM {table} ORDER BY created_at ASC, seq ASC LIMIT ?)"
        );
        let result = sqlx::query(&sql)
            .bind(n as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {super::*, chrono::Duration as ChronoDuration};

    async fn store() -> SqliteDocumentStore {
        SqliteDocumentStore::connect(":memory:", 1).await.unwrap()
    }

    fn knowledge(id: &str, title: &str, content: &str, category: &str) -> Document {
        Document::with_id(id, DocType::Knowledge, title, content, category)
    }

    #[tokio::test]
    async fn put_and_get_round_trips_every_field() {
        let store = store().await;
        let mut meta = serde_json::Map::new();
        meta.insert("author".into(), "ops".into());
        let doc = knowledge("kb-1", "Pods", "Check pod events.", "kubernetes")
            .with_tags(["kubernetes".to_string(), "debugging".to_string()])
            .with_confidence(0.8)
            .with_source_url(Some("https://kubernetes.io/docs".into()))
            .with_metadata(meta)
            .with_embedding(vec![0.25, -1.5, 3.0], 3)
            .unwrap();
        store.put(&doc).await.unwrap();

        let loaded = store.get("kb-1").await.unwrap().unwrap();
        assert_eq!(loaded.title, "Pods");
        assert_eq!(loaded.tags, doc.tags);
        assert_eq!(loaded.embedding, Some(vec![0.25, -1.5, 3.0]));
        assert_eq!(loaded.metadata["author"], "ops");
        assert_eq!(loaded.source_url.as_deref(), Some("https://kubernetes.io/docs"));
        assert!((loaded.confidence() - 0.8).abs() < 1e-6);
        assert_eq!(
            loaded.created_at.timestamp_micros(),
            doc.created_at.timestamp_micros()
        );
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conversation_duplicate_is_rejected() {
        let store = store().await;
        let doc = Document::new(DocType::Conversation, "chat", "User: hi", "general");
        store.put(&doc).await.unwrap();
        assert!(matches!(
            store.put(&doc).await,
            Err(KnowledgeError::DuplicateId(_))
        ));
    }

    #[tokio::test]
    async fn knowledge_upsert_keeps_created_at_and_reindexes() {
        let store = store().await;
        let first = knowledge("kb-1", "Disk", "the disk is full", "infrastructure");
        store.put(&first).await.unwrap();

        let mut second = knowledge("kb-1", "Disk", "inode exhaustion", "infrastructure");
        second.created_at = first.created_at + ChronoDuration::seconds(30);
        store.put(&second).await.unwrap();

        let loaded = store.get("kb-1").await.unwrap().unwrap();
        assert_eq!(loaded.content, "inode exhaustion");
        assert_eq!(
            loaded.created_at.timestamp_micros(),
            first.created_at.timestamp_micros()
        );
        assert_eq!(store.count(&DocFilter::knowledge()).await.unwrap(), 1);

        let stale = store
            .full_text_search("full", &DocFilter::all(), 5)
            .await
            .unwrap();
        assert!(stale.is_empty(), "old content must leave the FTS index");
        let fresh = store
            .full_text_search("inode", &DocFilter::all(), 5)
            .await
            .unwrap();
        assert_eq!(fresh.len(), 1);
    }

    #[tokio::test]
    async fn full_text_search_filters_and_ranks() {
        let store = store().await;
        store
            .put(&knowledge(
                "a",
                "Pod crash loop",
                "pod keeps restarting, inspect pod logs",
                "kubernetes",
            ))
            .await
            .unwrap();
        store
            .put(&knowledge("b", "Node pressure", "evicted pod", "kubernetes"))
            .await
            .unwrap();
        store
            .put(&knowledge("c", "Loki", "query logs", "logging"))
            .await
            .unwrap();
        store
            .put(&Document::new(
                DocType::Conversation,
                "chat",
                "User: my pod died",
                "kubernetes",
            ))
            .await
            .unwrap();

        let hits = store
            .full_text_search("pod troubleshooting", &DocFilter::knowledge(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0.id(), "a");
        assert!(hits.iter().all(|(_, s)| *s > 0.0));

        let all = store
            .full_text_search("pod", &DocFilter::all(), 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let limited = store
            .full_text_search("pod", &DocFilter::all(), 1)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn operator_words_do_not_break_match_syntax() {
        let store = store().await;
        store
            .put(&knowledge("a", "Pods AND nodes", "NOT ready", "kubernetes"))
            .await
            .unwrap();
        let hits = store
            .full_text_search("AND NOT \"ready\" (", &DocFilter::all(), 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn delete_oldest_and_distinct_categories() {
        let store = store().await;
        let base = Utc::now();
        for (i, category) in ["kubernetes", "git", "logging", "git"].iter().enumerate() {
            let mut doc = Document::new(
                DocType::Conversation,
                format!("chat {i}"),
                format!("turn {i}"),
                *category,
            );
            doc.created_at = base + ChronoDuration::seconds(i as i64);
            store.put(&doc).await.unwrap();
        }
        store
            .put(&knowledge("kb", "t", "c", "security"))
            .await
            .unwrap();

        assert_eq!(
            store.distinct_categories().await.unwrap(),
            vec!["git", "kubernetes", "logging", "security"]
        );

        let removed = store
            .delete_oldest(Collection::Conversations, 3)
            .await
            .unwrap();
        assert_eq!(removed, 3);
        let left = store.scan(&DocFilter::conversations()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].content, "turn 3");
        assert_eq!(store.count(&DocFilter::knowledge()).await.unwrap(), 1);
        assert!(
            store
                .full_text_search("turn", &DocFilter::conversations(), 10)
                .await
                .unwrap()
                .len()
                == 1
        );
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.db");
        let path = path.to_str().unwrap();
        {
            let store = SqliteDocumentStore::connect(path, 2).await.unwrap();
            store
                .put(&knowledge("kb-1", "Git", "revert a commit", "git"))
                .await
                .unwrap();
            store.pool().close().await;
        }
        let store = SqliteDocumentStore::connect(path, 2).await.unwrap();
        assert!(store.get("kb-1").await.unwrap().is_some());
        store.ping().await.unwrap();
    }

    #[test]
    fn blob_round_trip_and_malformed_blob() {
        let v = vec![1.0f32, -0.5, 42.25];
        assert_eq!(blob_to_embedding(&embedding_to_blob(&v)), Some(v));
        assert_eq!(blob_to_embedding(&[1, 2, 3]), None);
    }
}
