//! SQLite storage backend
//!
//! A single database file (or in-memory handle) backs all of the
//! engine's storage needs: JSON documents per collection, FTS5 views
//! for BM25 blocking, similarity edges with merge-on-reinsert, generic
//! relationship edges, and recursive-CTE graph traversal. Thread-safe
//! via an internal mutex on the connection.
//!
//! Computed blocking keys are evaluated inside SQLite: `left` maps to
//! `substr`, `lower` to `lower`, and `digits_only` to a registered
//! deterministic scalar function.

use super::traits::{
    Block, EdgeEndpoints, EdgeUpsert, EntityStore, FieldFilter, FilterPredicate, KeyExpr,
    OpenStore, Relation, StorageError, StorageResult, TextHit,
};
use crate::edges::SimilarityEdge;
use crate::embedding::EmbeddingMeta;
use crate::record::{Fields, Record};
use crate::validate::{
    validate_collection_name, validate_field_name, validate_view_name, ValidationError,
};
use chrono::{DateTime, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

/// SQLite-backed multi-model store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    #[cfg(feature = "embeddings")]
    vec_dim: Mutex<Option<usize>>,
}

impl SqliteStore {
    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            );

            CREATE TABLE IF NOT EXISTS sim_edges (
                collection TEXT NOT NULL,
                key TEXT NOT NULL,
                from_id TEXT NOT NULL,
                to_id TEXT NOT NULL,
                similarity_score REAL NOT NULL,
                field_scores_json TEXT NOT NULL,
                is_match INTEGER NOT NULL,
                algorithm TEXT NOT NULL,
                metadata_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                update_count INTEGER NOT NULL,
                PRIMARY KEY (collection, key)
            );
            CREATE INDEX IF NOT EXISTS idx_sim_edges_endpoints
                ON sim_edges(collection, from_id, to_id);
            CREATE INDEX IF NOT EXISTS idx_sim_edges_score
                ON sim_edges(collection, similarity_score);

            CREATE TABLE IF NOT EXISTS relations (
                collection TEXT NOT NULL,
                from_id TEXT NOT NULL,
                to_id TEXT NOT NULL,
                relationship TEXT NOT NULL,
                properties_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_relations_collection
                ON relations(collection);

            CREATE TABLE IF NOT EXISTS text_views (
                view TEXT PRIMARY KEY,
                collection TEXT NOT NULL,
                fields_json TEXT NOT NULL
            );

            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    /// Register the scalar functions computed blocking keys rely on.
    fn register_functions(conn: &Connection) -> StorageResult<()> {
        conn.create_scalar_function(
            "digits_only",
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| {
                let value: Option<String> = ctx.get(0)?;
                Ok(value.map(|s| s.chars().filter(|c| c.is_ascii_digit()).collect::<String>()))
            },
        )?;
        Ok(())
    }

    fn build(conn: Connection) -> StorageResult<Self> {
        Self::register_functions(&conn)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            #[cfg(feature = "embeddings")]
            vec_dim: Mutex::new(None),
        })
    }

    fn require_collection(&self, conn: &Connection, name: &str) -> StorageResult<()> {
        validate_collection_name(name)?;
        let exists: Option<String> = conn
            .query_row(
                "SELECT name FROM collections WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StorageError::CollectionNotFound(name.to_string()));
        }
        Ok(())
    }

    fn register_collection(conn: &Connection, name: &str) -> StorageResult<()> {
        validate_collection_name(name)?;
        conn.execute(
            "INSERT OR IGNORE INTO collections (name, created_at) VALUES (?1, ?2)",
            params![name, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn parse_record(id: String, data: &str) -> StorageResult<Record> {
        let value: Value = serde_json::from_str(data)?;
        Ok(Record::from_value(id, value))
    }
}

/// JSON1 path for a validated dotted field.
fn json_path(field: &str) -> Result<String, ValidationError> {
    validate_field_name(field)?;
    Ok(format!("$.{field}"))
}

/// SQL expression computing one blocking key component.
fn key_expr_sql(expr: &KeyExpr) -> Result<String, ValidationError> {
    let extract = |field: &str| -> Result<String, ValidationError> {
        Ok(format!("json_extract(data, '{}')", json_path(field)?))
    };
    Ok(match expr {
        KeyExpr::Field(field) => extract(field)?,
        KeyExpr::Prefix { field, len } => format!("substr({}, 1, {len})", extract(field)?),
        KeyExpr::DigitsOnly { field } => format!("digits_only({})", extract(field)?),
        KeyExpr::Lower { field } => format!("lower({})", extract(field)?),
    })
}

/// Read a column as display text; `None` for NULL and blobs.
fn column_text(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<String>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null | ValueRef::Blob(_) => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
    })
}

fn parse_timestamp(s: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::DateParse(e.to_string()))
}

/// Raw edge row, converted outside the rusqlite closure so JSON errors
/// surface as storage errors.
type EdgeRow = (
    String, // key
    String, // from_id
    String, // to_id
    f64,    // similarity_score
    String, // field_scores_json
    bool,   // is_match
    String, // algorithm
    String, // metadata_json
    String, // created_at
    String, // updated_at
    u32,    // update_count
);

fn edge_from_row(row: EdgeRow) -> StorageResult<SimilarityEdge> {
    let (
        key,
        from_id,
        to_id,
        similarity_score,
        field_scores_json,
        is_match,
        algorithm,
        metadata_json,
        created_at,
        updated_at,
        update_count,
    ) = row;
    Ok(SimilarityEdge {
        key,
        from_id,
        to_id,
        similarity_score,
        field_scores: serde_json::from_str::<BTreeMap<String, f64>>(&field_scores_json)?,
        is_match,
        algorithm,
        metadata: serde_json::from_str::<Fields>(&metadata_json)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        update_count,
    })
}

impl EntityStore for SqliteStore {
    fn ensure_collection(&self, name: &str) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        Self::register_collection(&conn, name)
    }

    fn collection_exists(&self, name: &str) -> StorageResult<bool> {
        validate_collection_name(name)?;
        let conn = self.conn.lock().unwrap();
        let exists: Option<String> = conn
            .query_row(
                "SELECT name FROM collections WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    fn truncate_collection(&self, name: &str) -> StorageResult<()> {
        validate_collection_name(name)?;
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM documents WHERE collection = ?1", params![name])?;
        conn.execute("DELETE FROM sim_edges WHERE collection = ?1", params![name])?;
        conn.execute("DELETE FROM relations WHERE collection = ?1", params![name])?;
        Ok(())
    }

    fn count(&self, name: &str) -> StorageResult<usize> {
        let conn = self.conn.lock().unwrap();
        self.require_collection(&conn, name)?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE collection = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    fn insert_many(&self, collection: &str, records: &[Record]) -> StorageResult<usize> {
        let mut conn = self.conn.lock().unwrap();
        Self::register_collection(&conn, collection)?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO documents (collection, id, data) VALUES (?1, ?2, ?3)",
            )?;
            for record in records {
                let data = serde_json::to_string(&record.fields)?;
                stmt.execute(params![collection, record.id, data])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    fn upsert_document(&self, collection: &str, record: &Record) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        Self::register_collection(&conn, collection)?;
        let data = serde_json::to_string(&record.fields)?;
        conn.execute(
            "INSERT OR REPLACE INTO documents (collection, id, data) VALUES (?1, ?2, ?3)",
            params![collection, record.id, data],
        )?;
        Ok(())
    }

    fn get(&self, collection: &str, id: &str) -> StorageResult<Option<Record>> {
        validate_collection_name(collection)?;
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT id, data FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(id, data)| Self::parse_record(id, &data)).transpose()
    }

    fn fetch_many(
        &self,
        collection: &str,
        ids: &[String],
        fields: Option<&[String]>,
    ) -> StorageResult<Vec<Record>> {
        validate_collection_name(collection)?;
        if let Some(fields) = fields {
            for field in fields {
                validate_field_name(field)?;
            }
        }
        let conn = self.conn.lock().unwrap();
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(400) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT id, data FROM documents WHERE collection = ? AND id IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut values: Vec<SqlValue> = Vec::with_capacity(chunk.len() + 1);
            values.push(SqlValue::Text(collection.to_string()));
            values.extend(chunk.iter().map(|id| SqlValue::Text(id.clone())));
            let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (id, data) = row?;
                let record = Self::parse_record(id, &data)?;
                out.push(match fields {
                    Some(fields) => record.project(fields),
                    None => record,
                });
            }
        }
        Ok(out)
    }

    fn scan(&self, collection: &str, limit: Option<usize>) -> StorageResult<Vec<Record>> {
        validate_collection_name(collection)?;
        let conn = self.conn.lock().unwrap();
        let sql = match limit {
            Some(_) => "SELECT id, data FROM documents WHERE collection = ?1 ORDER BY id LIMIT ?2",
            None => "SELECT id, data FROM documents WHERE collection = ?1 ORDER BY id",
        };
        let mut stmt = conn.prepare(sql)?;
        let mut out = Vec::new();
        let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(String, String)> {
            Ok((row.get(0)?, row.get(1)?))
        };
        let rows: Vec<rusqlite::Result<(String, String)>> = match limit {
            Some(n) => stmt
                .query_map(params![collection, n as i64], map)?
                .collect(),
            None => stmt.query_map(params![collection], map)?.collect(),
        };
        for row in rows {
            let (id, data) = row?;
            out.push(Self::parse_record(id, &data)?);
        }
        Ok(out)
    }

    fn list_ids(&self, collection: &str, limit: Option<usize>) -> StorageResult<Vec<String>> {
        validate_collection_name(collection)?;
        let conn = self.conn.lock().unwrap();
        let sql = match limit {
            Some(_) => "SELECT id FROM documents WHERE collection = ?1 ORDER BY id LIMIT ?2",
            None => "SELECT id FROM documents WHERE collection = ?1 ORDER BY id",
        };
        let mut stmt = conn.prepare(sql)?;
        let rows: Vec<rusqlite::Result<String>> = match limit {
            Some(n) => stmt
                .query_map(params![collection, n as i64], |row| row.get(0))?
                .collect(),
            None => stmt.query_map(params![collection], |row| row.get(0))?.collect(),
        };
        rows.into_iter()
            .map(|r| r.map_err(StorageError::from))
            .collect()
    }

    fn merge_fields(&self, collection: &str, id: &str, patch: &Fields) -> StorageResult<()> {
        validate_collection_name(collection)?;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let data: Option<String> = tx
            .query_row(
                "SELECT data FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(data) = data else {
            return Err(StorageError::CollectionNotFound(format!(
                "{collection}/{id}"
            )));
        };
        let mut fields: Fields = serde_json::from_str(&data)?;
        for (k, v) in patch {
            fields.insert(k.clone(), v.clone());
        }
        let updated = serde_json::to_string(&fields)?;
        tx.execute(
            "UPDATE documents SET data = ?3 WHERE collection = ?1 AND id = ?2",
            params![collection, id, updated],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn group_blocks(
        &self,
        collection: &str,
        keys: &[KeyExpr],
        filters: &[FieldFilter],
    ) -> StorageResult<Vec<Block>> {
        validate_collection_name(collection)?;
        if keys.is_empty() {
            return Err(ValidationError::Config("blocking requires at least one key".into()).into());
        }

        let mut select = String::from("SELECT id");
        for expr in keys {
            select.push_str(", ");
            select.push_str(&key_expr_sql(expr)?);
        }
        select.push_str(" FROM documents WHERE collection = ?");

        let mut values: Vec<SqlValue> = vec![SqlValue::Text(collection.to_string())];
        for filter in filters {
            let path = json_path(&filter.field)?;
            match &filter.predicate {
                FilterPredicate::NotNull => {
                    select.push_str(&format!(
                        " AND json_extract(data, '{path}') IS NOT NULL AND json_extract(data, '{path}') != ''"
                    ));
                }
                FilterPredicate::MinLength(n) => {
                    select.push_str(&format!(" AND length(json_extract(data, '{path}')) >= ?"));
                    values.push(SqlValue::Integer(*n as i64));
                }
                FilterPredicate::NotEqual(v) => {
                    select.push_str(&format!(" AND json_extract(data, '{path}') != ?"));
                    values.push(SqlValue::Text(v.clone()));
                }
            }
        }

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&select)?;
        let key_count = keys.len();
        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), move |row| {
            let id: String = row.get(0)?;
            let mut key = Vec::with_capacity(key_count);
            for i in 0..key_count {
                key.push(column_text(row, i + 1)?);
            }
            Ok((id, key))
        })?;

        let mut groups: BTreeMap<Vec<String>, Vec<String>> = BTreeMap::new();
        for row in rows {
            let (id, key) = row?;
            // Records with a null or empty key component cannot be blocked.
            let key: Option<Vec<String>> = key
                .into_iter()
                .map(|c| c.filter(|s| !s.is_empty()))
                .collect();
            let Some(key) = key else {
                continue;
            };
            groups.entry(key).or_default().push(id);
        }

        Ok(groups
            .into_iter()
            .map(|(key, members)| Block { key, members })
            .collect())
    }

    fn ensure_text_index(
        &self,
        view: &str,
        collection: &str,
        fields: &[String],
    ) -> StorageResult<()> {
        validate_view_name(view)?;
        validate_collection_name(collection)?;
        for field in fields {
            validate_field_name(field)?;
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute_batch(&format!(
            r#"
            DROP TABLE IF EXISTS "{view}";
            CREATE VIRTUAL TABLE "{view}" USING fts5(record_id UNINDEXED, content);
            "#
        ))?;
        tx.execute(
            "INSERT OR REPLACE INTO text_views (view, collection, fields_json) VALUES (?1, ?2, ?3)",
            params![view, collection, serde_json::to_string(fields)?],
        )?;
        {
            let mut read = tx.prepare("SELECT id, data FROM documents WHERE collection = ?1")?;
            let mut write = tx.prepare(&format!(
                r#"INSERT INTO "{view}" (record_id, content) VALUES (?1, ?2)"#
            ))?;
            let rows: Vec<rusqlite::Result<(String, String)>> = read
                .query_map(params![collection], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect();
            for row in rows {
                let (id, data) = row?;
                let record = Self::parse_record(id.clone(), &data)?;
                let mut parts = Vec::new();
                for field in fields {
                    if let Some(text) = record.text(field) {
                        parts.push(text.to_lowercase());
                    }
                }
                if !parts.is_empty() {
                    write.execute(params![id, parts.join(" ")])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn search_text(&self, view: &str, query: &str, limit: usize) -> StorageResult<Vec<TextHit>> {
        validate_view_name(view)?;
        let conn = self.conn.lock().unwrap();
        // FTS5 bm25() ranks lower-is-better; negate so higher is better.
        let sql = format!(
            r#"SELECT record_id, -bm25("{view}") AS score
               FROM "{view}" WHERE "{view}" MATCH ?1
               ORDER BY score DESC LIMIT ?2"#
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![query, limit as i64], |row| {
            Ok(TextHit {
                id: row.get(0)?,
                score: row.get(1)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StorageError::from)
    }

    fn store_embedding(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        vector: &[f32],
        meta: &EmbeddingMeta,
    ) -> StorageResult<()> {
        validate_field_name(field)?;
        let mut patch = Fields::new();
        patch.insert(field.to_string(), serde_json::to_value(vector)?);
        patch.insert(format!("{field}_meta"), serde_json::to_value(meta)?);
        self.merge_fields(collection, id, &patch)?;

        #[cfg(feature = "embeddings")]
        self.vec_store(collection, id, field, vector)?;

        Ok(())
    }

    fn ids_missing_embedding(
        &self,
        collection: &str,
        field: &str,
        limit: Option<usize>,
    ) -> StorageResult<Vec<String>> {
        validate_collection_name(collection)?;
        let path = json_path(field)?;
        let conn = self.conn.lock().unwrap();
        let base = format!(
            "SELECT id FROM documents WHERE collection = ?1 AND json_extract(data, '{path}') IS NULL ORDER BY id"
        );
        let rows: Vec<rusqlite::Result<String>> = match limit {
            Some(n) => {
                let mut stmt = conn.prepare(&format!("{base} LIMIT ?2"))?;
                let rows: Vec<_> = stmt
                    .query_map(params![collection, n as i64], |row| row.get(0))?
                    .collect();
                rows
            }
            None => {
                let mut stmt = conn.prepare(&base)?;
                let rows: Vec<_> = stmt
                    .query_map(params![collection], |row| row.get(0))?
                    .collect();
                rows
            }
        };
        rows.into_iter()
            .map(|r| r.map_err(StorageError::from))
            .collect()
    }

    fn fetch_embeddings(
        &self,
        collection: &str,
        field: &str,
    ) -> StorageResult<Vec<(String, Vec<f32>)>> {
        validate_collection_name(collection)?;
        let path = json_path(field)?;
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT id, json_extract(data, '{path}') FROM documents
             WHERE collection = ?1 AND json_extract(data, '{path}') IS NOT NULL ORDER BY id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<rusqlite::Result<(String, String)>> = stmt
            .query_map(params![collection], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect();
        let mut out = Vec::new();
        for row in rows {
            let (id, raw) = row?;
            match serde_json::from_str::<Vec<f32>>(&raw) {
                Ok(vector) => out.push((id, vector)),
                Err(e) => warn!(%id, error = %e, "skipping malformed embedding"),
            }
        }
        Ok(out)
    }

    #[cfg(feature = "embeddings")]
    fn supports_native_vector(&self) -> bool {
        true
    }

    #[cfg(feature = "embeddings")]
    fn nearest_native(
        &self,
        collection: &str,
        field: &str,
        query: &[f32],
        k: usize,
        min_similarity: f32,
    ) -> StorageResult<Vec<(String, f32)>> {
        validate_collection_name(collection)?;
        validate_field_name(field)?;
        let partition = format!("{collection}#{field}");
        let normalized = vec_l2_normalize(query);
        let query_json = serde_json::to_string(&normalized)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT record_id, distance FROM vec_embeddings
             WHERE partition = ?1 AND embedding MATCH ?2 AND k = ?3
             ORDER BY distance",
        )?;
        let rows: Vec<rusqlite::Result<(String, f64)>> = stmt
            .query_map(params![partition, query_json, k as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect();
        let mut out = Vec::new();
        for row in rows {
            let (id, distance) = row?;
            // L2-normalized vectors: cosine = 1 - d^2 / 2
            let similarity = 1.0 - (distance * distance) / 2.0;
            if similarity as f32 >= min_similarity {
                out.push((id, similarity as f32));
            }
        }
        Ok(out)
    }

    fn upsert_edge(
        &self,
        edge_collection: &str,
        edge: &SimilarityEdge,
        force_update: bool,
    ) -> StorageResult<EdgeUpsert> {
        validate_collection_name(edge_collection)?;
        let mut conn = self.conn.lock().unwrap();
        Self::register_collection(&conn, edge_collection)?;
        let tx = conn.transaction()?;

        let existing: Option<EdgeRow> = tx
            .query_row(
                "SELECT key, from_id, to_id, similarity_score, field_scores_json, is_match,
                        algorithm, metadata_json, created_at, updated_at, update_count
                 FROM sim_edges WHERE collection = ?1 AND key = ?2",
                params![edge_collection, edge.key],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                        row.get(10)?,
                    ))
                },
            )
            .optional()?;

        let outcome = match existing {
            None => {
                tx.execute(
                    "INSERT INTO sim_edges (collection, key, from_id, to_id, similarity_score,
                                            field_scores_json, is_match, algorithm, metadata_json,
                                            created_at, updated_at, update_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        edge_collection,
                        edge.key,
                        edge.from_id,
                        edge.to_id,
                        edge.similarity_score,
                        serde_json::to_string(&edge.field_scores)?,
                        edge.is_match,
                        edge.algorithm,
                        serde_json::to_string(&edge.metadata)?,
                        edge.created_at.to_rfc3339(),
                        edge.updated_at.to_rfc3339(),
                        edge.update_count,
                    ],
                )?;
                EdgeUpsert {
                    created: true,
                    update_count: edge.update_count,
                }
            }
            Some(row) => {
                let mut stored = edge_from_row(row)?;
                stored.merge_from(edge, force_update);
                tx.execute(
                    "UPDATE sim_edges SET similarity_score = ?3, field_scores_json = ?4,
                            is_match = ?5, algorithm = ?6, metadata_json = ?7,
                            updated_at = ?8, update_count = ?9
                     WHERE collection = ?1 AND key = ?2",
                    params![
                        edge_collection,
                        stored.key,
                        stored.similarity_score,
                        serde_json::to_string(&stored.field_scores)?,
                        stored.is_match,
                        stored.algorithm,
                        serde_json::to_string(&stored.metadata)?,
                        stored.updated_at.to_rfc3339(),
                        stored.update_count,
                    ],
                )?;
                EdgeUpsert {
                    created: false,
                    update_count: stored.update_count,
                }
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    fn get_edge(&self, edge_collection: &str, key: &str) -> StorageResult<Option<SimilarityEdge>> {
        validate_collection_name(edge_collection)?;
        let conn = self.conn.lock().unwrap();
        let row: Option<EdgeRow> = conn
            .query_row(
                "SELECT key, from_id, to_id, similarity_score, field_scores_json, is_match,
                        algorithm, metadata_json, created_at, updated_at, update_count
                 FROM sim_edges WHERE collection = ?1 AND key = ?2",
                params![edge_collection, key],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                        row.get(10)?,
                    ))
                },
            )
            .optional()?;
        row.map(edge_from_row).transpose()
    }

    fn fetch_edges_above(
        &self,
        edge_collection: &str,
        min_similarity: f64,
    ) -> StorageResult<Vec<EdgeEndpoints>> {
        validate_collection_name(edge_collection)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT from_id, to_id, similarity_score FROM sim_edges
             WHERE collection = ?1 AND similarity_score >= ?2 ORDER BY from_id, to_id",
        )?;
        let rows = stmt.query_map(params![edge_collection, min_similarity], |row| {
            Ok(EdgeEndpoints {
                from_id: row.get(0)?,
                to_id: row.get(1)?,
                similarity_score: row.get(2)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StorageError::from)
    }

    fn delete_edges_by_algorithm(
        &self,
        edge_collection: &str,
        algorithm: &str,
    ) -> StorageResult<usize> {
        validate_collection_name(edge_collection)?;
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM sim_edges WHERE collection = ?1 AND algorithm = ?2",
            params![edge_collection, algorithm],
        )?;
        Ok(deleted)
    }

    fn count_edges(&self, edge_collection: &str) -> StorageResult<usize> {
        validate_collection_name(edge_collection)?;
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sim_edges WHERE collection = ?1",
            params![edge_collection],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    fn component_from(
        &self,
        edge_collection: &str,
        seed: &str,
        min_similarity: f64,
    ) -> StorageResult<Vec<String>> {
        validate_collection_name(edge_collection)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "WITH RECURSIVE component(id) AS (
                 SELECT ?2
                 UNION
                 SELECT CASE WHEN e.from_id = component.id THEN e.to_id ELSE e.from_id END
                 FROM sim_edges e, component
                 WHERE e.collection = ?1
                   AND e.similarity_score >= ?3
                   AND (e.from_id = component.id OR e.to_id = component.id)
             )
             SELECT id FROM component ORDER BY id",
        )?;
        let rows = stmt.query_map(params![edge_collection, seed, min_similarity], |row| {
            row.get(0)
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StorageError::from)
    }

    fn insert_relation(&self, collection: &str, relation: &Relation) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        Self::register_collection(&conn, collection)?;
        conn.execute(
            "INSERT INTO relations (collection, from_id, to_id, relationship, properties_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                collection,
                relation.from_id,
                relation.to_id,
                relation.relationship,
                serde_json::to_string(&relation.properties)?,
            ],
        )?;
        Ok(())
    }

    fn fetch_relations(&self, collection: &str) -> StorageResult<Vec<Relation>> {
        validate_collection_name(collection)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT from_id, to_id, relationship, properties_json FROM relations
             WHERE collection = ?1 ORDER BY from_id, to_id, relationship",
        )?;
        let rows: Vec<rusqlite::Result<(String, String, String, String)>> = stmt
            .query_map(params![collection], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect();
        let mut out = Vec::new();
        for row in rows {
            let (from_id, to_id, relationship, properties_json) = row?;
            out.push(Relation {
                from_id,
                to_id,
                relationship,
                properties: serde_json::from_str(&properties_json)?,
            });
        }
        Ok(out)
    }

    fn replace_relations(&self, collection: &str, relations: &[Relation]) -> StorageResult<usize> {
        validate_collection_name(collection)?;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM relations WHERE collection = ?1", params![collection])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO relations (collection, from_id, to_id, relationship, properties_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for relation in relations {
                stmt.execute(params![
                    collection,
                    relation.from_id,
                    relation.to_id,
                    relation.relationship,
                    serde_json::to_string(&relation.properties)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(relations.len())
    }

    fn neighbors_within(
        &self,
        collection: &str,
        seed: &str,
        max_hops: usize,
    ) -> StorageResult<Vec<String>> {
        validate_collection_name(collection)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "WITH RECURSIVE reach(id, depth) AS (
                 SELECT ?2, 0
                 UNION
                 SELECT CASE WHEN r.from_id = reach.id THEN r.to_id ELSE r.from_id END,
                        reach.depth + 1
                 FROM relations r, reach
                 WHERE r.collection = ?1
                   AND reach.depth < ?3
                   AND (r.from_id = reach.id OR r.to_id = reach.id)
             )
             SELECT DISTINCT id FROM reach ORDER BY id",
        )?;
        let rows = stmt.query_map(params![collection, seed, max_hops as i64], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StorageError::from)
    }
}

#[cfg(feature = "embeddings")]
impl SqliteStore {
    /// Mirror an embedding into the vec0 virtual table for native KNN.
    ///
    /// The table is created lazily with the dimensionality of the first
    /// vector stored; vectors are L2-normalized so L2 distance converts
    /// to cosine similarity.
    fn vec_store(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        vector: &[f32],
    ) -> StorageResult<()> {
        let mut dim = self.vec_dim.lock().unwrap();
        let conn = self.conn.lock().unwrap();
        if dim.is_none() {
            conn.execute_batch(&format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS vec_embeddings USING vec0(
                     partition TEXT PARTITION KEY,
                     record_id TEXT,
                     embedding float[{}]
                 )",
                vector.len()
            ))?;
            *dim = Some(vector.len());
        }
        let partition = format!("{collection}#{field}");
        conn.execute(
            "DELETE FROM vec_embeddings WHERE rowid IN (
                 SELECT rowid FROM vec_embeddings WHERE partition = ?1 AND record_id = ?2
             )",
            params![partition, id],
        )?;
        let normalized = vec_l2_normalize(vector);
        conn.execute(
            "INSERT INTO vec_embeddings (partition, record_id, embedding) VALUES (?1, ?2, ?3)",
            params![partition, id, serde_json::to_string(&normalized)?],
        )?;
        Ok(())
    }
}

#[cfg(feature = "embeddings")]
fn vec_l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

#[cfg(feature = "embeddings")]
fn register_vec_extension() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    });
}

impl OpenStore for SqliteStore {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        #[cfg(feature = "embeddings")]
        register_vec_extension();
        Self::build(Connection::open(path)?)
    }

    fn open_in_memory() -> StorageResult<Self> {
        #[cfg(feature = "embeddings")]
        register_vec_extension();
        Self::build(Connection::open_in_memory()?)
    }
}
