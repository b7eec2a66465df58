//! SQLite-backed [`NodeStore`] and [`VectorIndex`] implementations.
//!
//! Both share one [`SqlitePool`] but touch disjoint tables (`nodes` and
//! `node_vectors`). Vectors are stored as little-endian `f32` BLOBs and
//! searched by brute-force cosine similarity.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use private_rag_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use private_rag_core::error::{Backend, RagError, Result};
use private_rag_core::models::{Metadata, Node, SearchFilter};
use private_rag_core::store::{sort_matches, NodeStore, VectorIndex, VectorMatch};

fn node_err(e: sqlx::Error) -> RagError {
    RagError::backend(Backend::NodeStore, e)
}

fn vector_err(e: sqlx::Error) -> RagError {
    RagError::backend(Backend::VectorIndex, e)
}

fn metadata_to_json(backend: Backend, metadata: &Metadata) -> Result<String> {
    serde_json::to_string(metadata).map_err(|e| RagError::backend(backend, e))
}

/// SQLite implementation of [`NodeStore`].
pub struct SqliteNodeStore {
    pool: SqlitePool,
}

impl SqliteNodeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_node(row: &SqliteRow) -> Result<Node> {
    let metadata_json: String = row.get("metadata_json");
    let metadata: Metadata =
        serde_json::from_str(&metadata_json).map_err(|e| RagError::backend(Backend::NodeStore, e))?;
    let position: i64 = row.get("position");
    let start: i64 = row.get("start_offset");
    let end: i64 = row.get("end_offset");
    Ok(Node {
        id: row.get("id"),
        document_id: row.get("document_id"),
        text: row.get("text"),
        start: start as usize,
        end: end as usize,
        position: position as usize,
        hash: row.get("hash"),
        metadata,
        created_at: row.get("created_at"),
        embedding: None,
    })
}

const NODE_COLUMNS: &str =
    "id, document_id, position, start_offset, end_offset, text, hash, metadata_json, created_at";

#[async_trait]
impl NodeStore for SqliteNodeStore {
    async fn put(&self, node: &Node) -> Result<()> {
        let metadata_json = metadata_to_json(Backend::NodeStore, &node.metadata)?;
        sqlx::query(
            r#"
            INSERT INTO nodes (id, document_id, position, start_offset, end_offset,
                               text, hash, metadata_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                document_id = excluded.document_id,
                position = excluded.position,
                start_offset = excluded.start_offset,
                end_offset = excluded.end_offset,
                text = excluded.text,
                hash = excluded.hash,
                metadata_json = excluded.metadata_json,
                created_at = excluded.created_at
            "#,
        )
        .bind(&node.id)
        .bind(&node.document_id)
        .bind(node.position as i64)
        .bind(node.start as i64)
        .bind(node.end as i64)
        .bind(&node.text)
        .bind(&node.hash)
        .bind(&metadata_json)
        .bind(node.created_at)
        .execute(&self.pool)
        .await
        .map_err(node_err)?;
        Ok(())
    }

    async fn get(&self, node_id: &str) -> Result<Option<Node>> {
        let row = sqlx::query(&format!("SELECT {} FROM nodes WHERE id = ?", NODE_COLUMNS))
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(node_err)?;
        row.as_ref().map(row_to_node).transpose()
    }

    async fn delete(&self, node_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(node_id)
            .execute(&self.pool)
            .await
            .map_err(node_err)?;
        Ok(())
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        let res = sqlx::query("DELETE FROM nodes WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(node_err)?;
        Ok(res.rows_affected() as usize)
    }

    async fn list_by_document(&self, document_id: &str) -> Result<Vec<Node>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM nodes WHERE document_id = ? ORDER BY position ASC, created_at ASC, id ASC",
            NODE_COLUMNS
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(node_err)?;
        rows.iter().map(row_to_node).collect()
    }

    async fn document_ids(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT DISTINCT document_id FROM nodes ORDER BY document_id")
            .fetch_all(&self.pool)
            .await
            .map_err(node_err)
    }
}

/// SQLite implementation of [`VectorIndex`].
pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Total number of stored vectors.
    pub async fn count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM node_vectors")
            .fetch_one(&self.pool)
            .await
            .map_err(vector_err)?;
        Ok(n as usize)
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(
        &self,
        node_id: &str,
        document_id: &str,
        vector: &[f32],
        metadata: &Metadata,
    ) -> Result<()> {
        let blob = vec_to_blob(vector);
        let metadata_json = metadata_to_json(Backend::VectorIndex, metadata)?;
        sqlx::query(
            r#"
            INSERT INTO node_vectors (node_id, document_id, dims, embedding, metadata_json)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(node_id) DO UPDATE SET
                document_id = excluded.document_id,
                dims = excluded.dims,
                embedding = excluded.embedding,
                metadata_json = excluded.metadata_json
            "#,
        )
        .bind(node_id)
        .bind(document_id)
        .bind(vector.len() as i64)
        .bind(&blob)
        .bind(&metadata_json)
        .execute(&self.pool)
        .await
        .map_err(vector_err)?;
        Ok(())
    }

    async fn delete(&self, node_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM node_vectors WHERE node_id = ?")
            .bind(node_id)
            .execute(&self.pool)
            .await
            .map_err(vector_err)?;
        Ok(())
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        let res = sqlx::query("DELETE FROM node_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(vector_err)?;
        Ok(res.rows_affected() as usize)
    }

    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<VectorMatch>> {
        let rows = sqlx::query("SELECT node_id, document_id, embedding FROM node_vectors")
            .fetch_all(&self.pool)
            .await
            .map_err(vector_err)?;

        let mut matches: Vec<VectorMatch> = rows
            .iter()
            .filter(|row| filter.matches(row.get::<&str, _>("document_id")))
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                VectorMatch {
                    node_id: row.get("node_id"),
                    score: cosine_similarity(vector, &blob_to_vec(&blob)),
                }
            })
            .collect();

        sort_matches(&mut matches);
        matches.truncate(top_k);
        Ok(matches)
    }
}
