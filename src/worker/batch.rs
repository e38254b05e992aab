use std::time::Duration;

use anyhow::Context;
use tokio_postgres::GenericClient;

use crate::db::schema::Relation;
use crate::db::sql::{quote_relation, vector_literal};
use crate::providers::{EmbedOptions, EmbeddingProvider};
use crate::vectorizer::INTERNAL_SCHEMA;

/// The two staging tables backing openai batch mode.
pub fn batch_tables(vectorizer_id: i64) -> (Relation, Relation) {
    (
        Relation::new(
            INTERNAL_SCHEMA,
            format!("_vectorizer_embedding_batches_{}", vectorizer_id),
        ),
        Relation::new(
            INTERNAL_SCHEMA,
            format!("_vectorizer_embedding_batch_chunks_{}", vectorizer_id),
        ),
    )
}

/// DDL for the staging tables, created with the vectorizer.
pub fn create_batch_tables_sql(vectorizer_id: i64) -> Vec<String> {
    let (batches, chunks) = batch_tables(vectorizer_id);
    vec![
        format!(
            "CREATE TABLE {} (\
             id int8 GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY, \
             status text NOT NULL DEFAULT 'pending', \
             created_at timestamptz NOT NULL DEFAULT now(), \
             completed_at timestamptz, \
             error_message text)",
            quote_relation(&batches)
        ),
        format!(
            "CREATE TABLE {} (\
             batch_id int8 NOT NULL, \
             pk_values text[] NOT NULL, \
             chunk_seq int4 NOT NULL, \
             chunk text NOT NULL, \
             embedding vector, \
             PRIMARY KEY (batch_id, pk_values, chunk_seq))",
            quote_relation(&chunks)
        ),
    ]
}

pub fn drop_batch_tables_sql(vectorizer_id: i64) -> Vec<String> {
    let (batches, chunks) = batch_tables(vectorizer_id);
    vec![
        format!("DROP TABLE IF EXISTS {}", quote_relation(&chunks)),
        format!("DROP TABLE IF EXISTS {}", quote_relation(&batches)),
    ]
}

/// One chunk staged for batch embedding.
#[derive(Debug, Clone)]
pub struct StagedChunk {
    pub pk_values: Vec<String>,
    pub chunk_seq: i32,
    pub chunk: String,
}

/// A completed chunk with its embedding in vector-literal form.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub pk_values: Vec<String>,
    pub chunk_seq: i32,
    pub chunk: String,
    pub embedding: String,
}

/// Stage a set of chunks as one pending batch; returns the batch id.
pub async fn stage_batch<C: GenericClient + Sync>(
    client: &C,
    vectorizer_id: i64,
    items: &[StagedChunk],
) -> anyhow::Result<i64> {
    let (batches, chunks) = batch_tables(vectorizer_id);

    let row = client
        .query_one(
            &format!(
                "INSERT INTO {} (status) VALUES ('pending') RETURNING id",
                quote_relation(&batches)
            ),
            &[],
        )
        .await
        .context("Failed to create embedding batch")?;
    let batch_id: i64 = row.try_get(0)?;

    let insert = format!(
        "INSERT INTO {} (batch_id, pk_values, chunk_seq, chunk) VALUES ($1, $2, $3, $4)",
        quote_relation(&chunks)
    );
    for item in items {
        client
            .execute(
                &insert,
                &[&batch_id, &item.pk_values, &item.chunk_seq, &item.chunk],
            )
            .await
            .context("Failed to stage batch chunk")?;
    }

    Ok(batch_id)
}

/// Embed one pending batch and mark it completed.
///
/// Retryable provider errors leave the batch pending so a later pass can
/// pick it up again; data errors mark it failed with the message.
pub async fn run_batch<C: GenericClient + Sync>(
    client: &C,
    vectorizer_id: i64,
    batch_id: i64,
    provider: &dyn EmbeddingProvider,
    model: &str,
    options: &EmbedOptions,
) -> anyhow::Result<()> {
    let (batches, chunks) = batch_tables(vectorizer_id);

    let rows = client
        .query(
            &format!(
                "SELECT pk_values, chunk_seq, chunk FROM {} \
                 WHERE batch_id = $1 ORDER BY pk_values, chunk_seq",
                quote_relation(&chunks)
            ),
            &[&batch_id],
        )
        .await
        .context("Failed to read batch chunks")?;

    let inputs: Vec<String> = rows
        .iter()
        .map(|r| r.try_get::<_, String>(2))
        .collect::<Result<_, _>>()?;

    let embeddings = match provider.embed(model, &inputs, options).await {
        Ok(embeddings) => embeddings,
        Err(e) if e.is_retryable() => {
            return Err(anyhow::Error::new(e).context("batch embedding call failed"));
        }
        Err(e) => {
            client
                .execute(
                    &format!(
                        "UPDATE {} SET status = 'failed', completed_at = clock_timestamp(), \
                         error_message = $2 WHERE id = $1",
                        quote_relation(&batches)
                    ),
                    &[&batch_id, &e.to_string()],
                )
                .await
                .context("Failed to mark batch failed")?;
            return Err(anyhow::Error::new(e).context("batch rejected by provider"));
        }
    };

    let update = format!(
        "UPDATE {} SET embedding = $1::text::vector \
         WHERE batch_id = $2 AND pk_values = $3 AND chunk_seq = $4",
        quote_relation(&chunks)
    );
    for (row, embedding) in rows.iter().zip(embeddings.iter()) {
        let pk_values: Vec<String> = row.try_get(0)?;
        let chunk_seq: i32 = row.try_get(1)?;
        client
            .execute(
                &update,
                &[
                    &vector_literal(&embedding.vector),
                    &batch_id,
                    &pk_values,
                    &chunk_seq,
                ],
            )
            .await
            .context("Failed to store batch embedding")?;
    }

    client
        .execute(
            &format!(
                "UPDATE {} SET status = 'completed', completed_at = clock_timestamp() \
                 WHERE id = $1",
                quote_relation(&batches)
            ),
            &[&batch_id],
        )
        .await
        .context("Failed to mark batch completed")?;

    Ok(())
}

/// Poll a batch until it leaves 'pending'. Returns the final status.
pub async fn poll_batch_status<C: GenericClient + Sync>(
    client: &C,
    vectorizer_id: i64,
    batch_id: i64,
    interval: Duration,
    max_polls: u32,
) -> anyhow::Result<String> {
    let (batches, _) = batch_tables(vectorizer_id);
    let query = format!(
        "SELECT status FROM {} WHERE id = $1",
        quote_relation(&batches)
    );

    for _ in 0..max_polls {
        let row = client
            .query_one(&query, &[&batch_id])
            .await
            .context("Failed to poll batch status")?;
        let status: String = row.try_get(0)?;
        if status != "pending" {
            return Ok(status);
        }
        tokio::time::sleep(interval).await;
    }
    Ok("pending".to_string())
}

/// Read back a completed batch in upsert-ready form.
pub async fn collect_results<C: GenericClient + Sync>(
    client: &C,
    vectorizer_id: i64,
    batch_id: i64,
) -> anyhow::Result<Vec<BatchResult>> {
    let (_, chunks) = batch_tables(vectorizer_id);
    let rows = client
        .query(
            &format!(
                "SELECT pk_values, chunk_seq, chunk, embedding::text FROM {} \
                 WHERE batch_id = $1 AND embedding IS NOT NULL \
                 ORDER BY pk_values, chunk_seq",
                quote_relation(&chunks)
            ),
            &[&batch_id],
        )
        .await
        .context("Failed to collect batch results")?;

    let mut results = Vec::with_capacity(rows.len());
    for row in &rows {
        results.push(BatchResult {
            pk_values: row.try_get(0)?,
            chunk_seq: row.try_get(1)?,
            chunk: row.try_get(2)?,
            embedding: row.try_get(3)?,
        });
    }
    Ok(results)
}

/// Delete a consumed batch and its chunks.
pub async fn delete_batch<C: GenericClient + Sync>(
    client: &C,
    vectorizer_id: i64,
    batch_id: i64,
) -> anyhow::Result<()> {
    let (batches, chunks) = batch_tables(vectorizer_id);
    client
        .execute(
            &format!(
                "DELETE FROM {} WHERE batch_id = $1",
                quote_relation(&chunks)
            ),
            &[&batch_id],
        )
        .await
        .context("Failed to delete batch chunks")?;
    client
        .execute(
            &format!("DELETE FROM {} WHERE id = $1", quote_relation(&batches)),
            &[&batch_id],
        )
        .await
        .context("Failed to delete batch")?;
    Ok(())
}
