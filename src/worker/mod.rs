pub mod backoff;
pub mod batch;
pub mod registry;

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use futures_util::stream::{self, StreamExt};
use tokio_postgres::types::ToSql;
use uuid::Uuid;

use crate::config::{DestinationConfig, EmbeddingConfig, VectorizerConfig};
use crate::db::postgres::{PgConfig, PgSession};
use crate::db::schema::Row;
use crate::db::sql::vector_literal;
use crate::pipeline::{chunking, formatting, loading, parsing};
use crate::providers::{self, EmbedOptions, Embedding, EmbeddingProvider, ProviderError};
use crate::secrets::SecretResolver;
use crate::vectorizer::provision::{get_vectorizer, list_vectorizers};
use crate::vectorizer::Vectorizer;
use backoff::{Backoff, BackoffConfig};

/// Cooperative shutdown flag, observed between batches.
#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<std::sync::atomic::AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Success/error counts accumulated between heartbeats.
#[derive(Default)]
struct Counters {
    successes: AtomicI64,
    errors: AtomicI64,
    last_error: std::sync::Mutex<Option<String>>,
}

impl Counters {
    fn record_successes(&self, n: i64) {
        self.successes.fetch_add(n, Ordering::Relaxed);
    }

    fn record_error(&self, message: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        let mut last = self.last_error.lock().expect("counter lock poisoned");
        *last = Some(message.to_string());
    }

    fn drain(&self) -> (i64, i64, Option<String>) {
        let successes = self.successes.swap(0, Ordering::Relaxed);
        let errors = self.errors.swap(0, Ordering::Relaxed);
        let mut last = self.last_error.lock().expect("counter lock poisoned");
        (successes, errors, last.take())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub version: String,
    pub expected_heartbeat_interval: Duration,
    pub backoff: BackoffConfig,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            expected_heartbeat_interval: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Outcome of one execute_vectorizer call.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub vectorizer_id: i64,
    pub passes: u32,
    pub successes: u64,
    pub errors: u64,
    /// The queue was empty when the last pass started.
    pub drained: bool,
    /// Set when a pass was aborted on an exhausted transient failure.
    pub transient_error: Option<String>,
}

enum PkOutcome {
    /// Formatted chunks awaiting embeddings.
    Chunks(Vec<(i32, String)>),
    /// Chunks paired with their embeddings, ready to upsert.
    Embedded(Vec<(i32, String, String)>),
    /// Source row disappeared; just consume the queue entries.
    Missing,
    /// Deterministic pipeline failure; consume and count.
    DataError(String),
}

struct PreparedPk {
    pk_values: Vec<String>,
    outcome: PkOutcome,
}

struct PassOutcome {
    claimed: usize,
    successes: u64,
    errors: u64,
    first_error: Option<String>,
    transient_error: Option<String>,
}

/// Shared handles the embedding stage needs while the claim transaction
/// holds the session.
struct EmbedCtx<'a> {
    registry: &'a Arc<PgSession>,
    counters: &'a Arc<Counters>,
    worker_id: Uuid,
    backoff: &'a BackoffConfig,
}

/// A worker process: claims queue batches, runs the embedding pipeline, and
/// reports heartbeats and progress on a second connection so those writes
/// never ride inside a claim transaction.
pub struct Worker {
    session: PgSession,
    registry: Arc<PgSession>,
    worker_id: Uuid,
    secrets: Arc<dyn SecretResolver>,
    http: reqwest::Client,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    options: WorkerOptions,
}

impl Worker {
    /// Connect, register the process, and spawn the heartbeat task.
    pub async fn start(
        pg_config: PgConfig,
        secrets: Arc<dyn SecretResolver>,
        options: WorkerOptions,
    ) -> anyhow::Result<Self> {
        let session = PgSession::open(pg_config.clone()).await?;
        let registry = Arc::new(PgSession::open(pg_config).await?);

        let worker_id = registry::worker_start(
            registry.client()?,
            &options.version,
            options.expected_heartbeat_interval,
        )
        .await?;
        log::info!("worker {} registered", worker_id);

        let counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();

        // Beat at half the expected interval so one missed beat never
        // crosses the liveness threshold.
        let tick = options.expected_heartbeat_interval / 2;
        let hb_registry = registry.clone();
        let hb_counters = counters.clone();
        let hb_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;
                if hb_cancel.is_cancelled() {
                    break;
                }
                let (successes, errors, last_error) = hb_counters.drain();
                let client = match hb_registry.client() {
                    Ok(client) => client,
                    Err(_) => break,
                };
                if let Err(e) = registry::worker_heartbeat(
                    client,
                    worker_id,
                    successes,
                    errors,
                    last_error.as_deref(),
                )
                .await
                {
                    log::warn!("heartbeat failed: {}", e);
                }
            }
        });

        Ok(Self {
            session,
            registry,
            worker_id,
            secrets,
            http: reqwest::Client::new(),
            cancel,
            counters,
            options,
        })
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run passes against one vectorizer until its queue drains, a transient
    /// failure exhausts its retries, or shutdown is requested.
    pub async fn execute_vectorizer(
        &mut self,
        vectorizer_id: i64,
    ) -> anyhow::Result<ExecutionReport> {
        let vectorizer = get_vectorizer(&self.session, vectorizer_id)
            .await?
            .ok_or_else(|| anyhow!("vectorizer {} does not exist", vectorizer_id))?;

        let columns = self.session.source_columns(&vectorizer.source).await?;
        let payload_is_bytea = columns
            .iter()
            .any(|c| c.name == vectorizer.config.payload_column() && c.is_bytea());

        let api_key = match providers::default_key_name(&vectorizer.config.embedding) {
            Some(default_name) => Some(
                self.secrets
                    .resolve(
                        None,
                        providers::api_key_name(&vectorizer.config.embedding),
                        default_name,
                    )
                    .await?,
            ),
            None => None,
        };
        let provider = providers::embedding_provider(&vectorizer.config.embedding, api_key)?;
        let options = embed_options(&vectorizer.config);

        let mut report = ExecutionReport {
            vectorizer_id,
            ..Default::default()
        };

        loop {
            if self.cancel.is_cancelled() {
                log::info!("worker {} shutting down", self.worker_id);
                break;
            }

            let outcome = self
                .run_pass(&vectorizer, provider.as_ref(), &options, payload_is_bytea)
                .await?;

            report.passes += 1;
            report.successes += outcome.successes;
            report.errors += outcome.errors;

            if outcome.claimed > 0 {
                registry::worker_progress(
                    self.registry.client()?,
                    self.worker_id,
                    vectorizer_id,
                    outcome.successes as i64,
                    outcome
                        .transient_error
                        .as_deref()
                        .or(outcome.first_error.as_deref()),
                )
                .await?;
            }

            if let Some(message) = outcome.transient_error {
                report.transient_error = Some(message);
                break;
            }
            if outcome.claimed == 0 {
                report.drained = true;
                break;
            }
        }

        Ok(report)
    }

    /// One pass: claim, dedupe, pipeline, embed, upsert, consume. The claim
    /// locks are held until the same transaction commits the upserts.
    async fn run_pass(
        &mut self,
        vectorizer: &Vectorizer,
        provider: &dyn EmbeddingProvider,
        options: &EmbedOptions,
        payload_is_bytea: bool,
    ) -> anyhow::Result<PassOutcome> {
        let builder = vectorizer.sql_builder();
        let batch_size = vectorizer.config.processing.batch_size();
        let pk_len = vectorizer.source_pk.len();

        let http = self.http.clone();
        let ctx = EmbedCtx {
            registry: &self.registry,
            counters: &self.counters,
            worker_id: self.worker_id,
            backoff: &self.options.backoff,
        };

        let tx = self
            .session
            .client_mut()?
            .transaction()
            .await
            .context("Failed to begin claim transaction")?;

        let rows = tx
            .query(&builder.claim_batch(batch_size as i64) as &str, &[])
            .await
            .context("Failed to claim queue batch")?;

        if rows.is_empty() {
            tx.commit().await?;
            return Ok(PassOutcome {
                claimed: 0,
                successes: 0,
                errors: 0,
                first_error: None,
                transient_error: None,
            });
        }

        let mut claimed: Vec<Vec<String>> = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut pk = Vec::with_capacity(pk_len);
            for i in 0..pk_len {
                pk.push(row.try_get::<_, String>(i)?);
            }
            claimed.push(pk);
        }

        // Duplicates collapse to one unit of work; the queue rows for every
        // duplicate are consumed together below.
        let mut seen = HashSet::new();
        claimed.retain(|pk| seen.insert(pk.clone()));

        let load_sql = builder.load_source_row();
        let mut prepared: Vec<PreparedPk> = Vec::with_capacity(claimed.len());
        for pk_values in claimed {
            let params = pk_params(&pk_values);
            let row = tx
                .query_opt(&load_sql as &str, &params)
                .await
                .context("Failed to load source row")?;

            let outcome = match row {
                None => PkOutcome::Missing,
                Some(row) => {
                    let value: serde_json::Value = row.try_get(0)?;
                    let source_row: Row = value
                        .as_object()
                        .cloned()
                        .map(|m| m.into_iter().collect())
                        .unwrap_or_default();
                    match prepare_chunks(&vectorizer.config, payload_is_bytea, &source_row, &http)
                        .await
                    {
                        Ok(chunks) => PkOutcome::Chunks(chunks),
                        Err(message) => PkOutcome::DataError(message),
                    }
                }
            };
            prepared.push(PreparedPk { pk_values, outcome });
        }

        // Embed with bounded concurrency. The claim transaction stays open,
        // which is what serializes writers per pk.
        let use_batch = matches!(
            vectorizer.config.embedding,
            EmbeddingConfig::OpenAi {
                use_batch_api: true,
                ..
            }
        );
        let transient_error = if use_batch {
            embed_batched(&tx, vectorizer, provider, options, &mut prepared).await?
        } else {
            embed_inline(&ctx, vectorizer, provider, options, &mut prepared).await
        };

        if let Some(message) = transient_error {
            // Dropping the transaction rolls back the claim; the pks return
            // to the queue for the next pass.
            drop(tx);
            ctx.counters.record_error(&message);
            return Ok(PassOutcome {
                claimed: prepared.len(),
                successes: 0,
                errors: 1,
                first_error: None,
                transient_error: Some(message),
            });
        }

        let mut successes = 0u64;
        let mut errors = 0u64;
        let mut first_error: Option<String> = None;

        let delete_queue_sql = builder.delete_queue_rows();
        for item in &prepared {
            let params = pk_params(&item.pk_values);
            match &item.outcome {
                PkOutcome::Missing => {}
                PkOutcome::DataError(message) => {
                    log::warn!(
                        "vectorizer {} pk ({}) skipped: {}",
                        vectorizer.id,
                        item.pk_values.join(","),
                        message
                    );
                    errors += 1;
                    ctx.counters.record_error(message);
                    if first_error.is_none() {
                        first_error = Some(message.clone());
                    }
                }
                PkOutcome::Embedded(chunks) => {
                    upsert_pk(&tx, vectorizer, &builder, &item.pk_values, chunks).await?;
                    successes += 1;
                }
                PkOutcome::Chunks(chunks) if chunks.is_empty() => {
                    // Nothing chunkable; clear any stale embeddings.
                    if vectorizer.target.is_some() {
                        tx.execute(&builder.delete_target_rows() as &str, &params)
                            .await
                            .context("Failed to clear target rows")?;
                    }
                    successes += 1;
                }
                PkOutcome::Chunks(_) => {
                    // Embedding stage left this pk untouched; abort loudly
                    // rather than consume its queue rows.
                    return Err(anyhow!("pk left unembedded without a recorded error"));
                }
            }
            tx.execute(&delete_queue_sql as &str, &params)
                .await
                .context("Failed to consume queue rows")?;
        }

        tx.commit()
            .await
            .context("Failed to commit claim transaction")?;

        self.counters.record_successes(successes as i64);

        Ok(PassOutcome {
            claimed: prepared.len(),
            successes,
            errors,
            first_error,
            transient_error: None,
        })
    }

    /// Poll every vectorizer until cancelled.
    pub async fn run_loop(&mut self, poll_interval: Duration) -> anyhow::Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let vectorizers = list_vectorizers(&self.session).await?;
            for vectorizer in &vectorizers {
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
                match self.execute_vectorizer(vectorizer.id).await {
                    Ok(report) if report.successes > 0 || report.errors > 0 => {
                        log::info!(
                            "vectorizer {}: {} embedded, {} errors over {} passes",
                            report.vectorizer_id,
                            report.successes,
                            report.errors,
                            report.passes
                        );
                    }
                    Ok(_) => {}
                    Err(e) => log::error!("vectorizer {} failed: {:#}", vectorizer.id, e),
                }
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Embed every pending pk concurrently; returns a transient-failure message
/// when retries are exhausted.
async fn embed_inline(
    ctx: &EmbedCtx<'_>,
    vectorizer: &Vectorizer,
    provider: &dyn EmbeddingProvider,
    options: &EmbedOptions,
    prepared: &mut [PreparedPk],
) -> Option<String> {
    let model = vectorizer.config.embedding.model().to_string();
    let max_retries = vectorizer.config.processing.max_retries();
    let concurrency = vectorizer.config.processing.concurrency();

    let pending: Vec<(usize, Vec<String>)> = prepared
        .iter()
        .enumerate()
        .filter_map(|(i, p)| match &p.outcome {
            PkOutcome::Chunks(chunks) if !chunks.is_empty() => {
                Some((i, chunks.iter().map(|(_, text)| text.clone()).collect()))
            }
            _ => None,
        })
        .collect();

    let results: Vec<(usize, Result<Vec<Embedding>, ProviderError>)> =
        stream::iter(pending.into_iter().map(|(i, texts)| {
            let model = model.clone();
            let registry = ctx.registry.clone();
            let counters = ctx.counters.clone();
            let worker_id = ctx.worker_id;
            let vectorizer_id = vectorizer.id;
            let backoff_config = ctx.backoff.clone();
            async move {
                let result = embed_with_retry(
                    provider,
                    &model,
                    &texts,
                    options,
                    max_retries,
                    &backoff_config,
                    &registry,
                    &counters,
                    worker_id,
                    vectorizer_id,
                )
                .await;
                (i, result)
            }
        }))
        .buffer_unordered(concurrency)
        .collect()
        .await;

    for (i, result) in results {
        let chunks = match &prepared[i].outcome {
            PkOutcome::Chunks(chunks) => chunks.clone(),
            _ => continue,
        };
        match result {
            Ok(embeddings) => {
                if embeddings.len() != chunks.len() {
                    prepared[i].outcome = PkOutcome::DataError(format!(
                        "expected {} embeddings, got {}",
                        chunks.len(),
                        embeddings.len()
                    ));
                    continue;
                }
                let embedded = chunks
                    .into_iter()
                    .zip(embeddings)
                    .map(|((seq, text), embedding)| (seq, text, vector_literal(&embedding.vector)))
                    .collect();
                prepared[i].outcome = PkOutcome::Embedded(embedded);
            }
            Err(e) if e.is_retryable() => {
                return Some(e.to_string());
            }
            Err(e) => {
                prepared[i].outcome = PkOutcome::DataError(e.to_string());
            }
        }
    }
    None
}

/// openai batch mode: stage into the batch tables, run, and collect results.
async fn embed_batched(
    tx: &tokio_postgres::Transaction<'_>,
    vectorizer: &Vectorizer,
    provider: &dyn EmbeddingProvider,
    options: &EmbedOptions,
    prepared: &mut [PreparedPk],
) -> anyhow::Result<Option<String>> {
    let model = vectorizer.config.embedding.model();

    let mut staged = Vec::new();
    for p in prepared.iter() {
        if let PkOutcome::Chunks(chunks) = &p.outcome {
            for (seq, text) in chunks {
                staged.push(batch::StagedChunk {
                    pk_values: p.pk_values.clone(),
                    chunk_seq: *seq,
                    chunk: text.clone(),
                });
            }
        }
    }
    if staged.is_empty() {
        return Ok(None);
    }

    let batch_id = batch::stage_batch(tx, vectorizer.id, &staged).await?;
    if let Err(e) = batch::run_batch(tx, vectorizer.id, batch_id, provider, model, options).await {
        return Ok(Some(e.to_string()));
    }
    let status = batch::poll_batch_status(
        tx,
        vectorizer.id,
        batch_id,
        Duration::from_millis(250),
        120,
    )
    .await?;
    if status != "completed" {
        return Ok(Some(format!("embedding batch {} ended as {}", batch_id, status)));
    }

    let results = batch::collect_results(tx, vectorizer.id, batch_id).await?;
    for p in prepared.iter_mut() {
        if let PkOutcome::Chunks(chunks) = &p.outcome {
            if chunks.is_empty() {
                continue;
            }
            let embedded: Vec<(i32, String, String)> = results
                .iter()
                .filter(|r| r.pk_values == p.pk_values)
                .map(|r| (r.chunk_seq, r.chunk.clone(), r.embedding.clone()))
                .collect();
            if embedded.len() != chunks.len() {
                p.outcome = PkOutcome::DataError(format!(
                    "batch returned {} embeddings for {} chunks",
                    embedded.len(),
                    chunks.len()
                ));
            } else {
                p.outcome = PkOutcome::Embedded(embedded);
            }
        }
    }
    batch::delete_batch(tx, vectorizer.id, batch_id).await?;
    Ok(None)
}

fn embed_options(config: &VectorizerConfig) -> EmbedOptions {
    let dimensions = match &config.embedding {
        EmbeddingConfig::OpenAi { dimensions, .. } => Some(*dimensions),
        _ => None,
    };
    let input_type = match &config.embedding {
        EmbeddingConfig::VoyageAi { input_type, .. } => input_type.clone(),
        _ => None,
    };
    EmbedOptions {
        timeout: config.processing.timeout(),
        dimensions,
        input_type,
    }
}

fn pk_params(pk_values: &[String]) -> Vec<&(dyn ToSql + Sync)> {
    pk_values
        .iter()
        .map(|v| v as &(dyn ToSql + Sync))
        .collect()
}

/// Run the load → parse → chunk → format pipeline for one source row.
/// Any failure here is deterministic: the queue rows get consumed.
async fn prepare_chunks(
    config: &VectorizerConfig,
    payload_is_bytea: bool,
    row: &Row,
    http: &reqwest::Client,
) -> Result<Vec<(i32, String)>, String> {
    let payload = loading::load(
        &config.loading,
        row,
        config.payload_column(),
        payload_is_bytea,
        http,
    )
    .await
    .map_err(|e| e.to_string())?;

    let text = parsing::parse(&config.parsing, payload)
        .await
        .map_err(|e| e.to_string())?;

    let chunks = chunking::split(&config.chunking, &text);
    Ok(chunks
        .into_iter()
        .map(|chunk| {
            let formatted = formatting::render(config.formatting.template(), row, &chunk.text);
            (chunk.seq, formatted)
        })
        .collect())
}

/// Replace a pk's embeddings with the new chunk set, inside the claim
/// transaction.
async fn upsert_pk(
    tx: &tokio_postgres::Transaction<'_>,
    vectorizer: &Vectorizer,
    builder: &crate::db::sql::SqlBuilder,
    pk_values: &[String],
    chunks: &[(i32, String, String)],
) -> anyhow::Result<()> {
    if let DestinationConfig::Source { embedding_column } = &vectorizer.config.destination {
        let embedding = &chunks
            .first()
            .ok_or_else(|| anyhow!("no chunks to store"))?
            .2;
        let mut params: Vec<&(dyn ToSql + Sync)> = vec![embedding as &(dyn ToSql + Sync)];
        params.extend(pk_params(pk_values));
        tx.execute(
            &builder.update_source_embedding(embedding_column) as &str,
            &params,
        )
        .await
        .context("Failed to update source embedding column")?;
        return Ok(());
    }

    let params = pk_params(pk_values);
    tx.execute(&builder.delete_target_rows() as &str, &params)
        .await
        .context("Failed to delete stale embeddings")?;

    let insert_sql = builder.insert_chunks(chunks.len());
    let mut insert_params: Vec<&(dyn ToSql + Sync)> =
        Vec::with_capacity(chunks.len() * (pk_values.len() + 3));
    for (seq, text, embedding) in chunks {
        for value in pk_values {
            insert_params.push(value as &(dyn ToSql + Sync));
        }
        insert_params.push(seq as &(dyn ToSql + Sync));
        insert_params.push(text as &(dyn ToSql + Sync));
        insert_params.push(embedding as &(dyn ToSql + Sync));
    }
    tx.execute(&insert_sql as &str, &insert_params)
        .await
        .context("Failed to insert embeddings")?;
    Ok(())
}

/// One embed call with exponential backoff on transport conditions. Each
/// failed attempt is recorded in the progress row so transient trouble is
/// visible while it is happening.
#[allow(clippy::too_many_arguments)]
async fn embed_with_retry(
    provider: &dyn EmbeddingProvider,
    model: &str,
    texts: &[String],
    options: &EmbedOptions,
    max_retries: u32,
    backoff_config: &BackoffConfig,
    registry: &PgSession,
    counters: &Counters,
    worker_id: Uuid,
    vectorizer_id: i64,
) -> Result<Vec<Embedding>, ProviderError> {
    let mut backoff = Backoff::new(backoff_config);
    let mut attempt = 0u32;
    loop {
        match provider.embed(model, texts, options).await {
            Ok(embeddings) => return Ok(embeddings),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                attempt += 1;
                let delay = backoff.next();
                let message = e.to_string();
                log::warn!(
                    "embedding call failed (attempt {}/{}), backing off {:?}: {}",
                    attempt,
                    max_retries,
                    delay,
                    message
                );
                counters.record_error(&message);
                if let Ok(client) = registry.client() {
                    if let Err(progress_err) =
                        registry::worker_progress(client, worker_id, vectorizer_id, 0, Some(&message))
                            .await
                    {
                        log::warn!("failed to record retry progress: {}", progress_err);
                    }
                }
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
