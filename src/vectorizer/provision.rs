use anyhow::{anyhow, bail, Context};

use super::{derive_names, Vectorizer, INTERNAL_SCHEMA};
use crate::config::{
    ConfigError, DestinationConfig, EmbeddingConfig, SchedulingConfig, VectorizerConfig,
};
use crate::db::postgres::PgSession;
use crate::db::schema::Relation;
use crate::db::sql::SqlBuilder;
use crate::worker::batch;

/// Request to create a vectorizer on a source table.
#[derive(Debug, Clone)]
pub struct CreateVectorizerRequest {
    pub source: Relation,
    /// Raw config document; sub-blocks may carry `config_type` discriminators.
    pub config: serde_json::Value,
    /// Copy all current source pks into the queue after creation.
    pub enqueue_existing: bool,
}

fn config_failure(errors: Vec<ConfigError>) -> anyhow::Error {
    let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    anyhow!("invalid vectorizer config: {}", messages.join("; "))
}

/// Create a vectorizer: validate, provision all physical objects in one
/// transaction, grant access, optionally backfill the queue, and record the
/// vectorizer row. Only the owner of the source table may do this.
pub async fn create_vectorizer(
    session: &mut PgSession,
    request: CreateVectorizerRequest,
) -> anyhow::Result<Vectorizer> {
    if !session
        .is_owner(&request.source)
        .await
        .with_context(|| format!("source table {} not found", request.source))?
    {
        bail!("only the owner of {} may create a vectorizer on it", request.source);
    }

    let source_pk = session.source_pk(&request.source).await?;
    if source_pk.is_empty() {
        bail!("source table {} has no primary key", request.source);
    }

    let mut config = VectorizerConfig::from_value(request.config).map_err(config_failure)?;

    let row = session
        .client()?
        .query_one("SELECT nextval('vectorizer.vectorizer_id_seq')", &[])
        .await
        .context("Failed to allocate vectorizer id")?;
    let id: i64 = row.try_get(0)?;

    let names = derive_names(id, &request.source, &config.destination);
    for rel in [names.target.as_ref(), names.view.as_ref(), Some(&names.queue)]
        .into_iter()
        .flatten()
    {
        if session.relation_exists(rel).await? {
            bail!("relation {} already exists; supply explicit names", rel);
        }
    }

    let (batches_rel, chunks_rel) = batch::batch_tables(id);
    let mut batch_collision = None;
    if matches!(config.embedding, EmbeddingConfig::OpenAi { use_batch_api: true, .. }) {
        for rel in [&batches_rel, &chunks_rel] {
            if session.relation_exists(rel).await? {
                batch_collision = Some(rel.name.clone());
            }
        }
    }

    let columns = session.source_columns(&request.source).await?;
    let errors = config.validate(&columns, batch_collision.as_deref());
    if !errors.is_empty() {
        return Err(config_failure(errors));
    }

    // Missing grant roles get a warning, not an error.
    let mut grant_roles = Vec::new();
    for role in config.grant_to.roles() {
        if session.role_exists(&role).await? {
            grant_roles.push(role);
        } else {
            log::warn!("grant_to role {} does not exist; skipping grants", role);
        }
    }

    let builder = SqlBuilder::new(
        request.source.clone(),
        names.queue.clone(),
        names.target.clone(),
        source_pk.clone(),
    );

    let tx = session
        .client_mut()?
        .transaction()
        .await
        .context("Failed to begin provisioning transaction")?;

    let mut statements: Vec<String> = Vec::new();
    match &config.destination {
        DestinationConfig::Source { embedding_column } => {
            statements.push(builder.add_embedding_column(
                embedding_column,
                config.embedding.dimensions(),
            ));
        }
        _ => {
            statements.push(builder.create_target_table(config.embedding.dimensions()));
        }
    }
    statements.extend(builder.create_queue_table());
    statements.push(builder.create_trigger_function(&names.trigger_name));
    statements.push(builder.create_trigger(&names.trigger_name));
    if let Some(view) = &names.view {
        statements.push(builder.create_view(view));
    }
    if matches!(config.embedding, EmbeddingConfig::OpenAi { use_batch_api: true, .. }) {
        statements.extend(batch::create_batch_tables_sql(id));
    }
    for role in &grant_roles {
        statements.push(builder.grant_select_source(role));
        statements.push(builder.grant_queue(role));
        if names.target.is_some() {
            statements.push(builder.grant_target(role));
        }
    }

    for stmt in &statements {
        tx.batch_execute(stmt)
            .await
            .with_context(|| format!("Failed to execute: {}", stmt))?;
    }

    // Register the repeating job before persisting so the job id lands in
    // the stored config.
    if let SchedulingConfig::TimescaleDb {
        schedule_interval,
        initial_start,
        timezone,
        job_id,
    } = &mut config.scheduling
    {
        let job_config = serde_json::json!({ "vectorizer_id": id });
        let interval = schedule_interval.clone();
        let row = match (initial_start.as_deref(), timezone.as_deref()) {
            (Some(start), Some(tz)) => {
                tx.query_one(
                    "SELECT add_job('vectorizer._vectorizer_job'::regproc, $1::text::interval, \
                     config => $2, initial_start => $3::text::timestamptz, timezone => $4)",
                    &[&interval, &job_config, &start, &tz],
                )
                .await
            }
            (Some(start), None) => {
                tx.query_one(
                    "SELECT add_job('vectorizer._vectorizer_job'::regproc, $1::text::interval, \
                     config => $2, initial_start => $3::text::timestamptz)",
                    &[&interval, &job_config, &start],
                )
                .await
            }
            _ => {
                tx.query_one(
                    "SELECT add_job('vectorizer._vectorizer_job'::regproc, $1::text::interval, \
                     config => $2)",
                    &[&interval, &job_config],
                )
                .await
            }
        }
        .context("Failed to register scheduler job")?;
        let registered: i32 = row.try_get(0)?;
        *job_id = Some(registered as i64);
    }

    let source_pk_json = serde_json::to_value(&source_pk)?;
    let config_json = serde_json::to_value(&config)?;
    tx.execute(
        "INSERT INTO vectorizer.vectorizer \
         (id, source_schema, source_table, source_pk, target_schema, target_table, \
          view_schema, view_name, trigger_name, queue_schema, queue_table, config) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        &[
            &id,
            &request.source.schema,
            &request.source.name,
            &source_pk_json,
            &names.target.as_ref().map(|t| t.schema.clone()),
            &names.target.as_ref().map(|t| t.name.clone()),
            &names.view.as_ref().map(|v| v.schema.clone()),
            &names.view.as_ref().map(|v| v.name.clone()),
            &names.trigger_name,
            &names.queue.schema,
            &names.queue.name,
            &config_json,
        ],
    )
    .await
    .context("Failed to record vectorizer")?;

    if request.enqueue_existing {
        tx.batch_execute(&builder.enqueue_existing())
            .await
            .context("Failed to enqueue existing rows")?;
    }

    tx.commit()
        .await
        .context("Failed to commit provisioning transaction")?;

    log::info!("created vectorizer {} on {}", id, request.source);

    Ok(Vectorizer {
        id,
        source: request.source,
        source_pk,
        target: names.target,
        view: names.view,
        trigger_name: names.trigger_name,
        queue: names.queue,
        config,
    })
}

/// Tear down a vectorizer: scheduler job, trigger, queue, batch tables, and
/// the vectorizer row. The target table and view stay; they may hold data
/// the caller still wants.
pub async fn drop_vectorizer(session: &mut PgSession, id: i64) -> anyhow::Result<()> {
    let vectorizer = get_vectorizer(session, id)
        .await?
        .ok_or_else(|| anyhow!("vectorizer {} does not exist", id))?;

    if let SchedulingConfig::TimescaleDb {
        job_id: Some(job_id),
        ..
    } = &vectorizer.config.scheduling
    {
        let job = *job_id as i32;
        if let Err(e) = session
            .client()?
            .execute("SELECT delete_job($1)", &[&job])
            .await
        {
            log::warn!("failed to delete scheduler job {}: {}", job, e);
        }
    }

    let builder = vectorizer.sql_builder();
    let mut statements = vec![
        builder.drop_trigger(&vectorizer.trigger_name),
        builder.drop_trigger_function(&vectorizer.trigger_name),
        builder.drop_queue_table(),
    ];
    if matches!(
        vectorizer.config.embedding,
        EmbeddingConfig::OpenAi { use_batch_api: true, .. }
    ) {
        statements.extend(batch::drop_batch_tables_sql(id));
    }

    let tx = session
        .client_mut()?
        .transaction()
        .await
        .context("Failed to begin teardown transaction")?;
    for stmt in &statements {
        tx.batch_execute(stmt)
            .await
            .with_context(|| format!("Failed to execute: {}", stmt))?;
    }
    tx.execute("DELETE FROM vectorizer.vectorizer WHERE id = $1", &[&id])
        .await
        .context("Failed to delete vectorizer row")?;
    tx.commit()
        .await
        .context("Failed to commit teardown transaction")?;

    log::info!("dropped vectorizer {}", id);
    Ok(())
}

fn vectorizer_from_row(row: &tokio_postgres::Row) -> anyhow::Result<Vectorizer> {
    let id: i64 = row.try_get("id")?;
    let source = Relation::new(
        row.try_get::<_, String>("source_schema")?,
        row.try_get::<_, String>("source_table")?,
    );
    let source_pk = serde_json::from_value(row.try_get("source_pk")?)?;
    let target = match (
        row.try_get::<_, Option<String>>("target_schema")?,
        row.try_get::<_, Option<String>>("target_table")?,
    ) {
        (Some(schema), Some(name)) => Some(Relation::new(schema, name)),
        _ => None,
    };
    let view = match (
        row.try_get::<_, Option<String>>("view_schema")?,
        row.try_get::<_, Option<String>>("view_name")?,
    ) {
        (Some(schema), Some(name)) => Some(Relation::new(schema, name)),
        _ => None,
    };
    let config: VectorizerConfig = serde_json::from_value(row.try_get("config")?)
        .context("Failed to parse stored vectorizer config")?;

    Ok(Vectorizer {
        id,
        source,
        source_pk,
        target,
        view,
        trigger_name: row.try_get("trigger_name")?,
        queue: Relation::new(
            row.try_get::<_, String>("queue_schema")?,
            row.try_get::<_, String>("queue_table")?,
        ),
        config,
    })
}

const VECTORIZER_COLUMNS: &str = "id, source_schema, source_table, source_pk, \
     target_schema, target_table, view_schema, view_name, \
     trigger_name, queue_schema, queue_table, config";

pub async fn get_vectorizer(
    session: &PgSession,
    id: i64,
) -> anyhow::Result<Option<Vectorizer>> {
    let row = session
        .client()?
        .query_opt(
            &format!(
                "SELECT {} FROM {}.vectorizer WHERE id = $1",
                VECTORIZER_COLUMNS, INTERNAL_SCHEMA
            ),
            &[&id],
        )
        .await
        .context("Failed to load vectorizer")?;
    row.as_ref().map(vectorizer_from_row).transpose()
}

pub async fn list_vectorizers(session: &PgSession) -> anyhow::Result<Vec<Vectorizer>> {
    let rows = session
        .client()?
        .query(
            &format!(
                "SELECT {} FROM {}.vectorizer ORDER BY id",
                VECTORIZER_COLUMNS, INTERNAL_SCHEMA
            ),
            &[],
        )
        .await
        .context("Failed to list vectorizers")?;
    rows.iter().map(vectorizer_from_row).collect()
}

/// Re-enqueue every current source pk.
pub async fn enqueue_all(session: &PgSession, vectorizer: &Vectorizer) -> anyhow::Result<u64> {
    let builder = vectorizer.sql_builder();
    let client = session.client()?;
    let inserted = client
        .execute(&builder.enqueue_existing() as &str, &[])
        .await
        .context("Failed to enqueue source rows")?;
    Ok(inserted)
}

pub async fn queue_depth(session: &PgSession, vectorizer: &Vectorizer) -> anyhow::Result<i64> {
    let builder = vectorizer.sql_builder();
    let row = session
        .client()?
        .query_one(&builder.queue_depth() as &str, &[])
        .await
        .context("Failed to read queue depth")?;
    Ok(row.try_get(0)?)
}
