use anyhow::Context;

use super::postgres::PgSession;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Apply the metadata schema. Safe to re-run; every statement is idempotent.
pub async fn install(session: &PgSession) -> anyhow::Result<()> {
    session
        .client()?
        .batch_execute(SCHEMA_SQL)
        .await
        .context("Failed to apply metadata schema")?;
    log::info!("vectorizer metadata schema installed");
    Ok(())
}
