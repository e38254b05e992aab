use async_trait::async_trait;

use crate::db::postgres::PgSession;

/// Result of planning a candidate statement.
#[derive(Debug, Clone, Default)]
pub struct Validation {
    pub valid: bool,
    pub error: Option<String>,
    pub query_plan: Option<serde_json::Value>,
    pub est_cost: Option<f64>,
    pub est_rows: Option<f64>,
}

/// Plans a candidate SQL statement without executing it.
#[async_trait]
pub trait StatementValidator: Send + Sync {
    async fn explain(&self, sql: &str, search_path: &str) -> anyhow::Result<Validation>;
}

/// EXPLAIN-based validator: plans the statement in JSON mode under the
/// supplied search path, inside a transaction that always rolls back, so no
/// side effects can escape even for DML.
pub struct PgStatementValidator {
    session: PgSession,
}

impl PgStatementValidator {
    pub fn new(session: PgSession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl StatementValidator for PgStatementValidator {
    async fn explain(&self, sql: &str, search_path: &str) -> anyhow::Result<Validation> {
        let client = self.session.client()?;

        client.batch_execute("BEGIN").await?;
        let result = plan_statement(client, sql, search_path).await;
        client.batch_execute("ROLLBACK").await?;
        result
    }
}

async fn plan_statement(
    client: &tokio_postgres::Client,
    sql: &str,
    search_path: &str,
) -> anyhow::Result<Validation> {
    if let Err(e) = client
        .execute(
            "SELECT pg_catalog.set_config('search_path', $1, true)",
            &[&search_path],
        )
        .await
    {
        return Ok(Validation {
            valid: false,
            error: Some(e.to_string()),
            ..Default::default()
        });
    }

    // The extended protocol plans exactly one statement, so a trailing
    // ";DROP ..." cannot ride along.
    let explain = format!("EXPLAIN (FORMAT JSON) {}", sql);
    match client.query_one(&explain as &str, &[]).await {
        Ok(row) => {
            let plan: serde_json::Value = row.try_get(0)?;
            let (est_cost, est_rows) = plan_estimates(&plan);
            Ok(Validation {
                valid: true,
                error: None,
                query_plan: Some(plan),
                est_cost,
                est_rows,
            })
        }
        Err(e) => {
            let message = e
                .as_db_error()
                .map(|db| db.message().to_string())
                .unwrap_or_else(|| e.to_string());
            Ok(Validation {
                valid: false,
                error: Some(message),
                ..Default::default()
            })
        }
    }
}

/// Pull `Total Cost` and `Plan Rows` off the top plan node.
fn plan_estimates(plan: &serde_json::Value) -> (Option<f64>, Option<f64>) {
    let node = &plan[0]["Plan"];
    (node["Total Cost"].as_f64(), node["Plan Rows"].as_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_estimates() {
        let plan = serde_json::json!([
            {"Plan": {"Node Type": "Seq Scan", "Total Cost": 35.5, "Plan Rows": 1200}}
        ]);
        let (cost, rows) = plan_estimates(&plan);
        assert_eq!(cost, Some(35.5));
        assert_eq!(rows, Some(1200.0));
    }

    #[test]
    fn test_plan_estimates_missing() {
        let (cost, rows) = plan_estimates(&serde_json::json!([]));
        assert_eq!(cost, None);
        assert_eq!(rows, None);
    }
}
