use anyhow::{anyhow, Context};
use tokio_postgres::{Client, NoTls};

use super::schema::{PkColumn, Relation, SourceColumn};

/// Connection configuration for the database holding the vectorizers.
#[derive(Debug, Clone)]
pub struct PgConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connection_string: Option<String>,
    pub connection_timeout_secs: u64,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            database: None,
            username: None,
            password: None,
            connection_string: None,
            connection_timeout_secs: 30,
        }
    }
}

impl PgConfig {
    pub fn from_url(url: &str) -> Self {
        Self {
            connection_string: Some(url.to_string()),
            ..Default::default()
        }
    }

    /// Build a connection string from the configured parts.
    pub fn connection_string(&self) -> String {
        if let Some(ref conn_str) = self.connection_string {
            return conn_str.clone();
        }

        let mut parts = Vec::new();

        if let Some(ref host) = self.host {
            parts.push(format!("host={}", host));
        } else {
            parts.push("host=localhost".to_string());
        }

        if let Some(port) = self.port {
            parts.push(format!("port={}", port));
        } else {
            parts.push("port=5432".to_string());
        }

        if let Some(ref db) = self.database {
            parts.push(format!("dbname={}", db));
        }

        if let Some(ref user) = self.username {
            parts.push(format!("user={}", user));
        }

        if let Some(ref pass) = self.password {
            parts.push(format!("password={}", pass));
        }

        parts.push(format!("connect_timeout={}", self.connection_timeout_secs));

        parts.join(" ")
    }
}

/// A live session against the vectorized database.
pub struct PgSession {
    config: PgConfig,
    client: Option<Client>,
}

impl PgSession {
    pub fn new(config: PgConfig) -> Self {
        Self {
            config,
            client: None,
        }
    }

    /// Connect and return a ready session.
    pub async fn open(config: PgConfig) -> anyhow::Result<Self> {
        let mut session = Self::new(config);
        session.connect().await?;
        Ok(session)
    }

    pub async fn connect(&mut self) -> anyhow::Result<()> {
        let conn_str = self.config.connection_string();

        let (client, connection) = tokio_postgres::connect(&conn_str, NoTls)
            .await
            .context("Failed to connect to PostgreSQL")?;

        // Spawn the connection handler in the background
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::error!("PostgreSQL connection error: {}", e);
            }
        });

        self.client = Some(client);
        Ok(())
    }

    /// Get a reference to the connected client, or return an error
    pub fn client(&self) -> anyhow::Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| anyhow!("Not connected to PostgreSQL"))
    }

    /// Mutable client access, needed to open transactions.
    pub fn client_mut(&mut self) -> anyhow::Result<&mut Client> {
        self.client
            .as_mut()
            .ok_or_else(|| anyhow!("Not connected to PostgreSQL"))
    }

    pub async fn is_connected(&self) -> bool {
        if let Some(ref client) = self.client {
            client.simple_query("SELECT 1").await.is_ok()
        } else {
            false
        }
    }

    pub fn config(&self) -> &PgConfig {
        &self.config
    }

    // ── Introspection ───────────────────────────────────────────────────

    /// Derive the source table's primary key, preserving key order.
    pub async fn source_pk(&self, rel: &Relation) -> anyhow::Result<Vec<PkColumn>> {
        let client = self.client()?;

        let rows = client
            .query(
                "SELECT a.attnum, a.attname, \
                        format_type(a.atttypid, a.atttypmod) AS attype, \
                        k.ord::int2 AS pknum \
                 FROM pg_catalog.pg_class c \
                 JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                 JOIN pg_catalog.pg_index i ON i.indrelid = c.oid AND i.indisprimary \
                 CROSS JOIN LATERAL unnest(i.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord) \
                 JOIN pg_catalog.pg_attribute a \
                   ON a.attrelid = c.oid AND a.attnum = k.attnum \
                 WHERE n.nspname = $1 AND c.relname = $2 \
                 ORDER BY k.ord",
                &[&rel.schema, &rel.name],
            )
            .await
            .context("Failed to query primary key")?;

        let mut pk = Vec::new();
        for row in &rows {
            pk.push(PkColumn {
                attnum: row.try_get(0)?,
                attname: row.try_get(1)?,
                attype: row.try_get(2)?,
                pknum: row.try_get(3)?,
            });
        }
        Ok(pk)
    }

    /// Column names and types, for config validation.
    pub async fn source_columns(&self, rel: &Relation) -> anyhow::Result<Vec<SourceColumn>> {
        let client = self.client()?;

        let rows = client
            .query(
                "SELECT column_name, udt_name, is_nullable, ordinal_position::int4 \
                 FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 \
                 ORDER BY ordinal_position",
                &[&rel.schema, &rel.name],
            )
            .await
            .context("Failed to query columns")?;

        let mut columns = Vec::new();
        for row in &rows {
            let nullable: String = row.try_get(2)?;
            columns.push(SourceColumn {
                name: row.try_get(0)?,
                data_type: row.try_get(1)?,
                is_nullable: nullable == "YES",
                ordinal_position: row.try_get(3)?,
            });
        }
        Ok(columns)
    }

    pub async fn relation_exists(&self, rel: &Relation) -> anyhow::Result<bool> {
        let client = self.client()?;
        let row = client
            .query_one(
                "SELECT EXISTS (\
                 SELECT 1 FROM pg_catalog.pg_class c \
                 JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                 WHERE n.nspname = $1 AND c.relname = $2)",
                &[&rel.schema, &rel.name],
            )
            .await
            .context("Failed to check relation existence")?;
        Ok(row.try_get(0)?)
    }

    /// Whether the current session user owns the relation.
    pub async fn is_owner(&self, rel: &Relation) -> anyhow::Result<bool> {
        let client = self.client()?;
        let row = client
            .query_one(
                "SELECT pg_catalog.pg_get_userbyid(c.relowner) = current_user \
                 FROM pg_catalog.pg_class c \
                 JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                 WHERE n.nspname = $1 AND c.relname = $2",
                &[&rel.schema, &rel.name],
            )
            .await
            .context("Failed to check relation ownership")?;
        Ok(row.try_get(0)?)
    }

    pub async fn role_exists(&self, role: &str) -> anyhow::Result<bool> {
        let client = self.client()?;
        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_roles WHERE rolname = $1)",
                &[&role],
            )
            .await
            .context("Failed to check role existence")?;
        Ok(row.try_get(0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_string_from_params() {
        let config = PgConfig {
            host: Some("myhost".to_string()),
            port: Some(5433),
            database: Some("mydb".to_string()),
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            ..Default::default()
        };
        let conn_str = config.connection_string();
        assert!(conn_str.contains("host=myhost"));
        assert!(conn_str.contains("port=5433"));
        assert!(conn_str.contains("dbname=mydb"));
        assert!(conn_str.contains("user=user"));
        assert!(conn_str.contains("password=pass"));
    }

    #[test]
    fn test_connection_string_defaults() {
        let config = PgConfig::default();
        let conn_str = config.connection_string();
        assert!(conn_str.contains("host=localhost"));
        assert!(conn_str.contains("port=5432"));
        assert!(conn_str.contains("connect_timeout=30"));
    }

    #[test]
    fn test_connection_string_from_raw() {
        let config = PgConfig::from_url("host=myhost port=5432 dbname=mydb");
        assert_eq!(config.connection_string(), "host=myhost port=5432 dbname=mydb");
    }

    #[test]
    fn test_not_connected_by_default() {
        let session = PgSession::new(PgConfig::default());
        assert!(session.client.is_none());
    }
}
