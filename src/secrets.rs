use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Errors from secret resolution.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret not found: {0}")]
    NotFound(String),
    #[error("permission denied for secret: {0}")]
    PermissionDenied(String),
    #[error("secret store error: {0}")]
    Store(String),
}

/// Resolves API keys and other secrets.
///
/// A literal always wins; otherwise the named secret is looked up, falling
/// back to the conventional default name. Implementations cache per session
/// so a worker does not re-query the store for every batch.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(
        &self,
        literal: Option<&str>,
        name: Option<&str>,
        default_name: &str,
    ) -> Result<String, SecretError>;
}

type CacheKey = (Option<String>, Option<String>, String);

fn cache_key(literal: Option<&str>, name: Option<&str>, default_name: &str) -> CacheKey {
    (
        literal.map(str::to_string),
        name.map(str::to_string),
        default_name.to_string(),
    )
}

// ── Environment resolver ────────────────────────────────────────────────

/// Resolves secrets from process environment variables.
#[derive(Default)]
pub struct EnvSecretResolver;

#[async_trait]
impl SecretResolver for EnvSecretResolver {
    async fn resolve(
        &self,
        literal: Option<&str>,
        name: Option<&str>,
        default_name: &str,
    ) -> Result<String, SecretError> {
        if let Some(literal) = literal {
            return Ok(literal.to_string());
        }
        let var = name.unwrap_or(default_name);
        std::env::var(var).map_err(|_| SecretError::NotFound(var.to_string()))
    }
}

// ── Database resolver ───────────────────────────────────────────────────

/// Resolves secrets through the database-side secret store.
///
/// `_secret_permissions(name, role)` gates access: the session may reveal a
/// secret iff current_user is a member of a granting role. Results are
/// cached in a per-session bag keyed by the full resolution triple.
pub struct PgSecretResolver {
    client: tokio_postgres::Client,
    cache: Mutex<HashMap<CacheKey, String>>,
}

impl PgSecretResolver {
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Open a dedicated connection for secret resolution.
    pub async fn connect(config: &crate::db::postgres::PgConfig) -> anyhow::Result<Self> {
        let (client, connection) =
            tokio_postgres::connect(&config.connection_string(), tokio_postgres::NoTls)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to connect secret resolver: {}", e))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::error!("secret resolver connection error: {}", e);
            }
        });
        Ok(Self::new(client))
    }

    async fn check_permission(&self, name: &str) -> Result<(), SecretError> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (\
                 SELECT 1 FROM vectorizer._secret_permissions p \
                 WHERE p.name = $1 \
                   AND pg_catalog.pg_has_role(current_user, p.role, 'member'))",
                &[&name],
            )
            .await
            .map_err(|e| SecretError::Store(e.to_string()))?;
        let allowed: bool = row
            .try_get(0)
            .map_err(|e| SecretError::Store(e.to_string()))?;
        if allowed {
            Ok(())
        } else {
            Err(SecretError::PermissionDenied(name.to_string()))
        }
    }
}

#[async_trait]
impl SecretResolver for PgSecretResolver {
    async fn resolve(
        &self,
        literal: Option<&str>,
        name: Option<&str>,
        default_name: &str,
    ) -> Result<String, SecretError> {
        if let Some(literal) = literal {
            return Ok(literal.to_string());
        }

        let key = cache_key(literal, name, default_name);
        {
            let cache = self.cache.lock().await;
            if let Some(value) = cache.get(&key) {
                return Ok(value.clone());
            }
        }

        let secret_name = name.unwrap_or(default_name);
        self.check_permission(secret_name).await?;

        let row = self
            .client
            .query_opt(
                "SELECT vectorizer.reveal_secret($1)",
                &[&secret_name],
            )
            .await
            .map_err(|e| SecretError::Store(e.to_string()))?;

        let value: Option<String> = match row {
            Some(row) => row.try_get(0).map_err(|e| SecretError::Store(e.to_string()))?,
            None => None,
        };
        let value = value.ok_or_else(|| SecretError::NotFound(secret_name.to_string()))?;

        let mut cache = self.cache.lock().await;
        cache.insert(key, value.clone());
        Ok(value)
    }
}

// ── In-memory resolver ──────────────────────────────────────────────────

/// In-memory secret resolver for testing purposes.
pub struct InMemorySecretResolver {
    entries: std::sync::Mutex<HashMap<String, String>>,
}

impl InMemorySecretResolver {
    pub fn new() -> Self {
        Self {
            entries: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self, name: &str, value: &str) {
        let mut entries = self.entries.lock().expect("secret store poisoned");
        entries.insert(name.to_string(), value.to_string());
    }
}

impl Default for InMemorySecretResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretResolver for InMemorySecretResolver {
    async fn resolve(
        &self,
        literal: Option<&str>,
        name: Option<&str>,
        default_name: &str,
    ) -> Result<String, SecretError> {
        if let Some(literal) = literal {
            return Ok(literal.to_string());
        }
        let key = name.unwrap_or(default_name);
        let entries = self.entries.lock().expect("secret store poisoned");
        entries
            .get(key)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_literal_wins() {
        let resolver = InMemorySecretResolver::new();
        resolver.store("MY_KEY", "stored");
        let value = resolver
            .resolve(Some("literal-key"), Some("MY_KEY"), "DEFAULT_KEY")
            .await
            .unwrap();
        assert_eq!(value, "literal-key");
    }

    #[tokio::test]
    async fn test_named_secret_resolved() {
        let resolver = InMemorySecretResolver::new();
        resolver.store("MY_KEY", "stored");
        let value = resolver
            .resolve(None, Some("MY_KEY"), "DEFAULT_KEY")
            .await
            .unwrap();
        assert_eq!(value, "stored");
    }

    #[tokio::test]
    async fn test_default_name_fallback() {
        let resolver = InMemorySecretResolver::new();
        resolver.store("DEFAULT_KEY", "fallback");
        let value = resolver.resolve(None, None, "DEFAULT_KEY").await.unwrap();
        assert_eq!(value, "fallback");
    }

    #[tokio::test]
    async fn test_missing_secret_errors() {
        let resolver = InMemorySecretResolver::new();
        let err = resolver.resolve(None, None, "NOPE").await.unwrap_err();
        assert!(matches!(err, SecretError::NotFound(name) if name == "NOPE"));
    }

    #[test]
    fn test_cache_key_distinguishes_triples() {
        assert_ne!(
            cache_key(None, Some("A"), "D"),
            cache_key(None, Some("B"), "D")
        );
        assert_ne!(cache_key(None, None, "D"), cache_key(None, Some("D"), "D"));
    }
}
