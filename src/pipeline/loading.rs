use thiserror::Error;

use crate::config::LoadingConfig;
use crate::db::schema::Row;
use crate::pipeline::parsing::Payload;

/// Deterministic data errors: the row is consumed, not retried.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("column '{0}' is null")]
    NullPayload(String),
    #[error("column '{0}' holds a non-text value")]
    NotText(String),
    #[error("column '{0}' holds malformed binary data")]
    BadBinary(String),
    #[error("failed to read document '{uri}': {message}")]
    Document { uri: String, message: String },
}

/// Load the payload for one source row.
///
/// loading=row reads the payload column directly; loading=document treats
/// the column value as a file path or URL and fetches its content.
pub async fn load(
    config: &LoadingConfig,
    row: &Row,
    payload_column: &str,
    column_is_bytea: bool,
    http: &reqwest::Client,
) -> Result<Payload, LoadError> {
    match config {
        LoadingConfig::Row => {
            let value = column_text(row, payload_column)?;
            if column_is_bytea {
                Ok(Payload::Bytes(decode_bytea(&value, payload_column)?))
            } else {
                Ok(Payload::Text(value))
            }
        }
        LoadingConfig::Document { column_name } => {
            let uri = column_text(row, column_name)?;
            load_document(&uri, http).await
        }
    }
}

fn column_text(row: &Row, column: &str) -> Result<String, LoadError> {
    match row.get(column) {
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(serde_json::Value::Null) | None => Err(LoadError::NullPayload(column.to_string())),
        Some(_) => Err(LoadError::NotText(column.to_string())),
    }
}

/// bytea values arrive from `to_jsonb` hex-encoded as `\x…`.
fn decode_bytea(value: &str, column: &str) -> Result<Vec<u8>, LoadError> {
    let hex = value
        .strip_prefix("\\x")
        .ok_or_else(|| LoadError::BadBinary(column.to_string()))?;
    if hex.len() % 2 != 0 {
        return Err(LoadError::BadBinary(column.to_string()));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| LoadError::BadBinary(column.to_string()))
        })
        .collect()
}

async fn load_document(uri: &str, http: &reqwest::Client) -> Result<Payload, LoadError> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        let response = http
            .get(uri)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| LoadError::Document {
                uri: uri.to_string(),
                message: e.to_string(),
            })?;
        let bytes = response.bytes().await.map_err(|e| LoadError::Document {
            uri: uri.to_string(),
            message: e.to_string(),
        })?;
        Ok(Payload::Bytes(bytes.to_vec()))
    } else {
        let bytes = tokio::fs::read(uri).await.map_err(|e| LoadError::Document {
            uri: uri.to_string(),
            message: e.to_string(),
        })?;
        Ok(Payload::Bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_row_loading_reads_text_column() {
        let http = reqwest::Client::new();
        let r = row(&[("body", json!("some text"))]);
        let payload = load(&LoadingConfig::Row, &r, "body", false, &http)
            .await
            .unwrap();
        assert_eq!(payload, Payload::Text("some text".to_string()));
    }

    #[tokio::test]
    async fn test_null_column_is_data_error() {
        let http = reqwest::Client::new();
        let r = row(&[("body", json!(null))]);
        let err = load(&LoadingConfig::Row, &r, "body", false, &http)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::NullPayload(_)));
    }

    #[tokio::test]
    async fn test_bytea_column_decodes_hex() {
        let http = reqwest::Client::new();
        let r = row(&[("doc", json!("\\x68656c6c6f"))]);
        let payload = load(&LoadingConfig::Row, &r, "doc", true, &http)
            .await
            .unwrap();
        assert_eq!(payload, Payload::Bytes(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_malformed_bytea_is_data_error() {
        let http = reqwest::Client::new();
        let r = row(&[("doc", json!("not-hex"))]);
        let err = load(&LoadingConfig::Row, &r, "doc", true, &http)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::BadBinary(_)));
    }

    #[tokio::test]
    async fn test_document_loading_reads_file() {
        let http = reqwest::Client::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        std::fs::write(&path, b"file content").unwrap();

        let r = row(&[("uri", json!(path.to_str().unwrap()))]);
        let config = LoadingConfig::Document {
            column_name: "uri".to_string(),
        };
        let payload = load(&config, &r, "uri", false, &http).await.unwrap();
        assert_eq!(payload, Payload::Bytes(b"file content".to_vec()));
    }

    #[tokio::test]
    async fn test_missing_document_is_data_error() {
        let http = reqwest::Client::new();
        let r = row(&[("uri", json!("/definitely/not/here.txt"))]);
        let config = LoadingConfig::Document {
            column_name: "uri".to_string(),
        };
        let err = load(&config, &r, "uri", false, &http).await.unwrap_err();
        assert!(matches!(err, LoadError::Document { .. }));
    }
}
