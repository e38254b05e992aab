use thiserror::Error;
use tokio::process::Command;

use crate::config::ParsingConfig;

/// A loaded payload before parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
}

/// Deterministic data errors: the row is consumed, not retried.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("payload is binary but parsing is 'none'")]
    BinaryWithoutParser,
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("payload is not a PDF document")]
    NotPdf,
    #[error("pdf text extraction failed: {0}")]
    PdfExtraction(String),
}

const PDF_MAGIC: &[u8] = b"%PDF";

/// Turn a loaded payload into chunkable text according to the parsing config.
pub async fn parse(config: &ParsingConfig, payload: Payload) -> Result<String, ParseError> {
    match (config, payload) {
        (ParsingConfig::None, Payload::Text(text)) => Ok(text),
        (ParsingConfig::None, Payload::Bytes(_)) => Err(ParseError::BinaryWithoutParser),
        (ParsingConfig::Auto, Payload::Text(text)) => Ok(text),
        (ParsingConfig::Auto, Payload::Bytes(bytes)) => {
            if bytes.starts_with(PDF_MAGIC) {
                extract_pdf_text(&bytes).await
            } else {
                String::from_utf8(bytes).map_err(|_| ParseError::NotUtf8)
            }
        }
        (ParsingConfig::PyMuPdf, Payload::Bytes(bytes)) => {
            if bytes.starts_with(PDF_MAGIC) {
                extract_pdf_text(&bytes).await
            } else {
                Err(ParseError::NotPdf)
            }
        }
        (ParsingConfig::PyMuPdf, Payload::Text(_)) => Err(ParseError::NotPdf),
    }
}

/// Extract text from PDF bytes with the external `pdftotext` tool.
async fn extract_pdf_text(bytes: &[u8]) -> Result<String, ParseError> {
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let pdf_path = std::env::temp_dir().join(format!(
        "vectorizer_{}_{}.pdf",
        std::process::id(),
        stamp
    ));

    tokio::fs::write(&pdf_path, bytes)
        .await
        .map_err(|e| ParseError::PdfExtraction(e.to_string()))?;

    let output = Command::new("pdftotext")
        .arg(&pdf_path)
        .arg("-")
        .output()
        .await;

    let _ = tokio::fs::remove_file(&pdf_path).await;

    let output = output.map_err(|e| {
        ParseError::PdfExtraction(format!("failed to execute pdftotext: {}", e))
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ParseError::PdfExtraction(format!(
            "pdftotext returned non-zero exit status: {}",
            stderr.trim()
        )));
    }

    String::from_utf8(output.stdout).map_err(|_| ParseError::NotUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_none_passes_text_through() {
        let text = parse(&ParsingConfig::None, Payload::Text("hello".into()))
            .await
            .unwrap();
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn test_none_rejects_bytes() {
        let err = parse(&ParsingConfig::None, Payload::Bytes(vec![0, 1, 2]))
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::BinaryWithoutParser));
    }

    #[tokio::test]
    async fn test_auto_decodes_utf8_bytes() {
        let text = parse(&ParsingConfig::Auto, Payload::Bytes(b"plain text".to_vec()))
            .await
            .unwrap();
        assert_eq!(text, "plain text");
    }

    #[tokio::test]
    async fn test_auto_rejects_invalid_utf8() {
        let err = parse(&ParsingConfig::Auto, Payload::Bytes(vec![0xff, 0xfe]))
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::NotUtf8));
    }

    #[tokio::test]
    async fn test_pdf_parser_rejects_non_pdf() {
        let err = parse(&ParsingConfig::PyMuPdf, Payload::Bytes(b"not a pdf".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::NotPdf));

        let err = parse(&ParsingConfig::PyMuPdf, Payload::Text("text".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::NotPdf));
    }
}
