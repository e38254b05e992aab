use serde::{Deserialize, Serialize};

/// One column of a source table's primary key, in key order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PkColumn {
    /// Attribute number of the column in the source table.
    pub attnum: i16,
    /// Column name.
    pub attname: String,
    /// Column type name, used to cast text-encoded key values back.
    pub attype: String,
    /// 1-based position within the primary key.
    pub pknum: i16,
}

/// A column of the source table, as seen by config validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceColumn {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub ordinal_position: i32,
}

impl SourceColumn {
    /// Whether this column holds chunkable content (text-ish or raw bytes).
    pub fn is_textual(&self) -> bool {
        matches!(
            self.data_type.as_str(),
            "text" | "varchar" | "character varying" | "char" | "character" | "bpchar" | "bytea"
        )
    }

    pub fn is_bytea(&self) -> bool {
        self.data_type == "bytea"
    }
}

/// A schema-qualified relation name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relation {
    pub schema: String,
    pub name: String,
}

impl Relation {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Represents a database row as a map of column names to JSON values.
pub type Row = std::collections::HashMap<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, data_type: &str) -> SourceColumn {
        SourceColumn {
            name: name.to_string(),
            data_type: data_type.to_string(),
            is_nullable: true,
            ordinal_position: 1,
        }
    }

    #[test]
    fn test_textual_types() {
        assert!(col("body", "text").is_textual());
        assert!(col("body", "varchar").is_textual());
        assert!(col("body", "character varying").is_textual());
        assert!(col("body", "bpchar").is_textual());
        assert!(col("doc", "bytea").is_textual());
        assert!(!col("id", "integer").is_textual());
        assert!(!col("created_at", "timestamptz").is_textual());
    }

    #[test]
    fn test_bytea_detection() {
        assert!(col("doc", "bytea").is_bytea());
        assert!(!col("body", "text").is_bytea());
    }

    #[test]
    fn test_relation_display() {
        let rel = Relation::new("public", "blog");
        assert_eq!(rel.to_string(), "public.blog");
    }
}
