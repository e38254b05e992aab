pub mod provision;

use serde::{Deserialize, Serialize};

use crate::config::{DestinationConfig, VectorizerConfig};
use crate::db::schema::{PkColumn, Relation};
use crate::db::sql::SqlBuilder;

/// Schema holding queue tables and all vectorizer metadata.
pub const INTERNAL_SCHEMA: &str = "vectorizer";

/// One source-table → embedding-table mapping with its configured pipeline.
/// Immutable once created; physical objects exist iff the row does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vectorizer {
    pub id: i64,
    pub source: Relation,
    pub source_pk: Vec<PkColumn>,
    /// Absent for destination=source, which embeds into a source column.
    pub target: Option<Relation>,
    pub view: Option<Relation>,
    pub trigger_name: String,
    pub queue: Relation,
    pub config: VectorizerConfig,
}

impl Vectorizer {
    pub fn sql_builder(&self) -> SqlBuilder {
        SqlBuilder::new(
            self.source.clone(),
            self.queue.clone(),
            self.target.clone(),
            self.source_pk.clone(),
        )
    }
}

/// Object names derived for a new vectorizer.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorizerNames {
    pub target: Option<Relation>,
    pub view: Option<Relation>,
    pub queue: Relation,
    pub trigger_name: String,
}

/// Derive default object names from the id, destination config, and source.
pub fn derive_names(
    id: i64,
    source: &Relation,
    destination: &DestinationConfig,
) -> VectorizerNames {
    let queue = Relation::new(INTERNAL_SCHEMA, format!("_vectorizer_q_{}", id));
    let trigger_name = format!("_vectorizer_tr_{}", id);

    let (target, view) = match destination {
        DestinationConfig::Default => (
            Some(Relation::new(
                source.schema.clone(),
                format!("{}_embedding_store", source.name),
            )),
            Some(Relation::new(
                source.schema.clone(),
                format!("{}_embedding", source.name),
            )),
        ),
        DestinationConfig::Custom {
            target_schema,
            target_table,
            view_schema,
            view_name,
        } => {
            let target_schema = target_schema.clone().unwrap_or_else(|| source.schema.clone());
            let view_schema = view_schema.clone().unwrap_or_else(|| source.schema.clone());
            let view_name = view_name
                .clone()
                .unwrap_or_else(|| format!("{}_embedding", source.name));
            (
                Some(Relation::new(target_schema, target_table.clone())),
                Some(Relation::new(view_schema, view_name)),
            )
        }
        DestinationConfig::Source { .. } => (None, None),
    };

    VectorizerNames {
        target,
        view,
        queue,
        trigger_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> Relation {
        Relation::new("public", "blog")
    }

    #[test]
    fn test_default_names() {
        let names = derive_names(7, &source(), &DestinationConfig::Default);
        assert_eq!(names.queue, Relation::new("vectorizer", "_vectorizer_q_7"));
        assert_eq!(names.trigger_name, "_vectorizer_tr_7");
        assert_eq!(
            names.target,
            Some(Relation::new("public", "blog_embedding_store"))
        );
        assert_eq!(names.view, Some(Relation::new("public", "blog_embedding")));
    }

    #[test]
    fn test_custom_names() {
        let destination = DestinationConfig::Custom {
            target_schema: Some("emb".to_string()),
            target_table: "blog_vectors".to_string(),
            view_schema: None,
            view_name: None,
        };
        let names = derive_names(3, &source(), &destination);
        assert_eq!(names.target, Some(Relation::new("emb", "blog_vectors")));
        assert_eq!(names.view, Some(Relation::new("public", "blog_embedding")));
    }

    #[test]
    fn test_source_destination_has_no_target() {
        let destination = DestinationConfig::Source {
            embedding_column: "embedding".to_string(),
        };
        let names = derive_names(4, &source(), &destination);
        assert!(names.target.is_none());
        assert!(names.view.is_none());
        assert_eq!(names.queue.name, "_vectorizer_q_4");
    }
}
