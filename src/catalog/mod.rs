use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio_postgres::Client;

use crate::db::sql::vector_literal;
use crate::providers::{EmbedOptions, EmbeddingProvider};

/// A described database object. `(objtype, objnames, objargs)` is the stable
/// identity; `(classid, objid, objsubid)` mirrors the database's current
/// identification of the same object and is kept in sync through DDL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogObject {
    pub id: i64,
    pub objtype: String,
    pub objnames: Vec<String>,
    pub objargs: Vec<String>,
    pub classid: u32,
    pub objid: u32,
    pub objsubid: i32,
    pub description: String,
}

impl CatalogObject {
    /// Column rows identify as `[schema, relation, attname]`.
    pub fn is_column(&self) -> bool {
        self.objsubid != 0
    }

    pub fn display_name(&self) -> String {
        self.objnames.join(".")
    }
}

/// An example SQL statement with its description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlExample {
    pub id: i64,
    pub sql: String,
    pub description: String,
}

const OBJ_COLUMNS: &str =
    "id, objtype, objnames, objargs, classid, objid, objsubid, description";

fn object_from_row(row: &tokio_postgres::Row) -> anyhow::Result<CatalogObject> {
    Ok(CatalogObject {
        id: row.try_get(0)?,
        objtype: row.try_get(1)?,
        objnames: row.try_get(2)?,
        objargs: row.try_get(3)?,
        classid: row.try_get(4)?,
        objid: row.try_get(5)?,
        objsubid: row.try_get(6)?,
        description: row.try_get(7)?,
    })
}

// ── Writes ──────────────────────────────────────────────────────────────

/// Set (or, with None, remove) the description for an object addressed by
/// oids. The identity triple is resolved through the database's own
/// object-identification routine and upserted on that key.
pub async fn set_description(
    client: &Client,
    classid: u32,
    objid: u32,
    objsubid: i32,
    description: Option<&str>,
) -> anyhow::Result<()> {
    let description = match description {
        None | Some("") => {
            client
                .execute(
                    "DELETE FROM vectorizer.semantic_catalog_obj \
                     WHERE classid = $1 AND objid = $2 AND objsubid = $3",
                    &[&classid, &objid, &objsubid],
                )
                .await
                .context("Failed to delete object description")?;
            return Ok(());
        }
        Some(description) => description,
    };

    let row = client
        .query_one(
            "SELECT type, object_names, object_args \
             FROM pg_catalog.pg_identify_object_as_address($1, $2, $3)",
            &[&classid, &objid, &objsubid],
        )
        .await
        .context("Failed to identify object")?;
    let objtype: String = row.try_get(0)?;
    let objnames: Vec<String> = row.try_get(1)?;
    let objargs: Vec<String> = row.try_get(2)?;

    client
        .execute(
            "INSERT INTO vectorizer.semantic_catalog_obj \
             (objtype, objnames, objargs, classid, objid, objsubid, description) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (objtype, objnames, objargs) DO UPDATE SET \
             classid = excluded.classid, objid = excluded.objid, \
             objsubid = excluded.objsubid, description = excluded.description, \
             embedding = NULL",
            &[
                &objtype,
                &objnames,
                &objargs,
                &classid,
                &objid,
                &objsubid,
                &description,
            ],
        )
        .await
        .context("Failed to upsert object description")?;
    Ok(())
}

pub async fn add_sql_example(
    client: &Client,
    sql: &str,
    description: &str,
) -> anyhow::Result<i64> {
    let row = client
        .query_one(
            "INSERT INTO vectorizer.semantic_catalog_sql (sql, description) \
             VALUES ($1, $2) RETURNING id",
            &[&sql, &description],
        )
        .await
        .context("Failed to add sql example")?;
    Ok(row.try_get(0)?)
}

pub async fn delete_sql_example(client: &Client, id: i64) -> anyhow::Result<()> {
    client
        .execute(
            "DELETE FROM vectorizer.semantic_catalog_sql WHERE id = $1",
            &[&id],
        )
        .await
        .context("Failed to delete sql example")?;
    Ok(())
}

// ── Embedding maintenance ───────────────────────────────────────────────

/// Embed every catalog row that is missing its embedding. Returns how many
/// rows were embedded.
pub async fn embed_pending(
    client: &Client,
    provider: &dyn EmbeddingProvider,
    model: &str,
    options: &EmbedOptions,
) -> anyhow::Result<usize> {
    let mut embedded = 0usize;

    let rows = client
        .query(
            "SELECT id, description FROM vectorizer.semantic_catalog_obj \
             WHERE embedding IS NULL ORDER BY id",
            &[],
        )
        .await
        .context("Failed to list unembedded objects")?;
    if !rows.is_empty() {
        let texts: Vec<String> = rows
            .iter()
            .map(|r| r.try_get::<_, String>(1))
            .collect::<Result<_, _>>()?;
        let embeddings = provider
            .embed(model, &texts, options)
            .await
            .map_err(anyhow::Error::new)?;
        for (row, embedding) in rows.iter().zip(embeddings) {
            let id: i64 = row.try_get(0)?;
            client
                .execute(
                    "UPDATE vectorizer.semantic_catalog_obj \
                     SET embedding = $1::text::vector WHERE id = $2",
                    &[&vector_literal(&embedding.vector), &id],
                )
                .await
                .context("Failed to store object embedding")?;
            embedded += 1;
        }
    }

    let rows = client
        .query(
            "SELECT id, sql, description FROM vectorizer.semantic_catalog_sql \
             WHERE embedding IS NULL ORDER BY id",
            &[],
        )
        .await
        .context("Failed to list unembedded sql examples")?;
    if !rows.is_empty() {
        let texts: Vec<String> = rows
            .iter()
            .map(|r| {
                Ok(format!(
                    "{}\n\n{}",
                    r.try_get::<_, String>(2)?,
                    r.try_get::<_, String>(1)?
                ))
            })
            .collect::<anyhow::Result<_>>()?;
        let embeddings = provider
            .embed(model, &texts, options)
            .await
            .map_err(anyhow::Error::new)?;
        for (row, embedding) in rows.iter().zip(embeddings) {
            let id: i64 = row.try_get(0)?;
            client
                .execute(
                    "UPDATE vectorizer.semantic_catalog_sql \
                     SET embedding = $1::text::vector WHERE id = $2",
                    &[&vector_literal(&embedding.vector), &id],
                )
                .await
                .context("Failed to store sql embedding")?;
            embedded += 1;
        }
    }

    Ok(embedded)
}

// ── Search ──────────────────────────────────────────────────────────────

/// Nearest objects by cosine distance. Column hits are promoted to their
/// owning relation, deduplicated by id.
pub async fn search_objects(
    client: &Client,
    vector: &[f32],
    limit: i64,
    max_dist: Option<f64>,
) -> anyhow::Result<Vec<CatalogObject>> {
    let literal = vector_literal(vector);
    let rows = match max_dist {
        Some(max_dist) => {
            client
                .query(
                    &format!(
                        "SELECT {} FROM vectorizer.semantic_catalog_obj \
                         WHERE embedding IS NOT NULL \
                           AND embedding <=> $1::text::vector < $2 \
                         ORDER BY embedding <=> $1::text::vector LIMIT $3",
                        OBJ_COLUMNS
                    ),
                    &[&literal, &max_dist, &limit],
                )
                .await
        }
        None => {
            client
                .query(
                    &format!(
                        "SELECT {} FROM vectorizer.semantic_catalog_obj \
                         WHERE embedding IS NOT NULL \
                         ORDER BY embedding <=> $1::text::vector LIMIT $2",
                        OBJ_COLUMNS
                    ),
                    &[&literal, &limit],
                )
                .await
        }
    }
    .context("Failed to search catalog objects")?;

    let mut results: Vec<CatalogObject> = Vec::new();
    for row in &rows {
        let object = object_from_row(row)?;
        let promoted = if object.is_column() {
            match owning_relation(client, object.classid, object.objid).await? {
                Some(parent) => parent,
                None => object,
            }
        } else {
            object
        };
        if !results.iter().any(|o| o.id == promoted.id) {
            results.push(promoted);
        }
    }
    Ok(results)
}

/// The catalog row for a column's owning table or view, if described.
async fn owning_relation(
    client: &Client,
    classid: u32,
    objid: u32,
) -> anyhow::Result<Option<CatalogObject>> {
    let row = client
        .query_opt(
            &format!(
                "SELECT {} FROM vectorizer.semantic_catalog_obj \
                 WHERE classid = $1 AND objid = $2 AND objsubid = 0",
                OBJ_COLUMNS
            ),
            &[&classid, &objid],
        )
        .await
        .context("Failed to look up owning relation")?;
    row.as_ref().map(object_from_row).transpose()
}

pub async fn search_sql(
    client: &Client,
    vector: &[f32],
    limit: i64,
    max_dist: Option<f64>,
) -> anyhow::Result<Vec<SqlExample>> {
    let literal = vector_literal(vector);
    let rows = match max_dist {
        Some(max_dist) => {
            client
                .query(
                    "SELECT id, sql, description FROM vectorizer.semantic_catalog_sql \
                     WHERE embedding IS NOT NULL \
                       AND embedding <=> $1::text::vector < $2 \
                     ORDER BY embedding <=> $1::text::vector LIMIT $3",
                    &[&literal, &max_dist, &limit],
                )
                .await
        }
        None => {
            client
                .query(
                    "SELECT id, sql, description FROM vectorizer.semantic_catalog_sql \
                     WHERE embedding IS NOT NULL \
                     ORDER BY embedding <=> $1::text::vector LIMIT $2",
                    &[&literal, &limit],
                )
                .await
        }
    }
    .context("Failed to search sql examples")?;

    rows.iter()
        .map(|row| {
            Ok(SqlExample {
                id: row.try_get(0)?,
                sql: row.try_get(1)?,
                description: row.try_get(2)?,
            })
        })
        .collect()
}

/// Every top-level object (objsubid = 0).
pub async fn top_level_objects(client: &Client) -> anyhow::Result<Vec<CatalogObject>> {
    let rows = client
        .query(
            &format!(
                "SELECT {} FROM vectorizer.semantic_catalog_obj \
                 WHERE objsubid = 0 ORDER BY id",
                OBJ_COLUMNS
            ),
            &[],
        )
        .await
        .context("Failed to list catalog objects")?;
    rows.iter().map(object_from_row).collect()
}

pub async fn objects_by_ids(
    client: &Client,
    ids: &[i64],
) -> anyhow::Result<Vec<CatalogObject>> {
    let rows = client
        .query(
            &format!(
                "SELECT {} FROM vectorizer.semantic_catalog_obj \
                 WHERE id = ANY($1) ORDER BY id",
                OBJ_COLUMNS
            ),
            &[&ids],
        )
        .await
        .context("Failed to load catalog objects")?;
    rows.iter().map(object_from_row).collect()
}

/// Column rows belonging to a relation, in attnum order.
pub async fn columns_of(
    client: &Client,
    classid: u32,
    objid: u32,
) -> anyhow::Result<Vec<CatalogObject>> {
    let rows = client
        .query(
            &format!(
                "SELECT {} FROM vectorizer.semantic_catalog_obj \
                 WHERE classid = $1 AND objid = $2 AND objsubid <> 0 \
                 ORDER BY objsubid",
                OBJ_COLUMNS
            ),
            &[&classid, &objid],
        )
        .await
        .context("Failed to load column descriptions")?;
    rows.iter().map(object_from_row).collect()
}

// ── Identity maintenance ────────────────────────────────────────────────

/// A dropped object, as reported by the drop hook.
#[derive(Debug, Clone)]
pub struct DroppedObject {
    pub objtype: String,
    pub objnames: Vec<String>,
    pub objargs: Vec<String>,
    pub classid: u32,
    pub objid: u32,
}

const RELATION_TYPES: &[&str] = &["table", "view", "materialized view", "foreign table"];

/// Drop hook: delete rows whose identity matches a dropped object; dropped
/// relations also take their column rows with them.
pub async fn handle_object_drops(
    client: &Client,
    dropped: &[DroppedObject],
) -> anyhow::Result<()> {
    for object in dropped {
        client
            .execute(
                "DELETE FROM vectorizer.semantic_catalog_obj \
                 WHERE objtype = $1 AND objnames = $2 AND objargs = $3",
                &[&object.objtype, &object.objnames, &object.objargs],
            )
            .await
            .context("Failed to delete dropped object")?;

        if RELATION_TYPES.contains(&object.objtype.as_str()) {
            client
                .execute(
                    "DELETE FROM vectorizer.semantic_catalog_obj \
                     WHERE classid = $1 AND objid = $2",
                    &[&object.classid, &object.objid],
                )
                .await
                .context("Failed to delete dropped relation columns")?;
        }
    }
    Ok(())
}

/// An object touched by a DDL command, as reported by the ddl-end hook.
#[derive(Debug, Clone)]
pub struct TouchedObject {
    pub classid: u32,
    pub objid: u32,
    pub objsubid: i32,
    pub object_type: String,
}

/// DDL-end hook: re-resolve each touched object's identity from its oids and
/// write it back if it changed. Schema renames cascade to everything the
/// schema contains; touched relations cascade to their column rows.
pub async fn handle_ddl_end(client: &Client, touched: &[TouchedObject]) -> anyhow::Result<()> {
    for object in touched {
        if object.object_type == "schema" {
            resync_schema(client, object.objid).await?;
            continue;
        }

        resync_object(client, object.classid, object.objid, object.objsubid).await?;

        if RELATION_TYPES.contains(&object.object_type.as_str()) {
            resync_columns(client, object.classid, object.objid).await?;
        }
    }
    Ok(())
}

/// Re-resolve one row's identity from `(classid, objid, objsubid)`.
async fn resync_object(
    client: &Client,
    classid: u32,
    objid: u32,
    objsubid: i32,
) -> anyhow::Result<()> {
    client
        .execute(
            "UPDATE vectorizer.semantic_catalog_obj c SET \
             objtype = a.type, objnames = a.object_names, objargs = a.object_args \
             FROM pg_catalog.pg_identify_object_as_address($1, $2, $3) a \
             WHERE c.classid = $1 AND c.objid = $2 AND c.objsubid = $3 \
               AND (c.objtype <> a.type \
                    OR c.objnames <> a.object_names \
                    OR c.objargs <> a.object_args)",
            &[&classid, &objid, &objsubid],
        )
        .await
        .context("Failed to resync object identity")?;
    Ok(())
}

/// Re-resolve every column row of a relation.
async fn resync_columns(client: &Client, classid: u32, objid: u32) -> anyhow::Result<()> {
    let rows = client
        .query(
            "SELECT objsubid FROM vectorizer.semantic_catalog_obj \
             WHERE classid = $1 AND objid = $2 AND objsubid <> 0",
            &[&classid, &objid],
        )
        .await
        .context("Failed to list column rows")?;
    for row in &rows {
        let objsubid: i32 = row.try_get(0)?;
        resync_object(client, classid, objid, objsubid).await?;
    }
    Ok(())
}

/// `ALTER SCHEMA … RENAME TO …` cascade: re-resolve every cataloged relation
/// and function the schema contains, columns included.
async fn resync_schema(client: &Client, schema_oid: u32) -> anyhow::Result<()> {
    let rows = client
        .query(
            "SELECT DISTINCT c.classid, c.objid, c.objsubid \
             FROM vectorizer.semantic_catalog_obj c \
             WHERE (c.classid = 'pg_catalog.pg_class'::regclass::oid AND c.objid IN \
                    (SELECT oid FROM pg_catalog.pg_class WHERE relnamespace = $1)) \
                OR (c.classid = 'pg_catalog.pg_proc'::regclass::oid AND c.objid IN \
                    (SELECT oid FROM pg_catalog.pg_proc WHERE pronamespace = $1))",
            &[&schema_oid],
        )
        .await
        .context("Failed to list schema contents")?;
    for row in &rows {
        let classid: u32 = row.try_get(0)?;
        let objid: u32 = row.try_get(1)?;
        let objsubid: i32 = row.try_get(2)?;
        resync_object(client, classid, objid, objsubid).await?;
    }
    Ok(())
}

/// After a dump/restore the oids are different: re-resolve
/// `(classid, objid, objsubid)` from the stored identity triple.
///
/// View and materialized-view column rows take a split path because the
/// generic address lookup does not support them: `objnames` splits into
/// `(schema, relation, attname)` and the attnum is looked up directly.
pub async fn post_restore(client: &Client) -> anyhow::Result<()> {
    let rows = client
        .query(
            "SELECT id, objtype, objnames, objargs \
             FROM vectorizer.semantic_catalog_obj \
             WHERE objtype NOT IN ('view column', 'materialized view column') \
             ORDER BY id",
            &[],
        )
        .await
        .context("Failed to list catalog rows")?;
    for row in &rows {
        let id: i64 = row.try_get(0)?;
        let objtype: String = row.try_get(1)?;
        let objnames: Vec<String> = row.try_get(2)?;
        let objargs: Vec<String> = row.try_get(3)?;
        let address = client
            .query_one(
                "SELECT classid, objid, subobjid \
                 FROM pg_catalog.pg_get_object_address($1, $2, $3)",
                &[&objtype, &objnames, &objargs],
            )
            .await;
        match address {
            Ok(address) => {
                let classid: u32 = address.try_get(0)?;
                let objid: u32 = address.try_get(1)?;
                let objsubid: i32 = address.try_get(2)?;
                client
                    .execute(
                        "UPDATE vectorizer.semantic_catalog_obj \
                         SET classid = $1, objid = $2, objsubid = $3 WHERE id = $4",
                        &[&classid, &objid, &objsubid, &id],
                    )
                    .await
                    .context("Failed to update object address")?;
            }
            Err(e) => {
                log::warn!(
                    "catalog row {} ({} {}) no longer resolves: {}",
                    id,
                    objtype,
                    objnames.join("."),
                    e
                );
            }
        }
    }

    client
        .execute(
            "UPDATE vectorizer.semantic_catalog_obj c SET \
             classid = 'pg_catalog.pg_class'::regclass::oid, \
             objid = rel.oid, \
             objsubid = att.attnum \
             FROM pg_catalog.pg_namespace ns \
             JOIN pg_catalog.pg_class rel ON rel.relnamespace = ns.oid \
             JOIN pg_catalog.pg_attribute att ON att.attrelid = rel.oid \
             WHERE c.objtype IN ('view column', 'materialized view column') \
               AND array_length(c.objnames, 1) = 3 \
               AND ns.nspname = c.objnames[1] \
               AND rel.relname = c.objnames[2] \
               AND att.attname = c.objnames[3]",
            &[],
        )
        .await
        .context("Failed to re-resolve view column addresses")?;
    Ok(())
}
