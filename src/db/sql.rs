use super::schema::{PkColumn, Relation};

/// Quote an identifier for Postgres.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a schema-qualified relation name.
pub fn quote_relation(rel: &Relation) -> String {
    format!("{}.{}", quote_ident(&rel.schema), quote_ident(&rel.name))
}

/// Generates the DDL and DML statements backing one vectorizer.
///
/// Pk values travel as text and are cast back with the stored column types,
/// so composite and non-integer keys work without per-type codegen.
pub struct SqlBuilder {
    source: Relation,
    queue: Relation,
    target: Option<Relation>,
    pk: Vec<PkColumn>,
}

impl SqlBuilder {
    pub fn new(
        source: Relation,
        queue: Relation,
        target: Option<Relation>,
        pk: Vec<PkColumn>,
    ) -> Self {
        Self {
            source,
            queue,
            target,
            pk,
        }
    }

    fn pk_column_list(&self) -> String {
        self.pk
            .iter()
            .map(|c| quote_ident(&c.attname))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// WHERE clause matching one pk tuple, binding `$offset..` as text with casts.
    fn pk_where(&self, offset: usize, table_alias: Option<&str>) -> String {
        self.pk
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let col = match table_alias {
                    Some(a) => format!("{}.{}", a, quote_ident(&c.attname)),
                    None => quote_ident(&c.attname),
                };
                format!("{} = ${}::text::{}", col, offset + i, c.attype)
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn target(&self) -> &Relation {
        self.target
            .as_ref()
            .expect("statement requires a target table")
    }

    // ── Provisioning DDL ────────────────────────────────────────────────

    /// Target table: embedding_uuid + source pk + chunk_seq + chunk + vector.
    pub fn create_target_table(&self, dimensions: u32) -> String {
        let pk_cols = self
            .pk
            .iter()
            .map(|c| format!("{} {} NOT NULL", quote_ident(&c.attname), c.attype))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CREATE TABLE {} (\
             embedding_uuid uuid NOT NULL PRIMARY KEY DEFAULT gen_random_uuid(), \
             {}, chunk_seq int NOT NULL, chunk text NOT NULL, \
             embedding vector({}) NOT NULL, \
             UNIQUE ({}, chunk_seq))",
            quote_relation(self.target()),
            pk_cols,
            dimensions,
            self.pk_column_list()
        )
    }

    /// Queue table: source pk + queued_at, with an index for claim scans.
    pub fn create_queue_table(&self) -> Vec<String> {
        let pk_cols = self
            .pk
            .iter()
            .map(|c| format!("{} {} NOT NULL", quote_ident(&c.attname), c.attype))
            .collect::<Vec<_>>()
            .join(", ");
        let index_name = format!("{}_idx", self.queue.name);
        vec![
            format!(
                "CREATE TABLE {} ({}, queued_at timestamptz NOT NULL DEFAULT now())",
                quote_relation(&self.queue),
                pk_cols
            ),
            format!(
                "CREATE INDEX {} ON {} ({})",
                quote_ident(&index_name),
                quote_relation(&self.queue),
                self.pk_column_list()
            ),
        ]
    }

    /// Name of the plpgsql function backing the source trigger.
    pub fn trigger_function(&self, trigger_name: &str) -> Relation {
        Relation::new(self.queue.schema.clone(), format!("{}_fn", trigger_name))
    }

    /// Single AFTER ROW trigger function: INSERT/UPDATE feed the queue,
    /// DELETE removes the pk's embeddings.
    pub fn create_trigger_function(&self, trigger_name: &str) -> String {
        let pk_list = self.pk_column_list();
        let new_vals = self
            .pk
            .iter()
            .map(|c| format!("NEW.{}", quote_ident(&c.attname)))
            .collect::<Vec<_>>()
            .join(", ");
        let delete_branch = match &self.target {
            Some(target) => {
                let old_match = self
                    .pk
                    .iter()
                    .map(|c| {
                        format!(
                            "{} = OLD.{}",
                            quote_ident(&c.attname),
                            quote_ident(&c.attname)
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(" AND ");
                format!(
                    "DELETE FROM {} WHERE {};",
                    quote_relation(target),
                    old_match
                )
            }
            // destination=source: the embedding column dies with the row
            None => "NULL;".to_string(),
        };
        format!(
            "CREATE FUNCTION {}() RETURNS trigger AS $trig$\n\
             BEGIN\n\
             IF TG_OP = 'DELETE' THEN\n\
             {}\n\
             ELSE\n\
             INSERT INTO {} ({}) VALUES ({});\n\
             END IF;\n\
             RETURN NULL;\n\
             END;\n\
             $trig$ LANGUAGE plpgsql SECURITY DEFINER",
            quote_relation(&self.trigger_function(trigger_name)),
            delete_branch,
            quote_relation(&self.queue),
            pk_list,
            new_vals
        )
    }

    pub fn create_trigger(&self, trigger_name: &str) -> String {
        format!(
            "CREATE TRIGGER {} AFTER INSERT OR UPDATE OR DELETE ON {} \
             FOR EACH ROW EXECUTE FUNCTION {}()",
            quote_ident(trigger_name),
            quote_relation(&self.source),
            quote_relation(&self.trigger_function(trigger_name))
        )
    }

    /// View joining target and source on the pk.
    pub fn create_view(&self, view: &Relation) -> String {
        let join = self
            .pk
            .iter()
            .map(|c| {
                format!(
                    "t.{} = s.{}",
                    quote_ident(&c.attname),
                    quote_ident(&c.attname)
                )
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        format!(
            "CREATE VIEW {} AS SELECT t.embedding_uuid, t.chunk_seq, t.chunk, t.embedding, s.* \
             FROM {} t INNER JOIN {} s ON {}",
            quote_relation(view),
            quote_relation(self.target()),
            quote_relation(&self.source),
            join
        )
    }

    /// Embedding column on the source table (destination=source).
    pub fn add_embedding_column(&self, column: &str, dimensions: u32) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} vector({})",
            quote_relation(&self.source),
            quote_ident(column),
            dimensions
        )
    }

    pub fn grant_select_source(&self, role: &str) -> String {
        format!(
            "GRANT SELECT ON {} TO {}",
            quote_relation(&self.source),
            quote_ident(role)
        )
    }

    pub fn grant_queue(&self, role: &str) -> String {
        format!(
            "GRANT SELECT, INSERT, UPDATE, DELETE ON {} TO {}",
            quote_relation(&self.queue),
            quote_ident(role)
        )
    }

    pub fn grant_target(&self, role: &str) -> String {
        format!(
            "GRANT SELECT, INSERT, UPDATE, DELETE ON {} TO {}",
            quote_relation(self.target()),
            quote_ident(role)
        )
    }

    /// Copy every current source pk into the queue in one statement.
    pub fn enqueue_existing(&self) -> String {
        let pk_list = self.pk_column_list();
        format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            quote_relation(&self.queue),
            pk_list,
            pk_list,
            quote_relation(&self.source)
        )
    }

    // ── Teardown ────────────────────────────────────────────────────────

    pub fn drop_trigger(&self, trigger_name: &str) -> String {
        format!(
            "DROP TRIGGER IF EXISTS {} ON {}",
            quote_ident(trigger_name),
            quote_relation(&self.source)
        )
    }

    pub fn drop_trigger_function(&self, trigger_name: &str) -> String {
        format!(
            "DROP FUNCTION IF EXISTS {}()",
            quote_relation(&self.trigger_function(trigger_name))
        )
    }

    pub fn drop_queue_table(&self) -> String {
        format!("DROP TABLE IF EXISTS {}", quote_relation(&self.queue))
    }

    // ── Worker DML ──────────────────────────────────────────────────────

    /// Claim up to `batch_size` queue rows, skipping rows other workers hold.
    /// Pk values come back text-encoded.
    pub fn claim_batch(&self, batch_size: i64) -> String {
        let text_cols = self
            .pk
            .iter()
            .map(|c| format!("{}::text", quote_ident(&c.attname)))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "SELECT {} FROM {} LIMIT {} FOR UPDATE SKIP LOCKED",
            text_cols,
            quote_relation(&self.queue),
            batch_size
        )
    }

    /// Fetch the current source row for one claimed pk.
    pub fn load_source_row(&self) -> String {
        format!(
            "SELECT to_jsonb(s) FROM {} s WHERE {}",
            quote_relation(&self.source),
            self.pk_where(1, Some("s"))
        )
    }

    /// Remove a pk's existing embeddings before inserting the new set.
    pub fn delete_target_rows(&self) -> String {
        format!(
            "DELETE FROM {} WHERE {}",
            quote_relation(self.target()),
            self.pk_where(1, None)
        )
    }

    /// Multi-row insert of the new chunk set for one pk. Bind order per row:
    /// pk values (text), chunk_seq (i32), chunk (text), embedding (text-encoded vector).
    pub fn insert_chunks(&self, chunk_count: usize) -> String {
        let n_pk = self.pk.len();
        let width = n_pk + 3;
        let rows = (0..chunk_count)
            .map(|row| {
                let base = row * width;
                let mut cols: Vec<String> = self
                    .pk
                    .iter()
                    .enumerate()
                    .map(|(i, c)| format!("${}::text::{}", base + i + 1, c.attype))
                    .collect();
                cols.push(format!("${}::int", base + n_pk + 1));
                cols.push(format!("${}", base + n_pk + 2));
                cols.push(format!("${}::text::vector", base + n_pk + 3));
                format!("({})", cols.join(", "))
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({}, chunk_seq, chunk, embedding) VALUES {}",
            quote_relation(self.target()),
            self.pk_column_list(),
            rows
        )
    }

    /// Write the embedding straight onto the source row (destination=source).
    pub fn update_source_embedding(&self, column: &str) -> String {
        format!(
            "UPDATE {} SET {} = $1::text::vector WHERE {}",
            quote_relation(&self.source),
            quote_ident(column),
            self.pk_where(2, None)
        )
    }

    /// Consume every queue row for one pk (duplicates included).
    pub fn delete_queue_rows(&self) -> String {
        format!(
            "DELETE FROM {} WHERE {}",
            quote_relation(&self.queue),
            self.pk_where(1, None)
        )
    }

    pub fn queue_depth(&self) -> String {
        format!("SELECT count(*) FROM {}", quote_relation(&self.queue))
    }
}

/// Encode an embedding vector as the text form Postgres' vector type accepts.
pub fn vector_literal(vector: &[f32]) -> String {
    let mut out = String::with_capacity(vector.len() * 8 + 2);
    out.push('[');
    for (i, v) in vector.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&v.to_string());
    }
    out.push(']');
    out
}
