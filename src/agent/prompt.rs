use crate::catalog::{CatalogObject, SqlExample};

/// System prompt sent with every provider call.
pub const SYSTEM_PROMPT: &str = "\
You are an expert SQL analyst working against a PostgreSQL database. You are \
given descriptions of database objects and example SQL statements, then a \
user question. If the context is insufficient, request more of it with the \
request_more_context_by_question tool. When you can answer, call \
answer_user_question_with_sql_statement with a single valid SQL statement \
that uses only objects from the context.";

/// Fixed header prepended to every rendered prompt. Kept as a constant so
/// repeated iterations produce bit-identical prompt prefixes.
pub const PROMPT_HEADER: &str = "\
Consider the following context when answering the user's question.

";

/// Render one catalog object as a prompt section.
pub fn render_object(object: &CatalogObject, columns: &[CatalogObject]) -> String {
    let mut out = format!(
        "<database-object id=\"{}\" type=\"{}\" name=\"{}\">\n{}\n",
        object.id,
        object.objtype,
        object.display_name(),
        object.description
    );
    for column in columns {
        if let Some(name) = column.objnames.last() {
            out.push_str(&format!("  {}: {}\n", name, column.description));
        }
    }
    out.push_str("</database-object>\n");
    out
}

/// Render one SQL example as a prompt section.
pub fn render_sql(example: &SqlExample) -> String {
    format!(
        "<sql-example id=\"{}\">\ndescription: {}\nsql: {}\n</sql-example>\n",
        example.id, example.description, example.sql
    )
}

/// Render the rejection block appended after a failed validation.
pub fn render_invalid(sql: &str, error: &str) -> String {
    format!(
        "<invalid-sql-statement>\n{}\nerror: {}\n</invalid-sql-statement>\n",
        sql, error
    )
}

/// Assemble the full prompt for one iteration.
pub fn render_prompt(
    objects: &[String],
    examples: &[String],
    invalid: Option<&str>,
    question: &str,
) -> String {
    let mut out = String::from(PROMPT_HEADER);
    for section in objects {
        out.push_str(section);
        out.push('\n');
    }
    for section in examples {
        out.push_str(section);
        out.push('\n');
    }
    if let Some(invalid) = invalid {
        out.push_str(invalid);
        out.push('\n');
    }
    out.push_str("Q: ");
    out.push_str(question);
    out
}
