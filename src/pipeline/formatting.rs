use crate::db::schema::Row;

/// Render a `$var` template against the source row. `$chunk` is the chunk
/// text; any other `$name` (or `${name}`) takes the row value of that
/// column. `$$` escapes a literal dollar sign. Unknown names render empty.
pub fn render(template: &str, row: &Row, chunk: &str) -> String {
    let mut out = String::with_capacity(template.len() + chunk.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some('{') => {
                chars.next();
                let mut name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    name.push(c);
                }
                out.push_str(&lookup(&name, row, chunk));
            }
            Some(c) if c.is_ascii_alphanumeric() || *c == '_' => {
                let mut name = String::new();
                while let Some(c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&lookup(&name, row, chunk));
            }
            _ => out.push('$'),
        }
    }
    out
}

fn lookup(name: &str, row: &Row, chunk: &str) -> String {
    if name == "chunk" {
        return chunk.to_string();
    }
    match row.get(name) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}
