use serde::Deserialize;

use crate::providers::ToolSpec;

/// Tool the model calls to widen its context with another question.
pub const REQUEST_TOOL: &str = "request_more_context_by_question";

/// Tool the model calls to deliver its answer.
pub const ANSWER_TOOL: &str = "answer_user_question_with_sql_statement";

/// The fixed two-tool schema the agent exposes on every call.
pub fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: REQUEST_TOOL.to_string(),
            description: "Ask for more database context by posing a question about the \
                          schema. The question is used for semantic search over the \
                          catalog of object descriptions and example statements."
                .to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "question": {
                        "type": "string",
                        "description": "A question about tables, views, columns, or \
                                        functions that would help write the SQL."
                    }
                },
                "required": ["question"]
            }),
        },
        ToolSpec {
            name: ANSWER_TOOL.to_string(),
            description: "Answer the user's question with a single SQL statement. Only \
                          use database objects that appear in the provided context, and \
                          list the ids of the context entries that were actually \
                          relevant."
                .to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "sql_statement": {
                        "type": "string",
                        "description": "The SQL statement answering the question."
                    },
                    "command_type": {
                        "type": "string",
                        "description": "The statement's command type, e.g. SELECT, \
                                        INSERT, UPDATE, DELETE, MERGE, VALUES."
                    },
                    "relevant_database_object_ids": {
                        "type": "array",
                        "items": {"type": "integer"},
                        "description": "Ids of the database objects the statement uses."
                    },
                    "relevant_sql_example_ids": {
                        "type": "array",
                        "items": {"type": "integer"},
                        "description": "Ids of the example statements that informed it."
                    }
                },
                "required": [
                    "sql_statement",
                    "command_type",
                    "relevant_database_object_ids",
                    "relevant_sql_example_ids"
                ]
            }),
        },
    ]
}

/// Arguments of an `answer_user_question_with_sql_statement` call.
#[derive(Debug, Clone, Deserialize)]
pub struct AnswerArgs {
    pub sql_statement: String,
    pub command_type: String,
    #[serde(default)]
    pub relevant_database_object_ids: Vec<i64>,
    #[serde(default)]
    pub relevant_sql_example_ids: Vec<i64>,
}

/// Arguments of a `request_more_context_by_question` call.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestArgs {
    pub question: String,
}

/// Command types whose answers are gated through the planner.
pub const PLANNABLE: &[&str] = &["SELECT", "INSERT", "UPDATE", "DELETE", "MERGE", "VALUES"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_schema_shape() {
        let specs = tool_specs();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, REQUEST_TOOL);
        assert_eq!(specs[1].name, ANSWER_TOOL);

        let answer = &specs[1].input_schema;
        let required: Vec<&str> = answer["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(
            required,
            vec![
                "sql_statement",
                "command_type",
                "relevant_database_object_ids",
                "relevant_sql_example_ids"
            ]
        );
    }

    #[test]
    fn test_answer_args_parse() {
        let args: AnswerArgs = serde_json::from_value(serde_json::json!({
            "sql_statement": "SELECT 1",
            "command_type": "SELECT",
            "relevant_database_object_ids": [1, 2],
            "relevant_sql_example_ids": []
        }))
        .unwrap();
        assert_eq!(args.sql_statement, "SELECT 1");
        assert_eq!(args.relevant_database_object_ids, vec![1, 2]);
    }

    #[test]
    fn test_plannable_set() {
        assert!(PLANNABLE.contains(&"SELECT"));
        assert!(PLANNABLE.contains(&"MERGE"));
        assert!(!PLANNABLE.contains(&"EXPLAIN"));
    }
}
