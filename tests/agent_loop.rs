//! Agent-loop scenarios against a scripted chat provider, an in-memory
//! catalog, and a canned validator. No network or database required.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use vectorizer_lib::agent::validate::{StatementValidator, Validation};
use vectorizer_lib::agent::{generate_sql, AgentConfig, CatalogSearch};
use vectorizer_lib::catalog::{CatalogObject, SqlExample};
use vectorizer_lib::providers::{
    ChatProvider, ChatRequest, ChatResponse, ContentBlock, ProviderError, ProviderKind,
    ToolChoice,
};

// ─── in-memory doubles ─────────────────────────────────────────────────────

struct MemoryCatalog {
    objects: Vec<CatalogObject>,
    examples: Vec<SqlExample>,
    embed_calls: Mutex<Vec<String>>,
}

impl MemoryCatalog {
    fn new(objects: Vec<CatalogObject>, examples: Vec<SqlExample>) -> Self {
        Self {
            objects,
            examples,
            embed_calls: Mutex::new(Vec::new()),
        }
    }

    fn embedded_questions(&self) -> Vec<String> {
        self.embed_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CatalogSearch for MemoryCatalog {
    async fn embed_question(&self, question: &str) -> anyhow::Result<Vec<f32>> {
        self.embed_calls.lock().unwrap().push(question.to_string());
        Ok(vec![0.1, 0.2, 0.3])
    }

    async fn search_objects(
        &self,
        _vector: &[f32],
        limit: i64,
        _max_dist: Option<f64>,
    ) -> anyhow::Result<Vec<CatalogObject>> {
        Ok(self.objects.iter().take(limit as usize).cloned().collect())
    }

    async fn search_sql(
        &self,
        _vector: &[f32],
        limit: i64,
        _max_dist: Option<f64>,
    ) -> anyhow::Result<Vec<SqlExample>> {
        Ok(self.examples.iter().take(limit as usize).cloned().collect())
    }

    async fn all_objects(&self) -> anyhow::Result<Vec<CatalogObject>> {
        Ok(self
            .objects
            .iter()
            .filter(|o| o.objsubid == 0)
            .cloned()
            .collect())
    }

    async fn objects_by_ids(&self, ids: &[i64]) -> anyhow::Result<Vec<CatalogObject>> {
        Ok(self
            .objects
            .iter()
            .filter(|o| ids.contains(&o.id))
            .cloned()
            .collect())
    }
}

struct ScriptedChat {
    responses: Mutex<VecDeque<ChatResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChat {
    fn new(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn captured_requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatProvider for ScriptedChat {
    async fn chat(
        &self,
        request: &ChatRequest,
        _timeout: Duration,
    ) -> Result<ChatResponse, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::Response("script exhausted".to_string()))
    }
}

struct CannedValidator {
    invalid: Vec<(&'static str, &'static str)>,
    calls: Mutex<Vec<String>>,
}

impl CannedValidator {
    fn valid() -> Self {
        Self {
            invalid: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn rejecting(sql: &'static str, error: &'static str) -> Self {
        Self {
            invalid: vec![(sql, error)],
            calls: Mutex::new(Vec::new()),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl StatementValidator for CannedValidator {
    async fn explain(&self, sql: &str, _search_path: &str) -> anyhow::Result<Validation> {
        self.calls.lock().unwrap().push(sql.to_string());
        if let Some((_, error)) = self.invalid.iter().find(|(bad, _)| *bad == sql) {
            return Ok(Validation {
                valid: false,
                error: Some(error.to_string()),
                ..Default::default()
            });
        }
        Ok(Validation {
            valid: true,
            error: None,
            query_plan: Some(serde_json::json!([
                {"Plan": {"Node Type": "Seq Scan", "Total Cost": 12.5, "Plan Rows": 42}}
            ])),
            est_cost: Some(12.5),
            est_rows: Some(42.0),
        })
    }
}

// ─── fixtures ──────────────────────────────────────────────────────────────

fn table(id: i64, name: &str) -> CatalogObject {
    CatalogObject {
        id,
        objtype: "table".to_string(),
        objnames: vec!["public".to_string(), name.to_string()],
        objargs: vec![],
        classid: 1259,
        objid: 16384 + id as u32,
        objsubid: 0,
        description: format!("The {} table", name),
    }
}

fn example(id: i64, sql: &str) -> SqlExample {
    SqlExample {
        id,
        sql: sql.to_string(),
        description: "An example".to_string(),
    }
}

fn answer_response(sql: &str, command_type: &str, object_ids: &[i64]) -> ChatResponse {
    ChatResponse {
        stop_reason: "tool_use".to_string(),
        content: vec![ContentBlock::ToolUse {
            id: "toolu_1".to_string(),
            name: "answer_user_question_with_sql_statement".to_string(),
            input: serde_json::json!({
                "sql_statement": sql,
                "command_type": command_type,
                "relevant_database_object_ids": object_ids,
                "relevant_sql_example_ids": [],
            }),
        }],
    }
}

fn request_response(question: &str) -> ChatResponse {
    ChatResponse {
        stop_reason: "tool_use".to_string(),
        content: vec![ContentBlock::ToolUse {
            id: "toolu_1".to_string(),
            name: "request_more_context_by_question".to_string(),
            input: serde_json::json!({"question": question}),
        }],
    }
}

fn config(max_iter: usize) -> AgentConfig {
    AgentConfig {
        provider: ProviderKind::Anthropic,
        model: "test-model".to_string(),
        max_iter,
        ..Default::default()
    }
}

// ─── scenarios ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn answer_on_first_iteration() {
    let catalog = MemoryCatalog::new(
        vec![table(1, "posts"), table(2, "authors")],
        vec![example(10, "SELECT count(*) FROM posts")],
    );
    let chat = ScriptedChat::new(vec![answer_response(
        "SELECT author_id, count(*) FROM posts GROUP BY author_id",
        "SELECT",
        &[1],
    )]);
    let validator = CannedValidator::valid();

    let answer = generate_sql(
        "how many posts per author?",
        &catalog,
        &chat,
        &validator,
        &config(10),
        "public",
    )
    .await
    .unwrap();

    assert_eq!(
        answer.sql_statement.as_deref(),
        Some("SELECT author_id, count(*) FROM posts GROUP BY author_id")
    );
    assert_eq!(answer.command_type.as_deref(), Some("SELECT"));
    assert_eq!(answer.iterations, 1);
    assert_eq!(answer.est_cost, Some(12.5));
    assert_eq!(answer.est_rows, Some(42.0));
    assert!(answer.query_plan.is_some());

    // Context narrowed to the ids the model marked relevant.
    let ids: Vec<i64> = answer
        .relevant_database_objects
        .iter()
        .map(|o| o.id)
        .collect();
    assert_eq!(ids, vec![1]);
    assert!(answer.relevant_sql_examples.is_empty());

    // The user question was embedded exactly once.
    assert_eq!(
        catalog.embedded_questions(),
        vec!["how many posts per author?"]
    );
}

#[tokio::test]
async fn requesting_more_context_adds_a_question() {
    let catalog = MemoryCatalog::new(vec![table(1, "posts")], vec![]);
    let chat = ScriptedChat::new(vec![
        request_response("which table stores authors?"),
        answer_response("SELECT count(*) FROM posts", "SELECT", &[1]),
    ]);
    let validator = CannedValidator::valid();

    let answer = generate_sql(
        "how many posts?",
        &catalog,
        &chat,
        &validator,
        &config(10),
        "public",
    )
    .await
    .unwrap();

    assert_eq!(answer.iterations, 2);
    assert_eq!(
        catalog.embedded_questions(),
        vec!["how many posts?", "which table stores authors?"]
    );
}

#[tokio::test]
async fn invalid_sql_feeds_back_into_the_prompt() {
    let catalog = MemoryCatalog::new(vec![table(1, "posts")], vec![]);
    let chat = ScriptedChat::new(vec![
        answer_response("SELECT wrong FROM posts", "SELECT", &[1]),
        answer_response("SELECT count(*) FROM posts", "SELECT", &[1]),
    ]);
    let validator =
        CannedValidator::rejecting("SELECT wrong FROM posts", "column \"wrong\" does not exist");

    let answer = generate_sql(
        "how many posts?",
        &catalog,
        &chat,
        &validator,
        &config(10),
        "public",
    )
    .await
    .unwrap();

    assert_eq!(
        answer.sql_statement.as_deref(),
        Some("SELECT count(*) FROM posts")
    );
    assert_eq!(answer.iterations, 2);
    assert_eq!(validator.call_count(), 2);

    // The second prompt carried the rejection block with the planner error.
    let requests = chat.captured_requests();
    assert_eq!(requests.len(), 2);
    let second_prompt = &requests[1].messages[0].content;
    assert!(second_prompt.contains("<invalid-sql-statement>"));
    assert!(second_prompt.contains("column \"wrong\" does not exist"));
    assert!(!requests[0].messages[0].content.contains("<invalid-sql-statement>"));
}

#[tokio::test]
async fn exhausted_iterations_return_null_statement() {
    let catalog = MemoryCatalog::new(vec![table(1, "posts")], vec![]);
    let chat = ScriptedChat::new(vec![
        request_response("more context 1"),
        request_response("more context 2"),
        request_response("more context 3"),
    ]);
    let validator = CannedValidator::valid();

    let answer = generate_sql(
        "unanswerable",
        &catalog,
        &chat,
        &validator,
        &config(3),
        "public",
    )
    .await
    .unwrap();

    assert!(answer.sql_statement.is_none());
    assert!(answer.command_type.is_none());
    assert_eq!(answer.iterations, 3);
    assert_eq!(validator.call_count(), 0);
}

#[tokio::test]
async fn final_iteration_forces_the_answer_tool() {
    let catalog = MemoryCatalog::new(vec![table(1, "posts")], vec![]);
    let chat = ScriptedChat::new(vec![answer_response(
        "SELECT count(*) FROM posts",
        "SELECT",
        &[1],
    )]);
    let validator = CannedValidator::valid();

    generate_sql(
        "how many posts?",
        &catalog,
        &chat,
        &validator,
        &config(1),
        "public",
    )
    .await
    .unwrap();

    let requests = chat.captured_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].tool_choice,
        ToolChoice::Tool("answer_user_question_with_sql_statement".to_string())
    );
}

#[tokio::test]
async fn earlier_iterations_require_any_tool() {
    let catalog = MemoryCatalog::new(vec![table(1, "posts")], vec![]);
    let chat = ScriptedChat::new(vec![answer_response(
        "SELECT count(*) FROM posts",
        "SELECT",
        &[1],
    )]);
    let validator = CannedValidator::valid();

    generate_sql(
        "how many posts?",
        &catalog,
        &chat,
        &validator,
        &config(10),
        "public",
    )
    .await
    .unwrap();

    let requests = chat.captured_requests();
    assert_eq!(requests[0].tool_choice, ToolChoice::Any);
}

#[tokio::test]
async fn non_plannable_command_skips_validation() {
    let catalog = MemoryCatalog::new(vec![table(1, "posts")], vec![]);
    let chat = ScriptedChat::new(vec![answer_response(
        "EXPLAIN SELECT 1",
        "EXPLAIN",
        &[1],
    )]);
    let validator = CannedValidator::valid();

    let answer = generate_sql(
        "explain something",
        &catalog,
        &chat,
        &validator,
        &config(10),
        "public",
    )
    .await
    .unwrap();

    assert_eq!(answer.sql_statement.as_deref(), Some("EXPLAIN SELECT 1"));
    assert_eq!(validator.call_count(), 0);
    assert!(answer.query_plan.is_none());
}

#[tokio::test]
async fn include_entire_schema_skips_search() {
    let catalog = MemoryCatalog::new(vec![table(1, "posts"), table(2, "authors")], vec![]);
    let chat = ScriptedChat::new(vec![answer_response(
        "SELECT count(*) FROM posts",
        "SELECT",
        &[1, 2],
    )]);
    let validator = CannedValidator::valid();

    let agent_config = AgentConfig {
        include_entire_schema: true,
        ..config(10)
    };
    let answer = generate_sql(
        "how many posts?",
        &catalog,
        &chat,
        &validator,
        &agent_config,
        "public",
    )
    .await
    .unwrap();

    // No question embedding happened; both tables were in context.
    assert!(catalog.embedded_questions().is_empty());
    assert_eq!(answer.relevant_database_objects.len(), 2);
}

#[tokio::test]
async fn only_these_objects_pins_the_context() {
    let catalog = MemoryCatalog::new(
        vec![table(1, "posts"), table(2, "authors"), table(3, "tags")],
        vec![],
    );
    let chat = ScriptedChat::new(vec![answer_response(
        "SELECT count(*) FROM authors",
        "SELECT",
        &[2],
    )]);
    let validator = CannedValidator::valid();

    let agent_config = AgentConfig {
        only_these_objects: Some(vec![2]),
        ..config(10)
    };
    let answer = generate_sql(
        "how many authors?",
        &catalog,
        &chat,
        &validator,
        &agent_config,
        "public",
    )
    .await
    .unwrap();

    assert!(catalog.embedded_questions().is_empty());
    let requests = chat.captured_requests();
    let prompt = &requests[0].messages[0].content;
    assert!(prompt.contains("authors"));
    assert!(!prompt.contains("name=\"public.tags\""));
    assert_eq!(answer.relevant_database_objects.len(), 1);
}
