pub mod prompt;
pub mod tools;
pub mod validate;

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tokio_postgres::Client;

use crate::catalog::{self, CatalogObject, SqlExample};
use crate::providers::{
    ChatMessage, ChatProvider, ContentBlock, ChatRequest, EmbedOptions, EmbeddingProvider,
    ProviderKind, ToolChoice,
};
use tools::{AnswerArgs, RequestArgs, ANSWER_TOOL, PLANNABLE, REQUEST_TOOL};
use validate::{StatementValidator, Validation};

/// Configuration of one text-to-SQL invocation.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub provider: ProviderKind,
    pub model: String,
    pub max_iter: usize,
    pub max_results: i64,
    pub max_vector_dist: Option<f64>,
    pub include_entire_schema: bool,
    pub only_these_objects: Option<Vec<i64>>,
    pub user_id: Option<String>,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Anthropic,
            model: "claude-3-5-sonnet-latest".to_string(),
            max_iter: 10,
            max_results: 5,
            max_vector_dist: None,
            include_entire_schema: false,
            only_these_objects: None,
            user_id: None,
            max_tokens: 1024,
            timeout: Duration::from_secs(120),
        }
    }
}

/// The agent's answer: either a validated statement plus the context that
/// produced it, or a null statement after the iteration bound ran out.
#[derive(Debug, Clone, Serialize)]
pub struct TextToSqlAnswer {
    pub sql_statement: Option<String>,
    pub command_type: Option<String>,
    pub relevant_database_objects: Vec<CatalogObject>,
    pub relevant_sql_examples: Vec<SqlExample>,
    pub iterations: usize,
    pub query_plan: Option<serde_json::Value>,
    pub est_cost: Option<f64>,
    pub est_rows: Option<f64>,
}

/// Catalog retrieval as the agent sees it. The Postgres implementation is
/// [`PgCatalogSearch`]; tests drive the loop with an in-memory one.
#[async_trait]
pub trait CatalogSearch: Send + Sync {
    /// Embed a question with the catalog's own embedder.
    async fn embed_question(&self, question: &str) -> anyhow::Result<Vec<f32>>;

    async fn search_objects(
        &self,
        vector: &[f32],
        limit: i64,
        max_dist: Option<f64>,
    ) -> anyhow::Result<Vec<CatalogObject>>;

    async fn search_sql(
        &self,
        vector: &[f32],
        limit: i64,
        max_dist: Option<f64>,
    ) -> anyhow::Result<Vec<SqlExample>>;

    /// Every top-level object, for include_entire_schema.
    async fn all_objects(&self) -> anyhow::Result<Vec<CatalogObject>>;

    async fn objects_by_ids(&self, ids: &[i64]) -> anyhow::Result<Vec<CatalogObject>>;

    /// Render one object as a prompt section.
    async fn render_object(&self, object: &CatalogObject) -> anyhow::Result<String> {
        Ok(prompt::render_object(object, &[]))
    }
}

/// Catalog search over the live semantic catalog.
pub struct PgCatalogSearch<'a> {
    client: &'a Client,
    embedder: &'a dyn EmbeddingProvider,
    model: String,
    options: EmbedOptions,
}

impl<'a> PgCatalogSearch<'a> {
    pub fn new(
        client: &'a Client,
        embedder: &'a dyn EmbeddingProvider,
        model: String,
        options: EmbedOptions,
    ) -> Self {
        Self {
            client,
            embedder,
            model,
            options,
        }
    }
}

#[async_trait]
impl CatalogSearch for PgCatalogSearch<'_> {
    async fn embed_question(&self, question: &str) -> anyhow::Result<Vec<f32>> {
        let mut embeddings = self
            .embedder
            .embed(&self.model, &[question.to_string()], &self.options)
            .await
            .map_err(anyhow::Error::new)?;
        let embedding = embeddings
            .pop()
            .context("embedder returned no vector for the question")?;
        Ok(embedding.vector)
    }

    async fn search_objects(
        &self,
        vector: &[f32],
        limit: i64,
        max_dist: Option<f64>,
    ) -> anyhow::Result<Vec<CatalogObject>> {
        catalog::search_objects(self.client, vector, limit, max_dist).await
    }

    async fn search_sql(
        &self,
        vector: &[f32],
        limit: i64,
        max_dist: Option<f64>,
    ) -> anyhow::Result<Vec<SqlExample>> {
        catalog::search_sql(self.client, vector, limit, max_dist).await
    }

    async fn all_objects(&self) -> anyhow::Result<Vec<CatalogObject>> {
        catalog::top_level_objects(self.client).await
    }

    async fn objects_by_ids(&self, ids: &[i64]) -> anyhow::Result<Vec<CatalogObject>> {
        catalog::objects_by_ids(self.client, ids).await
    }

    /// Rich rendering: the object plus its described columns.
    async fn render_object(&self, object: &CatalogObject) -> anyhow::Result<String> {
        let columns = if object.objsubid == 0 {
            catalog::columns_of(self.client, object.classid, object.objid).await?
        } else {
            Vec::new()
        };
        Ok(prompt::render_object(object, &columns))
    }
}

/// Drive the retrieve → render → call → validate loop until the model
/// produces a statement the planner accepts, or `max_iter` runs out.
pub async fn generate_sql(
    question: &str,
    catalog_search: &dyn CatalogSearch,
    chat: &dyn ChatProvider,
    validator: &dyn StatementValidator,
    config: &AgentConfig,
    search_path: &str,
) -> anyhow::Result<TextToSqlAnswer> {
    let mut questions: Vec<String> = vec![question.to_string()];
    let mut ctx_obj: Vec<CatalogObject> = Vec::new();
    let mut ctx_sql: Vec<SqlExample> = Vec::new();
    let mut prompt_err: Option<String> = None;
    let tool_specs = tools::tool_specs();

    for iteration in 0..config.max_iter.max(1) {
        let final_iteration = iteration + 1 == config.max_iter.max(1);

        // Retrieval modes, in priority order.
        if config.include_entire_schema {
            ctx_obj = catalog_search.all_objects().await?;
        } else if let Some(ids) = config
            .only_these_objects
            .as_deref()
            .filter(|ids| !ids.is_empty())
        {
            ctx_obj = catalog_search.objects_by_ids(ids).await?;
        } else {
            for q in &questions {
                let vector = catalog_search.embed_question(q).await?;
                let objects = catalog_search
                    .search_objects(&vector, config.max_results, config.max_vector_dist)
                    .await?;
                for object in objects {
                    if !ctx_obj.iter().any(|o| o.id == object.id) {
                        ctx_obj.push(object);
                    }
                }
                let examples = catalog_search
                    .search_sql(&vector, config.max_results, config.max_vector_dist)
                    .await?;
                for example in examples {
                    if !ctx_sql.iter().any(|e| e.id == example.id) {
                        ctx_sql.push(example);
                    }
                }
            }
        }
        questions.clear();

        let mut rendered_objects = Vec::with_capacity(ctx_obj.len());
        for object in &ctx_obj {
            rendered_objects.push(catalog_search.render_object(object).await?);
        }
        let rendered_sql: Vec<String> = ctx_sql.iter().map(prompt::render_sql).collect();
        let rendered = prompt::render_prompt(
            &rendered_objects,
            &rendered_sql,
            prompt_err.as_deref(),
            question,
        );

        // The final iteration forces the answer tool; earlier ones only
        // require that some tool be used.
        let tool_choice = if final_iteration {
            ToolChoice::Tool(ANSWER_TOOL.to_string())
        } else {
            ToolChoice::Any
        };
        let request = ChatRequest {
            model: config.model.clone(),
            system: Some(prompt::SYSTEM_PROMPT.to_string()),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: rendered,
            }],
            tools: tool_specs.clone(),
            tool_choice,
            max_tokens: config.max_tokens,
            user_id: config.user_id.clone(),
        };
        let response = chat.chat(&request, config.timeout).await?;

        for block in response.content {
            match block {
                ContentBlock::Text { text } => {
                    log::debug!("model commentary: {}", text);
                }
                ContentBlock::ToolUse { name, input, .. } if name == REQUEST_TOOL => {
                    let args: RequestArgs = serde_json::from_value(input)
                        .context("malformed request_more_context_by_question arguments")?;
                    log::debug!("model requested more context: {}", args.question);
                    questions.push(args.question);
                }
                ContentBlock::ToolUse { name, input, .. } if name == ANSWER_TOOL => {
                    let args: AnswerArgs = serde_json::from_value(input)
                        .context("malformed answer_user_question_with_sql_statement arguments")?;

                    // Narrow the context to what the model marked relevant.
                    ctx_obj.retain(|o| args.relevant_database_object_ids.contains(&o.id));
                    ctx_sql.retain(|e| args.relevant_sql_example_ids.contains(&e.id));

                    let command_type = args.command_type.to_uppercase();
                    if PLANNABLE.contains(&command_type.as_str()) {
                        let validation = validator
                            .explain(&args.sql_statement, search_path)
                            .await?;
                        if !validation.valid {
                            let error = validation
                                .error
                                .unwrap_or_else(|| "statement failed to plan".to_string());
                            log::debug!("statement rejected by planner: {}", error);
                            prompt_err =
                                Some(prompt::render_invalid(&args.sql_statement, &error));
                            continue;
                        }
                        return Ok(answer(
                            args,
                            command_type,
                            ctx_obj,
                            ctx_sql,
                            iteration + 1,
                            Some(validation),
                        ));
                    }
                    return Ok(answer(
                        args,
                        command_type,
                        ctx_obj,
                        ctx_sql,
                        iteration + 1,
                        None,
                    ));
                }
                ContentBlock::ToolUse { name, .. } => {
                    log::warn!("model called unknown tool: {}", name);
                }
            }
        }
    }

    Ok(TextToSqlAnswer {
        sql_statement: None,
        command_type: None,
        relevant_database_objects: ctx_obj,
        relevant_sql_examples: ctx_sql,
        iterations: config.max_iter.max(1),
        query_plan: None,
        est_cost: None,
        est_rows: None,
    })
}

fn answer(
    args: AnswerArgs,
    command_type: String,
    ctx_obj: Vec<CatalogObject>,
    ctx_sql: Vec<SqlExample>,
    iterations: usize,
    validation: Option<Validation>,
) -> TextToSqlAnswer {
    let (query_plan, est_cost, est_rows) = match validation {
        Some(validation) => (validation.query_plan, validation.est_cost, validation.est_rows),
        None => (None, None, None),
    };
    TextToSqlAnswer {
        sql_statement: Some(args.sql_statement),
        command_type: Some(command_type),
        relevant_database_objects: ctx_obj,
        relevant_sql_examples: ctx_sql,
        iterations,
        query_plan,
        est_cost,
        est_rows,
    }
}
