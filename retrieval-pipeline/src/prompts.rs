use serde_json::{json, Value};

pub static QUERY_PLANNER_SYSTEM_PROMPT: &str = r#"You are the query planner of a personal knowledge assistant. The knowledge base holds the user's own data: repositories, pull requests and issues, music and playlists, calendar events and emails.
Generate diverse search queries that together retrieve every document relevant to the user's question.

Rules:
1) Preserve domain signals. If the user mentions github, linear, spotify, gmail or calendar, every query that targets that domain must keep the word.
2) Mix perspectives: one query with the user's exact key terms, two or three paraphrases or synonyms, two or three related concepts, one broader or narrower query.
3) Each query is 2 to 8 words, lowercase, natural language.
4) Never include IDs, URLs, hashtags, quotes, usernames or duplicates.
5) Tags are optional single words naming the domains or topics involved."#;

pub fn build_query_planning_prompt(
    user_query: &str,
    queries_count: usize,
    entity_types: Option<&[String]>,
    time_reference: Option<&str>,
) -> String {
    let mut prompt = format!(
        "Generate exactly {queries_count} search queries for the question below.\n"
    );
    if let Some(types) = entity_types.filter(|types| !types.is_empty()) {
        prompt.push_str(&format!(
            "The question is about these kinds of records: {}.\n",
            types.join(", ")
        ));
    }
    if let Some(reference) = time_reference.filter(|r| !r.trim().is_empty()) {
        prompt.push_str(&format!(
            "It refers to this time period: {reference}. Keep the time period out of the queries, it is filtered separately.\n"
        ));
    }
    prompt.push_str(&format!("\nUser question:\n{}", user_query.trim()));
    prompt
}

pub fn get_query_plan_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "queries": {
                "type": "array",
                "items": { "type": "string" }
            },
            "tags": {
                "type": "array",
                "items": { "type": "string" }
            }
        },
        "required": ["queries", "tags"],
        "additionalProperties": false
    })
}

pub static QUERY_INTENT_SYSTEM_PROMPT: &str = r#"You analyse questions sent to a personal knowledge assistant and decide which kinds of stored records could answer them.
Known record types: track, playlist, recently_played, repository, pull_request, issue, calendar_event, email.
Only list record types the question clearly needs; list none when it is generic.
Mark the question as temporal when it depends on a time period, and copy the time period as written by the user."#;

pub fn get_query_intent_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "entity_types": {
                "type": "array",
                "items": { "type": "string" }
            },
            "is_temporal_query": { "type": "boolean" },
            "time_reference": { "type": ["string", "null"] }
        },
        "required": ["entity_types", "is_temporal_query", "time_reference"],
        "additionalProperties": false
    })
}

pub static RERANK_SYSTEM_PROMPT: &str = r#"You judge how relevant retrieved documents are to a user's question.
Score every listed document from 0 (unrelated) to 10 (directly answers the question) and refer to each document by its index."#;

pub fn build_rerank_prompt(query: &str, previews: &[String]) -> String {
    let mut prompt = format!("Question: {}\n\nDocuments:\n", query.trim());
    for (index, preview) in previews.iter().enumerate() {
        prompt.push_str(&format!("[{index}] {preview}\n"));
    }
    prompt
}

pub fn get_rerank_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "scores": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "index": { "type": "integer" },
                        "relevance": { "type": "number" }
                    },
                    "required": ["index", "relevance"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["scores"],
        "additionalProperties": false
    })
}

pub static HYDE_SYSTEM_PROMPT: &str = r#"Write a short passage, as it could appear in the user's own records (a commit, a calendar entry, an email, a listening log), that would answer the question below.
Invent plausible specifics. Answer with the passage only, at most five sentences."#;
