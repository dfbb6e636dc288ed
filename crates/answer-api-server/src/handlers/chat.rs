use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::Stream;
use futures::StreamExt;
use search_shared::index::IndexFilters;
use search_shared::models::DocumentAccess;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::answer::{AnswerEvent, AnswerRequest, ForceUseTool};
use crate::db::MessageType;
use crate::state::AppState;
use crate::summary;
use crate::tools::{SearchTool, Tool};
use crate::utils::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub user_email: Option<String>,
    pub message: String,
    /// Group ids resolved by the auth bridge, used for ACL filtering.
    #[serde(default)]
    pub group_ids: Vec<String>,
    #[serde(default)]
    pub uploaded_file_content: Option<String>,
    /// Bypass LLM tool choice and run this tool directly.
    #[serde(default)]
    pub force_search: bool,
}

/// POST /api/chat — streams answer events over SSE.
pub async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>, ApiError> {
    info!(
        "Chat message for session {} ({} chars)",
        request.session_id,
        request.message.len()
    );

    state
        .repository
        .get_or_create_session(request.session_id, request.user_id, request.user_email.as_deref())
        .await?;
    state
        .repository
        .save_message(request.session_id, MessageType::User, &request.message)
        .await?;

    let stored_messages = state.repository.messages_for_session(request.session_id).await?;
    let all_history: Vec<_> = stored_messages.iter().map(|m| m.to_llm_message()).collect();

    // Summary-aware context: system prompt + latest summary + last messages
    let latest_summary = state.summarizer.latest_summary(request.session_id).await;
    let (summary_text, history_tail) = summary::context_messages(latest_summary.as_ref(), &all_history);

    let filters = IndexFilters {
        access_control_list: request.user_email.as_deref().map(|email| {
            DocumentAccess::acl_for_user(email, &request.group_ids)
        }),
        ..Default::default()
    };

    let search_tool: Arc<dyn Tool> = Arc::new(SearchTool::new(
        state.retrieval.clone(),
        filters,
        history_tail.clone(),
        request.user_email.clone(),
        request.group_ids.clone(),
        None,
    ));

    let force_use_tool = request.force_search.then(|| ForceUseTool {
        tool_name: search_tool.name().to_string(),
        args: Some(serde_json::json!({ "query": request.message })),
    });

    let answer_request = AnswerRequest {
        question: request.message.clone(),
        system_prompt: state.settings.chat.system_prompt.clone(),
        conversation_summary: summary_text,
        history: history_tail,
        tools: vec![search_tool],
        force_use_tool,
        uploaded_file_content: request.uploaded_file_content.clone(),
        prevent_hallucination: state.settings.chat.prevent_hallucination,
    };

    let connected = Arc::new(AtomicBool::new(true));
    let connected_probe = connected.clone();
    let event_stream = state.engine.clone().answer(
        answer_request,
        Arc::new(move || connected_probe.load(Ordering::Relaxed)),
    );

    // Accumulate the answer while forwarding events, then persist it and
    // kick the summarizer once the stream ends
    let state_for_persist = state.clone();
    let session_id = request.session_id;
    let user_email = request.user_email.clone();

    let sse_stream = async_stream::stream! {
        let mut event_stream = event_stream;
        let mut full_answer = String::new();
        let mut cited_doc_ids: Vec<String> = Vec::new();

        while let Some(event) = event_stream.next().await {
            match &event {
                AnswerEvent::AnswerPiece(piece) => full_answer.push_str(piece),
                AnswerEvent::Citation(info) => cited_doc_ids.push(info.document_id.clone()),
                _ => {}
            }
            let payload = serde_json::to_string(&event).unwrap_or_default();
            yield Ok::<_, std::convert::Infallible>(Event::default().data(payload));
        }

        if !full_answer.is_empty() {
            match state_for_persist
                .repository
                .save_message(session_id, MessageType::Assistant, &full_answer)
                .await
            {
                Ok(saved) => {
                    if !cited_doc_ids.is_empty() {
                        if let Err(e) = state_for_persist
                            .repository
                            .save_cited_docs(saved.id, &cited_doc_ids)
                            .await
                        {
                            warn!("Failed to save cited docs: {}", e);
                        }
                    }
                }
                Err(e) => warn!("Failed to persist assistant message: {}", e),
            }

            // Summarization runs after persistence, off the request path
            let summarizer = state_for_persist.summarizer.clone();
            let repository = state_for_persist.repository.clone();
            tokio::spawn(async move {
                let messages = match repository.messages_for_session(session_id).await {
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!("Could not load messages for summarization: {}", e);
                        return;
                    }
                };
                let llm_messages: Vec<_> = messages.iter().map(|m| m.to_llm_message()).collect();
                if let Err(e) = summarizer
                    .create_or_update(session_id, user_email.as_deref(), &llm_messages)
                    .await
                {
                    warn!("Summarization failed for session {}: {}", session_id, e);
                }
            });
        }
    };

    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::default()))
}
