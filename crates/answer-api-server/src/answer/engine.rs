use std::sync::Arc;

use futures::StreamExt;
use search_shared::llm::{
    retry_with_backoff, LlmClient, LlmError, LlmLimiter, LlmMessage, RetryPolicy, ToolCall,
    ToolCallAccumulator, ToolChoice, ToolDefinition,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::tools::{Tool, ToolOutput};

use super::chunked::{should_use_chunked_processing, ChunkedContentProcessor};
use super::citation::{map_document_id_order, CitationProcessor};
use super::events::{AnswerEvent, StreamStopReason};
use super::LlmDoc;

const MAX_TOOL_ROUNDS: usize = 3;
const NON_TOOL_CALLING_HISTORY_MESSAGES: usize = 10;

/// Caller-supplied directive that bypasses LLM tool choice. With args the
/// tool runs immediately; without, the LLM is forced to call it.
#[derive(Debug, Clone)]
pub struct ForceUseTool {
    pub tool_name: String,
    pub args: Option<serde_json::Value>,
}

pub struct AnswerRequest {
    pub question: String,
    pub system_prompt: String,
    pub conversation_summary: Option<String>,
    pub history: Vec<LlmMessage>,
    pub tools: Vec<Arc<dyn Tool>>,
    pub force_use_tool: Option<ForceUseTool>,
    pub uploaded_file_content: Option<String>,
    pub prevent_hallucination: bool,
}

pub type IsConnected = Arc<dyn Fn() -> bool + Send + Sync>;

enum StreamOutcome {
    Answered,
    Cancelled,
    ToolCalls(Vec<ToolCall>),
}

/// Drives the LLM call loop and emits the event stream: choose tool, run
/// tool, incorporate the result, maybe loop, then stream the cited answer.
/// Tool execution blocks this driver, never the caller's read loop.
pub struct AnswerEngine {
    llm: Arc<dyn LlmClient>,
    limiter: LlmLimiter,
    retry: RetryPolicy,
}

impl AnswerEngine {
    pub fn new(llm: Arc<dyn LlmClient>, limiter: LlmLimiter) -> Self {
        Self {
            llm,
            limiter,
            retry: RetryPolicy::default(),
        }
    }

    /// Lazy event stream; the state machine runs on its own task and the
    /// caller reads at its own pace.
    pub fn answer(
        self: Arc<Self>,
        request: AnswerRequest,
        is_connected: IsConnected,
    ) -> ReceiverStream<AnswerEvent> {
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let stop_reason = match self.drive(request, &is_connected, &tx).await {
                Ok(reason) => reason,
                Err(e) => {
                    error!("Answer engine failed: {}", e);
                    let _ = tx.send(AnswerEvent::StreamingError(e.to_string())).await;
                    StreamStopReason::Finished
                }
            };
            let _ = tx.send(AnswerEvent::StreamStop(stop_reason)).await;
        });

        ReceiverStream::new(rx)
    }

    async fn drive(
        &self,
        request: AnswerRequest,
        is_connected: &IsConnected,
        tx: &mpsc::Sender<AnswerEvent>,
    ) -> Result<StreamStopReason, LlmError> {
        let mut messages = self.build_base_messages(&request);
        let mut context_docs: Vec<LlmDoc> = Vec::new();
        let mut display_docs: Vec<LlmDoc> = Vec::new();
        let mut force = request.force_use_tool.clone();
        let mut searched_with_no_results = false;

        for round in 0..=MAX_TOOL_ROUNDS {
            if !is_connected() {
                return Ok(StreamStopReason::Cancelled);
            }

            // Forced tool with args: no decision to make, run it
            if let Some(forced) = force.take() {
                if let Some(args) = forced.args.clone() {
                    let tool = find_tool(&request.tools, &forced.tool_name).ok_or_else(|| {
                        LlmError::Api(format!("tool '{}' not found", forced.tool_name))
                    })?;
                    self.run_and_incorporate(
                        tool.as_ref(),
                        args,
                        &mut messages,
                        &mut context_docs,
                        &mut display_docs,
                        &mut searched_with_no_results,
                        tx,
                    )
                    .await?;
                    continue;
                }
                // Force by name only: reinstate so the streamed call gets
                // tool_choice=required on just that tool
                force = Some(forced);
            }

            // Non-tool-calling models pick their tool in a separate call
            if !self.llm.config().supports_tool_calling && !request.tools.is_empty() && round == 0 {
                if let Some((tool, args)) = self.choose_tool_via_prompt(&request).await {
                    self.run_and_incorporate(
                        tool.as_ref(),
                        args,
                        &mut messages,
                        &mut context_docs,
                        &mut display_docs,
                        &mut searched_with_no_results,
                        tx,
                    )
                    .await?;
                    continue;
                }
            }

            // Oversized content goes down the chunked path instead of
            // letting the provider reject the prompt
            if let Some(oversized) = self.oversized_content(&request, &messages) {
                info!("Prompt too large for the model window, using chunked processing");
                return self
                    .run_chunked(&request, &oversized, is_connected, tx)
                    .await;
            }

            let mut addendum_messages;
            let final_messages = if searched_with_no_results && request.prevent_hallucination {
                addendum_messages = messages.clone();
                apply_no_results_addendum(&mut addendum_messages);
                &addendum_messages
            } else {
                &messages
            };

            let (tools, tool_choice) = self.tools_for_round(&request, &force, round);
            let outcome = self
                .stream_llm_round(
                    final_messages,
                    tools.as_deref(),
                    tool_choice,
                    &context_docs,
                    &display_docs,
                    is_connected,
                    tx,
                )
                .await?;
            force = None;

            match outcome {
                StreamOutcome::Answered => return Ok(StreamStopReason::Finished),
                StreamOutcome::Cancelled => return Ok(StreamStopReason::Cancelled),
                StreamOutcome::ToolCalls(calls) => {
                    let Some(call) = calls.into_iter().next() else {
                        continue;
                    };
                    let Some(tool) = find_tool(&request.tools, &call.name) else {
                        warn!("Model requested unknown tool '{}'", call.name);
                        messages.push(LlmMessage::assistant_tool_calls(vec![call.clone()]));
                        messages.push(LlmMessage::tool_result(
                            call.id,
                            format!("Error: tool '{}' does not exist", call.name),
                        ));
                        continue;
                    };
                    messages.push(LlmMessage::assistant_tool_calls(vec![call.clone()]));
                    self.run_tool_call(
                        tool.as_ref(),
                        &call,
                        &mut messages,
                        &mut context_docs,
                        &mut display_docs,
                        &mut searched_with_no_results,
                        tx,
                    )
                    .await?;
                }
            }
        }

        warn!("Tool round limit reached without a final answer");
        Ok(StreamStopReason::Finished)
    }

    fn build_base_messages(&self, request: &AnswerRequest) -> Vec<LlmMessage> {
        let mut system = request.system_prompt.clone();
        if let Some(ref summary) = request.conversation_summary {
            system.push_str("\n\nSummary of the conversation so far:\n");
            system.push_str(summary);
        }

        let mut messages = vec![LlmMessage::system(system)];
        messages.extend(request.history.clone());

        let mut question = request.question.clone();
        if let Some(ref file_content) = request.uploaded_file_content {
            // Oversized file content is detected before the final prompt is
            // built; here it simply rides along with the question
            question.push_str("\n\n");
            question.push_str(file_content);
        }
        messages.push(LlmMessage::user(question));
        messages
    }

    fn tools_for_round(
        &self,
        request: &AnswerRequest,
        force: &Option<ForceUseTool>,
        round: usize,
    ) -> (Option<Vec<ToolDefinition>>, Option<ToolChoice>) {
        if !self.llm.config().supports_tool_calling || request.tools.is_empty() {
            return (None, None);
        }
        // The final permitted round must produce an answer, not more calls
        if round >= MAX_TOOL_ROUNDS {
            return (None, None);
        }
        if let Some(forced) = force {
            let definitions: Vec<ToolDefinition> = request
                .tools
                .iter()
                .filter(|t| t.name() == forced.tool_name)
                .map(|t| t.definition())
                .collect();
            if !definitions.is_empty() {
                return (Some(definitions), Some(ToolChoice::Required));
            }
        }
        let definitions = request.tools.iter().map(|t| t.definition()).collect();
        (Some(definitions), Some(ToolChoice::Auto))
    }

    /// One streamed LLM call piped through the tool handler and the
    /// citation handler, in that order.
    #[allow(clippy::too_many_arguments)]
    async fn stream_llm_round(
        &self,
        messages: &[LlmMessage],
        tools: Option<&[ToolDefinition]>,
        tool_choice: Option<ToolChoice>,
        context_docs: &[LlmDoc],
        display_docs: &[LlmDoc],
        is_connected: &IsConnected,
        tx: &mpsc::Sender<AnswerEvent>,
    ) -> Result<StreamOutcome, LlmError> {
        let _permit = self.limiter.acquire("answer_stream").await?;

        let final_mapping = map_document_id_order(context_docs);
        let display_mapping = if display_docs.is_empty() {
            final_mapping.clone()
        } else {
            map_document_id_order(display_docs)
        };
        let mut citations =
            CitationProcessor::new(context_docs.to_vec(), final_mapping, display_mapping, None);
        let mut tool_calls = ToolCallAccumulator::new();

        let mut stream = self
            .llm
            .stream(messages, tools, tool_choice, None)
            .await?;

        while let Some(delta) = stream.next().await {
            if !is_connected() {
                debug!("Caller disconnected mid-stream");
                return Ok(StreamOutcome::Cancelled);
            }

            let delta = delta?;
            if let Some(tool_delta) = delta.tool_call {
                tool_calls.push(tool_delta);
            }
            if let Some(content) = delta.content {
                if !content.is_empty() {
                    for event in citations.process_token(Some(&content)) {
                        if tx.send(event).await.is_err() {
                            return Ok(StreamOutcome::Cancelled);
                        }
                    }
                }
            }
        }

        if !tool_calls.is_empty() {
            return Ok(StreamOutcome::ToolCalls(tool_calls.finish()));
        }

        for event in citations.process_token(None) {
            if tx.send(event).await.is_err() {
                return Ok(StreamOutcome::Cancelled);
            }
        }
        Ok(StreamOutcome::Answered)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_tool_call(
        &self,
        tool: &dyn Tool,
        call: &ToolCall,
        messages: &mut Vec<LlmMessage>,
        context_docs: &mut Vec<LlmDoc>,
        display_docs: &mut Vec<LlmDoc>,
        searched_with_no_results: &mut bool,
        tx: &mpsc::Sender<AnswerEvent>,
    ) -> Result<(), LlmError> {
        let _ = tx
            .send(AnswerEvent::ToolKickoff {
                tool_name: call.name.clone(),
                tool_args: call.arguments.clone(),
            })
            .await;

        let output = match tool.run(&call.arguments).await {
            Ok(output) => output,
            Err(e) => {
                // The model gets the error back and may recover
                warn!("Tool '{}' failed: {}", call.name, e);
                let body = serde_json::json!({ "error": e.to_string() });
                let _ = tx
                    .send(AnswerEvent::ToolResponse {
                        tool_name: call.name.clone(),
                        response: body.clone(),
                    })
                    .await;
                messages.push(LlmMessage::tool_result(call.id.clone(), body.to_string()));
                return Ok(());
            }
        };

        let _ = tx
            .send(AnswerEvent::ToolResponse {
                tool_name: call.name.clone(),
                response: output.response.clone(),
            })
            .await;

        self.incorporate_output(
            call.id.clone(),
            output,
            messages,
            context_docs,
            display_docs,
            searched_with_no_results,
        );
        Ok(())
    }

    /// Forced/pre-selected tools run without a model-issued call id.
    #[allow(clippy::too_many_arguments)]
    async fn run_and_incorporate(
        &self,
        tool: &dyn Tool,
        args: serde_json::Value,
        messages: &mut Vec<LlmMessage>,
        context_docs: &mut Vec<LlmDoc>,
        display_docs: &mut Vec<LlmDoc>,
        searched_with_no_results: &mut bool,
        tx: &mpsc::Sender<AnswerEvent>,
    ) -> Result<(), LlmError> {
        let call = ToolCall {
            id: format!("forced_{}", tool.name()),
            name: tool.name().to_string(),
            arguments: args,
        };
        messages.push(LlmMessage::assistant_tool_calls(vec![call.clone()]));
        self.run_tool_call(
            tool,
            &call,
            messages,
            context_docs,
            display_docs,
            searched_with_no_results,
            tx,
        )
        .await
    }

    fn incorporate_output(
        &self,
        call_id: String,
        output: ToolOutput,
        messages: &mut Vec<LlmMessage>,
        context_docs: &mut Vec<LlmDoc>,
        display_docs: &mut Vec<LlmDoc>,
        searched_with_no_results: &mut bool,
    ) {
        if let Some(docs) = output.context_docs {
            *searched_with_no_results = docs.is_empty();
            *context_docs = docs;
        }
        if let Some(docs) = output.display_docs {
            *display_docs = docs;
        }
        messages.push(LlmMessage::tool_result(call_id, output.response.to_string()));
    }

    /// Tool selection for models without native function calling: a
    /// separate LLM call over a truncated history answers with JSON.
    async fn choose_tool_via_prompt(
        &self,
        request: &AnswerRequest,
    ) -> Option<(Arc<dyn Tool>, serde_json::Value)> {
        let tool_list = request
            .tools
            .iter()
            .map(|t| format!("- {}: {}", t.name(), t.description()))
            .collect::<Vec<_>>()
            .join("\n");

        let history_tail: Vec<&LlmMessage> = request
            .history
            .iter()
            .rev()
            .take(NON_TOOL_CALLING_HISTORY_MESSAGES)
            .collect();
        let history_str = history_tail
            .iter()
            .rev()
            .map(|m| {
                format!(
                    "{:?}: {}",
                    m.role,
                    search_shared::text::truncate_to_tokens(&m.content, 256)
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "You can use the following tools:\n{tool_list}\n\n\
             Conversation so far:\n{history_str}\n\n\
             User question: {}\n\n\
             If a tool would help answer, respond with JSON: \
             {{\"tool\": \"<name>\", \"args\": {{...}}}}. \
             If no tool is needed, respond with JSON: {{\"tool\": null}}.",
            request.question
        );

        let result = retry_with_backoff("tool_selection", &self.retry, || {
            let messages = vec![LlmMessage::user(prompt.clone())];
            async move { self.llm.complete(&messages, None, None, None).await }
        })
        .await;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                warn!("Tool selection call failed: {}", e);
                return None;
            }
        };

        let json_str = extract_first_json_object(&output)?;
        let parsed: serde_json::Value = serde_json::from_str(json_str).ok()?;
        let tool_name = parsed.get("tool")?.as_str()?;
        let tool = find_tool(&request.tools, tool_name)?;
        let args = parsed
            .get("args")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        debug!("Pre-selected tool '{}' with args {}", tool_name, args);
        Some((tool, args))
    }

    /// The content that makes the prompt oversized, if any.
    fn oversized_content(
        &self,
        request: &AnswerRequest,
        messages: &[LlmMessage],
    ) -> Option<String> {
        let content = request.uploaded_file_content.clone()?;
        let max_tokens = self.llm.config().max_input_tokens;

        // Everything except the user-content message counts as fixed
        let base = &messages[..messages.len().saturating_sub(1)];
        if should_use_chunked_processing(&content, max_tokens, base) {
            Some(content)
        } else {
            None
        }
    }

    async fn run_chunked(
        &self,
        request: &AnswerRequest,
        content: &str,
        is_connected: &IsConnected,
        tx: &mpsc::Sender<AnswerEvent>,
    ) -> Result<StreamStopReason, LlmError> {
        let _permit = self.limiter.acquire("chunked_processing").await?;

        let base_messages = vec![LlmMessage::system(request.system_prompt.clone())];
        let processor =
            ChunkedContentProcessor::new(self.llm.as_ref(), self.llm.config().max_input_tokens);

        let (piece_tx, mut piece_rx) = mpsc::unbounded_channel::<String>();
        let forward = async {
            while let Some(piece) = piece_rx.recv().await {
                if !is_connected() {
                    return StreamStopReason::Cancelled;
                }
                if tx.send(AnswerEvent::AnswerPiece(piece)).await.is_err() {
                    return StreamStopReason::Cancelled;
                }
            }
            StreamStopReason::Finished
        };

        let process = processor.process(content, &request.question, &base_messages, move |piece| {
            let _ = piece_tx.send(piece);
        });

        let (result, stop_reason) = tokio::join!(process, forward);
        match result {
            Ok(()) => Ok(stop_reason),
            Err(e) => {
                // Chunked processing was the fallback; surface the failure
                // and end the stream cleanly
                let _ = tx.send(AnswerEvent::StreamingError(e.to_string())).await;
                Ok(StreamStopReason::Finished)
            }
        }
    }
}

fn find_tool(tools: &[Arc<dyn Tool>], name: &str) -> Option<Arc<dyn Tool>> {
    tools.iter().find(|t| t.name() == name).cloned()
}

fn apply_no_results_addendum(messages: &mut [LlmMessage]) {
    if let Some(system) = messages.first_mut() {
        system.content.push_str(
            "\n\nThe search returned no relevant documents. State clearly that no relevant \
             information was found; do not fabricate an answer from general knowledge.",
        );
    }
}

/// Extract the first complete JSON object from possibly noisy LLM output.
/// Handles nested braces and braces inside JSON strings (with escapes).
pub fn extract_first_json_object(s: &str) -> Option<&str> {
    let mut start: Option<usize> = None;
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in s.char_indices() {
        if start.is_none() {
            if ch == '{' {
                start = Some(i);
                depth = 1;
                in_string = false;
                escaped = false;
            }
            continue;
        }

        if in_string {
            if escaped {
                escaped = false;
                continue;
            }
            match ch {
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let st = start?;
                    return Some(&s[st..=i]);
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use search_shared::llm::{LlmConfig, LlmStream, StreamDelta};
    use search_shared::models::DocumentSource;
    use std::sync::Mutex;

    fn doc(id: &str) -> LlmDoc {
        LlmDoc {
            document_id: id.to_string(),
            semantic_identifier: id.to_string(),
            link: Some(format!("http://{id}")),
            source: DocumentSource::Web,
            content: "body".to_string(),
            blurb: "body".to_string(),
            metadata: Default::default(),
            updated_at: None,
        }
    }

    /// Scripted LLM: pops one canned response per call.
    struct ScriptedLlm {
        config: LlmConfig,
        stream_scripts: Mutex<Vec<Vec<StreamDelta>>>,
        complete_scripts: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn new(supports_tools: bool, streams: Vec<Vec<StreamDelta>>, completes: Vec<String>) -> Self {
            Self {
                config: LlmConfig {
                    model_name: "test-model".to_string(),
                    max_input_tokens: 8192,
                    supports_tool_calling: supports_tools,
                },
                stream_scripts: Mutex::new(streams),
                complete_scripts: Mutex::new(completes),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        fn config(&self) -> &LlmConfig {
            &self.config
        }

        async fn complete(
            &self,
            _messages: &[LlmMessage],
            _tools: Option<&[ToolDefinition]>,
            _tool_choice: Option<ToolChoice>,
            _format: Option<serde_json::Value>,
        ) -> Result<String, LlmError> {
            let mut scripts = self.complete_scripts.lock().unwrap();
            if scripts.is_empty() {
                return Ok("done".to_string());
            }
            Ok(scripts.remove(0))
        }

        async fn stream(
            &self,
            _messages: &[LlmMessage],
            _tools: Option<&[ToolDefinition]>,
            _tool_choice: Option<ToolChoice>,
            _format: Option<serde_json::Value>,
        ) -> Result<LlmStream, LlmError> {
            let mut scripts = self.stream_scripts.lock().unwrap();
            let deltas = if scripts.is_empty() {
                Vec::new()
            } else {
                scripts.remove(0)
            };
            Ok(Box::pin(futures::stream::iter(
                deltas.into_iter().map(Ok),
            )))
        }
    }

    struct CannedSearchTool {
        docs: Vec<LlmDoc>,
    }

    #[async_trait]
    impl Tool for CannedSearchTool {
        fn name(&self) -> &str {
            "run_search"
        }
        fn description(&self) -> &str {
            "search"
        }
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "run_search".to_string(),
                description: "search".to_string(),
                parameters: serde_json::json!({"type": "object"}),
            }
        }
        async fn run(&self, _args: &serde_json::Value) -> anyhow::Result<ToolOutput> {
            Ok(ToolOutput {
                response: serde_json::json!({"results": self.docs.len()}),
                context_docs: Some(self.docs.clone()),
                display_docs: Some(self.docs.clone()),
            })
        }
    }

    fn text_delta(text: &str) -> StreamDelta {
        StreamDelta {
            content: Some(text.to_string()),
            tool_call: None,
        }
    }

    fn always_connected() -> IsConnected {
        Arc::new(|| true)
    }

    async fn collect(stream: ReceiverStream<AnswerEvent>) -> Vec<AnswerEvent> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_plain_answer_streams_and_finishes() {
        let llm = Arc::new(ScriptedLlm::new(
            true,
            vec![vec![text_delta("Hello "), text_delta("world.")]],
            vec![],
        ));
        let engine = Arc::new(AnswerEngine::new(llm, LlmLimiter::default()));

        let events = collect(engine.answer(
            AnswerRequest {
                question: "hi".to_string(),
                system_prompt: "be helpful".to_string(),
                conversation_summary: None,
                history: vec![],
                tools: vec![],
                force_use_tool: None,
                uploaded_file_content: None,
                prevent_hallucination: false,
            },
            always_connected(),
        ))
        .await;

        let text: String = events
            .iter()
            .filter_map(|e| match e {
                AnswerEvent::AnswerPiece(p) => Some(p.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello world.");
        assert!(matches!(
            events.last(),
            Some(AnswerEvent::StreamStop(StreamStopReason::Finished))
        ));
    }

    #[tokio::test]
    async fn test_forced_tool_runs_before_answer_and_events_precede_pieces() {
        let llm = Arc::new(ScriptedLlm::new(
            true,
            vec![vec![text_delta("From docs: [1] says hi.")]],
            vec![],
        ));
        let engine = Arc::new(AnswerEngine::new(llm, LlmLimiter::default()));

        let events = collect(engine.answer(
            AnswerRequest {
                question: "hi".to_string(),
                system_prompt: "sys".to_string(),
                conversation_summary: None,
                history: vec![],
                tools: vec![Arc::new(CannedSearchTool { docs: vec![doc("A")] })],
                force_use_tool: Some(ForceUseTool {
                    tool_name: "run_search".to_string(),
                    args: Some(serde_json::json!({"query": "hi"})),
                }),
                uploaded_file_content: None,
                prevent_hallucination: false,
            },
            always_connected(),
        ))
        .await;

        let kickoff_idx = events
            .iter()
            .position(|e| matches!(e, AnswerEvent::ToolKickoff { .. }))
            .expect("kickoff emitted");
        let response_idx = events
            .iter()
            .position(|e| matches!(e, AnswerEvent::ToolResponse { .. }))
            .expect("tool response emitted");
        let first_piece_idx = events
            .iter()
            .position(|e| matches!(e, AnswerEvent::AnswerPiece(_)))
            .expect("answer streamed");
        assert!(kickoff_idx < response_idx);
        assert!(response_idx < first_piece_idx);

        // The citation against the forced search's doc was rewritten
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                AnswerEvent::AnswerPiece(p) => Some(p.clone()),
                _ => None,
            })
            .collect();
        assert!(text.contains("[[1]](http://A)"), "got: {text}");
        assert!(events
            .iter()
            .any(|e| matches!(e, AnswerEvent::Citation(c) if c.document_id == "A")));
    }

    #[tokio::test]
    async fn test_cancellation_emits_cancelled_stop() {
        let llm = Arc::new(ScriptedLlm::new(
            true,
            vec![vec![text_delta("never "), text_delta("seen")]],
            vec![],
        ));
        let engine = Arc::new(AnswerEngine::new(llm, LlmLimiter::default()));

        let events = collect(engine.answer(
            AnswerRequest {
                question: "hi".to_string(),
                system_prompt: "sys".to_string(),
                conversation_summary: None,
                history: vec![],
                tools: vec![],
                force_use_tool: None,
                uploaded_file_content: None,
                prevent_hallucination: false,
            },
            Arc::new(|| false),
        ))
        .await;

        assert!(matches!(
            events.last(),
            Some(AnswerEvent::StreamStop(StreamStopReason::Cancelled))
        ));
    }

    #[tokio::test]
    async fn test_non_tool_calling_llm_preselects_tool() {
        let llm = Arc::new(ScriptedLlm::new(
            false,
            vec![vec![text_delta("answer after search")]],
            vec![r#"{"tool": "run_search", "args": {"query": "x"}}"#.to_string()],
        ));
        let engine = Arc::new(AnswerEngine::new(llm, LlmLimiter::default()));

        let events = collect(engine.answer(
            AnswerRequest {
                question: "hi".to_string(),
                system_prompt: "sys".to_string(),
                conversation_summary: None,
                history: vec![],
                tools: vec![Arc::new(CannedSearchTool { docs: vec![doc("A")] })],
                force_use_tool: None,
                uploaded_file_content: None,
                prevent_hallucination: false,
            },
            always_connected(),
        ))
        .await;

        assert!(events
            .iter()
            .any(|e| matches!(e, AnswerEvent::ToolKickoff { tool_name, .. } if tool_name == "run_search")));
    }

    #[test]
    fn test_extract_first_json_object() {
        assert_eq!(
            extract_first_json_object("noise {\"a\": {\"b\": 1}} trailing"),
            Some("{\"a\": {\"b\": 1}}")
        );
        assert_eq!(
            extract_first_json_object("{\"s\": \"has } brace\"}"),
            Some("{\"s\": \"has } brace\"}")
        );
        assert_eq!(extract_first_json_object("no json here"), None);
        assert_eq!(extract_first_json_object("{unclosed"), None);
    }
}
