//! Per-browser-session state and the user-facing operations on it.
//!
//! Every operation catches its own failures: the error is logged, queued
//! as a notice for the page, and the caller gets a safe default back.

use crate::ai_sdk::{Assistant, FileBatch, RunStatus, VectorStore};
use crate::client::{AssistantsApi, ProviderClient, UploadFile};
use crate::config::{Backend, Credentials};
use crate::conversation::{ChatMessage, Conversation, PollPolicy, TurnOutcome};
use crate::error::{PanelError, PanelResult};
use crate::protocol::{Notice, RenderedMessage, SessionView};
use crate::registry::{self, VectorStoreDetails};
use std::sync::Arc;

/// Progress of a chat turn as it happens.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    UserAccepted(ChatMessage),
    RunStatus(RunStatus),
}

pub struct Session {
    backend: Backend,
    client: Option<Arc<dyn AssistantsApi>>,
    assistant: Option<Assistant>,
    conversation: Conversation,
    vector_store: Option<VectorStore>,
    notices: Vec<Notice>,
    policy: PollPolicy,
}

impl Session {
    pub fn new(backend: Backend, policy: PollPolicy) -> Self {
        Self {
            backend,
            client: None,
            assistant: None,
            conversation: Conversation::new(),
            vector_store: None,
            notices: Vec::new(),
            policy,
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn assistant(&self) -> Option<&Assistant> {
        self.assistant.as_ref()
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn is_initialized(&self) -> bool {
        self.client.is_some()
    }

    pub fn drain_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    fn report(&mut self, error: PanelError) {
        tracing::warn!(%error, "operation failed");
        self.notices.push(Notice::error(error.to_string()));
    }

    fn success(&mut self, message: impl Into<String>) {
        self.notices.push(Notice::success(message));
    }

    fn api(&self) -> PanelResult<Arc<dyn AssistantsApi>> {
        self.client.clone().ok_or(PanelError::NoClient)
    }

    fn selected_assistant_id(&self) -> PanelResult<String> {
        self.assistant
            .as_ref()
            .map(|assistant| assistant.id.clone())
            .ok_or(PanelError::NoAssistant)
    }

    /// Builds a client for `backend` from the environment. On failure the
    /// session is left without a client.
    pub async fn initialize(&mut self, backend: Backend) -> bool {
        self.backend = backend;
        let connected = match Credentials::from_env(backend) {
            Ok(credentials) => ProviderClient::connect(credentials).await,
            Err(error) => Err(error),
        };
        match connected {
            Ok(client) => {
                self.install_client(Arc::new(client));
                self.success("Client initialized successfully!");
                true
            }
            Err(error) => {
                self.client = None;
                self.report(error);
                false
            }
        }
    }

    /// Replaces the client handle; everything selected under the old one
    /// is dropped.
    pub fn install_client(&mut self, client: Arc<dyn AssistantsApi>) {
        tracing::info!(backend = %client.backend(), "client initialized");
        self.backend = client.backend();
        self.client = Some(client);
        self.assistant = None;
        self.vector_store = None;
        self.conversation.reset();
    }

    pub async fn list_assistants(&mut self) -> Vec<Assistant> {
        let result = match self.api() {
            Ok(api) => registry::list_assistants(api.as_ref()).await,
            Err(error) => Err(error),
        };
        result.unwrap_or_else(|error| {
            self.report(error);
            Vec::new()
        })
    }

    pub async fn create_assistant(
        &mut self,
        name: &str,
        instructions: &str,
        model: &str,
        code_interpreter: bool,
        file_search: bool,
    ) -> Option<Assistant> {
        let result = match self.api() {
            Ok(api) => {
                let tools = registry::tool_set(code_interpreter, file_search);
                registry::create_assistant(api.as_ref(), name, instructions, model, tools, None)
                    .await
            }
            Err(error) => Err(error),
        };
        match result {
            Ok(assistant) => {
                self.success(format!("Assistant '{}' created successfully!", name));
                self.select(assistant.clone());
                Some(assistant)
            }
            Err(error) => {
                self.report(error);
                None
            }
        }
    }

    pub async fn select_assistant(&mut self, assistant_id: &str) -> Option<Assistant> {
        let found = self
            .list_assistants()
            .await
            .into_iter()
            .find(|assistant| assistant.id == assistant_id);
        match found {
            Some(assistant) => {
                self.select(assistant.clone());
                Some(assistant)
            }
            None => {
                if self.is_initialized() {
                    self.report(PanelError::BadRequest(format!(
                        "assistant {} not found",
                        assistant_id
                    )));
                }
                None
            }
        }
    }

    fn select(&mut self, assistant: Assistant) {
        if self.vector_store.as_ref().map(|vs| vs.id.as_str()) != assistant.vector_store_id() {
            self.vector_store = None;
        }
        self.assistant = Some(assistant);
    }

    /// Updates the selected assistant; `None` fields are left as they are.
    pub async fn update_assistant(
        &mut self,
        instructions: Option<String>,
        model: Option<String>,
    ) -> Option<Assistant> {
        let result = self.apply_update(instructions, model, None).await;
        self.finish_update(result, "Assistant updated successfully!")
    }

    /// Points the selected assistant's document search at one vector store.
    pub async fn bind_vector_store(&mut self, vector_store_id: &str) -> Option<Assistant> {
        let result = self.apply_update(None, None, Some(vector_store_id)).await;
        self.finish_update(
            result,
            format!("Assistant updated with vector store {}", vector_store_id),
        )
    }

    async fn apply_update(
        &self,
        instructions: Option<String>,
        model: Option<String>,
        vector_store_id: Option<&str>,
    ) -> PanelResult<Assistant> {
        let api = self.api()?;
        let assistant_id = self.selected_assistant_id()?;
        registry::update_assistant(
            api.as_ref(),
            &assistant_id,
            instructions,
            model,
            vector_store_id,
        )
        .await
    }

    fn finish_update(
        &mut self,
        result: PanelResult<Assistant>,
        message: impl Into<String>,
    ) -> Option<Assistant> {
        match result {
            Ok(assistant) => {
                self.success(message);
                self.select(assistant.clone());
                Some(assistant)
            }
            Err(error) => {
                self.report(error);
                None
            }
        }
    }

    pub async fn list_vector_stores(&mut self) -> Vec<VectorStore> {
        let result = match self.api() {
            Ok(api) => registry::list_vector_stores(api.as_ref()).await,
            Err(error) => Err(error),
        };
        result.unwrap_or_else(|error| {
            self.report(error);
            Vec::new()
        })
    }

    /// Creates a store and, when an assistant is selected, binds it. The
    /// store only becomes the session's store once the binding holds.
    pub async fn create_vector_store(&mut self, name: &str) -> Option<VectorStore> {
        let result = match self.api() {
            Ok(api) => registry::create_vector_store(api.as_ref(), name).await,
            Err(error) => Err(error),
        };
        let store = match result {
            Ok(store) => store,
            Err(error) => {
                self.report(error);
                return None;
            }
        };
        self.success(format!("Vector Store '{}' created successfully!", name));
        if self.assistant.is_some() && self.bind_vector_store(&store.id).await.is_none() {
            return Some(store);
        }
        self.vector_store = Some(store.clone());
        Some(store)
    }

    /// Id of the store the selected assistant searches, if any.
    pub fn current_vector_store_id(&self) -> Option<String> {
        self.assistant
            .as_ref()
            .and_then(|assistant| assistant.vector_store_id())
            .map(str::to_string)
    }

    pub async fn vector_store_details(&mut self) -> Option<VectorStoreDetails> {
        let result = match (self.api(), self.current_vector_store_id()) {
            (Ok(api), Some(id)) => registry::vector_store_details(api.as_ref(), &id).await,
            (Err(error), _) => Err(error),
            (_, None) => Err(PanelError::NoVectorStore),
        };
        match result {
            Ok(details) => {
                self.vector_store = Some(details.store.clone());
                Some(details)
            }
            Err(error) => {
                self.report(error);
                None
            }
        }
    }

    pub async fn upload_to_vector_store(&mut self, files: Vec<UploadFile>) -> Option<FileBatch> {
        let result = match (self.api(), self.current_vector_store_id()) {
            (Ok(api), Some(id)) => {
                registry::upload_files_to_vector_store(api.as_ref(), &id, &files, self.policy)
                    .await
            }
            (Err(error), _) => Err(error),
            (_, None) => Err(PanelError::NoVectorStore),
        };
        match result {
            Ok(batch) => {
                self.success(format!(
                    "Files uploaded successfully! {} of {} files processed.",
                    batch.file_counts.completed, batch.file_counts.total
                ));
                Some(batch)
            }
            Err(error) => {
                self.report(error);
                None
            }
        }
    }

    /// Opens a fresh thread and clears the transcript.
    pub async fn new_chat(&mut self) -> Option<String> {
        let api = match self.api().and_then(|api| {
            self.selected_assistant_id()?;
            Ok(api)
        }) {
            Ok(api) => api,
            Err(error) => {
                self.report(error);
                return None;
            }
        };
        match self.conversation.create_thread(api.as_ref()).await {
            Ok(thread) => Some(thread.id.clone()),
            Err(error) => {
                self.report(error);
                None
            }
        }
    }

    /// Runs one chat turn. Attachments are uploaded first; if that fails
    /// the message is still sent, without them.
    pub async fn send_message(
        &mut self,
        text: &str,
        attachments: Vec<UploadFile>,
        on_event: &mut (dyn FnMut(TurnEvent) + Send),
    ) -> Option<ChatMessage> {
        let (api, assistant_id) = match self.api().and_then(|api| {
            let assistant_id = self.selected_assistant_id()?;
            Ok((api, assistant_id))
        }) {
            Ok(pair) => pair,
            Err(error) => {
                self.report(error);
                return None;
            }
        };

        let mut file_ids = Vec::new();
        if !attachments.is_empty() {
            match registry::upload_files(api.as_ref(), &attachments).await {
                Ok(ids) => file_ids = ids,
                Err(error) => {
                    self.report(error);
                    self.notices
                        .push(Notice::warning("Message sent without its attachments."));
                }
            }
        }

        if let Err(error) = self
            .conversation
            .submit_message(api.as_ref(), text, &file_ids)
            .await
        {
            self.report(error);
            return None;
        }
        on_event(TurnEvent::UserAccepted(ChatMessage::user(text)));

        if let Err(error) = self.conversation.start_run(api.as_ref(), &assistant_id).await {
            self.report(error);
            return None;
        }

        let outcome = self
            .conversation
            .await_run(api.as_ref(), self.policy, &mut |status| {
                on_event(TurnEvent::RunStatus(status))
            })
            .await;

        match outcome {
            Ok(TurnOutcome::RunComplete { reply, .. }) => Some(reply),
            Ok(TurnOutcome::RunFailed { error, .. }) | Err(error) => {
                self.report(error);
                None
            }
        }
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            backend: self.backend,
            initialized: self.is_initialized(),
            assistant: self.assistant.clone(),
            vector_store_id: self.current_vector_store_id(),
            vector_store: self.vector_store.clone(),
            thread_id: self.conversation.thread_id().map(str::to_string),
            turn: self.conversation.state().clone(),
            messages: self
                .conversation
                .messages()
                .iter()
                .map(RenderedMessage::from)
                .collect(),
        }
    }
}
