//! In-memory provider used by unit tests.

use crate::ai_sdk::{
    Assistant, BatchStatus, CreateAssistantRequest, CreateMessageRequest, CreateRunRequest,
    FileBatch, FileCounts, FileObject, MessageContent, MessageText, Role, Run, RunError,
    RunStatus, Thread, ThreadMessage, UpdateAssistantRequest, VectorStore, VectorStoreFile,
};
use crate::client::{AssistantsApi, UploadFile};
use crate::config::Backend;
use crate::error::{PanelError, PanelResult};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
struct FakeState {
    next_id: usize,
    assistants: Vec<Assistant>,
    vector_stores: Vec<VectorStore>,
    store_files: HashMap<String, Vec<String>>,
    files: Vec<FileObject>,
    batch_statuses: VecDeque<BatchStatus>,
    batch_polls: usize,
    // newest first, like the provider
    thread_messages: HashMap<String, Vec<ThreadMessage>>,
    message_requests: Vec<CreateMessageRequest>,
    update_requests: Vec<UpdateAssistantRequest>,
    run_statuses: VecDeque<RunStatus>,
    run_status_reads: usize,
    run_reads_before_failure: Option<usize>,
    run_error: Option<String>,
    runs_created: usize,
    pending_reply: Option<String>,
    failing: HashSet<&'static str>,
}

impl FakeState {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}_{}", prefix, self.next_id)
    }

    fn check(&self, operation: &'static str) -> PanelResult<()> {
        if self.failing.contains(operation) {
            Err(PanelError::remote(operation, "injected failure"))
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeApi {
    state: Mutex<FakeState>,
}

impl FakeApi {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Statuses returned by successive run reads; the last one repeats.
    pub(crate) fn with_run_statuses(self, statuses: &[RunStatus]) -> Self {
        self.lock().run_statuses = statuses.iter().copied().collect();
        self
    }

    /// Batch statuses returned by successive batch reads; the last one repeats.
    pub(crate) fn with_batch_statuses(self, statuses: &[BatchStatus]) -> Self {
        self.lock().batch_statuses = statuses.iter().copied().collect();
        self
    }

    /// `last_error.message` carried by every non-completed terminal run.
    pub(crate) fn with_run_error(self, message: &str) -> Self {
        self.lock().run_error = Some(message.to_string());
        self
    }

    /// Run reads succeed `reads` times, then fail.
    pub(crate) fn failing_run_reads_after(self, reads: usize) -> Self {
        self.lock().run_reads_before_failure = Some(reads);
        self
    }

    pub(crate) fn failing(self, operation: &'static str) -> Self {
        self.lock().failing.insert(operation);
        self
    }

    /// Text the assistant "writes" into the thread when a run completes.
    pub(crate) fn set_reply(&self, text: &str) {
        self.lock().pending_reply = Some(text.to_string());
    }

    pub(crate) fn push_thread_message(&self, thread_id: &str, role: Role, text: &str) {
        let mut state = self.lock();
        let id = state.id("msg");
        state
            .thread_messages
            .entry(thread_id.to_string())
            .or_default()
            .insert(0, text_message(id, role, text));
    }

    pub(crate) fn insert_assistant(&self, assistant: Assistant) {
        self.lock().assistants.push(assistant);
    }

    pub(crate) fn assistant(&self, id: &str) -> Option<Assistant> {
        self.lock().assistants.iter().find(|a| a.id == id).cloned()
    }

    pub(crate) fn run_status_reads(&self) -> usize {
        self.lock().run_status_reads
    }

    pub(crate) fn runs_created(&self) -> usize {
        self.lock().runs_created
    }

    pub(crate) fn batch_polls(&self) -> usize {
        self.lock().batch_polls
    }

    pub(crate) fn uploaded_files(&self) -> Vec<FileObject> {
        self.lock().files.clone()
    }

    pub(crate) fn last_message_request(&self) -> Option<CreateMessageRequest> {
        self.lock().message_requests.last().cloned()
    }

    pub(crate) fn update_requests(&self) -> Vec<UpdateAssistantRequest> {
        self.lock().update_requests.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }
}

fn text_message(id: String, role: Role, text: &str) -> ThreadMessage {
    ThreadMessage {
        id,
        role,
        content: vec![MessageContent::Text {
            text: MessageText {
                value: text.to_string(),
                annotations: Vec::new(),
            },
        }],
        attachments: Vec::new(),
    }
}

pub(crate) fn assistant(id: &str, name: &str, model: &str) -> Assistant {
    Assistant {
        id: id.to_string(),
        name: Some(name.to_string()),
        instructions: Some("Be helpful.".to_string()),
        model: model.to_string(),
        tools: Vec::new(),
        tool_resources: None,
    }
}

#[async_trait]
impl AssistantsApi for FakeApi {
    fn backend(&self) -> Backend {
        Backend::Direct
    }

    async fn create_assistant(&self, request: &CreateAssistantRequest) -> PanelResult<Assistant> {
        let mut state = self.lock();
        state.check("create assistant")?;
        let created = Assistant {
            id: state.id("asst"),
            name: Some(request.name.clone()),
            instructions: Some(request.instructions.clone()),
            model: request.model.clone(),
            tools: request.tools.iter().copied().map(Into::into).collect(),
            tool_resources: request.tool_resources.clone(),
        };
        state.assistants.push(created.clone());
        Ok(created)
    }

    async fn update_assistant(
        &self,
        assistant_id: &str,
        request: &UpdateAssistantRequest,
    ) -> PanelResult<Assistant> {
        let mut state = self.lock();
        state.check("update assistant")?;
        state.update_requests.push(request.clone());
        let assistant = state
            .assistants
            .iter_mut()
            .find(|a| a.id == assistant_id)
            .ok_or_else(|| PanelError::remote("update assistant", "404 - not found"))?;
        if let Some(instructions) = &request.instructions {
            assistant.instructions = Some(instructions.clone());
        }
        if let Some(model) = &request.model {
            assistant.model = model.clone();
        }
        if let Some(resources) = &request.tool_resources {
            assistant.tool_resources = Some(resources.clone());
        }
        Ok(assistant.clone())
    }

    async fn list_assistants(&self) -> PanelResult<Vec<Assistant>> {
        let state = self.lock();
        state.check("list assistants")?;
        Ok(state.assistants.clone())
    }

    async fn create_vector_store(&self, name: &str) -> PanelResult<VectorStore> {
        let mut state = self.lock();
        state.check("create vector store")?;
        let store = VectorStore {
            id: state.id("vs"),
            name: Some(name.to_string()),
            file_counts: None,
        };
        state.vector_stores.push(store.clone());
        Ok(store)
    }

    async fn retrieve_vector_store(&self, vector_store_id: &str) -> PanelResult<VectorStore> {
        let state = self.lock();
        state.check("retrieve vector store")?;
        state
            .vector_stores
            .iter()
            .find(|vs| vs.id == vector_store_id)
            .cloned()
            .ok_or_else(|| PanelError::remote("retrieve vector store", "404 - not found"))
    }

    async fn list_vector_stores(&self) -> PanelResult<Vec<VectorStore>> {
        let state = self.lock();
        state.check("list vector stores")?;
        Ok(state.vector_stores.clone())
    }

    async fn list_vector_store_files(
        &self,
        vector_store_id: &str,
    ) -> PanelResult<Vec<VectorStoreFile>> {
        let state = self.lock();
        state.check("list vector store files")?;
        Ok(state
            .store_files
            .get(vector_store_id)
            .into_iter()
            .flatten()
            .map(|id| VectorStoreFile {
                id: id.clone(),
                status: Some("completed".to_string()),
            })
            .collect())
    }

    async fn create_file_batch(
        &self,
        vector_store_id: &str,
        file_ids: &[String],
    ) -> PanelResult<FileBatch> {
        let mut state = self.lock();
        state.check("create file batch")?;
        state
            .store_files
            .entry(vector_store_id.to_string())
            .or_default()
            .extend(file_ids.iter().cloned());
        Ok(FileBatch {
            id: state.id("vsfb"),
            vector_store_id: vector_store_id.to_string(),
            status: BatchStatus::InProgress,
            file_counts: FileCounts {
                in_progress: file_ids.len() as u32,
                total: file_ids.len() as u32,
                ..FileCounts::default()
            },
        })
    }

    async fn retrieve_file_batch(
        &self,
        vector_store_id: &str,
        batch_id: &str,
    ) -> PanelResult<FileBatch> {
        let mut state = self.lock();
        state.check("retrieve file batch")?;
        state.batch_polls += 1;
        let status = if state.batch_statuses.len() > 1 {
            state.batch_statuses.pop_front().unwrap_or(BatchStatus::Completed)
        } else {
            state
                .batch_statuses
                .front()
                .copied()
                .unwrap_or(BatchStatus::Completed)
        };
        let total = state
            .store_files
            .get(vector_store_id)
            .map_or(0, |files| files.len() as u32);
        let file_counts = match status {
            BatchStatus::Completed => FileCounts {
                completed: total,
                total,
                ..FileCounts::default()
            },
            BatchStatus::Failed => FileCounts {
                failed: total,
                total,
                ..FileCounts::default()
            },
            _ => FileCounts {
                in_progress: total,
                total,
                ..FileCounts::default()
            },
        };
        Ok(FileBatch {
            id: batch_id.to_string(),
            vector_store_id: vector_store_id.to_string(),
            status,
            file_counts,
        })
    }

    async fn upload_file(&self, file: &UploadFile) -> PanelResult<FileObject> {
        let mut state = self.lock();
        state.check("upload file")?;
        let object = FileObject {
            id: state.id("file"),
            filename: file.filename.clone(),
            purpose: Some("assistants".to_string()),
        };
        state.files.push(object.clone());
        Ok(object)
    }

    async fn retrieve_file(&self, file_id: &str) -> PanelResult<FileObject> {
        let state = self.lock();
        state.check("retrieve file")?;
        state
            .files
            .iter()
            .find(|file| file.id == file_id)
            .cloned()
            .ok_or_else(|| PanelError::remote("retrieve file", "404 - not found"))
    }

    async fn create_thread(&self) -> PanelResult<Thread> {
        let mut state = self.lock();
        state.check("create thread")?;
        let id = state.id("thread");
        state.thread_messages.insert(id.clone(), Vec::new());
        Ok(Thread { id })
    }

    async fn create_message(
        &self,
        thread_id: &str,
        request: &CreateMessageRequest,
    ) -> PanelResult<ThreadMessage> {
        let mut state = self.lock();
        state.check("add message")?;
        state.message_requests.push(request.clone());
        let mut message = text_message(state.id("msg"), request.role, &request.content);
        message.attachments = request.attachments.clone();
        state
            .thread_messages
            .entry(thread_id.to_string())
            .or_default()
            .insert(0, message.clone());
        Ok(message)
    }

    async fn list_messages(&self, thread_id: &str) -> PanelResult<Vec<ThreadMessage>> {
        let state = self.lock();
        state.check("list messages")?;
        Ok(state
            .thread_messages
            .get(thread_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_run(&self, thread_id: &str, _request: &CreateRunRequest) -> PanelResult<Run> {
        let mut state = self.lock();
        state.check("start run")?;
        state.runs_created += 1;
        Ok(Run {
            id: state.id("run"),
            thread_id: thread_id.to_string(),
            status: RunStatus::Queued,
            last_error: None,
        })
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> PanelResult<Run> {
        let mut state = self.lock();
        state.check("get run status")?;
        if state.run_reads_before_failure == Some(state.run_status_reads) {
            return Err(PanelError::remote("get run status", "connection reset"));
        }
        state.run_status_reads += 1;
        let status = if state.run_statuses.len() > 1 {
            state.run_statuses.pop_front().unwrap_or(RunStatus::Completed)
        } else {
            state
                .run_statuses
                .front()
                .copied()
                .unwrap_or(RunStatus::Completed)
        };
        if status == RunStatus::Completed {
            if let Some(reply) = state.pending_reply.take() {
                let id = state.id("msg");
                state
                    .thread_messages
                    .entry(thread_id.to_string())
                    .or_default()
                    .insert(0, text_message(id, Role::Assistant, &reply));
            }
        }
        let last_error = match (&state.run_error, status) {
            (Some(message), status) if status.is_terminal() && status != RunStatus::Completed => {
                Some(RunError {
                    code: Some("server_error".to_string()),
                    message: message.clone(),
                })
            }
            _ => None,
        };
        Ok(Run {
            id: run_id.to_string(),
            thread_id: thread_id.to_string(),
            status,
            last_error,
        })
    }
}
