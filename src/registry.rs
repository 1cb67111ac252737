use crate::ai_sdk::{
    Assistant, BatchStatus, CreateAssistantRequest, FileBatch, ToolResources, ToolSpec,
    UpdateAssistantRequest, VectorStore,
};
use crate::client::{AssistantsApi, UploadFile};
use crate::conversation::{PollEnd, PollPolicy, poll_until_terminal};
use crate::error::{PanelError, PanelResult};
use serde::Serialize;

pub fn tool_set(code_interpreter: bool, file_search: bool) -> Vec<ToolSpec> {
    let mut tools = Vec::new();
    if code_interpreter {
        tools.push(ToolSpec::CodeInterpreter);
    }
    if file_search {
        tools.push(ToolSpec::FileSearch);
    }
    tools
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRef {
    pub id: String,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorStoreDetails {
    pub store: VectorStore,
    pub files: Vec<FileRef>,
}

pub async fn create_assistant(
    api: &dyn AssistantsApi,
    name: &str,
    instructions: &str,
    model: &str,
    tools: Vec<ToolSpec>,
    vector_store_id: Option<&str>,
) -> PanelResult<Assistant> {
    if model.trim().is_empty() {
        return Err(PanelError::BadRequest("a model is required".to_string()));
    }
    let request = CreateAssistantRequest {
        name: name.to_string(),
        instructions: instructions.to_string(),
        model: model.trim().to_string(),
        tools,
        tool_resources: vector_store_id.map(ToolResources::file_search),
    };
    let assistant = api.create_assistant(&request).await?;
    tracing::info!(assistant_id = %assistant.id, name, "assistant created");
    Ok(assistant)
}

/// Sends only the fields that are given. A vector store id replaces the
/// assistant's whole document-search binding.
pub async fn update_assistant(
    api: &dyn AssistantsApi,
    assistant_id: &str,
    instructions: Option<String>,
    model: Option<String>,
    vector_store_id: Option<&str>,
) -> PanelResult<Assistant> {
    let request = UpdateAssistantRequest {
        instructions,
        model,
        tool_resources: vector_store_id.map(ToolResources::file_search),
    };
    let assistant = api.update_assistant(assistant_id, &request).await?;
    tracing::info!(
        assistant_id,
        instructions = request.instructions.is_some(),
        model = request.model.is_some(),
        vector_store = vector_store_id.unwrap_or("-"),
        "assistant updated"
    );
    Ok(assistant)
}

pub async fn list_assistants(api: &dyn AssistantsApi) -> PanelResult<Vec<Assistant>> {
    api.list_assistants().await
}

pub async fn create_vector_store(api: &dyn AssistantsApi, name: &str) -> PanelResult<VectorStore> {
    let store = api.create_vector_store(name).await?;
    tracing::info!(vector_store_id = %store.id, name, "vector store created");
    Ok(store)
}

pub async fn list_vector_stores(api: &dyn AssistantsApi) -> PanelResult<Vec<VectorStore>> {
    api.list_vector_stores().await
}

/// The store plus the filename of every file ingested into it.
pub async fn vector_store_details(
    api: &dyn AssistantsApi,
    vector_store_id: &str,
) -> PanelResult<VectorStoreDetails> {
    let store = api.retrieve_vector_store(vector_store_id).await?;
    let entries = api.list_vector_store_files(vector_store_id).await?;

    let mut files = Vec::with_capacity(entries.len());
    for entry in entries {
        let file = api.retrieve_file(&entry.id).await?;
        files.push(FileRef {
            id: entry.id,
            filename: file.filename,
        });
    }

    Ok(VectorStoreDetails { store, files })
}

/// Uploads each file separately; every call yields a new remote file id,
/// even for bytes uploaded before.
pub async fn upload_files(
    api: &dyn AssistantsApi,
    files: &[UploadFile],
) -> PanelResult<Vec<String>> {
    let mut file_ids = Vec::with_capacity(files.len());
    for file in files {
        let uploaded = api.upload_file(file).await?;
        tracing::debug!(file_id = %uploaded.id, filename = %file.filename, "file uploaded");
        file_ids.push(uploaded.id);
    }
    Ok(file_ids)
}

/// Uploads the files, submits them as one ingestion batch and waits for the
/// batch to settle.
pub async fn upload_files_to_vector_store(
    api: &dyn AssistantsApi,
    vector_store_id: &str,
    files: &[UploadFile],
    policy: PollPolicy,
) -> PanelResult<FileBatch> {
    if files.is_empty() {
        return Err(PanelError::BadRequest("no files selected".to_string()));
    }

    let file_ids = upload_files(api, files).await?;
    let batch = api.create_file_batch(vector_store_id, &file_ids).await?;
    tracing::info!(
        vector_store_id,
        batch_id = %batch.id,
        files = file_ids.len(),
        "file batch submitted"
    );

    let batch_id = batch.id.as_str();
    let polled = poll_until_terminal(
        policy,
        move || api.retrieve_file_batch(vector_store_id, batch_id),
        |batch: &FileBatch| batch.status.is_terminal(),
    )
    .await?;

    match polled {
        PollEnd::Terminal { value, reads } => {
            tracing::info!(
                vector_store_id,
                batch_id = %value.id,
                status = ?value.status,
                reads,
                "file batch settled"
            );
            match value.status {
                BatchStatus::Completed => Ok(value),
                status => Err(PanelError::IngestionFailure(format!(
                    "batch {} ended {:?}: {} of {} files failed",
                    value.id,
                    status,
                    value.file_counts.failed,
                    value.file_counts.total
                ))),
            }
        }
        PollEnd::TimedOut { last, .. } => Err(PanelError::IngestionFailure(format!(
            "batch {} still processing ({} of {} files done)",
            last.id, last.file_counts.completed, last.file_counts.total
        ))),
    }
}
