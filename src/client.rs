use crate::ai_sdk::{
    Assistant, CreateAssistantRequest, CreateFileBatchRequest, CreateMessageRequest,
    CreateRunRequest, CreateVectorStoreRequest, FileBatch, FileObject, ListResponse, Run, Thread,
    ThreadMessage, UpdateAssistantRequest, VectorStore, VectorStoreFile,
};
use crate::config::{Backend, Credentials};
use crate::error::{PanelError, PanelResult};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Client as HttpClient, Method, RequestBuilder, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;

const LIST_LIMIT: &str = "100";

/// A file picked in the browser, held in memory until it is uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Every remote call the panel makes against the provider.
#[async_trait]
pub trait AssistantsApi: Send + Sync {
    fn backend(&self) -> Backend;

    async fn create_assistant(&self, request: &CreateAssistantRequest) -> PanelResult<Assistant>;
    async fn update_assistant(
        &self,
        assistant_id: &str,
        request: &UpdateAssistantRequest,
    ) -> PanelResult<Assistant>;
    async fn list_assistants(&self) -> PanelResult<Vec<Assistant>>;

    async fn create_vector_store(&self, name: &str) -> PanelResult<VectorStore>;
    async fn retrieve_vector_store(&self, vector_store_id: &str) -> PanelResult<VectorStore>;
    async fn list_vector_stores(&self) -> PanelResult<Vec<VectorStore>>;
    async fn list_vector_store_files(
        &self,
        vector_store_id: &str,
    ) -> PanelResult<Vec<VectorStoreFile>>;
    async fn create_file_batch(
        &self,
        vector_store_id: &str,
        file_ids: &[String],
    ) -> PanelResult<FileBatch>;
    async fn retrieve_file_batch(
        &self,
        vector_store_id: &str,
        batch_id: &str,
    ) -> PanelResult<FileBatch>;

    async fn upload_file(&self, file: &UploadFile) -> PanelResult<FileObject>;
    async fn retrieve_file(&self, file_id: &str) -> PanelResult<FileObject>;

    async fn create_thread(&self) -> PanelResult<Thread>;
    async fn create_message(
        &self,
        thread_id: &str,
        request: &CreateMessageRequest,
    ) -> PanelResult<ThreadMessage>;
    /// Newest message first.
    async fn list_messages(&self, thread_id: &str) -> PanelResult<Vec<ThreadMessage>>;
    async fn create_run(&self, thread_id: &str, request: &CreateRunRequest) -> PanelResult<Run>;
    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> PanelResult<Run>;
}

#[derive(Clone)]
pub struct ProviderClient {
    credentials: Credentials,
    http: HttpClient,
}

impl std::fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClient")
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl ProviderClient {
    pub fn new(credentials: Credentials) -> PanelResult<Self> {
        let headers = default_headers(&credentials)?;
        let http = HttpClient::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| PanelError::AuthFailure(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { credentials, http })
    }

    /// Builds the handle and proves the credentials with one cheap read.
    pub async fn connect(credentials: Credentials) -> PanelResult<Self> {
        let client = Self::new(credentials)?;
        tracing::debug!(backend = %client.backend(), "verifying provider credentials");
        let probe = client.request(Method::GET, "assistants", &[("limit", "1")])?;
        let _: ListResponse<serde_json::Value> = send(probe, "verify credentials").await?;
        Ok(client)
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> PanelResult<Url> {
        let (raw, api_version) = match &self.credentials {
            Credentials::Direct { base_url, .. } => (format!("{}/{}", base_url, path), None),
            Credentials::Tenant {
                endpoint,
                api_version,
                ..
            } => (
                format!("{}/openai/{}", endpoint, path),
                Some(api_version.as_str()),
            ),
        };
        let mut url = Url::parse(&raw)
            .map_err(|e| PanelError::remote("build request", format!("{}: {}", raw, e)))?;
        if api_version.is_some() || !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
            if let Some(version) = api_version {
                pairs.append_pair("api-version", version);
            }
        }
        Ok(url)
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
    ) -> PanelResult<RequestBuilder> {
        let url = self.url(path, query)?;
        tracing::debug!(%method, %url, "provider request");
        Ok(self.http.request(method, url))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        operation: &'static str,
    ) -> PanelResult<T> {
        send(self.request(Method::GET, path, query)?, operation).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        operation: &'static str,
    ) -> PanelResult<T> {
        send(self.request(Method::POST, path, &[])?.json(body), operation).await
    }

    async fn list<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        operation: &'static str,
    ) -> PanelResult<Vec<T>> {
        let page: ListResponse<T> = self.get(path, query, operation).await?;
        Ok(page.data)
    }
}

fn default_headers(credentials: &Credentials) -> PanelResult<HeaderMap> {
    let invalid = |_| PanelError::AuthFailure("API key contains invalid characters".to_string());
    let mut headers = HeaderMap::new();
    match credentials {
        Credentials::Direct { api_key, .. } => {
            let mut bearer =
                HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(invalid)?;
            bearer.set_sensitive(true);
            headers.insert(reqwest::header::AUTHORIZATION, bearer);
            headers.insert("openai-beta", HeaderValue::from_static("assistants=v2"));
        }
        Credentials::Tenant { api_key, .. } => {
            let mut key = HeaderValue::from_str(api_key).map_err(invalid)?;
            key.set_sensitive(true);
            headers.insert("api-key", key);
        }
    }
    Ok(headers)
}

async fn send<T: DeserializeOwned>(
    request: RequestBuilder,
    operation: &'static str,
) -> PanelResult<T> {
    let response = request
        .send()
        .await
        .map_err(|e| PanelError::remote(operation, e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = provider_message(&body).unwrap_or(body);
        return Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                PanelError::AuthFailure(format!("{} - {}", status, message))
            }
            _ => PanelError::remote(operation, format!("{} - {}", status, message)),
        });
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| PanelError::remote(operation, e.to_string()))?;
    serde_json::from_slice(&body)
        .map_err(|e| PanelError::remote(operation, format!("malformed response: {}", e)))
}

// Provider errors arrive as {"error": {"message": "..."}}.
fn provider_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")?
        .get("message")?
        .as_str()
        .map(str::to_string)
}

#[async_trait]
impl AssistantsApi for ProviderClient {
    fn backend(&self) -> Backend {
        self.credentials.backend()
    }

    async fn create_assistant(&self, request: &CreateAssistantRequest) -> PanelResult<Assistant> {
        self.post("assistants", request, "create assistant").await
    }

    async fn update_assistant(
        &self,
        assistant_id: &str,
        request: &UpdateAssistantRequest,
    ) -> PanelResult<Assistant> {
        self.post(
            &format!("assistants/{}", assistant_id),
            request,
            "update assistant",
        )
        .await
    }

    async fn list_assistants(&self) -> PanelResult<Vec<Assistant>> {
        self.list("assistants", &[("limit", LIST_LIMIT)], "list assistants")
            .await
    }

    async fn create_vector_store(&self, name: &str) -> PanelResult<VectorStore> {
        self.post(
            "vector_stores",
            &CreateVectorStoreRequest { name },
            "create vector store",
        )
        .await
    }

    async fn retrieve_vector_store(&self, vector_store_id: &str) -> PanelResult<VectorStore> {
        self.get(
            &format!("vector_stores/{}", vector_store_id),
            &[],
            "retrieve vector store",
        )
        .await
    }

    async fn list_vector_stores(&self) -> PanelResult<Vec<VectorStore>> {
        self.list("vector_stores", &[("limit", LIST_LIMIT)], "list vector stores")
            .await
    }

    async fn list_vector_store_files(
        &self,
        vector_store_id: &str,
    ) -> PanelResult<Vec<VectorStoreFile>> {
        self.list(
            &format!("vector_stores/{}/files", vector_store_id),
            &[("limit", LIST_LIMIT)],
            "list vector store files",
        )
        .await
    }

    async fn create_file_batch(
        &self,
        vector_store_id: &str,
        file_ids: &[String],
    ) -> PanelResult<FileBatch> {
        self.post(
            &format!("vector_stores/{}/file_batches", vector_store_id),
            &CreateFileBatchRequest { file_ids },
            "create file batch",
        )
        .await
    }

    async fn retrieve_file_batch(
        &self,
        vector_store_id: &str,
        batch_id: &str,
    ) -> PanelResult<FileBatch> {
        self.get(
            &format!("vector_stores/{}/file_batches/{}", vector_store_id, batch_id),
            &[],
            "retrieve file batch",
        )
        .await
    }

    async fn upload_file(&self, file: &UploadFile) -> PanelResult<FileObject> {
        let part = Part::bytes(file.bytes.clone()).file_name(file.filename.clone());
        let form = Form::new().text("purpose", "assistants").part("file", part);
        send(
            self.request(Method::POST, "files", &[])?.multipart(form),
            "upload file",
        )
        .await
    }

    async fn retrieve_file(&self, file_id: &str) -> PanelResult<FileObject> {
        self.get(&format!("files/{}", file_id), &[], "retrieve file")
            .await
    }

    async fn create_thread(&self) -> PanelResult<Thread> {
        self.post("threads", &serde_json::json!({}), "create thread")
            .await
    }

    async fn create_message(
        &self,
        thread_id: &str,
        request: &CreateMessageRequest,
    ) -> PanelResult<ThreadMessage> {
        self.post(
            &format!("threads/{}/messages", thread_id),
            request,
            "add message",
        )
        .await
    }

    async fn list_messages(&self, thread_id: &str) -> PanelResult<Vec<ThreadMessage>> {
        self.list(
            &format!("threads/{}/messages", thread_id),
            &[("order", "desc")],
            "list messages",
        )
        .await
    }

    async fn create_run(&self, thread_id: &str, request: &CreateRunRequest) -> PanelResult<Run> {
        self.post(&format!("threads/{}/runs", thread_id), request, "start run")
            .await
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> PanelResult<Run> {
        self.get(
            &format!("threads/{}/runs/{}", thread_id, run_id),
            &[],
            "get run status",
        )
        .await
    }
}
