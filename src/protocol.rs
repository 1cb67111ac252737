use crate::ai_sdk::{Assistant, Role, RunStatus, VectorStore};
use crate::config::Backend;
use crate::conversation::{ChatMessage, TurnState};
use crate::render::format_message;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionCreateResponse {
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InitializeRequest {
    pub backend: Backend,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateAssistantForm {
    pub name: String,
    #[serde(default)]
    pub instructions: String,
    pub model: String,
    #[serde(default)]
    pub code_interpreter: bool,
    #[serde(default)]
    pub file_search: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SelectAssistantRequest {
    pub assistant_id: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UpdateAssistantForm {
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub vector_store_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateVectorStoreForm {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Success,
    Warning,
    Error,
}

/// A user-visible status line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

/// Every JSON answer carries the notices raised while producing it.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub data: T,
    pub notices: Vec<Notice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedMessage {
    pub role: Role,
    pub content: String,
    pub html: String,
}

impl From<&ChatMessage> for RenderedMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
            html: format_message(message),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub backend: Backend,
    pub initialized: bool,
    pub assistant: Option<Assistant>,
    pub vector_store_id: Option<String>,
    pub vector_store: Option<VectorStore>,
    pub thread_id: Option<String>,
    pub turn: TurnState,
    pub messages: Vec<RenderedMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    User { text: String, html: String },
    RunStatus { status: RunStatus },
    Assistant { text: String, html: String },
    Notice { level: NoticeLevel, message: String },
    Done,
}

impl StreamEvent {
    pub fn message(message: &ChatMessage) -> Self {
        let html = format_message(message);
        match message.role {
            Role::User => StreamEvent::User {
                text: message.content.clone(),
                html,
            },
            Role::Assistant => StreamEvent::Assistant {
                text: message.content.clone(),
                html,
            },
        }
    }
}

impl From<Notice> for StreamEvent {
    fn from(notice: Notice) -> Self {
        StreamEvent::Notice {
            level: notice.level,
            message: notice.message,
        }
    }
}
