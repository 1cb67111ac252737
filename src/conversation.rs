//! Thread lifecycle and the run-polling protocol.
//!
//! A turn is: append the user message, start a run, poll the run until the
//! provider reports a terminal status, then take the newest thread message
//! as the reply. Only one run may be outstanding per thread.

use crate::ai_sdk::{CreateMessageRequest, CreateRunRequest, Role, Run, RunStatus, Thread};
use crate::client::AssistantsApi;
use crate::error::{PanelError, PanelResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Some(Duration::from_secs(600)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollEnd<T> {
    Terminal { value: T, reads: usize },
    TimedOut { last: T, reads: usize },
}

/// Reads first, then sleeps `interval` between reads until `is_terminal`
/// accepts a value or the deadline passes. Fetch errors end the wait.
pub async fn poll_until_terminal<T, F, Fut, P>(
    policy: PollPolicy,
    mut fetch: F,
    mut is_terminal: P,
) -> PanelResult<PollEnd<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PanelResult<T>>,
    P: FnMut(&T) -> bool,
{
    let deadline = policy.timeout.map(|timeout| Instant::now() + timeout);
    let mut reads = 0usize;

    loop {
        let value = fetch().await?;
        reads += 1;

        if is_terminal(&value) {
            return Ok(PollEnd::Terminal { value, reads });
        }

        if let Some(deadline) = deadline {
            if Instant::now() + policy.interval > deadline {
                return Ok(PollEnd::TimedOut { last: value, reads });
            }
        }

        tokio::time::sleep(policy.interval).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TurnState {
    NoThread,
    ThreadOpen,
    AwaitingRun { run_id: String },
}

#[derive(Debug)]
pub enum TurnOutcome {
    RunComplete {
        reply: ChatMessage,
        status_reads: usize,
    },
    RunFailed {
        error: PanelError,
        status_reads: usize,
    },
}

/// Local view of the active thread. The provider's message log is the
/// source of truth; `messages` only ever grows in the same order.
#[derive(Debug)]
pub struct Conversation {
    thread: Option<Thread>,
    messages: Vec<ChatMessage>,
    state: TurnState,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            thread: None,
            messages: Vec::new(),
            state: TurnState::NoThread,
        }
    }

    pub fn state(&self) -> &TurnState {
        &self.state
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread.as_ref().map(|thread| thread.id.as_str())
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Opens a fresh remote thread and drops the local message cache.
    pub async fn create_thread(&mut self, api: &dyn AssistantsApi) -> PanelResult<&Thread> {
        if let TurnState::AwaitingRun { .. } = self.state {
            return Err(PanelError::RunInProgress);
        }
        let thread = api.create_thread().await?;
        tracing::info!(thread_id = %thread.id, "thread created");
        self.messages.clear();
        self.state = TurnState::ThreadOpen;
        Ok(&*self.thread.insert(thread))
    }

    fn open_thread_id(&self) -> PanelResult<String> {
        match (&self.state, &self.thread) {
            (TurnState::AwaitingRun { .. }, _) => Err(PanelError::RunInProgress),
            (TurnState::ThreadOpen, Some(thread)) => Ok(thread.id.clone()),
            _ => Err(PanelError::NoThread),
        }
    }

    /// Appends a user message; each file id becomes a document-search
    /// attachment. The cache is updated only after the provider accepts it.
    pub async fn submit_message(
        &mut self,
        api: &dyn AssistantsApi,
        text: &str,
        file_ids: &[String],
    ) -> PanelResult<()> {
        let thread_id = self.open_thread_id()?;
        let request = CreateMessageRequest::user(text, file_ids);
        api.create_message(&thread_id, &request).await?;
        tracing::debug!(%thread_id, attachments = file_ids.len(), "user message added");
        self.messages.push(ChatMessage::user(text));
        Ok(())
    }

    pub async fn start_run(
        &mut self,
        api: &dyn AssistantsApi,
        assistant_id: &str,
    ) -> PanelResult<Run> {
        let thread_id = self.open_thread_id()?;
        let run = api
            .create_run(&thread_id, &CreateRunRequest::with_file_search(assistant_id))
            .await?;
        tracing::info!(%thread_id, run_id = %run.id, %assistant_id, "run started");
        self.state = TurnState::AwaitingRun {
            run_id: run.id.clone(),
        };
        Ok(run)
    }

    /// Polls the outstanding run to a terminal status and, on success,
    /// appends the newest thread message as the assistant reply. Always
    /// returns the conversation to `ThreadOpen`.
    pub async fn await_run(
        &mut self,
        api: &dyn AssistantsApi,
        policy: PollPolicy,
        on_status: &mut (dyn FnMut(RunStatus) + Send),
    ) -> PanelResult<TurnOutcome> {
        let run_id = match &self.state {
            TurnState::AwaitingRun { run_id } => run_id.clone(),
            _ => return Err(PanelError::BadRequest("no run is outstanding".to_string())),
        };
        let thread_id = self.thread_id().ok_or(PanelError::NoThread)?.to_string();

        let outcome = self
            .poll_run(api, policy, &thread_id, &run_id, on_status)
            .await;
        self.state = TurnState::ThreadOpen;

        match &outcome {
            TurnOutcome::RunComplete {
                reply,
                status_reads,
            } => {
                tracing::info!(%thread_id, %run_id, status_reads, "run completed");
                self.messages.push(reply.clone());
            }
            TurnOutcome::RunFailed {
                error,
                status_reads,
            } => {
                tracing::warn!(%thread_id, %run_id, status_reads, %error, "run did not complete");
            }
        }
        Ok(outcome)
    }

    async fn poll_run(
        &self,
        api: &dyn AssistantsApi,
        policy: PollPolicy,
        thread_id: &str,
        run_id: &str,
        on_status: &mut (dyn FnMut(RunStatus) + Send),
    ) -> TurnOutcome {
        let mut last_status = None;
        let mut reads_seen = 0usize;
        let polled = poll_until_terminal(
            policy,
            move || api.retrieve_run(thread_id, run_id),
            |run: &Run| {
                reads_seen += 1;
                if last_status != Some(run.status) {
                    last_status = Some(run.status);
                    on_status(run.status);
                }
                run.status.is_terminal()
            },
        )
        .await;

        let (run, status_reads) = match polled {
            Ok(PollEnd::Terminal { value, reads }) => (value, reads),
            Ok(PollEnd::TimedOut { last, reads }) => {
                let waited = policy.timeout.unwrap_or_default().as_secs();
                return TurnOutcome::RunFailed {
                    error: PanelError::RunFailed(format!(
                        "still {} after {}s",
                        last.status.as_str(),
                        waited
                    )),
                    status_reads: reads,
                };
            }
            Err(error) => {
                return TurnOutcome::RunFailed {
                    error,
                    status_reads: reads_seen,
                };
            }
        };

        if run.status != RunStatus::Completed {
            let detail = run
                .last_error
                .map(|err| err.message)
                .filter(|message| !message.is_empty())
                .unwrap_or_else(|| format!("run ended with status {}", run.status.as_str()));
            return TurnOutcome::RunFailed {
                error: PanelError::RunFailed(detail),
                status_reads,
            };
        }

        match newest_reply(api, thread_id).await {
            Ok(reply) => TurnOutcome::RunComplete {
                reply,
                status_reads,
            },
            Err(error) => TurnOutcome::RunFailed {
                error,
                status_reads,
            },
        }
    }

    /// One full turn: message, run, poll, reply.
    pub async fn take_turn(
        &mut self,
        api: &dyn AssistantsApi,
        assistant_id: &str,
        text: &str,
        file_ids: &[String],
        policy: PollPolicy,
        on_status: &mut (dyn FnMut(RunStatus) + Send),
    ) -> PanelResult<TurnOutcome> {
        self.submit_message(api, text, file_ids).await?;
        self.start_run(api, assistant_id).await?;
        self.await_run(api, policy, on_status).await
    }
}

// The provider lists newest first; only the single most recent message is
// taken, whatever else the run may have added.
async fn newest_reply(api: &dyn AssistantsApi, thread_id: &str) -> PanelResult<ChatMessage> {
    let messages = api.list_messages(thread_id).await?;
    let newest = messages
        .first()
        .ok_or_else(|| PanelError::remote("list messages", "thread has no messages"))?;
    let text = newest
        .text()
        .ok_or_else(|| PanelError::remote("list messages", "newest message has no text"))?;
    Ok(ChatMessage::assistant(text))
}
