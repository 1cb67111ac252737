use crate::client::UploadFile;
use crate::config::Backend;
use crate::conversation::PollPolicy;
use crate::error::{PanelError, PanelResult};
use crate::protocol::{
    CreateAssistantForm, CreateVectorStoreForm, Envelope, InitializeRequest,
    SelectAssistantRequest, SessionCreateResponse, SessionView, StreamEvent, UpdateAssistantForm,
};
use crate::session::{Session, TurnEvent};
use axum::Json;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

const INDEX_HTML: &str = include_str!("../static/index.html");
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

pub struct ServerConfig {
    pub listen: String,
    pub default_backend: Backend,
    pub policy: PollPolicy,
}

struct ServerState {
    sessions: Mutex<HashMap<String, Arc<SessionState>>>,
    default_backend: Backend,
    policy: PollPolicy,
}

struct SessionState {
    session: Mutex<Session>,
    events: broadcast::Sender<StreamEvent>,
    running: Mutex<bool>,
}

type ServerResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

pub async fn run(config: ServerConfig) -> ServerResult<()> {
    let state = Arc::new(ServerState {
        sessions: Mutex::new(HashMap::new()),
        default_backend: config.default_backend,
        policy: config.policy,
    });

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(
        listen = %config.listen,
        backend = %config.default_backend,
        poll_interval_ms = config.policy.interval.as_millis() as u64,
        "control panel listening on http://{}",
        config.listen
    );
    axum::serve(listener, router(state)).await?;

    Ok(())
}

fn router(state: Arc<ServerState>) -> axum::Router {
    axum::Router::new()
        .route("/", get(index))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/client", post(initialize_client))
        .route(
            "/sessions/:id/assistants",
            get(list_assistants).post(create_assistant),
        )
        .route("/sessions/:id/assistants/select", post(select_assistant))
        .route("/sessions/:id/assistant", post(update_assistant))
        .route(
            "/sessions/:id/vector-stores",
            get(list_vector_stores).post(create_vector_store),
        )
        .route("/sessions/:id/vector-store", get(vector_store_details))
        .route("/sessions/:id/vector-store/files", post(upload_files))
        .route("/sessions/:id/threads", post(new_chat))
        .route("/sessions/:id/messages", post(send_message))
        .route("/sessions/:id/stream", get(stream_session))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn create_session(State(state): State<Arc<ServerState>>) -> Json<SessionCreateResponse> {
    let session_id = Uuid::new_v4().to_string();
    let (events, _) = broadcast::channel(200);
    let session = Arc::new(SessionState {
        session: Mutex::new(Session::new(state.default_backend, state.policy)),
        events,
        running: Mutex::new(false),
    });

    state
        .sessions
        .lock()
        .await
        .insert(session_id.clone(), session);
    tracing::debug!(%session_id, "session created");

    Json(SessionCreateResponse { session_id })
}

async fn lookup(state: &ServerState, session_id: &str) -> PanelResult<Arc<SessionState>> {
    let sessions = state.sessions.lock().await;
    sessions
        .get(session_id)
        .cloned()
        .ok_or(PanelError::SessionNotFound)
}

// A running turn holds the session until its run settles.
async fn idle(entry: &SessionState) -> PanelResult<MutexGuard<'_, Session>> {
    if *entry.running.lock().await {
        return Err(PanelError::RunInProgress);
    }
    Ok(entry.session.lock().await)
}

fn envelope<T: Serialize>(session: &mut Session, data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        data,
        notices: session.drain_notices(),
    })
}

async fn get_session(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> PanelResult<Json<Envelope<SessionView>>> {
    let entry = lookup(&state, &session_id).await?;
    let mut session = idle(&entry).await?;
    let view = session.view();
    Ok(envelope(&mut session, view))
}

async fn initialize_client(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    Json(payload): Json<InitializeRequest>,
) -> PanelResult<Json<Envelope<SessionView>>> {
    let entry = lookup(&state, &session_id).await?;
    let mut session = idle(&entry).await?;
    session.initialize(payload.backend).await;
    let view = session.view();
    Ok(envelope(&mut session, view))
}

async fn list_assistants(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> PanelResult<impl IntoResponse> {
    let entry = lookup(&state, &session_id).await?;
    let mut session = idle(&entry).await?;
    let assistants = session.list_assistants().await;
    Ok(envelope(&mut session, assistants))
}

async fn create_assistant(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    Json(form): Json<CreateAssistantForm>,
) -> PanelResult<impl IntoResponse> {
    let entry = lookup(&state, &session_id).await?;
    let mut session = idle(&entry).await?;
    let created = session
        .create_assistant(
            &form.name,
            &form.instructions,
            &form.model,
            form.code_interpreter,
            form.file_search,
        )
        .await;
    Ok(envelope(&mut session, created))
}

async fn select_assistant(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    Json(payload): Json<SelectAssistantRequest>,
) -> PanelResult<impl IntoResponse> {
    let entry = lookup(&state, &session_id).await?;
    let mut session = idle(&entry).await?;
    let selected = session.select_assistant(&payload.assistant_id).await;
    Ok(envelope(&mut session, selected))
}

async fn update_assistant(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    Json(form): Json<UpdateAssistantForm>,
) -> PanelResult<impl IntoResponse> {
    let entry = lookup(&state, &session_id).await?;
    let mut session = idle(&entry).await?;
    let mut updated = None;
    if form.instructions.is_some() || form.model.is_some() {
        updated = session.update_assistant(form.instructions, form.model).await;
    }
    if let Some(vector_store_id) = form.vector_store_id.filter(|id| !id.is_empty()) {
        updated = session.bind_vector_store(&vector_store_id).await;
    }
    Ok(envelope(&mut session, updated))
}

async fn list_vector_stores(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> PanelResult<impl IntoResponse> {
    let entry = lookup(&state, &session_id).await?;
    let mut session = idle(&entry).await?;
    let stores = session.list_vector_stores().await;
    Ok(envelope(&mut session, stores))
}

async fn create_vector_store(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    Json(form): Json<CreateVectorStoreForm>,
) -> PanelResult<impl IntoResponse> {
    let entry = lookup(&state, &session_id).await?;
    let mut session = idle(&entry).await?;
    let store = session.create_vector_store(&form.name).await;
    Ok(envelope(&mut session, store))
}

async fn vector_store_details(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> PanelResult<impl IntoResponse> {
    let entry = lookup(&state, &session_id).await?;
    let mut session = idle(&entry).await?;
    let details = session.vector_store_details().await;
    Ok(envelope(&mut session, details))
}

async fn upload_files(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    multipart: Multipart,
) -> PanelResult<impl IntoResponse> {
    let entry = lookup(&state, &session_id).await?;
    let form = read_form(multipart).await?;
    let mut session = idle(&entry).await?;
    let batch = session.upload_to_vector_store(form.files).await;
    Ok(envelope(&mut session, batch))
}

async fn new_chat(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> PanelResult<impl IntoResponse> {
    let entry = lookup(&state, &session_id).await?;
    let mut session = idle(&entry).await?;
    let thread_id = session.new_chat().await;
    Ok(envelope(&mut session, thread_id))
}

async fn send_message(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    multipart: Multipart,
) -> PanelResult<StatusCode> {
    let entry = lookup(&state, &session_id).await?;
    let form = read_form(multipart).await?;
    let files = form.files;
    let text = form
        .text
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| PanelError::BadRequest("message text is empty".to_string()))?;

    {
        let mut running = entry.running.lock().await;
        if *running {
            return Err(PanelError::RunInProgress);
        }
        *running = true;
    }

    tokio::spawn(async move {
        let events = entry.events.clone();
        {
            let mut session = entry.session.lock().await;
            let mut on_event = |event: TurnEvent| {
                let event = match event {
                    TurnEvent::UserAccepted(message) => StreamEvent::message(&message),
                    TurnEvent::RunStatus(status) => StreamEvent::RunStatus { status },
                };
                let _ = events.send(event);
            };
            let reply = session.send_message(&text, files, &mut on_event).await;
            if let Some(reply) = reply {
                let _ = events.send(StreamEvent::message(&reply));
            }
            for notice in session.drain_notices() {
                let _ = events.send(StreamEvent::from(notice));
            }
        }
        *entry.running.lock().await = false;
        let _ = events.send(StreamEvent::Done);
    });

    Ok(StatusCode::ACCEPTED)
}

async fn stream_session(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> PanelResult<impl IntoResponse> {
    let entry = lookup(&state, &session_id).await?;

    let stream = BroadcastStream::new(entry.events.subscribe()).filter_map(|item| async move {
        match item {
            Ok(event) => {
                let data = serde_json::to_string(&event).unwrap_or_default();
                Some(Ok::<Event, Infallible>(Event::default().data(data)))
            }
            Err(_) => None,
        }
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

#[derive(Debug, Default)]
struct UploadForm {
    text: Option<String>,
    files: Vec<UploadFile>,
}

// Browsers send an empty, unnamed part for a file input left blank.
async fn read_form(mut multipart: Multipart) -> PanelResult<UploadForm> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| PanelError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| PanelError::BadRequest(e.to_string()))?;

        match filename {
            Some(filename) if !filename.is_empty() => form.files.push(UploadFile {
                filename,
                bytes: bytes.to_vec(),
            }),
            Some(_) => {}
            None if name == "text" => {
                form.text = Some(String::from_utf8_lossy(&bytes).into_owned());
            }
            None => {}
        }
    }
    Ok(form)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_sdk::RunStatus;
    use crate::testing::{FakeApi, assistant};
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, header};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn test_state() -> Arc<ServerState> {
        Arc::new(ServerState {
            sessions: Mutex::new(HashMap::new()),
            default_backend: Backend::Direct,
            policy: PollPolicy {
                interval: Duration::from_millis(1),
                timeout: Some(Duration::from_secs(5)),
            },
        })
    }

    async fn call(state: &Arc<ServerState>, request: Request<Body>) -> (StatusCode, Value) {
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, value)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn new_session(state: &Arc<ServerState>) -> String {
        let (status, body) = call(state, Request::post("/sessions").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        body["session_id"].as_str().unwrap().to_string()
    }

    async fn install(state: &Arc<ServerState>, session_id: &str, api: FakeApi) {
        let entry = lookup(state, session_id).await.unwrap();
        entry.session.lock().await.install_client(Arc::new(api));
    }

    fn multipart_text(uri: &str, text: &str) -> Request<Body> {
        let boundary = "XBOUNDARY";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"text\"\r\n\r\n{t}\r\n--{b}--\r\n",
            b = boundary,
            t = text
        );
        Request::post(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn index_serves_the_panel() {
        let response = router(test_state())
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let state = test_state();
        let (status, body) = call(
            &state,
            Request::get("/sessions/nope").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], true);
    }

    #[tokio::test]
    async fn listing_without_client_returns_empty_data_and_a_notice() {
        let state = test_state();
        let id = new_session(&state).await;

        let (status, body) = call(
            &state,
            Request::get(format!("/sessions/{}/assistants", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!([]));
        assert_eq!(body["notices"][0]["level"], "error");
        assert_eq!(body["notices"][0]["message"], "client is not initialized");
    }

    #[tokio::test]
    async fn assistant_selection_and_update_flow() {
        let state = test_state();
        let id = new_session(&state).await;
        let api = FakeApi::new();
        api.insert_assistant(assistant("asst_1", "Helper", "gpt-4o"));
        install(&state, &id, api).await;

        let (_, body) = call(
            &state,
            post_json(
                &format!("/sessions/{}/assistants/select", id),
                json!({"assistant_id": "asst_1"}),
            ),
        )
        .await;
        assert_eq!(body["data"]["id"], "asst_1");

        let (_, body) = call(
            &state,
            post_json(
                &format!("/sessions/{}/assistant", id),
                json!({"instructions": "Answer in French."}),
            ),
        )
        .await;
        assert_eq!(body["data"]["instructions"], "Answer in French.");
        assert_eq!(body["data"]["model"], "gpt-4o");
        assert_eq!(body["notices"][0]["level"], "success");
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let state = test_state();
        let id = new_session(&state).await;
        let (status, _) = call(
            &state,
            multipart_text(&format!("/sessions/{}/messages", id), "   "),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn message_runs_in_background_and_streams_reply() {
        let state = test_state();
        let id = new_session(&state).await;
        let api = FakeApi::new().with_run_statuses(&[RunStatus::Queued, RunStatus::Completed]);
        api.insert_assistant(assistant("asst_1", "Helper", "gpt-4o"));
        api.set_reply("Bonjour");
        install(&state, &id, api).await;
        call(
            &state,
            post_json(
                &format!("/sessions/{}/assistants/select", id),
                json!({"assistant_id": "asst_1"}),
            ),
        )
        .await;
        let (_, body) = call(
            &state,
            Request::post(format!("/sessions/{}/threads", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert!(body["data"].is_string());

        let entry = lookup(&state, &id).await.unwrap();
        let mut events = entry.events.subscribe();

        let (status, _) = call(
            &state,
            multipart_text(&format!("/sessions/{}/messages", id), "Hello"),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            let done = matches!(event, StreamEvent::Done);
            seen.push(event);
            if done {
                break;
            }
        }

        assert!(!*entry.running.lock().await);
        assert!(matches!(&seen[0], StreamEvent::User { text, .. } if text == "Hello"));
        assert!(
            seen.iter()
                .any(|e| matches!(e, StreamEvent::Assistant { text, .. } if text == "Bonjour"))
        );

        let (_, body) = call(
            &state,
            Request::get(format!("/sessions/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(body["data"]["messages"].as_array().unwrap().len(), 2);
        assert_eq!(body["data"]["turn"]["state"], "thread_open");
    }

    #[tokio::test]
    async fn second_message_while_running_conflicts() {
        let state = test_state();
        let id = new_session(&state).await;
        let entry = lookup(&state, &id).await.unwrap();
        *entry.running.lock().await = true;

        let (status, _) = call(
            &state,
            multipart_text(&format!("/sessions/{}/messages", id), "again"),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn reads_during_a_turn_conflict_instead_of_waiting() {
        let state = test_state();
        let id = new_session(&state).await;
        let entry = lookup(&state, &id).await.unwrap();
        *entry.running.lock().await = true;
        let _turn = entry.session.lock().await;

        let (status, body) = tokio::time::timeout(
            Duration::from_secs(1),
            call(
                &state,
                Request::get(format!("/sessions/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            ),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], true);
    }

    #[tokio::test]
    async fn assistant_with_function_tool_lists_and_selects() {
        let state = test_state();
        let id = new_session(&state).await;
        let api = FakeApi::new();
        let with_function: crate::ai_sdk::Assistant = serde_json::from_value(json!({
            "id": "asst_fn",
            "name": "Caller",
            "model": "gpt-4o",
            "tools": [
                {"type": "file_search"},
                {"type": "function", "function": {"name": "lookup"}}
            ]
        }))
        .unwrap();
        api.insert_assistant(with_function);
        install(&state, &id, api).await;

        let (status, body) = call(
            &state,
            Request::get(format!("/sessions/{}/assistants", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["id"], "asst_fn");
        assert_eq!(
            body["data"][0]["tools"],
            json!([{"type": "file_search"}, {"type": "other"}])
        );

        let (status, _) = call(
            &state,
            post_json(
                &format!("/sessions/{}/assistants/select", id),
                json!({"assistant_id": "asst_fn"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &state,
            Request::get(format!("/sessions/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["assistant"]["name"], "Caller");
    }
}
