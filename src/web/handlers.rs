use super::error::{ApiError, ApiResult};
use super::session::{Relayed, RunSummary, Session};
use super::AppState;
use crate::model::{
    Engine, ExperimentRequest, RunEvent, Task, TEST_NUMBER_DEFAULT, TEST_NUMBER_MAX,
    TEST_NUMBER_MIN,
};
use crate::results::{self, ResultFile, ResultSection};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse,
    },
    Json,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;

const PANEL_HTML: &str = include_str!("panel.html");

pub(crate) async fn index() -> Html<&'static str> {
    Html(PANEL_HTML)
}

#[derive(Serialize)]
pub(crate) struct TaskOptions {
    pub id: Task,
    pub name: &'static str,
    pub models: Vec<&'static str>,
}

#[derive(Serialize)]
pub(crate) struct Options {
    pub tasks: Vec<TaskOptions>,
    pub engines: Vec<&'static str>,
    pub test_number: TestNumberBounds,
}

#[derive(Serialize)]
pub(crate) struct TestNumberBounds {
    pub min: u32,
    pub max: u32,
    pub default: u32,
}

pub(crate) async fn options() -> Json<Options> {
    Json(Options {
        tasks: Task::ALL
            .iter()
            .map(|t| TaskOptions {
                id: *t,
                name: t.display_name(),
                models: t.models().iter().map(|m| m.as_str()).collect(),
            })
            .collect(),
        engines: Engine::ALL.iter().map(|e| e.as_str()).collect(),
        test_number: TestNumberBounds {
            min: TEST_NUMBER_MIN,
            max: TEST_NUMBER_MAX,
            default: TEST_NUMBER_DEFAULT,
        },
    })
}

#[derive(Debug, Serialize)]
pub(crate) struct SessionView {
    pub session_id: String,
    pub openai_key_set: bool,
    pub bing_key_set: bool,
    pub run: Option<RunSummary>,
}

fn session_view(id: String, session: &Session) -> SessionView {
    let keys = session.keys();
    SessionView {
        session_id: id,
        openai_key_set: keys.has_openai(),
        bing_key_set: keys.has_bing(),
        run: session.current_run().map(|r| r.summary()),
    }
}

fn find_session(state: &AppState, id: &str) -> ApiResult<Arc<Session>> {
    state
        .sessions
        .get(id)
        .ok_or_else(|| ApiError::NotFound(format!("session {id}")))
}

pub(crate) async fn create_session(State(state): State<AppState>) -> impl IntoResponse {
    let (id, session) = state.sessions.create(state.panel.default_keys.clone());
    (StatusCode::CREATED, Json(session_view(id, &session)))
}

pub(crate) async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionView>> {
    let session = find_session(&state, &id)?;
    Ok(Json(session_view(id, &session)))
}

#[derive(Debug, Deserialize)]
pub(crate) struct KeysBody {
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub bing_api_key: Option<String>,
}

pub(crate) async fn put_keys(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<KeysBody>,
) -> ApiResult<Json<SessionView>> {
    let session = find_session(&state, &id)?;
    let keys = session.update_keys(body.openai_api_key, body.bing_api_key);
    tracing::info!(session = %id, ?keys, "session keys updated");
    Ok(Json(session_view(id, &session)))
}

#[derive(Debug, Serialize)]
pub(crate) struct Launched {
    pub run_id: String,
    pub command: String,
}

pub(crate) async fn launch_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ExperimentRequest>,
) -> ApiResult<impl IntoResponse> {
    let session = find_session(&state, &id)?;
    let handle = session.launch(&state.panel, request)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(Launched {
            run_id: handle.run_id.clone(),
            command: handle.command.clone(),
        }),
    ))
}

pub(crate) async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let session = find_session(&state, &id)?;
    let run = session
        .current_run()
        .filter(|r| r.is_running())
        .ok_or_else(|| ApiError::NotFound("no running experiment".into()))?;
    run.cancel();
    Ok((StatusCode::ACCEPTED, Json(run.summary())))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct EventsQuery {
    #[serde(default)]
    pub after: u64,
}

fn sse_event(relayed: &Relayed) -> Event {
    let name = match &relayed.event {
        RunEvent::Started { .. } => "started",
        RunEvent::Line { .. } => "line",
        RunEvent::Info { .. } => "info",
        RunEvent::Completed { .. } => "completed",
        RunEvent::Failed { .. } => "failed",
    };
    let mut ev = Event::default().event(name);
    if let Some(seq) = relayed.seq {
        ev = ev.id(seq.to_string());
    }
    ev.json_data(relayed)
        .unwrap_or_else(|_| Event::default().event(name).data("{}"))
}

/// Stream the session's current run: buffered history after `after`, then live events.
pub(crate) async fn run_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let session = find_session(&state, &id)?;
    let run = session
        .current_run()
        .ok_or_else(|| ApiError::NotFound("no experiment has been launched".into()))?;
    tracing::debug!(session = %id, run_id = %run.run_id, "event stream requested");
    let stream = run
        .events(query.after, state.shutdown.subscribe())
        .map(|relayed| Ok::<_, Infallible>(sse_event(&relayed)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub(crate) async fn list_results(State(state): State<AppState>) -> ApiResult<Json<Vec<ResultFile>>> {
    let root = state.panel.output_root.clone();
    let files = tokio::task::spawn_blocking(move || results::list_result_files(&root))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::Internal(format!("{e:#}")))?;
    Ok(Json(files))
}

#[derive(Debug, Serialize)]
pub(crate) struct ResultView {
    pub path: String,
    pub sections: Vec<ResultSection>,
    pub raw: serde_json::Value,
}

pub(crate) async fn get_result(
    State(state): State<AppState>,
    Path((task_dir, file_name)): Path<(String, String)>,
) -> ApiResult<Json<ResultView>> {
    let path = results::resolve_result_path(&state.panel.output_root, &task_dir, &file_name)
        .map_err(|e| ApiError::BadRequest(format!("{e:#}")))?;
    if !path.is_file() {
        return Err(ApiError::NotFound(format!("{task_dir}/{file_name}")));
    }
    let load_path = path.clone();
    let raw = tokio::task::spawn_blocking(move || results::load_result(&load_path))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::BadRequest(format!("Error loading results: {e:#}")))?;
    tracing::info!(path = %path.display(), "result file loaded");
    Ok(Json(ResultView {
        path: path.display().to_string(),
        sections: results::sections(&raw),
        raw,
    }))
}
