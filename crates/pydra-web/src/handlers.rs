//! The Controller Interface's method table.
//!
//! One function per operation exposed by `scheduler.py`'s `_interfaces`
//! (`queue_task`, `cancel_task`, `list_queue`, `task_statuses`),
//! `task_manager.py` (`list_tasks`, `task_history`, `task_history_detail`,
//! `task_log`), and `node_manager.py` (`node_list`, `node_detail`,
//! `node_edit`, `node_delete`), plus the two session methods from
//! `interface_module.py` (`authenticate`, `challenge_response`).
//!
//! Arguments arrive as a JSON array (`args`) plus a JSON object (`kwargs`),
//! matching `FunctionResource.render`'s `req.args['args'][0]` /
//! `kwargs[0]` decoding; [`pick`] looks a value up positionally first and
//! falls back to its keyword name, so callers can use either form.

use serde_json::{json, Map, Value};

use crate::state::AppState;

/// Page size for `task_history`, matching the original's default listing
/// page.
const HISTORY_PAGE_SIZE: i64 = 20;

/// Whether `method` is a known Controller Interface operation, and whether
/// it requires an authenticated session. `None` means the method does not
/// exist (→ `404`).
pub fn requires_auth(method: &str) -> Option<bool> {
    Some(match method {
        "authenticate" | "challenge_response" => false,
        "queue_task" | "cancel_task" | "list_queue" | "task_statuses" | "list_tasks" | "task_history"
        | "task_history_detail" | "task_log" | "node_list" | "node_detail" | "node_edit" | "node_delete" => true,
        _ => return None,
    })
}

/// Dispatch an already-authorized call to its handler. `method` must have
/// passed [`requires_auth`] first.
pub async fn dispatch(
    state: &AppState,
    session_id: &str,
    method: &str,
    args: &[Value],
    kwargs: &Map<String, Value>,
) -> Result<Value, String> {
    match method {
        "authenticate" => authenticate(state, session_id),
        "challenge_response" => challenge_response(state, session_id, args, kwargs),
        "queue_task" => queue_task(state, args, kwargs).await,
        "cancel_task" => cancel_task(state, args, kwargs).await,
        "list_queue" => list_queue(state).await,
        "task_statuses" => task_statuses(state, args, kwargs).await,
        "list_tasks" => list_tasks(state).await,
        "task_history" => task_history(state, args, kwargs).await,
        "task_history_detail" => task_history_detail(state, args, kwargs).await,
        "task_log" => task_log(state, args, kwargs).await,
        "node_list" => node_list(state).await,
        "node_detail" => node_detail(state, args, kwargs).await,
        "node_edit" => node_edit(state, args, kwargs).await,
        "node_delete" => node_delete(state, args, kwargs).await,
        other => Err(format!("method does not exist: {other}")),
    }
}

fn pick(args: &[Value], kwargs: &Map<String, Value>, index: usize, name: &str) -> Option<Value> {
    args.get(index).cloned().or_else(|| kwargs.get(name).cloned())
}

fn pick_str(args: &[Value], kwargs: &Map<String, Value>, index: usize, name: &str) -> Result<String, String> {
    pick(args, kwargs, index, name)
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| format!("missing required argument `{name}`"))
}

fn pick_i64(args: &[Value], kwargs: &Map<String, Value>, index: usize, name: &str) -> Result<i64, String> {
    pick(args, kwargs, index, name)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| format!("missing or invalid integer argument `{name}`"))
}

fn authenticate(state: &AppState, session_id: &str) -> Result<Value, String> {
    state.sessions.authenticate(session_id).map(|challenge| json!(challenge)).map_err(|e| e.to_string())
}

fn challenge_response(
    state: &AppState,
    session_id: &str,
    args: &[Value],
    kwargs: &Map<String, Value>,
) -> Result<Value, String> {
    let response = pick_str(args, kwargs, 0, "response")?;
    state
        .sessions
        .challenge_response(session_id, &response)
        .map(|authenticated| json!(authenticated))
        .map_err(|e| e.to_string())
}

async fn queue_task(state: &AppState, args: &[Value], kwargs: &Map<String, Value>) -> Result<Value, String> {
    let task_key = pick_str(args, kwargs, 0, "task_key")?;
    let task_args = pick(args, kwargs, 1, "args").unwrap_or(Value::Null);
    let priority = pick_i64(args, kwargs, 2, "priority").unwrap_or(5) as i32;
    state
        .scheduler
        .queue_task(&task_key, task_args, priority)
        .await
        .map(|task_id| json!(task_id))
        .map_err(|e| e.to_string())
}

async fn cancel_task(state: &AppState, args: &[Value], kwargs: &Map<String, Value>) -> Result<Value, String> {
    let task_id = pick_i64(args, kwargs, 0, "task_id")?;
    state.scheduler.cancel_task(task_id).await.map(|()| Value::Null).map_err(|e| e.to_string())
}

async fn list_queue(state: &AppState) -> Result<Value, String> {
    state.task_store.list_active().await.map(|tasks| json!(tasks)).map_err(|e| e.to_string())
}

async fn task_statuses(state: &AppState, args: &[Value], kwargs: &Map<String, Value>) -> Result<Value, String> {
    let ids: Vec<i64> = pick(args, kwargs, 0, "ids")
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();

    let mut tasks = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(task) = state.task_store.get_task_instance(id).await.map_err(|e| e.to_string())? {
            tasks.push(task);
        }
    }

    let statuses = state.status.task_statuses(&tasks, &state.registry).await;
    Ok(json!(statuses))
}

async fn list_tasks(state: &AppState) -> Result<Value, String> {
    state.task_store.list_task_keys().await.map(|keys| json!(keys)).map_err(|e| e.to_string())
}

async fn task_history(state: &AppState, args: &[Value], kwargs: &Map<String, Value>) -> Result<Value, String> {
    let task_key = pick_str(args, kwargs, 0, "task_key")?;
    let page = pick_i64(args, kwargs, 1, "page").unwrap_or(0).max(0);

    let instances = state
        .task_store
        .history(&task_key, page, HISTORY_PAGE_SIZE)
        .await
        .map_err(|e| e.to_string())?;
    let has_more = instances.len() as i64 == HISTORY_PAGE_SIZE;

    Ok(json!({
        "page": page,
        "prev": if page > 0 { Some(page - 1) } else { None },
        "next": if has_more { Some(page + 1) } else { None },
        "instances": instances,
    }))
}

async fn task_history_detail(state: &AppState, args: &[Value], kwargs: &Map<String, Value>) -> Result<Value, String> {
    let task_id = pick_i64(args, kwargs, 0, "task_id")?;
    let details = state
        .task_store
        .get_task_instance(task_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("task instance not found: {task_id}"))?;
    let workunits = state.task_store.list_work_units(task_id).await.map_err(|e| e.to_string())?;

    Ok(json!({
        "name": details.task_key,
        "details": details,
        "workunits": workunits,
    }))
}

/// Reports the work unit a Controller would otherwise tail a log file for.
/// Log aggregation from disk is out of scope; this reports the persisted
/// `WorkUnit` record that `task_log_path` would have pointed at instead.
async fn task_log(state: &AppState, args: &[Value], kwargs: &Map<String, Value>) -> Result<Value, String> {
    let task_id = pick_i64(args, kwargs, 0, "task_id")?;
    let workunit_id = pick_i64(args, kwargs, 1, "workunit_id").ok();

    let workunits = state.task_store.list_work_units(task_id).await.map_err(|e| e.to_string())?;
    let selected = match workunit_id {
        Some(id) => workunits.into_iter().find(|w| w.id == id),
        None => workunits.into_iter().next(),
    };
    selected
        .map(|w| json!(w))
        .ok_or_else(|| format!("no work unit found for task instance {task_id}"))
}

async fn node_list(state: &AppState) -> Result<Value, String> {
    state.node_store.list().await.map(|nodes| json!(nodes)).map_err(|e| e.to_string())
}

async fn node_detail(state: &AppState, args: &[Value], kwargs: &Map<String, Value>) -> Result<Value, String> {
    let id = pick_str(args, kwargs, 0, "id")?;
    state
        .node_store
        .list()
        .await
        .map_err(|e| e.to_string())?
        .into_iter()
        .find(|n| n.id == id)
        .map(|n| json!(n))
        .ok_or_else(|| format!("node not found: {id}"))
}

async fn node_edit(state: &AppState, args: &[Value], kwargs: &Map<String, Value>) -> Result<Value, String> {
    let id = pick_str(args, kwargs, 0, "id")?;
    let host = pick_str(args, kwargs, 1, "host")?;
    let port = pick_i64(args, kwargs, 2, "port")?;
    state
        .node_store
        .register(&id, &host, port)
        .await
        .map(|node| json!(node))
        .map_err(|e| e.to_string())
}

async fn node_delete(state: &AppState, args: &[Value], kwargs: &Map<String, Value>) -> Result<Value, String> {
    let id = pick_str(args, kwargs, 0, "id")?;
    state.node_store.remove(&id).await.map(|()| Value::Null).map_err(|e| e.to_string())
}
