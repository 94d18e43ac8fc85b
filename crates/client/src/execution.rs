// Query execution: single-flight runs whose streamed table frames merge
// monotonically into a shared result handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use diql_common::protocol::commands::{ExecuteQuery, EXECUTE_QUERY};
use diql_common::result::{ResultSnapshot, TableUpdate, CANCELLED_MESSAGE, TABLE_DATA_TYPE};
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::commands::{CommandClient, CommandError, CommandEvent, CommandStream};

// ── Result handles ──────────────────────────────────────────────────

/// The result attached to one query. Clones share the same snapshot.
#[derive(Debug, Clone)]
pub struct ResultHandle {
    sender: Arc<watch::Sender<ResultSnapshot>>,
}

/// A terminal failure, carrying whatever partial state had arrived.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("query failed: {}", .0.exception.as_deref().unwrap_or("unknown error"))]
pub struct QueryFailed(pub ResultSnapshot);

impl ResultHandle {
    pub fn new() -> Self {
        Self::from_snapshot(ResultSnapshot::pending())
    }

    pub fn from_snapshot(snapshot: ResultSnapshot) -> Self {
        let (sender, _) = watch::channel(snapshot);
        Self { sender: Arc::new(sender) }
    }

    pub fn snapshot(&self) -> ResultSnapshot {
        self.sender.borrow().clone()
    }

    /// Watch the snapshot as it changes.
    pub fn subscribe(&self) -> watch::Receiver<ResultSnapshot> {
        self.sender.subscribe()
    }

    /// Wait for the terminal state. Failures resolve to `Err` with the full
    /// snapshot so partial rows are not lost.
    pub async fn finished(&self) -> Result<ResultSnapshot, QueryFailed> {
        let mut receiver = self.sender.subscribe();
        let snapshot = match receiver.wait_for(ResultSnapshot::is_terminal).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.snapshot(),
        };
        if snapshot.is_failed() {
            Err(QueryFailed(snapshot))
        } else {
            Ok(snapshot)
        }
    }

    /// Whether both handles refer to the same result.
    pub fn ptr_eq(&self, other: &ResultHandle) -> bool {
        Arc::ptr_eq(&self.sender, &other.sender)
    }

    pub(crate) fn update(&self, modify: impl FnOnce(&mut ResultSnapshot) -> bool) -> bool {
        self.sender.send_if_modified(modify)
    }
}

impl Default for ResultHandle {
    fn default() -> Self {
        Self::new()
    }
}

// ── Execution service ───────────────────────────────────────────────

/// Where a query lives; sent with the execution command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryContext {
    pub analysis_id: String,
    pub analysis_version: i64,
    pub qube_id: String,
}

/// Invoked with the current snapshot as intermediate results arrive.
pub type IntermediateCallback = Arc<dyn Fn(&ResultSnapshot) + Send + Sync>;

#[derive(Clone)]
pub struct ExecutionService {
    commands: CommandClient,
    running: Arc<Mutex<HashMap<String, RunningQuery>>>,
}

struct RunningQuery {
    request_id: String,
    result: ResultHandle,
}

impl ExecutionService {
    pub fn new(commands: CommandClient) -> Self {
        Self { commands, running: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Result of `query_id`, executing it only when nothing is attached yet.
    ///
    /// An attached handle is returned as-is whatever its state. Otherwise a
    /// fresh handle is created and the query is executed; failures to issue
    /// the command are recorded in the handle rather than returned.
    pub fn provide_query_results(
        &self,
        context: &QueryContext,
        query_id: &str,
        attached: Option<&ResultHandle>,
        on_intermediate: Option<IntermediateCallback>,
    ) -> ResultHandle {
        if let Some(attached) = attached {
            return attached.clone();
        }

        // A previous run whose result was cleared may still be streaming.
        self.cancel_query_if_running(query_id);

        let result = ResultHandle::new();

        let stream = match self.issue(context, query_id) {
            Ok(stream) => stream,
            Err(error) => {
                warn!(query_id, %error, "failed to issue query execution");
                result.update(|snapshot| snapshot.fail(error.to_string()));
                return result;
            }
        };

        let request_id = stream.request_id().to_string();
        debug!(query_id, request_id = %request_id, "query execution started");
        self.running()
            .insert(query_id.to_string(), RunningQuery { request_id, result: result.clone() });

        tokio::spawn(follow_execution(
            Arc::clone(&self.running),
            query_id.to_string(),
            stream,
            result.clone(),
            on_intermediate,
        ));
        result
    }

    /// Stop the running execution of `query_id`, if any, and mark its result
    /// cancelled. Returns whether anything was running.
    pub fn cancel_query_if_running(&self, query_id: &str) -> bool {
        let record = self.running().remove(query_id);
        let Some(record) = record else {
            return false;
        };
        debug!(query_id, request_id = %record.request_id, "cancelling query execution");
        self.commands.cancel(&record.request_id);
        record.result.update(|snapshot| snapshot.fail(CANCELLED_MESSAGE));
        true
    }

    /// Like [`ExecutionService::cancel_query_if_running`], but only when the
    /// running execution feeds `result`.
    pub fn cancel_if_feeding(&self, query_id: &str, result: &ResultHandle) -> bool {
        let feeds = self.running().get(query_id).is_some_and(|record| record.result.ptr_eq(result));
        feeds && self.cancel_query_if_running(query_id)
    }

    pub fn is_running(&self, query_id: &str) -> bool {
        self.running().contains_key(query_id)
    }

    pub fn running_count(&self) -> usize {
        self.running().len()
    }

    fn issue(&self, context: &QueryContext, query_id: &str) -> Result<CommandStream, CommandError> {
        let data = serde_json::to_value(ExecuteQuery {
            analysis_id: context.analysis_id.clone(),
            analysis_version: context.analysis_version,
            qube_id: context.qube_id.clone(),
            query_id: query_id.to_string(),
        })
        .map_err(CommandError::Encode)?;
        self.commands.execute(EXECUTE_QUERY, data)
    }

    fn running(&self) -> MutexGuard<'_, HashMap<String, RunningQuery>> {
        lock_running(&self.running)
    }
}

fn lock_running(
    running: &Mutex<HashMap<String, RunningQuery>>,
) -> MutexGuard<'_, HashMap<String, RunningQuery>> {
    running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Forget the running record, unless a newer run has replaced it.
fn release(running: &Mutex<HashMap<String, RunningQuery>>, query_id: &str, request_id: &str) {
    let mut running = lock_running(running);
    if running.get(query_id).is_some_and(|record| record.request_id == request_id) {
        running.remove(query_id);
    }
}

async fn follow_execution(
    running: Arc<Mutex<HashMap<String, RunningQuery>>>,
    query_id: String,
    mut stream: CommandStream,
    result: ResultHandle,
    on_intermediate: Option<IntermediateCallback>,
) {
    let request_id = stream.request_id().to_string();

    // First report runs on this task so it cannot overtake a later one.
    if let Some(callback) = &on_intermediate {
        callback(&result.snapshot());
    }

    while let Some(event) = stream.next().await {
        match event {
            CommandEvent::Data { data_type, data } => {
                if data_type.as_deref() != Some(TABLE_DATA_TYPE) {
                    debug!(query_id = %query_id, ?data_type, "ignoring non-table frame");
                    continue;
                }
                let update: TableUpdate = match serde_json::from_value(data) {
                    Ok(update) => update,
                    Err(error) => {
                        warn!(query_id = %query_id, %error, "malformed table frame");
                        continue;
                    }
                };
                if result.update(|snapshot| snapshot.apply(update)) {
                    if let Some(callback) = &on_intermediate {
                        callback(&result.snapshot());
                    }
                }
            }
            CommandEvent::Exception(text) => {
                release(&running, &query_id, &request_id);
                debug!(query_id = %query_id, %text, "query execution failed");
                result.update(|snapshot| snapshot.fail(text));
                return;
            }
            CommandEvent::Done => {
                release(&running, &query_id, &request_id);
                debug!(query_id = %query_id, "query execution finished");
                result.update(ResultSnapshot::complete);
                return;
            }
        }
    }

    // The request was deregistered without a terminal answer.
    release(&running, &query_id, &request_id);
    result.update(|snapshot| snapshot.fail(CANCELLED_MESSAGE));
}
