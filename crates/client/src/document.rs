// Document service: the loaded analysis, optimistic mutations, and the query
// results attached to it.
//
// The server owns the document. Every mutation is sent against the loaded
// (id, version); the acknowledged entity is spliced in locally and the local
// version advances to the one the server returned. After every load and
// every accepted mutation the previous and new documents are compared, and
// only results that are still valid stay attached.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use diql_common::analysis::preserve::preserved_query_ids;
use diql_common::analysis::{Analysis, Qube, Query, Slice, SpliceError};
use diql_common::protocol::commands::{
    mutation_data, AnalysisRef, MutationAck, NewQube, NewQuery, NewSlice, NewestVersion,
    QubeBody, QueryBody, Removed, SliceBody, ADD_QUBE, ADD_QUERY, ADD_SLICE, CLONE_ANALYSIS,
    GET_ANALYSIS, GET_NEWEST_ANALYSIS_VERSION, REMOVE_QUBE, REMOVE_QUERY, REMOVE_SLICE,
    UPDATE_QUBE, UPDATE_QUERY, UPDATE_SLICE,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::commands::{CommandClient, CommandError};
use crate::execution::{ExecutionService, IntermediateCallback, QueryContext, ResultHandle};

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("No analysis loaded")]
    NoAnalysisLoaded,
    /// The server rejected the command.
    #[error("{0}")]
    Server(String),
    /// The server acknowledged something the local document cannot apply.
    #[error("internal error, please refresh")]
    Internal,
    #[error("{0}")]
    Invalid(String),
    #[error("a newer load replaced this one")]
    Superseded,
    #[error(transparent)]
    Command(CommandError),
}

impl From<CommandError> for DocumentError {
    fn from(error: CommandError) -> Self {
        match error {
            CommandError::Exception(text) => Self::Server(text),
            CommandError::Decode { command, source } => {
                error!(command = %command, error = %source, "malformed acknowledgement");
                Self::Internal
            }
            other => Self::Command(other),
        }
    }
}

#[derive(Clone)]
pub struct DocumentService {
    commands: CommandClient,
    execution: ExecutionService,
    state: Arc<Mutex<DocumentState>>,
}

#[derive(Default)]
struct DocumentState {
    loaded: Option<Analysis>,
    /// Attached results by query id.
    results: HashMap<String, ResultHandle>,
    newest_version: Option<i64>,
    /// Bumped whenever the loaded document is replaced wholesale.
    generation: u64,
}

type Results = Vec<(String, ResultHandle)>;

impl DocumentService {
    pub fn new(commands: CommandClient, execution: ExecutionService) -> Self {
        Self { commands, execution, state: Arc::new(Mutex::new(DocumentState::default())) }
    }

    // ── Loading ─────────────────────────────────────────────────────

    /// Load `analysis_id` at `version`, or at its newest version.
    pub async fn load_analysis(
        &self,
        analysis_id: &str,
        version: Option<i64>,
    ) -> Result<Analysis, DocumentError> {
        let (generation, previous) = {
            let mut state = self.state();
            if let (Some(loaded), Some(version)) = (&state.loaded, version) {
                if loaded.id == analysis_id && loaded.version == version {
                    return Ok(loaded.clone());
                }
            }

            state.generation += 1;
            let generation = state.generation;
            state.newest_version = None;
            let loaded = state.loaded.take();
            let results: Results = state.results.drain().collect();
            drop(state);

            match loaded.filter(|loaded| loaded.id == analysis_id) {
                Some(loaded) => (generation, Some((loaded, results))),
                None => {
                    self.discard(results);
                    (generation, None)
                }
            }
        };
        info!(analysis_id, ?version, "loading analysis");

        let fetched = self.fetch(analysis_id, version).await;
        let (analysis, newest) = match fetched {
            Ok(fetched) => fetched,
            Err(error) => {
                if let Some((_, results)) = previous {
                    self.discard(results);
                }
                return Err(error);
            }
        };

        let mut state = self.state();
        if state.generation != generation {
            drop(state);
            debug!(analysis_id, "load superseded");
            if let Some((_, results)) = previous {
                self.discard(results);
            }
            return Err(DocumentError::Superseded);
        }

        let dropped = match previous {
            Some((previous, results)) => {
                let preserved = preserved_query_ids(&previous, &analysis);
                let (kept, dropped) = partition(results, &preserved);
                debug!(analysis_id, kept = kept.len(), dropped = dropped.len(), "carried results over");
                state.results.extend(kept);
                dropped
            }
            None => Vec::new(),
        };
        state.newest_version = Some(newest.max(analysis.version));
        state.loaded = Some(analysis.clone());
        drop(state);

        self.discard(dropped);
        Ok(analysis)
    }

    async fn fetch(
        &self,
        analysis_id: &str,
        version: Option<i64>,
    ) -> Result<(Analysis, i64), DocumentError> {
        let newest = match version {
            Some(_) => {
                let newest: NewestVersion = self
                    .commands
                    .call_as(GET_NEWEST_ANALYSIS_VERSION, &AnalysisRef::newest(analysis_id))
                    .await?;
                Some(newest.version)
            }
            None => None,
        };

        let target = AnalysisRef { analysis_id: analysis_id.to_string(), analysis_version: version };
        let analysis: Analysis = self.commands.call_as(GET_ANALYSIS, &target).await?;
        if analysis.id != analysis_id {
            error!(requested = analysis_id, received = %analysis.id, "server returned another analysis");
            return Err(DocumentError::Internal);
        }
        let newest = newest.unwrap_or(analysis.version);
        Ok((analysis, newest))
    }

    /// Drop the loaded document and its results, cancelling their executions.
    pub fn unload_analysis(&self) {
        let results: Results = {
            let mut state = self.state();
            state.generation += 1;
            state.loaded = None;
            state.newest_version = None;
            state.results.drain().collect()
        };
        self.discard(results);
    }

    /// Install a document obtained elsewhere. Results stay attached where the
    /// preservation rules allow, as with a load.
    pub fn set_loaded_analysis(&self, analysis: Analysis) {
        let dropped = {
            let mut state = self.state();
            state.generation += 1;
            let results: Results = state.results.drain().collect();
            let dropped = match state.loaded.take().filter(|loaded| loaded.id == analysis.id) {
                Some(previous) => {
                    let preserved = preserved_query_ids(&previous, &analysis);
                    let (kept, dropped) = partition(results, &preserved);
                    state.results.extend(kept);
                    let newest = state.newest_version.unwrap_or(analysis.version);
                    state.newest_version = Some(newest.max(analysis.version));
                    dropped
                }
                None => {
                    state.newest_version = Some(analysis.version);
                    results
                }
            };
            state.loaded = Some(analysis);
            dropped
        };
        self.discard(dropped);
    }

    /// Clone the loaded version on the server and switch to the clone.
    pub async fn clone_and_load_current_analysis(&self) -> Result<Analysis, DocumentError> {
        let source = self.current_ref()?;
        info!(analysis_id = %source.analysis_id, version = ?source.analysis_version, "cloning analysis");
        let clone: Analysis = self.commands.call_as(CLONE_ANALYSIS, &source).await?;
        self.set_loaded_analysis(clone.clone());
        Ok(clone)
    }

    // ── Mutations ───────────────────────────────────────────────────

    pub async fn add_qube(&self, qube: NewQube) -> Result<Qube, DocumentError> {
        let fields = json!({ "qube": qube });
        self.mutate::<QubeBody, _>(
            ADD_QUBE,
            fields,
            |doc| require_slice(doc, &qube.slice_id),
            |doc, body| {
                doc.push_qube(body.qube.clone());
                Ok(body.qube)
            },
        )
        .await
    }

    pub async fn update_qube(&self, qube: Qube) -> Result<Qube, DocumentError> {
        let fields = json!({ "qube": qube });
        self.mutate::<QubeBody, _>(
            UPDATE_QUBE,
            fields,
            |doc| {
                require_qube(doc, &qube.id)?;
                require_slice(doc, &qube.slice_id)
            },
            |doc, body| {
                doc.replace_qube(body.qube.clone())?;
                Ok(body.qube)
            },
        )
        .await
    }

    pub async fn remove_qube(&self, qube_id: &str) -> Result<(), DocumentError> {
        self.mutate::<Removed, _>(
            REMOVE_QUBE,
            json!({ "qubeId": qube_id }),
            |doc| require_qube(doc, qube_id),
            |doc, _| doc.remove_qube(qube_id).map(drop),
        )
        .await
    }

    pub async fn add_query(&self, qube_id: &str, query: NewQuery) -> Result<Query, DocumentError> {
        self.mutate::<QueryBody, _>(
            ADD_QUERY,
            json!({ "qubeId": qube_id, "query": query }),
            |doc| require_qube(doc, qube_id),
            |doc, body| {
                doc.push_query(qube_id, body.query.clone())?;
                Ok(body.query)
            },
        )
        .await
    }

    pub async fn update_query(&self, qube_id: &str, query: Query) -> Result<Query, DocumentError> {
        let fields = json!({ "qubeId": qube_id, "query": query });
        self.mutate::<QueryBody, _>(
            UPDATE_QUERY,
            fields,
            |doc| require_query(doc, qube_id, &query.id),
            |doc, body| {
                doc.replace_query(qube_id, body.query.clone())?;
                Ok(body.query)
            },
        )
        .await
    }

    pub async fn remove_query(&self, qube_id: &str, query_id: &str) -> Result<(), DocumentError> {
        self.mutate::<Removed, _>(
            REMOVE_QUERY,
            json!({ "qubeId": qube_id, "queryId": query_id }),
            |doc| require_query(doc, qube_id, query_id),
            |doc, _| doc.remove_query(qube_id, query_id).map(drop),
        )
        .await
    }

    pub async fn add_slice(&self, slice: NewSlice) -> Result<Slice, DocumentError> {
        self.mutate::<SliceBody, _>(
            ADD_SLICE,
            json!({ "slice": slice }),
            |_| Ok(()),
            |doc, body| {
                doc.push_slice(body.slice.clone());
                Ok(body.slice)
            },
        )
        .await
    }

    pub async fn update_slice(&self, slice: Slice) -> Result<Slice, DocumentError> {
        let fields = json!({ "slice": slice });
        self.mutate::<SliceBody, _>(
            UPDATE_SLICE,
            fields,
            |doc| require_slice(doc, &slice.id),
            |doc, body| {
                doc.replace_slice(body.slice.clone())?;
                Ok(body.slice)
            },
        )
        .await
    }

    pub async fn remove_slice(&self, slice_id: &str) -> Result<(), DocumentError> {
        self.mutate::<Removed, _>(
            REMOVE_SLICE,
            json!({ "sliceId": slice_id }),
            |doc| {
                require_slice(doc, slice_id)?;
                match doc.qubes_using_slice(slice_id).next() {
                    Some(qube) => Err(DocumentError::Invalid(format!(
                        "slice `{slice_id}` is still used by qube `{}`",
                        qube.id
                    ))),
                    None => Ok(()),
                }
            },
            |doc, _| doc.remove_slice(slice_id).map(drop),
        )
        .await
    }

    /// Send one mutation against the loaded version and apply its
    /// acknowledgement locally.
    async fn mutate<B, R>(
        &self,
        command: &str,
        fields: Value,
        check: impl FnOnce(&Analysis) -> Result<(), DocumentError>,
        splice: impl FnOnce(&mut Analysis, B) -> Result<R, SpliceError>,
    ) -> Result<R, DocumentError>
    where
        B: DeserializeOwned,
    {
        let (generation, target) = {
            let state = self.state();
            let loaded = state.loaded.as_ref().ok_or(DocumentError::NoAnalysisLoaded)?;
            check(loaded)?;
            (state.generation, AnalysisRef::at(loaded.id.clone(), loaded.version))
        };
        debug!(command, analysis_id = %target.analysis_id, version = ?target.analysis_version, "sending mutation");

        let answer = self.commands.call(command, mutation_data(&target, fields)).await?;
        let ack: MutationAck<B> = serde_json::from_value(answer)
            .map_err(|source| CommandError::Decode { command: command.to_string(), source })?;

        let mut guard = self.state();
        let state = &mut *guard;
        let loaded = state.loaded.as_mut().ok_or(DocumentError::NoAnalysisLoaded)?;
        // The acknowledgement only applies to the document it was sent against.
        if state.generation != generation
            || loaded.id != target.analysis_id
            || Some(loaded.version) != target.analysis_version
        {
            debug!(command, analysis_id = %loaded.id, "document changed while mutation was in flight");
            return Err(DocumentError::Superseded);
        }

        let previous = loaded.clone();
        let entity = splice(&mut *loaded, ack.body).map_err(|error| {
            error!(command, %error, "acknowledged mutation does not match the local document");
            DocumentError::Internal
        })?;

        if ack.analysis_version > previous.version + 1 {
            debug!(
                analysis_id = %loaded.id,
                from = previous.version,
                to = ack.analysis_version,
                "version advanced by more than one"
            );
        }
        loaded.version = loaded.version.max(ack.analysis_version);
        let version = loaded.version;
        state.newest_version = Some(state.newest_version.map_or(version, |newest| newest.max(version)));

        let preserved = preserved_query_ids(&previous, loaded);
        let results: Results = state.results.drain().collect();
        let (kept, dropped) = partition(results, &preserved);
        state.results.extend(kept);
        drop(guard);

        self.discard(dropped);
        Ok(entity)
    }

    // ── Query results ───────────────────────────────────────────────

    /// Result of a query in the loaded document, executing it only if no
    /// result is attached yet.
    pub fn provide_query_results(
        &self,
        qube_id: &str,
        query_id: &str,
        on_intermediate: Option<IntermediateCallback>,
    ) -> Result<ResultHandle, DocumentError> {
        let mut state = self.state();
        let loaded = state.loaded.as_ref().ok_or(DocumentError::NoAnalysisLoaded)?;
        require_query(loaded, qube_id, query_id)?;
        let context = QueryContext {
            analysis_id: loaded.id.clone(),
            analysis_version: loaded.version,
            qube_id: qube_id.to_string(),
        };

        let attached = state.results.get(query_id).cloned();
        let result = self.execution.provide_query_results(
            &context,
            query_id,
            attached.as_ref(),
            on_intermediate,
        );
        state.results.insert(query_id.to_string(), result.clone());
        Ok(result)
    }

    /// Cancel the running execution of a query. The attached result stays
    /// attached, marked cancelled.
    pub fn cancel_query(&self, query_id: &str) -> bool {
        self.execution.cancel_query_if_running(query_id)
    }

    /// Detach a query's result so the next request re-executes it.
    pub fn clear_query_result(&self, query_id: &str) -> Option<ResultHandle> {
        let removed = self.state().results.remove(query_id);
        if let Some(result) = &removed {
            self.execution.cancel_if_feeding(query_id, result);
        }
        removed
    }

    // ── Accessors ───────────────────────────────────────────────────

    /// A copy of the loaded document.
    pub fn document(&self) -> Option<Analysis> {
        self.state().loaded.clone()
    }

    pub fn result(&self, query_id: &str) -> Option<ResultHandle> {
        self.state().results.get(query_id).cloned()
    }

    pub fn newest_version(&self) -> Option<i64> {
        self.state().newest_version
    }

    pub fn is_viewing_newest(&self) -> bool {
        let state = self.state();
        match (&state.loaded, state.newest_version) {
            (Some(loaded), Some(newest)) => loaded.version >= newest,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub fn execution(&self) -> &ExecutionService {
        &self.execution
    }

    fn current_ref(&self) -> Result<AnalysisRef, DocumentError> {
        let state = self.state();
        let loaded = state.loaded.as_ref().ok_or(DocumentError::NoAnalysisLoaded)?;
        Ok(AnalysisRef::at(loaded.id.clone(), loaded.version))
    }

    /// Cancel the executions still feeding results that were just detached.
    fn discard(&self, results: Results) {
        for (query_id, result) in results {
            if self.execution.cancel_if_feeding(&query_id, &result) {
                debug!(query_id = %query_id, "cancelled execution of discarded result");
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, DocumentState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn partition(results: Results, preserved: &HashSet<String>) -> (Results, Results) {
    results.into_iter().partition(|(query_id, _)| preserved.contains(query_id))
}

fn require_qube(doc: &Analysis, qube_id: &str) -> Result<(), DocumentError> {
    match doc.qube(qube_id) {
        Some(_) => Ok(()),
        None => Err(DocumentError::Invalid(format!("no qube `{qube_id}` in the loaded analysis"))),
    }
}

fn require_query(doc: &Analysis, qube_id: &str, query_id: &str) -> Result<(), DocumentError> {
    require_qube(doc, qube_id)?;
    match doc.query(qube_id, query_id) {
        Some(_) => Ok(()),
        None => Err(DocumentError::Invalid(format!("no query `{query_id}` in qube `{qube_id}`"))),
    }
}

fn require_slice(doc: &Analysis, slice_id: &str) -> Result<(), DocumentError> {
    match doc.slice(slice_id) {
        Some(_) => Ok(()),
        None => Err(DocumentError::Invalid(format!("no slice `{slice_id}` in the loaded analysis"))),
    }
}
