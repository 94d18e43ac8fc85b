// Command vocabulary: names, request payloads, and acknowledgement shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::analysis::{Qube, Query, Slice, SliceDisjunction};

pub const GET_NEWEST_ANALYSIS_VERSION: &str = "getNewestAnalysisVersion";
pub const GET_ANALYSIS: &str = "getAnalysis";
pub const CLONE_ANALYSIS: &str = "cloneAnalysis";
pub const EXECUTE_QUERY: &str = "executeQuery";

pub const ADD_QUBE: &str = "addQube";
pub const UPDATE_QUBE: &str = "updateQube";
pub const REMOVE_QUBE: &str = "removeQube";
pub const ADD_QUERY: &str = "addQuery";
pub const UPDATE_QUERY: &str = "updateQuery";
pub const REMOVE_QUERY: &str = "removeQuery";
pub const ADD_SLICE: &str = "addSlice";
pub const UPDATE_SLICE: &str = "updateSlice";
pub const REMOVE_SLICE: &str = "removeSlice";

/// Identifies one version of one analysis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRef {
    pub analysis_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_version: Option<i64>,
}

impl AnalysisRef {
    pub fn newest(analysis_id: impl Into<String>) -> Self {
        Self { analysis_id: analysis_id.into(), analysis_version: None }
    }

    pub fn at(analysis_id: impl Into<String>, version: i64) -> Self {
        Self { analysis_id: analysis_id.into(), analysis_version: Some(version) }
    }
}

/// Answer to `getNewestAnalysisVersion`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewestVersion {
    pub version: i64,
}

/// Command data of `executeQuery`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteQuery {
    pub analysis_id: String,
    pub analysis_version: i64,
    pub qube_id: String,
    pub query_id: String,
}

/// Fields of a qube the client chooses when creating one.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewQube {
    pub name: String,
    pub slice_id: String,
}

/// Fields of a query the client chooses when creating one.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewQuery {
    pub name: String,
    pub diql: String,
    pub display_type: String,
}

/// Fields of a slice the client chooses when creating one.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewSlice {
    pub name: String,
    pub manual_conjunction: Option<String>,
    pub slice_disjunctions: Vec<SliceDisjunction>,
}

/// A mutation acknowledgement: the new document version plus the entity the
/// server stored, if the mutation returns one.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MutationAck<T> {
    pub analysis_version: i64,
    #[serde(flatten)]
    pub body: T,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct QubeBody {
    pub qube: Qube,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct QueryBody {
    pub query: Query,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SliceBody {
    pub slice: Slice,
}

/// Acknowledgement body of removals, which return only the version.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Removed {}

/// Build mutation command data: the analysis reference merged with the
/// operation's own fields.
pub fn mutation_data(target: &AnalysisRef, fields: Value) -> Value {
    let mut data = serde_json::Map::new();
    data.insert("analysisId".to_string(), Value::String(target.analysis_id.clone()));
    if let Some(version) = target.analysis_version {
        data.insert("analysisVersion".to_string(), Value::from(version));
    }
    if let Value::Object(extra) = fields {
        data.extend(extra);
    }
    Value::Object(data)
}
