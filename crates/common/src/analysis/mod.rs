// Analysis document model: qubes, queries, and slices.
//
// Decoding normalizes the document: absent or null sequences become empty
// vectors, so code downstream never has to distinguish "missing" from "empty".
// Query results are not part of this model; they are attached by the client
// in a separate map keyed by query id.

pub mod preserve;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The versioned, server-owned document for one saved exploration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub id: String,
    pub version: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub table: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub owner: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub qubes: Vec<Qube>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub slices: Vec<Slice>,
}

/// A named group of queries bound to exactly one slice.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Qube {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    pub slice_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub queries: Vec<Query>,
}

/// One executable diql statement plus display metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub diql: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub display_type: String,
}

/// A named filter restricting the rows a qube's queries operate over.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Slice {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default)]
    pub manual_conjunction: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub slice_disjunctions: Vec<SliceDisjunction>,
}

/// Rows match when `field_name` equals any of `disjunction_values`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SliceDisjunction {
    pub field_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub disjunction_values: Vec<Value>,
}

impl Slice {
    /// Whether two slices select the same rows. Names are ignored.
    pub fn same_selection(&self, other: &Slice) -> bool {
        self.manual_conjunction == other.manual_conjunction
            && self.slice_disjunctions == other.slice_disjunctions
    }
}

/// A local splice could not find the entity the server acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpliceError {
    #[error("qube `{0}` is not present in the loaded analysis")]
    QubeNotFound(String),
    #[error("query `{query_id}` is not present in qube `{qube_id}`")]
    QueryNotFound { qube_id: String, query_id: String },
    #[error("slice `{0}` is not present in the loaded analysis")]
    SliceNotFound(String),
}

impl Analysis {
    pub fn qube(&self, qube_id: &str) -> Option<&Qube> {
        self.qubes.iter().find(|qube| qube.id == qube_id)
    }

    pub fn slice(&self, slice_id: &str) -> Option<&Slice> {
        self.slices.iter().find(|slice| slice.id == slice_id)
    }

    pub fn query(&self, qube_id: &str, query_id: &str) -> Option<&Query> {
        self.qube(qube_id)?.queries.iter().find(|query| query.id == query_id)
    }

    /// Ids of every query in the document, in document order.
    pub fn query_ids(&self) -> impl Iterator<Item = &str> {
        self.qubes.iter().flat_map(|qube| qube.queries.iter().map(|query| query.id.as_str()))
    }

    /// Qubes whose queries run over `slice_id`.
    pub fn qubes_using_slice<'a>(&'a self, slice_id: &'a str) -> impl Iterator<Item = &'a Qube> {
        self.qubes.iter().filter(move |qube| qube.slice_id == slice_id)
    }

    fn qube_mut(&mut self, qube_id: &str) -> Result<&mut Qube, SpliceError> {
        self.qubes
            .iter_mut()
            .find(|qube| qube.id == qube_id)
            .ok_or_else(|| SpliceError::QubeNotFound(qube_id.to_string()))
    }

    // ── Splicing acknowledged entities ──────────────────────────────

    pub fn push_qube(&mut self, qube: Qube) {
        self.qubes.push(qube);
    }

    pub fn replace_qube(&mut self, qube: Qube) -> Result<(), SpliceError> {
        let slot = self.qube_mut(&qube.id)?;
        *slot = qube;
        Ok(())
    }

    pub fn remove_qube(&mut self, qube_id: &str) -> Result<Qube, SpliceError> {
        let index = self
            .qubes
            .iter()
            .position(|qube| qube.id == qube_id)
            .ok_or_else(|| SpliceError::QubeNotFound(qube_id.to_string()))?;
        Ok(self.qubes.remove(index))
    }

    pub fn push_query(&mut self, qube_id: &str, query: Query) -> Result<(), SpliceError> {
        self.qube_mut(qube_id)?.queries.push(query);
        Ok(())
    }

    pub fn replace_query(&mut self, qube_id: &str, query: Query) -> Result<(), SpliceError> {
        let qube = self.qube_mut(qube_id)?;
        let slot = qube.queries.iter_mut().find(|existing| existing.id == query.id).ok_or_else(
            || SpliceError::QueryNotFound { qube_id: qube_id.to_string(), query_id: query.id.clone() },
        )?;
        *slot = query;
        Ok(())
    }

    pub fn remove_query(&mut self, qube_id: &str, query_id: &str) -> Result<Query, SpliceError> {
        let qube = self.qube_mut(qube_id)?;
        let index = qube.queries.iter().position(|query| query.id == query_id).ok_or_else(|| {
            SpliceError::QueryNotFound { qube_id: qube_id.to_string(), query_id: query_id.to_string() }
        })?;
        Ok(qube.queries.remove(index))
    }

    pub fn push_slice(&mut self, slice: Slice) {
        self.slices.push(slice);
    }

    pub fn replace_slice(&mut self, slice: Slice) -> Result<(), SpliceError> {
        let slot = self
            .slices
            .iter_mut()
            .find(|existing| existing.id == slice.id)
            .ok_or_else(|| SpliceError::SliceNotFound(slice.id.clone()))?;
        *slot = slice;
        Ok(())
    }

    pub fn remove_slice(&mut self, slice_id: &str) -> Result<Slice, SpliceError> {
        let index = self
            .slices
            .iter()
            .position(|slice| slice.id == slice_id)
            .ok_or_else(|| SpliceError::SliceNotFound(slice_id.to_string()))?;
        Ok(self.slices.remove(index))
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
