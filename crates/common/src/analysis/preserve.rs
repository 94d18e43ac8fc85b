// Result preservation across document versions.
//
// A query's computed result stays valid when nothing that affects its rows
// changed between two documents: the query text, the qube's slice binding,
// and the selection of that slice. Cosmetic edits (names, display type) keep
// results.

use std::collections::HashSet;

use super::Analysis;

/// Ids of slices present in both documents whose selection is identical.
pub fn stable_slice_ids<'a>(old: &'a Analysis, new: &Analysis) -> HashSet<&'a str> {
    old.slices
        .iter()
        .filter(|slice| new.slice(&slice.id).is_some_and(|next| slice.same_selection(next)))
        .map(|slice| slice.id.as_str())
        .collect()
}

/// Ids of queries whose results computed against `old` remain valid in `new`.
pub fn preserved_query_ids(old: &Analysis, new: &Analysis) -> HashSet<String> {
    let stable_slices = stable_slice_ids(old, new);
    let mut preserved = HashSet::new();

    for old_qube in &old.qubes {
        let Some(new_qube) = new.qube(&old_qube.id) else {
            continue;
        };
        if old_qube.slice_id != new_qube.slice_id
            || !stable_slices.contains(new_qube.slice_id.as_str())
        {
            continue;
        }

        for old_query in &old_qube.queries {
            let unchanged = new_qube
                .queries
                .iter()
                .any(|query| query.id == old_query.id && query.diql == old_query.diql);
            if unchanged {
                preserved.insert(old_query.id.clone());
            }
        }
    }

    preserved
}
