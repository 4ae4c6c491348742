//! Point-in-time reconstruction of folder trees.
//!
//! Historical state is rebuilt from the union of the live and history
//! relations: rows with a transaction time at or before the queried
//! instant are reduced per key to the most recent one (ties broken by the
//! physical insert slot), and rows whose validity period closed at or
//! before the instant are dropped. The filtered edge set is then walked
//! exactly like the live tree.

use crate::error::{Result, VaultError};
use crate::hierarchy::engine::{items_for, FolderHierarchyEngine};
use crate::tables::TableData;
use crate::types::{ContributionId, EdgeRecord, FolderId, FolderNode, FolderRecord, Timestamp};
use crate::versioning;
use std::collections::{BTreeMap, BTreeSet};

impl FolderHierarchyEngine {
    /// Version number of `folder_id` effective at `at`.
    pub fn version_at(&self, folder_id: FolderId, at: Timestamp) -> Result<u32> {
        let data = self.tables().snapshot();
        folder_version_at(&data, folder_id, at)
    }

    /// Latest version number of `folder_id`.
    pub fn latest_version(&self, folder_id: FolderId) -> Result<u32> {
        let data = self.tables().snapshot();
        folder_latest_version(&data, folder_id)
    }

    /// Whether any archived version of `folder_id` exists.
    pub fn has_previous_version(&self, folder_id: FolderId) -> bool {
        let data = self.tables().snapshot();
        data.folder_history
            .get(&folder_id)
            .is_some_and(|rows| !rows.is_empty())
    }

    /// Contribution of the folder version effective at `at`.
    pub fn contribution_at(&self, folder_id: FolderId, at: Timestamp) -> Result<ContributionId> {
        let data = self.tables().snapshot();
        if !data.folders.contains_key(&folder_id) && !data.folder_history.contains_key(&folder_id) {
            return Err(VaultError::FolderNotFound(folder_id));
        }

        let current = data
            .folders
            .get(&folder_id)
            .filter(|f| f.transaction_time <= at);
        let history = data
            .folder_history
            .get(&folder_id)
            .into_iter()
            .flatten()
            .filter(|f| f.transaction_time <= at);
        current
            .into_iter()
            .chain(history)
            .max_by_key(|f| (f.transaction_time, f.slot))
            .map(|f| f.in_contribution)
            .ok_or(VaultError::NoVersionAtTime(at))
    }

    /// Reconstruct the tree rooted at `folder_id` as it was at `at`.
    ///
    /// When the effective version is the latest one, this delegates to the
    /// live reconstruction.
    pub fn tree_at(&self, folder_id: FolderId, at: Timestamp) -> Result<FolderNode> {
        let data = self.tables().snapshot();

        let version = folder_version_at(&data, folder_id, at)?;
        let latest = folder_latest_version(&data, folder_id)?;
        if version == latest && data.folders.contains_key(&folder_id) {
            return self.tree_in(&data, folder_id);
        }

        if folder_row_effective_at(&data, folder_id, at).is_none() {
            // A version existed at or before `at`, but its validity had
            // already closed: the folder was deleted by then.
            return Err(VaultError::FolderNotFound(folder_id));
        }

        let adjacency = edges_effective_at(&data, at);
        let mut visited = BTreeSet::new();
        assemble_at(&data, &adjacency, folder_id, at, &mut visited)
    }
}

fn folder_version_at(data: &TableData, id: FolderId, at: Timestamp) -> Result<u32> {
    let current = data.folders.get(&id).map(|f| f.transaction_time);
    let history: Vec<Timestamp> = data
        .folder_history
        .get(&id)
        .map(|rows| rows.iter().map(|r| r.transaction_time).collect())
        .unwrap_or_default();
    if current.is_none() && history.is_empty() {
        return Err(VaultError::FolderNotFound(id));
    }
    versioning::version_from_timestamp(current, &history, at)
}

fn folder_latest_version(data: &TableData, id: FolderId) -> Result<u32> {
    let current = data.folders.contains_key(&id);
    let history_len = data.folder_history.get(&id).map_or(0, Vec::len);
    if !current && history_len == 0 {
        return Err(VaultError::FolderNotFound(id));
    }
    Ok(versioning::latest_version(current, history_len))
}

/// The folder row effective at `at`: the most recent version written at or
/// before `at` whose validity still covered it.
fn folder_row_effective_at(data: &TableData, id: FolderId, at: Timestamp) -> Option<FolderRecord> {
    let current = data.folders.get(&id).filter(|f| f.transaction_time <= at);
    let history = data
        .folder_history
        .get(&id)
        .into_iter()
        .flatten()
        .filter(|f| f.transaction_time <= at);
    current
        .into_iter()
        .chain(history)
        .max_by_key(|f| (f.transaction_time, f.slot))
        .filter(|f| f.period.end.map_or(true, |end| end > at))
        .cloned()
}

/// The edge set effective at `at`, as a parent -> children adjacency map.
///
/// Each `(parent, child)` pair keeps only its most recent row at or before
/// `at` (supersession is resolved by recency, never accumulation; identical
/// transaction times are broken by the greater insert slot), and rows whose
/// validity closed at or before `at` are dropped.
fn edges_effective_at(data: &TableData, at: Timestamp) -> BTreeMap<FolderId, Vec<FolderId>> {
    let mut best: BTreeMap<(FolderId, FolderId), &EdgeRecord> = BTreeMap::new();
    for edge in data.edges.iter().chain(data.edge_history.iter()) {
        if edge.transaction_time > at {
            continue;
        }
        best.entry((edge.parent, edge.child))
            .and_modify(|current| {
                if (edge.transaction_time, edge.slot) > (current.transaction_time, current.slot) {
                    *current = edge;
                }
            })
            .or_insert(edge);
    }

    let mut adjacency: BTreeMap<FolderId, Vec<FolderId>> = BTreeMap::new();
    for ((parent, child), edge) in best {
        if edge.period.end.map_or(true, |end| end > at) {
            adjacency.entry(parent).or_default().push(child);
        }
    }
    adjacency
}

fn assemble_at(
    data: &TableData,
    adjacency: &BTreeMap<FolderId, Vec<FolderId>>,
    id: FolderId,
    at: Timestamp,
    visited: &mut BTreeSet<FolderId>,
) -> Result<FolderNode> {
    if !visited.insert(id) {
        return Err(VaultError::CorruptHierarchy(format!(
            "folder {id} visited twice during reconstruction"
        )));
    }

    let record = folder_row_effective_at(data, id, at).ok_or_else(|| {
        VaultError::Inconsistent(format!("edge references folder {id} with no row effective at {at}"))
    })?;
    let items = items_for(data, id, record.in_contribution);

    let children = adjacency
        .get(&id)
        .into_iter()
        .flatten()
        .map(|child| assemble_at(data, adjacency, *child, at, visited))
        .collect::<Result<Vec<_>>>()?;

    Ok(FolderNode {
        id: record.id,
        name: record.name,
        archetype_node_id: record.archetype_node_id,
        active: record.active,
        details: record.details,
        in_contribution: record.in_contribution,
        transaction_time: record.transaction_time,
        items,
        children,
    })
}
