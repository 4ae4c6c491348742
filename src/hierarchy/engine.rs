//! Folder hierarchy engine: build, retrieve, replace, and delete trees.

use crate::error::{Result, VaultError};
use crate::tables::{Op, TableData, Tables, Transaction};
use crate::types::{
    ContributionId, EdgeRecord, FolderId, FolderNode, FolderRecord, FolderSpec, ItemRecord,
    ObjectRef, Period, RecordAccess, Slot, Timestamp,
};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

/// Builds, reconstructs, replaces, and deletes versioned folder trees.
pub struct FolderHierarchyEngine {
    tables: Arc<Tables>,
}

impl FolderHierarchyEngine {
    pub(crate) fn new(tables: Arc<Tables>) -> Self {
        Self { tables }
    }

    pub(crate) fn tables(&self) -> &Tables {
        &self.tables
    }

    /// Stage the materialization of a caller-supplied tree description.
    ///
    /// Every node, edge, and item is written under the one contribution.
    /// Staging is parent-before-children; a failing child aborts the whole
    /// build before anything becomes visible.
    pub(crate) fn stage_build(
        &self,
        txn: &mut Transaction,
        spec: &FolderSpec,
        contribution: ContributionId,
        at: Timestamp,
    ) -> Result<FolderId> {
        self.stage_node(txn, spec, contribution, at, None)
    }

    fn stage_node(
        &self,
        txn: &mut Transaction,
        spec: &FolderSpec,
        contribution: ContributionId,
        at: Timestamp,
        reuse_id: Option<FolderId>,
    ) -> Result<FolderId> {
        if spec.name.trim().is_empty() {
            return Err(VaultError::InvalidArgument(
                "folder name must not be empty".into(),
            ));
        }

        let id = reuse_id.unwrap_or_else(|| FolderId(self.tables.next_id()));
        txn.push(Op::InsertFolder(FolderRecord {
            id,
            name: spec.name.clone(),
            archetype_node_id: spec.archetype_node_id.clone(),
            active: spec.active,
            details: spec.details.clone(),
            in_contribution: contribution,
            transaction_time: at,
            period: Period::open_from(at),
            slot: Slot::default(),
        }));

        for item in &spec.items {
            txn.push(Op::InsertItem(ItemRecord {
                folder: id,
                object: item.clone(),
                in_contribution: contribution,
                transaction_time: at,
                period: Period::open_from(at),
                slot: Slot::default(),
            }));
        }

        for child in &spec.children {
            let child_id = self.stage_node(txn, child, contribution, at, None)?;
            txn.push(Op::InsertEdge(EdgeRecord {
                parent: id,
                child: child_id,
                in_contribution: contribution,
                transaction_time: at,
                period: Period::open_from(at),
                slot: Slot::default(),
            }));
        }

        Ok(id)
    }

    /// Reconstruct the current tree rooted at `folder_id`.
    pub fn tree(&self, folder_id: FolderId) -> Result<FolderNode> {
        let data = self.tables.snapshot();
        self.tree_in(&data, folder_id)
    }

    pub(crate) fn tree_in(&self, data: &TableData, folder_id: FolderId) -> Result<FolderNode> {
        let mut visited = BTreeSet::new();
        assemble(data, folder_id, &mut visited)
    }

    /// Stage a full-replace update of the subtree rooted at `folder_id`.
    ///
    /// The existing subtree is archived and the replacement rebuilt under
    /// the new contribution. The root keeps its folder id, so version
    /// counting and retrieval by the original id survive the update; when
    /// the root was itself a subfolder it is re-attached to its parent.
    pub(crate) fn stage_update(
        &self,
        txn: &mut Transaction,
        folder_id: FolderId,
        spec: &FolderSpec,
        contribution: ContributionId,
        at: Timestamp,
    ) -> Result<bool> {
        let (parent, removed) = {
            let data = self.tables.snapshot();
            if !data.folders.contains_key(&folder_id) {
                return Err(VaultError::FolderNotFound(folder_id));
            }
            let parent = data
                .edges
                .iter()
                .find(|e| e.child == folder_id)
                .map(|e| e.parent);
            (parent, live_closure(&data, folder_id)?)
        };

        txn.push(Op::RemoveSubtree {
            folders: removed,
            at,
        });
        self.stage_node(txn, spec, contribution, at, Some(folder_id))?;
        if let Some(parent) = parent {
            txn.push(Op::InsertEdge(EdgeRecord {
                parent,
                child: folder_id,
                in_contribution: contribution,
                transaction_time: at,
                period: Period::open_from(at),
                slot: Slot::default(),
            }));
        }
        Ok(true)
    }

    /// Stage the cascading delete of `folder_id` and all its descendants.
    /// Returns the number of folders that will be removed.
    pub(crate) fn stage_delete(
        &self,
        txn: &mut Transaction,
        folder_id: FolderId,
        at: Timestamp,
    ) -> Result<usize> {
        if folder_id.is_nil() {
            return Err(VaultError::InvalidArgument(
                "folder id must not be nil".into(),
            ));
        }

        let removed = {
            let data = self.tables.snapshot();
            if !data.folders.contains_key(&folder_id) {
                return Err(VaultError::FolderNotFound(folder_id));
            }
            live_closure(&data, folder_id)?
        };

        let count = removed.len();
        txn.push(Op::RemoveSubtree {
            folders: removed,
            at,
        });
        Ok(count)
    }
}

impl RecordAccess for FolderHierarchyEngine {}

/// The reachability closure over live edges: `root` plus every descendant,
/// in breadth-first order.
///
/// A node reached twice means a cycle or a multi-parent link; the walk
/// stops with `CorruptHierarchy` instead of looping.
pub(crate) fn live_closure(data: &TableData, root: FolderId) -> Result<Vec<FolderId>> {
    let mut visited: BTreeSet<FolderId> = BTreeSet::new();
    visited.insert(root);
    let mut order = vec![root];
    let mut worklist = VecDeque::from([root]);

    while let Some(parent) = worklist.pop_front() {
        for edge in data.edges.iter().filter(|e| e.parent == parent) {
            if !visited.insert(edge.child) {
                return Err(VaultError::CorruptHierarchy(format!(
                    "folder {} is reachable through more than one path",
                    edge.child
                )));
            }
            order.push(edge.child);
            worklist.push_back(edge.child);
        }
    }

    Ok(order)
}

/// Items attached to `folder` under `contribution`, in attach order.
pub(crate) fn items_for(
    data: &TableData,
    folder: FolderId,
    contribution: ContributionId,
) -> Vec<ObjectRef> {
    let mut rows: Vec<&ItemRecord> = data
        .items
        .iter()
        .chain(data.item_history.iter())
        .filter(|i| i.folder == folder && i.in_contribution == contribution)
        .collect();
    rows.sort_by_key(|i| i.slot);
    rows.into_iter().map(|i| i.object.clone()).collect()
}

fn assemble(data: &TableData, id: FolderId, visited: &mut BTreeSet<FolderId>) -> Result<FolderNode> {
    if !visited.insert(id) {
        return Err(VaultError::CorruptHierarchy(format!(
            "folder {id} visited twice during reconstruction"
        )));
    }

    let record = data.folders.get(&id).ok_or(VaultError::FolderNotFound(id))?;
    let items = items_for(data, id, record.in_contribution);

    let mut child_ids: Vec<FolderId> = data
        .edges
        .iter()
        .filter(|e| e.parent == id)
        .map(|e| e.child)
        .collect();
    child_ids.sort_unstable();

    let children = child_ids
        .into_iter()
        .map(|child| assemble(data, child, visited))
        .collect::<Result<Vec<_>>>()?;

    Ok(FolderNode {
        id: record.id,
        name: record.name.clone(),
        archetype_node_id: record.archetype_node_id.clone(),
        active: record.active,
        details: record.details.clone(),
        in_contribution: record.in_contribution,
        transaction_time: record.transaction_time,
        items,
        children,
    })
}
