//! Relational backbone: current + history relations and atomic transactions.
//!
//! All writes are expressed as a [`Transaction`] of staged operations.
//! `Tables::commit` validates every operation against the pre-transaction
//! state (tracking effects staged earlier in the same transaction) before
//! applying anything, so a constraint violation leaves the store untouched.
//!
//! Archiving never mutates history: superseded and deleted rows move to the
//! matching history relation with their validity period closed at the
//! superseding transaction time.

use crate::error::{Result, VaultError};
use crate::journal::Journal;
use crate::types::{
    ChangeType, ContributionDataType, ContributionId, ContributionRecord, ContributionState,
    EdgeRecord, EhrId, EhrRecord, FolderId, FolderRecord, ItemRecord, PartyId, Slot, StatusId,
    StatusRecord, SystemId, Timestamp,
};
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Magic bytes for the table snapshot file.
const TABLES_MAGIC: &[u8; 4] = b"CVT\0";

/// Current snapshot format version.
const TABLES_VERSION: u8 = 1;

/// A staged table operation. Applied in order, all-or-nothing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum Op {
    InsertContribution(ContributionRecord),
    CommitContribution {
        id: ContributionId,
        time_committed: Timestamp,
        committer: Option<PartyId>,
        system_id: Option<SystemId>,
        data_type: ContributionDataType,
        state: ContributionState,
        change_type: ChangeType,
        description: Option<String>,
    },
    InsertEhr(EhrRecord),
    SetEhrDirectory {
        ehr: EhrId,
        directory: Option<FolderId>,
    },
    InsertStatus(StatusRecord),
    ReplaceStatus {
        id: StatusId,
        replacement: StatusRecord,
    },
    InsertFolder(FolderRecord),
    InsertEdge(EdgeRecord),
    InsertItem(ItemRecord),
    /// Archive the given folder rows plus every edge and item touching them.
    RemoveSubtree {
        folders: Vec<FolderId>,
        at: Timestamp,
    },
    RegisterParty {
        namespace: String,
        external_id: String,
        party: PartyId,
    },
}

/// An atomic batch of staged operations.
#[derive(Debug, Default)]
pub(crate) struct Transaction {
    pub(crate) ops: Vec<Op>,
}

impl Transaction {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, op: Op) {
        self.ops.push(op);
    }
}

/// All relations, plus the id and slot counters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct TableData {
    next_id: u64,
    next_slot: u64,
    pub ehrs: BTreeMap<EhrId, EhrRecord>,
    pub statuses: BTreeMap<StatusId, StatusRecord>,
    pub status_history: BTreeMap<StatusId, Vec<StatusRecord>>,
    pub contributions: BTreeMap<ContributionId, ContributionRecord>,
    pub folders: BTreeMap<FolderId, FolderRecord>,
    pub folder_history: BTreeMap<FolderId, Vec<FolderRecord>>,
    pub edges: Vec<EdgeRecord>,
    pub edge_history: Vec<EdgeRecord>,
    pub items: Vec<ItemRecord>,
    pub item_history: Vec<ItemRecord>,
    /// Subject registry: (namespace, external id) -> party.
    pub parties: BTreeMap<(String, String), PartyId>,
}

impl Default for TableData {
    fn default() -> Self {
        Self {
            // Id 0 is reserved for the nil folder id.
            next_id: 1,
            next_slot: 1,
            ehrs: BTreeMap::new(),
            statuses: BTreeMap::new(),
            status_history: BTreeMap::new(),
            contributions: BTreeMap::new(),
            folders: BTreeMap::new(),
            folder_history: BTreeMap::new(),
            edges: Vec::new(),
            edge_history: Vec::new(),
            items: Vec::new(),
            item_history: Vec::new(),
            parties: BTreeMap::new(),
        }
    }
}

/// Effects staged earlier in the transaction being validated.
#[derive(Debug, Default)]
struct Staged {
    contributions: BTreeSet<ContributionId>,
    committed: BTreeSet<ContributionId>,
    ehrs: BTreeSet<EhrId>,
    folders: BTreeSet<FolderId>,
    removed_folders: BTreeSet<FolderId>,
    status_parties: BTreeSet<PartyId>,
    edge_children: BTreeSet<FolderId>,
}

impl TableData {
    fn bump_slot(&mut self) -> Slot {
        let slot = Slot(self.next_slot);
        self.next_slot += 1;
        slot
    }

    fn contribution_known(&self, id: ContributionId, staged: &Staged) -> bool {
        self.contributions.contains_key(&id) || staged.contributions.contains(&id)
    }

    fn folder_known(&self, id: FolderId, staged: &Staged) -> bool {
        staged.folders.contains(&id)
            || (self.folders.contains_key(&id) && !staged.removed_folders.contains(&id))
    }

    fn ehr_known(&self, id: EhrId, staged: &Staged) -> bool {
        self.ehrs.contains_key(&id) || staged.ehrs.contains(&id)
    }

    fn party_taken(&self, party: PartyId, staged: &Staged) -> bool {
        staged.status_parties.contains(&party)
            || self.statuses.values().any(|s| s.party == party)
    }

    /// Validate one operation against current state plus staged effects.
    fn check(&self, op: &Op, staged: &mut Staged) -> Result<()> {
        match op {
            Op::InsertContribution(c) => {
                if self.contribution_known(c.id, staged) {
                    return Err(VaultError::Inconsistent(format!(
                        "contribution id {} reused",
                        c.id
                    )));
                }
                staged.contributions.insert(c.id);
            }
            Op::CommitContribution { id, .. } => {
                match self.contributions.get(id) {
                    Some(c) if !c.is_draft() => {
                        return Err(VaultError::InvalidState(format!(
                            "contribution {id} is already committed"
                        )));
                    }
                    Some(_) => {}
                    None if staged.contributions.contains(id) => {}
                    None => return Err(VaultError::ContributionNotFound(*id)),
                }
                if !staged.committed.insert(*id) {
                    return Err(VaultError::InvalidState(format!(
                        "contribution {id} is already committed"
                    )));
                }
            }
            Op::InsertEhr(e) => {
                if self.ehr_known(e.id, staged) {
                    return Err(VaultError::InvalidArgument(format!(
                        "EHR {} already exists",
                        e.id
                    )));
                }
                if let Some(dir) = e.directory {
                    if !self.folder_known(dir, staged) {
                        return Err(VaultError::FolderNotFound(dir));
                    }
                }
                staged.ehrs.insert(e.id);
            }
            Op::SetEhrDirectory { ehr, directory } => {
                if !self.ehr_known(*ehr, staged) {
                    return Err(VaultError::EhrNotFound(*ehr));
                }
                if let Some(dir) = directory {
                    if !self.folder_known(*dir, staged) {
                        return Err(VaultError::FolderNotFound(*dir));
                    }
                }
            }
            Op::InsertStatus(s) => {
                if self.statuses.contains_key(&s.id) {
                    return Err(VaultError::InvalidArgument(format!(
                        "status {} already exists",
                        s.id
                    )));
                }
                if !self.ehr_known(s.ehr_id, staged) {
                    return Err(VaultError::EhrNotFound(s.ehr_id));
                }
                if !self.contribution_known(s.in_contribution, staged) {
                    return Err(VaultError::ContributionNotFound(s.in_contribution));
                }
                if self.statuses.values().any(|x| x.ehr_id == s.ehr_id) {
                    return Err(VaultError::InvalidArgument(format!(
                        "EHR {} already has a status",
                        s.ehr_id
                    )));
                }
                // The unique constraint on the subject party. This rejection
                // is the canonical one; callers may pre-check but cannot
                // race past it.
                if self.party_taken(s.party, staged) {
                    return Err(VaultError::InvalidArgument(format!(
                        "party {} already associated to an EHR",
                        s.party
                    )));
                }
                staged.status_parties.insert(s.party);
            }
            Op::ReplaceStatus { id, replacement } => {
                let current = self
                    .statuses
                    .get(id)
                    .ok_or(VaultError::StatusNotFound(*id))?;
                if replacement.party != current.party && self.party_taken(replacement.party, staged)
                {
                    return Err(VaultError::InvalidArgument(format!(
                        "party {} already associated to an EHR",
                        replacement.party
                    )));
                }
                staged.status_parties.insert(replacement.party);
            }
            Op::InsertFolder(f) => {
                if self.folder_known(f.id, staged) {
                    return Err(VaultError::Inconsistent(format!(
                        "folder id {} reused",
                        f.id
                    )));
                }
                if !self.contribution_known(f.in_contribution, staged) {
                    return Err(VaultError::ContributionNotFound(f.in_contribution));
                }
                staged.folders.insert(f.id);
            }
            Op::InsertEdge(e) => {
                if !self.folder_known(e.parent, staged) {
                    return Err(VaultError::FolderNotFound(e.parent));
                }
                if !self.folder_known(e.child, staged) {
                    return Err(VaultError::FolderNotFound(e.child));
                }
                let live_parent = self.edges.iter().any(|x| {
                    x.child == e.child
                        && !staged.removed_folders.contains(&x.parent)
                        && !staged.removed_folders.contains(&x.child)
                });
                if live_parent || staged.edge_children.contains(&e.child) {
                    return Err(VaultError::CorruptHierarchy(format!(
                        "folder {} is already attached to a parent",
                        e.child
                    )));
                }
                staged.edge_children.insert(e.child);
            }
            Op::InsertItem(i) => {
                if !self.folder_known(i.folder, staged) {
                    return Err(VaultError::FolderNotFound(i.folder));
                }
                if !self.contribution_known(i.in_contribution, staged) {
                    return Err(VaultError::ContributionNotFound(i.in_contribution));
                }
            }
            Op::RemoveSubtree { folders, .. } => {
                for id in folders {
                    if !self.folders.contains_key(id) {
                        return Err(VaultError::FolderNotFound(*id));
                    }
                }
                staged.removed_folders.extend(folders.iter().copied());
            }
            Op::RegisterParty { .. } => {}
        }
        Ok(())
    }

    /// Apply one operation. Only called after the whole batch validated.
    fn apply(&mut self, op: Op) {
        match op {
            Op::InsertContribution(c) => {
                self.contributions.insert(c.id, c);
            }
            Op::CommitContribution {
                id,
                time_committed,
                committer,
                system_id,
                data_type,
                state,
                change_type,
                description,
            } => {
                if let Some(c) = self.contributions.get_mut(&id) {
                    c.time_committed = Some(time_committed);
                    c.committer = committer;
                    c.system_id = system_id;
                    c.data_type = data_type;
                    c.state = state;
                    c.change_type = change_type;
                    c.description = description;
                }
            }
            Op::InsertEhr(e) => {
                self.ehrs.insert(e.id, e);
            }
            Op::SetEhrDirectory { ehr, directory } => {
                if let Some(e) = self.ehrs.get_mut(&ehr) {
                    e.directory = directory;
                }
            }
            Op::InsertStatus(mut s) => {
                s.slot = self.bump_slot();
                self.statuses.insert(s.id, s);
            }
            Op::ReplaceStatus { id, mut replacement } => {
                if let Some(mut old) = self.statuses.remove(&id) {
                    old.period.end = Some(replacement.transaction_time);
                    self.status_history.entry(id).or_default().push(old);
                }
                replacement.slot = self.bump_slot();
                self.statuses.insert(id, replacement);
            }
            Op::InsertFolder(mut f) => {
                f.slot = self.bump_slot();
                self.folders.insert(f.id, f);
            }
            Op::InsertEdge(mut e) => {
                e.slot = self.bump_slot();
                self.edges.push(e);
            }
            Op::InsertItem(mut i) => {
                i.slot = self.bump_slot();
                self.items.push(i);
            }
            Op::RemoveSubtree { folders, at } => {
                let removed: BTreeSet<FolderId> = folders.iter().copied().collect();
                for id in &folders {
                    if let Some(mut row) = self.folders.remove(id) {
                        row.period.end = Some(at);
                        self.folder_history.entry(*id).or_default().push(row);
                    }
                }
                let mut kept = Vec::with_capacity(self.edges.len());
                for mut edge in std::mem::take(&mut self.edges) {
                    if removed.contains(&edge.parent) || removed.contains(&edge.child) {
                        edge.period.end = Some(at);
                        self.edge_history.push(edge);
                    } else {
                        kept.push(edge);
                    }
                }
                self.edges = kept;

                let mut kept = Vec::with_capacity(self.items.len());
                for mut item in std::mem::take(&mut self.items) {
                    if removed.contains(&item.folder) {
                        item.period.end = Some(at);
                        self.item_history.push(item);
                    } else {
                        kept.push(item);
                    }
                }
                self.items = kept;
            }
            Op::RegisterParty {
                namespace,
                external_id,
                party,
            } => {
                self.parties.insert((namespace, external_id), party);
            }
        }
    }

    /// Recompute the id counter after a journal replay.
    fn refresh_next_id(&mut self) {
        let max_used = self
            .ehrs
            .keys()
            .map(|id| id.0)
            .chain(self.statuses.keys().map(|id| id.0))
            .chain(self.status_history.keys().map(|id| id.0))
            .chain(self.contributions.keys().map(|id| id.0))
            .chain(self.folders.keys().map(|id| id.0))
            .chain(self.folder_history.keys().map(|id| id.0))
            .chain(self.parties.values().map(|id| id.0))
            .max()
            .unwrap_or(0);
        self.next_id = self.next_id.max(max_used + 1);
    }
}

/// Shared, lock-guarded table data.
pub(crate) struct Tables {
    inner: RwLock<TableData>,
}

impl Tables {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(TableData::default()),
        }
    }

    /// Allocate the next id from the shared id space.
    pub(crate) fn next_id(&self) -> u64 {
        let mut data = self.inner.write();
        let id = data.next_id;
        data.next_id += 1;
        id
    }

    /// One consistent read snapshot. Hold the guard for the whole read.
    pub(crate) fn snapshot(&self) -> RwLockReadGuard<'_, TableData> {
        self.inner.read()
    }

    /// Validate and apply a transaction. Nothing is applied on error.
    pub(crate) fn commit(&self, txn: Transaction) -> Result<()> {
        let mut data = self.inner.write();
        let mut staged = Staged::default();
        for op in &txn.ops {
            data.check(op, &mut staged)?;
        }
        for op in txn.ops {
            data.apply(op);
        }
        Ok(())
    }

    /// Re-apply a journaled batch during recovery. The batch was validated
    /// when it was first committed; replay must not re-judge it.
    pub(crate) fn apply_batch(&self, ops: Vec<Op>) {
        let mut data = self.inner.write();
        for op in ops {
            data.apply(op);
        }
        data.refresh_next_id();
    }

    /// Write a snapshot of all relations to `path`.
    pub(crate) fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = self.inner.read();
        let encoded = rmp_serde::to_vec(&*data)?;

        let mut file = File::create(path)?;
        file.write_all(TABLES_MAGIC)?;
        file.write_all(&[TABLES_VERSION])?;
        file.write_all(&(encoded.len() as u64).to_le_bytes())?;
        file.write_all(&encoded)?;
        file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Load a snapshot previously written by [`Tables::save`].
    pub(crate) fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != TABLES_MAGIC {
            return Err(VaultError::InvalidFormat("Invalid snapshot magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != TABLES_VERSION {
            return Err(VaultError::InvalidFormat(format!(
                "Unsupported snapshot version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;

        let mut encoded = vec![0u8; len];
        file.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(&encoded);
        if stored != computed {
            return Err(VaultError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        let data: TableData = rmp_serde::from_slice(&encoded)?;
        Ok(Self {
            inner: RwLock::new(data),
        })
    }
}

/// Journal the transaction, then apply it.
///
/// The pending marker lands on disk before any table mutation; a batch that
/// fails validation stays pending and is discarded on the next open.
pub(crate) fn commit_journaled(tables: &Tables, journal: &Journal, txn: Transaction) -> Result<()> {
    let payload = rmp_serde::to_vec(&txn.ops)?;
    let seq = journal.log(&payload)?;
    tables.commit(txn)?;
    journal.mark_committed(seq)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Period;

    fn draft_contribution(id: u64) -> ContributionRecord {
        ContributionRecord {
            id: ContributionId(id),
            ehr_id: None,
            data_type: ContributionDataType::Other,
            state: ContributionState::Incomplete,
            change_type: ChangeType::Unknown,
            committer: None,
            system_id: None,
            description: None,
            time_committed: None,
        }
    }

    fn ehr(id: u64) -> EhrRecord {
        EhrRecord {
            id: EhrId(id),
            system_id: SystemId(1),
            directory: None,
            access: None,
            created_at: Timestamp(0),
        }
    }

    fn status(id: u64, ehr_id: u64, party: u64, contribution: u64) -> StatusRecord {
        StatusRecord {
            id: StatusId(id),
            ehr_id: EhrId(ehr_id),
            party: PartyId(party),
            is_modifiable: true,
            is_queryable: true,
            other_details: None,
            in_contribution: ContributionId(contribution),
            transaction_time: Timestamp(10),
            period: Period::open_from(Timestamp(10)),
            slot: Slot(0),
        }
    }

    #[test]
    fn test_commit_is_atomic_on_constraint_violation() {
        let tables = Tables::new();

        let mut txn = Transaction::new();
        txn.push(Op::InsertContribution(draft_contribution(1)));
        txn.push(Op::InsertEhr(ehr(2)));
        txn.push(Op::InsertStatus(status(3, 2, 4, 1)));
        tables.commit(txn).unwrap();

        // Second EHR with the same party: the whole batch must be rejected.
        let mut txn = Transaction::new();
        txn.push(Op::InsertContribution(draft_contribution(5)));
        txn.push(Op::InsertEhr(ehr(6)));
        txn.push(Op::InsertStatus(status(7, 6, 4, 5)));
        let err = tables.commit(txn).unwrap_err();
        assert!(matches!(err, VaultError::InvalidArgument(_)));

        let data = tables.snapshot();
        assert_eq!(data.ehrs.len(), 1);
        assert_eq!(data.contributions.len(), 1);
        assert_eq!(data.statuses.len(), 1);
    }

    #[test]
    fn test_double_commit_of_contribution_fails() {
        let tables = Tables::new();

        let mut txn = Transaction::new();
        txn.push(Op::InsertContribution(draft_contribution(1)));
        tables.commit(txn).unwrap();

        let commit_op = || Op::CommitContribution {
            id: ContributionId(1),
            time_committed: Timestamp(50),
            committer: None,
            system_id: None,
            data_type: ContributionDataType::Ehr,
            state: ContributionState::Complete,
            change_type: ChangeType::Creation,
            description: None,
        };

        let mut txn = Transaction::new();
        txn.push(commit_op());
        tables.commit(txn).unwrap();

        let mut txn = Transaction::new();
        txn.push(commit_op());
        let err = tables.commit(txn).unwrap_err();
        assert!(matches!(err, VaultError::InvalidState(_)));
    }

    #[test]
    fn test_replace_status_archives_with_closed_period() {
        let tables = Tables::new();

        let mut txn = Transaction::new();
        txn.push(Op::InsertContribution(draft_contribution(1)));
        txn.push(Op::InsertEhr(ehr(2)));
        txn.push(Op::InsertStatus(status(3, 2, 4, 1)));
        tables.commit(txn).unwrap();

        let mut replacement = status(3, 2, 4, 1);
        replacement.is_queryable = false;
        replacement.transaction_time = Timestamp(20);
        replacement.period = Period::open_from(Timestamp(20));

        let mut txn = Transaction::new();
        txn.push(Op::ReplaceStatus {
            id: StatusId(3),
            replacement,
        });
        tables.commit(txn).unwrap();

        let data = tables.snapshot();
        let archived = &data.status_history[&StatusId(3)];
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].period.end, Some(Timestamp(20)));
        assert!(!data.statuses[&StatusId(3)].is_queryable);
    }

    #[test]
    fn test_remove_subtree_archives_edges_and_items() {
        let tables = Tables::new();

        let folder = |id: u64| FolderRecord {
            id: FolderId(id),
            name: format!("f{id}"),
            archetype_node_id: "at".into(),
            active: true,
            details: None,
            in_contribution: ContributionId(1),
            transaction_time: Timestamp(10),
            period: Period::open_from(Timestamp(10)),
            slot: Slot(0),
        };

        let mut txn = Transaction::new();
        txn.push(Op::InsertContribution(draft_contribution(1)));
        txn.push(Op::InsertFolder(folder(2)));
        txn.push(Op::InsertFolder(folder(3)));
        txn.push(Op::InsertEdge(EdgeRecord {
            parent: FolderId(2),
            child: FolderId(3),
            in_contribution: ContributionId(1),
            transaction_time: Timestamp(10),
            period: Period::open_from(Timestamp(10)),
            slot: Slot(0),
        }));
        tables.commit(txn).unwrap();

        let mut txn = Transaction::new();
        txn.push(Op::RemoveSubtree {
            folders: vec![FolderId(2), FolderId(3)],
            at: Timestamp(30),
        });
        tables.commit(txn).unwrap();

        let data = tables.snapshot();
        assert!(data.folders.is_empty());
        assert!(data.edges.is_empty());
        assert_eq!(data.edge_history.len(), 1);
        assert_eq!(data.edge_history[0].period.end, Some(Timestamp(30)));
        assert_eq!(data.folder_history[&FolderId(2)].len(), 1);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tables.bin");

        let tables = Tables::new();
        let mut txn = Transaction::new();
        txn.push(Op::InsertContribution(draft_contribution(1)));
        txn.push(Op::InsertEhr(ehr(2)));
        txn.push(Op::InsertStatus(status(3, 2, 4, 1)));
        txn.push(Op::RegisterParty {
            namespace: "ns".into(),
            external_id: "p-1".into(),
            party: PartyId(4),
        });
        tables.commit(txn).unwrap();
        tables.save(&path).unwrap();

        let reloaded = Tables::load(&path).unwrap();
        let data = reloaded.snapshot();
        assert_eq!(data.ehrs.len(), 1);
        assert_eq!(data.statuses[&StatusId(3)].party, PartyId(4));
        assert_eq!(data.parties[&("ns".to_string(), "p-1".to_string())], PartyId(4));
    }
}
