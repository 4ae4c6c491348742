//! Main Vault struct tying all components together.

use crate::contributions::ContributionLedger;
use crate::error::{Result, VaultError};
use crate::hierarchy::FolderHierarchyEngine;
use crate::journal::Journal;
use crate::status::StatusStore;
use crate::subjects::{LocalSubjectDirectory, SubjectRef, SubjectResolver};
use crate::tables::{commit_journaled, Op, Tables, Transaction};
use crate::types::{
    AccessId, AuditDetails, ChangeType, ContributionDataType, ContributionId, ContributionRecord,
    ContributionState, Document, EhrId, EhrRecord, FolderId, FolderNode, FolderSpec, Period, Slot,
    StatusId, StatusInput, StatusRecord, SystemId, Timestamp,
};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Magic bytes for the vault manifest.
const VAULT_MAGIC: &[u8; 4] = b"CVL\0";

/// Current vault format version.
const VAULT_VERSION: u8 = 1;

/// Vault configuration.
#[derive(Clone, Debug)]
pub struct VaultConfig {
    /// Base path for the vault.
    pub path: PathBuf,

    /// System id stamped on records created by this node.
    pub system_id: SystemId,

    /// Whether to create the vault if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./vault"),
            system_id: SystemId(1),
            create_if_missing: true,
        }
    }
}

/// Input for creating a new EHR.
#[derive(Clone, Debug)]
pub struct EhrCreateRequest {
    /// Caller-supplied EHR id; allocated by the vault when absent.
    pub ehr_id: Option<EhrId>,
    pub subject: SubjectRef,
    pub system_id: Option<SystemId>,
    pub directory: Option<FolderId>,
    pub access: Option<AccessId>,
    pub is_modifiable: bool,
    pub is_queryable: bool,
    pub other_details: Option<Document>,
    pub audit: AuditDetails,
}

impl EhrCreateRequest {
    pub fn new(subject: SubjectRef) -> Self {
        Self {
            ehr_id: None,
            subject,
            system_id: None,
            directory: None,
            access: None,
            is_modifiable: true,
            is_queryable: true,
            other_details: None,
            audit: AuditDetails::default(),
        }
    }

    pub fn with_ehr_id(mut self, id: EhrId) -> Self {
        self.ehr_id = Some(id);
        self
    }

    pub fn with_access(mut self, access: AccessId) -> Self {
        self.access = Some(access);
        self
    }

    pub fn with_other_details(mut self, details: Document) -> Self {
        self.other_details = Some(details);
        self
    }

    pub fn with_audit(mut self, audit: AuditDetails) -> Self {
        self.audit = audit;
        self
    }
}

/// Vault statistics.
#[derive(Clone, Debug, Default)]
pub struct VaultStats {
    pub ehr_count: u64,
    pub contribution_count: u64,
    pub folder_count: u64,
    pub folder_version_count: u64,
    pub status_version_count: u64,
    pub edge_count: u64,
    pub item_count: u64,
}

/// The clinical record vault.
///
/// Provides a unified interface for:
/// - Opening and committing contributions (the audit ledger)
/// - Creating EHRs and versioning their status rows
/// - Building, replacing, deleting, and time-traveling folder directories
pub struct Vault {
    /// Vault configuration.
    config: VaultConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Shared relations.
    tables: Arc<Tables>,

    /// Transaction journal.
    journal: Arc<Journal>,

    /// Audit ledger.
    ledger: ContributionLedger,

    /// Versioned status store.
    statuses: StatusStore,

    /// Folder hierarchy engine.
    hierarchy: FolderHierarchyEngine,

    /// Subject resolution (swappable collaborator).
    subjects: Arc<dyn SubjectResolver>,

    /// Serializes writers: overlapping subtree updates are not commutative.
    write_lock: Mutex<()>,
}

impl Vault {
    /// Open an existing vault or create a new one.
    pub fn open_or_create(config: VaultConfig) -> Result<Self> {
        if config.path.exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(VaultError::NotInitialized)
        }
    }

    /// Create a new vault.
    pub fn create(config: VaultConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let tables = Arc::new(Tables::new());
        let journal = Arc::new(Journal::open(config.path.join("journal.bin"))?);

        Ok(Self::assemble(config, lock_file, tables, journal))
    }

    /// Open an existing vault, re-applying committed journal batches that
    /// post-date the last snapshot and discarding torn ones.
    pub fn open(config: VaultConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let tables_path = config.path.join("tables.bin");
        let tables = if tables_path.exists() {
            Arc::new(Tables::load(&tables_path)?)
        } else {
            Arc::new(Tables::new())
        };
        let journal = Arc::new(Journal::open(config.path.join("journal.bin"))?);

        let pending = journal.pending_count()?;
        if pending > 0 {
            warn!(pending, "discarding uncommitted transaction batches");
        }
        let batches = journal.committed_batches()?;
        let replayed = batches.len();
        for payload in batches {
            let ops: Vec<Op> = rmp_serde::from_slice(&payload)?;
            tables.apply_batch(ops);
        }
        if replayed > 0 {
            debug!(replayed, "re-applied journaled transaction batches");
        }

        let vault = Self::assemble(config, lock_file, tables, journal);
        if replayed > 0 || pending > 0 {
            vault.sync()?;
        }
        Ok(vault)
    }

    fn assemble(config: VaultConfig, lock_file: File, tables: Arc<Tables>, journal: Arc<Journal>) -> Self {
        let ledger = ContributionLedger::new(Arc::clone(&tables));
        let statuses = StatusStore::new(Arc::clone(&tables));
        let hierarchy = FolderHierarchyEngine::new(Arc::clone(&tables));
        let subjects = Arc::new(LocalSubjectDirectory::new(
            Arc::clone(&tables),
            Arc::clone(&journal),
        ));

        Self {
            config,
            _lock_file: lock_file,
            tables,
            journal,
            ledger,
            statuses,
            hierarchy,
            subjects,
            write_lock: Mutex::new(()),
        }
    }

    /// Replace the subject resolver with an external one.
    pub fn set_subject_resolver(&mut self, resolver: Arc<dyn SubjectResolver>) {
        self.subjects = resolver;
    }

    fn commit(&self, txn: Transaction) -> Result<()> {
        commit_journaled(&self.tables, &self.journal, txn)
    }

    // --- Contribution Operations ---

    /// Open a draft contribution, optionally bound to an EHR.
    pub fn open_contribution(&self, ehr_id: Option<EhrId>) -> Result<ContributionId> {
        let _guard = self.write_lock.lock();

        if let Some(ehr) = ehr_id {
            let data = self.tables.snapshot();
            if !data.ehrs.contains_key(&ehr) {
                return Err(VaultError::EhrNotFound(ehr));
            }
        }

        let mut txn = Transaction::new();
        let id = self.ledger.stage_open(&mut txn, ehr_id);
        self.commit(txn)?;
        Ok(id)
    }

    /// Finalize a draft contribution. Fails with `InvalidState` when the
    /// contribution was already committed.
    pub fn commit_contribution(
        &self,
        id: ContributionId,
        at: Timestamp,
        audit: &AuditDetails,
        data_type: ContributionDataType,
        state: ContributionState,
        change_type: ChangeType,
    ) -> Result<()> {
        let _guard = self.write_lock.lock();

        let mut txn = Transaction::new();
        self.ledger
            .stage_commit(&mut txn, id, at, audit, data_type, state, change_type);
        self.commit(txn)
    }

    /// Fetch a contribution row.
    pub fn contribution(&self, id: ContributionId) -> Result<ContributionRecord> {
        self.ledger.get(id)
    }

    // --- EHR Operations ---

    /// Create an EHR for a subject, with its initial status, under one
    /// creation contribution.
    pub fn create_ehr(&self, request: EhrCreateRequest) -> Result<EhrId> {
        self.create_ehr_at(request, Timestamp::now())
    }

    pub fn create_ehr_at(&self, request: EhrCreateRequest, at: Timestamp) -> Result<EhrId> {
        let _guard = self.write_lock.lock();

        let party = self.subjects.resolve_or_create(&request.subject)?;

        // Optimistic pre-check; the unique constraint on the status party
        // is the rejection concurrent writers cannot race past.
        if self.statuses.by_party(party).is_some() {
            warn!(%party, "subject is already associated to an EHR");
            return Err(VaultError::InvalidArgument(format!(
                "party {party} already associated to an EHR"
            )));
        }

        let ehr_id = request
            .ehr_id
            .unwrap_or_else(|| EhrId(self.tables.next_id()));
        let status_id = StatusId(self.tables.next_id());

        let mut txn = Transaction::new();
        let contribution = self.ledger.stage_open(&mut txn, Some(ehr_id));
        txn.push(Op::InsertEhr(EhrRecord {
            id: ehr_id,
            system_id: request.system_id.unwrap_or(self.config.system_id),
            directory: request.directory,
            access: request.access,
            created_at: at,
        }));
        self.statuses.stage_create(
            &mut txn,
            StatusRecord {
                id: status_id,
                ehr_id,
                party,
                is_modifiable: request.is_modifiable,
                is_queryable: request.is_queryable,
                other_details: request.other_details.clone(),
                in_contribution: contribution,
                transaction_time: at,
                period: Period::open_from(at),
                slot: Slot::default(),
            },
        );
        self.ledger.stage_commit(
            &mut txn,
            contribution,
            at,
            &request.audit,
            ContributionDataType::Ehr,
            ContributionState::Complete,
            ChangeType::Creation,
        );
        self.commit(txn)?;

        debug!(%ehr_id, %party, "created EHR");
        Ok(ehr_id)
    }

    /// Fetch an EHR row, verifying its owning contribution exists.
    pub fn ehr(&self, id: EhrId) -> Result<EhrRecord> {
        let data = self.tables.snapshot();
        let record = data
            .ehrs
            .get(&id)
            .cloned()
            .ok_or(VaultError::EhrNotFound(id))?;
        let owned = data
            .contributions
            .values()
            .any(|c| c.ehr_id == Some(id) && c.data_type == ContributionDataType::Ehr);
        if !owned {
            return Err(VaultError::Inconsistent(format!(
                "no contribution found for EHR {id}"
            )));
        }
        Ok(record)
    }

    /// Find the EHR bound to an external subject reference, if any.
    pub fn ehr_by_subject(&self, subject: &SubjectRef) -> Result<Option<EhrId>> {
        let party = match self.subjects.lookup(subject)? {
            Some(party) => party,
            None => return Ok(None),
        };
        Ok(self.statuses.by_party(party).map(|s| s.ehr_id))
    }

    /// Find the EHR owning a status row.
    pub fn ehr_by_status(&self, status_id: StatusId) -> Result<EhrId> {
        Ok(self.statuses.current(status_id)?.ehr_id)
    }

    // --- Status Operations ---

    /// The current status of an EHR.
    pub fn status(&self, ehr_id: EhrId) -> Result<StatusRecord> {
        self.statuses.by_ehr(ehr_id)
    }

    /// Update an EHR's status under a modification contribution.
    ///
    /// Returns whether a new version was written; without `force`, an
    /// update that changes nothing is a no-op and records no contribution.
    pub fn update_status(
        &self,
        ehr_id: EhrId,
        input: &StatusInput,
        force: bool,
        audit: &AuditDetails,
    ) -> Result<bool> {
        self.update_status_at(ehr_id, input, force, Timestamp::now(), audit)
    }

    pub fn update_status_at(
        &self,
        ehr_id: EhrId,
        input: &StatusInput,
        force: bool,
        at: Timestamp,
        audit: &AuditDetails,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock();

        let current = self.statuses.by_ehr(ehr_id)?;

        let mut txn = Transaction::new();
        let contribution = self.ledger.stage_open(&mut txn, Some(ehr_id));
        let changed = self
            .statuses
            .stage_update(&mut txn, current.id, input, contribution, at, force)?;
        if !changed {
            return Ok(false);
        }
        self.ledger.stage_commit(
            &mut txn,
            contribution,
            at,
            audit,
            ContributionDataType::Ehr,
            ContributionState::Complete,
            ChangeType::Modification,
        );
        self.commit(txn)?;

        debug!(%ehr_id, "updated EHR status");
        Ok(true)
    }

    /// Status version number effective at `at`.
    pub fn status_version_at(&self, ehr_id: EhrId, at: Timestamp) -> Result<u32> {
        let status = self.statuses.by_ehr(ehr_id)?;
        self.statuses.version_at(status.id, at)
    }

    /// A specific status version by ordinal, 1-based.
    pub fn status_at_version(&self, ehr_id: EhrId, version: u32) -> Result<StatusRecord> {
        let status = self.statuses.by_ehr(ehr_id)?;
        self.statuses.at_version(status.id, version)
    }

    /// Whether the EHR's status has archived versions.
    pub fn status_has_previous_version(&self, ehr_id: EhrId) -> Result<bool> {
        let status = self.statuses.by_ehr(ehr_id)?;
        Ok(self.statuses.has_previous_version(status.id))
    }

    // --- Directory Operations ---

    /// Build an EHR's directory tree and bind it to the EHR.
    pub fn create_directory(&self, ehr_id: EhrId, spec: &FolderSpec, audit: &AuditDetails) -> Result<FolderId> {
        self.create_directory_at(ehr_id, spec, Timestamp::now(), audit)
    }

    pub fn create_directory_at(
        &self,
        ehr_id: EhrId,
        spec: &FolderSpec,
        at: Timestamp,
        audit: &AuditDetails,
    ) -> Result<FolderId> {
        let _guard = self.write_lock.lock();

        let record = self.ehr(ehr_id)?;
        if record.directory.is_some() {
            return Err(VaultError::InvalidState(format!(
                "EHR {ehr_id} already has a directory"
            )));
        }

        let mut txn = Transaction::new();
        let contribution = self.ledger.stage_open(&mut txn, Some(ehr_id));
        let root = self.hierarchy.stage_build(&mut txn, spec, contribution, at)?;
        txn.push(Op::SetEhrDirectory {
            ehr: ehr_id,
            directory: Some(root),
        });
        self.ledger.stage_commit(
            &mut txn,
            contribution,
            at,
            audit,
            ContributionDataType::Folder,
            ContributionState::Complete,
            ChangeType::Creation,
        );
        self.commit(txn)?;

        debug!(%ehr_id, %root, "created directory");
        Ok(root)
    }

    /// The EHR's current directory tree.
    pub fn directory(&self, ehr_id: EhrId) -> Result<FolderNode> {
        let root = self.directory_root(ehr_id)?;
        self.hierarchy.tree(root)
    }

    /// The EHR's directory tree as it was at `at`.
    pub fn directory_at(&self, ehr_id: EhrId, at: Timestamp) -> Result<FolderNode> {
        let root = self.directory_root(ehr_id)?;
        self.hierarchy.tree_at(root, at)
    }

    fn directory_root(&self, ehr_id: EhrId) -> Result<FolderId> {
        self.ehr(ehr_id)?.directory.ok_or_else(|| {
            VaultError::InvalidArgument(format!("EHR {ehr_id} has no directory"))
        })
    }

    /// Delete an EHR's directory tree and clear the binding. Returns the
    /// number of folders removed.
    pub fn delete_directory(&self, ehr_id: EhrId, audit: &AuditDetails) -> Result<usize> {
        self.delete_directory_at(ehr_id, Timestamp::now(), audit)
    }

    pub fn delete_directory_at(&self, ehr_id: EhrId, at: Timestamp, audit: &AuditDetails) -> Result<usize> {
        let _guard = self.write_lock.lock();

        let root = self.directory_root(ehr_id)?;

        let mut txn = Transaction::new();
        let contribution = self.ledger.stage_open(&mut txn, Some(ehr_id));
        let count = self.hierarchy.stage_delete(&mut txn, root, at)?;
        txn.push(Op::SetEhrDirectory {
            ehr: ehr_id,
            directory: None,
        });
        self.ledger.stage_commit(
            &mut txn,
            contribution,
            at,
            audit,
            ContributionDataType::Folder,
            ContributionState::Complete,
            ChangeType::Deletion,
        );
        self.commit(txn)?;

        debug!(%ehr_id, %root, count, "deleted directory");
        Ok(count)
    }

    // --- Folder Operations ---

    /// Materialize a folder tree under an already-opened contribution.
    /// The contribution is left for the caller to finalize.
    pub fn build_folder_tree(
        &self,
        spec: &FolderSpec,
        contribution: ContributionId,
        at: Timestamp,
    ) -> Result<FolderId> {
        let _guard = self.write_lock.lock();

        let mut txn = Transaction::new();
        let root = self.hierarchy.stage_build(&mut txn, spec, contribution, at)?;
        self.commit(txn)?;
        Ok(root)
    }

    /// Reconstruct the current tree rooted at `folder_id`.
    pub fn folder_tree(&self, folder_id: FolderId) -> Result<FolderNode> {
        self.hierarchy.tree(folder_id)
    }

    /// Reconstruct the tree rooted at `folder_id` as it was at `at`.
    pub fn folder_tree_at(&self, folder_id: FolderId, at: Timestamp) -> Result<FolderNode> {
        self.hierarchy.tree_at(folder_id, at)
    }

    /// Replace the subtree rooted at `folder_id` with `spec` under a
    /// modification contribution. The owning EHR is recovered through the
    /// superseded version's contribution.
    pub fn update_folder_tree(
        &self,
        folder_id: FolderId,
        spec: &FolderSpec,
        audit: &AuditDetails,
    ) -> Result<bool> {
        self.update_folder_tree_at(folder_id, spec, Timestamp::now(), audit)
    }

    pub fn update_folder_tree_at(
        &self,
        folder_id: FolderId,
        spec: &FolderSpec,
        at: Timestamp,
        audit: &AuditDetails,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock();

        let owning_contribution = {
            let data = self.tables.snapshot();
            data.folders
                .get(&folder_id)
                .map(|f| f.in_contribution)
                .ok_or(VaultError::FolderNotFound(folder_id))?
        };
        let ehr_id = self.ledger.ehr_id(owning_contribution)?;

        let mut txn = Transaction::new();
        let contribution = self.ledger.stage_open(&mut txn, ehr_id);
        let changed = self
            .hierarchy
            .stage_update(&mut txn, folder_id, spec, contribution, at)?;
        self.ledger.stage_commit(
            &mut txn,
            contribution,
            at,
            audit,
            ContributionDataType::Folder,
            ContributionState::Complete,
            ChangeType::Modification,
        );
        self.commit(txn)?;

        debug!(%folder_id, "replaced folder tree");
        Ok(changed)
    }

    /// Delete the subtree rooted at `folder_id` under a deletion
    /// contribution. Any EHR directory binding to it is cleared. Returns
    /// the number of folders removed.
    pub fn delete_folder_tree(&self, folder_id: FolderId, audit: &AuditDetails) -> Result<usize> {
        self.delete_folder_tree_at(folder_id, Timestamp::now(), audit)
    }

    pub fn delete_folder_tree_at(
        &self,
        folder_id: FolderId,
        at: Timestamp,
        audit: &AuditDetails,
    ) -> Result<usize> {
        let _guard = self.write_lock.lock();

        if folder_id.is_nil() {
            return Err(VaultError::InvalidArgument(
                "folder id must not be nil".into(),
            ));
        }

        let (owning_contribution, bound_ehrs) = {
            let data = self.tables.snapshot();
            let record = data
                .folders
                .get(&folder_id)
                .ok_or(VaultError::FolderNotFound(folder_id))?;
            let bound: Vec<EhrId> = data
                .ehrs
                .values()
                .filter(|e| e.directory == Some(folder_id))
                .map(|e| e.id)
                .collect();
            (record.in_contribution, bound)
        };
        let ehr_id = self.ledger.ehr_id(owning_contribution)?;

        let mut txn = Transaction::new();
        let contribution = self.ledger.stage_open(&mut txn, ehr_id);
        let count = self.hierarchy.stage_delete(&mut txn, folder_id, at)?;
        for ehr in bound_ehrs {
            txn.push(Op::SetEhrDirectory {
                ehr,
                directory: None,
            });
        }
        self.ledger.stage_commit(
            &mut txn,
            contribution,
            at,
            audit,
            ContributionDataType::Folder,
            ContributionState::Complete,
            ChangeType::Deletion,
        );
        self.commit(txn)?;

        debug!(%folder_id, count, "deleted folder tree");
        Ok(count)
    }

    /// Folder version number effective at `at`.
    pub fn folder_version_at(&self, folder_id: FolderId, at: Timestamp) -> Result<u32> {
        self.hierarchy.version_at(folder_id, at)
    }

    /// Latest folder version number.
    pub fn folder_latest_version(&self, folder_id: FolderId) -> Result<u32> {
        self.hierarchy.latest_version(folder_id)
    }

    /// Whether the folder has archived versions.
    pub fn folder_has_previous_version(&self, folder_id: FolderId) -> bool {
        self.hierarchy.has_previous_version(folder_id)
    }

    /// Contribution of the folder version effective at `at`.
    pub fn folder_contribution_at(&self, folder_id: FolderId, at: Timestamp) -> Result<ContributionId> {
        self.hierarchy.contribution_at(folder_id, at)
    }

    // --- Component Access ---

    /// The audit ledger.
    pub fn ledger(&self) -> &ContributionLedger {
        &self.ledger
    }

    /// The versioned status store.
    pub fn status_store(&self) -> &StatusStore {
        &self.statuses
    }

    /// The folder hierarchy engine.
    pub fn hierarchy(&self) -> &FolderHierarchyEngine {
        &self.hierarchy
    }

    // --- Vault Operations ---

    /// Get vault statistics.
    pub fn stats(&self) -> VaultStats {
        let data = self.tables.snapshot();
        VaultStats {
            ehr_count: data.ehrs.len() as u64,
            contribution_count: data.contributions.len() as u64,
            folder_count: data.folders.len() as u64,
            folder_version_count: (data.folders.len()
                + data.folder_history.values().map(Vec::len).sum::<usize>())
                as u64,
            status_version_count: (data.statuses.len()
                + data.status_history.values().map(Vec::len).sum::<usize>())
                as u64,
            edge_count: data.edges.len() as u64,
            item_count: data.items.len() as u64,
        }
    }

    /// Snapshot all relations to disk and truncate the journal.
    pub fn sync(&self) -> Result<()> {
        self.tables.save(self.config.path.join("tables.bin"))?;
        self.journal.clear()?;
        Ok(())
    }

    /// Get the vault path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // --- Private Helpers ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(VAULT_MAGIC)?;
        file.write_all(&[VAULT_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != VAULT_MAGIC {
            return Err(VaultError::InvalidFormat("Invalid vault magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != VAULT_VERSION {
            return Err(VaultError::InvalidFormat(format!(
                "Unsupported vault version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| VaultError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for Vault {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}
