//! Core types for the clinical record vault.

use crate::error::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for an EHR.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EhrId(pub u64);

impl fmt::Debug for EhrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EhrId({})", self.0)
    }
}

impl fmt::Display for EhrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an EHR status lineage.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StatusId(pub u64);

impl fmt::Debug for StatusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusId({})", self.0)
    }
}

impl fmt::Display for StatusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a folder node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FolderId(pub u64);

impl FolderId {
    /// The nil folder id. Never allocated; rejected by mutating operations.
    pub const NIL: FolderId = FolderId(0);

    pub fn is_nil(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FolderId({})", self.0)
    }
}

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a contribution (one audit unit per logical write).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContributionId(pub u64);

impl fmt::Debug for ContributionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContributionId({})", self.0)
    }
}

impl fmt::Display for ContributionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a resolved subject party.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartyId(pub u64);

impl fmt::Debug for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartyId({})", self.0)
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an external object referenced from a folder (e.g. a composition).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

/// Identifier of the system (node) a record originates from.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SystemId(pub u64);

impl fmt::Debug for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SystemId({})", self.0)
    }
}

/// Identifier of an access-control record attached to an EHR.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccessId(pub u64);

impl fmt::Debug for AccessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessId({})", self.0)
    }
}

/// Physical insert order, stamped when a transaction is applied.
///
/// Rows with identical transaction times are disambiguated by the greater
/// slot during point-in-time reconstruction.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Slot(pub u64);

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({})", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open validity range: in effect from `start` until superseded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub start: Timestamp,
    /// Closed when the row is archived; `None` while the row is current.
    pub end: Option<Timestamp>,
}

impl Period {
    /// A period starting at `start` and open on the right.
    pub fn open_from(start: Timestamp) -> Self {
        Period { start, end: None }
    }

    /// Whether `at` falls inside the range.
    pub fn contains(&self, at: Timestamp) -> bool {
        at >= self.start && self.end.map_or(true, |end| at < end)
    }
}

/// Opaque clinical document payload (marshalled through [`crate::codec`]).
pub type Document = serde_json::Value;

/// What kind of data a contribution changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContributionDataType {
    Ehr,
    Folder,
    Composition,
    Audit,
    Other,
}

/// Workflow state of a contribution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContributionState {
    Incomplete,
    Complete,
    Deleted,
}

/// What kind of change a contribution records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Creation,
    Modification,
    Deletion,
    Synthesis,
    Unknown,
}

/// An EHR row. Identity is immutable once created; only the directory
/// pointer changes after creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EhrRecord {
    pub id: EhrId,
    pub system_id: SystemId,
    /// Root folder of the EHR's directory, when one has been created.
    pub directory: Option<FolderId>,
    pub access: Option<AccessId>,
    pub created_at: Timestamp,
}

/// The status row of an EHR. Exactly one current row per EHR; prior
/// versions live in the status history relation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub id: StatusId,
    pub ehr_id: EhrId,
    pub party: PartyId,
    pub is_modifiable: bool,
    pub is_queryable: bool,
    pub other_details: Option<Document>,
    pub in_contribution: ContributionId,
    pub transaction_time: Timestamp,
    pub period: Period,
    pub slot: Slot,
}

/// Replacement state for a status update.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusInput {
    pub is_modifiable: bool,
    pub is_queryable: bool,
    pub other_details: Option<Document>,
    /// Re-binds the status to a different party when set.
    pub party: Option<PartyId>,
}

impl Default for StatusInput {
    fn default() -> Self {
        Self {
            is_modifiable: true,
            is_queryable: true,
            other_details: None,
            party: None,
        }
    }
}

/// One audit unit per logical write. Immutable once committed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContributionRecord {
    pub id: ContributionId,
    pub ehr_id: Option<EhrId>,
    pub data_type: ContributionDataType,
    pub state: ContributionState,
    pub change_type: ChangeType,
    pub committer: Option<PartyId>,
    pub system_id: Option<SystemId>,
    pub description: Option<String>,
    /// `None` while the contribution is still a draft.
    pub time_committed: Option<Timestamp>,
}

impl ContributionRecord {
    pub fn is_draft(&self) -> bool {
        self.time_committed.is_none()
    }
}

/// A folder version row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FolderRecord {
    pub id: FolderId,
    pub name: String,
    pub archetype_node_id: String,
    pub active: bool,
    pub details: Option<Document>,
    pub in_contribution: ContributionId,
    pub transaction_time: Timestamp,
    pub period: Period,
    pub slot: Slot,
}

/// A directed parent-child edge between folder versions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub parent: FolderId,
    pub child: FolderId,
    pub in_contribution: ContributionId,
    pub transaction_time: Timestamp,
    pub period: Period,
    pub slot: Slot,
}

/// A leaf reference held by a folder, scoped to the contribution that
/// attached it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub folder: FolderId,
    pub object: ObjectRef,
    pub in_contribution: ContributionId,
    pub transaction_time: Timestamp,
    pub period: Period,
    pub slot: Slot,
}

/// Reference to an external object kept as a folder item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub object_id: ObjectId,
    pub namespace: String,
    pub ref_type: String,
}

impl ObjectRef {
    pub fn new(object_id: ObjectId, namespace: impl Into<String>, ref_type: impl Into<String>) -> Self {
        Self {
            object_id,
            namespace: namespace.into(),
            ref_type: ref_type.into(),
        }
    }
}

/// Caller-supplied description of a folder tree to materialize.
///
/// Carries no ids; the store allocates node identities on build.
#[derive(Clone, Debug, PartialEq)]
pub struct FolderSpec {
    pub name: String,
    pub archetype_node_id: String,
    pub active: bool,
    pub details: Option<Document>,
    pub items: Vec<ObjectRef>,
    pub children: Vec<FolderSpec>,
}

impl FolderSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            archetype_node_id: "openEHR-EHR-FOLDER.generic.v1".to_string(),
            active: true,
            details: None,
            items: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_archetype(mut self, archetype_node_id: impl Into<String>) -> Self {
        self.archetype_node_id = archetype_node_id.into();
        self
    }

    pub fn with_details(mut self, details: Document) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_item(mut self, item: ObjectRef) -> Self {
        self.items.push(item);
        self
    }

    pub fn with_child(mut self, child: FolderSpec) -> Self {
        self.children.push(child);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// A reconstructed folder tree node.
#[derive(Clone, Debug, PartialEq)]
pub struct FolderNode {
    pub id: FolderId,
    pub name: String,
    pub archetype_node_id: String,
    pub active: bool,
    pub details: Option<Document>,
    pub in_contribution: ContributionId,
    pub transaction_time: Timestamp,
    pub items: Vec<ObjectRef>,
    pub children: Vec<FolderNode>,
}

impl FolderNode {
    /// Total number of nodes in this subtree, the node itself included.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(FolderNode::node_count).sum::<usize>()
    }
}

/// Who committed a change, from where, and why.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuditDetails {
    pub committer: Option<PartyId>,
    pub system_id: Option<SystemId>,
    pub description: Option<String>,
}

impl AuditDetails {
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..Default::default()
        }
    }
}

/// Shared access surface kept for callers of the older entry points.
///
/// The zero-argument mutators are intentionally disabled: every write must
/// carry an explicit transaction time and run through the audited paths.
pub trait RecordAccess {
    fn commit(&self) -> Result<()> {
        Err(VaultError::Unsupported(
            "commit without a transaction time is disabled",
        ))
    }

    fn update(&self) -> Result<bool> {
        Err(VaultError::Unsupported(
            "update without a transaction time is disabled",
        ))
    }

    fn delete(&self) -> Result<usize> {
        Err(VaultError::Unsupported(
            "delete without a transaction time is disabled",
        ))
    }
}
