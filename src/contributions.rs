//! Contribution ledger: one audit unit per logical write.
//!
//! A contribution starts as a draft (`open`) and is finalized inside the
//! same transaction that writes the rows it covers, so committed audit
//! units become visible atomically with their data.

use crate::error::{Result, VaultError};
use crate::tables::{Op, Tables, Transaction};
use crate::types::{
    AuditDetails, ChangeType, ContributionDataType, ContributionId, ContributionRecord,
    ContributionState, EhrId, Timestamp,
};
use std::sync::Arc;

/// Records one audit row per logical change.
pub struct ContributionLedger {
    tables: Arc<Tables>,
}

impl ContributionLedger {
    pub(crate) fn new(tables: Arc<Tables>) -> Self {
        Self { tables }
    }

    /// Stage a draft contribution. The returned id is final; the row
    /// becomes visible when the transaction commits.
    pub(crate) fn stage_open(&self, txn: &mut Transaction, ehr_id: Option<EhrId>) -> ContributionId {
        let id = ContributionId(self.tables.next_id());
        txn.push(Op::InsertContribution(ContributionRecord {
            id,
            ehr_id,
            data_type: ContributionDataType::Other,
            state: ContributionState::Incomplete,
            change_type: ChangeType::Unknown,
            committer: None,
            system_id: None,
            description: None,
            time_committed: None,
        }));
        id
    }

    /// Stage finalization of a draft. Committing a contribution twice
    /// fails the transaction with `InvalidState`.
    pub(crate) fn stage_commit(
        &self,
        txn: &mut Transaction,
        id: ContributionId,
        time_committed: Timestamp,
        audit: &AuditDetails,
        data_type: ContributionDataType,
        state: ContributionState,
        change_type: ChangeType,
    ) {
        txn.push(Op::CommitContribution {
            id,
            time_committed,
            committer: audit.committer,
            system_id: audit.system_id,
            data_type,
            state,
            change_type,
            description: audit.description.clone(),
        });
    }

    /// Fetch a contribution row.
    pub fn get(&self, id: ContributionId) -> Result<ContributionRecord> {
        let data = self.tables.snapshot();
        data.contributions
            .get(&id)
            .cloned()
            .ok_or(VaultError::ContributionNotFound(id))
    }

    /// The EHR a contribution belongs to. Folder updates use this to
    /// recover the owning EHR from the superseded version's contribution.
    pub fn ehr_id(&self, id: ContributionId) -> Result<Option<EhrId>> {
        let data = self.tables.snapshot();
        data.contributions
            .get(&id)
            .map(|c| c.ehr_id)
            .ok_or(VaultError::ContributionNotFound(id))
    }
}
