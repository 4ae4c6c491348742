//! Versioned store for the EHR status row.
//!
//! Exactly one current status row exists per EHR; an update archives the
//! current row into history and installs the replacement under the same
//! status id with a fresh transaction time.

use crate::error::{Result, VaultError};
use crate::tables::{Op, Tables, Transaction};
use crate::types::{
    ContributionId, EhrId, PartyId, Period, RecordAccess, Slot, StatusId, StatusInput,
    StatusRecord, Timestamp,
};
use crate::versioning;
use std::sync::Arc;

/// Append-only versioning of the single status row per EHR.
pub struct StatusStore {
    tables: Arc<Tables>,
}

impl StatusStore {
    pub(crate) fn new(tables: Arc<Tables>) -> Self {
        Self { tables }
    }

    /// Stage the initial status row. The unique constraint on the party
    /// rejects a second EHR for the same subject at commit time.
    pub(crate) fn stage_create(&self, txn: &mut Transaction, record: StatusRecord) {
        txn.push(Op::InsertStatus(record));
    }

    /// Stage an archive-and-replace update.
    ///
    /// Returns whether anything was staged: without `force`, an update that
    /// changes no field is a no-op.
    pub(crate) fn stage_update(
        &self,
        txn: &mut Transaction,
        id: StatusId,
        input: &StatusInput,
        in_contribution: ContributionId,
        transaction_time: Timestamp,
        force: bool,
    ) -> Result<bool> {
        let current = self.current(id)?;

        let replacement = StatusRecord {
            id,
            ehr_id: current.ehr_id,
            party: input.party.unwrap_or(current.party),
            is_modifiable: input.is_modifiable,
            is_queryable: input.is_queryable,
            other_details: input.other_details.clone(),
            in_contribution,
            transaction_time,
            period: Period::open_from(transaction_time),
            slot: Slot::default(),
        };

        let unchanged = replacement.party == current.party
            && replacement.is_modifiable == current.is_modifiable
            && replacement.is_queryable == current.is_queryable
            && replacement.other_details == current.other_details;
        if unchanged && !force {
            return Ok(false);
        }

        txn.push(Op::ReplaceStatus { id, replacement });
        Ok(true)
    }

    /// The current status row.
    pub fn current(&self, id: StatusId) -> Result<StatusRecord> {
        let data = self.tables.snapshot();
        data.statuses
            .get(&id)
            .cloned()
            .ok_or(VaultError::StatusNotFound(id))
    }

    /// The current status row of an EHR.
    pub fn by_ehr(&self, ehr_id: EhrId) -> Result<StatusRecord> {
        let data = self.tables.snapshot();
        if !data.ehrs.contains_key(&ehr_id) {
            return Err(VaultError::EhrNotFound(ehr_id));
        }
        data.statuses
            .values()
            .find(|s| s.ehr_id == ehr_id)
            .cloned()
            .ok_or_else(|| VaultError::Inconsistent(format!("EHR {ehr_id} has no status row")))
    }

    /// The current status row bound to a party, if any.
    pub fn by_party(&self, party: PartyId) -> Option<StatusRecord> {
        let data = self.tables.snapshot();
        data.statuses.values().find(|s| s.party == party).cloned()
    }

    /// A specific version by ordinal, 1-based.
    pub fn at_version(&self, id: StatusId, version: u32) -> Result<StatusRecord> {
        let data = self.tables.snapshot();
        let history = data.status_history.get(&id).map(Vec::as_slice).unwrap_or(&[]);
        let current = data.statuses.get(&id);
        if current.is_none() && history.is_empty() {
            return Err(VaultError::StatusNotFound(id));
        }

        let latest = versioning::latest_version(current.is_some(), history.len());
        match version {
            0 => Err(VaultError::InvalidArgument(
                "version numbers start at 1".into(),
            )),
            v if v < latest || (v == latest && current.is_none()) => {
                Ok(history[(v - 1) as usize].clone())
            }
            v if v == latest => current.cloned().ok_or(VaultError::StatusNotFound(id)),
            v => Err(VaultError::InvalidArgument(format!(
                "status {id} has no version {v} (latest is {latest})"
            ))),
        }
    }

    /// Version number effective at `at`.
    pub fn version_at(&self, id: StatusId, at: Timestamp) -> Result<u32> {
        let data = self.tables.snapshot();
        let history: Vec<Timestamp> = data
            .status_history
            .get(&id)
            .map(|rows| rows.iter().map(|r| r.transaction_time).collect())
            .unwrap_or_default();
        let current = data.statuses.get(&id).map(|r| r.transaction_time);
        if current.is_none() && history.is_empty() {
            return Err(VaultError::StatusNotFound(id));
        }
        versioning::version_from_timestamp(current, &history, at)
    }

    /// Latest version number.
    pub fn latest_version(&self, id: StatusId) -> Result<u32> {
        let data = self.tables.snapshot();
        let history_len = data.status_history.get(&id).map_or(0, Vec::len);
        let current = data.statuses.contains_key(&id);
        if !current && history_len == 0 {
            return Err(VaultError::StatusNotFound(id));
        }
        Ok(versioning::latest_version(current, history_len))
    }

    /// Whether any archived version exists.
    pub fn has_previous_version(&self, id: StatusId) -> bool {
        let data = self.tables.snapshot();
        data.status_history.get(&id).is_some_and(|rows| !rows.is_empty())
    }
}

impl RecordAccess for StatusStore {}
