//! Subject (party) resolution.
//!
//! An EHR's status binds to a party id resolved from an external subject
//! reference. Resolution is a collaborator interface: deployments with a
//! demographics service implement [`SubjectResolver`] themselves; the
//! built-in directory keeps the registry in the vault's own tables.

use crate::error::Result;
use crate::journal::Journal;
use crate::tables::{commit_journaled, Op, Tables, Transaction};
use crate::types::PartyId;
use std::sync::Arc;

/// External reference identifying a subject, e.g. a patient id issued by
/// a national namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubjectRef {
    pub namespace: String,
    pub id_value: String,
}

impl SubjectRef {
    pub fn new(namespace: impl Into<String>, id_value: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id_value: id_value.into(),
        }
    }
}

/// Resolves external subject references to stable party ids.
pub trait SubjectResolver: Send + Sync {
    /// Return the party for `subject`, creating one if none exists.
    fn resolve_or_create(&self, subject: &SubjectRef) -> Result<PartyId>;

    /// Return the party for `subject` if it is already known.
    fn lookup(&self, subject: &SubjectRef) -> Result<Option<PartyId>>;
}

/// Table-backed resolver used when no external demographics service is
/// wired in.
pub(crate) struct LocalSubjectDirectory {
    tables: Arc<Tables>,
    journal: Arc<Journal>,
}

impl LocalSubjectDirectory {
    pub(crate) fn new(tables: Arc<Tables>, journal: Arc<Journal>) -> Self {
        Self { tables, journal }
    }
}

impl SubjectResolver for LocalSubjectDirectory {
    fn resolve_or_create(&self, subject: &SubjectRef) -> Result<PartyId> {
        if let Some(party) = self.lookup(subject)? {
            return Ok(party);
        }

        let party = PartyId(self.tables.next_id());
        let mut txn = Transaction::new();
        txn.push(Op::RegisterParty {
            namespace: subject.namespace.clone(),
            external_id: subject.id_value.clone(),
            party,
        });
        commit_journaled(&self.tables, &self.journal, txn)?;
        Ok(party)
    }

    fn lookup(&self, subject: &SubjectRef) -> Result<Option<PartyId>> {
        let data = self.tables.snapshot();
        Ok(data
            .parties
            .get(&(subject.namespace.clone(), subject.id_value.clone()))
            .copied())
    }
}
