//! Ingestion specs and the per-table spec registry
//!
//! A spec is the unit of ingestion: one table, one fully-materialized data
//! source locator, one time window. The coordinator owns the authoritative
//! spec set; workers only ever see the specs assigned to them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpecState {
    /// Not yet acknowledged by a worker
    New,
    /// Ingested and confirmed on the assigned node
    Ready,
    /// Source data changed; needs re-ingestion on the same node
    Renew,
    /// Assigned node disappeared
    Lost,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spec {
    /// Deterministic over (table, materialized locator, window start):
    /// identical inputs yield identical ids across runs
    id: String,
    /// `"{config_version}.{timestamp}"` of the refresh that produced it
    pub version: String,
    pub table: String,
    /// Fully materialized path or stream descriptor
    pub domain_locator: String,
    /// Inclusive window, unix seconds
    pub time_start: u64,
    pub time_end: u64,
    /// Source fingerprint (size/mtime when the source is statable);
    /// a change re-enters RENEW on refresh
    pub fingerprint: String,
    affinity: Option<String>,
    state: SpecState,
}

impl Spec {
    pub fn new(
        version: impl Into<String>,
        table: impl Into<String>,
        domain_locator: impl Into<String>,
        time_start: u64,
        time_end: u64,
        fingerprint: impl Into<String>,
    ) -> Self {
        let table = table.into();
        let domain_locator = domain_locator.into();
        let id = format!("{}@{}@{}", table, domain_locator, time_start);
        Self {
            id,
            version: version.into(),
            table,
            domain_locator,
            time_start,
            time_end,
            fingerprint: fingerprint.into(),
            affinity: None,
            state: SpecState::New,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SpecState {
        self.state
    }

    pub fn set_state(&mut self, state: SpecState) {
        self.state = state;
    }

    pub fn affinity(&self) -> Option<&str> {
        self.affinity.as_deref()
    }

    pub fn assigned(&self) -> bool {
        self.affinity.is_some()
    }

    pub fn assign(&mut self, node_addr: impl Into<String>) {
        self.affinity = Some(node_addr.into());
    }

    /// Back to the unassigned NEW state so the next cycle re-places it
    pub fn reset(&mut self) {
        self.affinity = None;
        self.state = SpecState::New;
    }

    /// NEW and RENEW specs must be communicated to their node
    pub fn needs_sync(&self) -> bool {
        matches!(self.state, SpecState::New | SpecState::Renew)
    }
}

/// Authoritative spec set of one table on the coordinator
#[derive(Debug, Default)]
pub struct TableRegistry {
    table: String,
    specs: BTreeMap<String, Spec>,
}

impl TableRegistry {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            specs: BTreeMap::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Merge a provider snapshot by spec id:
    /// - unseen ids enter as NEW,
    /// - persisting ids keep their assignment and state, unless the source
    ///   fingerprint changed, which re-enters RENEW,
    /// - ids absent from the snapshot are dropped (retention elapsed).
    pub fn update(&mut self, snapshot: Vec<Spec>) {
        let mut next = BTreeMap::new();
        for incoming in snapshot {
            let id = incoming.id().to_string();
            match self.specs.remove(&id) {
                Some(mut existing) => {
                    if existing.fingerprint != incoming.fingerprint {
                        existing.fingerprint = incoming.fingerprint;
                        existing.set_state(SpecState::Renew);
                    }
                    next.insert(id, existing);
                }
                None => {
                    next.insert(id, incoming);
                }
            }
        }
        self.specs = next;
    }

    /// Whether the registry still tracks this spec
    pub fn online(&self, spec_id: &str) -> bool {
        self.specs.contains_key(spec_id)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn get(&self, spec_id: &str) -> Option<&Spec> {
        self.specs.get(spec_id)
    }

    pub fn all(&self) -> impl Iterator<Item = &Spec> {
        self.specs.values()
    }

    pub fn all_mut(&mut self) -> impl Iterator<Item = &mut Spec> {
        self.specs.values_mut()
    }
}
