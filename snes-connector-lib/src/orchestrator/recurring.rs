use std::{
    collections::{BTreeMap, HashMap},
    time::Instant,
};

use crate::{
    error::AddressConversionError,
    memory_block::MemoryBlock,
    request::{Callback, Fingerprint, MemoryRequest, RecurringMemoryRequest, RequestFilter},
};

use super::SubscriptionId;

struct Group {
    members: Vec<(SubscriptionId, RecurringMemoryRequest)>,
    representative: MemoryRequest,
    snapshot: Option<MemoryBlock>,
}

impl Group {
    /// One poll stands in for every member: the longest window, everything
    /// else taken from the first member. Each member keeps its own rate.
    fn recompute(&mut self) {
        let Some((_, first)) = self.members.first() else {
            return;
        };
        let mut representative = first.request().clone();
        representative.set_callback(None);
        representative.set_group(Fingerprint::of(&representative).ok());
        representative.set_length(
            self.members
                .iter()
                .map(|(_, member)| member.request().length())
                .max()
                .unwrap_or_default(),
        );
        self.representative = representative;
    }

    fn filter(&self) -> Option<RequestFilter> {
        self.members
            .first()
            .and_then(|(_, member)| member.filter().clone())
    }

    fn next_run(&self) -> Option<Instant> {
        self.members
            .iter()
            .map(|(_, member)| member.next_run())
            .min()
            .flatten()
    }
}

/// A group that has at least one member due.
#[derive(Debug)]
pub(super) struct Candidate {
    pub request: MemoryRequest,
    pub next_run: Option<Instant>,
    /// The first member's filter; `None` always passes.
    pub filter: Option<RequestFilter>,
}

impl Candidate {
    pub fn passes_filter(&self) -> bool {
        self.filter.as_ref().map_or(true, RequestFilter::passes)
    }
}

#[derive(Default)]
pub(super) struct RecurringTable {
    groups: BTreeMap<Fingerprint, Group>,
    index: HashMap<SubscriptionId, Fingerprint>,
    next_id: u64,
}

impl RecurringTable {
    pub fn insert(
        &mut self,
        request: RecurringMemoryRequest,
    ) -> Result<SubscriptionId, AddressConversionError> {
        let fingerprint = Fingerprint::of(request.request())?;
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        let group = self.groups.entry(fingerprint).or_insert_with(|| Group {
            members: vec![],
            representative: request.request().clone(),
            snapshot: None,
        });
        group.members.push((id, request));
        group.recompute();
        self.index.insert(id, fingerprint);
        Ok(id)
    }

    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        let Some(fingerprint) = self.index.remove(&id) else {
            return false;
        };
        let Some(group) = self.groups.get_mut(&fingerprint) else {
            return false;
        };
        group.members.retain(|(member_id, _)| *member_id != id);
        if group.members.is_empty() {
            self.groups.remove(&fingerprint);
        } else {
            group.recompute();
        }
        true
    }

    pub fn clear(&mut self) {
        self.groups.clear();
        self.index.clear();
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn candidates(&self, now: Instant) -> Vec<Candidate> {
        self.groups
            .values()
            .filter_map(|group| {
                if !group.members.iter().any(|(_, member)| member.is_due(now)) {
                    return None;
                }
                Some(Candidate {
                    request: group.representative.clone(),
                    next_run: group.next_run(),
                    filter: group.filter(),
                })
            })
            .collect()
    }

    /// Filters of the due members that have one. They are evaluated by the
    /// caller outside the service lock.
    pub fn due_filters(
        &self,
        fingerprint: Fingerprint,
        now: Instant,
    ) -> Vec<(SubscriptionId, RequestFilter)> {
        let Some(group) = self.groups.get(&fingerprint) else {
            return vec![];
        };
        group
            .members
            .iter()
            .filter(|(_, member)| member.is_due(now))
            .filter_map(|(id, member)| Some((*id, member.filter().clone()?)))
            .collect()
    }

    /// Records a poll result and returns the deliveries it triggers. Members
    /// in `held` failed their filter: they get nothing and stay due. The
    /// changed flag is decided once for the whole group from the
    /// representative's window.
    pub fn record_response(
        &mut self,
        fingerprint: Fingerprint,
        data: &MemoryBlock,
        now: Instant,
        held: &[SubscriptionId],
    ) -> Vec<(Callback<MemoryBlock>, MemoryBlock)> {
        let Some(group) = self.groups.get_mut(&fingerprint) else {
            return vec![];
        };
        let changed = group.snapshot.as_ref() != Some(data);
        let mut deliveries = vec![];
        for (id, member) in group.members.iter_mut() {
            if !member.is_due(now) || held.contains(id) {
                continue;
            }
            member.set_last_run(Some(now));
            if member.respond_on_change_only() && !changed {
                continue;
            }
            if let Some(callback) = member.request().callback() {
                deliveries.push((
                    callback.clone(),
                    data.truncated(member.request().length()),
                ));
            }
        }
        group.snapshot = Some(data.clone());
        deliveries
    }

    #[cfg(test)]
    fn group_of(&self, id: SubscriptionId) -> Option<&Group> {
        self.groups.get(self.index.get(&id)?)
    }
}
