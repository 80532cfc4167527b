use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use super::{format_resources, merge, remove_zeros, subtract, DeviceSpec, ResourceTag, Resources};

/// Id correlating the staging and committed allocations of one logical
/// operation. Zero is reserved as invalid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(u64);

impl Ticket {
    pub const INVALID: Ticket = Ticket(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Default)]
struct MonitorState {
    total: Resources,
    avail: Resources,
    staging: HashMap<Ticket, Resources>,
    committed: HashMap<Ticket, Resources>,
    next_ticket: u64,
}

impl MonitorState {
    fn issue_ticket(&mut self) -> Ticket {
        self.next_ticket += 1;
        Ticket(self.next_ticket)
    }
}

/// Process-wide accounting of device resources. For every tag the sum of
/// available, staged and committed quantities equals the configured limit.
pub struct ResourceMonitor {
    state: Mutex<MonitorState>,
}

/// Point-in-time copy of the monitor's books, mostly for assertions.
pub struct MonitorSnapshot {
    pub total: Resources,
    pub avail: Resources,
    pub staged: Resources,
    pub committed: Resources,
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Set per-tag capacities. Tags absent from `limits` have zero capacity.
    pub fn initialize_limits(&self, limits: Resources) {
        let mut state = self.lock_state();
        state.avail = limits.clone();
        state.total = limits;
    }

    /// Atomically check and stage `res`. On success returns a fresh ticket;
    /// on any shortfall stages nothing and records per-tag deficits in
    /// `missing`.
    pub fn pre_allocate(&self, res: &Resources, missing: &mut Resources) -> Option<Ticket> {
        missing.clear();
        let mut state = self.lock_state();
        for (tag, want) in res {
            let have = state.avail.get(tag).copied().unwrap_or(0);
            if have < *want {
                missing.insert(*tag, *want - have);
            }
        }
        if !missing.is_empty() {
            return None;
        }

        subtract_unchecked(&mut state.avail, res);
        let ticket = state.issue_ticket();
        let mut staged = res.clone();
        remove_zeros(&mut staged);
        if !staged.is_empty() {
            state.staging.insert(ticket, staged);
        }
        Some(ticket)
    }

    /// Scoped proxy over the monitor mutex for compound sequences that must
    /// appear atomic to callers.
    pub fn lock(&self) -> MonitorProxy<'_> {
        MonitorProxy {
            state: self.lock_state(),
        }
    }

    /// Commit `res` against a ticket's staging.
    pub fn allocate(&self, ticket: Ticket, res: &Resources) -> bool {
        self.lock().allocate(ticket, res)
    }

    /// Decommit `res` from a ticket, returning it to the free pool.
    pub fn free(&self, ticket: Ticket, res: &Resources) -> bool {
        self.lock().free(ticket, res)
    }

    /// Release all remaining staging held by a ticket.
    pub fn free_staging(&self, ticket: Ticket) {
        let mut state = self.lock_state();
        if let Some(staged) = state.staging.remove(&ticket) {
            merge(&mut state.avail, &staged);
        }
    }

    /// True iff the ticket still holds committed or staged quantities.
    pub fn has_usage(&self, ticket: Ticket) -> bool {
        let state = self.lock_state();
        state.staging.contains_key(&ticket) || state.committed.contains_key(&ticket)
    }

    pub fn query_staging(&self, ticket: Ticket) -> Resources {
        self.lock().query_staging(ticket)
    }

    /// Sum of staged plus committed quantities across `tickets`.
    pub fn query_usages(&self, tickets: &HashSet<Ticket>) -> Resources {
        let state = self.lock_state();
        let mut out = Resources::new();
        for ticket in tickets {
            if let Some(staged) = state.staging.get(ticket) {
                merge(&mut out, staged);
            }
            if let Some(committed) = state.committed.get(ticket) {
                merge(&mut out, committed);
            }
        }
        out
    }

    /// Tickets ordered by committed memory on `device`, largest first.
    /// Tickets without memory on that device are omitted.
    pub fn sort_victim(&self, tickets: &HashSet<Ticket>, device: DeviceSpec) -> Vec<(usize, Ticket)> {
        let tag = ResourceTag::memory(device);
        let state = self.lock_state();
        let mut victims = tickets
            .iter()
            .filter_map(|ticket| {
                let usage = state
                    .committed
                    .get(ticket)
                    .and_then(|res| res.get(&tag))
                    .copied()
                    .unwrap_or(0);
                (usage > 0).then_some((usage, *ticket))
            })
            .collect::<Vec<_>>();
        victims.sort_by(|lhs, rhs| rhs.0.cmp(&lhs.0).then(lhs.1.cmp(&rhs.1)));
        victims
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let state = self.lock_state();
        let mut staged = Resources::new();
        for res in state.staging.values() {
            merge(&mut staged, res);
        }
        let mut committed = Resources::new();
        for res in state.committed.values() {
            merge(&mut committed, res);
        }
        MonitorSnapshot {
            total: state.total.clone(),
            avail: state.avail.clone(),
            staged,
            committed,
        }
    }

    pub fn debug_string(&self) -> String {
        let state = self.lock_state();
        let mut out = format!(
            "ResourceMonitor: total [{}] avail [{}]",
            format_resources(&state.total),
            format_resources(&state.avail)
        );
        let mut tickets = state
            .staging
            .keys()
            .chain(state.committed.keys())
            .copied()
            .collect::<Vec<_>>();
        tickets.sort();
        tickets.dedup();
        for ticket in tickets {
            let staged = state.staging.get(&ticket);
            let committed = state.committed.get(&ticket);
            out.push_str(&format!(
                "\n  ticket {}: staged [{}] committed [{}]",
                ticket,
                staged.map_or_else(|| "(empty)".to_string(), format_resources),
                committed.map_or_else(|| "(empty)".to_string(), format_resources),
            ));
        }
        out
    }

    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().expect("resource monitor mutex poisoned")
    }
}

/// Holds the monitor mutex for the lifetime of the proxy, so a sequence of
/// calls through it is atomic with respect to other monitor users.
pub struct MonitorProxy<'a> {
    state: MutexGuard<'a, MonitorState>,
}

impl MonitorProxy<'_> {
    /// Move `res` from the ticket's staging into its committed usage.
    /// Fails without effect when staging is insufficient.
    pub fn allocate(&mut self, ticket: Ticket, res: &Resources) -> bool {
        let Some(staged) = self.state.staging.get_mut(&ticket) else {
            return false;
        };
        if !subtract(staged, res) {
            return false;
        }
        if staged.is_empty() {
            self.state.staging.remove(&ticket);
        }
        merge(
            self.state.committed.entry(ticket).or_default(),
            res,
        );
        true
    }

    /// Return committed quantities to the free pool. Fails without effect
    /// when the ticket has not committed that much.
    pub fn free(&mut self, ticket: Ticket, res: &Resources) -> bool {
        let Some(committed) = self.state.committed.get_mut(&ticket) else {
            return false;
        };
        if !subtract(committed, res) {
            return false;
        }
        if committed.is_empty() {
            self.state.committed.remove(&ticket);
        }
        merge(&mut self.state.avail, res);
        true
    }

    pub fn query_staging(&self, ticket: Ticket) -> Resources {
        self.state.staging.get(&ticket).cloned().unwrap_or_default()
    }
}

fn subtract_unchecked(from: &mut Resources, other: &Resources) {
    for (tag, num) in other {
        if let Some(have) = from.get_mut(tag) {
            *have -= (*num).min(*have);
        }
    }
    remove_zeros(from);
}
