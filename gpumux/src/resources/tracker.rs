use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

use super::{format_resources, merge, remove_zeros, Resources};

/// Opaque id of an outstanding admission offer.
pub type OfferId = Uuid;

struct OfferEntry {
    predicted: Resources,
    handle: Option<String>,
}

#[derive(Default)]
struct TrackerState {
    capacity: Resources,
    aggregate: Resources,
    offers: HashMap<OfferId, OfferEntry>,
}

/// Admission control: tracks the aggregate predicted usage of all admitted
/// sessions and rejects offers that would overcommit the device. Tags absent
/// from the configured capacity are unconstrained.
pub struct SessionResourceTracker {
    state: Mutex<TrackerState>,
}

impl SessionResourceTracker {
    pub fn new(capacity: Resources) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                capacity,
                aggregate: Resources::new(),
                offers: HashMap::new(),
            }),
        }
    }

    /// Reserve `predicted` if it fits next to the current aggregate.
    pub fn admit(&self, predicted: &Resources) -> Option<OfferId> {
        let mut state = self.lock_state();
        for (tag, want) in predicted {
            let Some(cap) = state.capacity.get(tag) else {
                continue;
            };
            let used = state.aggregate.get(tag).copied().unwrap_or(0);
            if used + want > *cap {
                return None;
            }
        }

        merge(&mut state.aggregate, predicted);
        let offer = Uuid::new_v4();
        state.offers.insert(
            offer,
            OfferEntry {
                predicted: predicted.clone(),
                handle: None,
            },
        );
        Some(offer)
    }

    /// Bind a session handle to an offer; the reservation is retained.
    pub fn accept_admission(&self, offer: OfferId, handle: &str) {
        let mut state = self.lock_state();
        if let Some(entry) = state.offers.get_mut(&offer) {
            entry.handle = Some(handle.to_string());
        }
    }

    pub fn usage(&self, offer: OfferId) -> Option<Resources> {
        let state = self.lock_state();
        state.offers.get(&offer).map(|entry| entry.predicted.clone())
    }

    /// Return an offer's reserved capacity to the pool.
    pub fn free(&self, offer: OfferId) {
        let mut state = self.lock_state();
        let Some(entry) = state.offers.remove(&offer) else {
            return;
        };
        let predicted = entry.predicted;
        for (tag, num) in &predicted {
            if let Some(have) = state.aggregate.get_mut(tag) {
                *have = have.saturating_sub(*num);
            }
        }
        remove_zeros(&mut state.aggregate);
    }

    pub fn debug_string(&self) -> String {
        let state = self.lock_state();
        format!(
            "SessionResourceTracker: capacity [{}] aggregate [{}] offers {}",
            format_resources(&state.capacity),
            format_resources(&state.aggregate),
            state.offers.len()
        )
    }

    fn lock_state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().expect("session tracker mutex poisoned")
    }
}
