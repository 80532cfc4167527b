pub mod context;
pub mod monitor;
pub mod tracker;

use std::collections::HashMap;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    Memory,
    Compute,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Memory => write!(f, "MEMORY"),
            ResourceType::Compute => write!(f, "COMPUTE"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceType {
    Cpu,
    Gpu,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Cpu => write!(f, "CPU"),
            DeviceType::Gpu => write!(f, "GPU"),
        }
    }
}

/// Identifies one physical device, e.g. `GPU:0` or `CPU:0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceSpec {
    pub device_type: DeviceType,
    pub id: u32,
}

pub const GPU0: DeviceSpec = DeviceSpec {
    device_type: DeviceType::Gpu,
    id: 0,
};

pub const CPU0: DeviceSpec = DeviceSpec {
    device_type: DeviceType::Cpu,
    id: 0,
};

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_type, self.id)
    }
}

/// A resource kind on a concrete device, the key of all accounting maps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceTag {
    pub ty: ResourceType,
    pub device: DeviceSpec,
}

impl ResourceTag {
    pub fn new(ty: ResourceType, device: DeviceSpec) -> Self {
        Self { ty, device }
    }

    pub fn memory(device: DeviceSpec) -> Self {
        Self::new(ResourceType::Memory, device)
    }

    pub fn compute(device: DeviceSpec) -> Self {
        Self::new(ResourceType::Compute, device)
    }
}

impl fmt::Display for ResourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.ty, self.device)
    }
}

/// Non-negative quantities keyed by resource tag.
pub type Resources = HashMap<ResourceTag, usize>;

/// True when `avail` covers `req` for every tag.
pub fn contains(avail: &Resources, req: &Resources) -> bool {
    req.iter()
        .all(|(tag, want)| avail.get(tag).copied().unwrap_or(0) >= *want)
}

/// Add every quantity in `other` into `into`.
pub fn merge(into: &mut Resources, other: &Resources) {
    for (tag, num) in other {
        *into.entry(*tag).or_insert(0) += num;
    }
}

/// Subtract `other` from `from`. Returns false and leaves `from` untouched
/// when any tag would go negative.
pub fn subtract(from: &mut Resources, other: &Resources) -> bool {
    if !contains(from, other) {
        return false;
    }
    for (tag, num) in other {
        if let Some(have) = from.get_mut(tag) {
            *have -= num;
        }
    }
    remove_zeros(from);
    true
}

/// Drop all zero-valued entries.
pub fn remove_zeros(res: &mut Resources) {
    res.retain(|_, num| *num > 0);
}

/// Deterministic single-line rendering for logs, sorted by tag.
pub fn format_resources(res: &Resources) -> String {
    if res.is_empty() {
        return "(empty)".to_string();
    }
    let mut entries = res.iter().collect::<Vec<_>>();
    entries.sort_by_key(|(tag, _)| **tag);
    let parts = entries
        .iter()
        .map(|(tag, num)| format!("{}={}", tag, num))
        .collect::<Vec<_>>();
    parts.join(", ")
}
