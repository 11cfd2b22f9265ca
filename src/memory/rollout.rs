use serde::{Deserialize, Serialize};

/// Deployment state of hybrid retrieval.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RolloutMode {
    /// Keyword-only everywhere
    Off,
    /// Serve keyword, run hybrid for observation only
    Shadow,
    /// Sticky fraction of sessions gets hybrid
    Canary,
    /// Hybrid everywhere
    On,
}

impl RolloutMode {
    pub fn parse(label: &str) -> Self {
        match label {
            "on" => Self::On,
            "shadow" => Self::Shadow,
            "canary" => Self::Canary,
            _ => Self::Off,
        }
    }
}

/// Which retrieval path a single search call takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPath {
    KeywordOnly,
    Hybrid,
    ShadowHybrid,
}

/// Deterministic per-call decider consumed by the runtime's `search`.
///
/// Decisions are pure functions of (policy, session_id): the same session
/// always lands on the same side of a canary split.
#[derive(Debug, Clone)]
pub struct RolloutPolicy {
    mode: RolloutMode,
    canary_percent: u8,
    shadow_percent: u8,
}

impl RolloutPolicy {
    pub fn new(mode: RolloutMode, canary_percent: u8, shadow_percent: u8) -> Self {
        Self {
            mode,
            canary_percent: canary_percent.min(100),
            shadow_percent: shadow_percent.min(100),
        }
    }

    pub fn mode(&self) -> RolloutMode {
        self.mode
    }

    pub fn decide(&self, session_id: Option<&str>) -> SearchPath {
        match self.mode {
            RolloutMode::Off => SearchPath::KeywordOnly,
            RolloutMode::On => SearchPath::Hybrid,
            RolloutMode::Shadow => SearchPath::ShadowHybrid,
            RolloutMode::Canary => match session_id.filter(|s| !s.is_empty()) {
                None => SearchPath::KeywordOnly,
                Some(session) => {
                    if fnv1a32(session) % 100 < u32::from(self.canary_percent) {
                        SearchPath::Hybrid
                    } else {
                        SearchPath::KeywordOnly
                    }
                }
            },
        }
    }

    /// Whether a shadow call actually executes the hybrid observation leg.
    /// Sampling keeps shadow cost bounded; anonymous sessions are always
    /// sampled so shadow mode produces data even without session ids.
    pub fn shadow_sampled(&self, session_id: Option<&str>) -> bool {
        match session_id.filter(|s| !s.is_empty()) {
            None => true,
            Some(session) => fnv1a32(session) % 100 < u32::from(self.shadow_percent),
        }
    }
}

/// FNV-1a, 32-bit. Stable across platforms, cheap, and good enough to
/// spread session ids over a percentage bucket.
pub fn fnv1a32(input: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in input.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
