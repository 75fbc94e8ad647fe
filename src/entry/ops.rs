//! Background operations of an entry and the frecency formula

use crate::constants::FRECENCY_HALF_LIFE_SECS;

/// Set of operations an entry asked the management thread to run
///
/// Requests coalesce into one pending set, so an entry is dispatched to the
/// management thread at most once until the set is grabbed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ops(u32);

impl Ops {
    pub const REGISTER: u32 = 1 << 0;
    pub const REPORTUSAGE: u32 = 1 << 1;
    pub const FRECENCYUPDATE: u32 = 1 << 2;
    pub const DOOM: u32 = 1 << 3;
    pub const CALLBACKS: u32 = 1 << 4;

    pub fn new() -> Self {
        Self(0)
    }

    /// Add `flags`; returns `false` when a dispatch is already pending
    pub fn set(&mut self, flags: u32) -> bool {
        let was_empty = self.0 == 0;
        self.0 |= flags;
        was_empty
    }

    /// Take every pending flag, leaving the set empty
    pub fn grab(&mut self) -> u32 {
        std::mem::take(&mut self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Decay constant per microsecond for a 90 day half-life
fn decay_per_usec() -> f64 {
    (std::f64::consts::LN_2 / FRECENCY_HALF_LIFE_SECS) / 1_000_000.0
}

/// Current wall clock in microseconds since the epoch
pub fn now_usecs() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// Frecency after one more access at `now_usecs`
///
/// `ln(e^(f - now·d) + 1) + now·d`: every access adds one unit of weight and
/// older weight decays with the half-life. A never accessed entry (zero)
/// starts at `now·d`.
pub fn update_frecency(frecency: f64, now_usecs: i64) -> f64 {
    let now_decay = now_usecs as f64 * decay_per_usec();
    if frecency == 0.0 {
        return now_decay;
    }
    (frecency - now_decay).exp().ln_1p() + now_decay
}
