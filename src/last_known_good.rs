//! Memory of the most recently validated keying parameters.

use std::sync::Arc;

use parking_lot::RwLock;

use kf_core::KeyingParams;

/// The last parameters that produced validated, non-black output.
///
/// Cloning shares the same slot. There is exactly one writer: the forensics
/// stage, which records after a non-black success. Attempts run one at a
/// time, so a reader during reversion always sees a fully written value
/// from an earlier attempt.
#[derive(Debug, Clone, Default)]
pub struct LastKnownGood {
    slot: Arc<RwLock<Option<KeyingParams>>>,
}

impl LastKnownGood {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from parameters validated in an earlier session.
    pub fn seeded(params: KeyingParams) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Some(params))),
        }
    }

    pub fn get(&self) -> Option<KeyingParams> {
        *self.slot.read()
    }

    pub(crate) fn record(&self, params: KeyingParams) {
        *self.slot.write() = Some(params);
    }

    pub fn clear(&self) {
        *self.slot.write() = None;
    }
}
