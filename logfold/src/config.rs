//! Engine configuration.
//!
//! Parameters are `nutype` types validated at creation time, so an engine
//! can never be built from an invalid configuration.

use nutype::nutype;
use serde::{Deserialize, Serialize};

/// How many signals a listener may fall behind before it misses some.
///
/// Validated to be between 1 and 65 536.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 65_536),
    default = 1024,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct SignalCapacity(usize);

/// Configuration shared by every engine regardless of its state type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Buffer size of the signal broadcast channel
    #[serde(default)]
    pub signal_capacity: SignalCapacity,
}

impl EngineConfig {
    /// Returns the configuration with a different signal capacity.
    #[must_use]
    pub fn with_signal_capacity(mut self, capacity: SignalCapacity) -> Self {
        self.signal_capacity = capacity;
        self
    }
}
