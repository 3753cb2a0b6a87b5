//! Policy conditions, thresholds and violation events

mod condition;
mod threshold;

pub use condition::*;
pub use threshold::{
    PolicyParams, ThresholdConfig, DEFAULT_MAX_RETIRED_PAGES, DEFAULT_POWER_WATTS,
    DEFAULT_THERMAL_CELSIUS,
};
