//! Loss scenarios and a two-interface harness over the loopback fabric.

pub mod harness;
pub mod scenarios;

pub use harness::{Harness, HarnessBuilder, Inbox, Side, HARNESS_AM};
pub use scenarios::{practical_baseline, LossScenario, LOSSLESS, PRACTICAL_BASELINE};
