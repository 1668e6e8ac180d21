//! Sampling of telemetry items.
//!
//! Sampling reduces the volume of telemetry while keeping it statistically representative. Every
//! kept item is annotated with the percentage in effect, so that the receiving side can
//! extrapolate the true number of items.
//!
//! # Sampling Determinism
//!
//! Decisions are deterministic. Items are scored by seeding a random number generator with a
//! seed derived from the item:
//!
//! - Items that belong to an operation are seeded with their correlation id. All items of an
//!   operation therefore share the same score, and a kept request is never separated from its
//!   dependencies and exceptions.
//! - Items without a correlation id are seeded with their own identity and are sampled
//!   independently.
//!
//! An item is kept if its score in `[0, 100)` is below the sampling percentage. To keep
//! operations consistent across changes of the percentage, the percentage is pinned per
//! operation in an [`OperationRegistry`] when the first item of an operation is sampled.
//!
//! # Modes
//!
//! - **Disabled**: all items are kept and not annotated.
//! - **Fixed**: the configured percentage applies to all samplable items.
//! - **Adaptive**: an [`AdaptiveController`] periodically recomputes the percentage from the
//!   observed item rate to approach a target number of items per second.
//!
//! Items whose kind is excluded from sampling, metrics, and items marked as not samplable are
//! always kept.
#![warn(missing_docs)]

mod adaptive;
mod config;
mod engine;
mod evaluation;
mod operations;

pub use adaptive::*;
pub use config::*;
pub use engine::*;
pub use evaluation::*;
pub use operations::*;
