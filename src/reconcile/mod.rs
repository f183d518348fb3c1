//! The reconciliation core: window arithmetic, the merged per-day view of
//! every source, discrepancy detection, and the pipeline that strings them
//! together.

mod detect;
mod index;
mod pipeline;
mod window;

pub use detect::detect;
pub use index::{AggregateIndex, index};
pub use pipeline::{ReconcileError, ReconcileOutcome, run};
pub use window::{ReconcileWindow, ceil_to_day, day_start, floor_to_day};
