//! Denomination vector clock: per-denomination supply status codes and the
//! token-selection optimizer that nudges both parties' denomination
//! distributions toward the ideal shape.

pub mod clock;
pub mod optimizer;

pub use clock::{ideal_distribution, DenominationVectorClock, StatusCode};
pub use optimizer::{optimize, Selection, SelectionConstraints};
