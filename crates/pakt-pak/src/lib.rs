//! Package builder: `ExoPak` (tokens leaving a party) and `RetroPak`
//! (rollback insurance — retained tokens with pre-signed restore
//! instructions). Packages exist only for the duration of a transaction.

mod builder;
mod types;

pub use builder::{build_exopak, build_retropak, token_root, verify_exopak};
pub use types::{
    ExoPak, PakDirection, PakStatus, RetroPak, RollbackInstructions, RollbackKind, RollbackStep,
};
