mod ledger;
mod synchronizer;

pub use ledger::{GroupLedger, ParamGroup};
pub use synchronizer::{DecayPolicy, Optimizer, ParamGroups, SyncOutcome, Synchronizer};
