pub mod protocol;
pub mod router;
pub mod ws;

pub use protocol::{DeltaChanges, Envelope};
pub use router::{parse_filter_json, ChangeRouter, Subscription};
