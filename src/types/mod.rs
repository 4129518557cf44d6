//! Types module for WhatsApp protocol types.
//!
//! Account identifiers, JIDs and the events the protocol layer reports.

mod account;
mod jid;
mod events;

pub use account::AccountId;
pub use jid::*;
pub use events::*;
