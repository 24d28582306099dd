//! Domain records: transactions, agents, events, and the system state
//! the settlement engines operate on.

pub mod agent;
pub mod event;
pub mod state;
pub mod transaction;

pub use agent::Agent;
pub use event::{Event, EventLog};
pub use state::SystemState;
pub use transaction::{Transaction, TxArena, TxId, TxStatus};
