// Connection lifecycle state

mod store;

pub use store::{ConnectionState, ConnectionStateStore, StateStream};
