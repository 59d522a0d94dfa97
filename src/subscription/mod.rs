// Connection and subscription management

pub mod manager;

mod registry;
mod stream;

pub use manager::ConnectionManager;
pub use stream::{Payload, TopicStream};
