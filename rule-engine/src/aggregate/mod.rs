pub mod manager;
pub mod store;

pub use manager::AggregateStoreManager;
pub use store::{AggregateRow, AggregateStore, CurrentState};
