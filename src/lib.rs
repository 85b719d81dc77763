pub mod event;
mod hex;
pub mod mount;
pub mod shard;

pub use event::{Config, EventStream, EventSubscription};
pub use mount::{Mount, RemoteMount, Resourcer};
