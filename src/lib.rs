pub mod backends;
pub mod binding;
pub mod classifier;
pub mod config;
pub mod debounce;
pub mod device;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod filtered_listener;
pub mod gesture;
pub mod key;
pub mod logger;
pub mod manager;
pub mod pipeline;
pub mod snapshot;
pub mod socket;
pub mod watcher;

pub use binding::{KeyMap, PhysicalBinding};
pub use config::Config;
pub use device::*;
pub use error::{ConfigError, Error, Result};
pub use event::*;
pub use eventbus::{EventBus, EventFilter, Publisher, Subscriber};
pub use filtered_listener::FilteredSubscriber;
pub use key::LogicalKey;
pub use logger::{init_tracing, LogSubscriber};
pub use manager::*;
pub use snapshot::Snapshot;
