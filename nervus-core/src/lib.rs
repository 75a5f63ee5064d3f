pub mod config;
pub mod error;
pub mod event;

pub use config::{BusConfig, DistributorConfig, MetricsConfig, NervusConfig, StoreConfig};
pub use error::{Error, Result};
pub use event::{BackoffPolicy, Event, Filter, Priority, RetryPolicy};
