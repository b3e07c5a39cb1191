//! Dispatcher side of the bridge: framed TCP channels, the command loop,
//! the live aggregation push and process-local metrics.

pub mod dispatcher;
pub mod live;
pub mod metrics;
pub mod push;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use metrics::METRICS;
pub use push::PushChannel;
