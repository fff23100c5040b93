pub mod connector;

pub use connector::{ConnectionState, FeedConfig, FeedConnector, TickSink};
