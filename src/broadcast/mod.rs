pub mod hub;
pub mod poller;

pub use hub::BroadcastHub;
pub use poller::ChartPoller;
