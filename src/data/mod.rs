pub mod loader;
pub mod store;

pub use loader::DataLoader;
pub use store::{
    trailing_window, Bar, ChartInterval, HistoricalBarStore, InMemoryBarStore,
    InMemoryStockDirectory, StockMetadataLookup,
};
