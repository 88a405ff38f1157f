pub mod store;
pub mod timeline;

pub use store::{CandleCallback, StoreErrorCallback, TimelineStore};
pub use timeline::{Candle, Timeline};
