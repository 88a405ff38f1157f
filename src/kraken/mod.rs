pub mod client;
pub mod messages;
pub mod rate_limit;
pub mod signer;
pub mod stream;
pub mod symbols;

pub use client::{Endpoint, KrakenRestClient, MarketDataSource, MarketSnapshot, OhlcPage};
pub use signer::RequestSigner;
pub use stream::{StreamConnection, Subscription};
pub use symbols::{PairCatalog, PairMapping, SymbolResolver};
