pub mod filter;
pub mod types;

pub use filter::KeywordSpamFilter;
pub use types::SpamVerdict;
