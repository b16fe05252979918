//! Durable mail store: SQLite metadata plus content-addressed `.eml`
//! files. Protocol handlers reach this layer only through the mail
//! service facade.

pub mod content;
pub mod pool;
pub mod repository;
pub mod types;

pub use content::ContentStore;
pub use pool::{connect_pool, with_busy_retry};
pub use repository::{EmailQuery, EmailRepository, EmailStatusUpdate, SentStatusUpdate};
pub use types::{EmailRecord, MailboxKind, SearchHit, SentEmailRecord};
