pub mod lite;
pub mod record_cache;

pub use lite::LitePage;
pub use record_cache::{CacheStats, RecordCache};
