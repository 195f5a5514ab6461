pub mod cancel;
pub mod config;
pub mod error;
pub mod record;

pub use cancel::*;
pub use config::*;
pub use error::*;
pub use record::*;
