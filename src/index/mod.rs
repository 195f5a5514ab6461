pub mod kv;
pub mod term;

pub use kv::{children_key, subsections_key, KeyValueIndex};
pub use term::{TermCount, TermIndex, TermMember, WeightedTermEntry};
