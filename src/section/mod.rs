pub mod builder;
pub mod nav;
pub mod trie;

pub use builder::{is_synthetic, Assembly, HierarchyBuilder, SectionNode, SYNTHETIC_PARAM};
pub use nav::{current_section, in_section, is_ancestor, is_descendant, Navigator};
pub use trie::{SectionTrie, SectionTrieBuilder};
