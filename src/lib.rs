#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod cache;
pub mod core;
pub mod index;
pub mod section;
pub mod stats;
pub mod storage;
pub mod store;
