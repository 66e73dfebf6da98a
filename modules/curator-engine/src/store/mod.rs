pub mod file;
pub mod memory;
pub mod overlay;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use overlay::OverlayStore;
