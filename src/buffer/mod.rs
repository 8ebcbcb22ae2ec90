pub mod bufferpool;
pub mod guard;
pub mod replacer;

pub use bufferpool::BufferPoolManager;
pub use guard::{PageGuard, ReadPageGuard, WritePageGuard};
pub use replacer::{LruKReplacer, Replacer, SyncLruKReplacer};
