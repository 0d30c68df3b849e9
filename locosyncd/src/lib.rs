pub mod daemon;
pub mod drive;
pub mod store;
pub mod sync;
