pub mod database;
pub mod drive;
pub mod filesystem;
pub mod register;

pub use register::BackendHandle;
