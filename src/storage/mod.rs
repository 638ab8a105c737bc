pub mod command;
pub mod file_lock;
pub mod layout;
pub mod log;
pub mod metadata;
pub mod recovery;
