pub mod daemon;
pub mod entry;

pub use entry::entry_command;
