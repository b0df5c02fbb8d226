pub mod directory;
pub mod scheduler;
