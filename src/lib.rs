pub mod makecmd;
pub mod makedb;
pub mod parser;
pub mod ready;
pub mod remake;
pub mod watcher;
