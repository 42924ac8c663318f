//! The executor's core: everything needed to take an instance spec and run
//! one VM end to end, independent of how it is wired up or invoked.

pub mod config;
pub mod control;
pub mod credential;
pub mod github;
pub mod images;
pub mod invocation;
pub mod vm;
pub mod watchers;
