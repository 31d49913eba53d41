pub mod backoff;
pub mod booth;
pub mod providers;
pub mod registry;
pub mod session;
