pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod engine;
pub mod modules;
pub mod pipeline;
pub mod platform;
pub mod prefs;
pub mod response;
pub mod scheduler;
pub mod users;
