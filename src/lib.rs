pub mod api;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod fuzzy;
pub mod history;
pub mod lock;
pub mod mailbox;
pub mod mention;
pub mod protocol;
pub mod readiness;
pub mod registry;
pub mod routing;
pub mod session;
pub mod typing;
pub mod types;
