pub mod browser;
pub mod clock;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod message;
pub mod page;
pub mod permissions;
pub mod schema;
pub mod session;
pub mod settings;
pub mod transcript;
pub mod turn;
pub mod validate;
