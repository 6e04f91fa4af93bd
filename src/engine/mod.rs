pub mod agent;
pub mod arena;
pub mod config;
pub mod grid;
pub mod loader;
pub mod lua_api;
pub mod query;
pub mod server;
pub mod shop;
