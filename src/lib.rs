pub mod channel;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod message;
pub mod model;
pub mod settings;
pub mod store;
pub mod webhook;
