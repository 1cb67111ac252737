pub mod ai_sdk;
pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod render;
pub mod server;
pub mod session;

#[cfg(test)]
mod testing;
