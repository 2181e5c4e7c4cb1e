pub mod ack;
pub mod channel;
pub mod client;
pub mod conn;
pub mod events;
pub mod fanout;
pub mod handler;
pub mod health;
pub mod hub;
pub mod server;
