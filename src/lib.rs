pub mod block;
pub mod cli;
pub mod client;
pub mod connection;
pub mod engine;
pub mod protocol;
pub mod settings;
pub mod statement;
pub mod telemetry;

pub use block::{Block, Column, Compression, DataType};
pub use cli::{Command, prompt};
pub use client::{Client, ClientError, ClientOptions};
pub use connection::{Connection, ServerContext};
pub use protocol::Server;
pub use statement::Statement;
