//! Unix-socket IPC server for agent messages.

pub mod server;

pub use server::IpcServer;
