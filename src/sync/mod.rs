//! Client-side synchronization core.

pub mod connection;
pub mod notifications;
pub mod scheduler;
pub mod session;
pub mod subscription;
pub mod timeline;
pub mod transport;
pub mod typing;

#[cfg(test)]
pub(crate) mod testing;
