// Client-side chat session core without UI dependencies

pub mod cache;
pub mod error;
pub mod executor;
pub mod message;
pub mod session;
pub mod transport;
