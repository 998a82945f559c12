pub mod error;
pub mod packet;
pub mod session;
pub mod topics;
