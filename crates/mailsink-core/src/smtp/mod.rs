//! SMTP receive path

pub mod server;
pub mod session;
pub mod tls;

pub use server::SmtpServer;
