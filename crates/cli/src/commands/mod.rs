pub mod chat;
pub mod history;
pub mod init;
pub mod status;
pub mod usage;
