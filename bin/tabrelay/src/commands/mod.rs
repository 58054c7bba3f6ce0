pub mod agent;
pub mod bridge;
pub mod init;
pub mod status;
pub mod tabs;
