pub mod broadcaster;
pub mod server;
pub mod worker;
