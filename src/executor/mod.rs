pub mod coordinator;
pub mod device;
