pub mod config;
pub mod error;
pub mod master;
pub mod proto;
pub mod shutdown;
pub mod stats;
pub mod storage;
pub mod worker;
