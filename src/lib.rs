pub mod config;
pub mod error;
pub mod gateway;
pub mod master;
pub mod rpc;
pub mod stats;
pub mod work;
pub mod worker;
