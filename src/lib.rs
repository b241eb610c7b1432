pub mod balancer;
pub mod cluster;
pub mod collision;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod failover;
pub mod message;
pub mod node;
pub mod scheduler;
pub mod shutdown;
pub mod topology;
pub mod worker;
