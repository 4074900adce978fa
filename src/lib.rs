pub mod batch;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod jobs;
pub mod lifecycle;
pub mod model;
pub mod platform;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod store;
