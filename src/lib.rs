pub mod app;
pub mod cloud;
pub mod config;
pub mod datastore;
pub mod error;
pub mod job;
pub mod queue;
pub mod shutdown;
pub mod storage;
pub mod tls;
pub mod token;
pub mod web;
pub mod worker;
