#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod analysis;
pub mod bank;
pub mod config;
pub mod event;
pub mod generate;
pub mod histogram;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod report;
pub mod scheduler;
pub mod source;
pub mod types;
pub mod worker;
