#![warn(rust_2018_idioms)]

#[macro_use]
extern crate slog_scope;

pub mod autoscaler;
pub mod cloud;
pub mod connector;
pub mod container_name;
pub mod error;
pub mod jobbus;
pub mod logging;
pub mod queue;
pub mod registry;
pub mod server;
pub mod settings;
pub mod spec_store;
