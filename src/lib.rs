#![warn(clippy::all)]
#![allow(clippy::new_without_default)]
#![allow(clippy::type_complexity)]

pub mod config;
pub mod connections;
pub mod controller;
pub mod datatypes;
pub mod discovery;
pub mod errors;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod monitor;
pub mod paths;
pub mod recordings;
pub mod recovery;
pub mod snapshots;
pub mod streams;
pub mod util;
pub mod version;
