pub mod calendar;
pub mod config;
pub mod engine;
pub mod fees;
pub mod lifecycle;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod protocol;
pub mod reaper;
pub mod rooms;
pub mod service;
pub mod wal;
pub mod wire;
