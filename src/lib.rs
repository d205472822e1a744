pub mod configuration;
pub mod controller;
pub mod emulation;
pub mod error_handling;
pub mod event;
pub mod event_sink;
pub mod network;
pub mod storage;
