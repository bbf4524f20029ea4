pub mod bus;
pub mod config;
pub mod fusion;
pub mod messages;
pub mod motor;
pub mod runtime;
pub mod sensor;
