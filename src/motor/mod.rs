// Motor actuation over the shared bus

pub mod esc;

pub use esc::Esc;
