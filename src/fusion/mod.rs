// Orientation estimation

pub mod madgwick;

pub use madgwick::{Madgwick, Quaternion};
