//! Background periodic work, currently the retention sweeper.

pub mod engine;

pub use self::engine::{spawn_periodic, PeriodicHandle};
