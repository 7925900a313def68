//! Chassis fan-speed regulation for multi-disk storage servers.
//!
//! A fixed-interval control loop reads drive temperatures over SMART, feeds
//! the hottest reading into a PID controller and maps its output onto the
//! PWM duty cycle of one or more fan zones driven through IPMI.

pub mod config;
pub mod error;
pub mod fan;
pub mod halt;
pub mod monitor;
pub mod sensor;
