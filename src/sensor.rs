//! This module contains the interface for reading drive temperatures
//! (`TemperatureReader`) and what constitutes one reading
//! (`TemperatureSample`).

pub mod smart;

use crate::error;

use async_trait::async_trait;

/// One drive temperature measured during one tick
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureSample {
    /// Device the reading came from, e.g. `/dev/sda`
    pub drive: String,
    pub celsius: i32,
    /// Tick the sample belongs to; samples are never carried across ticks
    pub tick: u64,
}

/// Source of one drive's current temperature
#[async_trait]
pub trait TemperatureReader: Send + Sync {
    /// Read the current temperature of `drive` in degrees Celsius
    async fn read_temperature(&self, drive: &str) -> error::Result<i32>;
}
