//! Temperature/humidity sampling
//!
//! The driver collaborator is synchronous (bus transactions with fixed
//! settle delays), so the sampler runs it on the blocking pool.

use rsm_common::{Error, Reading, Result};
use std::sync::{Arc, Mutex};

pub mod dht20;

pub use dht20::Dht20;

/// Outcome of one sensor read
#[derive(Debug, Clone, PartialEq)]
pub enum SensorReport {
    Ready(Reading),
    /// No reading this tick; the reason is logged by the caller
    Unavailable(String),
}

/// Sensor driver collaborator
pub trait SensorDriver: Send {
    /// Re-arm the sensor
    fn reset(&mut self) -> Result<()>;

    /// Take one measurement
    fn read(&mut self) -> SensorReport;
}

/// Driver used where no sensor bus exists; every read is unavailable
pub struct NoSensor {
    reason: String,
}

impl NoSensor {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl SensorDriver for NoSensor {
    fn reset(&mut self) -> Result<()> {
        Err(Error::SensorUnavailable(self.reason.clone()))
    }

    fn read(&mut self) -> SensorReport {
        SensorReport::Unavailable(self.reason.clone())
    }
}

/// Produces one reading per tick from a driver
#[derive(Clone)]
pub struct SensorSampler {
    driver: Arc<Mutex<Box<dyn SensorDriver>>>,
}

impl SensorSampler {
    pub fn new(driver: impl SensorDriver + 'static) -> Self {
        Self::from_boxed(Box::new(driver))
    }

    /// Wrap a driver chosen at runtime
    pub fn from_boxed(driver: Box<dyn SensorDriver>) -> Self {
        Self {
            driver: Arc::new(Mutex::new(driver)),
        }
    }

    pub async fn reset(&self) -> Result<()> {
        let driver = self.driver.clone();
        tokio::task::spawn_blocking(move || match driver.lock() {
            Ok(mut driver) => driver.reset(),
            Err(_) => Err(Error::SensorUnavailable("sensor driver lock poisoned".to_string())),
        })
        .await
        .map_err(|e| Error::SensorUnavailable(format!("sensor reset task failed: {}", e)))?
    }

    pub async fn read(&self) -> SensorReport {
        let driver = self.driver.clone();
        let report = tokio::task::spawn_blocking(move || match driver.lock() {
            Ok(mut driver) => driver.read(),
            Err(_) => SensorReport::Unavailable("sensor driver lock poisoned".to_string()),
        })
        .await;

        report.unwrap_or_else(|e| SensorReport::Unavailable(format!("sensor read task failed: {}", e)))
    }
}
