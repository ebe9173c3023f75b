//! DHT20 temperature/humidity sensor over I²C
//!
//! Protocol (from the sensor datasheet):
//! - status register `0x71`: bits 3 (idle) and 4 (calibrated) must be set
//! - trigger: `0xAC 0x33 0x00`, then wait at least 80 ms
//! - result: 7 bytes; humidity and temperature are 20-bit fixed point
//! - soft reset: `0xBA`

use rsm_common::{Error, Reading, Result};
use std::thread::sleep;
use std::time::Duration;
use tracing::debug;

use super::{SensorDriver, SensorReport};

/// Default I²C address
pub const DHT20_ADDRESS: u16 = 0x38;

const STATUS_REGISTER: u8 = 0x71;
const STATUS_READY_MASK: u8 = 0x18;
const TRIGGER_COMMAND: u8 = 0xAC;
const TRIGGER_ARGS: [u8; 2] = [0x33, 0x00];
const RESET_COMMAND: u8 = 0xBA;
const MEASUREMENT_LEN: u8 = 7;

const MEASUREMENT_WAIT: Duration = Duration::from_millis(200);
const RESET_WAIT: Duration = Duration::from_secs(1);

/// Full scale of the 20-bit raw values
const RAW_SCALE: f64 = (1u32 << 20) as f64;

/// SMBus-style transactions the DHT20 needs
pub trait Dht20Bus: Send {
    fn write_byte(&mut self, value: u8) -> std::result::Result<(), String>;
    fn write_block(&mut self, command: u8, data: &[u8]) -> std::result::Result<(), String>;
    fn read_block(&mut self, command: u8, len: u8) -> std::result::Result<Vec<u8>, String>;
}

pub struct Dht20<B: Dht20Bus> {
    bus: B,
    measurement_wait: Duration,
    reset_wait: Duration,
}

impl<B: Dht20Bus> Dht20<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            measurement_wait: MEASUREMENT_WAIT,
            reset_wait: RESET_WAIT,
        }
    }

    /// Skip the settle delays (for scripted buses)
    pub fn without_delays(mut self) -> Self {
        self.measurement_wait = Duration::ZERO;
        self.reset_wait = Duration::ZERO;
        self
    }

    fn measure(&mut self) -> std::result::Result<SensorReport, String> {
        let status = self.bus.read_block(STATUS_REGISTER, 1)?;
        let status = status.first().copied().ok_or("empty status response")?;
        if status & STATUS_READY_MASK != STATUS_READY_MASK {
            return Ok(SensorReport::Unavailable(format!(
                "sensor not calibrated/idle (status 0x{:02X})",
                status
            )));
        }

        self.bus.write_block(TRIGGER_COMMAND, &TRIGGER_ARGS)?;
        sleep(self.measurement_wait);

        let data = self.bus.read_block(0x00, MEASUREMENT_LEN)?;
        debug!("DHT20 raw data {:02X?}", data);
        Ok(match decode_measurement(&data) {
            Some(reading) => SensorReport::Ready(reading),
            None => SensorReport::Unavailable(format!(
                "short measurement ({} of {} bytes)",
                data.len(),
                MEASUREMENT_LEN
            )),
        })
    }
}

impl<B: Dht20Bus> SensorDriver for Dht20<B> {
    fn reset(&mut self) -> Result<()> {
        self.bus
            .write_byte(RESET_COMMAND)
            .map_err(|e| Error::SensorUnavailable(format!("DHT20 reset failed: {}", e)))?;
        sleep(self.reset_wait);
        Ok(())
    }

    fn read(&mut self) -> SensorReport {
        self.measure()
            .unwrap_or_else(|e| SensorReport::Unavailable(format!("DHT20 read error: {}", e)))
    }
}

/// Convert a 7-byte measurement frame to physical units
///
/// Humidity occupies bytes 1, 2 and the high nibble of 3; temperature the
/// low nibble of 3 and bytes 4, 5. Values are rounded to two decimals.
pub fn decode_measurement(data: &[u8]) -> Option<Reading> {
    if data.len() < MEASUREMENT_LEN as usize {
        return None;
    }
    let humidity_raw =
        ((data[1] as u32) << 12) | ((data[2] as u32) << 4) | ((data[3] as u32 & 0xF0) >> 4);
    let temperature_raw =
        ((data[3] as u32 & 0x0F) << 16) | ((data[4] as u32) << 8) | data[5] as u32;

    let humidity = 100.0 * humidity_raw as f64 / RAW_SCALE;
    let temperature = 200.0 * temperature_raw as f64 / RAW_SCALE - 50.0;
    Some(Reading::new(round2(temperature), round2(humidity)))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(target_os = "linux")]
mod linux {
    use super::Dht20Bus;
    use i2cdev::core::I2CDevice;
    use i2cdev::linux::LinuxI2CDevice;
    use std::path::Path;

    /// `/dev/i2c-N` character device bound to one slave address
    pub struct LinuxBus {
        device: LinuxI2CDevice,
    }

    impl LinuxBus {
        pub fn open(path: &Path, address: u16) -> rsm_common::Result<Self> {
            LinuxI2CDevice::new(path, address)
                .map(|device| Self { device })
                .map_err(|e| {
                    rsm_common::Error::SensorUnavailable(format!(
                        "cannot open {} at 0x{:02X}: {}",
                        path.display(),
                        address,
                        e
                    ))
                })
        }
    }

    impl Dht20Bus for LinuxBus {
        fn write_byte(&mut self, value: u8) -> Result<(), String> {
            self.device.smbus_write_byte(value).map_err(|e| e.to_string())
        }

        fn write_block(&mut self, command: u8, data: &[u8]) -> Result<(), String> {
            self.device
                .smbus_write_i2c_block_data(command, data)
                .map_err(|e| e.to_string())
        }

        fn read_block(&mut self, command: u8, len: u8) -> Result<Vec<u8>, String> {
            self.device
                .smbus_read_i2c_block_data(command, len)
                .map_err(|e| e.to_string())
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::LinuxBus;
