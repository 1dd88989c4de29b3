//! Opening the Raspberry Pi peripherals through linux-embedded-hal.

use linux_embedded_hal::sysfs_gpio::Direction;
use linux_embedded_hal::{I2cdev, SysfsPin};

use crate::hardware::HardwareError;

pub fn i2c_path(bus_id: u8) -> String {
    format!("/dev/i2c-{}", bus_id)
}

pub fn open_i2c(bus_id: u8) -> Result<I2cdev, HardwareError> {
    let path = i2c_path(bus_id);
    I2cdev::new(&path).map_err(|e| HardwareError::Bus(format!("opening {}: {}", path, e)))
}

fn export(number: u32, direction: Direction) -> Result<SysfsPin, HardwareError> {
    let pin = SysfsPin::new(u64::from(number));
    pin.export()
        .and_then(|_| pin.set_direction(direction))
        .map_err(|e| HardwareError::Gpio(format!("exporting GPIO {}: {}", number, e)))?;
    Ok(pin)
}

/// Exported output pin, driven high so an active-low load starts off.
pub fn output_pin(number: u32) -> Result<SysfsPin, HardwareError> {
    export(number, Direction::High)
}

pub fn input_pin(number: u32) -> Result<SysfsPin, HardwareError> {
    export(number, Direction::In)
}
