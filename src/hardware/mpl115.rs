//! MPL115A2 digital barometer and thermometer.
//!
//! The part stores four signed fixed-point compensation coefficients in its
//! register file. A reading starts a conversion, waits 3 ms, then combines the
//! 10-bit raw pressure and temperature with the coefficients.

use embedded_hal::i2c::I2c;
use std::thread;
use std::time::Duration;

use crate::hardware::{HardwareError, SensorPort};

pub const DEFAULT_ADDRESS: u8 = 0x60;

const REG_PADC_MSB: u8 = 0x00;
const REG_A0_MSB: u8 = 0x04;
const REG_B1_MSB: u8 = 0x06;
const REG_B2_MSB: u8 = 0x08;
const REG_C12_MSB: u8 = 0x0A;
const REG_CONVERT: u8 = 0x12;
const CONVERSION_TIME: Duration = Duration::from_millis(3);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coefficients {
    pub a0: f64,
    pub b1: f64,
    pub b2: f64,
    pub c12: f64,
}

impl Coefficients {
    /// Pressure in kPa and temperature in degC from raw 10-bit ADC counts.
    pub fn compensate(&self, raw_pressure: u16, raw_temp: u16) -> (f64, f64) {
        let padc = f64::from(raw_pressure);
        let tadc = f64::from(raw_temp);
        let pcomp = self.a0 + (self.b1 + self.c12 * tadc) * padc + self.b2 * tadc;
        let kpa = pcomp / 15.737 + 50.0;
        let celsius = 25.0 - (tadc - 498.0) / 5.35;
        (kpa, celsius)
    }
}

pub fn celsius_to_fahrenheit(c: f64) -> f64 {
    c * (9.0 / 5.0) + 32.0
}

/// Two-register big-endian two's complement value.
fn signed(msb: u8, lsb: u8) -> f64 {
    f64::from(i16::from_be_bytes([msb, lsb]))
}

/// 10-bit ADC value left-aligned across two registers.
fn adc10(msb: u8, lsb: u8) -> u16 {
    (u16::from(msb) << 2) | (u16::from(lsb) >> 6)
}

pub struct Mpl115<I2C> {
    bus: I2C,
    address: u8,
    calibration_f: f64,
}

impl<I2C: I2c> Mpl115<I2C> {
    pub fn new(bus: I2C, address: u8, calibration_f: f64) -> Self {
        Mpl115 {
            bus,
            address,
            calibration_f,
        }
    }

    fn read_byte(&mut self, register: u8) -> Result<u8, HardwareError> {
        let mut buf = [0u8; 1];
        self.bus
            .write_read(self.address, &[register], &mut buf)
            .map_err(|e| HardwareError::Bus(format!("mpl115 read of register {:#04x} failed: {:?}", register, e)))?;
        Ok(buf[0])
    }

    fn read_pair(&mut self, register: u8) -> Result<(u8, u8), HardwareError> {
        Ok((self.read_byte(register)?, self.read_byte(register + 1)?))
    }

    pub fn coefficients(&mut self) -> Result<Coefficients, HardwareError> {
        let (a0m, a0l) = self.read_pair(REG_A0_MSB)?;
        let (b1m, b1l) = self.read_pair(REG_B1_MSB)?;
        let (b2m, b2l) = self.read_pair(REG_B2_MSB)?;
        let (c12m, c12l) = self.read_pair(REG_C12_MSB)?;
        Ok(Coefficients {
            // 1 sign, 12 int, 3 frac
            a0: signed(a0m, a0l) / 8.0,
            // 1 sign, 2 int, 13 frac
            b1: signed(b1m, b1l) / 8192.0,
            // 1 sign, 1 int, 14 frac
            b2: signed(b2m, b2l) / 16384.0,
            c12: signed(c12m, c12l) / 16_777_216.0,
        })
    }

    /// Start a conversion and return (raw pressure, raw temperature).
    pub fn convert(&mut self) -> Result<(u16, u16), HardwareError> {
        self.bus
            .write(self.address, &[REG_CONVERT, 0x00])
            .map_err(|e| HardwareError::Bus(format!("mpl115 conversion start failed: {:?}", e)))?;
        thread::sleep(CONVERSION_TIME);
        let (pm, pl) = self.read_pair(REG_PADC_MSB)?;
        let (tm, tl) = self.read_pair(REG_PADC_MSB + 2)?;
        Ok((adc10(pm, pl), adc10(tm, tl)))
    }
}

impl<I2C: I2c> SensorPort for Mpl115<I2C> {
    fn read(&mut self) -> Result<(f64, f64), HardwareError> {
        let coefficients = self.coefficients()?;
        let (raw_pressure, raw_temp) = self.convert()?;
        let (kpa, celsius) = coefficients.compensate(raw_pressure, raw_temp);
        log::debug!(
            "mpl115 raw pres={} raw temp={} -> {:.2} kPa, {:.2} C",
            raw_pressure,
            raw_temp,
            kpa,
            celsius
        );
        Ok((celsius_to_fahrenheit(celsius) + self.calibration_f, kpa))
    }
}
