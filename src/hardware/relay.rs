//! Active-low heat relay on a GPIO output.
//!
//! The relay state is read back from the pin level.

use embedded_hal::digital::{InputPin, OutputPin};

use crate::hardware::{HardwareError, RelayPort};

pub struct GpioRelay<P> {
    pin: P,
}

impl<P: OutputPin + InputPin> GpioRelay<P> {
    pub fn new(pin: P) -> Self {
        GpioRelay { pin }
    }
}

fn gpio_err<E: core::fmt::Debug>(e: E) -> HardwareError {
    HardwareError::Gpio(format!("relay pin: {:?}", e))
}

impl<P: OutputPin + InputPin> RelayPort for GpioRelay<P> {
    fn on(&mut self) -> Result<(), HardwareError> {
        self.pin.set_low().map_err(gpio_err)
    }

    fn off(&mut self) -> Result<(), HardwareError> {
        self.pin.set_high().map_err(gpio_err)
    }

    fn is_on(&mut self) -> Result<bool, HardwareError> {
        self.pin.is_low().map_err(gpio_err)
    }
}
