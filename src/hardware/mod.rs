//! Ports to the physical thermostat: temperature sensor, heat relay and the
//! front-panel buttons.

pub mod buttons;
pub mod linux;
pub mod mpl115;
pub mod relay;
pub mod simulated;

use std::fmt::{self, Display, Formatter};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HardwareError {
    /// Communication with a bus device failed.
    #[error("bus error: {0}")]
    Bus(String),
    /// Reading or driving a GPIO line failed.
    #[error("gpio error: {0}")]
    Gpio(String),
    /// The device was used before it was set up.
    #[error("{0} not initialized")]
    NotInitialized(&'static str),
}

/// Front-panel button identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Button {
    OnOff,
    Up,
    Down,
}

impl Button {
    pub const ALL: [Button; 3] = [Button::OnOff, Button::Up, Button::Down];
}

impl Display for Button {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Button::OnOff => write!(f, "on/off"),
            Button::Up => write!(f, "up"),
            Button::Down => write!(f, "down"),
        }
    }
}

pub trait SensorPort {
    /// Returns (temperature in degF, pressure in kPa).
    fn read(&mut self) -> Result<(f64, f64), HardwareError>;
}

pub trait RelayPort {
    fn on(&mut self) -> Result<(), HardwareError>;
    fn off(&mut self) -> Result<(), HardwareError>;
    fn is_on(&mut self) -> Result<bool, HardwareError>;

    /// Toggle the relay and return the new state.
    fn flip(&mut self) -> Result<bool, HardwareError> {
        if self.is_on()? {
            self.off()?;
            Ok(false)
        } else {
            self.on()?;
            Ok(true)
        }
    }
}

/// Callback run on the interrupt/watcher thread of a button.
pub type ButtonCallback = Box<dyn Fn() + Send + 'static>;

pub trait ButtonPort {
    fn register(&mut self, button: Button, callback: ButtonCallback) -> Result<(), HardwareError>;

    /// Release every registration.
    fn cleanup(&mut self);

    fn register_on_off(&mut self, callback: ButtonCallback) -> Result<(), HardwareError> {
        self.register(Button::OnOff, callback)
    }

    fn register_up(&mut self, callback: ButtonCallback) -> Result<(), HardwareError> {
        self.register(Button::Up, callback)
    }

    fn register_down(&mut self, callback: ButtonCallback) -> Result<(), HardwareError> {
        self.register(Button::Down, callback)
    }
}

impl<T: SensorPort + ?Sized> SensorPort for Box<T> {
    fn read(&mut self) -> Result<(f64, f64), HardwareError> {
        (**self).read()
    }
}

impl<T: RelayPort + ?Sized> RelayPort for Box<T> {
    fn on(&mut self) -> Result<(), HardwareError> {
        (**self).on()
    }

    fn off(&mut self) -> Result<(), HardwareError> {
        (**self).off()
    }

    fn is_on(&mut self) -> Result<bool, HardwareError> {
        (**self).is_on()
    }

    fn flip(&mut self) -> Result<bool, HardwareError> {
        (**self).flip()
    }
}

impl<T: ButtonPort + ?Sized> ButtonPort for Box<T> {
    fn register(&mut self, button: Button, callback: ButtonCallback) -> Result<(), HardwareError> {
        (**self).register(button, callback)
    }

    fn cleanup(&mut self) {
        (**self).cleanup()
    }
}
