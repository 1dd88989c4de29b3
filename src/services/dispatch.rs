//! Hand-off of button presses from watcher threads to the control loop.
//!
//! A button callback runs on its watcher thread and does nothing but send a
//! [`Command`] down the control loop's channel. The control loop executes the
//! press on its own thread through [`ButtonDispatcher::handle`], which is the
//! only place button presses touch the event log or the relay.

use log::{info, warn};
use std::sync::mpsc::Sender;

use crate::db::event_log::EventLog;
use crate::db::models::StateUpdate;
use crate::hardware::{Button, ButtonCallback, ButtonPort, HardwareError, RelayPort};
use crate::services::control::ControlError;

/// Work queued for the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Press(Button),
    Shutdown,
}

/// Button registrations that are released when dropped.
pub struct Registration<P: ButtonPort> {
    port: P,
}

impl<P: ButtonPort> Registration<P> {
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }
}

impl<P: ButtonPort> Drop for Registration<P> {
    fn drop(&mut self) {
        self.port.cleanup();
        info!("Released button registrations");
    }
}

#[derive(Debug, Clone)]
pub struct ButtonDispatcher {
    increment: f64,
}

impl ButtonDispatcher {
    pub fn new(increment: f64) -> Self {
        ButtonDispatcher { increment }
    }

    /// Wire every button on `port` to enqueue its press on `commands`.
    pub fn register<P: ButtonPort>(&self, mut port: P, commands: &Sender<Command>) -> Result<Registration<P>, HardwareError> {
        for button in Button::ALL {
            let tx = commands.clone();
            let callback: ButtonCallback = Box::new(move || {
                // A closed channel means the control loop is gone.
                let _ = tx.send(Command::Press(button));
            });
            let registered = match button {
                Button::OnOff => port.register_on_off(callback),
                Button::Up => port.register_up(callback),
                Button::Down => port.register_down(callback),
            };
            if let Err(e) = registered {
                port.cleanup();
                return Err(e);
            }
        }
        Ok(Registration { port })
    }

    /// Apply one press. Must run on the control loop's thread.
    pub fn handle<L: EventLog, R: RelayPort>(&self, button: Button, log: &mut L, relay: &mut R) -> Result<(), ControlError> {
        if log.latest_state()?.is_none() {
            warn!("Ignoring {} button: no target configured", button);
            return Ok(());
        }
        match button {
            Button::OnOff => self.on_off(log, relay),
            Button::Up => self.adjust(log, self.increment),
            Button::Down => self.adjust(log, -self.increment),
        }
    }

    fn on_off<L: EventLog, R: RelayPort>(&self, log: &mut L, relay: &mut R) -> Result<(), ControlError> {
        if log.update_state(StateUpdate::SetPointEnabled(false))? {
            info!("Manual update to heater state; disabling set point.");
        }
        let heat_on = relay.flip().map_err(ControlError::Hardware)?;
        log.update_state(StateUpdate::HeatOn(heat_on))?;
        info!("New state: {}", log.require_latest_state()?);
        Ok(())
    }

    fn adjust<L: EventLog>(&self, log: &mut L, delta: f64) -> Result<(), ControlError> {
        let current = log.require_latest_state()?;
        let target = current.set_point + delta;
        log.update_state(StateUpdate::SetPoint(target))?;
        if log.update_state(StateUpdate::SetPointEnabled(true))? {
            info!("Temperature adjusted with set point disabled, enabling set point.");
        }
        info!("Set point {} -> {}", current.set_point, target);
        Ok(())
    }
}
