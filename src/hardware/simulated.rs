//! Stand-in hardware for running the poller off-device.

use log::{info, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::hardware::{Button, ButtonCallback, ButtonPort, HardwareError, RelayPort, SensorPort};

const HEAT_RATE_F: f64 = 0.4;
const COOL_RATE_F: f64 = 0.25;
const NOISE_F: f64 = 0.1;
const PRESSURE_KPA: f64 = 101.3;

/// Relay backed by a flag shared with [`SimulatedSensor`].
#[derive(Debug, Clone, Default)]
pub struct SimulatedRelay {
    on: Arc<AtomicBool>,
}

impl SimulatedRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.on)
    }
}

impl RelayPort for SimulatedRelay {
    fn on(&mut self) -> Result<(), HardwareError> {
        self.on.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn off(&mut self) -> Result<(), HardwareError> {
        self.on.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_on(&mut self) -> Result<bool, HardwareError> {
        Ok(self.on.load(Ordering::SeqCst))
    }
}

/// Room temperature that climbs while the heat is on and decays otherwise.
pub struct SimulatedSensor {
    temp: f64,
    heat: Arc<AtomicBool>,
    rng: SmallRng,
}

impl SimulatedSensor {
    pub fn new(start_temp: f64, relay: &SimulatedRelay) -> Self {
        SimulatedSensor {
            temp: start_temp,
            heat: relay.handle(),
            rng: SmallRng::seed_from_u64(0x7E4D_0000_0072),
        }
    }
}

impl SensorPort for SimulatedSensor {
    fn read(&mut self) -> Result<(f64, f64), HardwareError> {
        let drift = if self.heat.load(Ordering::SeqCst) {
            HEAT_RATE_F
        } else {
            -COOL_RATE_F
        };
        self.temp += drift + self.rng.random_range(-NOISE_F..NOISE_F);
        let pressure = PRESSURE_KPA + self.rng.random_range(-0.5..0.5);
        Ok((self.temp, pressure))
    }
}

/// Buttons pressed by typing `up`, `down` or `onoff` on stdin.
#[derive(Default)]
pub struct StdinButtons {
    callbacks: Arc<Mutex<HashMap<Button, ButtonCallback>>>,
    reader_started: bool,
}

impl StdinButtons {
    pub fn new() -> Self {
        Self::default()
    }

    fn start_reader(&mut self) -> Result<(), HardwareError> {
        if self.reader_started {
            return Ok(());
        }
        let callbacks = Arc::clone(&self.callbacks);
        thread::Builder::new()
            .name("stdin-buttons".into())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    let Ok(line) = line else { break };
                    let button = match line.trim() {
                        "up" | "u" => Button::Up,
                        "down" | "d" => Button::Down,
                        "onoff" | "o" => Button::OnOff,
                        "" => continue,
                        other => {
                            warn!("Unknown button '{}'; expected up, down or onoff", other);
                            continue;
                        }
                    };
                    let Ok(registered) = callbacks.lock() else { break };
                    if let Some(callback) = registered.get(&button) {
                        callback();
                    }
                }
            })
            .map_err(|e| HardwareError::Gpio(format!("spawning stdin reader failed: {}", e)))?;
        self.reader_started = true;
        info!("Simulated buttons: type up, down or onoff and press enter");
        Ok(())
    }
}

impl ButtonPort for StdinButtons {
    fn register(&mut self, button: Button, callback: ButtonCallback) -> Result<(), HardwareError> {
        self.callbacks
            .lock()
            .map_err(|_| HardwareError::NotInitialized("simulated buttons"))?
            .insert(button, callback);
        self.start_reader()
    }

    fn cleanup(&mut self) {
        // The reader thread stays blocked on stdin; dropping the callbacks disarms it.
        if let Ok(mut registered) = self.callbacks.lock() {
            registered.clear();
        }
    }
}
