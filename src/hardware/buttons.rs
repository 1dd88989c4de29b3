//! Front-panel buttons on pulled-up GPIO inputs.
//!
//! Each registered button gets a watcher thread that samples its pin and
//! fires the callback on a falling edge. Edges arriving within the bounce
//! interval of the previous fire are dropped.

use embedded_hal::digital::InputPin;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::hardware::{Button, ButtonCallback, ButtonPort, HardwareError};

pub const DEFAULT_BOUNCE: Duration = Duration::from_millis(300);
const SAMPLE_PERIOD: Duration = Duration::from_millis(5);

/// Falling-edge detector with contact-bounce suppression.
#[derive(Debug)]
pub struct EdgeDetector {
    bounce: Duration,
    was_low: bool,
    last_fire: Option<Instant>,
}

impl EdgeDetector {
    pub fn new(bounce: Duration) -> Self {
        EdgeDetector {
            bounce,
            was_low: false,
            last_fire: None,
        }
    }

    /// Feed one sample; true when it is a falling edge outside the bounce window.
    pub fn update(&mut self, is_low: bool, now: Instant) -> bool {
        let falling = is_low && !self.was_low;
        self.was_low = is_low;
        if !falling {
            return false;
        }
        if let Some(last) = self.last_fire
            && now.duration_since(last) < self.bounce
        {
            return false;
        }
        self.last_fire = Some(now);
        true
    }
}

pub struct GpioButtons<P> {
    pins: HashMap<Button, P>,
    bounce: Duration,
    stop: Arc<AtomicBool>,
    watchers: Vec<JoinHandle<()>>,
}

impl<P: InputPin + Send + 'static> GpioButtons<P> {
    pub fn new(on_off: P, up: P, down: P, bounce: Duration) -> Self {
        let pins = HashMap::from([(Button::OnOff, on_off), (Button::Up, up), (Button::Down, down)]);
        GpioButtons {
            pins,
            bounce,
            stop: Arc::new(AtomicBool::new(false)),
            watchers: Vec::new(),
        }
    }
}

fn watch<P: InputPin>(button: Button, mut pin: P, bounce: Duration, stop: Arc<AtomicBool>, callback: ButtonCallback) {
    let mut detector = EdgeDetector::new(bounce);
    while !stop.load(Ordering::Relaxed) {
        match pin.is_low() {
            Ok(low) => {
                if detector.update(low, Instant::now()) {
                    debug!("Button {} pressed", button);
                    callback();
                }
            }
            Err(e) => {
                warn!("Button {} pin read failed: {:?}; stopping watcher", button, e);
                return;
            }
        }
        thread::sleep(SAMPLE_PERIOD);
    }
}

impl<P: InputPin + Send + 'static> ButtonPort for GpioButtons<P> {
    fn register(&mut self, button: Button, callback: ButtonCallback) -> Result<(), HardwareError> {
        let pin = self
            .pins
            .remove(&button)
            .ok_or_else(|| HardwareError::Gpio(format!("button {} already registered", button)))?;
        let bounce = self.bounce;
        let stop = Arc::clone(&self.stop);
        let handle = thread::Builder::new()
            .name(format!("button-{}", button))
            .spawn(move || watch(button, pin, bounce, stop, callback))
            .map_err(|e| HardwareError::Gpio(format!("spawning watcher for {} failed: {}", button, e)))?;
        self.watchers.push(handle);
        Ok(())
    }

    fn cleanup(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.watchers.drain(..) {
            let _ = handle.join();
        }
    }
}
