//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer
//! ==============================================================================
//!
//! purpose:
//!     the two driver seams the loops depend on: a temperature/humidity
//!     sensor and a binary actuator. abstracts away the difference between
//!     running on a real Raspberry Pi (using `rppal`) and a development
//!     machine (using mocks).
//!
//! design philosophy:
//!     - "Compile Anywhere": builds on any host; `--features hardware` pulls in rppal.
//!     - "Single Owner": each driver is owned by exactly one loop, so no locking.
//!
//! relationships:
//!     - used by: publisher.rs (SensorDriver), poller.rs (ActuatorDriver), main.rs
//!     - uses: gpio.rs (python DHT helper), rppal (on feature="hardware")
//!
//! ==============================================================================

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::config::{ActuatorConfig, SensorConfig, SensorModel};
use crate::domain::{Action, RawReading};
use crate::gpio::DhtSensor;

/// every variant is transient from the publisher's point of view
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor helper unavailable: {0}")]
    Unavailable(String),

    #[error("sensor read failed: {0}")]
    ReadFailed(String),

    #[error("sensor io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sensor helper sent bad json: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait SensorDriver: Send {
    async fn read(&mut self) -> Result<RawReading, SensorError>;

    /// free the sensor; calling it twice is harmless
    async fn release(&mut self);
}

pub trait ActuatorDriver: Send {
    /// drive the output to OFF
    fn initialize(&mut self) -> Result<()> {
        self.set_state(Action::Off)
    }

    fn set_state(&mut self, state: Action) -> Result<()>;
}

/// build the sensor driver named in the config
pub fn open_sensor(config: &SensorConfig) -> Box<dyn SensorDriver> {
    match config.model {
        SensorModel::Mock => Box::new(MockSensor::default()),
        model => Box::new(DhtSensor::new(model, config.gpio_pin)),
    }
}

// ==============================================================================================
// MOCK SENSOR (selected by config, any build)
// ==============================================================================================

/// fixed reading, for running the publisher without a sensor attached
#[derive(Debug, Default)]
pub struct MockSensor {
    released: bool,
}

#[async_trait]
impl SensorDriver for MockSensor {
    async fn read(&mut self) -> Result<RawReading, SensorError> {
        if self.released {
            return Err(SensorError::Unavailable("released".to_string()));
        }
        tracing::debug!("[MOCK DHT] Reading");
        Ok(RawReading::new(25.0, 50.0))
    }

    async fn release(&mut self) {
        self.released = true;
    }
}

// ==============================================================================================
// MOCK IMPLEMENTATION (For WSL / Non-Hardware Build)
// ==============================================================================================
#[cfg(not(feature = "hardware"))]
pub struct Led {
    pin: u8,
    state: Option<Action>,
}

#[cfg(not(feature = "hardware"))]
impl Led {
    pub fn new(config: &ActuatorConfig) -> Result<Self> {
        tracing::info!(
            "Using MOCK LED on pin {} (active_low={}, No hardware access)",
            config.gpio_pin,
            config.active_low
        );
        Ok(Self { pin: config.gpio_pin, state: None })
    }
}

#[cfg(not(feature = "hardware"))]
impl ActuatorDriver for Led {
    fn set_state(&mut self, state: Action) -> Result<()> {
        tracing::debug!("[MOCK LED] Pin {} {:?} -> {}", self.pin, self.state, state);
        self.state = Some(state);
        Ok(())
    }
}

// ==============================================================================================
// REAL IMPLEMENTATION (For Raspberry Pi)
// ==============================================================================================
#[cfg(feature = "hardware")]
pub struct Led {
    pin: rppal::gpio::OutputPin,
    active_low: bool,
}

#[cfg(feature = "hardware")]
impl Led {
    pub fn new(config: &ActuatorConfig) -> Result<Self> {
        use rppal::gpio::Gpio;
        tracing::info!("Using REAL GPIO (rppal) on pin {}", config.gpio_pin);
        let pin = Gpio::new()?.get(config.gpio_pin)?.into_output();
        Ok(Self { pin, active_low: config.active_low })
    }
}

#[cfg(feature = "hardware")]
impl ActuatorDriver for Led {
    fn set_state(&mut self, state: Action) -> Result<()> {
        // active-low relay: LOW = relay ON
        let high = (state == Action::On) != self.active_low;
        if high {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        Ok(())
    }
}
