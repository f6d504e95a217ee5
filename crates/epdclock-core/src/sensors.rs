//! Environment sensor interface
//!
//! The sensor driver lives with the hardware; the wake cycle only needs to
//! start it and take one measurement.

use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    #[error("{sensor} initialization failed: {details}")]
    InitializationFailed {
        sensor: &'static str,
        details: &'static str,
    },
    #[error("{sensor} {operation} failed: {details}")]
    ReadFailed {
        sensor: &'static str,
        operation: &'static str,
        details: &'static str,
    },
    #[error("{sensor} timed out during {operation}")]
    Timeout {
        sensor: &'static str,
        operation: &'static str,
    },
}

/// One measurement.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EnvironmentReadings {
    pub temperature_c: f32,
    pub humidity_pct: f32,
    pub co2_ppm: u16,
}

pub trait EnvironmentSensor {
    /// Prepare the sensor. `wake_from_sleep` is set when it was already
    /// configured during an earlier wake and only needs waking up.
    fn begin(&mut self, wake_from_sleep: bool) -> impl Future<Output = Result<(), SensorError>>;

    fn measure(&mut self) -> impl Future<Output = Result<EnvironmentReadings, SensorError>>;
}

/// A sensor whose bus could not be set up fails every call.
impl<S: EnvironmentSensor> EnvironmentSensor for Option<S> {
    async fn begin(&mut self, wake_from_sleep: bool) -> Result<(), SensorError> {
        match self {
            Some(sensor) => sensor.begin(wake_from_sleep).await,
            None => Err(SensorError::InitializationFailed {
                sensor: "environment",
                details: "bus unavailable",
            }),
        }
    }

    async fn measure(&mut self) -> Result<EnvironmentReadings, SensorError> {
        match self {
            Some(sensor) => sensor.measure().await,
            None => Err(SensorError::ReadFailed {
                sensor: "environment",
                operation: "measure",
                details: "bus unavailable",
            }),
        }
    }
}
