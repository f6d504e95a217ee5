//! SCD41 (CO2) and SHT40 (temperature, humidity) on a shared I2C bus

use embassy_time::{Delay, Duration, Timer};
use embedded_hal_async::i2c::I2c;
use epdclock_core::sensors::{EnvironmentReadings, EnvironmentSensor, SensorError};
use epdclock_core::tasks::{PollOutcome, poll_until};
use log::{error, info};
use scd41_embedded::r#async::Scd41Async;
use sht4x::Sht4xAsync;

/// A single-shot conversion takes five seconds.
const SINGLE_SHOT_MS: u64 = 5_000;
const DATA_READY_ATTEMPTS: u32 = 5;
const DATA_READY_INTERVAL: Duration = Duration::from_millis(1_000);

fn co2_read_failed(operation: &'static str) -> SensorError {
    SensorError::ReadFailed {
        sensor: "SCD41",
        operation,
        details: "I2C communication error",
    }
}

pub struct ClimateSensor<A, B> {
    co2: Scd41Async<A, Delay>,
    climate: Sht4xAsync<B, Delay>,
}

impl<A: I2c, B: I2c> ClimateSensor<A, B> {
    pub fn new(co2_i2c: A, climate_i2c: B) -> Self {
        Self {
            co2: Scd41Async::<A, Delay>::new(co2_i2c, Delay),
            climate: Sht4xAsync::<B, Delay>::new(climate_i2c),
        }
    }

    async fn measure_co2(&mut self) -> Result<u16, SensorError> {
        self.co2.measure_single_shot().await.map_err(|e| {
            error!("SCD41 single shot measurement failed: {:?}", e);
            co2_read_failed("start single shot measurement")
        })?;

        Timer::after_millis(SINGLE_SHOT_MS).await;

        let co2 = &mut self.co2;
        let ready = poll_until(DATA_READY_ATTEMPTS, DATA_READY_INTERVAL, async || {
            co2.data_ready()
                .await
                .map(|ready| ready.then_some(()))
                .map_err(|e| {
                    error!("SCD41 data_ready check failed: {:?}", e);
                    co2_read_failed("check data ready status")
                })
        })
        .await;
        match ready {
            PollOutcome::Ready(()) => {}
            PollOutcome::Error(e) => return Err(e),
            PollOutcome::TimedOut => {
                error!("SCD41 data not ready after {} attempts", DATA_READY_ATTEMPTS);
                return Err(SensorError::Timeout {
                    sensor: "SCD41",
                    operation: "wait for data ready status",
                });
            }
        }

        let measurement = self.co2.measurement().await.map_err(|e| {
            error!("SCD41 measurement read failed: {:?}", e);
            co2_read_failed("read CO2 measurement")
        })?;
        Ok(measurement.co2_ppm as u16)
    }
}

impl<A: I2c, B: I2c> EnvironmentSensor for ClimateSensor<A, B> {
    async fn begin(&mut self, wake_from_sleep: bool) -> Result<(), SensorError> {
        if wake_from_sleep {
            return Ok(());
        }

        // A sensor left in periodic mode by an earlier firmware rejects
        // configuration commands.
        let _ = self.co2.stop_periodic_measurement().await;
        Timer::after_millis(500).await;

        self.co2
            .set_automatic_self_calibration(true)
            .await
            .map_err(|e| {
                error!("SCD41 set_automatic_self_calibration failed: {:?}", e);
                SensorError::InitializationFailed {
                    sensor: "SCD41",
                    details: "Failed to enable automatic self-calibration",
                }
            })?;
        info!("SCD41: automatic self-calibration enabled");
        Ok(())
    }

    async fn measure(&mut self) -> Result<EnvironmentReadings, SensorError> {
        let co2_ppm = self.measure_co2().await?;

        let measurement = self
            .climate
            .measure(sht4x::Precision::High, &mut Delay)
            .await
            .map_err(|e| {
                error!("SHT40 measurement failed: {:?}", e);
                SensorError::ReadFailed {
                    sensor: "SHT40",
                    operation: "measure temperature/humidity",
                    details: "I2C communication error or sensor not responding",
                }
            })?;

        Ok(EnvironmentReadings {
            temperature_c: measurement.temperature_celsius().to_num::<f32>(),
            humidity_pct: measurement.humidity_percent().to_num::<f32>(),
            co2_ppm,
        })
    }
}
