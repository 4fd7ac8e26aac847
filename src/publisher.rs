//! ==============================================================================
//! publisher.rs - telemetry publisher
//! ==============================================================================
//!
//! purpose:
//!     samples the dht sensor and uploads each valid reading as a new content
//!     instance of the DATA container, once per upload interval.
//!
//! cycle:
//!     SAMPLE -> VALIDATE -> UPLOAD -> IDLE -> SAMPLE ...
//!
//!     - a failed or incomplete read is retried after `retry_delay` inside the
//!       same cycle; partial samples are never uploaded.
//!     - uploads are fire-and-forget: a rejected or failed create is logged
//!       and the cycle moves on.
//!
//! relationships:
//!     - uses: hal.rs (SensorDriver), repository.rs (Repository)
//!     - used by: main.rs
//!
//! ==============================================================================

use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::PublisherConfig;
use crate::domain::{ContainerPath, SensorSample};
use crate::hal::SensorDriver;
use crate::repository::{Repository, RepositoryError};

/// warn once the sensor has been failing for this many consecutive attempts
const WARN_AFTER_ATTEMPTS: u32 = 25;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("failed to encode sample: {0}")]
    Encode(#[from] serde_json::Error),
}

/// what an accepted upload reports back
#[derive(Debug, Clone, PartialEq)]
pub struct UploadReport {
    pub sample: SensorSample,
    pub resource_id: Option<String>,
}

pub struct TelemetryPublisher<R> {
    repository: R,
    sensor: Box<dyn SensorDriver>,
    path: ContainerPath,
    retry_delay: Duration,
    upload_interval: Duration,
    show_sensor_data: bool,
}

impl<R: Repository> TelemetryPublisher<R> {
    pub fn new(
        repository: R,
        sensor: Box<dyn SensorDriver>,
        config: &PublisherConfig,
        show_sensor_data: bool,
    ) -> Self {
        Self {
            repository,
            sensor,
            path: config.container_path(),
            retry_delay: config.retry_delay(),
            upload_interval: config.upload_interval(),
            show_sensor_data,
        }
    }

    /// read until the sensor yields a complete sample
    pub async fn sample(&mut self) -> SensorSample {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match self.sensor.read().await {
                Ok(raw) => match raw.validate() {
                    Some(sample) => return sample,
                    None => debug!("incomplete reading {:?}, retrying", raw),
                },
                Err(e) => debug!("sensor read failed: {}", e),
            }

            if attempts % WARN_AFTER_ATTEMPTS == 0 {
                warn!("no valid sensor reading after {} attempts", attempts);
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    /// create one content instance holding `sample`
    pub async fn upload(&self, sample: SensorSample) -> Result<UploadReport, PublishError> {
        let content = serde_json::to_string(&sample)?;
        let accepted = self.repository.create(&self.path, content).await?;
        Ok(UploadReport {
            sample,
            resource_id: accepted.resource_id,
        })
    }

    /// one SAMPLE -> VALIDATE -> UPLOAD pass
    pub async fn publish_once(&mut self) -> Result<UploadReport, PublishError> {
        let sample = self.sample().await;
        self.upload(sample).await
    }

    /// run until the task is dropped
    pub async fn run(&mut self) {
        info!("Publishing to {} every {:?}", self.path, self.upload_interval);
        loop {
            match self.publish_once().await {
                Ok(report) => {
                    if self.show_sensor_data {
                        info!(
                            "[OK] Temp: {:.1}°C | Humidity: {:.1}%",
                            report.sample.temperature, report.sample.humidity
                        );
                    } else {
                        info!("[OK] Uploaded sample");
                    }
                    debug!(
                        "created {:?} from sample taken at {}ms",
                        report.resource_id, report.sample.captured_at_ms
                    );
                }
                Err(PublishError::Repository(RepositoryError::Transient(e))) => {
                    warn!("upload failed: {}", e);
                }
                Err(PublishError::Repository(RepositoryError::Protocol { status, body })) => {
                    warn!("[WARN] {} - {}", status, body);
                }
                Err(PublishError::Repository(e @ RepositoryError::InvalidEnvelope(_))) => {
                    warn!("upload reply unusable: {}", e);
                }
                Err(PublishError::Encode(e)) => {
                    error!("could not encode sample: {}", e);
                }
            }

            tokio::time::sleep(self.upload_interval).await;
        }
    }

    /// release the sensor; safe to call more than once
    pub async fn release(&mut self) {
        self.sensor.release().await;
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RawReading, RepositoryEntry};
    use crate::hal::SensorError;
    use crate::repository::Accepted;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// replays scripted reads, then keeps returning the last good one
    struct ScriptedSensor {
        reads: VecDeque<Result<RawReading, SensorError>>,
        reads_made: Arc<Mutex<usize>>,
        released: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl SensorDriver for ScriptedSensor {
        async fn read(&mut self) -> Result<RawReading, SensorError> {
            *self.reads_made.lock().unwrap() += 1;
            self.reads
                .pop_front()
                .unwrap_or_else(|| Ok(RawReading::new(20.0, 40.0)))
        }

        async fn release(&mut self) {
            *self.released.lock().unwrap() += 1;
        }
    }

    #[derive(Clone, Default)]
    struct RecordingRepository {
        created: Arc<Mutex<Vec<(ContainerPath, String)>>>,
        reject_with: Option<u16>,
    }

    #[async_trait]
    impl Repository for RecordingRepository {
        async fn create(&self, path: &ContainerPath, content: String) -> Result<Accepted, RepositoryError> {
            self.created.lock().unwrap().push((path.clone(), content));
            match self.reject_with {
                Some(status) => Err(RepositoryError::Protocol {
                    status,
                    body: "rejected".to_string(),
                }),
                None => Ok(Accepted {
                    resource_id: Some("4-001".to_string()),
                }),
            }
        }

        async fn fetch_latest(&self, _: &ContainerPath) -> Result<Option<RepositoryEntry>, RepositoryError> {
            Ok(None)
        }
    }

    struct Harness {
        publisher: TelemetryPublisher<RecordingRepository>,
        created: Arc<Mutex<Vec<(ContainerPath, String)>>>,
        reads_made: Arc<Mutex<usize>>,
        released: Arc<Mutex<usize>>,
    }

    fn harness(reads: Vec<Result<RawReading, SensorError>>, reject_with: Option<u16>) -> Harness {
        let repository = RecordingRepository {
            reject_with,
            ..Default::default()
        };
        let created = repository.created.clone();
        let reads_made = Arc::new(Mutex::new(0));
        let released = Arc::new(Mutex::new(0));
        let sensor = ScriptedSensor {
            reads: reads.into(),
            reads_made: reads_made.clone(),
            released: released.clone(),
        };
        let config = PublisherConfig {
            retry_delay_ms: 1,
            ..Default::default()
        };
        Harness {
            publisher: TelemetryPublisher::new(repository, Box::new(sensor), &config, true),
            created,
            reads_made,
            released,
        }
    }

    #[tokio::test]
    async fn test_sample_end_to_end() {
        let mut h = harness(vec![Ok(RawReading::new(23.0, 55.0))], None);

        let report = h.publisher.publish_once().await.unwrap();
        assert_eq!(report.sample.temperature, 23.0);
        assert_eq!(report.sample.humidity, 55.0);
        assert_eq!(report.resource_id.as_deref(), Some("4-001"));

        let created = h.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, ContainerPath::new("DHT_AE", "DATA"));
        let content: Value = serde_json::from_str(&created[0].1).unwrap();
        assert_eq!(content, json!({"temp": 23.0, "hum": 55.0}));
    }

    #[tokio::test]
    async fn test_partial_samples_never_uploaded() {
        let mut h = harness(
            vec![
                Ok(RawReading { temperature: None, humidity: Some(55.0) }),
                Ok(RawReading { temperature: Some(23.0), humidity: None }),
                Ok(RawReading::new(21.5, 47.0)),
            ],
            None,
        );

        let report = h.publisher.publish_once().await.unwrap();
        assert_eq!(report.sample.temperature, 21.5);
        assert_eq!(*h.reads_made.lock().unwrap(), 3);

        let created = h.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        let content: Value = serde_json::from_str(&created[0].1).unwrap();
        assert_eq!(content, json!({"temp": 21.5, "hum": 47.0}));
    }

    #[tokio::test]
    async fn test_read_errors_retried_within_cycle() {
        let mut h = harness(
            vec![
                Err(SensorError::ReadFailed("Checksum did not validate".to_string())),
                Err(SensorError::Unavailable("helper exited".to_string())),
                Ok(RawReading::new(19.0, 60.0)),
            ],
            None,
        );

        let report = h.publisher.publish_once().await.unwrap();
        assert_eq!(report.sample.humidity, 60.0);
        assert_eq!(*h.reads_made.lock().unwrap(), 3);
        assert_eq!(h.created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_upload_not_retried() {
        let mut h = harness(vec![Ok(RawReading::new(23.0, 55.0))], Some(403));

        match h.publisher.publish_once().await {
            Err(PublishError::Repository(RepositoryError::Protocol { status, .. })) => assert_eq!(status, 403),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(h.created.lock().unwrap().len(), 1);
        assert_eq!(*h.reads_made.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_release_reaches_sensor() {
        let mut h = harness(vec![], None);
        h.publisher.release().await;
        h.publisher.release().await;
        assert_eq!(*h.released.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_run_uploads_on_cadence() {
        let mut h = harness(vec![], None);
        h.publisher.upload_interval = Duration::from_millis(10);

        let _ = tokio::time::timeout(Duration::from_millis(100), h.publisher.run()).await;
        assert!(h.created.lock().unwrap().len() >= 2);
    }
}
