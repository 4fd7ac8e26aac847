//! ==============================================================================
//! poller.rs - command poller
//! ==============================================================================
//!
//! purpose:
//!     polls the latest content instance of the CMD container and drives the
//!     actuator once per genuinely new instance.
//!
//! cycle:
//!     BASELINE (once) -> POLL -> (IDLE | DECODE -> ACTUATE) -> POLL ...
//!
//! duplicate suppression:
//!     the repository only answers "what is the latest instance", so the
//!     poller remembers the `ri` of the last instance it handled. an instance
//!     is new iff its `ri` differs from that marker. the marker
//!       - is seeded at startup from whatever is latest, without acting on it;
//!       - advances before decoding, so a bad payload is seen exactly once;
//!       - lives only in this struct and is never persisted.
//!
//! relationships:
//!     - uses: hal.rs (ActuatorDriver), repository.rs (Repository), domain.rs (decode_command)
//!     - used by: main.rs
//!
//! ==============================================================================

use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::PollerConfig;
use crate::domain::{decode_command, Action, ContainerPath, PayloadError};
use crate::hal::ActuatorDriver;
use crate::repository::{Repository, RepositoryError};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// the entry was new but its content could not be turned into a command
    #[error("entry {resource_id}: {source}")]
    Payload {
        resource_id: String,
        #[source]
        source: PayloadError,
    },

    #[error("actuator failed: {0:#}")]
    Actuator(anyhow::Error),
}

/// what one poll cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// the container has no content instance
    NoEntry,
    /// latest instance has no `ri` or was already handled
    AlreadySeen,
    /// a new instance was decoded and applied
    Actuated { resource_id: String, state: Action },
}

pub struct CommandPoller<R> {
    repository: R,
    actuator: Box<dyn ActuatorDriver>,
    path: ContainerPath,
    command_field: String,
    poll_interval: Duration,
    last_seen: Option<String>,
    state: Action,
}

impl<R: Repository> CommandPoller<R> {
    /// takes ownership of the actuator and drives it OFF
    pub fn new(
        repository: R,
        mut actuator: Box<dyn ActuatorDriver>,
        config: &PollerConfig,
    ) -> anyhow::Result<Self> {
        actuator.initialize()?;
        info!("Initial state: {} (existing commands are ignored)", Action::Off);
        Ok(Self {
            repository,
            actuator,
            path: config.container_path(),
            command_field: config.command_field.clone(),
            poll_interval: config.poll_interval(),
            last_seen: None,
            state: Action::Off,
        })
    }

    /// `ri` of the last instance handled, if any
    pub fn last_seen(&self) -> Option<&str> {
        self.last_seen.as_deref()
    }

    pub fn state(&self) -> Action {
        self.state
    }

    /// record whatever is latest right now without acting on it
    pub async fn baseline(&mut self) {
        match self.repository.fetch_latest(&self.path).await {
            Ok(Some(entry)) => {
                self.last_seen = entry.resource_id;
                info!("Baseline ri: {:?}", self.last_seen);
            }
            Ok(None) => info!("Baseline: {} is empty", self.path),
            Err(e) => warn!("Baseline fetch failed, next entry will count as new: {}", e),
        }
    }

    /// one POLL -> DECODE -> ACTUATE pass
    pub async fn poll_once(&mut self) -> Result<CycleOutcome, CycleError> {
        let Some(entry) = self.repository.fetch_latest(&self.path).await? else {
            return Ok(CycleOutcome::NoEntry);
        };

        let resource_id = match entry.resource_id {
            Some(ri) if self.last_seen.as_deref() != Some(ri.as_str()) => ri,
            _ => return Ok(CycleOutcome::AlreadySeen),
        };

        // any differing ri counts as new, even if it sorts before the marker
        debug!("new entry {} (previous {:?})", resource_id, self.last_seen);
        self.last_seen = Some(resource_id.clone());

        let content = entry.content.unwrap_or_default();
        let state = decode_command(&content, &self.command_field).map_err(|source| CycleError::Payload {
            resource_id: resource_id.clone(),
            source,
        })?;

        self.actuator.set_state(state).map_err(CycleError::Actuator)?;
        self.state = state;
        Ok(CycleOutcome::Actuated { resource_id, state })
    }

    /// baseline, then poll until the task is dropped
    pub async fn run(&mut self) {
        self.baseline().await;
        info!("Polling {} every {:?} (new entries only)", self.path, self.poll_interval);

        loop {
            match self.poll_once().await {
                Ok(CycleOutcome::Actuated { resource_id, state }) => {
                    info!("NEW {} command {} -> {}", self.command_field, resource_id, state);
                }
                Ok(CycleOutcome::NoEntry) | Ok(CycleOutcome::AlreadySeen) => {}
                Err(CycleError::Repository(RepositoryError::Transient(e))) => {
                    warn!("poll failed: {}", e);
                }
                Err(CycleError::Repository(RepositoryError::Protocol { status, body })) => {
                    warn!("GET la failed: {} {}", status, body);
                }
                Err(CycleError::Repository(e @ RepositoryError::InvalidEnvelope(_))) => {
                    warn!("GET la unusable: {}", e);
                }
                Err(e @ CycleError::Payload { .. }) => {
                    warn!("{}", e);
                }
                Err(e @ CycleError::Actuator(_)) => {
                    error!("{}", e);
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
