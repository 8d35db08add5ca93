//! Collaborators the core depends on but does not own: durable storage and
//! the certificate store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::errors::{Error, Result};
use crate::model::{
    CommandId, CommandUpdate, NewCommand, StationCertificate, StationId, StationRef,
    TelemetrySample,
};

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save_telemetry(&self, sample: &TelemetrySample) -> Result<()>;
    async fn create_command(&self, command: &NewCommand) -> Result<CommandId>;
    async fn update_command_status(&self, id: CommandId, update: &CommandUpdate) -> Result<()>;
    async fn get_active_stations(&self) -> Result<Vec<StationRef>>;
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_station_certificate(&self, station_id: StationId) -> Result<StationCertificate>;
}

#[derive(Default)]
struct MemoryState {
    stations: Vec<StationRef>,
    certificates: HashMap<StationId, StationCertificate>,
    telemetry: Vec<TelemetrySample>,
    commands: Vec<NewCommand>,
    updates: Vec<(CommandId, CommandUpdate)>,
    failing_telemetry: HashSet<StationId>,
    save_calls: usize,
}

/// Keeps everything in process memory. Backs the tests and local runs
/// without a database.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_station(&self, station: StationRef, certificate: Option<StationCertificate>) {
        let mut state = self.state.lock();
        if let Some(certificate) = certificate {
            state.certificates.insert(station.id, certificate);
        }
        state.stations.retain(|s| s.id != station.id);
        state.stations.push(station);
    }

    pub fn fail_telemetry_for(&self, station_id: StationId) {
        self.state.lock().failing_telemetry.insert(station_id);
    }

    pub fn telemetry(&self) -> Vec<TelemetrySample> {
        self.state.lock().telemetry.clone()
    }

    pub fn save_calls(&self) -> usize {
        self.state.lock().save_calls
    }

    pub fn commands(&self) -> Vec<NewCommand> {
        self.state.lock().commands.clone()
    }

    pub fn updates_for(&self, id: CommandId) -> Vec<CommandUpdate> {
        self.state
            .lock()
            .updates
            .iter()
            .filter(|(command_id, _)| *command_id == id)
            .map(|(_, update)| update.clone())
            .collect()
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn save_telemetry(&self, sample: &TelemetrySample) -> Result<()> {
        let mut state = self.state.lock();
        state.save_calls += 1;
        if state.failing_telemetry.contains(&sample.station_id) {
            return Err(Error::Validation(format!(
                "telemetry for station {} rejected",
                sample.station_id
            )));
        }
        state.telemetry.push(sample.clone());
        Ok(())
    }

    async fn create_command(&self, command: &NewCommand) -> Result<CommandId> {
        let mut state = self.state.lock();
        state.commands.push(command.clone());
        Ok(state.commands.len() as CommandId)
    }

    async fn update_command_status(&self, id: CommandId, update: &CommandUpdate) -> Result<()> {
        let mut state = self.state.lock();
        if id < 1 || id as usize > state.commands.len() {
            return Err(Error::NotFound(format!("command {}", id)));
        }
        state.updates.push((id, update.clone()));
        Ok(())
    }

    async fn get_active_stations(&self) -> Result<Vec<StationRef>> {
        Ok(self.state.lock().stations.clone())
    }
}

#[async_trait]
impl CredentialProvider for MemoryStore {
    async fn get_station_certificate(&self, station_id: StationId) -> Result<StationCertificate> {
        self.state
            .lock()
            .certificates
            .get(&station_id)
            .cloned()
            .ok_or_else(|| {
                Error::Credential(format!("no certificate on file for station {}", station_id))
            })
    }
}
