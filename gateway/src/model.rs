use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::errors::{Error, Result};

pub type StationId = i64;
pub type OrganizationId = i64;
pub type UserId = i64;
pub type CommandId = i64;

/// Station record handed out by the persistence layer for onboarding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StationRef {
    pub id: StationId,
    pub serial_code: String,
    pub organization_id: Option<OrganizationId>,
}

/// PEM material for one station's mutual TLS session.
#[derive(Clone, PartialEq, Eq)]
pub struct StationCertificate {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub root_ca_pem: Vec<u8>,
}

impl fmt::Debug for StationCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StationCertificate")
            .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
            .field("key_pem", &"<redacted>")
            .field("root_ca_pem", &format_args!("{} bytes", self.root_ca_pem.len()))
            .finish()
    }
}

impl StationCertificate {
    pub fn validate(&self) -> Result<()> {
        for (name, pem) in [
            ("client certificate", &self.cert_pem),
            ("private key", &self.key_pem),
            ("root CA", &self.root_ca_pem),
        ] {
            if pem.is_empty() {
                return Err(Error::Credential(format!("{} is empty", name)));
            }
            if !pem.starts_with(b"-----BEGIN") {
                return Err(Error::Credential(format!("{} is not PEM encoded", name)));
            }
        }
        Ok(())
    }
}

/// Everything a station link needs to open its session. Never mutated once
/// built; rotating certificates means building a new one.
#[derive(Debug, Clone)]
pub struct StationCredentials {
    pub station_id: StationId,
    pub serial_code: String,
    pub organization_id: Option<OrganizationId>,
    pub certificate: StationCertificate,
    pub client_id: String,
}

impl StationCredentials {
    pub fn new(station: &StationRef, certificate: StationCertificate) -> Result<Self> {
        if station.serial_code.trim().is_empty() {
            return Err(Error::Credential(format!(
                "station {} has no serial code",
                station.id
            )));
        }
        certificate.validate()?;

        Ok(Self {
            station_id: station.id,
            serial_code: station.serial_code.clone(),
            organization_id: station.organization_id,
            certificate,
            client_id: client_id_for(&station.serial_code),
        })
    }
}

pub fn client_id_for(serial_code: &str) -> String {
    format!("station-{}", serial_code)
}

/// Inbound message body. `Raw` marks a body that was not valid JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "body", rename_all = "lowercase")]
pub enum Payload {
    Json(Value),
    Raw(String),
}

impl Payload {
    pub fn parse(bytes: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Raw(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Raw(_) => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Payload::Raw(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    Sent,
    Executed,
    Failed,
    Timeout,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Executed | CommandStatus::Failed | CommandStatus::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Pending => "PENDING",
            CommandStatus::Sent => "SENT",
            CommandStatus::Executed => "EXECUTED",
            CommandStatus::Failed => "FAILED",
            CommandStatus::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    Activate,
    Deactivate,
    Reset,
    Update,
    Sync,
}

impl CommandType {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandType::Activate => "ACTIVATE",
            CommandType::Deactivate => "DEACTIVATE",
            CommandType::Reset => "RESET",
            CommandType::Update => "UPDATE",
            CommandType::Sync => "SYNC",
        }
    }

    /// Reads the `command` field of a command payload.
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let name = payload
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::Validation("command payload must carry a string `command` field".into())
            })?;
        name.parse()
    }
}

impl FromStr for CommandType {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "activate" => Ok(CommandType::Activate),
            "deactivate" => Ok(CommandType::Deactivate),
            "reset" => Ok(CommandType::Reset),
            "update" => Ok(CommandType::Update),
            "sync" => Ok(CommandType::Sync),
            other => Err(Error::Validation(format!("unknown command `{}`", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: CommandId,
    pub station_id: StationId,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub payload: Value,
    pub status: CommandStatus,
    pub issued_by: UserId,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub response: Option<Value>,
    /// Delivery attempt the current watchdog belongs to.
    #[serde(skip)]
    pub attempt: u64,
}

/// Row written by `Persistence::create_command`.
#[derive(Debug, Clone, Serialize)]
pub struct NewCommand {
    pub station_id: StationId,
    pub command_type: CommandType,
    pub payload: Value,
    pub issued_by: UserId,
    pub created_at: DateTime<Utc>,
}

/// Fields changed by one status transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandUpdate {
    pub status: CommandStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub response: Option<Value>,
}

impl From<&Command> for CommandUpdate {
    fn from(command: &Command) -> Self {
        Self {
            status: command.status,
            sent_at: command.sent_at,
            executed_at: command.executed_at,
            response: command.response.clone(),
        }
    }
}

/// One weather reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    pub station_id: StationId,
    pub recorded_at: DateTime<Utc>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub heat_index: Option<f64>,
    pub wind_direction: Option<f64>,
    pub wind_speed: Option<f64>,
    pub precipitation: Option<f64>,
    pub uv_index: Option<f64>,
    pub distance: Option<f64>,
    pub light_intensity: Option<f64>,
}

/// Wire shape of a telemetry payload as stations publish it.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryPayload {
    #[serde(alias = "recorded_at", alias = "timestamp")]
    recorded_at: Option<DateTime<Utc>>,
    temperature: Option<f64>,
    humidity: Option<f64>,
    pressure: Option<f64>,
    #[serde(alias = "heat_index")]
    heat_index: Option<f64>,
    #[serde(alias = "wind_direction")]
    wind_direction: Option<f64>,
    #[serde(alias = "wind_speed")]
    wind_speed: Option<f64>,
    precipitation: Option<f64>,
    #[serde(alias = "uv_index")]
    uv_index: Option<f64>,
    distance: Option<f64>,
    #[serde(alias = "light_intensity")]
    light_intensity: Option<f64>,
}

impl TelemetrySample {
    pub fn empty(station_id: StationId, recorded_at: DateTime<Utc>) -> Self {
        Self {
            station_id,
            recorded_at,
            temperature: None,
            humidity: None,
            pressure: None,
            heat_index: None,
            wind_direction: None,
            wind_speed: None,
            precipitation: None,
            uv_index: None,
            distance: None,
            light_intensity: None,
        }
    }

    /// Builds a sample from an inbound payload, stamping it with `received_at`
    /// when the station did not send its own timestamp.
    pub fn from_payload(
        station_id: StationId,
        payload: &Payload,
        received_at: DateTime<Utc>,
    ) -> Result<Self> {
        let value = payload.as_json().ok_or_else(|| {
            Error::Validation("telemetry payload is not valid JSON".to_string())
        })?;
        if !value.is_object() {
            return Err(Error::Validation(
                "telemetry payload must be a JSON object".to_string(),
            ));
        }
        let wire: TelemetryPayload = serde_json::from_value(value.clone())?;

        let sample = Self {
            station_id,
            recorded_at: wire.recorded_at.unwrap_or(received_at),
            temperature: wire.temperature,
            humidity: wire.humidity,
            pressure: wire.pressure,
            heat_index: wire.heat_index,
            wind_direction: wire.wind_direction,
            wind_speed: wire.wind_speed,
            precipitation: wire.precipitation,
            uv_index: wire.uv_index,
            distance: wire.distance,
            light_intensity: wire.light_intensity,
        };

        if sample.fields().iter().all(|(_, value)| value.is_none()) {
            return Err(Error::Validation(
                "telemetry payload carries no known measurement".to_string(),
            ));
        }
        Ok(sample)
    }

    /// Measurements keyed by their wire name.
    pub fn fields(&self) -> [(&'static str, Option<f64>); 10] {
        [
            ("temperature", self.temperature),
            ("humidity", self.humidity),
            ("pressure", self.pressure),
            ("heatIndex", self.heat_index),
            ("windDirection", self.wind_direction),
            ("windSpeed", self.wind_speed),
            ("precipitation", self.precipitation),
            ("uvIndex", self.uv_index),
            ("distance", self.distance),
            ("lightIntensity", self.light_intensity),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessStatus {
    Online,
    Offline,
    Error,
}

impl fmt::Display for LivenessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LivenessStatus::Online => "online",
            LivenessStatus::Offline => "offline",
            LivenessStatus::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationLiveness {
    pub station_id: StationId,
    pub status: LivenessStatus,
    pub last_seen: DateTime<Utc>,
}
