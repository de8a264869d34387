use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::quantity::{Quantity, Unit};
use crate::types::{
    ControlMode, ControllerSettings, OutputFunction, OutputId, OutputSettings, ProfileStep,
    SensorId, Setpoint, StepKind, TempProfile,
};

/// Default cloud endpoint
pub const DEFAULT_API_HOST: &str = "api.thermolink.io";
pub const DEFAULT_API_PORT: u16 = 80;

/// Identifying header sent when the session opens its connection
pub const DEVICE_TYPE_HEADER: &str = "X-Device-Type";
pub const DEVICE_TYPE: &str = "thermolink-model-t";

/// The single wire envelope. Exactly one payload per variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ApiMessage {
    ActivationTokenRequest { device_id: String },
    ActivationTokenResponse { activation_token: String },
    AuthRequest { device_id: String, auth_token: String },
    AuthResponse { authenticated: bool },
    /// Pushed by the server once the user completes activation out-of-band
    ActivationNotification { auth_token: String },
    DeviceReport(DeviceReport),
    DeviceSettingsNotification(DeviceSettingsNotification),
    FirmwareUpdateCheckRequest { current_version: String },
    FirmwareUpdateCheckResponse(FirmwareUpdateCheck),
    FirmwareDownloadRequest { requested_version: String },
    FirmwareDownloadResponse(FirmwareChunk),
}

impl ApiMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ApiMessage::ActivationTokenRequest { .. } => "activation_token_request",
            ApiMessage::ActivationTokenResponse { .. } => "activation_token_response",
            ApiMessage::AuthRequest { .. } => "auth_request",
            ApiMessage::AuthResponse { .. } => "auth_response",
            ApiMessage::ActivationNotification { .. } => "activation_notification",
            ApiMessage::DeviceReport(_) => "device_report",
            ApiMessage::DeviceSettingsNotification(_) => "device_settings_notification",
            ApiMessage::FirmwareUpdateCheckRequest { .. } => "firmware_update_check_request",
            ApiMessage::FirmwareUpdateCheckResponse(_) => "firmware_update_check_response",
            ApiMessage::FirmwareDownloadRequest { .. } => "firmware_download_request",
            ApiMessage::FirmwareDownloadResponse(_) => "firmware_download_response",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReport {
    pub sensor_id: SensorId,
    pub value: Quantity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReport {
    pub device_id: String,
    pub sensor_reports: Vec<SensorReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetpointType {
    Static,
    TempProfile,
}

/// Per-sensor controller settings as carried on the wire. Only the value
/// field matching `setpoint_type` is expected to be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireControllerSettings {
    pub sensor_id: SensorId,
    pub setpoint_type: SetpointType,
    pub static_setpoint: Option<Quantity>,
    pub temp_profile_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireOutputSettings {
    pub output_id: OutputId,
    pub enabled: bool,
    pub function: OutputFunction,
    pub control_mode: ControlMode,
    /// Minutes
    pub cycle_delay: f32,
    pub trigger_sensor_id: SensorId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireStepType {
    Hold,
    Ramp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireProfileStep {
    /// Seconds
    pub duration: u32,
    pub value: f32,
    pub step_type: WireStepType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTempProfile {
    pub id: u32,
    pub name: String,
    /// Unit of `start_value` and of every step value
    pub temp_unit: Unit,
    pub start_value: f32,
    pub steps: Vec<WireProfileStep>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettingsNotification {
    pub device_id: String,
    pub sensor_settings: Vec<WireControllerSettings>,
    pub output_settings: Vec<WireOutputSettings>,
    pub temp_profiles: Vec<WireTempProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareUpdateCheck {
    pub update_available: bool,
    pub version: String,
    pub binary_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareChunk {
    pub offset: u32,
    pub data: Vec<u8>,
}

/// A tagged setpoint arrived without the field its tag requires
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("sensor {0}: static setpoint without a value")]
    MissingStaticSetpoint(SensorId),
    #[error("sensor {0}: profile setpoint without a profile id")]
    MissingProfileId(SensorId),
}

impl TryFrom<&WireControllerSettings> for ControllerSettings {
    type Error = SettingsError;

    fn try_from(wire: &WireControllerSettings) -> Result<Self, Self::Error> {
        let setpoint = match wire.setpoint_type {
            SetpointType::Static => Setpoint::Static(
                wire.static_setpoint
                    .ok_or(SettingsError::MissingStaticSetpoint(wire.sensor_id))?,
            ),
            SetpointType::TempProfile => Setpoint::Profile(
                wire.temp_profile_id
                    .ok_or(SettingsError::MissingProfileId(wire.sensor_id))?,
            ),
        };

        Ok(ControllerSettings {
            sensor_id: wire.sensor_id,
            setpoint,
        })
    }
}

impl From<&ControllerSettings> for WireControllerSettings {
    fn from(settings: &ControllerSettings) -> Self {
        match settings.setpoint {
            Setpoint::Static(value) => WireControllerSettings {
                sensor_id: settings.sensor_id,
                setpoint_type: SetpointType::Static,
                static_setpoint: Some(value),
                temp_profile_id: None,
            },
            Setpoint::Profile(id) => WireControllerSettings {
                sensor_id: settings.sensor_id,
                setpoint_type: SetpointType::TempProfile,
                static_setpoint: None,
                temp_profile_id: Some(id),
            },
        }
    }
}

impl From<&WireOutputSettings> for OutputSettings {
    fn from(wire: &WireOutputSettings) -> Self {
        OutputSettings {
            output_id: wire.output_id,
            enabled: wire.enabled,
            function: wire.function,
            control_mode: wire.control_mode,
            cycle_delay: Quantity::new(wire.cycle_delay, Unit::TimeMin),
            trigger_sensor_id: wire.trigger_sensor_id,
        }
    }
}

impl From<&OutputSettings> for WireOutputSettings {
    fn from(settings: &OutputSettings) -> Self {
        // Stored settings may carry any time unit; the wire is always minutes.
        let cycle_delay = settings
            .cycle_delay
            .convert(Unit::TimeMin)
            .map_or(settings.cycle_delay.value, |q| q.value);

        WireOutputSettings {
            output_id: settings.output_id,
            enabled: settings.enabled,
            function: settings.function,
            control_mode: settings.control_mode,
            cycle_delay,
            trigger_sensor_id: settings.trigger_sensor_id,
        }
    }
}

impl From<WireStepType> for StepKind {
    fn from(step_type: WireStepType) -> Self {
        match step_type {
            WireStepType::Hold => StepKind::Hold,
            WireStepType::Ramp => StepKind::Ramp,
        }
    }
}

impl From<&WireTempProfile> for TempProfile {
    fn from(wire: &WireTempProfile) -> Self {
        let steps = wire
            .steps
            .iter()
            .map(|step| ProfileStep {
                duration: Quantity::new(step.duration as f32, Unit::TimeSec),
                value: Quantity::new(step.value, wire.temp_unit),
                kind: step.step_type.into(),
            })
            .collect();

        TempProfile {
            id: wire.id,
            name: wire.name.clone(),
            start_value: Quantity::new(wire.start_value, wire.temp_unit),
            steps,
        }
    }
}
