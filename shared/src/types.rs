use std::net::Ipv4Addr;
use serde::{Serialize, Deserialize};
use crate::quantity::{Quantity, Unit};

pub type SensorId = u32;
pub type OutputId = u32;

/// Link manager state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    /// Reconnect requested, usually after a configuration change
    Connect,
    Connecting,
    ConnectFailed,
    WaitDhcp,
    Connected,
}

impl LinkState {
    /// States the idle tick collapses into a fresh initialize-and-connect
    pub fn needs_init(self) -> bool {
        matches!(self, LinkState::Disconnected | LinkState::Connect | LinkState::ConnectFailed)
    }
}

/// Snapshot of the wireless link, published by the link manager on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub state: LinkState,

    /// Only ever true while `state` is `Connected`
    pub dhcp_resolved: bool,

    pub ip_addr: String,
    pub subnet_mask: String,
    pub gateway: String,
    pub dhcp_server: String,
    pub dns_server: String,

    /// Colon separated, upper-case hex
    pub mac_addr: String,

    /// Radio firmware ("service pack") version as `major.build`
    pub radio_fw_version: String,

    pub scan_active: bool,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            state: LinkState::Disconnected,
            dhcp_resolved: false,
            ip_addr: String::new(),
            subnet_mask: String::new(),
            gateway: String::new(),
            dhcp_server: String::new(),
            dns_server: String::new(),
            mac_addr: String::new(),
            radio_fw_version: String::new(),
            scan_active: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    Unsecured,
    Wep,
    Wpa,
    Wpa2,
}

/// Static addressing. When absent the radio uses DHCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticIp {
    pub ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns_server: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetSettings {
    pub ssid: String,
    pub passphrase: String,
    pub security_mode: SecurityMode,
    #[serde(default)]
    pub static_ip: Option<StaticIp>,
}

impl Default for NetSettings {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            passphrase: String::new(),
            security_mode: SecurityMode::Wpa2,
            static_ip: None,
        }
    }
}

/// Cloud session state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    AwaitingNetConnection,
    Connect,
    Connecting,
    RequestingAuth,
    RequestingActivationToken,
    AwaitingActivation,
    Connected,
}

/// Published by the cloud session whenever its state changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Shown to the user while waiting for out-of-band activation
    pub activation_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub sensor_id: SensorId,
    pub value: Quantity,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Setpoint {
    Static(Quantity),
    /// Reference to a stored temperature profile
    Profile(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControllerSettings {
    pub sensor_id: SensorId,
    pub setpoint: Setpoint,
}

impl ControllerSettings {
    pub fn default_for(sensor_id: SensorId) -> Self {
        Self {
            sensor_id,
            setpoint: Setpoint::Static(Quantity::new(68.0, Unit::TempDegF)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFunction {
    Heating,
    Cooling,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    OnOff,
    Pid,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputSettings {
    pub output_id: OutputId,
    pub enabled: bool,
    pub function: OutputFunction,
    pub control_mode: ControlMode,
    pub cycle_delay: Quantity,
    pub trigger_sensor_id: SensorId,
}

impl OutputSettings {
    pub fn default_for(output_id: OutputId) -> Self {
        Self {
            output_id,
            enabled: false,
            function: OutputFunction::None,
            control_mode: ControlMode::OnOff,
            cycle_delay: Quantity::new(3.0, Unit::TimeMin),
            trigger_sensor_id: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Hold,
    Ramp,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfileStep {
    pub duration: Quantity,
    pub value: Quantity,
    pub kind: StepKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempProfile {
    pub id: u32,
    pub name: String,
    pub start_value: Quantity,
    pub steps: Vec<ProfileStep>,
}

/// Full command set handed to the control subsystem on restart
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlCommand {
    pub controllers: Vec<ControllerSettings>,
    pub outputs: Vec<OutputSettings>,
}
