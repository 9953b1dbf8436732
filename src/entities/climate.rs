//! Climate entity for one DKN unit: translates platform HVAC concepts to the vendor's mode and
//! fan codes and back, and forwards user actions to the device proxy as commands.

use log::debug;
use serde::Serialize;
use std::sync::{Arc, Mutex};

use crate::bridge::device::{CommandValue, DeviceError, DeviceProxy, SubscriptionId, callback};
use crate::models::dkn::DeviceData;
use crate::utils::serde_enum_name;

pub const DEFAULT_MIN_TEMP: f64 = 7.0;
pub const DEFAULT_MAX_TEMP: f64 = 35.0;
pub const MANUFACTURER: &str = "Daikin";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacMode {
    Off,
    HeatCool,
    Cool,
    Heat,
    FanOnly,
    Dry,
}

impl HvacMode {
    pub const ALL: [HvacMode; 6] = [
        HvacMode::HeatCool,
        HvacMode::Cool,
        HvacMode::Heat,
        HvacMode::FanOnly,
        HvacMode::Dry,
        HvacMode::Off,
    ];

    /// Vendor mode for a powered-on mode; `Off` is expressed through `power` instead.
    pub fn to_dkn(self) -> Option<DknMode> {
        match self {
            HvacMode::Off => None,
            HvacMode::HeatCool => Some(DknMode::HeatCool),
            HvacMode::Cool => Some(DknMode::Cool),
            HvacMode::Heat => Some(DknMode::Heat),
            HvacMode::FanOnly => Some(DknMode::FanOnly),
            HvacMode::Dry => Some(DknMode::Dry),
        }
    }
}

/// The `mode` codes understood by the cloud.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum DknMode {
    HeatCool = 1,
    Cool = 2,
    Heat = 3,
    FanOnly = 4,
    Dry = 5,
}

impl DknMode {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(DknMode::HeatCool),
            2 => Some(DknMode::Cool),
            3 => Some(DknMode::Heat),
            4 => Some(DknMode::FanOnly),
            5 => Some(DknMode::Dry),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        self as u8 as i64
    }

    pub fn to_hvac(self) -> HvacMode {
        match self {
            DknMode::HeatCool => HvacMode::HeatCool,
            DknMode::Cool => HvacMode::Cool,
            DknMode::Heat => HvacMode::Heat,
            DknMode::FanOnly => HvacMode::FanOnly,
            DknMode::Dry => HvacMode::Dry,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FanMode {
    Auto,
    Low,
    Medium,
    High,
}

impl FanMode {
    pub const ALL: [FanMode; 4] = [FanMode::Auto, FanMode::Low, FanMode::Medium, FanMode::High];

    pub fn speed_code(self) -> i64 {
        match self {
            FanMode::Auto => 0,
            FanMode::Low => 2,
            FanMode::Medium => 4,
            FanMode::High => 6,
        }
    }

    pub fn from_speed_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(FanMode::Auto),
            2 => Some(FanMode::Low),
            4 => Some(FanMode::Medium),
            6 => Some(FanMode::High),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacAction {
    Off,
    Heating,
    Cooling,
    Idle,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum TemperatureUnit {
    #[serde(rename = "°C")]
    Celsius,
    #[serde(rename = "°F")]
    Fahrenheit,
}

#[derive(Debug, thiserror::Error)]
pub enum ClimateError {
    #[error("hvac mode '{0}' has no target temperature")]
    NoSetpoint(String),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Setpoint property and its range fields for the modes that carry a target temperature.
struct Setpoint {
    property: &'static str,
    value: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
}

fn setpoint(mode: HvacMode, data: &DeviceData) -> Option<Setpoint> {
    match mode {
        HvacMode::Cool => Some(Setpoint {
            property: "setpoint_air_cool",
            value: data.setpoint_air_cool,
            min: data.range_sp_cool_air_min,
            max: data.range_sp_cool_air_max,
        }),
        HvacMode::Heat => Some(Setpoint {
            property: "setpoint_air_heat",
            value: data.setpoint_air_heat,
            min: data.range_sp_hot_air_min,
            max: data.range_sp_hot_air_max,
        }),
        HvacMode::HeatCool => Some(Setpoint {
            property: "setpoint_air_auto",
            value: data.setpoint_air_auto,
            min: data.range_sp_auto_air_min,
            max: data.range_sp_auto_air_max,
        }),
        HvacMode::Off | HvacMode::FanOnly | HvacMode::Dry => None,
    }
}

fn is_on(data: &DeviceData) -> bool {
    data.power == Some(true)
}

pub fn hvac_mode(data: &DeviceData) -> Option<HvacMode> {
    if !is_on(data) {
        return Some(HvacMode::Off);
    }
    data.mode.and_then(DknMode::from_code).map(DknMode::to_hvac)
}

pub fn hvac_action(data: &DeviceData) -> HvacAction {
    if !is_on(data) {
        return HvacAction::Off;
    }
    match data.real_mode {
        Some(2) => HvacAction::Cooling,
        Some(3) => HvacAction::Heating,
        _ => HvacAction::Idle,
    }
}

/// Point-in-time view of the entity as the host sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClimateState {
    pub unique_id: String,
    pub name: String,
    pub available: bool,
    pub temperature_unit: TemperatureUnit,
    pub hvac_mode: Option<HvacMode>,
    pub hvac_action: HvacAction,
    pub current_temperature: Option<f64>,
    pub target_temperature: Option<f64>,
    pub min_temp: f64,
    pub max_temp: f64,
    pub fan_mode: Option<FanMode>,
}

impl ClimateState {
    pub fn from_data(unique_id: &str, name: &str, data: &DeviceData) -> Self {
        let mode = hvac_mode(data);
        let sp = mode.and_then(|m| setpoint(m, data));
        ClimateState {
            unique_id: unique_id.to_string(),
            name: name.to_string(),
            available: data.is_connected == Some(true) && data.machineready == Some(true),
            temperature_unit: if data.units == Some(1) {
                TemperatureUnit::Fahrenheit
            } else {
                TemperatureUnit::Celsius
            },
            hvac_mode: mode,
            hvac_action: hvac_action(data),
            current_temperature: data.work_temp,
            target_temperature: sp.as_ref().and_then(|s| s.value),
            min_temp: sp.as_ref().and_then(|s| s.min).unwrap_or(DEFAULT_MIN_TEMP),
            max_temp: sp.as_ref().and_then(|s| s.max).unwrap_or(DEFAULT_MAX_TEMP),
            fan_mode: data.speed_state.and_then(FanMode::from_speed_code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub identifier: String,
    pub name: String,
    pub manufacturer: &'static str,
    pub sw_version: Option<String>,
}

pub struct ClimateEntity {
    device: Arc<DeviceProxy>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl ClimateEntity {
    pub fn new(device: Arc<DeviceProxy>) -> Self {
        debug!("Created climate entity '{}':'{}'", device.mac(), device.name());
        ClimateEntity {
            device,
            subscription: Mutex::new(None),
        }
    }

    fn data(&self) -> DeviceData {
        self.device.state().unwrap_or_default()
    }

    pub fn unique_id(&self) -> String {
        self.device.mac().to_string()
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            identifier: self.unique_id(),
            name: self.device.name().to_string(),
            manufacturer: MANUFACTURER,
            sw_version: self.data().version,
        }
    }

    pub fn state(&self) -> ClimateState {
        ClimateState::from_data(&self.unique_id(), self.device.name(), &self.data())
    }

    pub fn available(&self) -> bool {
        self.state().available
    }

    pub fn temperature_unit(&self) -> TemperatureUnit {
        self.state().temperature_unit
    }

    pub fn hvac_mode(&self) -> Option<HvacMode> {
        hvac_mode(&self.data())
    }

    pub fn hvac_action(&self) -> HvacAction {
        hvac_action(&self.data())
    }

    pub fn current_temperature(&self) -> Option<f64> {
        self.data().work_temp
    }

    pub fn target_temperature(&self) -> Option<f64> {
        self.state().target_temperature
    }

    pub fn min_temp(&self) -> f64 {
        self.state().min_temp
    }

    pub fn max_temp(&self) -> f64 {
        self.state().max_temp
    }

    pub fn fan_mode(&self) -> Option<FanMode> {
        self.state().fan_mode
    }

    pub fn hvac_modes(&self) -> &'static [HvacMode] {
        &HvacMode::ALL
    }

    pub fn fan_modes(&self) -> &'static [FanMode] {
        &FanMode::ALL
    }

    /// Switch the unit to `mode`. Turning on sends the vendor mode before `power`; turning
    /// off only sends `power` and only when the unit is currently on.
    pub fn set_hvac_mode(&self, mode: HvacMode) -> Result<(), ClimateError> {
        let currently_on = is_on(&self.data());
        debug!(
            "Setting hvac mode of '{}' to {}",
            self.device.name(),
            serde_enum_name(&mode).unwrap_or_default()
        );
        match mode.to_dkn() {
            Some(dkn) => {
                self.device.send_command("mode", CommandValue::Int(dkn.code()))?;
                if !currently_on {
                    self.device.send_command("power", CommandValue::Bool(true))?;
                }
            }
            None if currently_on => self.device.send_command("power", CommandValue::Bool(false))?,
            None => {}
        }
        Ok(())
    }

    pub fn set_fan_mode(&self, fan: FanMode) -> Result<(), ClimateError> {
        self.device
            .send_command("speed_state", CommandValue::Int(fan.speed_code()))?;
        Ok(())
    }

    /// Forward a new target for the current mode; the value is not checked against the range.
    pub fn set_temperature(&self, temperature: f64) -> Result<(), ClimateError> {
        let data = self.data();
        let mode = hvac_mode(&data).unwrap_or(HvacMode::Off);
        let Some(sp) = setpoint(mode, &data) else {
            return Err(ClimateError::NoSetpoint(serde_enum_name(&mode).unwrap_or_default()));
        };
        self.device.send_command(sp.property, CommandValue::Float(temperature))?;
        Ok(())
    }

    /// Start pushing state to the host: `write_state` runs now and after every change.
    pub fn added_to_host<F>(&self, write_state: F)
    where
        F: Fn(&ClimateState) + Send + Sync + 'static,
    {
        let unique_id = self.unique_id();
        let name = self.device.name().to_string();
        let id = self.device.subscribe(callback(move |data| {
            write_state(&ClimateState::from_data(&unique_id, &name, data));
            Ok(())
        }));
        let previous = match self.subscription.lock() {
            Ok(mut slot) => slot.replace(id),
            Err(poisoned) => poisoned.into_inner().replace(id),
        };
        if let Some(previous) = previous {
            self.device.unsubscribe(previous);
        }
    }

    pub fn will_remove_from_host(&self) {
        let id = match self.subscription.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(id) = id {
            self.device.unsubscribe(id);
        }
    }
}
