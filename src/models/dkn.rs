//! Models for the DKN Cloud NA REST API and realtime socket payloads.
//!
//! Notes
//! - Every device attribute is optional: realtime messages are sparse and carry only the
//!   attributes that changed.
//! - Unknown attribute names are ignored by serde's default behaviour.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =====================
// Scalar ID newtype wrappers
// =====================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstallationId(pub String);

/// Hardware address of a unit; the only identity the vendor uses for devices.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mac(pub String);

impl core::fmt::Display for InstallationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl core::fmt::Display for Mac {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

// =====================
// REST payloads
// =====================

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Installation {
    #[serde(rename = "_id")]
    pub id: InstallationId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub mac: Mac,
    #[serde(default)]
    pub name: Option<String>,
}

// =====================
// Realtime payloads
// =====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manufacturer {
    #[serde(rename = "_id", default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub text: Option<String>,
}

/// Last-known attribute values of one unit.
///
/// Field names follow the vendor's wire names so a property name used in a command is the
/// same string that appears in inbound `device-data` messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machineready: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aidooit: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emerheatpresent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emerheatstatus: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t1t2on: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_mode: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_temp_selec_sensor: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat_channel: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat_rssi: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat_ssid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<Manufacturer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode_available: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_available: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_state: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slats_autoud: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slats_swingud: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slats_vnum: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_sp_cool_air_max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_sp_cool_air_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_sp_hot_air_max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_sp_hot_air_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_sp_auto_air_max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_sp_auto_air_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_master_slave: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setpoint_step: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setpoint_air_cool: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setpoint_air_heat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setpoint_air_auto: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_value: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_ascii1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_ascii2: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tsensor_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_temp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "timezoneId", default, skip_serializing_if = "Option::is_none")]
    pub timezone_id: Option<String>,
    #[serde(rename = "isConnected", default, skip_serializing_if = "Option::is_none")]
    pub is_connected: Option<bool>,
}

macro_rules! merge_present_fields {
    ($dst:expr, $src:expr; $($field:ident),+ $(,)?) => {{
        let mut changed: Vec<&'static str> = Vec::new();
        $(
            if let Some(value) = $src.$field.as_ref()
                && $dst.$field.as_ref() != Some(value)
            {
                $dst.$field = Some(value.clone());
                changed.push(stringify!($field));
            }
        )+
        changed
    }};
}

impl DeviceData {
    /// Overwrite every attribute that is present in `update`; absent attributes keep their
    /// last value. Returns the names of the attributes whose value actually changed.
    pub fn merge(&mut self, update: &DeviceData) -> Vec<&'static str> {
        merge_present_fields!(self, update;
            machineready, version, aidooit, emerheatpresent, emerheatstatus, fallback,
            t1t2on, real_mode, work_temp_selec_sensor, stat_channel, stat_rssi, stat_ssid,
            manufacturer, power, mode, mode_available, speed_available, speed_state,
            slats_autoud, slats_swingud, slats_vnum, range_sp_cool_air_max,
            range_sp_cool_air_min, range_sp_hot_air_max, range_sp_hot_air_min,
            range_sp_auto_air_max, range_sp_auto_air_min, device_master_slave, master,
            setpoint_step, units, setpoint_air_cool, setpoint_air_heat, setpoint_air_auto,
            error_value, error_ascii1, error_ascii2, tsensor_error, work_temp, icon, name,
            timezone_id, is_connected,
        )
    }

    /// Build a single-attribute update from a wire property name, e.g. `("power", true)`.
    ///
    /// Returns `None` when the property is unknown or the value has the wrong shape.
    pub fn from_property(property: &str, value: Value) -> Option<DeviceData> {
        let mut object = serde_json::Map::with_capacity(1);
        object.insert(property.to_string(), value);
        let update: DeviceData = serde_json::from_value(Value::Object(object)).ok()?;
        if update == DeviceData::default() { None } else { Some(update) }
    }
}

/// Payload of the `device-data` realtime event.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceDataMessage {
    pub mac: Mac,
    #[serde(default)]
    pub data: DeviceData,
}

/// Payload of the `create-machine-event` command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineEvent {
    pub mac: Mac,
    pub property: String,
    pub value: String,
}
