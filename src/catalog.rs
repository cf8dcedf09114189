//! Static field catalog.
//!
//! One descriptor table per openWB device type. A descriptor carries
//! everything needed to read a field from either transport (MQTT topic
//! template + simpleAPI aggregate key + normalizers) and, for writable
//! fields, everything needed to issue a command (write topic template,
//! simpleAPI command key, display→wire vocabularies). Tables are plain
//! `static` data; `Catalog::load` fail-fast validates them once at
//! startup so a bad template or an incoherent row can never surface as
//! a runtime parse surprise.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::normalize::{FieldValue, Normalizer, ScaleOp};
use crate::resolver;

/// openWB device types addressable over both transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Chargepoint,
    Counter,
    #[serde(alias = "bat")]
    Battery,
    Pv,
    Controller,
    Vehicle,
}

pub const ALL_DEVICE_TYPES: &[DeviceType] = &[
    DeviceType::Chargepoint,
    DeviceType::Counter,
    DeviceType::Battery,
    DeviceType::Pv,
    DeviceType::Controller,
    DeviceType::Vehicle,
];

impl DeviceType {
    /// Segment used in MQTT topics for this device type.
    pub fn wire_name(&self) -> &'static str {
        match self {
            DeviceType::Chargepoint => "chargepoint",
            DeviceType::Counter => "counter",
            DeviceType::Battery => "bat",
            DeviceType::Pv => "pv",
            DeviceType::Controller => "controller",
            DeviceType::Vehicle => "vehicle",
        }
    }

    /// simpleAPI query string for this device, or `None` when the type
    /// is not pollable over HTTP.
    pub fn api_query(&self, device_id: Option<u32>) -> Option<String> {
        let id = device_id.unwrap_or(0);
        match self {
            DeviceType::Chargepoint => Some(format!("?get_chargepoint_all={id}")),
            DeviceType::Counter => Some(format!("?get_counter={id}")),
            DeviceType::Battery => Some(format!("?get_battery={id}")),
            DeviceType::Pv => Some(format!("?get_pv={id}")),
            // The controller has no id; live values come raw.
            DeviceType::Controller => Some("?get_lastlivevaluesjson&raw=true".to_string()),
            DeviceType::Vehicle => None,
        }
    }

    /// Key under which the simpleAPI response nests this device's
    /// aggregate, or `None` when the response root is the aggregate.
    pub fn api_response_key(&self, device_id: Option<u32>) -> Option<String> {
        let id = device_id.unwrap_or(0);
        match self {
            DeviceType::Chargepoint => Some(format!("chargepoint_{id}")),
            DeviceType::Counter => Some(format!("counter_{id}")),
            DeviceType::Battery => Some(format!("battery_{id}")),
            DeviceType::Pv => Some(format!("pv_{id}")),
            DeviceType::Controller => None,
            DeviceType::Vehicle => None,
        }
    }
}

/// The value shape a descriptor promises for its snapshot entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Float,
    Bool,
    Text,
    Timestamp,
    /// Text drawn from a closed vocabulary (`value_map` is the wire→
    /// display direction, `command_map` display→wire).
    Enum,
}

/// One field of one device type.
#[derive(Debug, Clone, Copy)]
pub struct FieldDescriptor {
    /// Snapshot key, stable across transports.
    pub key: &'static str,
    pub label: &'static str,
    pub kind: FieldKind,
    pub unit: Option<&'static str>,
    /// MQTT topic template this field is read from.
    pub source: Option<&'static str>,
    /// Key inside the simpleAPI aggregate object.
    pub api_key: Option<&'static str>,
    pub normalizer: Normalizer,
    /// Override for the HTTP path when the MQTT normalizer digs into a
    /// JSON envelope that the aggregate already flattened.
    pub api_normalizer: Option<Normalizer>,
    /// Wire→display vocabulary for `FieldKind::Enum`.
    pub value_map: &'static [(&'static str, &'static str)],
    /// Display→wire vocabulary accepted by `set_value` over MQTT.
    pub command_map: &'static [(&'static str, &'static str)],
    /// Display→wire vocabulary for the simpleAPI write path, when it
    /// differs from `command_map` (e.g. locks take "1"/"0" over HTTP
    /// but "true"/"false" over MQTT).
    pub api_command_map: &'static [(&'static str, &'static str)],
    /// MQTT topic template commands are published to.
    pub write_topic: Option<&'static str>,
    /// Form key for simpleAPI writes.
    pub api_command_key: Option<&'static str>,
    /// Display→wire factor for numeric writes (e.g. kWh→Wh is 1000).
    pub write_scale: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub step: Option<f64>,
    /// Charging-current fields are additionally capped by the wallbox
    /// power class (11 kW → 16 A, 22 kW → 32 A).
    pub bounded_by_power: bool,
    /// Commands may also name a vehicle from the configured id→name
    /// directory, not just the generic "Vehicle N" vocabulary.
    pub uses_vehicle_directory: bool,
    pub diagnostic: bool,
}

impl FieldDescriptor {
    pub fn is_writable(&self) -> bool {
        self.write_topic.is_some() || self.api_command_key.is_some()
    }

    /// Effective normalizer for the HTTP aggregate path.
    pub fn api_normalizer(&self) -> Normalizer {
        self.api_normalizer.unwrap_or(self.normalizer)
    }
}

/// Apply the wire→display vocabulary; unmapped wire values pass
/// through unchanged so an unknown mode still shows up verbatim.
pub fn map_display(desc: &FieldDescriptor, value: FieldValue) -> FieldValue {
    if desc.value_map.is_empty() {
        return value;
    }
    if let FieldValue::Text(wire) = &value {
        for (from, to) in desc.value_map {
            if from == wire {
                return FieldValue::Text((*to).to_string());
            }
        }
    }
    value
}

const BASE: FieldDescriptor = FieldDescriptor {
    key: "",
    label: "",
    kind: FieldKind::Text,
    unit: None,
    source: None,
    api_key: None,
    normalizer: Normalizer::Raw,
    api_normalizer: None,
    value_map: &[],
    command_map: &[],
    api_command_map: &[],
    write_topic: None,
    api_command_key: None,
    write_scale: None,
    min: None,
    max: None,
    step: None,
    bounded_by_power: false,
    uses_vehicle_directory: false,
    diagnostic: false,
};

// ── Topic templates ──────────────────────────────────────────────────

/// Connected-vehicle config blob; also carries the charge template id
/// that binds the dynamic templates below.
pub const CONNECTED_VEHICLE_CONFIG: &str =
    "{mqtt_root}/{device_type}/{device_id}/get/connected_vehicle/config";
/// Charge template settings, addressable only once the template id is
/// known.
pub const CHARGE_TEMPLATE: &str = "{mqtt_root}/vehicle/template/charge_template/{charge_template_id}";
const CHARGE_TEMPLATE_SET: &str =
    "{mqtt_root}/set/vehicle/template/charge_template/{charge_template_id}";

const fn phase_float(
    key: &'static str,
    label: &'static str,
    unit: &'static str,
    source: &'static str,
    index: usize,
) -> FieldDescriptor {
    FieldDescriptor {
        key,
        label,
        kind: FieldKind::Float,
        unit: Some(unit),
        source: Some(source),
        normalizer: Normalizer::DelimitedFloat { index },
        ..BASE
    }
}

const fn energy_kwh(
    key: &'static str,
    label: &'static str,
    source: &'static str,
    api_key: &'static str,
) -> FieldDescriptor {
    FieldDescriptor {
        key,
        label,
        kind: FieldKind::Float,
        unit: Some("kWh"),
        source: Some(source),
        api_key: Some(api_key),
        normalizer: Normalizer::FloatScaled { factor: 1000.0, op: ScaleOp::Divide, digits: 3 },
        ..BASE
    }
}

const fn vehicle_name_slot(
    key: &'static str,
    label: &'static str,
    source: &'static str,
) -> FieldDescriptor {
    FieldDescriptor {
        key,
        label,
        kind: FieldKind::Text,
        source: Some(source),
        normalizer: Normalizer::Raw,
        diagnostic: true,
        ..BASE
    }
}

// ── Chargemode vocabulary ────────────────────────────────────────────

const CHARGEMODE_DISPLAY: &[(&str, &str)] = &[
    ("instant_charging", "Instant Charging"),
    ("instant", "Instant Charging"),
    ("pv_charging", "PV Charging"),
    ("pv", "PV Charging"),
    ("eco_charging", "ECO Charging"),
    ("eco", "ECO Charging"),
    ("scheduled_charging", "Target Charging"),
    ("target", "Target Charging"),
    ("stop", "Stop"),
    ("standby", "Standby"),
];

const CHARGEMODE_COMMAND: &[(&str, &str)] = &[
    ("Instant Charging", "instant"),
    ("PV Charging", "pv"),
    ("ECO Charging", "eco"),
    ("Target Charging", "target"),
    ("Stop", "stop"),
];

const LIMITATION_DISPLAY: &[(&str, &str)] =
    &[("none", "Keine"), ("soc", "SoC"), ("amount", "Energiemenge")];

const LIMITATION_COMMAND: &[(&str, &str)] =
    &[("Keine", "none"), ("SoC", "soc"), ("Energiemenge", "amount")];

const VEHICLE_DISPLAY: &[(&str, &str)] = &[
    ("0", "Vehicle 0"),
    ("1", "Vehicle 1"),
    ("2", "Vehicle 2"),
    ("3", "Vehicle 3"),
    ("4", "Vehicle 4"),
    ("5", "Vehicle 5"),
    ("6", "Vehicle 6"),
    ("7", "Vehicle 7"),
    ("8", "Vehicle 8"),
    ("9", "Vehicle 9"),
    ("10", "Vehicle 10"),
];

const VEHICLE_COMMAND: &[(&str, &str)] = &[
    ("Vehicle 0", "0"),
    ("Vehicle 1", "1"),
    ("Vehicle 2", "2"),
    ("Vehicle 3", "3"),
    ("Vehicle 4", "4"),
    ("Vehicle 5", "5"),
    ("Vehicle 6", "6"),
    ("Vehicle 7", "7"),
    ("Vehicle 8", "8"),
    ("Vehicle 9", "9"),
    ("Vehicle 10", "10"),
];

const LOCK_COMMAND: &[(&str, &str)] = &[("lock", "true"), ("unlock", "false")];
const LOCK_API_COMMAND: &[(&str, &str)] = &[("lock", "1"), ("unlock", "0")];

// ── Chargepoint ──────────────────────────────────────────────────────

static CHARGEPOINT_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor {
        key: "power",
        label: "Charging Power",
        kind: FieldKind::Float,
        unit: Some("W"),
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/power"),
        api_key: Some("power"),
        normalizer: Normalizer::Float,
        ..BASE
    },
    phase_float("current_l1", "Current (L1)", "A", "{mqtt_root}/{device_type}/{device_id}/get/currents", 0),
    phase_float("current_l2", "Current (L2)", "A", "{mqtt_root}/{device_type}/{device_id}/get/currents", 1),
    phase_float("current_l3", "Current (L3)", "A", "{mqtt_root}/{device_type}/{device_id}/get/currents", 2),
    phase_float("voltage_l1", "Voltage (L1)", "V", "{mqtt_root}/{device_type}/{device_id}/get/voltages", 0),
    phase_float("voltage_l2", "Voltage (L2)", "V", "{mqtt_root}/{device_type}/{device_id}/get/voltages", 1),
    phase_float("voltage_l3", "Voltage (L3)", "V", "{mqtt_root}/{device_type}/{device_id}/get/voltages", 2),
    phase_float("power_l1", "Power (L1)", "W", "{mqtt_root}/{device_type}/{device_id}/get/powers", 0),
    phase_float("power_l2", "Power (L2)", "W", "{mqtt_root}/{device_type}/{device_id}/get/powers", 1),
    phase_float("power_l3", "Power (L3)", "W", "{mqtt_root}/{device_type}/{device_id}/get/powers", 2),
    phase_float("power_factor_l1", "Power Factor (L1)", "%", "{mqtt_root}/{device_type}/{device_id}/get/power_factors", 0),
    phase_float("power_factor_l2", "Power Factor (L2)", "%", "{mqtt_root}/{device_type}/{device_id}/get/power_factors", 1),
    phase_float("power_factor_l3", "Power Factor (L3)", "%", "{mqtt_root}/{device_type}/{device_id}/get/power_factors", 2),
    FieldDescriptor {
        key: "frequency",
        label: "Frequency",
        kind: FieldKind::Float,
        unit: Some("Hz"),
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/frequency"),
        normalizer: Normalizer::Float,
        ..BASE
    },
    energy_kwh("imported", "Imported Energy", "{mqtt_root}/{device_type}/{device_id}/get/imported", "imported"),
    energy_kwh("exported", "Exported Energy", "{mqtt_root}/{device_type}/{device_id}/get/exported", "exported"),
    energy_kwh("daily_imported", "Imported Energy (Today)", "{mqtt_root}/{device_type}/{device_id}/get/daily_imported", "daily_imported"),
    energy_kwh("daily_exported", "Exported Energy (Today)", "{mqtt_root}/{device_type}/{device_id}/get/daily_exported", "daily_exported"),
    FieldDescriptor {
        key: "evse_current",
        label: "EVSE Current",
        kind: FieldKind::Float,
        unit: Some("A"),
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/evse_current"),
        normalizer: Normalizer::FloatScaled { factor: 1.0, op: ScaleOp::Divide, digits: 2 },
        diagnostic: true,
        ..BASE
    },
    FieldDescriptor {
        key: "phases_in_use",
        label: "Phases In Use",
        kind: FieldKind::Float,
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/phases_in_use"),
        api_key: Some("phases_in_use"),
        normalizer: Normalizer::Float,
        ..BASE
    },
    FieldDescriptor {
        key: "state_str",
        label: "Status",
        kind: FieldKind::Text,
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/state_str"),
        normalizer: Normalizer::DisplayString,
        ..BASE
    },
    FieldDescriptor {
        key: "fault_str",
        label: "Fault Description",
        kind: FieldKind::Text,
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/fault_str"),
        normalizer: Normalizer::DisplayString,
        diagnostic: true,
        ..BASE
    },
    FieldDescriptor {
        key: "rfid",
        label: "RFID Tag",
        kind: FieldKind::Text,
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/rfid"),
        normalizer: Normalizer::Raw,
        diagnostic: true,
        ..BASE
    },
    FieldDescriptor {
        key: "chargepoint_name",
        label: "Chargepoint Name",
        kind: FieldKind::Text,
        source: Some("{mqtt_root}/{device_type}/{device_id}/config"),
        api_key: Some("config_name"),
        normalizer: Normalizer::JsonText { key: "name" },
        api_normalizer: Some(Normalizer::Raw),
        diagnostic: true,
        ..BASE
    },
    FieldDescriptor {
        key: "vehicle_name",
        label: "Connected Vehicle",
        kind: FieldKind::Text,
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/connected_vehicle/info"),
        api_key: Some("vehicle_name"),
        normalizer: Normalizer::JsonText { key: "name" },
        api_normalizer: Some(Normalizer::Raw),
        ..BASE
    },
    FieldDescriptor {
        key: "vehicle_id",
        label: "Connected Vehicle Id",
        kind: FieldKind::Text,
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/connected_vehicle/info"),
        api_key: Some("vehicle_id"),
        normalizer: Normalizer::JsonText { key: "id" },
        api_normalizer: Some(Normalizer::Raw),
        diagnostic: true,
        ..BASE
    },
    FieldDescriptor {
        key: "charge_template",
        label: "Charge Template Id",
        kind: FieldKind::Text,
        source: Some(CONNECTED_VEHICLE_CONFIG),
        normalizer: Normalizer::JsonText { key: "charge_template" },
        diagnostic: true,
        ..BASE
    },
    FieldDescriptor {
        key: "soc",
        label: "Vehicle SoC",
        kind: FieldKind::Float,
        unit: Some("%"),
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/connected_vehicle/soc"),
        api_key: Some("soc"),
        normalizer: Normalizer::JsonFloat { key: "soc" },
        api_normalizer: Some(Normalizer::Float),
        ..BASE
    },
    FieldDescriptor {
        key: "soc_timestamp",
        label: "Vehicle SoC (Last Update)",
        kind: FieldKind::Timestamp,
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/connected_vehicle/soc"),
        api_key: Some("soc_timestamp"),
        normalizer: Normalizer::EpochFromJson { key: "timestamp" },
        api_normalizer: Some(Normalizer::EpochSeconds),
        diagnostic: true,
        ..BASE
    },
    FieldDescriptor {
        key: "range_charged",
        label: "Range Charged",
        kind: FieldKind::Float,
        unit: Some("km"),
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/connected_vehicle/info"),
        api_key: Some("range_charged"),
        normalizer: Normalizer::JsonFloat { key: "range_charged" },
        api_normalizer: Some(Normalizer::Float),
        ..BASE
    },
    FieldDescriptor {
        key: "plug_state",
        label: "Plug State",
        kind: FieldKind::Bool,
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/plug_state"),
        api_key: Some("plug_state"),
        normalizer: Normalizer::Bool,
        ..BASE
    },
    FieldDescriptor {
        key: "charge_state",
        label: "Charge State",
        kind: FieldKind::Bool,
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/charge_state"),
        api_key: Some("charge_state"),
        normalizer: Normalizer::Bool,
        ..BASE
    },
    FieldDescriptor {
        key: "fault_state",
        label: "Fault State",
        kind: FieldKind::Bool,
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/fault_state"),
        normalizer: Normalizer::Bool,
        diagnostic: true,
        ..BASE
    },
    // Writable fields. Read and write addresses live on one
    // descriptor so commands and state can never drift apart.
    FieldDescriptor {
        key: "chargemode",
        label: "Charge Mode",
        kind: FieldKind::Enum,
        source: Some(CONNECTED_VEHICLE_CONFIG),
        api_key: Some("chargemode"),
        normalizer: Normalizer::JsonText { key: "chargemode" },
        api_normalizer: Some(Normalizer::Raw),
        value_map: CHARGEMODE_DISPLAY,
        command_map: CHARGEMODE_COMMAND,
        write_topic: Some("{mqtt_root}/set/chargepoint/{device_id}/chargemode"),
        api_command_key: Some("set_chargemode"),
        ..BASE
    },
    FieldDescriptor {
        key: "connected_vehicle",
        label: "Vehicle",
        kind: FieldKind::Enum,
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/connected_vehicle/info"),
        api_key: Some("vehicle_id"),
        normalizer: Normalizer::JsonText { key: "id" },
        api_normalizer: Some(Normalizer::Raw),
        value_map: VEHICLE_DISPLAY,
        command_map: VEHICLE_COMMAND,
        write_topic: Some("{mqtt_root}/set/chargepoint/{device_id}/config/ev"),
        api_command_key: Some("vehicle"),
        uses_vehicle_directory: true,
        ..BASE
    },
    FieldDescriptor {
        key: "manual_lock",
        label: "Manual Lock",
        kind: FieldKind::Bool,
        source: Some("{mqtt_root}/{device_type}/{device_id}/set/manual_lock"),
        api_key: Some("manual_lock"),
        normalizer: Normalizer::Bool,
        command_map: LOCK_COMMAND,
        api_command_map: LOCK_API_COMMAND,
        write_topic: Some("{mqtt_root}/set/chargepoint/{device_id}/set/manual_lock"),
        api_command_key: Some("chargepoint_lock"),
        ..BASE
    },
    FieldDescriptor {
        key: "manual_soc",
        label: "Manual SoC",
        kind: FieldKind::Float,
        unit: Some("%"),
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/connected_vehicle/soc"),
        api_key: Some("soc"),
        normalizer: Normalizer::JsonFloat { key: "soc" },
        api_normalizer: Some(Normalizer::Float),
        write_topic: Some(
            "{mqtt_root}/set/vehicle/{vehicle_id}/soc_module/calculated_soc_state/manual_soc",
        ),
        api_command_key: Some("manual_soc"),
        min: Some(0.0),
        max: Some(100.0),
        step: Some(1.0),
        ..BASE
    },
    FieldDescriptor {
        key: "instant_charging_current",
        label: "Instant Charging Current",
        kind: FieldKind::Float,
        unit: Some("A"),
        source: Some(CHARGE_TEMPLATE),
        api_key: Some("instant_charging_current"),
        normalizer: Normalizer::NestedFloat {
            path: &["chargemode", "instant_charging", "current"],
        },
        api_normalizer: Some(Normalizer::Float),
        write_topic: Some("{mqtt_root}/set/vehicle/template/charge_template/{charge_template_id}/chargemode/instant_charging/current"),
        api_command_key: Some("chargecurrent"),
        min: Some(6.0),
        max: Some(32.0),
        step: Some(1.0),
        bounded_by_power: true,
        ..BASE
    },
    FieldDescriptor {
        key: "pv_charging_min_current",
        label: "PV Charging Minimum Current",
        kind: FieldKind::Float,
        unit: Some("A"),
        source: Some(CHARGE_TEMPLATE),
        api_key: Some("pv_charging_min_current"),
        normalizer: Normalizer::NestedFloat {
            path: &["chargemode", "pv_charging", "min_current"],
        },
        api_normalizer: Some(Normalizer::Float),
        write_topic: Some("{mqtt_root}/set/vehicle/template/charge_template/{charge_template_id}/chargemode/pv_charging/min_current"),
        api_command_key: Some("minimal_permanent_current"),
        min: Some(0.0),
        max: Some(32.0),
        step: Some(1.0),
        bounded_by_power: true,
        ..BASE
    },
    FieldDescriptor {
        key: "instant_charging_limitation",
        label: "Instant Charging Limitation",
        kind: FieldKind::Enum,
        source: Some(CHARGE_TEMPLATE),
        api_key: Some("instant_charging_limit"),
        normalizer: Normalizer::NestedText {
            path: &["chargemode", "instant_charging", "limit", "selected"],
        },
        api_normalizer: Some(Normalizer::Raw),
        value_map: LIMITATION_DISPLAY,
        command_map: LIMITATION_COMMAND,
        write_topic: Some("{mqtt_root}/set/vehicle/template/charge_template/{charge_template_id}/chargemode/instant_charging/limit/selected"),
        api_command_key: Some("instant_charging_limit"),
        ..BASE
    },
    // Energy limit is Wh on the wire, kWh on display.
    FieldDescriptor {
        key: "instant_charging_energy_limit",
        label: "Instant Charging Energy Limit",
        kind: FieldKind::Float,
        unit: Some("kWh"),
        source: Some(CHARGE_TEMPLATE),
        api_key: Some("instant_charging_amount"),
        normalizer: Normalizer::NestedFloatScaled {
            path: &["chargemode", "instant_charging", "limit", "amount"],
            factor: 1000.0,
            op: ScaleOp::Divide,
        },
        api_normalizer: Some(Normalizer::FloatScaled {
            factor: 1000.0,
            op: ScaleOp::Divide,
            digits: 3,
        }),
        write_topic: Some("{mqtt_root}/set/vehicle/template/charge_template/{charge_template_id}/chargemode/instant_charging/limit/amount"),
        api_command_key: Some("instant_charging_amount"),
        write_scale: Some(1000.0),
        min: Some(1.0),
        max: Some(100.0),
        step: Some(1.0),
        ..BASE
    },
    FieldDescriptor {
        key: "instant_charging_soc_limit",
        label: "Instant Charging SoC Limit",
        kind: FieldKind::Float,
        unit: Some("%"),
        source: Some(CHARGE_TEMPLATE),
        api_key: Some("instant_charging_soc"),
        normalizer: Normalizer::NestedFloat {
            path: &["chargemode", "instant_charging", "limit", "soc"],
        },
        api_normalizer: Some(Normalizer::Float),
        write_topic: Some("{mqtt_root}/set/vehicle/template/charge_template/{charge_template_id}/chargemode/instant_charging/limit/soc"),
        api_command_key: Some("instant_charging_soc"),
        min: Some(5.0),
        max: Some(100.0),
        step: Some(5.0),
        ..BASE
    },
    // ECO max price is €/Wh on the wire, ct/kWh on display.
    FieldDescriptor {
        key: "eco_charging_max_price",
        label: "ECO Charging Maximum Price",
        kind: FieldKind::Float,
        unit: Some("ct/kWh"),
        source: Some(CHARGE_TEMPLATE),
        api_key: Some("max_price_eco"),
        normalizer: Normalizer::NestedFloatScaled {
            path: &["chargemode", "eco_charging", "max_price"],
            factor: 100_000.0,
            op: ScaleOp::Multiply,
        },
        api_normalizer: Some(Normalizer::FloatScaled {
            factor: 100_000.0,
            op: ScaleOp::Multiply,
            digits: 3,
        }),
        write_topic: Some("{mqtt_root}/set/vehicle/template/charge_template/{charge_template_id}/chargemode/eco_charging/max_price"),
        api_command_key: Some("max_price_eco"),
        write_scale: Some(0.00001),
        min: Some(0.0),
        max: Some(99.0),
        step: Some(0.1),
        ..BASE
    },
];

// ── Counter ──────────────────────────────────────────────────────────

static COUNTER_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor {
        key: "power",
        label: "Power",
        kind: FieldKind::Float,
        unit: Some("W"),
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/power"),
        api_key: Some("power"),
        normalizer: Normalizer::Float,
        ..BASE
    },
    phase_float("current_l1", "Current (L1)", "A", "{mqtt_root}/{device_type}/{device_id}/get/currents", 0),
    phase_float("current_l2", "Current (L2)", "A", "{mqtt_root}/{device_type}/{device_id}/get/currents", 1),
    phase_float("current_l3", "Current (L3)", "A", "{mqtt_root}/{device_type}/{device_id}/get/currents", 2),
    phase_float("voltage_l1", "Voltage (L1)", "V", "{mqtt_root}/{device_type}/{device_id}/get/voltages", 0),
    phase_float("voltage_l2", "Voltage (L2)", "V", "{mqtt_root}/{device_type}/{device_id}/get/voltages", 1),
    phase_float("voltage_l3", "Voltage (L3)", "V", "{mqtt_root}/{device_type}/{device_id}/get/voltages", 2),
    phase_float("power_l1", "Power (L1)", "W", "{mqtt_root}/{device_type}/{device_id}/get/powers", 0),
    phase_float("power_l2", "Power (L2)", "W", "{mqtt_root}/{device_type}/{device_id}/get/powers", 1),
    phase_float("power_l3", "Power (L3)", "W", "{mqtt_root}/{device_type}/{device_id}/get/powers", 2),
    phase_float("power_factor_l1", "Power Factor (L1)", "%", "{mqtt_root}/{device_type}/{device_id}/get/power_factors", 0),
    phase_float("power_factor_l2", "Power Factor (L2)", "%", "{mqtt_root}/{device_type}/{device_id}/get/power_factors", 1),
    phase_float("power_factor_l3", "Power Factor (L3)", "%", "{mqtt_root}/{device_type}/{device_id}/get/power_factors", 2),
    FieldDescriptor {
        key: "frequency",
        label: "Frequency",
        kind: FieldKind::Float,
        unit: Some("Hz"),
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/frequency"),
        normalizer: Normalizer::Float,
        ..BASE
    },
    energy_kwh("imported", "Imported Energy", "{mqtt_root}/{device_type}/{device_id}/get/imported", "imported"),
    energy_kwh("exported", "Exported Energy", "{mqtt_root}/{device_type}/{device_id}/get/exported", "exported"),
    energy_kwh("daily_imported", "Imported Energy (Today)", "{mqtt_root}/{device_type}/{device_id}/get/daily_imported", "daily_imported"),
    energy_kwh("daily_exported", "Exported Energy (Today)", "{mqtt_root}/{device_type}/{device_id}/get/daily_exported", "daily_exported"),
    FieldDescriptor {
        key: "fault_str",
        label: "Fault Description",
        kind: FieldKind::Text,
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/fault_str"),
        normalizer: Normalizer::DisplayString,
        diagnostic: true,
        ..BASE
    },
    FieldDescriptor {
        key: "fault_state",
        label: "Fault State",
        kind: FieldKind::Bool,
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/fault_state"),
        normalizer: Normalizer::Bool,
        diagnostic: true,
        ..BASE
    },
];

// ── Battery ──────────────────────────────────────────────────────────

static BATTERY_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor {
        key: "power",
        label: "Power",
        kind: FieldKind::Float,
        unit: Some("W"),
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/power"),
        api_key: Some("power"),
        normalizer: Normalizer::Float,
        ..BASE
    },
    FieldDescriptor {
        key: "soc",
        label: "State of Charge",
        kind: FieldKind::Float,
        unit: Some("%"),
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/soc"),
        api_key: Some("soc"),
        normalizer: Normalizer::Float,
        ..BASE
    },
    energy_kwh("imported", "Stored Energy", "{mqtt_root}/{device_type}/{device_id}/get/imported", "imported"),
    energy_kwh("exported", "Discharged Energy", "{mqtt_root}/{device_type}/{device_id}/get/exported", "exported"),
    energy_kwh("daily_imported", "Stored Energy (Today)", "{mqtt_root}/{device_type}/{device_id}/get/daily_imported", "daily_imported"),
    energy_kwh("daily_exported", "Discharged Energy (Today)", "{mqtt_root}/{device_type}/{device_id}/get/daily_exported", "daily_exported"),
    FieldDescriptor {
        key: "fault_str",
        label: "Fault Description",
        kind: FieldKind::Text,
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/fault_str"),
        normalizer: Normalizer::DisplayString,
        diagnostic: true,
        ..BASE
    },
    FieldDescriptor {
        key: "fault_state",
        label: "Fault State",
        kind: FieldKind::Bool,
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/fault_state"),
        normalizer: Normalizer::Bool,
        diagnostic: true,
        ..BASE
    },
];

// ── PV generator ─────────────────────────────────────────────────────

static PV_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor {
        key: "power",
        label: "Power",
        kind: FieldKind::Float,
        unit: Some("W"),
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/power"),
        api_key: Some("power"),
        // Generation is reported negative, entities expose magnitude.
        normalizer: Normalizer::FloatAbs,
        ..BASE
    },
    phase_float("current_l1", "Current (L1)", "A", "{mqtt_root}/{device_type}/{device_id}/get/currents", 0),
    phase_float("current_l2", "Current (L2)", "A", "{mqtt_root}/{device_type}/{device_id}/get/currents", 1),
    phase_float("current_l3", "Current (L3)", "A", "{mqtt_root}/{device_type}/{device_id}/get/currents", 2),
    energy_kwh("exported", "Generated Energy", "{mqtt_root}/{device_type}/{device_id}/get/exported", "exported"),
    energy_kwh("daily_exported", "Generated Energy (Today)", "{mqtt_root}/{device_type}/{device_id}/get/daily_exported", "daily_exported"),
    energy_kwh("monthly_exported", "Generated Energy (Month)", "{mqtt_root}/{device_type}/{device_id}/get/monthly_exported", "monthly_exported"),
    energy_kwh("yearly_exported", "Generated Energy (Year)", "{mqtt_root}/{device_type}/{device_id}/get/yearly_exported", "yearly_exported"),
    FieldDescriptor {
        key: "fault_str",
        label: "Fault Description",
        kind: FieldKind::Text,
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/fault_str"),
        normalizer: Normalizer::DisplayString,
        diagnostic: true,
        ..BASE
    },
    FieldDescriptor {
        key: "fault_state",
        label: "Fault State",
        kind: FieldKind::Bool,
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/fault_state"),
        normalizer: Normalizer::Bool,
        diagnostic: true,
        ..BASE
    },
];

// ── Controller ───────────────────────────────────────────────────────

const LIVE_VALUES: &str = "{mqtt_root}/system/lastlivevaluesJson";

static CONTROLLER_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor {
        key: "ip_address",
        label: "IP Address",
        kind: FieldKind::Text,
        source: Some("{mqtt_root}/system/ip_address"),
        normalizer: Normalizer::Raw,
        diagnostic: true,
        ..BASE
    },
    FieldDescriptor {
        key: "version",
        label: "Software Version",
        kind: FieldKind::Text,
        source: Some("{mqtt_root}/system/version"),
        normalizer: Normalizer::Raw,
        diagnostic: true,
        ..BASE
    },
    FieldDescriptor {
        key: "live_timestamp",
        label: "Live Values (Last Update)",
        kind: FieldKind::Timestamp,
        source: Some(LIVE_VALUES),
        api_key: Some("timestamp"),
        normalizer: Normalizer::EpochFromJson { key: "timestamp" },
        api_normalizer: Some(Normalizer::EpochSeconds),
        diagnostic: true,
        ..BASE
    },
    FieldDescriptor {
        key: "grid_power",
        label: "Grid Power",
        kind: FieldKind::Float,
        unit: Some("W"),
        source: Some(LIVE_VALUES),
        api_key: Some("grid"),
        normalizer: Normalizer::LiveValue { key: "grid", factor: 1000.0 },
        api_normalizer: Some(Normalizer::FloatScaled { factor: 1000.0, op: ScaleOp::Multiply, digits: 0 }),
        ..BASE
    },
    FieldDescriptor {
        key: "house_power",
        label: "House Power",
        kind: FieldKind::Float,
        unit: Some("W"),
        source: Some(LIVE_VALUES),
        api_key: Some("house-power"),
        normalizer: Normalizer::LiveValue { key: "house-power", factor: 1000.0 },
        api_normalizer: Some(Normalizer::FloatScaled { factor: 1000.0, op: ScaleOp::Multiply, digits: 0 }),
        ..BASE
    },
    FieldDescriptor {
        key: "pv_power",
        label: "PV Power (Total)",
        kind: FieldKind::Float,
        unit: Some("W"),
        source: Some(LIVE_VALUES),
        api_key: Some("pv-all"),
        normalizer: Normalizer::LiveValue { key: "pv-all", factor: 1000.0 },
        api_normalizer: Some(Normalizer::FloatScaled { factor: 1000.0, op: ScaleOp::Multiply, digits: 0 }),
        ..BASE
    },
    FieldDescriptor {
        key: "charging_power",
        label: "Charging Power (Total)",
        kind: FieldKind::Float,
        unit: Some("W"),
        source: Some(LIVE_VALUES),
        api_key: Some("charging-all"),
        normalizer: Normalizer::LiveValue { key: "charging-all", factor: 1000.0 },
        api_normalizer: Some(Normalizer::FloatScaled { factor: 1000.0, op: ScaleOp::Multiply, digits: 0 }),
        ..BASE
    },
    FieldDescriptor {
        key: "battery_power",
        label: "Battery Power (Total)",
        kind: FieldKind::Float,
        unit: Some("W"),
        source: Some(LIVE_VALUES),
        api_key: Some("bat-all-power"),
        normalizer: Normalizer::LiveValue { key: "bat-all-power", factor: 1000.0 },
        api_normalizer: Some(Normalizer::FloatScaled { factor: 1000.0, op: ScaleOp::Multiply, digits: 0 }),
        ..BASE
    },
    FieldDescriptor {
        key: "battery_soc",
        label: "Battery SoC (Total)",
        kind: FieldKind::Float,
        unit: Some("%"),
        source: Some(LIVE_VALUES),
        api_key: Some("bat-all-soc"),
        normalizer: Normalizer::LiveValue { key: "bat-all-soc", factor: 1.0 },
        api_normalizer: Some(Normalizer::Float),
        ..BASE
    },
    vehicle_name_slot("vehicle_name_0", "Vehicle Name 0", "{mqtt_root}/vehicle/0/name"),
    vehicle_name_slot("vehicle_name_1", "Vehicle Name 1", "{mqtt_root}/vehicle/1/name"),
    vehicle_name_slot("vehicle_name_2", "Vehicle Name 2", "{mqtt_root}/vehicle/2/name"),
    vehicle_name_slot("vehicle_name_3", "Vehicle Name 3", "{mqtt_root}/vehicle/3/name"),
    vehicle_name_slot("vehicle_name_4", "Vehicle Name 4", "{mqtt_root}/vehicle/4/name"),
    vehicle_name_slot("vehicle_name_5", "Vehicle Name 5", "{mqtt_root}/vehicle/5/name"),
    vehicle_name_slot("vehicle_name_6", "Vehicle Name 6", "{mqtt_root}/vehicle/6/name"),
    vehicle_name_slot("vehicle_name_7", "Vehicle Name 7", "{mqtt_root}/vehicle/7/name"),
    vehicle_name_slot("vehicle_name_8", "Vehicle Name 8", "{mqtt_root}/vehicle/8/name"),
    vehicle_name_slot("vehicle_name_9", "Vehicle Name 9", "{mqtt_root}/vehicle/9/name"),
    vehicle_name_slot("vehicle_name_10", "Vehicle Name 10", "{mqtt_root}/vehicle/10/name"),
];

// ── Vehicle ──────────────────────────────────────────────────────────

static VEHICLE_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor {
        key: "name",
        label: "Name",
        kind: FieldKind::Text,
        source: Some("{mqtt_root}/{device_type}/{device_id}/name"),
        normalizer: Normalizer::Raw,
        diagnostic: true,
        ..BASE
    },
    FieldDescriptor {
        key: "soc",
        label: "State of Charge",
        kind: FieldKind::Float,
        unit: Some("%"),
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/soc"),
        normalizer: Normalizer::Float,
        ..BASE
    },
    FieldDescriptor {
        key: "range",
        label: "Range",
        kind: FieldKind::Float,
        unit: Some("km"),
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/range"),
        normalizer: Normalizer::Float,
        ..BASE
    },
    FieldDescriptor {
        key: "soc_timestamp",
        label: "SoC (Last Update)",
        kind: FieldKind::Timestamp,
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/soc_timestamp"),
        normalizer: Normalizer::EpochSeconds,
        diagnostic: true,
        ..BASE
    },
    FieldDescriptor {
        key: "fault_str",
        label: "Fault Description",
        kind: FieldKind::Text,
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/fault_str"),
        normalizer: Normalizer::DisplayString,
        diagnostic: true,
        ..BASE
    },
    FieldDescriptor {
        key: "fault_state",
        label: "Fault State",
        kind: FieldKind::Bool,
        source: Some("{mqtt_root}/{device_type}/{device_id}/get/fault_state"),
        normalizer: Normalizer::Bool,
        diagnostic: true,
        ..BASE
    },
];

fn table(device_type: DeviceType) -> &'static [FieldDescriptor] {
    match device_type {
        DeviceType::Chargepoint => CHARGEPOINT_FIELDS,
        DeviceType::Counter => COUNTER_FIELDS,
        DeviceType::Battery => BATTERY_FIELDS,
        DeviceType::Pv => PV_FIELDS,
        DeviceType::Controller => CONTROLLER_FIELDS,
        DeviceType::Vehicle => VEHICLE_FIELDS,
    }
}

#[derive(Debug, Error)]
#[error("catalog field `{field}`: {problem}")]
pub struct CatalogError {
    pub field: String,
    pub problem: String,
}

/// Handle proving the tables passed startup validation.
pub struct Catalog {
    _validated: (),
}

impl Catalog {
    pub fn load() -> Result<Self, CatalogError> {
        for device_type in ALL_DEVICE_TYPES {
            for desc in table(*device_type) {
                validate(*device_type, desc)?;
            }
        }
        Ok(Catalog { _validated: () })
    }

    pub fn fields_for(&self, device_type: DeviceType) -> &'static [FieldDescriptor] {
        table(device_type)
    }
}

fn invalid(desc: &FieldDescriptor, problem: impl Into<String>) -> CatalogError {
    CatalogError { field: desc.key.to_string(), problem: problem.into() }
}

fn validate(device_type: DeviceType, desc: &FieldDescriptor) -> Result<(), CatalogError> {
    if desc.key.is_empty() {
        return Err(invalid(desc, format!("empty key in {} table", device_type.wire_name())));
    }
    for template in [desc.source, desc.write_topic].into_iter().flatten() {
        resolver::check_template(template)
            .map_err(|e| invalid(desc, format!("bad template `{template}`: {e}")))?;
    }
    let produced = output_kind(&desc.normalizer);
    let coherent = match desc.kind {
        FieldKind::Enum => produced == FieldKind::Text && !desc.value_map.is_empty(),
        kind => produced == kind,
    };
    if !coherent {
        return Err(invalid(desc, format!("normalizer produces {produced:?}, kind is {:?}", desc.kind)));
    }
    // The HTTP aggregate hands out flat scalars; a JSON-digging
    // normalizer applied there would silently yield absent.
    if desc.api_key.is_some() && is_structural(&desc.normalizer) && desc.api_normalizer.is_none() {
        return Err(invalid(desc, "api_key set but no api_normalizer for a JSON-envelope normalizer"));
    }
    // Echo merging needs a snapshot entry to merge into.
    if desc.api_command_key.is_some() && desc.api_key.is_none() {
        return Err(invalid(desc, "api_command_key without api_key"));
    }
    if !desc.command_map.is_empty() && !desc.is_writable() {
        return Err(invalid(desc, "command vocabulary on a read-only field"));
    }
    Ok(())
}

fn output_kind(normalizer: &Normalizer) -> FieldKind {
    match normalizer {
        Normalizer::Raw
        | Normalizer::DisplayString
        | Normalizer::JsonText { .. }
        | Normalizer::NestedText { .. } => FieldKind::Text,
        Normalizer::Bool => FieldKind::Bool,
        Normalizer::EpochSeconds | Normalizer::EpochFromJson { .. } => FieldKind::Timestamp,
        _ => FieldKind::Float,
    }
}

fn is_structural(normalizer: &Normalizer) -> bool {
    matches!(
        normalizer,
        Normalizer::JsonText { .. }
            | Normalizer::JsonFloat { .. }
            | Normalizer::NestedText { .. }
            | Normalizer::NestedFloat { .. }
            | Normalizer::NestedFloatScaled { .. }
            | Normalizer::EpochFromJson { .. }
            | Normalizer::LiveValue { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_loads() {
        Catalog::load().unwrap();
    }

    #[test]
    fn test_tables_are_nonempty_and_keys_unique() {
        let catalog = Catalog::load().unwrap();
        for device_type in ALL_DEVICE_TYPES {
            let fields = catalog.fields_for(*device_type);
            assert!(!fields.is_empty(), "{} table empty", device_type.wire_name());
            let mut keys: Vec<_> = fields.iter().map(|d| d.key).collect();
            keys.sort();
            let before = keys.len();
            keys.dedup();
            assert_eq!(before, keys.len(), "duplicate key in {}", device_type.wire_name());
        }
    }

    #[test]
    fn test_command_maps_round_trip() {
        // Writing any display value and reading back its wire echo must
        // reproduce the same display value.
        let catalog = Catalog::load().unwrap();
        for device_type in ALL_DEVICE_TYPES {
            for desc in catalog.fields_for(*device_type) {
                for (display, wire) in desc.command_map {
                    if desc.value_map.is_empty() {
                        continue;
                    }
                    let round =
                        map_display(desc, crate::normalize::FieldValue::Text(wire.to_string()));
                    assert_eq!(
                        round,
                        crate::normalize::FieldValue::Text(display.to_string()),
                        "round trip failed for {}/{display}",
                        desc.key
                    );
                }
            }
        }
    }

    #[test]
    fn test_map_display_passes_unknown_wire_values() {
        let desc = CHARGEPOINT_FIELDS.iter().find(|d| d.key == "chargemode").unwrap();
        let odd = crate::normalize::FieldValue::Text("secret_mode".into());
        assert_eq!(map_display(desc, odd.clone()), odd);
    }

    #[test]
    fn test_api_queries() {
        assert_eq!(
            DeviceType::Chargepoint.api_query(Some(4)).unwrap(),
            "?get_chargepoint_all=4"
        );
        assert_eq!(DeviceType::Battery.api_query(Some(1)).unwrap(), "?get_battery=1");
        assert_eq!(
            DeviceType::Controller.api_query(None).unwrap(),
            "?get_lastlivevaluesjson&raw=true"
        );
        assert!(DeviceType::Vehicle.api_query(Some(0)).is_none());
        assert_eq!(DeviceType::Chargepoint.api_response_key(Some(4)).unwrap(), "chargepoint_4");
        assert!(DeviceType::Controller.api_response_key(None).is_none());
    }

    #[test]
    fn test_writable_fields_have_both_paths() {
        // Every writable chargepoint field supports MQTT and simpleAPI.
        let catalog = Catalog::load().unwrap();
        for desc in catalog.fields_for(DeviceType::Chargepoint) {
            if desc.is_writable() {
                assert!(desc.write_topic.is_some(), "{} lacks write topic", desc.key);
                assert!(desc.api_command_key.is_some(), "{} lacks api command key", desc.key);
            }
        }
    }
}
