//! Command dispatcher.
//!
//! Turns a display-level write (`set_value("chargemode", "PV Charging")`)
//! into the transport-specific wire operation: an MQTT publish on the
//! field's set topic, or a form-encoded simpleAPI POST. MQTT writes are
//! never applied optimistically; the broker echoes the authoritative
//! state back on the read topic. HTTP writes merge the server's echo
//! into the snapshot when present and fall back to an out-of-cycle
//! re-poll when it is not.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::catalog::{self, FieldDescriptor};
use crate::config::DeviceBinding;
use crate::coordinator::Coordinator;
use crate::http_api::{ApiClientError, HttpApiClient};
use crate::mqtt::MqttTransport;
use crate::resolver::{self, DynamicBinding, ResolveError};

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("unknown field `{0}`")]
    UnknownField(String),
    #[error("field `{0}` is not writable")]
    NotWritable(String),
    #[error("value `{value}` is not accepted for `{field}`")]
    UnmappableValue { field: String, value: String },
    #[error("value {value} is outside {min}..={max}")]
    OutOfRange { value: f64, min: f64, max: f64 },
    #[error(transparent)]
    Unresolved(#[from] ResolveError),
    #[error(transparent)]
    Api(#[from] ApiClientError),
    #[error("publish failed: {0}")]
    Publish(String),
}

pub enum CommandTransport {
    Mqtt(Arc<MqttTransport>),
    Http(Arc<HttpApiClient>),
}

pub struct CommandDispatcher {
    coordinator: Arc<Coordinator>,
    transport: CommandTransport,
    /// Poke the poll loop after an echo-less HTTP write.
    refresh_tx: Option<mpsc::Sender<()>>,
}

impl CommandDispatcher {
    pub fn new(
        coordinator: Arc<Coordinator>,
        transport: CommandTransport,
        refresh_tx: Option<mpsc::Sender<()>>,
    ) -> CommandDispatcher {
        CommandDispatcher { coordinator, transport, refresh_tx }
    }

    pub async fn set_value(&self, field_key: &str, display: &str) -> Result<(), WriteError> {
        let desc = self
            .coordinator
            .descriptor(field_key)
            .ok_or_else(|| WriteError::UnknownField(field_key.to_string()))?;
        if !desc.is_writable() {
            return Err(WriteError::NotWritable(field_key.to_string()));
        }
        let binding = self.coordinator.binding();
        // `display` shadows `tracing::field::display` inside the tracing
        // macros, so log through a differently-named alias.
        let display_value = display;
        match &self.transport {
            CommandTransport::Mqtt(mqtt) => {
                let dynamic = self.coordinator.dynamic_binding();
                let (topic, payload) = prepare_mqtt_command(desc, binding, &dynamic, display)?;
                mqtt.publish(&topic, &payload)
                    .await
                    .map_err(|e| WriteError::Publish(e.to_string()))?;
                tracing::info!(
                    device = %self.coordinator.label(),
                    field = field_key,
                    "sent {} via mqtt",
                    display_value
                );
            }
            CommandTransport::Http(client) => {
                let body = prepare_api_command(desc, binding, display)?;
                let response = client.post_form(body).await?;
                if merge_echo(&self.coordinator, desc, &response) {
                    tracing::info!(
                        device = %self.coordinator.label(),
                        field = field_key,
                        "sent {} via simpleAPI, echo merged",
                        display_value
                    );
                } else {
                    tracing::info!(
                        device = %self.coordinator.label(),
                        field = field_key,
                        "sent {} via simpleAPI, no echo, re-polling",
                        display_value
                    );
                    if let Some(tx) = &self.refresh_tx {
                        let _ = tx.try_send(());
                    }
                }
            }
        }
        Ok(())
    }
}

/// Build the MQTT publish for a display-level write.
pub fn prepare_mqtt_command(
    desc: &FieldDescriptor,
    binding: &DeviceBinding,
    dynamic: &DynamicBinding,
    display: &str,
) -> Result<(String, String), WriteError> {
    let template = desc
        .write_topic
        .ok_or_else(|| WriteError::NotWritable(desc.key.to_string()))?;
    let topic = resolver::resolve(template, binding, dynamic)?;
    let payload = wire_value(desc, binding, display, desc.command_map)?;
    Ok((topic, payload))
}

/// Build the form-encoded simpleAPI body for a display-level write.
pub fn prepare_api_command(
    desc: &FieldDescriptor,
    binding: &DeviceBinding,
    display: &str,
) -> Result<String, WriteError> {
    let command_key = desc
        .api_command_key
        .ok_or_else(|| WriteError::NotWritable(desc.key.to_string()))?;
    let map = if desc.api_command_map.is_empty() { desc.command_map } else { desc.api_command_map };
    let wire = wire_value(desc, binding, display, map)?;
    let id = binding.device_id.unwrap_or(0);
    Ok(format!("{command_key}={wire}&chargepoint_nr={id}"))
}

/// Display value → wire string: closed vocabulary when the descriptor
/// has one, range-checked and scaled number when it is numeric,
/// passthrough otherwise.
fn wire_value(
    desc: &FieldDescriptor,
    binding: &DeviceBinding,
    display: &str,
    map: &[(&str, &str)],
) -> Result<String, WriteError> {
    // Configured vehicle names take precedence over the generic
    // "Vehicle N" vocabulary, which stays as the fallback.
    if desc.uses_vehicle_directory {
        if let Some((id, _)) = binding.vehicles.iter().find(|(_, name)| name.as_str() == display) {
            return Ok(id.to_string());
        }
    }
    if !map.is_empty() {
        return map
            .iter()
            .find(|(from, _)| *from == display)
            .map(|(_, to)| (*to).to_string())
            .ok_or_else(|| WriteError::UnmappableValue {
                field: desc.key.to_string(),
                value: display.to_string(),
            });
    }
    if desc.min.is_some() || desc.max.is_some() {
        let value: f64 = display.trim().parse().map_err(|_| WriteError::UnmappableValue {
            field: desc.key.to_string(),
            value: display.to_string(),
        })?;
        let min = desc.min.unwrap_or(f64::NEG_INFINITY);
        let mut max = desc.max.unwrap_or(f64::INFINITY);
        if desc.bounded_by_power {
            max = max.min(binding.max_charge_current());
        }
        if value < min || value > max {
            return Err(WriteError::OutOfRange { value, min, max });
        }
        let wire = value * desc.write_scale.unwrap_or(1.0);
        if wire.fract() == 0.0 {
            return Ok(format!("{}", wire as i64));
        }
        return Ok(format!("{wire}"));
    }
    Ok(display.to_string())
}

/// Merge the server's confirmed value from a write response into the
/// snapshot. Returns false when the response carries no usable echo.
pub fn merge_echo(coordinator: &Coordinator, desc: &FieldDescriptor, response: &Value) -> bool {
    if !response.get("success").and_then(Value::as_bool).unwrap_or(false) {
        return false;
    }
    let Some(command_key) = desc.api_command_key else { return false };
    let Some(echo) = response.get("data").and_then(|d| d.get(command_key)) else {
        return false;
    };
    // Echo values are wire-level, same as the aggregate.
    match desc.api_normalizer().apply_json(echo) {
        Some(value) => {
            coordinator.merge_field(desc.key, catalog::map_display(desc, value));
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, DeviceType};
    use crate::normalize::FieldValue;
    use serde_json::json;

    fn binding(power_kw: u8) -> DeviceBinding {
        DeviceBinding {
            device_type: DeviceType::Chargepoint,
            device_id: Some(4),
            mqtt_root: "openWB".to_string(),
            wallbox_power_kw: power_kw,
            vehicles: Default::default(),
        }
    }

    fn descriptor(key: &str) -> &'static FieldDescriptor {
        let catalog = Catalog::load().unwrap();
        catalog
            .fields_for(DeviceType::Chargepoint)
            .iter()
            .find(|d| d.key == key)
            .unwrap()
    }

    #[test]
    fn test_mqtt_chargemode_command() {
        let dynamic = DynamicBinding::default();
        let (topic, payload) =
            prepare_mqtt_command(descriptor("chargemode"), &binding(11), &dynamic, "PV Charging")
                .unwrap();
        assert_eq!(topic, "openWB/set/chargepoint/4/chargemode");
        assert_eq!(payload, "pv");
    }

    #[test]
    fn test_unmapped_display_value_rejected() {
        let err = prepare_mqtt_command(
            descriptor("chargemode"),
            &binding(11),
            &DynamicBinding::default(),
            "Turbo",
        )
        .unwrap_err();
        assert!(matches!(err, WriteError::UnmappableValue { .. }));
    }

    #[test]
    fn test_dynamic_write_requires_bound_template() {
        let err = prepare_mqtt_command(
            descriptor("instant_charging_current"),
            &binding(11),
            &DynamicBinding::default(),
            "10",
        )
        .unwrap_err();
        assert!(matches!(err, WriteError::Unresolved(ResolveError::UnresolvedAddress { .. })));

        let dynamic = DynamicBinding { charge_template_id: Some(42), vehicle_id: None };
        let (topic, payload) = prepare_mqtt_command(
            descriptor("instant_charging_current"),
            &binding(11),
            &dynamic,
            "10",
        )
        .unwrap();
        assert_eq!(
            topic,
            "openWB/set/vehicle/template/charge_template/42/chargemode/instant_charging/current"
        );
        assert_eq!(payload, "10");
    }

    #[test]
    fn test_power_class_caps_charging_current() {
        let dynamic = DynamicBinding { charge_template_id: Some(1), vehicle_id: None };
        // 20 A is fine on a 22 kW box but over the 16 A cap of an 11 kW one.
        assert!(prepare_mqtt_command(
            descriptor("instant_charging_current"),
            &binding(22),
            &dynamic,
            "20"
        )
        .is_ok());
        let err = prepare_mqtt_command(
            descriptor("instant_charging_current"),
            &binding(11),
            &dynamic,
            "20",
        )
        .unwrap_err();
        assert!(matches!(err, WriteError::OutOfRange { max, .. } if max == 16.0));
    }

    #[test]
    fn test_energy_limit_written_in_wire_units() {
        let dynamic = DynamicBinding { charge_template_id: Some(1), vehicle_id: None };
        let (_, payload) = prepare_mqtt_command(
            descriptor("instant_charging_energy_limit"),
            &binding(11),
            &dynamic,
            "10",
        )
        .unwrap();
        // 10 kWh on display is 10000 Wh on the wire.
        assert_eq!(payload, "10000");
    }

    #[test]
    fn test_manual_soc_needs_vehicle_id() {
        let err = prepare_mqtt_command(
            descriptor("manual_soc"),
            &binding(11),
            &DynamicBinding::default(),
            "80",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            WriteError::Unresolved(ResolveError::UnresolvedAddress { .. })
        ));

        let dynamic = DynamicBinding { charge_template_id: None, vehicle_id: Some(3) };
        let (topic, payload) =
            prepare_mqtt_command(descriptor("manual_soc"), &binding(11), &dynamic, "80").unwrap();
        assert_eq!(topic, "openWB/set/vehicle/3/soc_module/calculated_soc_state/manual_soc");
        assert_eq!(payload, "80");
    }

    #[test]
    fn test_api_lock_command_uses_numeric_vocabulary() {
        let body = prepare_api_command(descriptor("manual_lock"), &binding(11), "lock").unwrap();
        assert_eq!(body, "chargepoint_lock=1&chargepoint_nr=4");
        let (topic, payload) = prepare_mqtt_command(
            descriptor("manual_lock"),
            &binding(11),
            &DynamicBinding::default(),
            "lock",
        )
        .unwrap();
        assert_eq!(topic, "openWB/set/chargepoint/4/set/manual_lock");
        assert_eq!(payload, "true");
    }

    #[test]
    fn test_vehicle_select_accepts_configured_names() {
        let mut b = binding(11);
        b.vehicles.insert(3, "Zoe".to_string());

        let desc = descriptor("connected_vehicle");
        let dynamic = DynamicBinding::default();
        let (topic, payload) = prepare_mqtt_command(desc, &b, &dynamic, "Zoe").unwrap();
        assert_eq!(topic, "openWB/set/chargepoint/4/config/ev");
        assert_eq!(payload, "3");

        // The generic vocabulary still works as the fallback.
        let (_, payload) = prepare_mqtt_command(desc, &b, &dynamic, "Vehicle 2").unwrap();
        assert_eq!(payload, "2");

        let err = prepare_mqtt_command(desc, &b, &dynamic, "Herbie").unwrap_err();
        assert!(matches!(err, WriteError::UnmappableValue { .. }));
    }

    #[test]
    fn test_echo_merge_updates_snapshot() {
        let catalog = Catalog::load().unwrap();
        let coordinator = Coordinator::new(&catalog, binding(11));
        let desc = descriptor("manual_lock");

        let merged = merge_echo(
            &coordinator,
            desc,
            &json!({"success": true, "data": {"chargepoint_lock": "1"}}),
        );
        assert!(merged);
        assert_eq!(coordinator.get("manual_lock"), Some(FieldValue::Bool(true)));
    }

    #[test]
    fn test_echo_merge_ignores_failures_and_missing_data() {
        let catalog = Catalog::load().unwrap();
        let coordinator = Coordinator::new(&catalog, binding(11));
        let desc = descriptor("manual_lock");

        assert!(!merge_echo(
            &coordinator,
            desc,
            &json!({"success": false, "data": {"chargepoint_lock": "1"}}),
        ));
        assert!(!merge_echo(&coordinator, desc, &json!({"success": true})));
        assert_eq!(coordinator.get("manual_lock"), None);
    }

    #[test]
    fn test_echo_merge_scales_energy_limit() {
        let catalog = Catalog::load().unwrap();
        let coordinator = Coordinator::new(&catalog, binding(11));
        let desc = descriptor("instant_charging_energy_limit");

        assert!(merge_echo(
            &coordinator,
            desc,
            &json!({"success": true, "data": {"instant_charging_amount": "10000"}}),
        ));
        assert_eq!(
            coordinator.get("instant_charging_energy_limit"),
            Some(FieldValue::Float(10.0))
        );
    }

    #[test]
    fn test_read_only_field_not_writable() {
        let catalog = Catalog::load().unwrap();
        let desc = catalog
            .fields_for(DeviceType::Chargepoint)
            .iter()
            .find(|d| d.key == "power")
            .unwrap();
        assert!(!desc.is_writable());
        let err = prepare_mqtt_command(desc, &binding(11), &DynamicBinding::default(), "0")
            .unwrap_err();
        assert!(matches!(err, WriteError::NotWritable(_)));
    }
}
