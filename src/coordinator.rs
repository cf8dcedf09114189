//! Per-device update coordinator.
//!
//! Holds the current snapshot of one device as copy-on-write data:
//! readers grab an `Arc<Snapshot>` and keep a consistent view while
//! updates swap in a fresh map. Every replacement is announced on a
//! broadcast channel, tagged with a fresh context id for tracing a
//! value from ingest to consumer.
//!
//! The coordinator also owns the charge-template binding state for
//! chargepoints: the template id is discovered from the connected
//! vehicle's config payload, and a change of id yields a `Rebind`
//! telling the MQTT loop which topics to drop and which to add.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::catalog::{self, Catalog, DeviceType, FieldDescriptor};
use crate::config::DeviceBinding;
use crate::http_api::{ApiClientError, HttpApiClient};
use crate::normalize::FieldValue;
use crate::resolver::{self, DynamicBinding, ResolveError};

/// Field key → normalized value. Absence of a key means the field has
/// not been received (or failed to parse); no sentinel values.
pub type Snapshot = HashMap<String, FieldValue>;

/// Broadcast on every snapshot replacement.
#[derive(Debug, Clone)]
pub struct SnapshotChanged {
    pub device: String,
    pub snapshot: Arc<Snapshot>,
    /// Correlation id for tracing this update through consumers.
    pub context_id: String,
}

/// Subscription changes required after a charge template id change.
/// `unsubscribe` must be processed before `subscribe`.
#[derive(Debug, Clone, PartialEq)]
pub struct Rebind {
    pub unsubscribe: Vec<String>,
    pub subscribe: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TemplateBinding {
    Unbound,
    Bound(u64),
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("update failed: {0}")]
    Failed(#[from] ApiClientError),
    #[error("key `{0}` missing from the aggregate response")]
    MissingDevice(String),
    #[error("device type `{0}` is not pollable over the simpleAPI")]
    Unpollable(&'static str),
}

pub struct Coordinator {
    binding: DeviceBinding,
    fields: &'static [FieldDescriptor],
    snapshot: RwLock<Arc<Snapshot>>,
    event_tx: broadcast::Sender<SnapshotChanged>,
    template: Mutex<TemplateBinding>,
}

impl Coordinator {
    pub fn new(catalog: &Catalog, binding: DeviceBinding) -> Coordinator {
        let fields = catalog.fields_for(binding.device_type);
        let (event_tx, _) = broadcast::channel(64);
        Coordinator {
            binding,
            fields,
            snapshot: RwLock::new(Arc::new(Snapshot::new())),
            event_tx,
            template: Mutex::new(TemplateBinding::Unbound),
        }
    }

    pub fn binding(&self) -> &DeviceBinding {
        &self.binding
    }

    pub fn label(&self) -> String {
        self.binding.label()
    }

    pub fn fields(&self) -> &'static [FieldDescriptor] {
        self.fields
    }

    pub fn descriptor(&self, key: &str) -> Option<&'static FieldDescriptor> {
        self.fields.iter().find(|d| d.key == key)
    }

    /// Current snapshot. The returned map never mutates; later updates
    /// swap in a new one.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn get(&self, key: &str) -> Option<FieldValue> {
        self.snapshot().get(key).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotChanged> {
        self.event_tx.subscribe()
    }

    /// Runtime ids for the dynamic placeholders. The vehicle id rides
    /// along in the snapshot once the connected-vehicle info arrived.
    pub fn dynamic_binding(&self) -> DynamicBinding {
        let charge_template_id =
            match *self.template.lock().unwrap_or_else(|e| e.into_inner()) {
                TemplateBinding::Unbound => None,
                TemplateBinding::Bound(id) => Some(id),
            };
        let vehicle_id = self.get("vehicle_id").and_then(|v| v.as_u64());
        DynamicBinding { charge_template_id, vehicle_id }
    }

    /// Topics to subscribe right now. Templates waiting on an unbound
    /// charge template id are skipped; they arrive later via `Rebind`.
    pub fn subscription_topics(&self) -> Vec<String> {
        let dynamic = self.dynamic_binding();
        let mut topics = Vec::new();
        for desc in self.fields {
            let Some(template) = desc.source else { continue };
            match resolver::resolve(template, &self.binding, &dynamic) {
                Ok(topic) => {
                    if !topics.contains(&topic) {
                        topics.push(topic);
                    }
                }
                Err(ResolveError::UnresolvedAddress { .. }) => {}
                Err(e) => {
                    tracing::warn!(device = %self.label(), "skipping template {template}: {e}")
                }
            }
        }
        topics
    }

    /// Ingest one MQTT publish. Fields sourced from this topic are
    /// re-parsed; a payload that no longer parses resets its field to
    /// absent rather than leaving a stale value. Returns subscription
    /// changes when the payload revealed a new charge template id.
    pub fn apply_message(&self, topic: &str, payload: &str) -> Option<Rebind> {
        let dynamic = self.dynamic_binding();
        let mut changes: Vec<(&'static str, Option<FieldValue>)> = Vec::new();
        for desc in self.fields {
            let Some(template) = desc.source else { continue };
            let Ok(resolved) = resolver::resolve(template, &self.binding, &dynamic) else {
                continue;
            };
            if resolved != topic {
                continue;
            }
            match desc.normalizer.apply(payload) {
                Some(value) => {
                    changes.push((desc.key, Some(catalog::map_display(desc, value))));
                }
                None => {
                    tracing::debug!(
                        device = %self.label(),
                        field = desc.key,
                        "payload on {topic} did not parse, clearing"
                    );
                    changes.push((desc.key, None));
                }
            }
        }
        if !changes.is_empty() {
            self.mutate(|map| {
                for (key, value) in changes {
                    match value {
                        Some(value) => {
                            map.insert(key.to_string(), value);
                        }
                        None => {
                            map.remove(key);
                        }
                    }
                }
            });
        }
        self.maybe_rebind(topic, payload)
    }

    /// Ingest one HTTP aggregate object, replacing the snapshot
    /// wholesale.
    pub fn apply_poll(&self, aggregate: &Value) {
        let mut map = Snapshot::new();
        for desc in self.fields {
            let Some(api_key) = desc.api_key else { continue };
            let Some(raw) = aggregate.get(api_key) else { continue };
            if let Some(value) = desc.api_normalizer().apply_json(raw) {
                map.insert(desc.key.to_string(), catalog::map_display(desc, value));
            }
        }
        self.replace(map);
    }

    /// Splice a single confirmed value into the snapshot (optimistic
    /// echo from a simpleAPI write).
    pub fn merge_field(&self, key: &str, value: FieldValue) {
        self.mutate(|map| {
            map.insert(key.to_string(), value);
        });
    }

    /// Clone-edit-swap under the write lock. The poller, the MQTT
    /// routing task and axum handler tasks all target the same
    /// coordinator; cloning outside the lock would let a concurrent
    /// replacement slip in between read and swap and get overwritten
    /// by the stale copy. Readers still only ever see a completed map
    /// behind an atomic pointer swap.
    fn mutate(&self, edit: impl FnOnce(&mut Snapshot)) {
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        let mut map = (**guard).clone();
        edit(&mut map);
        let arc = Arc::new(map);
        *guard = arc.clone();
        drop(guard);
        self.announce(arc);
    }

    fn replace(&self, map: Snapshot) {
        let arc = Arc::new(map);
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = arc.clone();
        self.announce(arc);
    }

    fn announce(&self, snapshot: Arc<Snapshot>) {
        let _ = self.event_tx.send(SnapshotChanged {
            device: self.label(),
            snapshot,
            context_id: uuid::Uuid::new_v4().to_string(),
        });
    }

    fn maybe_rebind(&self, topic: &str, payload: &str) -> Option<Rebind> {
        if self.binding.device_type != DeviceType::Chargepoint {
            return None;
        }
        let config_topic = resolver::resolve(
            catalog::CONNECTED_VEHICLE_CONFIG,
            &self.binding,
            &DynamicBinding::default(),
        )
        .ok()?;
        if topic != config_topic {
            return None;
        }
        let id = crate::normalize::parse_json_field(payload, "charge_template")
            .as_ref()
            .and_then(Value::as_u64)?;
        self.bind_template(id)
    }

    fn bind_template(&self, new_id: u64) -> Option<Rebind> {
        let mut state = self.template.lock().unwrap_or_else(|e| e.into_inner());
        let current = match *state {
            TemplateBinding::Unbound => None,
            TemplateBinding::Bound(id) => Some(id),
        };
        if current == Some(new_id) {
            return None;
        }
        *state = TemplateBinding::Bound(new_id);
        drop(state);

        let unsubscribe = match current {
            Some(old_id) => self.dynamic_topics(old_id),
            None => Vec::new(),
        };
        let subscribe = self.dynamic_topics(new_id);
        tracing::info!(
            device = %self.label(),
            "charge template bound to {new_id} ({} topics)",
            subscribe.len()
        );
        Some(Rebind { unsubscribe, subscribe })
    }

    fn dynamic_topics(&self, template_id: u64) -> Vec<String> {
        let dynamic = DynamicBinding { charge_template_id: Some(template_id), vehicle_id: None };
        let mut topics = Vec::new();
        for desc in self.fields {
            let Some(template) = desc.source else { continue };
            if !resolver::needs_charge_template(template) {
                continue;
            }
            if let Ok(topic) = resolver::resolve(template, &self.binding, &dynamic) {
                if !topics.contains(&topic) {
                    topics.push(topic);
                }
            }
        }
        topics
    }
}

// ── HTTP polling ─────────────────────────────────────────────────────

/// Feed one poll outcome into the coordinator. A failed fetch leaves
/// the previous snapshot in place so consumers keep the last good
/// values.
pub fn apply_poll_result(
    coordinator: &Coordinator,
    result: Result<Value, ApiClientError>,
) -> Result<(), UpdateError> {
    let body = result?;
    let binding = coordinator.binding();
    let aggregate = match binding.device_type.api_response_key(binding.device_id) {
        Some(key) => body
            .get(&key)
            .cloned()
            .ok_or(UpdateError::MissingDevice(key))?,
        None => body,
    };
    coordinator.apply_poll(&aggregate);
    Ok(())
}

pub async fn poll_once(
    coordinator: &Coordinator,
    client: &HttpApiClient,
) -> Result<(), UpdateError> {
    let binding = coordinator.binding();
    let query = binding
        .device_type
        .api_query(binding.device_id)
        .ok_or(UpdateError::Unpollable(binding.device_type.wire_name()))?;
    apply_poll_result(coordinator, client.get(&query).await)
}

/// Spawn the poll loop for one device. The returned sender triggers an
/// out-of-cycle refresh (used after writes without an echo).
pub fn start_http_poller(
    coordinator: Arc<Coordinator>,
    client: Arc<HttpApiClient>,
    interval: Duration,
) -> mpsc::Sender<()> {
    let (refresh_tx, mut refresh_rx) = mpsc::channel::<()>(4);
    tokio::spawn(async move {
        loop {
            if let Err(e) = poll_once(&coordinator, &client).await {
                tracing::warn!(device = %coordinator.label(), "poll failed: {e}");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                Some(()) = refresh_rx.recv() => {
                    tracing::debug!(device = %coordinator.label(), "refresh requested");
                }
            }
        }
    });
    refresh_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceBinding;
    use serde_json::json;

    fn chargepoint() -> Coordinator {
        let catalog = Catalog::load().unwrap();
        Coordinator::new(
            &catalog,
            DeviceBinding {
                device_type: DeviceType::Chargepoint,
                device_id: Some(4),
                mqtt_root: "openWB".to_string(),
                wallbox_power_kw: 11,
                vehicles: Default::default(),
            },
        )
    }

    #[test]
    fn test_poll_populates_snapshot() {
        let coordinator = chargepoint();
        coordinator.apply_poll(&json!({
            "power": "2300",
            "plug_state": "1",
            "charge_state": "0",
            "imported": 5230.0,
        }));
        let snap = coordinator.snapshot();
        assert_eq!(snap.get("power"), Some(&FieldValue::Float(2300.0)));
        assert_eq!(snap.get("plug_state"), Some(&FieldValue::Bool(true)));
        assert_eq!(snap.get("charge_state"), Some(&FieldValue::Bool(false)));
        assert_eq!(snap.get("imported"), Some(&FieldValue::Float(5.23)));
    }

    #[test]
    fn test_snapshot_is_copy_on_write() {
        let coordinator = chargepoint();
        coordinator.apply_poll(&json!({"power": 100}));
        let before = coordinator.snapshot();
        coordinator.apply_poll(&json!({"power": 200}));
        // The snapshot handed out earlier still holds the old value.
        assert_eq!(before.get("power"), Some(&FieldValue::Float(100.0)));
        assert_eq!(coordinator.get("power"), Some(FieldValue::Float(200.0)));
    }

    #[test]
    fn test_message_updates_single_field() {
        let coordinator = chargepoint();
        coordinator.apply_message("openWB/chargepoint/4/get/power", "1234");
        assert_eq!(coordinator.get("power"), Some(FieldValue::Float(1234.0)));

        coordinator.apply_message("openWB/chargepoint/4/get/currents", "[6.0,6.0,0.0]");
        assert_eq!(coordinator.get("current_l1"), Some(FieldValue::Float(6.0)));
        assert_eq!(coordinator.get("current_l3"), Some(FieldValue::Float(0.0)));
    }

    #[test]
    fn test_unparseable_payload_clears_field() {
        let coordinator = chargepoint();
        coordinator.apply_message("openWB/chargepoint/4/get/power", "1234");
        coordinator.apply_message("openWB/chargepoint/4/get/power", "garbage");
        assert_eq!(coordinator.get("power"), None);
    }

    #[test]
    fn test_charge_template_discovery_rebinds() {
        let coordinator = chargepoint();
        // Dynamic topics are not subscribable before the id is known.
        let initial = coordinator.subscription_topics();
        assert!(!initial.iter().any(|t| t.contains("charge_template/")));

        let rebind = coordinator
            .apply_message(
                "openWB/chargepoint/4/get/connected_vehicle/config",
                r#"{"charge_template": 42, "chargemode": "pv_charging"}"#,
            )
            .expect("new template id should trigger a rebind");
        assert!(rebind.unsubscribe.is_empty());
        assert!(rebind
            .subscribe
            .contains(&"openWB/vehicle/template/charge_template/42".to_string()));
        // The same payload again is a no-op.
        assert_eq!(
            coordinator.apply_message(
                "openWB/chargepoint/4/get/connected_vehicle/config",
                r#"{"charge_template": 42}"#,
            ),
            None
        );
        // A different id swaps old topics for new ones.
        let rebind = coordinator
            .apply_message(
                "openWB/chargepoint/4/get/connected_vehicle/config",
                r#"{"charge_template": 7}"#,
            )
            .unwrap();
        assert!(rebind
            .unsubscribe
            .contains(&"openWB/vehicle/template/charge_template/42".to_string()));
        assert!(rebind
            .subscribe
            .contains(&"openWB/vehicle/template/charge_template/7".to_string()));
    }

    #[test]
    fn test_charge_template_payload_updates_dynamic_fields() {
        let coordinator = chargepoint();
        coordinator.apply_message(
            "openWB/chargepoint/4/get/connected_vehicle/config",
            r#"{"charge_template": 42}"#,
        );
        coordinator.apply_message(
            "openWB/vehicle/template/charge_template/42",
            r#"{"chargemode": {"instant_charging": {"current": 16, "limit": {"selected": "soc", "soc": 80, "amount": 10000}}}}"#,
        );
        assert_eq!(
            coordinator.get("instant_charging_current"),
            Some(FieldValue::Float(16.0))
        );
        assert_eq!(
            coordinator.get("instant_charging_limitation"),
            Some(FieldValue::Text("SoC".to_string()))
        );
        assert_eq!(
            coordinator.get("instant_charging_energy_limit"),
            Some(FieldValue::Float(10.0))
        );
    }

    #[test]
    fn test_chargemode_maps_to_display_vocabulary() {
        let coordinator = chargepoint();
        coordinator.apply_message(
            "openWB/chargepoint/4/get/connected_vehicle/config",
            r#"{"charge_template": 1, "chargemode": "instant_charging"}"#,
        );
        assert_eq!(
            coordinator.get("chargemode"),
            Some(FieldValue::Text("Instant Charging".to_string()))
        );
    }

    #[test]
    fn test_failed_poll_retains_snapshot() {
        let coordinator = chargepoint();
        coordinator.apply_poll(&json!({"power": 2300}));
        let result = apply_poll_result(
            &coordinator,
            Err(ApiClientError::Communication("connect timed out".to_string())),
        );
        assert!(matches!(result, Err(UpdateError::Failed(_))));
        assert_eq!(coordinator.get("power"), Some(FieldValue::Float(2300.0)));
    }

    #[test]
    fn test_poll_result_unwraps_device_key() {
        let coordinator = chargepoint();
        apply_poll_result(
            &coordinator,
            Ok(json!({"chargepoint_4": {"power": 2300, "plug_state": "1"}})),
        )
        .unwrap();
        assert_eq!(coordinator.get("power"), Some(FieldValue::Float(2300.0)));

        let missing = apply_poll_result(&coordinator, Ok(json!({"chargepoint_9": {}})));
        assert!(matches!(missing, Err(UpdateError::MissingDevice(_))));
        // Retain-on-failure applies to malformed bodies too.
        assert_eq!(coordinator.get("power"), Some(FieldValue::Float(2300.0)));
    }

    #[test]
    fn test_merge_builds_on_the_snapshot_current_at_merge_time() {
        // A field merged after a poll must land in the polled map, not
        // in some earlier copy that would erase the poll's values.
        let coordinator = chargepoint();
        coordinator.apply_poll(&json!({"power": 100}));
        coordinator.apply_poll(&json!({"power": 2300, "plug_state": "1"}));
        coordinator.merge_field("manual_lock", FieldValue::Bool(true));

        let snap = coordinator.snapshot();
        assert_eq!(snap.get("power"), Some(&FieldValue::Float(2300.0)));
        assert_eq!(snap.get("plug_state"), Some(&FieldValue::Bool(true)));
        assert_eq!(snap.get("manual_lock"), Some(&FieldValue::Bool(true)));
    }

    #[test]
    fn test_events_carry_fresh_snapshot() {
        let coordinator = chargepoint();
        let mut rx = coordinator.subscribe();
        coordinator.apply_poll(&json!({"power": 42}));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.device, "chargepoint_4");
        assert_eq!(event.snapshot.get("power"), Some(&FieldValue::Float(42.0)));
        assert!(!event.context_id.is_empty());
    }

    #[test]
    fn test_vehicle_id_feeds_dynamic_binding() {
        let coordinator = chargepoint();
        coordinator.apply_message(
            "openWB/chargepoint/4/get/connected_vehicle/info",
            r#"{"id": 3, "name": "Zoe"}"#,
        );
        assert_eq!(coordinator.dynamic_binding().vehicle_id, Some(3));
    }
}
