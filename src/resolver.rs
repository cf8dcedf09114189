//! Topic and endpoint template resolution.
//!
//! Catalog rows carry address templates with `{placeholder}` segments.
//! Static placeholders (`mqtt_root`, `device_type`, `device_id`) come
//! from the device binding; dynamic ones (`charge_template_id`,
//! `vehicle_id`) are discovered at runtime and stay unbound until then.
//! Resolving a template with an unbound dynamic placeholder is a
//! recoverable condition, not a panic: the caller skips or defers the
//! address.

use thiserror::Error;

use crate::config::DeviceBinding;

#[derive(Debug, Error, PartialEq)]
pub enum ResolveError {
    #[error("placeholder `{{{placeholder}}}` is not bound yet")]
    UnresolvedAddress { placeholder: String },
    #[error("unknown placeholder `{{{placeholder}}}`")]
    UnknownPlaceholder { placeholder: String },
    #[error("unbalanced braces in template `{template}`")]
    UnbalancedBraces { template: String },
    #[error("template `{template}` needs a device id but the binding has none")]
    MissingDeviceId { template: String },
}

/// Runtime-discovered ids for the dynamic placeholders.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DynamicBinding {
    pub charge_template_id: Option<u64>,
    pub vehicle_id: Option<u64>,
}

const KNOWN_PLACEHOLDERS: &[&str] =
    &["mqtt_root", "device_type", "device_id", "charge_template_id", "vehicle_id"];

/// Substitute every placeholder in `template`. Already-concrete input
/// (no braces) passes through unchanged, so resolution is idempotent.
pub fn resolve(
    template: &str,
    binding: &DeviceBinding,
    dynamic: &DynamicBinding,
) -> Result<String, ResolveError> {
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let literal = &rest[..start];
        if literal.contains('}') {
            return Err(ResolveError::UnbalancedBraces { template: template.to_string() });
        }
        out.push_str(literal);
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| ResolveError::UnbalancedBraces { template: template.to_string() })?;
        match &after[..end] {
            "mqtt_root" => out.push_str(&binding.mqtt_root),
            "device_type" => out.push_str(binding.device_type.wire_name()),
            "device_id" => match binding.device_id {
                Some(id) => out.push_str(&id.to_string()),
                None => {
                    return Err(ResolveError::MissingDeviceId { template: template.to_string() })
                }
            },
            "charge_template_id" => match dynamic.charge_template_id {
                Some(id) => out.push_str(&id.to_string()),
                None => {
                    return Err(ResolveError::UnresolvedAddress {
                        placeholder: "charge_template_id".to_string(),
                    })
                }
            },
            "vehicle_id" => match dynamic.vehicle_id {
                Some(id) => out.push_str(&id.to_string()),
                None => {
                    return Err(ResolveError::UnresolvedAddress {
                        placeholder: "vehicle_id".to_string(),
                    })
                }
            },
            other => {
                return Err(ResolveError::UnknownPlaceholder { placeholder: other.to_string() })
            }
        }
        rest = &after[end + 1..];
    }
    if rest.contains('}') {
        return Err(ResolveError::UnbalancedBraces { template: template.to_string() });
    }
    out.push_str(rest);
    Ok(out)
}

/// Startup-time template lint: balanced braces, known placeholders.
pub fn check_template(template: &str) -> Result<(), ResolveError> {
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        if rest[..start].contains('}') {
            return Err(ResolveError::UnbalancedBraces { template: template.to_string() });
        }
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| ResolveError::UnbalancedBraces { template: template.to_string() })?;
        let name = &after[..end];
        if !KNOWN_PLACEHOLDERS.contains(&name) {
            return Err(ResolveError::UnknownPlaceholder { placeholder: name.to_string() });
        }
        rest = &after[end + 1..];
    }
    if rest.contains('}') {
        return Err(ResolveError::UnbalancedBraces { template: template.to_string() });
    }
    Ok(())
}

/// Whether a template waits on the charge template id.
pub fn needs_charge_template(template: &str) -> bool {
    template.contains("{charge_template_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DeviceType;

    fn binding() -> DeviceBinding {
        DeviceBinding {
            device_type: DeviceType::Chargepoint,
            device_id: Some(4),
            mqtt_root: "openWB".to_string(),
            wallbox_power_kw: 11,
            vehicles: Default::default(),
        }
    }

    #[test]
    fn test_resolve_static_placeholders() {
        let topic = resolve(
            "{mqtt_root}/{device_type}/{device_id}/get/power",
            &binding(),
            &DynamicBinding::default(),
        )
        .unwrap();
        assert_eq!(topic, "openWB/chargepoint/4/get/power");
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let b = binding();
        let dynamic = DynamicBinding { charge_template_id: Some(42), vehicle_id: None };
        let once = resolve(crate::catalog::CHARGE_TEMPLATE, &b, &dynamic).unwrap();
        assert_eq!(once, "openWB/vehicle/template/charge_template/42");
        let twice = resolve(&once, &b, &dynamic).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_unbound_charge_template_is_recoverable() {
        let err = resolve(crate::catalog::CHARGE_TEMPLATE, &binding(), &DynamicBinding::default())
            .unwrap_err();
        assert_eq!(
            err,
            ResolveError::UnresolvedAddress { placeholder: "charge_template_id".to_string() }
        );
    }

    #[test]
    fn test_unknown_placeholder_rejected() {
        let err =
            resolve("{mqtt_root}/{bogus}", &binding(), &DynamicBinding::default()).unwrap_err();
        assert_eq!(err, ResolveError::UnknownPlaceholder { placeholder: "bogus".to_string() });
    }

    #[test]
    fn test_unbalanced_braces_rejected() {
        assert!(matches!(
            check_template("{mqtt_root}/oops{"),
            Err(ResolveError::UnbalancedBraces { .. })
        ));
        assert!(matches!(
            check_template("{mqtt_root}/oops}"),
            Err(ResolveError::UnbalancedBraces { .. })
        ));
        assert!(check_template("{mqtt_root}/{device_type}/{device_id}/ok").is_ok());
    }

    #[test]
    fn test_missing_device_id() {
        let mut b = binding();
        b.device_id = None;
        let err = resolve("{mqtt_root}/{device_type}/{device_id}/get/power", &b, &DynamicBinding::default())
            .unwrap_err();
        assert!(matches!(err, ResolveError::MissingDeviceId { .. }));
    }
}
