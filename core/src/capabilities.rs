//! Device capability normalization and validation (spec §3 "Capabilities").
//!
//! Device and catalog input arrives as heterogeneous JSON — different
//! spellings for the same concept, boolean-ish strings, nested range
//! shapes. This module turns that into the canonical [`NormalizedCapabilities`]
//! record and never lets the raw JSON leak past the Store boundary (spec §9
//! "Dynamic JSON capabilities").

use std::collections::BTreeSet;

use serde_json::Value;

use crate::error::BridgeError;

/// Color/CT/effect modes a device can operate in.
pub type ColorModes = BTreeSet<String>;

/// A canonical, statically-typed capability record derived from possibly
/// messy device or catalog JSON (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedCapabilities {
    pub model: Option<String>,
    pub firmware: Option<String>,
    pub supports_brightness: bool,
    pub supports_white: bool,
    pub color_modes: ColorModes,
    pub color_temp_range: Option<(u32, u32)>,
    pub effects: BTreeSet<String>,
    pub mode: DeviceMode,
    pub channel_order: Vec<ChannelField>,
    pub gamma: f64,
    pub dimmer: f64,
    /// Raw vendor-extra fields preserved for round-tripping into the
    /// device's `capabilities-json` column, never inspected by core logic.
    pub raw: Value,
    /// Stable fingerprint of `raw` (via a JSON canonicalization), used by
    /// [`CapabilityCache`] to detect when re-normalization is needed.
    pub fingerprint: String,
}

/// Device operating mode (spec §3 `mode: {rgb|rgbw|brightness|custom|discrete}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    Rgb,
    Rgbw,
    Brightness,
    Custom,
    Discrete,
}

/// One entry in a device's `channel_order` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelField {
    R,
    G,
    B,
    W,
    Dimmer,
}

impl ChannelField {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "r" => Some(ChannelField::R),
            "g" => Some(ChannelField::G),
            "b" => Some(ChannelField::B),
            "w" => Some(ChannelField::W),
            "dimmer" | "brightness" => Some(ChannelField::Dimmer),
            _ => None,
        }
    }
}

impl NormalizedCapabilities {
    pub fn supports_color(&self) -> bool {
        self.color_modes.contains("color")
    }

    pub fn supports_color_temperature(&self) -> bool {
        self.color_modes.contains("ct") || self.color_temp_range.is_some()
    }

    pub fn supports_effects(&self) -> bool {
        !self.effects.is_empty()
    }

    /// Minimum `length` a `range` mapping needs to carry one byte per
    /// field in `channel_order`; `custom` mode has no fixed shape, so it
    /// imposes no minimum (spec §4.B "whose `length` is less than the
    /// required channel count for the device's mode").
    pub fn required_channels(&self) -> usize {
        if self.mode == DeviceMode::Custom {
            0
        } else {
            self.channel_order.len()
        }
    }

    /// `(model, firmware)` key used by [`CapabilityCache`].
    pub fn cache_key(&self) -> (String, String) {
        (
            self.model.clone().unwrap_or_default(),
            self.firmware.clone().unwrap_or_default(),
        )
    }
}

fn coerce_bool(value: Option<&Value>, default: bool) -> bool {
    match value {
        None | Some(Value::Null) => default,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(default),
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => true,
            "false" | "no" | "0" | "off" => false,
            _ => default,
        },
        _ => default,
    }
}

fn normalize_string_set(value: Option<&Value>) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    match value {
        Some(Value::String(s)) => {
            out.insert(s.trim().to_lowercase());
        }
        Some(Value::Array(items)) => {
            for item in items {
                if let Value::String(s) = item {
                    let normalized = s.trim().to_lowercase();
                    if !normalized.is_empty() {
                        out.insert(normalized);
                    }
                }
            }
        }
        _ => {}
    }
    out
}

fn get_any<'a>(obj: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    let map = obj.as_object()?;
    keys.iter().find_map(|k| map.get(*k))
}

fn normalize_color_modes(capabilities: &Value) -> BTreeSet<String> {
    let mut modes = BTreeSet::new();
    let mut explicit = false;
    let mut color_temp_hint = false;

    if let Some(obj) = capabilities.as_object() {
        if let Some(raw) = get_any(capabilities, &["color_modes", "colorModes", "modes"]) {
            explicit = true;
            modes.extend(normalize_string_set(Some(raw)));
        }
        if let Some(Value::String(single)) = obj.get("mode") {
            explicit = true;
            modes.insert(single.trim().to_lowercase());
        }
        const CT_HINT_KEYS: &[&str] = &[
            "ct",
            "color_temp",
            "colorTemperature",
            "color_temp_range",
            "ct_range",
            "colorTempRange",
            "colorTemperatureRange",
        ];
        if CT_HINT_KEYS.iter().any(|k| obj.contains_key(*k)) {
            explicit = true;
            color_temp_hint = true;
        }
    }

    let mut normalized = BTreeSet::new();
    for mode in &modes {
        match mode.as_str() {
            "color" | "rgb" | "rgbw" | "white" => {
                normalized.insert("color".to_string());
            }
            "ct" | "cct" | "color_temp" | "color temperature" | "temperature" => {
                normalized.insert("ct".to_string());
            }
            "scene" | "effects" | "effect" => {
                normalized.insert("effect".to_string());
            }
            other => {
                normalized.insert(other.to_string());
            }
        }
    }
    if color_temp_hint {
        normalized.insert("ct".to_string());
    }
    if normalized.is_empty() && !modes.is_empty() {
        normalized = modes;
    }
    if normalized.is_empty() && !explicit {
        normalized.insert("color".to_string());
    }
    normalized
}

fn coerce_two_u32(value: &Value) -> Option<(u32, u32)> {
    match value {
        Value::Object(obj) => {
            let low = obj.get("min").or_else(|| obj.get("minimum"))?;
            let high = obj.get("max").or_else(|| obj.get("maximum"))?;
            Some((low.as_u64()? as u32, high.as_u64()? as u32))
        }
        Value::Array(items) if items.len() == 2 => {
            Some((items[0].as_u64()? as u32, items[1].as_u64()? as u32))
        }
        _ => None,
    }
}

fn normalize_color_temp_range(capabilities: &Value) -> Option<(u32, u32)> {
    const KEYS: &[&str] = &[
        "color_temp_range",
        "ct_range",
        "colorTempRange",
        "colorTemperatureRange",
        "color_temp",
        "colorTemperature",
        "ct",
    ];
    let obj = capabilities.as_object()?;
    for key in KEYS {
        if let Some(v) = obj.get(*key) {
            if let Some((low, high)) = coerce_two_u32(v) {
                return Some(if low > high { (high, low) } else { (low, high) });
            }
        }
    }
    None
}

fn normalize_effects(capabilities: &Value) -> BTreeSet<String> {
    normalize_string_set(get_any(
        capabilities,
        &["effects", "scenes", "scene_modes", "moods"],
    ))
}

fn extract_string(capabilities: &Value, keys: &[&str]) -> Option<String> {
    let obj = capabilities.as_object()?;
    for key in keys {
        if let Some(v) = obj.get(*key) {
            if !v.is_null() {
                return Some(match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
            }
        }
    }
    None
}

fn coerce_float(capabilities: &Value, key: &str, default: f64) -> f64 {
    capabilities
        .as_object()
        .and_then(|o| o.get(key))
        .and_then(|v| v.as_f64())
        .unwrap_or(default)
}

fn coerce_mode(capabilities: &Value, default: DeviceMode) -> DeviceMode {
    let raw = capabilities
        .as_object()
        .and_then(|o| o.get("mode"))
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_lowercase());
    match raw.as_deref() {
        Some("rgb") => DeviceMode::Rgb,
        Some("rgbw") => DeviceMode::Rgbw,
        Some("brightness") => DeviceMode::Brightness,
        Some("custom") => DeviceMode::Custom,
        Some("discrete") => DeviceMode::Discrete,
        _ => default,
    }
}

fn default_channel_order(mode: DeviceMode) -> Vec<ChannelField> {
    match mode {
        DeviceMode::Rgb => vec![ChannelField::R, ChannelField::G, ChannelField::B],
        DeviceMode::Rgbw => vec![
            ChannelField::R,
            ChannelField::G,
            ChannelField::B,
            ChannelField::W,
        ],
        DeviceMode::Brightness => vec![ChannelField::Dimmer],
        DeviceMode::Custom | DeviceMode::Discrete => Vec::new(),
    }
}

fn coerce_channel_order(capabilities: &Value, mode: DeviceMode) -> Vec<ChannelField> {
    let raw = get_any(capabilities, &["order", "channel_order"]);
    match raw {
        Some(Value::String(s)) => {
            let parsed: Vec<ChannelField> = s
                .split(|c: char| !c.is_alphanumeric())
                .filter_map(ChannelField::parse)
                .collect();
            if parsed.is_empty() {
                default_channel_order(mode)
            } else {
                parsed
            }
        }
        Some(Value::Array(items)) => {
            let parsed: Vec<ChannelField> = items
                .iter()
                .filter_map(|v| v.as_str())
                .filter_map(ChannelField::parse)
                .collect();
            if parsed.is_empty() {
                default_channel_order(mode)
            } else {
                parsed
            }
        }
        _ => default_channel_order(mode),
    }
}

/// Canonicalizes `value` into a stable string for fingerprint comparison
/// (sorted object keys, matching the original's `json.dumps(sort_keys=True)`).
fn fingerprint(value: &Value) -> String {
    fn canonical(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted: std::collections::BTreeMap<String, Value> =
                    std::collections::BTreeMap::new();
                for (k, v) in map {
                    sorted.insert(k.clone(), canonical(v));
                }
                serde_json::to_value(sorted).unwrap_or(Value::Null)
            }
            Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
            other => other.clone(),
        }
    }
    canonical(value).to_string()
}

/// Normalizes raw device/catalog capability JSON into a canonical record
/// (spec §9 "Dynamic JSON capabilities").
pub fn normalize_capabilities(model: Option<String>, capabilities: &Value) -> NormalizedCapabilities {
    let base = if capabilities.is_object() {
        capabilities.clone()
    } else {
        Value::Object(Default::default())
    };

    let color_modes = normalize_color_modes(&base);
    let supports_brightness = coerce_bool(
        get_any(&base, &["supports_brightness", "brightness"]),
        true,
    );
    let supports_white = coerce_bool(get_any(&base, &["supports_white", "white"]), false);
    let color_temp_range = normalize_color_temp_range(&base);
    let effects = normalize_effects(&base);
    let firmware = extract_string(&base, &["firmware", "fwVersion", "fw_version", "version"]);

    let default_mode = if supports_white {
        DeviceMode::Rgbw
    } else {
        DeviceMode::Rgb
    };
    let mode = coerce_mode(&base, default_mode);
    let channel_order = coerce_channel_order(&base, mode);
    let gamma = coerce_float(&base, "gamma", 1.0).max(0.1);
    let dimmer = coerce_float(&base, "dimmer", 1.0).clamp(0.0, 1.0);

    let fp = fingerprint(&base);

    NormalizedCapabilities {
        model,
        firmware,
        supports_brightness,
        supports_white,
        color_modes,
        color_temp_range,
        effects,
        mode,
        channel_order,
        gamma,
        dimmer,
        raw: base,
        fingerprint: fp,
    }
}

/// Memoizes [`normalize_capabilities`] per `(model, firmware)`, invalidated
/// by fingerprint change (spec §B.2).
#[derive(Default)]
pub struct CapabilityCache {
    entries: std::collections::HashMap<(String, String), NormalizedCapabilities>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn normalize(&mut self, model: Option<String>, capabilities: &Value) -> NormalizedCapabilities {
        let normalized = normalize_capabilities(model, capabilities);
        let key = normalized.cache_key();
        if let Some(cached) = self.entries.get(&key) {
            if cached.fingerprint == normalized.fingerprint {
                return cached.clone();
            }
        }
        self.entries.insert(key, normalized.clone());
        normalized
    }
}

/// Ensures a mapping's intended `mode` is actually supported by the device
/// (spec §B.4 `validate_mapping_mode`).
pub fn validate_mapping_mode(mode: &str, capabilities: &NormalizedCapabilities) -> Result<(), BridgeError> {
    if mode == "brightness" && !capabilities.supports_brightness {
        return Err(BridgeError::Validation(
            "device does not support brightness control".into(),
        ));
    }
    if matches!(mode, "rgb" | "rgbw" | "custom" | "color") && !capabilities.supports_color() {
        return Err(BridgeError::Validation(format!(
            "device does not support color mode '{mode}'"
        )));
    }
    Ok(())
}

/// Sanitizes a direct command payload to what the device actually
/// advertises, dropping unsupported fields with a warning rather than
/// failing outright (spec §B.4 `validate_command_payload`).
pub fn validate_command_payload(
    payload: &Value,
    capabilities: &NormalizedCapabilities,
) -> Result<(Value, Vec<String>), BridgeError> {
    let Some(obj) = payload.as_object() else {
        return Ok((payload.clone(), Vec::new()));
    };

    let mut sanitized = serde_json::Map::new();
    let mut warnings = Vec::new();

    if let Some(brightness) = obj.get("brightness") {
        if capabilities.supports_brightness {
            sanitized.insert("brightness".into(), brightness.clone());
        } else {
            warnings.push("brightness is not supported by this device; value dropped".into());
        }
    }

    if let Some(color) = obj.get("color") {
        if capabilities.supports_color() {
            sanitized.insert("color".into(), color.clone());
        } else {
            warnings.push("color payload dropped because device does not support color control".into());
        }
    }

    if let Some((ct_key, ct_val)) = ["color_temp", "colorTemperature", "ct", "temperature"]
        .iter()
        .find_map(|k| obj.get(*k).map(|v| (*k, v)))
    {
        if capabilities.supports_color_temperature() {
            match ct_val.as_i64() {
                Some(mut ct_value) => {
                    if let Some((low, high)) = capabilities.color_temp_range {
                        let clamped = ct_value.clamp(low as i64, high as i64);
                        if clamped != ct_value {
                            warnings.push(format!(
                                "color temperature {ct_value}K clamped to supported range {low}-{high}K"
                            ));
                        }
                        ct_value = clamped;
                    }
                    sanitized.insert("color_temp".into(), Value::from(ct_value));
                }
                None => warnings.push(format!("color temperature '{ct_val}' is not a number; value dropped")),
            }
        } else {
            let _ = ct_key;
            warnings.push("color temperature is not supported; value dropped".into());
        }
    }

    if let Some((_, effect_val)) = ["effect", "scene"].iter().find_map(|k| obj.get(*k).map(|v| (*k, v))) {
        let effect_value = match effect_val {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if !capabilities.supports_effects() {
            warnings.push("effects are not supported; effect value dropped".into());
        } else {
            let allowed_lower: BTreeSet<String> =
                capabilities.effects.iter().map(|e| e.to_lowercase()).collect();
            if !allowed_lower.is_empty() && !allowed_lower.contains(&effect_value.to_lowercase()) {
                warnings.push(format!(
                    "effect '{effect_value}' is not supported by this device; value dropped"
                ));
            } else {
                sanitized.insert("effect".into(), Value::String(effect_value));
            }
        }
    }

    if sanitized.is_empty() {
        return Err(BridgeError::Validation(
            "payload contains only unsupported fields for this device".into(),
        ));
    }

    Ok((Value::Object(sanitized), warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_to_color_mode_when_silent() {
        let caps = normalize_capabilities(Some("H6008".into()), &json!({}));
        assert!(caps.supports_color());
        assert!(caps.supports_brightness);
    }

    #[test]
    fn accepts_alternate_spellings_for_color_modes() {
        let caps = normalize_capabilities(None, &json!({"colorModes": ["RGB", " CT "]}));
        assert!(caps.supports_color());
        assert!(caps.supports_color_temperature());
    }

    #[test]
    fn color_temp_range_swaps_inverted_bounds() {
        let caps = normalize_capabilities(None, &json!({"ct_range": [6500, 2700]}));
        assert_eq!(caps.color_temp_range, Some((2700, 6500)));
    }

    #[test]
    fn boolean_ish_strings_are_coerced() {
        let caps = normalize_capabilities(None, &json!({"supports_brightness": "off"}));
        assert!(!caps.supports_brightness);
    }

    #[test]
    fn gamma_is_floor_clamped_and_dimmer_range_clamped() {
        let caps = normalize_capabilities(None, &json!({"gamma": 0.0, "dimmer": 1.5}));
        assert_eq!(caps.gamma, 0.1);
        assert_eq!(caps.dimmer, 1.0);
    }

    #[test]
    fn cache_reuses_normalization_until_fingerprint_changes() {
        let mut cache = CapabilityCache::new();
        let caps = json!({"mode": "rgb"});
        let a = cache.normalize(Some("H6008".into()), &caps);
        let b = cache.normalize(Some("H6008".into()), &caps);
        assert_eq!(a.fingerprint, b.fingerprint);

        let different = json!({"mode": "rgbw"});
        let c = cache.normalize(Some("H6008".into()), &different);
        assert_ne!(a.fingerprint, c.fingerprint);
    }

    #[test]
    fn validate_mapping_mode_rejects_unsupported_color() {
        let caps = normalize_capabilities(None, &json!({"mode": "brightness", "color_modes": []}));
        assert!(validate_mapping_mode("rgb", &caps).is_err());
    }

    #[test]
    fn validate_command_payload_drops_unsupported_fields_with_warning() {
        let caps = normalize_capabilities(None, &json!({"color_modes": []}));
        let (sanitized, warnings) =
            validate_command_payload(&json!({"brightness": 50}), &caps).unwrap();
        assert_eq!(sanitized, json!({"brightness": 50}));
        assert!(warnings.is_empty());

        let err = validate_command_payload(&json!({"color": {"r": 1, "g": 2, "b": 3}}), &caps);
        assert!(err.is_err());
    }
}
