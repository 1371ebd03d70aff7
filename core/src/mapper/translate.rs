//! Per-mapping DMX-slice-to-payload-fragment translation (spec §4.B step 4).

use serde_json::{Map, Value};

use crate::capabilities::DeviceMode;
use crate::store::{Mapping, MappingField, MappingType};

/// `corrected = clamp(round(((raw/255)^gamma) * 255 * dimmer))`
/// (spec §B.5, taken from `artnet.py::_apply_gamma_dimmer`). `gamma` and
/// `dimmer` are expected to already be floor/range-clamped by
/// [`crate::capabilities::normalize_capabilities`].
pub fn apply_gamma_dimmer(raw: u8, gamma: f64, dimmer: f64) -> u8 {
    let normalized = (raw as f64 / 255.0).clamp(0.0, 1.0);
    let corrected = normalized.powf(gamma);
    let scaled = corrected * 255.0 * dimmer;
    scaled.clamp(0.0, 255.0).round() as u8
}

/// A mapping plus the capability fields its translation needs, resolved at
/// cache-build time so the per-frame hot path never touches the Store
/// (spec §4.B "Mapping cache").
#[derive(Debug, Clone)]
pub struct CachedMapping {
    pub mapping_id: i64,
    pub device_id: String,
    pub channel: u16,
    pub length: u16,
    pub mapping_type: MappingType,
    pub field: Option<MappingField>,
    pub range_fields: Vec<MappingField>,
    pub mode: DeviceMode,
    pub gamma: f64,
    pub dimmer: f64,
    pub color_temp_range: Option<(u32, u32)>,
}

impl CachedMapping {
    pub fn from_mapping(mapping: &Mapping, mode: DeviceMode, gamma: f64, dimmer: f64, color_temp_range: Option<(u32, u32)>) -> Option<Self> {
        match mapping.mapping_type {
            MappingType::Discrete => {
                mapping.field?;
            }
            MappingType::Range => {
                let fields = mapping.fields.as_ref()?;
                if fields.is_empty() {
                    return None;
                }
            }
        }
        Some(Self {
            mapping_id: mapping.id,
            device_id: mapping.device_id.clone(),
            channel: mapping.channel,
            length: mapping.length,
            mapping_type: mapping.mapping_type,
            field: mapping.field,
            range_fields: mapping.fields.clone().unwrap_or_default(),
            mode,
            gamma,
            dimmer,
            color_temp_range,
        })
    }
}

fn color_field_key(field: MappingField) -> Option<&'static str> {
    match field {
        MappingField::R => Some("r"),
        MappingField::G => Some("g"),
        MappingField::B => Some("b"),
        MappingField::W => Some("w"),
        _ => None,
    }
}

/// Translates a `range` mapping's slice (spec §4.B step 4 "range").
pub fn translate_range(mapping: &CachedMapping, slice: &[u8]) -> Option<Map<String, Value>> {
    if slice.len() < mapping.range_fields.len() {
        return None;
    }
    let mut color = Map::new();
    let mut brightness: Option<u8> = None;
    for (idx, field) in mapping.range_fields.iter().enumerate() {
        let corrected = apply_gamma_dimmer(slice[idx], mapping.gamma, mapping.dimmer);
        match field {
            MappingField::Dimmer => brightness = Some(corrected),
            other => {
                if let Some(key) = color_field_key(*other) {
                    color.insert(key.to_string(), Value::from(corrected));
                }
            }
        }
    }

    let mut fragment = Map::new();
    if mapping.mode == DeviceMode::Brightness {
        let value = brightness.unwrap_or(0);
        if value == 0 {
            fragment.insert("turn".to_string(), Value::from("off"));
        } else {
            fragment.insert("turn".to_string(), Value::from("on"));
            fragment.insert("brightness".to_string(), Value::from(value));
        }
        return Some(fragment);
    }

    if !color.is_empty() {
        fragment.insert("color".to_string(), Value::Object(color));
    }
    if let Some(b) = brightness {
        fragment.insert("brightness".to_string(), Value::from(b));
    }
    if fragment.is_empty() {
        None
    } else {
        Some(fragment)
    }
}

/// Translates a `discrete` mapping's single byte (spec §4.B step 4 "discrete").
pub fn translate_discrete(mapping: &CachedMapping, raw: u8) -> Option<Map<String, Value>> {
    let field = mapping.field?;
    let mut fragment = Map::new();
    match field {
        MappingField::Power => {
            fragment.insert(
                "turn".to_string(),
                Value::from(if raw >= 128 { "on" } else { "off" }),
            );
            Some(fragment)
        }
        MappingField::Dimmer => {
            let corrected = apply_gamma_dimmer(raw, mapping.gamma, mapping.dimmer);
            if corrected == 0 {
                fragment.insert("turn".to_string(), Value::from("off"));
            } else {
                fragment.insert("turn".to_string(), Value::from("on"));
                fragment.insert("brightness".to_string(), Value::from(corrected));
            }
            Some(fragment)
        }
        MappingField::Ct => {
            if raw == 0 {
                // Allow the RGB path to dominate (spec §4.B step 4 "ct").
                return None;
            }
            let (low, high) = mapping.color_temp_range.unwrap_or((2000, 9000));
            let span = high.saturating_sub(low) as f64;
            let kelvin = low as f64 + (raw as f64 / 255.0) * span;
            fragment.insert("color_temp".to_string(), Value::from(kelvin.round() as u32));
            Some(fragment)
        }
        MappingField::R | MappingField::G | MappingField::B | MappingField::W => {
            let key = color_field_key(field)?;
            let corrected = apply_gamma_dimmer(raw, mapping.gamma, mapping.dimmer);
            let mut color = Map::new();
            color.insert(key.to_string(), Value::from(corrected));
            fragment.insert("color".to_string(), Value::Object(color));
            Some(fragment)
        }
    }
}

/// Shallow-merges `fragment` into `target`: `color` sub-maps merge key by
/// key, every other key overwrites (spec §4.B step 5 "Merging rule").
pub fn merge_fragment(target: &mut Map<String, Value>, fragment: Map<String, Value>) {
    for (key, value) in fragment {
        if key == "color" {
            if let Value::Object(new_color) = value {
                let entry = target
                    .entry("color".to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(existing) = entry {
                    for (ck, cv) in new_color {
                        existing.insert(ck, cv);
                    }
                }
            } else {
                target.insert(key, value);
            }
        } else {
            target.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb_mapping() -> CachedMapping {
        CachedMapping {
            mapping_id: 1,
            device_id: "dev-1".into(),
            channel: 1,
            length: 3,
            mapping_type: MappingType::Range,
            field: None,
            range_fields: vec![MappingField::R, MappingField::G, MappingField::B],
            mode: DeviceMode::Rgb,
            gamma: 1.0,
            dimmer: 1.0,
            color_temp_range: None,
        }
    }

    #[test]
    fn gamma_dimmer_identity_at_defaults() {
        for raw in [0u8, 1, 64, 128, 200, 255] {
            assert_eq!(apply_gamma_dimmer(raw, 1.0, 1.0), raw);
        }
    }

    #[test]
    fn range_rgb_produces_color_map() {
        let mapping = rgb_mapping();
        let fragment = translate_range(&mapping, &[0x80, 0x40, 0x20]).unwrap();
        assert_eq!(
            fragment.get("color").unwrap(),
            &serde_json::json!({"r": 128, "g": 64, "b": 32})
        );
    }

    #[test]
    fn range_brightness_zero_is_turn_off() {
        let mut mapping = rgb_mapping();
        mapping.mode = DeviceMode::Brightness;
        mapping.range_fields = vec![MappingField::Dimmer];
        let fragment = translate_range(&mapping, &[0x00]).unwrap();
        assert_eq!(fragment.get("turn").unwrap(), "off");
        assert!(!fragment.contains_key("brightness"));
    }

    #[test]
    fn range_brightness_nonzero_is_turn_on_with_value() {
        let mut mapping = rgb_mapping();
        mapping.mode = DeviceMode::Brightness;
        mapping.range_fields = vec![MappingField::Dimmer];
        let fragment = translate_range(&mapping, &[0x80]).unwrap();
        assert_eq!(fragment.get("turn").unwrap(), "on");
        assert_eq!(fragment.get("brightness").unwrap(), 128);
    }

    #[test]
    fn discrete_power_threshold_at_128() {
        let mut mapping = rgb_mapping();
        mapping.mapping_type = MappingType::Discrete;
        mapping.field = Some(MappingField::Power);
        assert_eq!(translate_discrete(&mapping, 127).unwrap()["turn"], "off");
        assert_eq!(translate_discrete(&mapping, 128).unwrap()["turn"], "on");
    }

    #[test]
    fn discrete_ct_zero_emits_nothing() {
        let mut mapping = rgb_mapping();
        mapping.mapping_type = MappingType::Discrete;
        mapping.field = Some(MappingField::Ct);
        assert!(translate_discrete(&mapping, 0).is_none());
    }

    #[test]
    fn discrete_ct_scales_into_range() {
        let mut mapping = rgb_mapping();
        mapping.mapping_type = MappingType::Discrete;
        mapping.field = Some(MappingField::Ct);
        mapping.color_temp_range = Some((2000, 9000));
        let fragment = translate_discrete(&mapping, 255).unwrap();
        assert_eq!(fragment["color_temp"], 9000);
        let fragment = translate_discrete(&mapping, 0x01).unwrap();
        assert!(fragment["color_temp"].as_u64().unwrap() > 2000);
    }

    #[test]
    fn merge_shallow_merges_color_and_overwrites_other_keys() {
        let mut target = Map::new();
        target.insert("color".to_string(), serde_json::json!({"r": 1}));
        target.insert("brightness".to_string(), Value::from(10));

        let mut fragment = Map::new();
        fragment.insert("color".to_string(), serde_json::json!({"g": 2}));
        fragment.insert("brightness".to_string(), Value::from(20));

        merge_fragment(&mut target, fragment);
        assert_eq!(target["color"], serde_json::json!({"r": 1, "g": 2}));
        assert_eq!(target["brightness"], 20);
    }
}
