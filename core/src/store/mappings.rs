//! Mapping domain types, validation, and template expansion (spec §3
//! "Mapping", §B.3 "Mapping templates").

use serde::{Deserialize, Serialize};

use crate::capabilities::{ChannelField, NormalizedCapabilities};
use crate::error::BridgeError;

/// `mapping_type ∈ {range, discrete}` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingType {
    Range,
    Discrete,
}

/// A field a single-channel discrete mapping (or a range mapping's derived
/// `fields`) can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingField {
    R,
    G,
    B,
    W,
    Dimmer,
    Ct,
    Power,
}

impl MappingField {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingField::R => "r",
            MappingField::G => "g",
            MappingField::B => "b",
            MappingField::W => "w",
            MappingField::Dimmer => "dimmer",
            MappingField::Ct => "ct",
            MappingField::Power => "power",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "r" => Some(MappingField::R),
            "g" => Some(MappingField::G),
            "b" => Some(MappingField::B),
            "w" => Some(MappingField::W),
            "dimmer" => Some(MappingField::Dimmer),
            "ct" => Some(MappingField::Ct),
            "power" => Some(MappingField::Power),
            _ => None,
        }
    }
}

/// A persistent mapping row (spec §3).
#[derive(Debug, Clone)]
pub struct Mapping {
    pub id: i64,
    pub device_id: String,
    pub universe: u16,
    pub channel: u16,
    pub length: u16,
    pub mapping_type: MappingType,
    pub field: Option<MappingField>,
    /// Derived/cached ordered field list for `range` mappings; `None` for
    /// `discrete` (where `field` alone suffices).
    pub fields: Option<Vec<MappingField>>,
    pub allow_overlap: bool,
}

impl Mapping {
    pub fn channel_range(&self) -> std::ops::RangeInclusive<u16> {
        self.channel..=(self.channel + self.length - 1)
    }

    fn overlaps(&self, other: &Mapping) -> bool {
        self.channel_range().start() <= other.channel_range().end()
            && other.channel_range().start() <= self.channel_range().end()
    }
}

/// Input to `create_mapping` (spec §4.C).
#[derive(Debug, Clone)]
pub struct CreateMappingInput {
    pub device_id: String,
    pub universe: u16,
    pub channel: u16,
    pub length: u16,
    pub mapping_type: MappingType,
    pub field: Option<MappingField>,
    pub allow_overlap: bool,
}

/// Partial update to an existing mapping (spec §4.C `update_mapping`).
/// `None` fields keep their current value (`COALESCE` semantics).
#[derive(Debug, Clone, Default)]
pub struct MappingPatch {
    pub channel: Option<u16>,
    pub length: Option<u16>,
    pub mapping_type: Option<MappingType>,
    pub field: Option<Option<MappingField>>,
    pub allow_overlap: Option<bool>,
}

impl MappingPatch {
    /// Applies the patch over `current`, producing the candidate shape to
    /// validate and, if valid, persist.
    pub fn apply_to(&self, current: &Mapping) -> CreateMappingInput {
        CreateMappingInput {
            device_id: current.device_id.clone(),
            universe: current.universe,
            channel: self.channel.unwrap_or(current.channel),
            length: self.length.unwrap_or(current.length),
            mapping_type: self.mapping_type.unwrap_or(current.mapping_type),
            field: self.field.clone().unwrap_or(current.field),
            allow_overlap: self.allow_overlap.unwrap_or(current.allow_overlap),
        }
    }
}

/// Validates a mapping's own shape invariants — channel bounds, discrete
/// field/length coupling (spec §3 invariants, §8 property 1).
pub fn validate_mapping_shape(input: &CreateMappingInput) -> Result<(), BridgeError> {
    if input.channel == 0 {
        return Err(BridgeError::Validation("channel must be >= 1".into()));
    }
    let end = input.channel as u32 + input.length as u32 - 1;
    if input.length == 0 || end > 512 {
        return Err(BridgeError::Validation(format!(
            "mapping channel range {}..{} exceeds the 512-channel universe",
            input.channel, end
        )));
    }
    if input.mapping_type == MappingType::Discrete {
        if input.length != 1 {
            return Err(BridgeError::Validation(
                "discrete mappings must have length 1".into(),
            ));
        }
        if input.field.is_none() {
            return Err(BridgeError::Validation(
                "discrete mappings require a field".into(),
            ));
        }
    }
    Ok(())
}

/// Rejects a `range` mapping whose `length` is shorter than the device
/// mode's required channel count — one byte per `channel_order` entry,
/// skipped for `custom` mode (spec §4.B "whose `length` is less than the
/// required channel count for the device's mode").
pub fn validate_required_channels(length: u16, capabilities: &NormalizedCapabilities) -> Result<(), BridgeError> {
    let required = capabilities.required_channels();
    if (length as usize) < required {
        return Err(BridgeError::Validation(format!(
            "mapping length {length} is shorter than the {required} channels required by the device's mode"
        )));
    }
    Ok(())
}

/// Checks `candidate` against `existing` mappings on the same universe for
/// channel-range overlap and duplicate-field assignment, honoring
/// `allow_overlap` (spec §3 invariants, §8 property 2).
pub fn validate_against_existing(
    candidate: &CreateMappingInput,
    existing: &[Mapping],
) -> Result<(), BridgeError> {
    let candidate_as_mapping = Mapping {
        id: -1,
        device_id: candidate.device_id.clone(),
        universe: candidate.universe,
        channel: candidate.channel,
        length: candidate.length,
        mapping_type: candidate.mapping_type,
        field: candidate.field,
        fields: None,
        allow_overlap: candidate.allow_overlap,
    };

    for existing_mapping in existing.iter().filter(|m| m.universe == candidate.universe) {
        if candidate_as_mapping.overlaps(existing_mapping) && !candidate.allow_overlap {
            return Err(BridgeError::Validation(format!(
                "mapping channel range {}..={} overlaps existing mapping {} on universe {}",
                candidate.channel,
                candidate.channel + candidate.length - 1,
                existing_mapping.id,
                candidate.universe
            )));
        }
        if existing_mapping.device_id == candidate.device_id {
            if let (Some(a), Some(b)) = (candidate.field, existing_mapping.field) {
                if a == b && !candidate.allow_overlap {
                    return Err(BridgeError::Validation(format!(
                        "field '{}' is already assigned by mapping {} for device {}",
                        a.as_str(),
                        existing_mapping.id,
                        candidate.device_id
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Named mapping template catalogue (spec §B.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingTemplate {
    Rgb,
    Rgbw,
    Rgbct,
    DimRgb,
    DimRgbct,
    DimCt,
}

impl MappingTemplate {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "RGB" => Some(MappingTemplate::Rgb),
            "RGBW" => Some(MappingTemplate::Rgbw),
            "RGBCT" => Some(MappingTemplate::Rgbct),
            "DIMRGB" => Some(MappingTemplate::DimRgb),
            "DIMRGBCT" => Some(MappingTemplate::DimRgbct),
            "DIMCT" => Some(MappingTemplate::DimCt),
            _ => None,
        }
    }
}

/// Expands a template at `start_channel` into the `CreateMappingInput`s that
/// constitute it (spec §8 "Template expansion"): `RGB` produces a single
/// 3-channel range mapping; `RGBCT` adds a discrete `ct` mapping right after
/// the range block; `DIM*` variants prefix a discrete `dimmer` channel.
pub fn expand_template(
    template: MappingTemplate,
    device_id: &str,
    universe: u16,
    start_channel: u16,
    capabilities: &NormalizedCapabilities,
) -> Result<Vec<CreateMappingInput>, BridgeError> {
    validate_template_support(template, capabilities)?;

    let mut channel = start_channel;
    let mut inputs = Vec::new();

    let has_dim_prefix = matches!(
        template,
        MappingTemplate::DimRgb | MappingTemplate::DimRgbct | MappingTemplate::DimCt
    );
    if has_dim_prefix {
        inputs.push(CreateMappingInput {
            device_id: device_id.to_string(),
            universe,
            channel,
            length: 1,
            mapping_type: MappingType::Discrete,
            field: Some(MappingField::Dimmer),
            allow_overlap: false,
        });
        channel += 1;
    }

    let has_rgb_block = matches!(
        template,
        MappingTemplate::Rgb
            | MappingTemplate::Rgbct
            | MappingTemplate::DimRgb
            | MappingTemplate::DimRgbct
    );
    if has_rgb_block {
        inputs.push(CreateMappingInput {
            device_id: device_id.to_string(),
            universe,
            channel,
            length: 3,
            mapping_type: MappingType::Range,
            field: None,
            allow_overlap: false,
        });
        channel += 3;
    } else if template == MappingTemplate::Rgbw {
        inputs.push(CreateMappingInput {
            device_id: device_id.to_string(),
            universe,
            channel,
            length: 4,
            mapping_type: MappingType::Range,
            field: None,
            allow_overlap: false,
        });
        channel += 4;
    }

    let has_ct_suffix = matches!(
        template,
        MappingTemplate::Rgbct | MappingTemplate::DimRgbct | MappingTemplate::DimCt
    );
    if has_ct_suffix {
        inputs.push(CreateMappingInput {
            device_id: device_id.to_string(),
            universe,
            channel,
            length: 1,
            mapping_type: MappingType::Discrete,
            field: Some(MappingField::Ct),
            allow_overlap: false,
        });
    }

    for input in &inputs {
        validate_mapping_shape(input)?;
    }
    Ok(inputs)
}

/// Ensures the device's capabilities actually support what a template
/// requires before any row is inserted (spec §B.3 `_validate_template_support`).
fn validate_template_support(
    template: MappingTemplate,
    capabilities: &NormalizedCapabilities,
) -> Result<(), BridgeError> {
    let needs_color = matches!(
        template,
        MappingTemplate::Rgb
            | MappingTemplate::Rgbw
            | MappingTemplate::Rgbct
            | MappingTemplate::DimRgb
            | MappingTemplate::DimRgbct
    );
    let needs_ct = matches!(
        template,
        MappingTemplate::Rgbct | MappingTemplate::DimRgbct | MappingTemplate::DimCt
    );
    let needs_brightness = matches!(
        template,
        MappingTemplate::DimRgb | MappingTemplate::DimRgbct | MappingTemplate::DimCt
    );

    if needs_color && !capabilities.supports_color() {
        return Err(BridgeError::Validation(
            "device does not support color; template requires a color channel block".into(),
        ));
    }
    if needs_ct && !capabilities.supports_color_temperature() {
        return Err(BridgeError::Validation(
            "device does not support color temperature; template requires a ct channel".into(),
        ));
    }
    if needs_brightness && !capabilities.supports_brightness {
        return Err(BridgeError::Validation(
            "device does not support brightness; template requires a dimmer channel".into(),
        ));
    }
    if template == MappingTemplate::Rgbw && !capabilities.supports_white {
        return Err(BridgeError::Validation(
            "device does not support white; RGBW template requires a w channel".into(),
        ));
    }
    Ok(())
}

/// Re-derives a range mapping's `fields` from the device's `channel_order`,
/// truncated/extended to `length` — used when caching a mapping for the
/// Mapper (spec §3 "fields... derived/cached").
pub fn derive_fields_for_range(channel_order: &[ChannelField], length: u16) -> Vec<MappingField> {
    channel_order
        .iter()
        .take(length as usize)
        .map(|f| match f {
            ChannelField::R => MappingField::R,
            ChannelField::G => MappingField::G,
            ChannelField::B => MappingField::B,
            ChannelField::W => MappingField::W,
            ChannelField::Dimmer => MappingField::Dimmer,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rgb_capabilities() -> NormalizedCapabilities {
        crate::capabilities::normalize_capabilities(Some("H6008".into()), &json!({"mode": "rgb"}))
    }

    #[test]
    fn rejects_channel_zero() {
        let input = CreateMappingInput {
            device_id: "d1".into(),
            universe: 1,
            channel: 0,
            length: 3,
            mapping_type: MappingType::Range,
            field: None,
            allow_overlap: false,
        };
        assert!(validate_mapping_shape(&input).is_err());
    }

    #[test]
    fn rejects_range_exceeding_512() {
        let input = CreateMappingInput {
            device_id: "d1".into(),
            universe: 1,
            channel: 511,
            length: 3,
            mapping_type: MappingType::Range,
            field: None,
            allow_overlap: false,
        };
        assert!(validate_mapping_shape(&input).is_err());
    }

    #[test]
    fn discrete_requires_length_one_and_a_field() {
        let bad_length = CreateMappingInput {
            device_id: "d1".into(),
            universe: 1,
            channel: 1,
            length: 2,
            mapping_type: MappingType::Discrete,
            field: Some(MappingField::Power),
            allow_overlap: false,
        };
        assert!(validate_mapping_shape(&bad_length).is_err());

        let no_field = CreateMappingInput {
            device_id: "d1".into(),
            universe: 1,
            channel: 1,
            length: 1,
            mapping_type: MappingType::Discrete,
            field: None,
            allow_overlap: false,
        };
        assert!(validate_mapping_shape(&no_field).is_err());
    }

    #[test]
    fn overlap_is_rejected_unless_allow_overlap() {
        let existing = vec![Mapping {
            id: 1,
            device_id: "d1".into(),
            universe: 1,
            channel: 1,
            length: 3,
            mapping_type: MappingType::Range,
            field: None,
            fields: None,
            allow_overlap: false,
        }];

        let overlapping = CreateMappingInput {
            device_id: "d2".into(),
            universe: 1,
            channel: 3,
            length: 2,
            mapping_type: MappingType::Range,
            field: None,
            allow_overlap: false,
        };
        assert!(validate_against_existing(&overlapping, &existing).is_err());

        let mut allowed = overlapping.clone();
        allowed.allow_overlap = true;
        assert!(validate_against_existing(&allowed, &existing).is_ok());
    }

    #[test]
    fn existing_mapping_allow_overlap_does_not_excuse_candidate() {
        let existing = vec![Mapping {
            id: 1,
            device_id: "d1".into(),
            universe: 1,
            channel: 1,
            length: 3,
            mapping_type: MappingType::Range,
            field: None,
            fields: None,
            allow_overlap: true,
        }];

        let unrelated_candidate = CreateMappingInput {
            device_id: "d2".into(),
            universe: 1,
            channel: 3,
            length: 2,
            mapping_type: MappingType::Range,
            field: None,
            allow_overlap: false,
        };
        assert!(validate_against_existing(&unrelated_candidate, &existing).is_err());
    }

    #[test]
    fn duplicate_field_is_rejected_even_if_existing_mapping_allows_overlap() {
        let existing = vec![Mapping {
            id: 1,
            device_id: "d1".into(),
            universe: 1,
            channel: 10,
            length: 1,
            mapping_type: MappingType::Discrete,
            field: Some(MappingField::Power),
            fields: None,
            allow_overlap: true,
        }];

        let candidate = CreateMappingInput {
            device_id: "d1".into(),
            universe: 1,
            channel: 20,
            length: 1,
            mapping_type: MappingType::Discrete,
            field: Some(MappingField::Power),
            allow_overlap: false,
        };
        assert!(validate_against_existing(&candidate, &existing).is_err());
    }

    #[test]
    fn rgb_template_expands_to_single_range_mapping() {
        let caps = rgb_capabilities();
        let inputs = expand_template(MappingTemplate::Rgb, "d1", 1, 1, &caps).unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].mapping_type, MappingType::Range);
        assert_eq!(inputs[0].length, 3);
        assert_eq!(inputs[0].channel, 1);
    }

    #[test]
    fn rgbct_template_adds_discrete_ct_after_range_block() {
        let caps = crate::capabilities::normalize_capabilities(
            Some("H6008".into()),
            &json!({"mode": "rgb", "ct_range": [2000, 9000]}),
        );
        let inputs = expand_template(MappingTemplate::Rgbct, "d1", 1, 1, &caps).unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0].length, 3);
        assert_eq!(inputs[1].channel, 4);
        assert_eq!(inputs[1].mapping_type, MappingType::Discrete);
        assert_eq!(inputs[1].field, Some(MappingField::Ct));
    }

    #[test]
    fn template_rejects_unsupported_device() {
        let caps = crate::capabilities::normalize_capabilities(
            Some("H6001".into()),
            &json!({"mode": "brightness", "color_modes": []}),
        );
        assert!(expand_template(MappingTemplate::Rgb, "d1", 1, 1, &caps).is_err());
    }
}
