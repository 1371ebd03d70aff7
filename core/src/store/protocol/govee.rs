//! Govee LAN protocol payload wrapping (spec §4.C).
//!
//! Produces `{msg:{cmd, data}}` JSON commands over UDP port 4003.

use serde_json::{json, Value};

use crate::error::BridgeError;

use super::{ProtocolHandler, WireMessage};

pub struct GoveeProtocolHandler;

fn command(cmd: &str, data: Value) -> WireMessage {
    serde_json::to_vec(&json!({"msg": {"cmd": cmd, "data": data}})).expect("govee command serializes")
}

impl ProtocolHandler for GoveeProtocolHandler {
    fn protocol_name(&self) -> &'static str {
        "govee"
    }

    fn default_port(&self) -> u16 {
        4003
    }

    fn wrap(&self, payload: &Value) -> Result<Vec<WireMessage>, BridgeError> {
        let obj = payload.as_object().ok_or_else(|| {
            BridgeError::Validation("govee payload must be a JSON object".into())
        })?;

        let turn = obj.get("turn").and_then(|v| v.as_str());
        let color = obj.get("color");
        let color_temp = obj.get("color_temp").and_then(|v| v.as_i64());
        let brightness = obj.get("brightness");

        let mut messages = Vec::new();

        if turn == Some("off") {
            // "turn:off alone -> single turn command" (spec §4.C): any
            // other fields present alongside an explicit off are ignored,
            // since a device cannot display color while off.
            messages.push(command("turn", json!({"value": 0})));
            return Ok(messages);
        }

        if turn == Some("on") {
            messages.push(command("turn", json!({"value": 1})));
            if color.is_some() || color_temp.is_some() {
                let mut data = serde_json::Map::new();
                if let Some(c) = color {
                    data.insert("color".to_string(), c.clone());
                }
                if let Some(ct) = color_temp {
                    data.insert("colorTemInKelvin".to_string(), json!(ct));
                }
                messages.push(command("colorwc", Value::Object(data)));
            }
            if let Some(b) = brightness {
                messages.push(command("brightness", json!({"value": b})));
            }
            return Ok(messages);
        }

        // No explicit `turn`: color/color_temp and/or brightness alone.
        if color.is_some() || color_temp.is_some() {
            let mut data = serde_json::Map::new();
            if let Some(c) = color {
                data.insert("color".to_string(), c.clone());
            }
            if let Some(ct) = color_temp {
                data.insert("colorTemInKelvin".to_string(), json!(ct));
            }
            messages.push(command("colorwc", Value::Object(data)));
            if let Some(b) = brightness {
                messages.push(command("brightness", json!({"value": b})));
            }
            return Ok(messages);
        }

        if let Some(b) = brightness {
            messages.push(command("brightness", json!({"value": b})));
            return Ok(messages);
        }

        Err(BridgeError::Validation(
            "govee payload contains no recognized fields (turn/color/color_temp/brightness)".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(msg: &WireMessage) -> Value {
        serde_json::from_slice(msg).unwrap()
    }

    #[test]
    fn turn_off_alone_produces_single_command() {
        let handler = GoveeProtocolHandler;
        let messages = handler.wrap(&json!({"turn": "off"})).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(parse(&messages[0]), json!({"msg": {"cmd": "turn", "data": {"value": 0}}}));
    }

    #[test]
    fn turn_on_with_color_emits_turn_then_colorwc() {
        let handler = GoveeProtocolHandler;
        let messages = handler
            .wrap(&json!({"turn": "on", "color": {"r": 128, "g": 64, "b": 32}}))
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(parse(&messages[0])["msg"]["cmd"], "turn");
        assert_eq!(parse(&messages[1])["msg"]["cmd"], "colorwc");
    }

    #[test]
    fn turn_on_with_brightness_appends_separate_command() {
        let handler = GoveeProtocolHandler;
        let messages = handler
            .wrap(&json!({"turn": "on", "brightness": 80}))
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(parse(&messages[1])["msg"]["cmd"], "brightness");
    }

    #[test]
    fn color_without_turn_emits_colorwc_only() {
        let handler = GoveeProtocolHandler;
        let messages = handler
            .wrap(&json!({"color": {"r": 1, "g": 2, "b": 3}}))
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(parse(&messages[0])["msg"]["cmd"], "colorwc");
    }

    #[test]
    fn brightness_alone_produces_single_command() {
        let handler = GoveeProtocolHandler;
        let messages = handler.wrap(&json!({"brightness": 50})).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(parse(&messages[0])["msg"]["cmd"], "brightness");
    }
}
