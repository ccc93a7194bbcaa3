use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tag values used in the `type` field of channel messages.
pub mod kind {
    pub const DATA: &str = "data";
    pub const STATUS: &str = "status";
    pub const DISCONNECT: &str = "disconnect";
    pub const ALARM: &str = "alarm";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ThresholdsMsg {
    pub temp_min: Option<f64>,
    pub temp_max: Option<f64>,
    pub hum_min: Option<f64>,
    pub hum_max: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TelemetryValuesMsg {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_temp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_hum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_anomaly: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hum_anomaly: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calculated_thresholds: Option<ThresholdsMsg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct LedStatusMsg {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub led_red: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub led_green: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlarmDetailMsg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub alarm_type: String,
    pub value: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { devices: Vec<String> },
    Unsubscribe,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Data {
        device_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
        #[serde(default)]
        values: TelemetryValuesMsg,
    },
    Status {
        device_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
        #[serde(default)]
        status: LedStatusMsg,
    },
    Disconnect {
        device_id: String,
    },
    Alarm {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alarm: Option<AlarmDetailMsg>,
    },
    Ping,
    DeviceUpdate {
        device_id: String,
        #[serde(flatten)]
        fields: BTreeMap<String, Value>,
    },
}

impl ClientMessage {
    pub fn subscribe<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Subscribe {
            devices: devices.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Converts an already decoded frame, as handed to listeners, into the
    /// typed form.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Device the message refers to, when it names one.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::Data { device_id, .. }
            | Self::Status { device_id, .. }
            | Self::Disconnect { device_id }
            | Self::DeviceUpdate { device_id, .. } => Some(device_id),
            Self::Alarm { device_id, .. } => device_id.as_deref(),
            Self::Ping => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn subscribe_encodes_device_list() {
        let msg = ClientMessage::subscribe(["esp32_1", "esp32_2"]);
        let value: Value = serde_json::from_str(&msg.to_text().expect("encode")).expect("json");
        assert_eq!(
            value,
            json!({"type": "subscribe", "devices": ["esp32_1", "esp32_2"]})
        );
    }

    #[test]
    fn unsubscribe_encodes_bare_tag() {
        let text = ClientMessage::Unsubscribe.to_text().expect("encode");
        assert_eq!(text, r#"{"type":"unsubscribe"}"#);
        assert_eq!(
            ClientMessage::from_text(&text).expect("decode"),
            ClientMessage::Unsubscribe
        );
    }

    #[test]
    fn data_frame_decodes_partial_values() {
        let msg = ServerMessage::from_text(
            r#"{"type":"data","device_id":"d1","values":{"temperature":21.5}}"#,
        )
        .expect("decode");
        match msg {
            ServerMessage::Data {
                device_id, values, ..
            } => {
                assert_eq!(device_id, "d1");
                assert_eq!(values.temperature, Some(21.5));
                assert_eq!(values.humidity, None);
                assert_eq!(values.calculated_thresholds, None);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn data_frame_decodes_full_server_payload() {
        let value = json!({
            "type": "data",
            "device_id": "esp32_1",
            "timestamp": "2025-01-01T00:00:00",
            "values": {
                "temperature": 22.0,
                "humidity": 40.0,
                "expected_temp": 21.7,
                "expected_hum": 41.2,
                "temp_anomaly": false,
                "hum_anomaly": true,
                "calculated_thresholds": {"temp_min": 18.0, "temp_max": 26.0},
                "timestamp": "2025-01-01T00:00:00"
            }
        });
        let msg = ServerMessage::from_value(&value).expect("decode");
        let ServerMessage::Data { values, .. } = msg else {
            panic!("expected data message");
        };
        assert_eq!(values.hum_anomaly, Some(true));
        let thresholds = values.calculated_thresholds.expect("thresholds");
        assert_eq!(thresholds.temp_max, Some(26.0));
        assert_eq!(thresholds.hum_min, None);
    }

    #[test]
    fn status_frame_tolerates_null_leds() {
        let msg = ServerMessage::from_text(
            r#"{"type":"status","device_id":"d1","status":{"led_red":true,"led_green":null}}"#,
        )
        .expect("decode");
        assert_eq!(
            msg,
            ServerMessage::Status {
                device_id: "d1".to_string(),
                timestamp: None,
                status: LedStatusMsg {
                    led_red: Some(true),
                    led_green: None,
                    online: None,
                },
            }
        );
    }

    #[test]
    fn alarm_frame_carries_nested_detail() {
        let msg = ServerMessage::from_value(&json!({
            "type": "alarm",
            "device_id": "d1",
            "timestamp": "2025-01-01T00:00:00",
            "alarm": {"user": "a@b.c", "alarm_type": "TEMP_HIGH", "value": 31.2, "threshold": 30.0}
        }))
        .expect("decode");
        assert_eq!(msg.device_id(), Some("d1"));
        let ServerMessage::Alarm { alarm, .. } = msg else {
            panic!("expected alarm");
        };
        let alarm = alarm.expect("detail");
        assert_eq!(alarm.alarm_type, "TEMP_HIGH");
        assert_eq!(alarm.threshold, 30.0);
    }

    #[test]
    fn ping_and_device_update_are_recognized() {
        assert_eq!(
            ServerMessage::from_text(r#"{"type":"ping"}"#).expect("ping"),
            ServerMessage::Ping
        );

        let update = ServerMessage::from_text(
            r#"{"type":"device_update","device_id":"d1","estado":"activo","led_red":true}"#,
        )
        .expect("device_update");
        let ServerMessage::DeviceUpdate { device_id, fields } = update else {
            panic!("expected device_update");
        };
        assert_eq!(device_id, "d1");
        assert_eq!(fields.get("led_red"), Some(&Value::Bool(true)));
        assert_eq!(fields.get("estado"), Some(&json!("activo")));
    }

    #[test]
    fn unknown_tag_is_a_decode_error() {
        assert!(ServerMessage::from_text(r#"{"type":"firmware","device_id":"d1"}"#).is_err());
    }
}
