use chrono::{DateTime, Local};
use std::fmt;

use super::client::Qos;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retained: bool,
    pub timestamp: DateTime<Local>,
}

impl fmt::Display for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} - {}: {}",
            self.timestamp.format("%H:%M:%S"),
            self.topic,
            self.preview(32)
        )
    }
}

impl MqttMessage {
    pub fn from_topic(topic: impl Into<String>, payload: Vec<u8>, qos: Qos) -> Self {
        MqttMessage {
            topic: topic.into(),
            payload,
            qos,
            retained: false,
            timestamp: Local::now(),
        }
    }

    pub fn from_publish(publish: &rumqttc::Publish) -> Self {
        MqttMessage {
            topic: publish.topic.clone(),
            payload: publish.payload.to_vec(),
            qos: publish.qos.into(),
            retained: publish.retain,
            timestamp: Local::now(),
        }
    }

    /// Payload as lossy UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// First `max_chars` characters of the payload text.
    pub fn preview(&self, max_chars: usize) -> String {
        let text = self.text();
        match text.char_indices().nth(max_chars) {
            Some((idx, _)) => format!("{}...", &text[..idx]),
            None => text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_long_payloads() {
        let msg = MqttMessage::from_topic("t/1", b"abcdefghijklmnop".to_vec(), Qos::AtLeastOnce);
        assert_eq!(msg.preview(4), "abcd...");
        assert_eq!(msg.preview(64), "abcdefghijklmnop");
    }

    #[test]
    fn preview_handles_short_and_binary_payloads() {
        let msg = MqttMessage::from_topic("t/1", vec![0], Qos::AtMostOnce);
        assert_eq!(msg.preview(10), "\u{0}");
        assert!(msg.to_string().contains("t/1"));
    }
}
