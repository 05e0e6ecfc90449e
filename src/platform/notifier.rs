use tracing::info;

use crate::mqtt::MqttMessage;

/// Surface for messages pushed by the broker.
pub trait Notifier: Send {
    fn notify(&self, message: &MqttMessage);
}

/// Writes every arrived message to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &MqttMessage) {
        info!("Notification: {}", message);
    }
}
