use bytes::Bytes;

use crate::packet::{LastWill, Publish, QoS};

/// An application message, decoupled from the PUBLISH packets that carry it.
///
/// Cloning is cheap: the payload is reference-counted, so fanning a message
/// out to many subscribers shares one allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Message {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
        }
    }

    pub fn retained(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Message {
            retain: true,
            ..Message::new(topic, payload, qos)
        }
    }

    /// A retained publish with an empty payload clears the retained slot for
    /// its topic instead of storing anything [MQTT-3.3.1-10].
    pub fn is_retained_clear(&self) -> bool {
        self.retain && self.payload.is_empty()
    }
}

impl From<Publish> for Message {
    fn from(publish: Publish) -> Self {
        Message {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
        }
    }
}

impl From<LastWill> for Message {
    fn from(will: LastWill) -> Self {
        Message {
            topic: will.topic,
            payload: will.message,
            qos: will.qos,
            retain: will.retain,
        }
    }
}
