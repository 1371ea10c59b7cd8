//! Message broker plumbing.
//!
//! The dispatcher only sees `JobQueue`; `MqttJobQueue` binds it to an MQTT v5
//! broker with TLS selected by `build_transport`.

mod mqtt;
mod queue;
mod tls;

pub use mqtt::{MqttJobQueue, MqttSettings};
pub use queue::{Delivery, JobQueue};
pub use tls::{
    build_transport, parse_mqtt_endpoint, MqttEndpoint, TlsMaterials, DEFAULT_MQTTS_PORT,
    DEFAULT_MQTT_PORT,
};
