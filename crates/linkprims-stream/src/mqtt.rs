use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use tracing::{debug, info, warn};

use crate::error::{Result, StreamError};
use crate::traits::{
    lock, remaining, wait_until_disconnected, Stream, StreamConfig, IDLE_POLL_INTERVAL,
};

/// Broker session settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConfig {
    /// Generated from the process id when unset.
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// How long `connect` waits for the broker's CONNACK.
    pub ack_timeout: Duration,
    pub qos: u8,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(5),
            qos: 0,
        }
    }
}

pub(crate) fn qos_from_u8(value: u8) -> QoS {
    match value {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

enum Incoming {
    ConnAck,
    Payload(Vec<u8>),
    Failed(String),
}

/// Publishes writes to `write_topic`; reads yield payloads received on
/// `read_topic`.
pub struct MqttStream {
    host: String,
    port: u16,
    write_topic: Option<String>,
    read_topic: Option<String>,
    mqtt: MqttConfig,
    config: StreamConfig,
    client: Mutex<Option<Client>>,
    incoming: Mutex<Option<Receiver<Incoming>>>,
    connected: AtomicBool,
}

impl std::fmt::Debug for MqttStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttStream")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("write_topic", &self.write_topic)
            .field("read_topic", &self.read_topic)
            .field("connected", &self.connected())
            .finish_non_exhaustive()
    }
}

impl MqttStream {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        write_topic: Option<String>,
        read_topic: Option<String>,
        mqtt: MqttConfig,
        config: StreamConfig,
    ) -> Result<Self> {
        if write_topic.is_none() && read_topic.is_none() {
            return Err(StreamError::InvalidConfig(
                "mqtt stream needs a write topic or a read topic".to_string(),
            ));
        }
        Ok(Self {
            host: host.into(),
            port,
            write_topic,
            read_topic,
            mqtt,
            config,
            client: Mutex::new(None),
            incoming: Mutex::new(None),
            connected: AtomicBool::new(false),
        })
    }

    fn client_id(&self) -> String {
        self.mqtt.client_id.clone().unwrap_or_else(|| {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.subsec_nanos())
                .unwrap_or_default();
            format!("linkprims-{}-{nanos}", std::process::id())
        })
    }
}

impl Stream for MqttStream {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn connect(&self) -> Result<()> {
        self.disconnect();

        let mut options = MqttOptions::new(self.client_id(), self.host.clone(), self.port);
        options.set_keep_alive(self.mqtt.keep_alive);
        if let (Some(username), Some(password)) = (&self.mqtt.username, &self.mqtt.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, mut connection) = Client::new(options, 10);
        let qos = qos_from_u8(self.mqtt.qos);
        if let Some(topic) = &self.read_topic {
            client
                .subscribe(topic.clone(), qos)
                .map_err(|err| StreamError::Mqtt(err.to_string()))?;
        }

        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("mqtt-events".to_string())
            .spawn(move || {
                for notification in connection.iter() {
                    let event = match notification {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => Incoming::ConnAck,
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            Incoming::Payload(publish.payload.to_vec())
                        }
                        Ok(_) => continue,
                        Err(err) => {
                            let _ = tx.send(Incoming::Failed(err.to_string()));
                            break;
                        }
                    };
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                debug!("mqtt event loop stopped");
            })?;

        match rx.recv_timeout(self.mqtt.ack_timeout) {
            Ok(Incoming::ConnAck) | Ok(Incoming::Payload(_)) => {}
            Ok(Incoming::Failed(message)) => return Err(StreamError::Mqtt(message)),
            Err(_) => {
                let _ = client.disconnect();
                return Err(StreamError::Timeout);
            }
        }

        *lock(&self.client) = Some(client);
        *lock(&self.incoming) = Some(rx);
        self.connected.store(true, Ordering::Release);
        info!(host = %self.host, port = self.port, "mqtt connected");
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn read(&self) -> Result<BytesMut> {
        if !self.connected() {
            return Err(StreamError::NotConnected);
        }
        if self.read_topic.is_none() {
            return wait_until_disconnected(|| self.connected());
        }
        let incoming = lock(&self.incoming);
        let rx = incoming.as_ref().ok_or(StreamError::NotConnected)?;

        let deadline = self.config.read_timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if !self.connected() {
                return Err(StreamError::Closed);
            }
            let wait = remaining(deadline).map_or(IDLE_POLL_INTERVAL, |left| left.min(IDLE_POLL_INTERVAL));
            match rx.recv_timeout(wait) {
                Ok(Incoming::Payload(payload)) => return Ok(BytesMut::from(payload.as_slice())),
                Ok(Incoming::ConnAck) => {}
                Ok(Incoming::Failed(message)) => {
                    self.connected.store(false, Ordering::Release);
                    return Err(StreamError::Mqtt(message));
                }
                Err(RecvTimeoutError::Timeout) => {
                    if remaining(deadline).is_some_and(|left| left.is_zero()) {
                        return Err(StreamError::Timeout);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.connected.store(false, Ordering::Release);
                    return Err(StreamError::Closed);
                }
            }
        }
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        if !self.connected() {
            return Err(StreamError::NotConnected);
        }
        let topic = self.write_topic.as_ref().ok_or_else(|| {
            StreamError::InvalidConfig("write attempted on a read only mqtt stream".to_string())
        })?;
        let client = lock(&self.client);
        let client = client.as_ref().ok_or(StreamError::NotConnected)?;
        client
            .publish(topic.clone(), qos_from_u8(self.mqtt.qos), false, data.to_vec())
            .map_err(|err| StreamError::Mqtt(err.to_string()))
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(client) = lock(&self.client).take() {
            if let Err(err) = client.disconnect() {
                warn!(error = %err, "mqtt disconnect request failed");
            }
            debug!(host = %self.host, "mqtt disconnected");
        }
    }
}
