//! Live per-device board fed by the realtime channel.
//!
//! `DeviceBoard` registers listeners for the device tags, keeps the latest
//! known state of every device, and emits typed events in receipt order. The
//! watched device set is re-subscribed every time the connection opens.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::DeviceSummary;
use crate::stream::client::{ConnectionState, RealtimeConnection};
use crate::stream::proto::{
    kind, AlarmDetailMsg, ClientMessage, LedStatusMsg, ServerMessage, TelemetryValuesMsg,
};

/// Whether the platform currently sees a device.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Connectivity {
    #[default]
    Unknown,
    Connected,
    Disconnected,
}

/// Most recent alarm observed for a device.
#[derive(Clone, Debug, PartialEq)]
pub struct AlarmSnapshot {
    pub timestamp: Option<String>,
    pub detail: Option<AlarmDetailMsg>,
}

/// Latest known state of one device.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub expected_temp: Option<f64>,
    pub expected_hum: Option<f64>,
    pub led_red: Option<bool>,
    pub led_green: Option<bool>,
    pub connectivity: Connectivity,
    pub last_update: Option<String>,
    pub last_alarm: Option<AlarmSnapshot>,
}

impl DeviceSnapshot {
    fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            ..Self::default()
        }
    }

    fn from_summary(summary: &DeviceSummary) -> Self {
        let connectivity = match summary.state.as_deref() {
            Some("activo") => Connectivity::Connected,
            Some("desconectado") => Connectivity::Disconnected,
            _ => Connectivity::Unknown,
        };
        Self {
            device_id: summary.device_id.clone(),
            temperature: summary.temperature,
            humidity: summary.humidity,
            led_red: summary.led_red,
            led_green: summary.led_green,
            connectivity,
            last_update: summary.last_update.clone(),
            ..Self::default()
        }
    }
}

/// Board-level event emitted by [`DeviceBoard::recv`].
#[derive(Clone, Debug, PartialEq)]
pub enum BoardEvent {
    /// New telemetry sample.
    Reading {
        device_id: String,
        values: TelemetryValuesMsg,
    },
    /// LED / online snapshot.
    Status {
        device_id: String,
        status: LedStatusMsg,
    },
    /// Device went offline.
    Disconnected { device_id: String },
    /// Threshold breach.
    Alarm {
        device_id: Option<String>,
        timestamp: Option<String>,
        alarm: Option<AlarmDetailMsg>,
    },
}

type Devices = Arc<RwLock<HashMap<String, DeviceSnapshot>>>;
type Watched = Arc<RwLock<BTreeSet<String>>>;
/// Cleared once the worker stops so `recv` observes the end of the stream.
type EventSink = Arc<RwLock<Option<mpsc::UnboundedSender<BoardEvent>>>>;

/// Stateful consumer of a realtime connection.
#[derive(Debug)]
pub struct DeviceBoard {
    connection: RealtimeConnection,
    devices: Devices,
    watched: Watched,
    events: mpsc::UnboundedReceiver<BoardEvent>,
    resubscribe_task: JoinHandle<()>,
}

impl DeviceBoard {
    /// Registers the board's listeners on `connection`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(connection: RealtimeConnection) -> Self {
        let devices: Devices = Arc::new(RwLock::new(HashMap::new()));
        let watched: Watched = Arc::new(RwLock::new(BTreeSet::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sink: EventSink = Arc::new(RwLock::new(Some(events_tx)));

        for tag in [kind::DATA, kind::STATUS, kind::DISCONNECT, kind::ALARM] {
            let devices = Arc::clone(&devices);
            let sink = Arc::clone(&sink);
            connection.on(tag, move |raw| {
                if let Some(event) = apply_frame(&devices, raw) {
                    if let Some(events_tx) = read(&sink).as_ref() {
                        let _ = events_tx.send(event);
                    }
                }
            });
        }

        let resubscribe_task = tokio::spawn(resubscribe_on_open(
            connection.clone(),
            Arc::clone(&watched),
            sink,
        ));

        Self {
            connection,
            devices,
            watched,
            events: events_rx,
            resubscribe_task,
        }
    }

    pub fn connection(&self) -> &RealtimeConnection {
        &self.connection
    }

    /// Initializes snapshots from REST summaries, replacing existing entries.
    pub fn seed<'a, I>(&self, summaries: I)
    where
        I: IntoIterator<Item = &'a DeviceSummary>,
    {
        let mut guard = write(&self.devices);
        for summary in summaries {
            guard.insert(
                summary.device_id.clone(),
                DeviceSnapshot::from_summary(summary),
            );
        }
    }

    /// Replaces the watched device set and subscribes to it.
    ///
    /// The set is sent again whenever the connection reopens.
    pub fn watch_devices<I, S>(&self, devices: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let devices: BTreeSet<String> = devices.into_iter().map(Into::into).collect();
        *write(&self.watched) = devices.clone();
        self.connection.send(&ClientMessage::subscribe(devices));
    }

    /// Clears the watched set and asks for every permitted device.
    pub fn watch_all(&self) {
        write(&self.watched).clear();
        self.connection.unsubscribe();
    }

    pub fn watched_devices(&self) -> Vec<String> {
        read(&self.watched).iter().cloned().collect()
    }

    pub fn device(&self, device_id: &str) -> Option<DeviceSnapshot> {
        read(&self.devices).get(device_id).cloned()
    }

    /// Snapshots of all known devices, ordered by id.
    pub fn devices(&self) -> Vec<DeviceSnapshot> {
        let mut devices: Vec<DeviceSnapshot> = read(&self.devices).values().cloned().collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    /// Receives the next board event.
    ///
    /// Returns `None` once the connection worker has stopped.
    pub async fn recv(&mut self) -> Option<BoardEvent> {
        self.events.recv().await
    }

    /// Stops resubscription and closes the underlying connection.
    pub fn close(self) {
        self.connection.close();
    }
}

impl Drop for DeviceBoard {
    fn drop(&mut self) {
        self.resubscribe_task.abort();
    }
}

async fn resubscribe_on_open(
    connection: RealtimeConnection,
    watched: Watched,
    sink: EventSink,
) {
    let mut state = connection.state_changes();
    loop {
        if *state.borrow_and_update() == ConnectionState::Open {
            let devices: Vec<String> = read(&watched).iter().cloned().collect();
            if !devices.is_empty() {
                debug!(event = "board_resubscribe", devices = devices.len());
                connection.subscribe(devices);
            }
        }
        if state.changed().await.is_err() {
            debug!(event = "board_stream_ended");
            write(&sink).take();
            return;
        }
    }
}

fn apply_frame(devices: &Devices, raw: &Value) -> Option<BoardEvent> {
    let message = match ServerMessage::from_value(raw) {
        Ok(message) => message,
        Err(err) => {
            warn!(event = "board_frame_invalid", error = %err);
            return None;
        }
    };

    let mut guard = write(devices);
    match message {
        ServerMessage::Data {
            device_id,
            timestamp,
            values,
        } => {
            let snapshot = guard
                .entry(device_id.clone())
                .or_insert_with(|| DeviceSnapshot::new(&device_id));
            if values.temperature.is_some() {
                snapshot.temperature = values.temperature;
            }
            if values.humidity.is_some() {
                snapshot.humidity = values.humidity;
            }
            if values.expected_temp.is_some() {
                snapshot.expected_temp = values.expected_temp;
            }
            if values.expected_hum.is_some() {
                snapshot.expected_hum = values.expected_hum;
            }
            if let Some(timestamp) = timestamp.or_else(|| values.timestamp.clone()) {
                snapshot.last_update = Some(timestamp);
            }
            Some(BoardEvent::Reading { device_id, values })
        }
        ServerMessage::Status {
            device_id,
            timestamp,
            status,
        } => {
            let snapshot = guard
                .entry(device_id.clone())
                .or_insert_with(|| DeviceSnapshot::new(&device_id));
            if status.led_red.is_some() {
                snapshot.led_red = status.led_red;
            }
            if status.led_green.is_some() {
                snapshot.led_green = status.led_green;
            }
            snapshot.connectivity = if status.online == Some(false) {
                Connectivity::Disconnected
            } else {
                Connectivity::Connected
            };
            if timestamp.is_some() {
                snapshot.last_update = timestamp;
            }
            Some(BoardEvent::Status { device_id, status })
        }
        ServerMessage::Disconnect { device_id } => {
            guard
                .entry(device_id.clone())
                .or_insert_with(|| DeviceSnapshot::new(&device_id))
                .connectivity = Connectivity::Disconnected;
            Some(BoardEvent::Disconnected { device_id })
        }
        ServerMessage::Alarm {
            device_id,
            timestamp,
            alarm,
        } => {
            if let Some(id) = device_id.as_deref() {
                guard
                    .entry(id.to_string())
                    .or_insert_with(|| DeviceSnapshot::new(id))
                    .last_alarm = Some(AlarmSnapshot {
                    timestamp: timestamp.clone(),
                    detail: alarm.clone(),
                });
            }
            Some(BoardEvent::Alarm {
                device_id,
                timestamp,
                alarm,
            })
        }
        ServerMessage::Ping | ServerMessage::DeviceUpdate { .. } => None,
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
