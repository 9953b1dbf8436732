//! Installation session: the devices of one vendor installation and the realtime channel
//! they share.

use log::{debug, info, warn};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, Weak};
use std::thread;

use crate::bridge::device::{CommandSink, DeviceError, DeviceProxy};
use crate::client::{DknClient, DknClientError};
use crate::models::dkn::{DeviceData, DeviceDataMessage, Installation, InstallationId, MachineEvent, Mac};
use crate::socketio::{ChannelError, ChannelHandler, SocketIoClient};

const DEVICE_DATA_EVENT: &str = "device-data";
const MACHINE_EVENT: &str = "create-machine-event";

#[derive(Debug, thiserror::Error)]
pub enum InstallationError {
    #[error("installation {id}: {source}")]
    Api {
        id: InstallationId,
        #[source]
        source: DknClientError,
    },
    #[error("installation {id}: channel failed: {source}")]
    Channel {
        id: InstallationId,
        #[source]
        source: ChannelError,
    },
    #[error("installation {id}: {source}")]
    Device {
        id: InstallationId,
        #[source]
        source: DeviceError,
    },
}

/// The installation's outbound half of the channel. Handed to every proxy before the
/// channel exists; commands fail with `NotConnected` until `connect` succeeded.
struct InstallationChannel {
    namespace: String,
    client: OnceLock<SocketIoClient>,
}

impl CommandSink for InstallationChannel {
    fn send_machine_event(&self, event: &MachineEvent) -> Result<(), ChannelError> {
        let client = self
            .client
            .get()
            .ok_or_else(|| ChannelError::NotConnected(self.namespace.clone()))?;
        let payload = serde_json::to_value(event).map_err(|e| ChannelError::Protocol(e.to_string()))?;
        let command = event.clone();
        client.emit(
            &self.namespace,
            MACHINE_EVENT,
            payload,
            Some(Box::new(move |reply: Option<&Value>| {
                debug!(
                    "({}) POST - {} : {}; (raw: {})",
                    command.mac,
                    command.property,
                    command.value,
                    reply.map(|v| v.to_string()).unwrap_or_default()
                );
            })),
        )
    }
}

/// What a proxy holds; weak so the proxies do not keep their own channel alive.
struct ChannelRef(Weak<InstallationChannel>);

impl CommandSink for ChannelRef {
    fn send_machine_event(&self, event: &MachineEvent) -> Result<(), ChannelError> {
        self.0.upgrade().ok_or(ChannelError::Closed)?.send_machine_event(event)
    }
}

/// Inbound half: routes realtime messages to proxies by MAC.
struct DeviceRouter {
    installation_id: InstallationId,
    devices: BTreeMap<Mac, Arc<DeviceProxy>>,
}

impl DeviceRouter {
    fn dispatch(&self, mac: &Mac, update: &DeviceData) -> bool {
        match self.devices.get(mac) {
            Some(device) => device.apply_update(update),
            None => {
                warn!(
                    "Device '{}' does not exist in installation '{}'",
                    mac, self.installation_id
                );
                false
            }
        }
    }
}

impl ChannelHandler for DeviceRouter {
    fn on_connect(&self, namespace: &str) {
        debug!("Installation socket connected: '{}'", namespace);
    }

    fn on_connect_error(&self, namespace: &str, data: Option<&Value>) {
        warn!(
            "Installation socket connection failed for '{}': {}",
            namespace,
            data.map(|v| v.to_string()).unwrap_or_default()
        );
    }

    fn on_disconnect(&self, namespace: &str) {
        debug!("Installation socket disconnected: '{}'", namespace);
    }

    fn on_transport_closed(&self) {
        for device in self.devices.values() {
            device.close();
        }
    }

    fn on_event(&self, namespace: &str, event: &str, payload: &Value) {
        debug!("Installation socket message '{}' on '{}': {}", event, namespace, payload);
        if event != DEVICE_DATA_EVENT {
            return;
        }
        match serde_json::from_value::<DeviceDataMessage>(payload.clone()) {
            Ok(message) => {
                self.dispatch(&message.mac, &message.data);
            }
            Err(e) => warn!(
                "Dropping malformed device message in installation '{}': {}",
                self.installation_id, e
            ),
        }
    }
}

pub struct InstallationSession {
    id: InstallationId,
    name: String,
    channel: Arc<InstallationChannel>,
    router: Arc<DeviceRouter>,
}

impl InstallationSession {
    pub fn new(installation: &Installation, scope: &str) -> Self {
        let namespace = format!("/{}::{}", installation.id, scope);
        let channel = Arc::new(InstallationChannel {
            namespace,
            client: OnceLock::new(),
        });
        let devices = installation
            .devices
            .iter()
            .map(|info| {
                let sink = Arc::new(ChannelRef(Arc::downgrade(&channel)));
                (info.mac.clone(), Arc::new(DeviceProxy::new(info, sink)))
            })
            .collect();
        InstallationSession {
            id: installation.id.clone(),
            name: installation.name.clone().unwrap_or_else(|| installation.id.0.clone()),
            channel,
            router: Arc::new(DeviceRouter {
                installation_id: installation.id.clone(),
                devices,
            }),
        }
    }

    pub fn id(&self) -> &InstallationId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.channel.namespace
    }

    pub fn devices(&self) -> impl Iterator<Item = &Arc<DeviceProxy>> {
        self.router.devices.values()
    }

    pub fn device(&self, mac: &Mac) -> Option<&Arc<DeviceProxy>> {
        self.router.devices.get(mac)
    }

    /// Route one inbound message; unknown addresses are logged and dropped.
    pub fn dispatch_inbound(&self, mac: &Mac, update: &DeviceData) -> bool {
        self.router.dispatch(mac, update)
    }

    /// Handle a raw Socket.IO event as if it arrived on the channel.
    #[cfg(test)]
    pub(crate) fn handle_event(&self, event: &str, payload: &Value) {
        self.router.on_event(&self.channel.namespace, event, payload);
    }

    pub fn is_connected(&self) -> bool {
        self.channel.client.get().is_some_and(SocketIoClient::is_connected)
    }

    /// Open the realtime channel for this installation's namespace.
    pub fn connect(&self, client: &DknClient) -> Result<(), InstallationError> {
        if self.channel.client.get().is_some() {
            return Ok(());
        }
        let token = client.bearer().map_err(|source| InstallationError::Api {
            id: self.id.clone(),
            source,
        })?;
        let socket = SocketIoClient::connect(
            client.agent(),
            &client.socket_endpoint(),
            token,
            &[self.channel.namespace.clone()],
            Arc::clone(&self.router) as Arc<dyn ChannelHandler>,
        )
        .map_err(|source| InstallationError::Channel {
            id: self.id.clone(),
            source,
        })?;
        info!(
            "Connected realtime channel for installation '{}' ({} device(s), session {})",
            self.name,
            self.router.devices.len(),
            socket.sid()
        );
        if let Err(unused) = self.channel.client.set(socket) {
            unused.close();
        }
        Ok(())
    }

    /// Wait until every device reported data; fails if any device fails.
    pub fn wait_for_data(&self) -> Result<(), InstallationError> {
        let results = thread::scope(|scope| {
            let waits = self
                .router
                .devices
                .values()
                .map(|device| (device.mac().clone(), scope.spawn(move || device.wait_for_data())))
                .collect::<Vec<_>>();
            waits
                .into_iter()
                .map(|(mac, handle)| handle.join().unwrap_or(Err(DeviceError::Closed(mac))))
                .collect::<Vec<_>>()
        });
        results
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map(|_| ())
            .map_err(|source| InstallationError::Device {
                id: self.id.clone(),
                source,
            })
    }

    /// Close the channel and release pending waits.
    pub fn close(&self) {
        if let Some(client) = self.channel.client.get() {
            client.close();
        }
        for device in self.router.devices.values() {
            device.close();
        }
    }
}

impl Drop for InstallationSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Namespace events of the account-level channel. Observational only.
pub(crate) struct UserChannelLogger;

impl ChannelHandler for UserChannelLogger {
    fn on_connect(&self, namespace: &str) {
        debug!("User socket connected: '{}'", namespace);
    }

    fn on_connect_error(&self, namespace: &str, data: Option<&Value>) {
        warn!(
            "User socket connection failed for '{}': {}",
            namespace,
            data.cloned().unwrap_or(json!(null))
        );
    }

    fn on_disconnect(&self, namespace: &str) {
        debug!("User socket disconnected: '{}'", namespace);
    }

    fn on_event(&self, namespace: &str, event: &str, payload: &Value) {
        debug!("User socket message '{}' on '{}': {}", event, namespace, payload);
    }
}
