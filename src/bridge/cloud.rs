//! Cloud session: login, installation discovery and sequential startup of every
//! installation's realtime channel.

use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::bridge::installation::{InstallationError, InstallationSession, UserChannelLogger};
use crate::client::{DknClient, DknClientError};
use crate::models::dkn::{Installation, InstallationId};
use crate::socketio::SocketIoClient;

const USER_NAMESPACE: &str = "/users";

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("api error: {0}")]
    Api(DknClientError),
}

impl From<DknClientError> for CloudError {
    fn from(value: DknClientError) -> Self {
        match value {
            DknClientError::Auth(msg) => CloudError::Authentication(msg),
            other => CloudError::Api(other),
        }
    }
}

pub struct CloudSession {
    client: DknClient,
    user_channel: Option<SocketIoClient>,
    installations: BTreeMap<InstallationId, InstallationSession>,
}

impl CloudSession {
    pub fn new(client: DknClient) -> Self {
        CloudSession {
            client,
            user_channel: None,
            installations: BTreeMap::new(),
        }
    }

    pub fn client(&self) -> &DknClient {
        &self.client
    }

    pub fn installations(&self) -> &BTreeMap<InstallationId, InstallationSession> {
        &self.installations
    }

    /// Authenticate, then bring installations up one after another: build, connect, and
    /// wait until every device reported data before moving on.
    ///
    /// A failing installation is logged and left out; only authentication and the
    /// installation listing are fatal.
    pub fn login(&mut self, username: &str, password: &str) -> Result<(), CloudError> {
        self.client.authenticate(username, password)?;
        info!(
            "Authenticated to DKN Cloud as '{}' (refresh token: {})",
            self.client.user_name(),
            if self.client.has_refresh_token() { "yes" } else { "no" }
        );

        let listing = self.client.get_installations()?;
        info!("Discovered {} installation(s)", listing.len());

        self.connect_user_channel();

        for installation in self.build_installations(&listing) {
            match self.start_installation(&installation) {
                Ok(()) => {
                    info!(
                        "Installation '{}' ready ({} device(s))",
                        installation.name(),
                        installation.devices().count()
                    );
                    self.installations.insert(installation.id().clone(), installation);
                }
                Err(e) => error!("Skipping installation '{}': {}", installation.name(), e),
            }
        }
        Ok(())
    }

    fn start_installation(&self, installation: &InstallationSession) -> Result<(), InstallationError> {
        installation.connect(&self.client)?;
        debug!("Waiting for initial data of installation '{}'", installation.name());
        installation.wait_for_data()
    }

    fn build_installations(&self, listing: &[Installation]) -> Vec<InstallationSession> {
        let mut seen = BTreeMap::new();
        listing
            .iter()
            .filter(|inst| {
                let fresh = seen.insert(inst.id.clone(), ()).is_none();
                if !fresh {
                    warn!("Installation '{}' listed twice; ignoring the duplicate", inst.id);
                }
                fresh
            })
            .map(|inst| InstallationSession::new(inst, self.client.scope()))
            .collect()
    }

    fn connect_user_channel(&mut self) {
        let token = match self.client.bearer() {
            Ok(token) => token,
            Err(e) => {
                warn!("User channel not connected: {}", e);
                return;
            }
        };
        match SocketIoClient::connect(
            self.client.agent(),
            &self.client.socket_endpoint(),
            token,
            &[USER_NAMESPACE.to_string()],
            Arc::new(UserChannelLogger),
        ) {
            Ok(channel) => {
                debug!("User channel connected (session {})", channel.sid());
                self.user_channel = Some(channel);
            }
            Err(e) => warn!("User channel connection failed: {}", e),
        }
    }

    /// Close every channel; pending waits fail instead of hanging.
    pub fn close(&mut self) {
        for installation in self.installations.values() {
            installation.close();
        }
        if let Some(channel) = self.user_channel.take() {
            channel.close();
        }
    }
}

impl Drop for CloudSession {
    fn drop(&mut self) {
        self.close();
    }
}
