//! Null HFP profile handler.
//!
//! Some speakers (Bose, notably) send their volume buttons as HFP
//! AT+VGS commands, which never reach the A2DP transport, so the
//! buttons look dead. Registering ourselves as the HFP handler makes BlueZ
//! route HFP connection attempts to us; we reject every one, so HFP is
//! never established and the speaker falls back to AVRCP absolute
//! volume.
//!
//! Must not be registered while any stored device opts into HFP, and
//! re-installing PulseAudio's own HFP handler afterwards requires
//! reloading its bluez module.

use crate::bluez::constants::HFP_UUID;
use bluer::rfcomm::{Profile, ProfileHandle, ReqError, Role};
use futures::StreamExt;
use log::info;

pub struct NullHfpHandler {
    task: tokio::task::JoinHandle<()>,
}

impl NullHfpHandler {
    /// Register for the HFP UUID and spawn the rejection loop.
    pub async fn register(session: &bluer::Session) -> bluer::Result<Self> {
        let profile = Profile {
            uuid: HFP_UUID,
            name: Some("Null HFP".to_string()),
            role: Some(Role::Client),
            require_authentication: Some(false),
            require_authorization: Some(false),
            ..Default::default()
        };
        let mut handle: ProfileHandle = session.register_profile(profile).await?;
        let task = tokio::spawn(async move {
            while let Some(req) = handle.next().await {
                info!("[NullHFP] Rejecting HFP connection from {}", req.device());
                req.reject(ReqError::Rejected);
            }
        });
        info!("Null HFP profile handler registered — HFP connections will be rejected");
        Ok(Self { task })
    }

    /// Unregister (BlueZ releases the profile when the handle drops).
    pub async fn unregister(self) {
        self.task.abort();
        let _ = self.task.await;
        info!("Null HFP profile handler unregistered");
    }
}
