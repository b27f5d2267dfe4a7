//! Just Works pairing agent.
//!
//! Speakers have no display or keypad, so the agent registers with the
//! NoInputNoOutput capability (bluer derives it from the callbacks we
//! provide) and auto-authorizes pairing and service connections.

use bluer::agent::{Agent, AgentHandle, AuthorizeService, RequestAuthorization};
use futures::FutureExt;
use log::{debug, info};

/// Register the agent as the system default. Keep the returned handle
/// alive; dropping it unregisters the agent.
pub async fn register(session: &bluer::Session) -> bluer::Result<AgentHandle> {
    let agent = Agent {
        request_default: true,
        request_authorization: Some(Box::new(|req: RequestAuthorization| {
            async move {
                info!("Auto-authorizing pairing for {}", req.device);
                Ok(())
            }
            .boxed()
        })),
        authorize_service: Some(Box::new(|req: AuthorizeService| {
            async move {
                info!("Auto-authorizing service {} for {}", req.service, req.device);
                Ok(())
            }
            .boxed()
        })),
        ..Default::default()
    };
    let handle = session.register_agent(agent).await?;
    info!("Pairing agent registered (capability: NoInputNoOutput)");
    Ok(handle)
}

pub fn unregister(handle: AgentHandle) {
    drop(handle);
    debug!("Pairing agent unregistered");
}
