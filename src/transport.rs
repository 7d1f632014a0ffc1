//! Transport selection.
//!
//! The production WhatsApp adapter compiles behind the `whatsapp`
//! feature; default builds ship a disabled transport so the daemon,
//! store, and API run everywhere.

#[cfg(feature = "whatsapp")]
mod whatsapp;

use courier_core::config::Config;
use courier_core::traits::Transport;
use std::sync::Arc;

#[cfg(feature = "whatsapp")]
pub fn build(config: &Config) -> Arc<dyn Transport> {
    Arc::new(whatsapp::WhatsAppTransport::new(config))
}

#[cfg(not(feature = "whatsapp"))]
pub fn build(_config: &Config) -> Arc<dyn Transport> {
    Arc::new(disabled::DisabledTransport)
}

#[cfg(not(feature = "whatsapp"))]
mod disabled {
    use async_trait::async_trait;
    use courier_core::error::CourierError;
    use courier_core::traits::{LinkEvent, SessionCredentials, Transport, TransportLink};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// Stand-in transport for builds without the `whatsapp` feature.
    pub struct DisabledTransport;

    #[async_trait]
    impl Transport for DisabledTransport {
        async fn connect(
            &self,
            number: &str,
            _stored: Option<SessionCredentials>,
        ) -> Result<(Arc<dyn TransportLink>, mpsc::Receiver<LinkEvent>), CourierError> {
            Err(CourierError::Transport(format!(
                "cannot connect {number}: this build has no transport; \
                 rebuild with --features whatsapp"
            )))
        }
    }
}
