//! Mixer worker app
//!
//! The worker side of the control plane: connect to the manager, send
//! `register`, then serve lifecycle events against the local mixer task
//! until the manager says `shutdown` or the socket dies.

use serde_json::{json, Value};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use loopcast_event_core::{split_tcp, ErrorCode, EventMessage, EventReader, EventWriter};
use loopcast_media_core::{MixerConfig, MixerHandle};

use crate::error::{Error, Result};
use crate::messages;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct MixerAppConfig {
    /// Manager socket, `host:port`
    pub manager: String,
    /// Worker uuid; generated when absent
    pub uuid: Option<Uuid>,
    /// Initial mixer configuration (replaced by the manager's `configure`)
    pub mixer: MixerConfig,
}

/// Connect to the manager and serve until shutdown or disconnect.
pub async fn run(config: MixerAppConfig) -> Result<()> {
    let stream = TcpStream::connect(&config.manager).await?;
    info!(manager = %config.manager, "connected to manager");
    serve(
        stream,
        config.uuid.unwrap_or_else(Uuid::new_v4),
        config.mixer,
    )
    .await
}

/// Serve the worker protocol on an established manager connection.
pub async fn serve(stream: TcpStream, uuid: Uuid, mixer_config: MixerConfig) -> Result<()> {
    let (mut reader, mut writer) = split_tcp(stream);

    writer.send(&messages::register(uuid)).await?;
    debug!(%uuid, "register sent");

    let mixer = MixerHandle::spawn(mixer_config);
    let result = event_loop(&mut reader, &mut writer, &mixer).await;
    mixer.shutdown().await;
    result
}

async fn event_loop(
    reader: &mut EventReader<OwnedReadHalf>,
    writer: &mut EventWriter<OwnedWriteHalf>,
    mixer: &MixerHandle,
) -> Result<()> {
    while let Some(msg) = reader.recv().await? {
        if msg.is_response() {
            // register has no direct response; nothing else is pending
            continue;
        }

        match handle_event(&msg, mixer).await {
            Some(response) => writer.send(&response).await?,
            None => {
                info!("shutdown received, worker exits");
                return Ok(());
            }
        }
    }

    warn!("manager closed the signaling socket");
    Ok(())
}

/// Apply one manager event to the mixer; `None` means shutdown.
async fn handle_event(msg: &EventMessage, mixer: &MixerHandle) -> Option<EventMessage> {
    let outcome: Result<Value> = match msg.event.as_str() {
        messages::EVENT_CONFIGURE => match messages::parse_configure(msg) {
            Ok(config) => mixer
                .reconfigure(config)
                .await
                .map(|_| json!({}))
                .map_err(Error::Media),
            Err(e) => Err(e),
        },
        messages::EVENT_ACQUIRE => match messages::parse_acquire(msg) {
            Ok((session, forward)) => mixer
                .acquire(session.clone(), forward)
                .await
                .map(|_| json!({ "name": session }))
                .map_err(Error::Media),
            Err(e) => Err(e),
        },
        messages::EVENT_FORWARD => match messages::parse_forward(msg) {
            Ok((session, forward)) => mixer
                .set_forward(forward)
                .await
                .map(|_| json!({ "name": session }))
                .map_err(Error::Media),
            Err(e) => Err(e),
        },
        messages::EVENT_RELEASE => match messages::parse_release(msg) {
            Ok(session) => mixer
                .release()
                .await
                .map(|_| json!({ "name": session }))
                .map_err(Error::Media),
            Err(e) => Err(e),
        },
        messages::EVENT_JOIN => match messages::parse_join(msg) {
            Ok(data) => {
                let loop_name = data.name.clone();
                mixer
                    .join(data)
                    .await
                    .map(|_| json!({ "loop": loop_name }))
                    .map_err(Error::Media)
            }
            Err(e) => Err(e),
        },
        messages::EVENT_LEAVE => match messages::parse_leave(msg) {
            Ok(loop_name) => mixer
                .leave(loop_name.clone())
                .await
                .map(|_| json!({ "loop": loop_name }))
                .map_err(Error::Media),
            Err(e) => Err(e),
        },
        messages::EVENT_VOLUME => match messages::parse_volume(msg) {
            Ok((loop_name, volume)) => mixer
                .set_volume(loop_name.clone(), volume)
                .await
                .map(|_| json!({ "loop": loop_name, "volume": volume }))
                .map_err(Error::Media),
            Err(e) => Err(e),
        },
        messages::EVENT_STATE => mixer.state().await.map_err(Error::Media),
        messages::EVENT_SHUTDOWN => return None,
        other => Err(Error::Parameter(format!("unknown event {}", other))),
    };

    Some(match outcome {
        Ok(value) => EventMessage::success_response(msg, value),
        Err(Error::Parameter(e)) => {
            warn!(event = %msg.event, error = %e, "parameter error");
            EventMessage::error_response(msg, ErrorCode::ParameterError)
        }
        Err(e) => {
            warn!(event = %msg.event, error = %e, "event failed");
            EventMessage::error_response(msg, ErrorCode::ProcessingError)
        }
    })
}
