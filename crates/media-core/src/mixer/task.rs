//! Mixer task and handle
//!
//! The task owns the [`MixerCore`] exclusively and multiplexes three
//! inputs: the 20 ms mix tick, loop datagrams and control commands. A
//! tick overrun does not cascade, the next tick simply sees more queued
//! frames.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::codec::FRAME_LENGTH_MS;
use crate::error::{Error, Result};
use crate::mixer::{Forward, LoopJoin, MixerConfig, MixerCore};

/// Control commands accepted by the mixer task.
pub enum MixerCommand {
    Reconfigure(MixerConfig, oneshot::Sender<Result<()>>),
    Acquire {
        name: String,
        forward: Forward,
        reply: oneshot::Sender<Result<()>>,
    },
    SetForward {
        forward: Forward,
        reply: oneshot::Sender<Result<()>>,
    },
    Release {
        reply: oneshot::Sender<Result<()>>,
    },
    Join {
        data: LoopJoin,
        reply: oneshot::Sender<Result<()>>,
    },
    Leave {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    SetVolume {
        name: String,
        volume: u8,
        reply: oneshot::Sender<Result<()>>,
    },
    State {
        reply: oneshot::Sender<Value>,
    },
    Shutdown,
}

/// Handle to a running mixer task.
#[derive(Clone)]
pub struct MixerHandle {
    tx: mpsc::Sender<MixerCommand>,
}

impl MixerHandle {
    /// Spawn the mixer task with its tick timer and packet channel.
    pub fn spawn(config: MixerConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (packet_tx, packet_rx) = mpsc::channel(256);
        tokio::spawn(run(config, packet_tx, cmd_rx, packet_rx));
        Self { tx: cmd_tx }
    }

    pub async fn reconfigure(&self, config: MixerConfig) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(MixerCommand::Reconfigure(config, tx)).await?;
        rx.await.map_err(|_| Error::TaskGone)?
    }

    pub async fn acquire(&self, name: String, forward: Forward) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(MixerCommand::Acquire {
            name,
            forward,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| Error::TaskGone)?
    }

    pub async fn set_forward(&self, forward: Forward) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(MixerCommand::SetForward { forward, reply: tx }).await?;
        rx.await.map_err(|_| Error::TaskGone)?
    }

    pub async fn release(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(MixerCommand::Release { reply: tx }).await?;
        rx.await.map_err(|_| Error::TaskGone)?
    }

    pub async fn join(&self, data: LoopJoin) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(MixerCommand::Join { data, reply: tx }).await?;
        rx.await.map_err(|_| Error::TaskGone)?
    }

    pub async fn leave(&self, name: String) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(MixerCommand::Leave { name, reply: tx }).await?;
        rx.await.map_err(|_| Error::TaskGone)?
    }

    pub async fn set_volume(&self, name: String, volume: u8) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(MixerCommand::SetVolume {
            name,
            volume,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| Error::TaskGone)?
    }

    pub async fn state(&self) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.send(MixerCommand::State { reply: tx }).await?;
        rx.await.map_err(|_| Error::TaskGone)
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(MixerCommand::Shutdown).await;
    }

    async fn send(&self, cmd: MixerCommand) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| Error::TaskGone)
    }
}

async fn run(
    config: MixerConfig,
    packet_tx: mpsc::Sender<loopcast_rtp_core::LoopPacket>,
    mut cmd_rx: mpsc::Receiver<MixerCommand>,
    mut packet_rx: mpsc::Receiver<loopcast_rtp_core::LoopPacket>,
) {
    let mut core = match MixerCore::new(config, packet_tx) {
        Ok(core) => core,
        Err(e) => {
            error!(error = %e, "mixer construction failed");
            return;
        }
    };

    let mut tick = tokio::time::interval(Duration::from_millis(FRAME_LENGTH_MS as u64));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Some(packet) = core.tick() {
                    core.send_packet(&packet).await;
                }
            }
            maybe_cmd = cmd_rx.recv() => {
                match maybe_cmd {
                    Some(cmd) => {
                        if handle_command(&mut core, cmd).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            Some(packet) = packet_rx.recv() => {
                core.ingest(&packet);
            }
        }
    }

    debug!("mixer task stopped");
}

/// Apply one command; returns true on shutdown.
async fn handle_command(core: &mut MixerCore, cmd: MixerCommand) -> bool {
    match cmd {
        MixerCommand::Reconfigure(config, reply) => {
            let _ = reply.send(core.reconfigure(config));
        }
        MixerCommand::Acquire {
            name,
            forward,
            reply,
        } => {
            let _ = reply.send(core.acquire(name, forward).await);
        }
        MixerCommand::SetForward { forward, reply } => {
            let _ = reply.send(core.set_forward(forward).await);
        }
        MixerCommand::Release { reply } => {
            core.release();
            let _ = reply.send(Ok(()));
        }
        MixerCommand::Join { data, reply } => {
            let _ = reply.send(core.join(data).await);
        }
        MixerCommand::Leave { name, reply } => {
            let _ = reply.send(core.leave(&name));
        }
        MixerCommand::SetVolume {
            name,
            volume,
            reply,
        } => {
            let _ = reply.send(core.set_volume(&name, volume));
        }
        MixerCommand::State { reply } => {
            let _ = reply.send(core.state());
        }
        MixerCommand::Shutdown => return true,
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward() -> Forward {
        Forward {
            host: "127.0.0.1".to_string(),
            port: 46101,
            ssrc: 7,
            payload_type: 100,
        }
    }

    #[tokio::test]
    async fn test_acquire_release_roundtrip() {
        let handle = MixerHandle::spawn(MixerConfig::default());

        handle.acquire("session-1".to_string(), forward()).await.unwrap();
        let state = handle.state().await.unwrap();
        assert_eq!(state["name"], "session-1");

        handle.release().await.unwrap();
        let state = handle.state().await.unwrap();
        assert!(state["name"].is_null());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconfigure() {
        let handle = MixerHandle::spawn(MixerConfig::default());
        let mut config = MixerConfig::default();
        config.sample_rate_hz = 16000;
        handle.reconfigure(config).await.unwrap();
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_leave_unknown_loop_fails() {
        let handle = MixerHandle::spawn(MixerConfig::default());
        handle.acquire("session-1".to_string(), forward()).await.unwrap();
        assert!(handle.leave("nowhere".to_string()).await.is_err());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_emits_to_forward_destination() {
        // a real unicast receiver stands in for the session client
        let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let handle = MixerHandle::spawn(MixerConfig::default());
        handle
            .acquire(
                "session-1".to_string(),
                Forward {
                    host: "127.0.0.1".to_string(),
                    port,
                    ssrc: 0xfeed,
                    payload_type: 100,
                },
            )
            .await
            .unwrap();

        // keepalive comfort noise reaches the client even without input
        let mut buf = vec![0u8; 2048];
        let received = tokio::time::timeout(
            Duration::from_secs(2),
            receiver.recv_from(&mut buf),
        )
        .await
        .expect("keepalive frame within two seconds")
        .unwrap();

        let (len, _) = received;
        let packet = loopcast_rtp_core::RtpPacket::parse(&buf[..len]).unwrap();
        assert_eq!(packet.header.ssrc, 0xfeed);
        assert_eq!(packet.header.payload_type, 100);

        handle.shutdown().await;
    }
}
