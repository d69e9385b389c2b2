//! Mixer core: the decode-mix-encode pipeline
//!
//! Owns everything a bound session needs: the joined loops, the per-SSRC
//! frame buffer and stream table, the output RTP state and the
//! precomputed comfort-noise frame. Invoked by the mixer task once per
//! 20 ms tick.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::codec::{samples_per_frame, OpusEncoder, FRAME_LENGTH_MS};
use crate::error::{Error, Result};
use crate::mixer::stream::StreamTable;
use crate::mixer::{Forward, LoopJoin, MixerConfig, MARKER_INTERVAL, STREAM_MAX_IDLE_SECS};
use crate::{pcm, vad};
use loopcast_rtp_core::rtcp::{is_rtcp_packet_type, learned_source};
use loopcast_rtp_core::{
    BufferedFrame, FrameBuffer, LoopPacket, MulticastEndpoint, RtpHeader, RtpPacket, RtpSsrc,
};

/// Ticks between garbage-collector runs; spans the stream idle limit.
const GC_INTERVAL_TICKS: u64 = STREAM_MAX_IDLE_SECS * 1000 / FRAME_LENGTH_MS as u64;

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

struct MixerLoop {
    endpoint: MulticastEndpoint,
    volume: u8,
}

struct OutputState {
    sequence: u16,
    timestamp: u32,
    mark: bool,
}

/// Per-session decode-mix-encode pipeline.
pub struct MixerCore {
    config: MixerConfig,
    name: Option<String>,
    forward: Option<Forward>,
    forward_dest: Option<SocketAddr>,
    socket: Option<UdpSocket>,
    loops: HashMap<String, MixerLoop>,
    packet_tx: mpsc::Sender<LoopPacket>,
    frame_buffer: FrameBuffer,
    streams: StreamTable,
    encoder: OpusEncoder,
    output: OutputState,
    comfort_noise: Vec<i32>,
    /// Peer SSRC learned from RTCP, cancelled like the forward SSRC
    peer_ssrc: Option<RtpSsrc>,
    marker_counter: u64,
    gc_tick_counter: u64,
}

impl MixerCore {
    /// Create an unbound mixer. `packet_tx` is the channel every joined
    /// loop endpoint delivers into; its receiving end belongs to the
    /// mixer task.
    pub fn new(config: MixerConfig, packet_tx: mpsc::Sender<LoopPacket>) -> Result<Self> {
        let samples = samples_per_frame(config.sample_rate_hz);
        let encoder = OpusEncoder::new(config.sample_rate_hz)?;
        let comfort_noise = comfort_noise_frame(&config, samples);

        Ok(Self {
            frame_buffer: FrameBuffer::new(config.frame_buffer),
            streams: StreamTable::new(config.sample_rate_hz),
            encoder,
            output: OutputState {
                sequence: rand::random(),
                timestamp: rand::random(),
                mark: true,
            },
            comfort_noise,
            name: None,
            forward: None,
            forward_dest: None,
            socket: None,
            loops: HashMap::new(),
            packet_tx,
            peer_ssrc: None,
            marker_counter: 0,
            gc_tick_counter: 0,
            config,
        })
    }

    /// Apply a new configuration. Loops, binding and output counters
    /// survive; codec state and the comfort-noise frame are rebuilt.
    pub fn reconfigure(&mut self, config: MixerConfig) -> Result<()> {
        let samples = samples_per_frame(config.sample_rate_hz);
        if config.sample_rate_hz != self.config.sample_rate_hz {
            self.encoder = OpusEncoder::new(config.sample_rate_hz)?;
            self.streams.set_sample_rate(config.sample_rate_hz);
        }
        if config.frame_buffer != self.config.frame_buffer {
            self.frame_buffer = FrameBuffer::new(config.frame_buffer);
        }
        self.comfort_noise = comfort_noise_frame(&config, samples);
        self.config = config;
        debug!("mixer reconfigured");
        Ok(())
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn forward(&self) -> Option<&Forward> {
        self.forward.as_ref()
    }

    /// Bind the mixer to a session: release whatever was bound before,
    /// then take the new name and forward target.
    pub async fn acquire(&mut self, name: String, forward: Forward) -> Result<()> {
        self.release();
        self.set_forward(forward).await?;
        info!(session = %name, "mixer acquired");
        self.name = Some(name);
        Ok(())
    }

    /// Point the output stream at a new target.
    pub async fn set_forward(&mut self, forward: Forward) -> Result<()> {
        if !forward.is_valid() {
            return Err(Error::InvalidParameter("invalid forward data".to_string()));
        }
        let dest = forward.destination()?;
        let bind_addr: SocketAddr = match dest {
            SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
            SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
        };
        let socket = UdpSocket::bind(bind_addr).await?;

        self.forward_dest = Some(dest);
        self.socket = Some(socket);
        self.forward = Some(forward);
        Ok(())
    }

    /// Drop the session binding: leave all loops, flush all state.
    pub fn release(&mut self) {
        if let Some(name) = self.name.take() {
            info!(session = %name, "mixer released");
        }
        self.loops.clear();
        self.frame_buffer.clear();
        self.streams.clear();
        self.forward = None;
        self.forward_dest = None;
        self.socket = None;
        self.peer_ssrc = None;
    }

    /// Join a multicast loop.
    pub async fn join(&mut self, data: LoopJoin) -> Result<()> {
        if data.name.is_empty() {
            return Err(Error::InvalidParameter("empty loop name".to_string()));
        }
        if self.loops.contains_key(&data.name) {
            return Err(Error::InvalidParameter(format!(
                "loop {} already joined",
                data.name
            )));
        }
        let group: IpAddr = data
            .host
            .parse()
            .map_err(|_| Error::InvalidParameter(format!("invalid group address {}", data.host)))?;

        let endpoint =
            MulticastEndpoint::bind(data.name.clone(), group, data.port, self.packet_tx.clone())
                .await?;

        info!(loop_name = %data.name, group = %data.host, port = data.port, "joined loop");
        self.loops.insert(
            data.name,
            MixerLoop {
                endpoint,
                volume: data.volume.min(100),
            },
        );
        Ok(())
    }

    /// Leave a loop.
    pub fn leave(&mut self, name: &str) -> Result<()> {
        self.loops
            .remove(name)
            .map(|_| info!(loop_name = %name, "left loop"))
            .ok_or_else(|| Error::UnknownLoop(name.to_string()))
    }

    /// Set a loop's volume, clamped to 0..=100.
    pub fn set_volume(&mut self, name: &str, volume: u8) -> Result<()> {
        let l = self
            .loops
            .get_mut(name)
            .ok_or_else(|| Error::UnknownLoop(name.to_string()))?;
        l.volume = volume.min(100);
        Ok(())
    }

    pub fn volume(&self, name: &str) -> Result<u8> {
        self.loops
            .get(name)
            .map(|l| l.volume)
            .ok_or_else(|| Error::UnknownLoop(name.to_string()))
    }

    /// Feed one datagram received on a joined loop.
    pub fn ingest(&mut self, packet: &LoopPacket) {
        let Some(volume) = self.loops.get(&packet.loop_name).map(|l| l.volume) else {
            return;
        };
        self.ingest_frame(&packet.data, volume);
    }

    /// Feed one raw datagram with an explicit per-source gain.
    pub fn ingest_frame(&mut self, data: &[u8], volume: u8) {
        if data.len() >= 2 && is_rtcp_packet_type(data[1]) {
            // RTCP is read only to learn the peer SSRC of our own
            // outbound stream, once
            if self.peer_ssrc.is_none() {
                if let Some(ssrc) = learned_source(data) {
                    debug!(ssrc, "learned peer SSRC from RTCP");
                    self.peer_ssrc = Some(ssrc);
                }
            }
            return;
        }

        let packet = match RtpPacket::parse(data) {
            Ok(p) => p,
            Err(e) => {
                trace!(error = %e, "dropping undecodable frame");
                return;
            }
        };

        let ssrc = packet.header.ssrc;
        if Some(ssrc) == self.forward.as_ref().map(|f| f.ssrc) || Some(ssrc) == self.peer_ssrc {
            trace!(ssrc, "dropping own echo");
            return;
        }

        if let Some(evicted) = self.frame_buffer.insert(BufferedFrame {
            packet,
            gain: volume.min(100),
        }) {
            trace!(
                ssrc = evicted.packet.header.ssrc,
                "frame ring full, dropped oldest"
            );
        }
    }

    /// One 20 ms tick: mix what arrived, fall back to comfort noise on an
    /// idle tick, encode and produce at most one output frame.
    pub fn tick(&mut self) -> Option<RtpPacket> {
        self.maybe_gc();

        let forward = self.forward.clone()?;

        let (pcm32, num_samples) = match self.mix_inputs() {
            Some(mixed) => mixed,
            None => self.keepalive_frame()?,
        };

        let pcm16 = pcm::clip_i32_to_i16(&pcm32);
        let payload = match self.encoder.encode(&pcm16) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "output encode failed, tick dropped");
                return None;
            }
        };

        let mut marker = self.output.mark;
        self.marker_counter += 1;
        if self.marker_counter % MARKER_INTERVAL == 0 {
            marker = true;
        }

        let mut header = RtpHeader::new(
            forward.payload_type & 0x7f,
            self.output.sequence,
            self.output.timestamp,
            forward.ssrc,
        );
        header.marker = marker;

        self.output.sequence = self.output.sequence.wrapping_add(1);
        self.output.timestamp = self.output.timestamp.wrapping_add(num_samples as u32);
        self.output.mark = false;

        Some(RtpPacket::new(header, Bytes::from(payload)))
    }

    /// Send an emitted frame to the forward destination, best effort.
    pub async fn send_packet(&self, packet: &RtpPacket) {
        let (Some(socket), Some(dest)) = (&self.socket, self.forward_dest) else {
            return;
        };
        match packet.serialize() {
            Ok(wire) => {
                if let Err(e) = socket.send_to(&wire, dest).await {
                    trace!(error = %e, "forward send failed");
                }
            }
            Err(e) => debug!(error = %e, "output serialize failed"),
        }
    }

    /// Mixer state snapshot for the `state` event.
    pub fn state(&self) -> Value {
        let mut loops = serde_json::Map::new();
        for (name, l) in &self.loops {
            loops.insert(
                name.clone(),
                json!({
                    "host": l.endpoint.group().ip().to_string(),
                    "port": l.endpoint.group().port(),
                    "volume": l.volume,
                    "ssrc": l.endpoint.local_ssrc(),
                }),
            );
        }

        json!({
            "pid": std::process::id(),
            "name": self.name,
            "forward": self.forward.as_ref().map(|f| json!({
                "host": f.host,
                "port": f.port,
                "ssrc": f.ssrc,
                "payload_type": f.payload_type,
            })),
            "loops": Value::Object(loops),
            "output": {
                "sequence_number": self.output.sequence,
                "timestamp": self.output.timestamp,
            },
        })
    }

    /// Drain one frame per source, decode, apply gain and sum. `None`
    /// when nothing contributed this tick.
    fn mix_inputs(&mut self) -> Option<(Vec<i32>, usize)> {
        let mut frames = self.frame_buffer.take_tick();
        if self.config.max_num_frames > 0 && frames.len() > self.config.max_num_frames {
            frames.truncate(self.config.max_num_frames);
        }

        let now = epoch_secs();
        let mut acc: Option<Vec<i32>> = None;
        let mut contributed = 0usize;

        for frame in &frames {
            let Some(pcm32) = self.decode_frame(frame, now) else {
                continue;
            };
            match &mut acc {
                None => {
                    acc = Some(pcm32);
                    contributed = 1;
                }
                Some(reference) => {
                    // frames of a different length than the first
                    // non-empty frame are skipped
                    if pcm32.len() != reference.len() {
                        continue;
                    }
                    pcm::add_i32(reference, &pcm32);
                    contributed += 1;
                }
            }
        }

        let mut mixed = acc?;
        if self.config.normalize_mixed_by_root && contributed > 1 {
            let factor = 1.0 / (contributed as f64).sqrt();
            for sample in mixed.iter_mut() {
                *sample = (*sample as f64 * factor).round() as i32;
            }
        }

        let num_samples = mixed.len();
        Some((mixed, num_samples))
    }

    /// Decode one buffered frame and widen it with its effective gain.
    fn decode_frame(&mut self, frame: &BufferedFrame, now: u64) -> Option<Vec<i32>> {
        if frame.packet.payload.is_empty() {
            return None;
        }

        let ssrc = frame.packet.header.ssrc;
        let vad_config = self.config.vad.clone();
        let sample_rate = self.config.sample_rate_hz;

        let entry = match self.streams.entry_mut(ssrc, now) {
            Ok(e) => e,
            Err(e) => {
                debug!(ssrc, error = %e, "no stream entry");
                return None;
            }
        };

        let decoded = match entry.decoder.decode(&frame.packet.payload) {
            Ok(d) => d,
            Err(e) => {
                trace!(ssrc, error = %e, "decode failed, frame dropped");
                return None;
            }
        };
        if decoded.is_empty() {
            return None;
        }

        let gain = frame.gain.min(100) as f64 / 100.0;
        if !vad_config.enabled {
            return Some(pcm::scale_i16_to_i32(&decoded, gain));
        }

        let params = pcm::audio_params(&decoded, sample_rate);
        let voice = vad::voice_detected(&params, &vad_config);
        let was_voice = entry.voice_detected;
        entry.voice_detected = voice;

        let peak = params.max_amplitude.max(1) as f64;
        let normalized = gain * i16::MAX as f64 / peak;

        if voice {
            if was_voice {
                Some(pcm::scale_i16_to_i32(&decoded, normalized))
            } else {
                // fade in on the rising edge of the voice latch
                Some(pcm::fade_i16_to_i32(&decoded, gain, normalized))
            }
        } else if vad_config.drop {
            None
        } else if was_voice {
            // fade out on the falling edge
            Some(pcm::fade_i16_to_i32(&decoded, normalized, gain))
        } else {
            Some(pcm::scale_i16_to_i32(&decoded, gain))
        }
    }

    /// The comfort-noise fallback frame for idle ticks.
    fn keepalive_frame(&self) -> Option<(Vec<i32>, usize)> {
        if !self.config.rtp_keepalive {
            return None;
        }
        let noise = self.comfort_noise.clone();
        let num_samples = noise.len();
        Some((noise, num_samples))
    }

    fn maybe_gc(&mut self) {
        self.gc_tick_counter += 1;
        if self.gc_tick_counter >= GC_INTERVAL_TICKS {
            self.gc_tick_counter = 0;
            let removed = self.streams.gc(epoch_secs(), STREAM_MAX_IDLE_SECS);
            if removed > 0 {
                debug!(removed, "reclaimed idle RTP streams");
            }
        }
    }
}

/// Precompute the 32-bit comfort-noise frame at the configured level.
fn comfort_noise_frame(config: &MixerConfig, samples: usize) -> Vec<i32> {
    let amplitude = pcm::db_to_amplitude(config.comfort_noise as f64);
    let noise = pcm::white_noise(samples, amplitude);
    pcm::scale_i16_to_i32(&noise, 1.0)
}
