//! Mixer control-plane messages
//!
//! Builders and parsers for the events exchanged between the backend
//! manager and its mixer workers. Each request is an [`EventMessage`]
//! whose `parameter` object carries the fields listed in the wire
//! contract; parsers give the typed view back.

use serde_json::{json, Value};
use uuid::Uuid;

use loopcast_event_core::EventMessage;
use loopcast_media_core::{Forward, LoopJoin, MixerConfig};

use crate::error::{Error, Result};

pub const EVENT_REGISTER: &str = "register";
pub const EVENT_CONFIGURE: &str = "configure";
pub const EVENT_ACQUIRE: &str = "acquire";
pub const EVENT_FORWARD: &str = "forward";
pub const EVENT_RELEASE: &str = "release";
pub const EVENT_JOIN: &str = "join";
pub const EVENT_LEAVE: &str = "leave";
pub const EVENT_VOLUME: &str = "volume";
pub const EVENT_STATE: &str = "state";
pub const EVENT_SHUTDOWN: &str = "shutdown";

/// Worker type accepted by the manager.
pub const MIXER_TYPE_AUDIO: &str = "audio";

fn parameter(msg: &EventMessage) -> Result<&Value> {
    msg.parameter
        .as_ref()
        .ok_or_else(|| Error::Parameter(format!("{} without parameter", msg.event)))
}

fn string_field(value: &Value, field: &str) -> Result<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Parameter(format!("missing field {}", field)))
}

fn u64_field(value: &Value, field: &str) -> Result<u64> {
    value
        .get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::Parameter(format!("missing field {}", field)))
}

/// `register{uuid, type:"audio"}`: worker announces itself.
pub fn register(worker_uuid: Uuid) -> EventMessage {
    EventMessage::request(
        EVENT_REGISTER,
        json!({ "uuid": worker_uuid, "type": MIXER_TYPE_AUDIO }),
    )
}

/// Parse a `register` request into (worker uuid, worker type).
pub fn parse_register(msg: &EventMessage) -> Result<(Uuid, String)> {
    let par = parameter(msg)?;
    let uuid = string_field(par, "uuid")?
        .parse()
        .map_err(|_| Error::Parameter("uuid is not a uuid".to_string()))?;
    let kind = string_field(par, "type")?;
    Ok((uuid, kind))
}

/// `configure{...}`: manager pushes the mixer core configuration.
pub fn configure(config: &MixerConfig) -> EventMessage {
    let parameter = serde_json::to_value(config).unwrap_or_else(|_| json!({}));
    EventMessage::request(EVENT_CONFIGURE, parameter)
}

pub fn parse_configure(msg: &EventMessage) -> Result<MixerConfig> {
    let par = parameter(msg)?;
    serde_json::from_value(par.clone()).map_err(|e| Error::Parameter(e.to_string()))
}

fn forward_parameter(session: &str, forward: &Forward) -> Value {
    json!({
        "name": session,
        "socket": {
            "host": forward.host,
            "port": forward.port,
            "type": "UDP",
        },
        "ssrc": forward.ssrc,
        "payload_type": forward.payload_type,
    })
}

fn parse_forward_parameter(par: &Value) -> Result<(String, Forward)> {
    let session = string_field(par, "name")?;
    let socket = par
        .get("socket")
        .ok_or_else(|| Error::Parameter("missing field socket".to_string()))?;
    let forward = Forward {
        host: string_field(socket, "host")?,
        port: u64_field(socket, "port")? as u16,
        ssrc: u64_field(par, "ssrc")? as u32,
        payload_type: u64_field(par, "payload_type")? as u8,
    };
    Ok((session, forward))
}

/// `acquire{name, socket, ssrc, payload_type}`: bind a worker to a
/// session and set its forward target.
pub fn acquire(session: &str, forward: &Forward) -> EventMessage {
    EventMessage::request(EVENT_ACQUIRE, forward_parameter(session, forward))
}

pub fn parse_acquire(msg: &EventMessage) -> Result<(String, Forward)> {
    parse_forward_parameter(parameter(msg)?)
}

/// `forward{...}`: replace the forward target of a bound worker.
pub fn forward(session: &str, forward: &Forward) -> EventMessage {
    EventMessage::request(EVENT_FORWARD, forward_parameter(session, forward))
}

pub fn parse_forward(msg: &EventMessage) -> Result<(String, Forward)> {
    parse_forward_parameter(parameter(msg)?)
}

/// `release{name}`: unbind the worker from its session.
pub fn release(session: &str) -> EventMessage {
    EventMessage::request(EVENT_RELEASE, json!({ "name": session }))
}

pub fn parse_release(msg: &EventMessage) -> Result<String> {
    string_field(parameter(msg)?, "name")
}

/// `join{name, socket{host,port,type}, volume}`: join a multicast loop.
pub fn join(data: &LoopJoin) -> EventMessage {
    EventMessage::request(
        EVENT_JOIN,
        json!({
            "name": data.name,
            "socket": {
                "host": data.host,
                "port": data.port,
                "type": "UDP",
            },
            "volume": data.volume,
        }),
    )
}

pub fn parse_join(msg: &EventMessage) -> Result<LoopJoin> {
    let par = parameter(msg)?;
    let socket = par
        .get("socket")
        .ok_or_else(|| Error::Parameter("missing field socket".to_string()))?;
    Ok(LoopJoin {
        name: string_field(par, "name")?,
        host: string_field(socket, "host")?,
        port: u64_field(socket, "port")? as u16,
        volume: par.get("volume").and_then(Value::as_u64).unwrap_or(50) as u8,
    })
}

/// `leave{loop}`: leave a multicast loop.
pub fn leave(loop_name: &str) -> EventMessage {
    EventMessage::request(EVENT_LEAVE, json!({ "loop": loop_name }))
}

pub fn parse_leave(msg: &EventMessage) -> Result<String> {
    string_field(parameter(msg)?, "loop")
}

/// `volume{loop, volume}`: set a loop's volume.
pub fn volume(loop_name: &str, volume: u8) -> EventMessage {
    EventMessage::request(
        EVENT_VOLUME,
        json!({ "loop": loop_name, "volume": volume }),
    )
}

pub fn parse_volume(msg: &EventMessage) -> Result<(String, u8)> {
    let par = parameter(msg)?;
    let loop_name = string_field(par, "loop")?;
    let vol = u64_field(par, "volume")?.min(100) as u8;
    Ok((loop_name, vol))
}

/// `state{}`: request a mixer state snapshot.
pub fn state() -> EventMessage {
    EventMessage::request(EVENT_STATE, json!({}))
}

/// `shutdown{}`: terminate the worker; no response follows.
pub fn shutdown() -> EventMessage {
    EventMessage::request(EVENT_SHUTDOWN, json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_forward() -> Forward {
        Forward {
            host: "10.0.0.9".to_string(),
            port: 5004,
            ssrc: 4711,
            payload_type: 100,
        }
    }

    #[test]
    fn test_register_roundtrip() {
        let uuid = Uuid::new_v4();
        let msg = register(uuid);
        let (parsed, kind) = parse_register(&msg).unwrap();
        assert_eq!(parsed, uuid);
        assert_eq!(kind, MIXER_TYPE_AUDIO);
    }

    #[test]
    fn test_configure_roundtrip() {
        let mut config = MixerConfig::default();
        config.vad.enabled = true;
        config.sample_rate_hz = 16000;
        let msg = configure(&config);
        assert_eq!(msg.event, EVENT_CONFIGURE);
        assert_eq!(parse_configure(&msg).unwrap(), config);
    }

    #[test]
    fn test_acquire_roundtrip() {
        let msg = acquire("session-1", &test_forward());
        let (session, fwd) = parse_acquire(&msg).unwrap();
        assert_eq!(session, "session-1");
        assert_eq!(fwd, test_forward());
        // socket object carries the UDP type tag
        assert_eq!(msg.parameter.as_ref().unwrap()["socket"]["type"], "UDP");
    }

    #[test]
    fn test_join_roundtrip() {
        let data = LoopJoin {
            name: "loopA".to_string(),
            host: "239.0.0.1".to_string(),
            port: 5004,
            volume: 50,
        };
        let parsed = parse_join(&join(&data)).unwrap();
        assert_eq!(parsed, data);
    }

    #[test]
    fn test_join_defaults_volume() {
        let msg = EventMessage::request(
            EVENT_JOIN,
            json!({"name": "a", "socket": {"host": "239.0.0.1", "port": 5004, "type": "UDP"}}),
        );
        assert_eq!(parse_join(&msg).unwrap().volume, 50);
    }

    #[test]
    fn test_leave_and_volume() {
        assert_eq!(parse_leave(&leave("loopA")).unwrap(), "loopA");
        let (name, vol) = parse_volume(&volume("loopA", 70)).unwrap();
        assert_eq!((name.as_str(), vol), ("loopA", 70));
    }

    #[test]
    fn test_volume_clamped_on_parse() {
        let msg = EventMessage::request(EVENT_VOLUME, json!({"loop": "a", "volume": 250}));
        assert_eq!(parse_volume(&msg).unwrap().1, 100);
    }

    #[test]
    fn test_missing_parameter_is_an_error() {
        let msg = EventMessage::request(EVENT_RELEASE, json!({}));
        assert!(parse_release(&msg).is_err());
    }
}
