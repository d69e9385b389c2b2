//! Interconnect signaling messages
//!
//! The three-step dance between two fabrics: `register` authenticates,
//! `connect_media` exchanges media endpoints and DTLS fingerprints,
//! `connect_loops` binds the loops both sides share.

use serde_json::{json, Value};

use loopcast_event_core::EventMessage;

use crate::error::{Error, Result};

pub const EVENT_REGISTER: &str = "register";
pub const EVENT_CONNECT_MEDIA: &str = "connect_media";
pub const EVENT_CONNECT_LOOPS: &str = "connect_loops";

/// Default media codec announced by this fabric.
pub const DEFAULT_CODEC: &str = "opus/48000/2";

/// One loop entry of a `connect_loops` exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopEntry {
    pub name: String,
    pub ssrc: u32,
}

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

/// `register{name, password}`: authenticate to the server fabric.
pub fn register(name: &str, password: &str) -> EventMessage {
    EventMessage::request(
        EVENT_REGISTER,
        json!({ "name": name, "password": password }),
    )
}

pub fn parse_register(msg: &EventMessage) -> Result<(String, String)> {
    let par = parameter(msg)?;
    Ok((string_field(par, "name")?, string_field(par, "password")?))
}

/// `connect_media{name, codec, host, port}`: advertise a media endpoint.
pub fn connect_media(name: &str, codec: &str, host: &str, port: u16) -> EventMessage {
    EventMessage::request(
        EVENT_CONNECT_MEDIA,
        json!({ "name": name, "codec": codec, "host": host, "port": port }),
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectMedia {
    pub name: String,
    pub codec: String,
    pub host: String,
    pub port: u16,
}

pub fn parse_connect_media(msg: &EventMessage) -> Result<ConnectMedia> {
    let par = parameter(msg)?;
    Ok(ConnectMedia {
        name: string_field(par, "name")?,
        codec: string_field(par, "codec")?,
        host: string_field(par, "host")?,
        port: u64_field(par, "port")? as u16,
    })
}

/// The server's `connect_media` response: its media endpoint and DTLS
/// fingerprint.
pub fn connect_media_response(
    request: &EventMessage,
    name: &str,
    host: &str,
    port: u16,
    fingerprint: &str,
) -> EventMessage {
    EventMessage::success_response(
        request,
        json!({ "name": name, "host": host, "port": port, "fingerprint": fingerprint }),
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectMediaResponse {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub fingerprint: String,
}

pub fn parse_connect_media_response(msg: &EventMessage) -> Result<ConnectMediaResponse> {
    let value = msg
        .response
        .as_ref()
        .ok_or_else(|| Error::Parameter("connect_media response missing".to_string()))?;
    Ok(ConnectMediaResponse {
        name: string_field(value, "name")?,
        host: string_field(value, "host")?,
        port: u64_field(value, "port")? as u16,
        fingerprint: string_field(value, "fingerprint")?,
    })
}

fn loops_value(loops: &[LoopEntry]) -> Value {
    json!({
        "loops": loops
            .iter()
            .map(|l| json!({ "name": l.name, "ssrc": l.ssrc }))
            .collect::<Vec<_>>(),
    })
}

fn parse_loops_value(value: &Value) -> Result<Vec<LoopEntry>> {
    let items = value
        .get("loops")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Parameter("missing field loops".to_string()))?;
    items
        .iter()
        .map(|item| {
            Ok(LoopEntry {
                name: string_field(item, "name")?,
                ssrc: u64_field(item, "ssrc")? as u32,
            })
        })
        .collect()
}

/// `connect_loops{loops:[{name, ssrc}]}`: announce the local loops with
/// the SSRC this fabric emits per loop.
pub fn connect_loops(loops: &[LoopEntry]) -> EventMessage {
    EventMessage::request(EVENT_CONNECT_LOOPS, loops_value(loops))
}

pub fn parse_connect_loops(msg: &EventMessage) -> Result<Vec<LoopEntry>> {
    parse_loops_value(parameter(msg)?)
}

/// The server's view: the matching subset with its own SSRCs.
pub fn connect_loops_response(request: &EventMessage, loops: &[LoopEntry]) -> EventMessage {
    EventMessage::success_response(request, loops_value(loops))
}

pub fn parse_connect_loops_response(msg: &EventMessage) -> Result<Vec<LoopEntry>> {
    let value = msg
        .response
        .as_ref()
        .ok_or_else(|| Error::Parameter("connect_loops response missing".to_string()))?;
    parse_loops_value(value)
}
