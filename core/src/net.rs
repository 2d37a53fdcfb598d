//! Broker wire protocol and the networked façade client
//!
//! The broker speaks strict request/reply: a client sends one [Envelope]
//! and blocks for one [Reply]. Frames are a 4-byte big-endian length prefix
//! followed by a bincode body. Recipe and probe-list payloads travel as
//! JSON strings so that replies stay readable in the logs of both ends.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::TcpStream;

use anyhow::anyhow;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ResultExt, SystemError, TypedError, TypedResult};
use crate::facade::PhysicalSystems;
use crate::probe::ProbeId;
use crate::problem;
use crate::recipe::Recipe;

pub const DEFAULT_BROKER_PORT: u16 = 5555;

/// Frames larger than this are treated as protocol corruption.
const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub client_id: String,
    pub request: Request,
}

/// One verb of the broker protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    InitializePumpsUsedInProtocol { protocol: String },
    GetCurrentPumpAddress,
    SetAndGetAddressForCurrentPump { address: u8 },
    GetMvValuesOfSelectedProbes { probes: String },
    MeasurePhWithProbeAssociatedWithTask { probe: ProbeId },
    GetPhValuesOfSelectedProbes { probes: String },
    RecalibratePhMeter,
    SetPumpDoseMultiplicationFactor { protocol: String, factor: u32 },
    PumpNTimes { pump_id: u8, count: u32 },
    Disconnect { protocol: String },
    Test,
    Stop,
}

impl Request {
    /// Wire verb name, for log lines on both ends.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::InitializePumpsUsedInProtocol { .. } => "initialize_pumps_used_in_protocol",
            Self::GetCurrentPumpAddress => "get_current_pump_address",
            Self::SetAndGetAddressForCurrentPump { .. } => "set_and_get_address_for_current_pump",
            Self::GetMvValuesOfSelectedProbes { .. } => "get_mv_values_of_selected_probes",
            Self::MeasurePhWithProbeAssociatedWithTask { .. } => {
                "measure_ph_with_probe_associated_with_task"
            }
            Self::GetPhValuesOfSelectedProbes { .. } => "get_ph_values_of_selected_probes",
            Self::RecalibratePhMeter => "recalibrate_ph_meter",
            Self::SetPumpDoseMultiplicationFactor { .. } => "set_pump_dose_multiplication_factor",
            Self::PumpNTimes { .. } => "pump_n_times",
            Self::Disconnect { .. } => "disconnect",
            Self::Test => "test",
            Self::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    Done,
    Value(String),
    Error { kind: SystemError, cause: String },
}

impl Reply {
    pub fn error(error: &TypedError) -> Self {
        Self::Error {
            kind: error.err(),
            cause: format!("{:#}", error.source()),
        }
    }

    /// Human-readable payload; error replies always start with `ERROR`.
    pub fn render(&self) -> String {
        match self {
            Self::Done => "Done".into(),
            Self::Value(value) => value.clone(),
            Self::Error { cause, .. } => format!("ERROR: {cause}"),
        }
    }
}

pub fn send_frame<T: Serialize>(stream: &mut TcpStream, value: &T) -> TypedResult<()> {
    let body = bincode::serialize(value).typ(SystemError::Protocol)?;
    let len = u32::try_from(body.len())
        .map_err(|_| anyhow!("frame of {} bytes exceeds u32", body.len()))
        .typ(SystemError::Protocol)?;
    stream
        .write_all(&len.to_be_bytes())
        .and_then(|_| stream.write_all(&body))
        .typ(SystemError::Bus)
}

pub fn recv_frame<T: DeserializeOwned>(stream: &mut TcpStream) -> TypedResult<T> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).typ(SystemError::ReadFailure)?;
    let len = u32::from_be_bytes(len);
    if len > MAX_FRAME_LEN {
        problem!(Protocol, "peer announced an implausible {len}-byte frame");
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).typ(SystemError::ReadFailure)?;
    bincode::deserialize(&body).typ(SystemError::Protocol)
}

/// Networked implementation of [PhysicalSystems]; every call becomes one
/// request/reply pair with the broker.
pub struct RemoteSystems {
    address: String,
    client_id: String,
    print_messages: bool,
    stream: Option<TcpStream>,
}

impl RemoteSystems {
    pub fn new(address: impl Into<String>, print_messages: bool) -> Self {
        Self {
            address: address.into(),
            client_id: std::process::id().to_string(),
            print_messages,
            stream: None,
        }
    }

    fn call(&mut self, request: Request) -> TypedResult<Reply> {
        let Some(stream) = self.stream.as_mut() else {
            problem!(Bus, "broker connection was never initialized");
        };
        if self.print_messages {
            info!("-> {}", request.verb());
        }
        send_frame(stream, &Envelope {
            client_id: self.client_id.clone(),
            request,
        })?;
        let reply: Reply = recv_frame(stream)?;
        if self.print_messages {
            info!("<- {}", reply.render());
        }
        match reply {
            Reply::Error { kind, cause } => Err(TypedError::new(kind, anyhow!(cause))),
            reply => Ok(reply),
        }
    }

    fn call_for_value(&mut self, request: Request) -> TypedResult<String> {
        match self.call(request)? {
            Reply::Value(value) => Ok(value),
            other => problem!(Protocol, "expected a value reply, got {other:?}"),
        }
    }

    /// `test` round-trip; used to check the broker is alive.
    pub fn ping(&mut self) -> TypedResult<String> {
        self.call_for_value(Request::Test)
    }

    /// Asks the broker to shut down.
    pub fn stop_broker(&mut self) -> TypedResult<()> {
        self.call(Request::Stop).map(|_| ())
    }
}

impl PhysicalSystems for RemoteSystems {
    fn initialize(&mut self) -> TypedResult<()> {
        let stream = TcpStream::connect(&self.address)
            .map_err(|e| anyhow!("could not reach broker at {}: {e}", self.address))
            .typ(SystemError::Bus)?;
        stream.set_nodelay(true).typ(SystemError::Bus)?;
        self.stream = Some(stream);
        info!("connected to broker at {}", self.address);
        Ok(())
    }

    fn initialize_pumps_used_in_protocol(&mut self, recipe: &Recipe) -> TypedResult<()> {
        let protocol = recipe.to_json()?;
        self.call(Request::InitializePumpsUsedInProtocol { protocol })
            .map(|_| ())
    }

    fn current_pump_address(&mut self) -> TypedResult<String> {
        self.call_for_value(Request::GetCurrentPumpAddress)
    }

    fn assign_pump_address(&mut self, address: u8) -> TypedResult<String> {
        self.call_for_value(Request::SetAndGetAddressForCurrentPump { address })
    }

    fn mv_of_selected_probes(
        &mut self,
        probes: &[ProbeId],
    ) -> TypedResult<BTreeMap<ProbeId, f64>> {
        let probes = serde_json::to_string(probes).typ(SystemError::Protocol)?;
        let reply = self.call_for_value(Request::GetMvValuesOfSelectedProbes { probes })?;
        serde_json::from_str(&reply).typ(SystemError::Protocol)
    }

    fn ph_of_selected_probes(
        &mut self,
        probes: &[ProbeId],
    ) -> TypedResult<BTreeMap<ProbeId, f64>> {
        let probes = serde_json::to_string(probes).typ(SystemError::Protocol)?;
        let reply = self.call_for_value(Request::GetPhValuesOfSelectedProbes { probes })?;
        serde_json::from_str(&reply).typ(SystemError::Protocol)
    }

    fn measure_ph_for_task(&mut self, probe: &ProbeId) -> TypedResult<f64> {
        let reply = self.call_for_value(Request::MeasurePhWithProbeAssociatedWithTask {
            probe: *probe,
        })?;
        reply
            .parse()
            .map_err(|e| anyhow!("broker sent a malformed pH value {reply:?}: {e}"))
            .typ(SystemError::Protocol)
    }

    fn pump(&mut self, pump_id: u8) -> TypedResult<()> {
        self.pump_n_times(pump_id, 1)
    }

    fn pump_n_times(&mut self, pump_id: u8, count: u32) -> TypedResult<()> {
        self.call(Request::PumpNTimes { pump_id, count }).map(|_| ())
    }

    fn set_pump_dose_multiplier(&mut self, recipe: &Recipe, factor: u32) -> TypedResult<()> {
        // The payload is the serialised sheet, not a reference to it.
        let protocol = recipe.to_json()?;
        self.call(Request::SetPumpDoseMultiplicationFactor { protocol, factor })
            .map(|_| ())
    }

    fn recalibrate(&mut self) -> TypedResult<()> {
        self.call(Request::RecalibratePhMeter).map(|_| ())
    }

    fn disconnect(&mut self, recipe: &Recipe) -> TypedResult<()> {
        let protocol = recipe.to_json()?;
        self.call(Request::Disconnect { protocol }).map(|_| ())
    }
}
