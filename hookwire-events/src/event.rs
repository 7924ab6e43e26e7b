use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ProbeKind;

/// An event decoded from a record, as delivered to sinks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecodedEvent {
    /// Timestamp of when the hook fired, in nanoseconds.
    pub timestamp: u64,
    pub hook_id: u32,
    /// Id of the probe descriptor the event originates from.
    pub probe: String,
    pub hook: String,
    pub kind: ProbeKind,
    pub body: EventBody,
}

/// Schema specific part of an event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schema", rename_all = "snake_case")]
pub enum EventBody {
    /// The hook fired, nothing else is reported.
    Marker,
    Xdp(XdpEvent),
}

impl EventBody {
    pub fn name(&self) -> &'static str {
        match self {
            EventBody::Marker => "marker",
            EventBody::Xdp(_) => "xdp",
        }
    }
}

/// XDP context as seen by a probe attached to an XDP program.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct XdpEvent {
    /// Index of the interface the packet was received on.
    pub ifindex: u32,
    pub rx_queue: u32,
    /// Length of the packet data.
    pub data_len: u32,
    /// Verdict returned by the XDP program. Only reported by exit probes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<XdpAction>,
}

/// XDP program verdicts, see `enum xdp_action` in the kernel.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XdpAction {
    Aborted,
    Drop,
    Pass,
    Tx,
    Redirect,
}

impl XdpAction {
    pub fn from_u32(val: u32) -> Option<Self> {
        use XdpAction::*;
        Some(match val {
            0 => Aborted,
            1 => Drop,
            2 => Pass,
            3 => Tx,
            4 => Redirect,
            _ => return None,
        })
    }
}

impl fmt::Display for XdpAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            XdpAction::Aborted => "aborted",
            XdpAction::Drop => "drop",
            XdpAction::Pass => "pass",
            XdpAction::Tx => "tx",
            XdpAction::Redirect => "redirect",
        };
        f.write_str(s)
    }
}

impl fmt::Display for DecodedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}:{}",
            self.timestamp, self.probe, self.kind, self.hook
        )?;

        match &self.body {
            EventBody::Marker => Ok(()),
            EventBody::Xdp(xdp) => {
                write!(
                    f,
                    " if {} rxq {} len {}",
                    xdp.ifindex, xdp.rx_queue, xdp.data_len
                )?;
                if let Some(action) = xdp.action {
                    write!(f, " verdict {action}")?;
                }
                Ok(())
            }
        }
    }
}
