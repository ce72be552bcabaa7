//! DHCP option values
//!
//! Subnets and reservations carry options as text templates. Before a
//! reply goes out each template is rendered against the options of the
//! incoming packet (`{{ opts["61"] }}` is the client identifier), then
//! converted to wire bytes according to the class of its option code.

use crate::error::{DhcpError, Result};
use minijinja::Environment;
use provision_models::DhcpOption;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Raw option payloads keyed by option code
pub type OptionMap = BTreeMap<u8, Vec<u8>>;

pub const OPT_SUBNET_MASK: u8 = 1;
pub const OPT_LEASE_TIME: u8 = 51;
pub const OPT_SERVER_ID: u8 = 54;
pub const OPT_PARAM_REQUEST_LIST: u8 = 55;
pub const OPT_RENEWAL_TIME: u8 = 58;
pub const OPT_REBINDING_TIME: u8 = 59;
pub const OPT_VENDOR_CLASS: u8 = 60;
pub const OPT_TFTP_SERVER: u8 = 66;
pub const OPT_BOOT_FILE: u8 = 67;
pub const OPT_VENDOR_SPECIFIC: u8 = 43;
pub const OPT_USER_CLASS: u8 = 77;
pub const OPT_CLIENT_ARCH: u8 = 93;
pub const OPT_CLIENT_GUID: u8 = 97;

/// How the payload of an option code is laid out on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionClass {
    Ip,
    IpList,
    Text,
    U32,
    U16,
    U8,
    Empty,
}

impl OptionClass {
    pub fn of(code: u8) -> Option<Self> {
        let class = match code {
            1 | 16 | 28 | 32 | 50 | 54 => OptionClass::Ip,
            3..=11 | 21 | 33 | 41 | 42 | 44 | 45 | 48 | 49 | 65 | 68..=76 => OptionClass::IpList,
            12 | 14 | 15 | 17 | 18 | 40 | 43 | 47 | 56 | 60 | 61 | 64 | 66 | 67 | 77 | 100
            | 101 => OptionClass::Text,
            2 | 24 | 35 | 38 | 51 | 58 | 59 => OptionClass::U32,
            13 | 22 | 26 | 57 | 93 => OptionClass::U16,
            19 | 20 | 23 | 27 | 29..=31 | 34 | 36 | 37 | 39 | 46 | 52 | 53 => OptionClass::U8,
            0 | 255 => OptionClass::Empty,
            _ => return None,
        };
        Some(class)
    }
}

fn invalid(code: u8, message: impl Into<String>) -> DhcpError {
    DhcpError::InvalidOption {
        code,
        message: message.into(),
    }
}

fn parse_ip(code: u8, s: &str) -> Result<Ipv4Addr> {
    s.trim()
        .parse()
        .map_err(|_| invalid(code, format!("{:?} is not an IPv4 address", s)))
}

fn parse_int(code: u8, s: &str) -> Result<i64> {
    s.trim()
        .parse()
        .map_err(|_| invalid(code, format!("{:?} is not a number", s)))
}

/// Convert option text to its wire payload
pub fn to_bytes(code: u8, value: &str) -> Result<Vec<u8>> {
    let class = OptionClass::of(code).ok_or_else(|| invalid(code, format!("unsupported value {:?}", value)))?;
    Ok(match class {
        OptionClass::Ip => parse_ip(code, value)?.octets().to_vec(),
        OptionClass::IpList => {
            let mut out = Vec::new();
            for part in value.split(',') {
                out.extend_from_slice(&parse_ip(code, part)?.octets());
            }
            out
        }
        OptionClass::Text => value.as_bytes().to_vec(),
        OptionClass::U32 => (parse_int(code, value)? as u32).to_be_bytes().to_vec(),
        OptionClass::U16 => (parse_int(code, value)? as u16).to_be_bytes().to_vec(),
        OptionClass::U8 => vec![parse_int(code, value)? as u8],
        OptionClass::Empty => Vec::new(),
    })
}

/// Render a wire payload as option text; unknown codes come back empty
pub fn to_value(code: u8, bytes: &[u8]) -> String {
    let ip = |b: &[u8]| Ipv4Addr::new(b[0], b[1], b[2], b[3]).to_string();
    match OptionClass::of(code) {
        Some(OptionClass::Ip) if bytes.len() >= 4 => ip(bytes),
        Some(OptionClass::IpList) => bytes.chunks_exact(4).map(ip).collect::<Vec<_>>().join(","),
        Some(OptionClass::Text) => String::from_utf8_lossy(bytes).into_owned(),
        Some(OptionClass::U32) if bytes.len() >= 4 => {
            u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]).to_string()
        }
        Some(OptionClass::U16) if bytes.len() >= 2 => {
            u16::from_be_bytes([bytes[0], bytes[1]]).to_string()
        }
        Some(OptionClass::U8) if !bytes.is_empty() => bytes[0].to_string(),
        _ => String::new(),
    }
}

/// Render the template of `opt` against the packet's own options and
/// convert the result to wire bytes
pub fn render(opt: &DhcpOption, src: &OptionMap) -> Result<Vec<u8>> {
    let opts: BTreeMap<String, String> = src
        .iter()
        .map(|(code, bytes)| (code.to_string(), to_value(*code, bytes)))
        .collect();
    let env = Environment::new();
    let value = env
        .render_str(&opt.value, minijinja::context! { opts => opts })
        .map_err(|e| invalid(opt.code, e.to_string()))?;
    to_bytes(opt.code, &value)
}

/// Merge reservation and subnet options into one reply option set
///
/// Reservation options win. An empty value is skipped, except an empty
/// boot file name on a reservation, which tells the server not to offer
/// PXE boot. Options that fail to render are logged and dropped.
pub fn coalesce(reservation: &[DhcpOption], subnet: &[DhcpOption], src: &OptionMap) -> OptionMap {
    let mut out = OptionMap::new();
    let sources = reservation
        .iter()
        .map(|o| (o, true))
        .chain(subnet.iter().map(|o| (o, false)));
    for (opt, from_reservation) in sources {
        if out.contains_key(&opt.code) {
            continue;
        }
        if opt.value.is_empty() {
            if from_reservation && opt.code == OPT_BOOT_FILE {
                out.insert(OPT_BOOT_FILE, Vec::new());
            } else {
                tracing::debug!(code = opt.code, "ignoring DHCP option with empty value");
            }
            continue;
        }
        match render(opt, src) {
            Ok(bytes) => {
                out.insert(opt.code, bytes);
            }
            Err(e) => tracing::error!(code = opt.code, value = %opt.value, error = %e, "failed to render option"),
        }
    }
    out
}
