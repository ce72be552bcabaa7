//! DHCP packet handling
//!
//! Incoming packets are parsed into a [`DhcpRequest`] that keeps the
//! decoded message alongside the raw payload of every option, which is
//! what option templates are rendered against. Replies are assembled
//! with [`ReplyBuilder`] from an [`OptionMap`].

use crate::error::{DhcpError, Result};
use crate::options::{
    OptionMap, OPT_BOOT_FILE, OPT_CLIENT_ARCH, OPT_PARAM_REQUEST_LIST, OPT_SERVER_ID,
    OPT_TFTP_SERVER, OPT_USER_CLASS, OPT_VENDOR_CLASS,
};
use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode, OptionCode};
use dhcproto::{Decodable, Decoder, Encodable};
use std::net::Ipv4Addr;

const OPT_REQUESTED_IP: u8 = 50;

/// Client system architecture, RFC 4578
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientArch {
    /// Intel x86 BIOS
    IntelX86Bios,
    /// EFI IA32
    EfiIa32,
    /// EFI byte code, sent by many x86_64 firmwares
    EfiBc,
    /// EFI x86_64
    EfiX64,
    /// EFI ARM32
    EfiArm32,
    /// EFI ARM64
    EfiArm64,
    Unknown(u16),
}

impl From<u16> for ClientArch {
    fn from(value: u16) -> Self {
        match value {
            0 => ClientArch::IntelX86Bios,
            6 => ClientArch::EfiIa32,
            7 => ClientArch::EfiBc,
            9 => ClientArch::EfiX64,
            10 => ClientArch::EfiArm32,
            11 => ClientArch::EfiArm64,
            other => ClientArch::Unknown(other),
        }
    }
}

impl ClientArch {
    /// Whether the firmware is EFI rather than legacy BIOS
    pub fn is_uefi(&self) -> bool {
        !matches!(self, ClientArch::IntelX86Bios | ClientArch::Unknown(_))
    }

    /// The boot loader to hand out when nothing else names one
    pub fn boot_file(&self) -> std::result::Result<&'static str, String> {
        match self {
            ClientArch::IntelX86Bios => Ok("lpxelinux.0"),
            ClientArch::EfiBc | ClientArch::EfiX64 => Ok("ipxe.efi"),
            ClientArch::EfiIa32 => Err("32 bit EFI systems are not supported".to_string()),
            ClientArch::EfiArm32 => Err("32 bit ARM EFI systems are not supported".to_string()),
            ClientArch::EfiArm64 => Err("64 bit ARM EFI systems are not supported".to_string()),
            ClientArch::Unknown(arch) => {
                Err(format!("unknown client arch {}: cannot PXE boot it remotely", arch))
            }
        }
    }
}

/// Where a client is in its DHCP state machine, judged from a REQUEST
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqState {
    Init,
    Selecting,
    InitReboot,
    Renewing,
}

/// Raw payloads of every option in `message`
pub fn raw_options(message: &Message) -> OptionMap {
    let mut out = OptionMap::new();
    for (code, opt) in message.opts().iter() {
        let code = u8::from(*code);
        if code == 0 || code == 255 {
            continue;
        }
        match opt.to_vec() {
            Ok(bytes) if bytes.len() >= 2 => {
                out.insert(code, bytes[2..].to_vec());
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(code, error = %e, "skipping option that will not encode"),
        }
    }
    out
}

/// An incoming message with the fields the server looks at pulled out
#[derive(Debug, Clone)]
pub struct DhcpRequest {
    /// Original message
    pub message: Message,

    pub message_type: MessageType,

    /// Client MAC address
    pub mac_address: String,

    /// Raw option payloads
    pub options: OptionMap,

    /// Option 93
    pub client_arch: Option<ClientArch>,

    /// Option 50
    pub requested_ip: Option<Ipv4Addr>,

    /// Server identifier (from option 54)
    pub server_id: Option<Ipv4Addr>,

    /// Whether user class 77 says `iPXE`
    pub is_ipxe: bool,

    /// Transaction ID
    pub xid: u32,

    /// Client IP (ciaddr)
    pub client_ip: Ipv4Addr,

    /// giaddr, unspecified unless relayed
    pub relay_ip: Ipv4Addr,
}

fn option_ip(options: &OptionMap, code: u8) -> Option<Ipv4Addr> {
    options
        .get(&code)
        .filter(|b| b.len() == 4)
        .map(|b| Ipv4Addr::new(b[0], b[1], b[2], b[3]))
}

impl DhcpRequest {
    /// Decode a datagram
    pub fn parse(data: &[u8]) -> Result<Self> {
        let message =
            Message::from_bytes(data).map_err(|e| DhcpError::ParseError(e.to_string()))?;

        if message.opcode() != Opcode::BootRequest {
            return Err(DhcpError::ParseError("not a BOOTREQUEST".to_string()));
        }

        let message_type = message
            .opts()
            .get(OptionCode::MessageType)
            .and_then(|opt| {
                if let DhcpOption::MessageType(mt) = opt {
                    Some(*mt)
                } else {
                    None
                }
            })
            .ok_or_else(|| DhcpError::ParseError("missing message type".to_string()))?;

        let mac_bytes = message.chaddr();
        if mac_bytes.len() < 6 {
            return Err(DhcpError::ParseError("short hardware address".to_string()));
        }
        let mac_address = mac_bytes[..6]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":");

        let options = raw_options(&message);

        let client_arch = options
            .get(&OPT_CLIENT_ARCH)
            .filter(|b| b.len() >= 2)
            .map(|b| ClientArch::from(u16::from_be_bytes([b[0], b[1]])));

        let is_ipxe = options
            .get(&OPT_USER_CLASS)
            .map(|uc| String::from_utf8_lossy(uc).contains("iPXE"))
            .unwrap_or(false);

        Ok(Self {
            xid: message.xid(),
            client_ip: message.ciaddr(),
            relay_ip: message.giaddr(),
            requested_ip: option_ip(&options, OPT_REQUESTED_IP),
            server_id: option_ip(&options, OPT_SERVER_ID),
            message,
            message_type,
            mac_address,
            options,
            client_arch,
            is_ipxe,
        })
    }

    /// Whether the vendor class says `PXEClient`
    pub fn is_pxe_request(&self) -> bool {
        self.options
            .get(&OPT_VENDOR_CLASS)
            .map(|class| class.starts_with(b"PXEClient"))
            .unwrap_or(false)
    }

    /// Whether the client asked for a boot file name in its parameter list
    pub fn wants_boot_file(&self) -> bool {
        self.options
            .get(&OPT_PARAM_REQUEST_LIST)
            .map(|list| list.contains(&OPT_BOOT_FILE))
            .unwrap_or(false)
    }

    pub fn broadcast(&self) -> bool {
        self.message.flags().broadcast()
    }

    /// The address the client is asking about and its state
    ///
    /// The requested-address option wins over ciaddr.
    pub fn requested(&self) -> (Ipv4Addr, ReqState) {
        let addr = self.requested_ip.unwrap_or(self.client_ip);
        let state = match self.message_type {
            MessageType::Request if self.server_id.is_some() => ReqState::Selecting,
            MessageType::Request if self.requested_ip.is_some() => ReqState::InitReboot,
            MessageType::Request => ReqState::Renewing,
            _ => ReqState::Init,
        };
        (addr, state)
    }

    /// Relay addresses a lease may be allocated through
    ///
    /// A relayed packet names its relay; a directly attached client is
    /// reached through any of `local`.
    pub fn via(&self, local: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
        if self.relay_ip.is_unspecified() {
            local.to_vec()
        } else {
            vec![self.relay_ip]
        }
    }
}

/// DHCP reply builder
pub struct ReplyBuilder<'a> {
    request: &'a DhcpRequest,
    message_type: MessageType,
    server_id: Ipv4Addr,
    yiaddr: Ipv4Addr,
    lease_secs: Option<u32>,
    next_server: Option<Ipv4Addr>,
    options: OptionMap,
    broadcast: bool,
}

impl<'a> ReplyBuilder<'a> {
    pub fn new(request: &'a DhcpRequest, message_type: MessageType, server_id: Ipv4Addr) -> Self {
        Self {
            request,
            message_type,
            server_id,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            lease_secs: None,
            next_server: None,
            options: OptionMap::new(),
            broadcast: false,
        }
    }

    /// Set yiaddr
    pub fn with_yiaddr(mut self, ip: Ipv4Addr) -> Self {
        self.yiaddr = ip;
        self
    }

    /// Set the lease time; renewal and rebinding times follow from it
    pub fn with_lease_time(mut self, seconds: u32) -> Self {
        self.lease_secs = Some(seconds);
        self
    }

    pub fn with_next_server(mut self, next_server: Option<Ipv4Addr>) -> Self {
        self.next_server = next_server;
        self
    }

    pub fn with_options(mut self, options: OptionMap) -> Self {
        self.options = options;
        self
    }

    pub fn with_broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    /// Build the reply message
    ///
    /// The TFTP server and boot file go in the sname and file header
    /// fields rather than as options.
    pub fn build(self) -> Message {
        let mut reply = Message::default();
        reply.set_opcode(Opcode::BootReply);
        reply.set_xid(self.request.xid);
        let mut flags = self.request.message.flags();
        if self.broadcast {
            flags = flags.set_broadcast();
        }
        reply.set_flags(flags);
        reply.set_chaddr(self.request.message.chaddr());
        reply.set_giaddr(self.request.relay_ip);
        reply.set_yiaddr(self.yiaddr);
        if let Some(next_server) = self.next_server {
            reply.set_siaddr(next_server);
        }

        let opts = reply.opts_mut();
        opts.insert(DhcpOption::MessageType(self.message_type));
        opts.insert(DhcpOption::ServerIdentifier(self.server_id));
        if let Some(secs) = self.lease_secs {
            opts.insert(DhcpOption::AddressLeaseTime(secs));
            opts.insert(DhcpOption::Renewal(secs / 2));
            opts.insert(DhcpOption::Rebinding((secs as u64 * 3 / 4) as u32));
        }

        let mut sname = None;
        let mut fname = None;
        for (code, data) in self.options {
            match code {
                OPT_TFTP_SERVER => sname = Some(data),
                OPT_BOOT_FILE => fname = Some(data),
                _ => match encode_option(code, &data) {
                    Ok(opt) => {
                        opts.insert(opt);
                    }
                    Err(e) => tracing::warn!(code, error = %e, "dropping option from reply"),
                },
            }
        }
        if let Some(sname) = sname {
            reply.set_sname(&sname);
        }
        if let Some(fname) = fname {
            reply.set_fname(&fname);
        }
        reply
    }

    /// Build and encode the reply to bytes
    pub fn build_bytes(self) -> Result<Vec<u8>> {
        self.build()
            .to_vec()
            .map_err(|e| DhcpError::EncodeError(e.to_string()))
    }
}

/// A NAK for `request`, sent from `server_id`
pub fn nak(request: &DhcpRequest, server_id: Ipv4Addr) -> Message {
    ReplyBuilder::new(request, MessageType::Nak, server_id).build()
}

/// Turn a raw option payload back into a typed option
pub fn encode_option(code: u8, data: &[u8]) -> Result<DhcpOption> {
    if data.len() > 255 {
        return Err(DhcpError::InvalidOption {
            code,
            message: format!("{} bytes will not fit in one option", data.len()),
        });
    }
    let mut buf = Vec::with_capacity(data.len() + 2);
    buf.push(code);
    buf.push(data.len() as u8);
    buf.extend_from_slice(data);
    DhcpOption::decode(&mut Decoder::new(&buf)).map_err(|e| DhcpError::InvalidOption {
        code,
        message: e.to_string(),
    })
}
