//! DHCP server implementation
//!
//! Each packet is handled on its own task: the allocation engine decides
//! what the client gets, and this module turns that into a reply with
//! the right options, boot information and destination.

use crate::config::{DhcpConfig, BINL_PORT};
use crate::engine::{self, Allocation, Disposal};
use crate::error::{DhcpError, Result};
use crate::options::{
    self, OptionMap, OPT_BOOT_FILE, OPT_CLIENT_GUID, OPT_TFTP_SERVER, OPT_VENDOR_CLASS,
    OPT_VENDOR_SPECIFIC,
};
use crate::packet::{nak, ClientArch, DhcpRequest, ReplyBuilder, ReqState};
use crate::probe::AddressProbe;
use crate::strategy::{self, Strategy};
use dhcproto::v4::{Message, MessageType};
use dhcproto::Encodable;
use provision_models::{is_global_unicast, BootEnv, LeaseState, Machine, Prefix};
use provision_store::{Action, DataTracker};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Event emitted by the DHCP server
#[derive(Debug, Clone)]
pub enum DhcpEvent {
    /// Server started
    Started { bind_addr: SocketAddr },
    /// Received a DHCP request
    Request {
        mac: String,
        message_type: String,
        is_pxe: bool,
    },
    /// Sent a DHCP response
    Response {
        mac: String,
        message_type: String,
        offered_ip: Option<Ipv4Addr>,
    },
    /// Error occurred
    Error { mac: Option<String>, error: String },
    /// Server stopped
    Stopped,
}

/// A reply and where to send it
#[derive(Debug)]
pub struct Outgoing {
    pub message: Message,
    pub message_type: MessageType,
    pub dest: SocketAddr,
}

/// Options and boot settings for one reply
struct BootPlan {
    options: OptionMap,
    next_server: Option<Ipv4Addr>,
    offer_pxe: bool,
}

/// DHCP server
pub struct DhcpServer {
    config: DhcpConfig,
    dt: Arc<DataTracker>,
    probe: Arc<dyn AddressProbe>,
    strategies: Vec<Strategy>,
    event_sender: broadcast::Sender<DhcpEvent>,
}

impl DhcpServer {
    /// Create a new DHCP server
    pub fn new(config: DhcpConfig, dt: Arc<DataTracker>, probe: Arc<dyn AddressProbe>) -> Self {
        let (event_sender, _) = broadcast::channel(1024);
        Self {
            config,
            dt,
            probe,
            strategies: strategy::standard(),
            event_sender,
        }
    }

    pub fn with_strategies(mut self, strategies: Vec<Strategy>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn config(&self) -> &DhcpConfig {
        &self.config
    }

    /// Subscribe to server events
    pub fn subscribe(&self) -> broadcast::Receiver<DhcpEvent> {
        self.event_sender.subscribe()
    }

    fn binl_only(&self) -> bool {
        self.config.port == BINL_PORT
    }

    /// Run the DHCP server until `shutdown` turns true
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        match engine::purge_probes(&self.dt) {
            Ok(0) => {}
            Ok(n) => info!(count = n, "removed leases left in PROBE state"),
            Err(e) => warn!(error = %e, "failed to purge probing leases"),
        }

        let bind_addr = SocketAddrV4::new(self.config.bind_ip, self.config.port);
        let devices: Vec<Option<String>> = if self.config.interfaces.is_empty() {
            vec![None]
        } else {
            self.config.interfaces.iter().cloned().map(Some).collect()
        };

        let mut listeners = JoinSet::new();
        for device in devices {
            let socket = Arc::new(create_socket(bind_addr, device.as_deref())?);
            info!(addr = %bind_addr, interface = ?device, "DHCP listener bound");
            let server = Arc::clone(&self);
            listeners.spawn(server.listen(socket, shutdown.clone()));
        }

        info!(addr = %bind_addr, proxy_only = self.config.proxy_only, "DHCP server started");
        let _ = self.event_sender.send(DhcpEvent::Started {
            bind_addr: bind_addr.into(),
        });

        while let Some(joined) = listeners.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "DHCP listener task failed");
            }
        }
        let _ = self.event_sender.send(DhcpEvent::Stopped);
        Ok(())
    }

    async fn listen(self: Arc<Self>, socket: Arc<UdpSocket>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = [0u8; 1500];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, src)) => {
                            let server = Arc::clone(&self);
                            let socket = Arc::clone(&socket);
                            let data = buf[..len].to_vec();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_packet(&socket, &data, src).await {
                                    error!(error = %e, "Error handling DHCP packet");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Error receiving packet");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("DHCP listener shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn handle_packet(&self, socket: &UdpSocket, data: &[u8], src: SocketAddr) -> Result<()> {
        let Some(out) = self.process(data, src).await? else {
            return Ok(());
        };
        let bytes = out
            .message
            .to_vec()
            .map_err(|e| DhcpError::EncodeError(e.to_string()))?;
        socket.send_to(&bytes, out.dest).await?;
        Ok(())
    }

    /// Handle one packet received from `src`, returning the reply to send
    pub async fn process(&self, data: &[u8], src: SocketAddr) -> Result<Option<Outgoing>> {
        let request = match DhcpRequest::parse(data) {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, "Failed to parse DHCP packet");
                return Ok(None);
            }
        };

        debug!(
            xid = request.xid,
            mac = %request.mac_address,
            msg_type = ?request.message_type,
            is_pxe = request.is_pxe_request(),
            "Received DHCP request"
        );
        let _ = self.event_sender.send(DhcpEvent::Request {
            mac: request.mac_address.clone(),
            message_type: format!("{:?}", request.message_type),
            is_pxe: request.is_pxe_request(),
        });

        let served = if self.binl_only() {
            self.serve_binl(&request)
        } else if self.config.proxy_only {
            self.serve_proxy(&request)
        } else {
            self.serve_dhcp(&request).await
        };
        let reply = match served {
            Ok(Some(reply)) => reply,
            Ok(None) => return Ok(None),
            Err(e) => {
                let _ = self.event_sender.send(DhcpEvent::Error {
                    mac: Some(request.mac_address.clone()),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let message_type = reply.opts().msg_type().unwrap_or(MessageType::Nak);
        let dest = reply_dest(&request, &reply, src);
        let offered_ip = Some(reply.yiaddr()).filter(|a| !a.is_unspecified());
        info!(
            xid = request.xid,
            mac = %request.mac_address,
            msg_type = ?message_type,
            offered_ip = ?offered_ip,
            dest = %dest,
            "Sending DHCP response"
        );
        let _ = self.event_sender.send(DhcpEvent::Response {
            mac: request.mac_address.clone(),
            message_type: format!("{:?}", message_type),
            offered_ip,
        });
        Ok(Some(Outgoing {
            message: reply,
            message_type,
            dest,
        }))
    }

    fn token_for<'a>(&'a self, req: &'a DhcpRequest) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| strategy::lookup(&self.strategies, name).map(|s| s.token_for(req))
    }

    async fn serve_dhcp(&self, req: &DhcpRequest) -> Result<Option<Message>> {
        let (addr, state) = req.requested();
        match req.message_type {
            MessageType::Offer => {
                if let Some(server) = req.server_id.filter(|s| !self.config.is_local(*s)) {
                    warn!(xid = req.xid, server = %server, "Competing DHCP server on network");
                }
                Ok(None)
            }
            MessageType::Decline => {
                match engine::decline_lease(&self.dt, addr, self.token_for(req))? {
                    Disposal::Unknown => info!(xid = req.xid, addr = %addr, "Asked to decline a lease we didn't issue, ignoring"),
                    Disposal::Spoofed(_) => info!(xid = req.xid, addr = %addr, "Received spoofed decline, ignoring"),
                    Disposal::Done(_) => info!(xid = req.xid, addr = %addr, "Lease declined, invalidating"),
                }
                Ok(None)
            }
            MessageType::Release => {
                match engine::release_lease(&self.dt, addr, self.token_for(req))? {
                    Disposal::Unknown => info!(xid = req.xid, addr = %addr, "Asked to release a lease we didn't issue, ignoring"),
                    Disposal::Spoofed(_) => info!(xid = req.xid, addr = %addr, "Received spoofed release, ignoring"),
                    Disposal::Done(_) => info!(xid = req.xid, addr = %addr, "Lease released, expiring"),
                }
                Ok(None)
            }
            MessageType::Request => self.handle_request(req, addr, state),
            MessageType::Discover => self.handle_discover(req, addr).await,
            _ => Ok(None),
        }
    }

    fn handle_request(&self, req: &DhcpRequest, addr: Ipv4Addr, state: ReqState) -> Result<Option<Message>> {
        if let Some(server) = req.server_id {
            if !self.config.is_local(server) {
                debug!(xid = req.xid, server = %server, "Ignoring request for another DHCP server");
                return Ok(None);
            }
        }
        if !is_global_unicast(addr) {
            info!(xid = req.xid, addr = %addr, "NAK'ing invalid requested IP");
            return Ok(Some(nak(req, self.config.respond_from(addr))));
        }
        for s in &self.strategies {
            let token = s.token_for(req);
            match engine::find_lease(&self.dt, s.name, &token, Some(addr)) {
                Ok(None) => continue,
                Ok(Some(alloc)) if alloc.lease.is_fake() => {
                    info!(xid = req.xid, addr = %addr, "Proxy subnet should not respond to request");
                    return Ok(None);
                }
                Ok(Some(alloc)) => return self.lease_reply(req, MessageType::Ack, alloc).map(Some),
                Err(DhcpError::NoLease(_)) if state == ReqState::InitReboot => {
                    info!(xid = req.xid, addr = %addr, "No lease in database, client in INIT-REBOOT; ignoring");
                    return Ok(None);
                }
                Err(e) if e.is_nak() => {
                    info!(xid = req.xid, addr = %addr, reason = %e, "NAK'ing request");
                    return Ok(Some(nak(req, self.config.respond_from(addr))));
                }
                Err(e) => return Err(e),
            }
        }
        info!(xid = req.xid, addr = %addr, "No lease in database, and no subnet or reservation covers it; ignoring");
        Ok(None)
    }

    async fn handle_discover(&self, req: &DhcpRequest, addr: Ipv4Addr) -> Result<Option<Message>> {
        let via = req.via(&self.config.listen_ips());
        let hint = Some(addr).filter(|a| is_global_unicast(*a));
        for s in &self.strategies {
            let token = s.token_for(req);
            let Some(alloc) = self.allocate(req, s.name, &token, hint, &via).await? else {
                continue;
            };
            if alloc.lease.is_fake() {
                return self.binl_reply(req, MessageType::Offer, alloc, Ipv4Addr::UNSPECIFIED, true);
            }
            return self.lease_reply(req, MessageType::Offer, alloc).map(Some);
        }
        Ok(None)
    }

    /// Find or create a lease, probing freshly picked addresses until one
    /// turns out to be free
    async fn allocate(
        &self,
        req: &DhcpRequest,
        strategy: &str,
        token: &str,
        hint: Option<Ipv4Addr>,
        via: &[Ipv4Addr],
    ) -> Result<Option<Allocation>> {
        loop {
            let Some(alloc) = engine::find_or_create_lease(&self.dt, strategy, token, hint, via)? else {
                return Ok(None);
            };
            if alloc.lease.state != LeaseState::Probe {
                return Ok(Some(alloc));
            }
            if !alloc.fresh {
                debug!(xid = req.xid, token = %token, "Ignoring DISCOVER, its lease is being probed elsewhere");
                return Ok(None);
            }
            let addr = alloc.lease.addr;
            debug!(xid = req.xid, addr = %addr, "Testing to see if address is in use");
            match self.probe.in_use(addr, self.config.probe_timeout).await {
                None => {
                    debug!(xid = req.xid, addr = %addr, "Probe shutting down, dropping lease");
                    engine::drop_lease(&self.dt, addr)?;
                    return Ok(None);
                }
                Some(true) => {
                    info!(xid = req.xid, addr = %addr, "Address in use by something else, marking it unusable for an hour");
                    engine::mark_in_use(&self.dt, &alloc.lease)?;
                }
                Some(false) => {
                    let Some(lease) = engine::confirm_offer(&self.dt, &alloc.lease)? else {
                        return Ok(None);
                    };
                    return Ok(Some(Allocation { lease, ..alloc }));
                }
            }
        }
    }

    /// Answer PXE clients on the DHCP port without handing out addresses
    fn serve_proxy(&self, req: &DhcpRequest) -> Result<Option<Message>> {
        if req.message_type != MessageType::Discover {
            return Ok(None);
        }
        let Some(alloc) = self.fake_lease(req)? else {
            return Ok(None);
        };
        self.binl_reply(req, MessageType::Offer, alloc, Ipv4Addr::UNSPECIFIED, true)
    }

    /// ProxyDHCP REQUESTs and BINL DISCOVERs arriving on port 4011
    fn serve_binl(&self, req: &DhcpRequest) -> Result<Option<Message>> {
        let (addr, _) = req.requested();
        if !matches!(req.message_type, MessageType::Discover | MessageType::Request) {
            info!(xid = req.xid, msg_type = ?req.message_type, "Ignoring packet sent to the BINL service");
            return Ok(None);
        }
        if req.message_type == MessageType::Request && !is_global_unicast(addr) {
            info!(xid = req.xid, addr = %addr, "NAK'ing invalid requested IP");
            return Ok(Some(nak(req, self.config.respond_from(addr))));
        }
        let Some(alloc) = self.fake_lease(req)? else {
            return Ok(None);
        };
        self.binl_reply(req, MessageType::Ack, alloc, addr, false)
    }

    fn fake_lease(&self, req: &DhcpRequest) -> Result<Option<Allocation>> {
        let via = req.via(&self.config.listen_ips());
        for s in &self.strategies {
            let token = s.token_for(req);
            if let Some(alloc) = engine::fake_lease(&self.dt, s.name, &token, &via)? {
                return Ok(Some(alloc));
            }
        }
        Ok(None)
    }

    /// A full reply for a real lease
    fn lease_reply(&self, req: &DhcpRequest, mt: MessageType, alloc: Allocation) -> Result<Message> {
        let addr = alloc.lease.addr;
        let server_id = self.config.respond_from(addr);
        let mut plan = self.boot_plan(req, &alloc, server_id, addr)?;
        if !plan.offer_pxe {
            for code in [OPT_TFTP_SERVER, OPT_BOOT_FILE, OPT_VENDOR_SPECIFIC, OPT_VENDOR_CLASS] {
                plan.options.remove(&code);
            }
        }
        let secs = alloc.duration().num_seconds().clamp(0, u32::MAX as i64) as u32;
        self.dt.cache().add(IpAddr::V4(server_id), IpAddr::V4(addr));
        info!(xid = req.xid, addr = %addr, mac = %req.mac_address, via = %server_id, "Handing out lease");
        Ok(ReplyBuilder::new(req, mt, server_id)
            .with_yiaddr(addr)
            .with_lease_time(secs)
            .with_next_server(plan.next_server)
            .with_options(plan.options)
            .build())
    }

    /// A PXE-only reply for a fake lease
    fn binl_reply(
        &self,
        req: &DhcpRequest,
        mt: MessageType,
        alloc: Allocation,
        yiaddr: Ipv4Addr,
        broadcast: bool,
    ) -> Result<Option<Message>> {
        let server_id = self.config.respond_from(yiaddr);
        let mut plan = self.boot_plan(req, &alloc, server_id, yiaddr)?;
        if !plan.offer_pxe {
            info!(xid = req.xid, mac = %req.mac_address, "Directed not to offer PXE");
            return Ok(None);
        }
        let mut opts = OptionMap::new();
        opts.insert(OPT_VENDOR_CLASS, b"PXEClient".to_vec());
        if req.client_arch == Some(ClientArch::IntelX86Bios) {
            // Discovery control: boot the named file without asking
            opts.insert(OPT_VENDOR_SPECIFIC, vec![0x06, 0x01, 0x08, 0xff]);
        }
        if let Some(guid) = req.options.get(&OPT_CLIENT_GUID) {
            opts.insert(OPT_CLIENT_GUID, guid.clone());
        }
        for code in [OPT_BOOT_FILE, OPT_TFTP_SERVER] {
            if let Some(value) = plan.options.remove(&code) {
                opts.insert(code, value);
            }
        }
        Ok(Some(
            ReplyBuilder::new(req, mt, server_id)
                .with_yiaddr(yiaddr)
                .with_next_server(plan.next_server)
                .with_options(opts)
                .with_broadcast(broadcast)
                .build(),
        ))
    }

    /// Render the reply options and decide whether to offer PXE boot
    fn boot_plan(
        &self,
        req: &DhcpRequest,
        alloc: &Allocation,
        server_id: Ipv4Addr,
        addr: Ipv4Addr,
    ) -> Result<BootPlan> {
        let res = alloc.reservation.as_ref();
        let sub = alloc.subnet.as_ref();
        let mut options = options::coalesce(
            res.map(|r| r.options.as_slice()).unwrap_or_default(),
            sub.map(|s| s.options.as_slice()).unwrap_or_default(),
            &req.options,
        );
        let next_server = res
            .and_then(|r| r.next_server)
            .or_else(|| sub.and_then(|s| s.next_server))
            .filter(|ns| is_global_unicast(*ns))
            .or(Some(server_id))
            .filter(|ns| !ns.is_unspecified());
        if let Some(ns) = next_server {
            options.insert(OPT_TFTP_SERVER, ns.to_string().into_bytes());
        }

        let mut plan = BootPlan {
            options,
            next_server,
            offer_pxe: false,
        };
        if !req.wants_boot_file() || !req.is_pxe_request() {
            return Ok(plan);
        }
        if plan.options.get(&OPT_BOOT_FILE).is_some_and(|f| f.is_empty()) {
            debug!(xid = req.xid, "Reservation disables PXE boot");
            return Ok(plan);
        }
        if sub.is_some_and(|s| s.unmanaged) {
            return Ok(plan);
        }
        if !self.machine_allows_pxe(req, addr)? {
            return Ok(plan);
        }
        if !plan.options.contains_key(&OPT_BOOT_FILE) {
            let fname = if req.is_ipxe {
                "default.ipxe"
            } else {
                match req.client_arch.map(|a| a.boot_file()) {
                    Some(Ok(fname)) => fname,
                    Some(Err(e)) => {
                        error!(xid = req.xid, mac = %req.mac_address, "{}", e);
                        return Ok(plan);
                    }
                    None => return Ok(plan),
                }
            };
            plan.options.insert(OPT_BOOT_FILE, fname.as_bytes().to_vec());
        }
        plan.offer_pxe = true;
        Ok(plan)
    }

    /// Whether the machine behind `req` may PXE boot from us
    ///
    /// Unknown clients may. A known machine may if its boot environment
    /// net boots, in which case its address of record follows the lease
    /// and any other machine claiming that address loses it.
    fn machine_allows_pxe(&self, req: &DhcpRequest, addr: Ipv4Addr) -> Result<bool> {
        let mut rt = self.dt.request_for(Prefix::Machines, Action::Update);
        rt.do_(|rt| {
            let machines = rt.items::<Machine>()?;
            let machine = machines
                .iter()
                .find(|m| {
                    m.hardware_addrs
                        .iter()
                        .any(|h| h.eq_ignore_ascii_case(&req.mac_address))
                })
                .or_else(|| {
                    machines
                        .iter()
                        .find(|m| !addr.is_unspecified() && m.address == Some(addr))
                })
                .cloned();
            let Some(mut machine) = machine else {
                return Ok(true);
            };
            match rt.find::<BootEnv>(&machine.boot_env)? {
                None => {
                    error!(
                        machine = %machine.uuid,
                        bootenv = %machine.boot_env,
                        "Machine refers to missing boot environment"
                    );
                    return Ok(true);
                }
                Some(env) if !env.net_boot() => return Ok(false),
                Some(_) => {}
            }
            if addr.is_unspecified() {
                return Ok(true);
            }
            for other in machines
                .iter()
                .filter(|m| m.uuid != machine.uuid && m.address == Some(addr))
            {
                warn!(
                    machine = %other.uuid,
                    addr = %addr,
                    owner = %machine.uuid,
                    "Machine also has the address being handed out; clearing it"
                );
                let mut other = other.clone();
                other.address = None;
                rt.save(other)?;
            }
            if machine.address != Some(addr) {
                info!(machine = %machine.uuid, old = ?machine.address, new = %addr, "Updating machine address");
                machine.address = Some(addr);
                rt.save(machine)?;
            }
            Ok(true)
        })
    }
}

/// Where a reply to `req` received from `src` goes
///
/// Relayed packets go back to the relay. Otherwise the reply is
/// broadcast when the client has no address yet or asked for it.
fn reply_dest(req: &DhcpRequest, reply: &Message, src: SocketAddr) -> SocketAddr {
    let port = src.port();
    if !req.relay_ip.is_unspecified() {
        return SocketAddr::new(IpAddr::V4(req.relay_ip), port);
    }
    let unaddressed = match src.ip() {
        IpAddr::V4(ip) => ip.is_unspecified(),
        IpAddr::V6(ip) => ip.is_unspecified(),
    };
    if unaddressed || req.broadcast() || reply.flags().broadcast() {
        return SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port);
    }
    src
}

/// Create and configure the UDP socket
fn create_socket(bind_addr: SocketAddrV4, device: Option<&str>) -> Result<UdpSocket> {
    let bind_failed = |e| DhcpError::BindFailed {
        addr: bind_addr.into(),
        source: e,
    };
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(bind_failed)?;

    socket.set_reuse_address(true).ok();
    socket.set_broadcast(true).ok();
    if let Some(device) = device {
        bind_to_device(&socket, device).map_err(bind_failed)?;
    }

    socket.bind(&bind_addr.into()).map_err(bind_failed)?;
    socket.set_nonblocking(true).map_err(bind_failed)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(bind_failed)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_to_device(socket: &socket2::Socket, device: &str) -> std::io::Result<()> {
    socket.bind_device(Some(device.as_bytes()))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_to_device(_socket: &socket2::Socket, device: &str) -> std::io::Result<()> {
    warn!(interface = %device, "Binding to an interface is not supported here; serving all interfaces");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{seed, tracker};
    use crate::packet::raw_options;
    use crate::packet::tests::{packet, pxe_discover};
    use crate::probe::{NoProbe, StaticProbe};
    use dhcproto::v4::DhcpOption;
    use provision_models::{hexaddr, DhcpOption as ModelOption, Lease, Reservation, Subnet};

    const MAC: [u8; 6] = [0xaa, 0xbb, 0xcc, 0x00, 0x00, 0x01];
    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    fn client() -> SocketAddr {
        "0.0.0.0:68".parse().unwrap()
    }

    fn server_with(probe: Arc<dyn AddressProbe>) -> (DhcpServer, Arc<DataTracker>) {
        let dt = Arc::new(tracker());
        seed(&dt, |rt| {
            let mut sub = Subnet::new("lab", "10.0.0.0/24", ip(10), ip(20));
            sub.options = vec![ModelOption::new(3, "10.0.0.254"), ModelOption::new(6, "1.1.1.1")];
            rt.create(sub).unwrap();
        });
        let config = DhcpConfig::new(SERVER).with_network("10.0.0.1/24".parse().unwrap());
        (DhcpServer::new(config, Arc::clone(&dt), probe), dt)
    }

    fn server() -> (DhcpServer, Arc<DataTracker>) {
        server_with(Arc::new(NoProbe))
    }

    fn lease_at(dt: &DataTracker, addr: Ipv4Addr) -> Option<Lease> {
        dt.request(&[Prefix::Leases]).do_(|rt| rt.find::<Lease>(&hexaddr(addr)).unwrap())
    }

    fn request_for(addr: Ipv4Addr, server_id: Option<Ipv4Addr>) -> Vec<u8> {
        packet(MAC, MessageType::Request, |msg| {
            msg.opts_mut().insert(DhcpOption::RequestedIpAddress(addr));
            if let Some(sid) = server_id {
                msg.opts_mut().insert(DhcpOption::ServerIdentifier(sid));
            }
        })
    }

    #[tokio::test]
    async fn test_discover_request_ack() {
        let (server, dt) = server();
        let offer = server
            .process(&crate::packet::tests::discover(MAC), client())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(offer.message_type, MessageType::Offer);
        assert_eq!(offer.message.yiaddr(), ip(10));
        assert_eq!(offer.dest, "255.255.255.255:68".parse::<SocketAddr>().unwrap());
        let opts = raw_options(&offer.message);
        assert_eq!(opts.get(&3), Some(&vec![10, 0, 0, 254]));
        assert_eq!(opts.get(&54), Some(&SERVER.octets().to_vec()));
        assert_eq!(lease_at(&dt, ip(10)).unwrap().state, LeaseState::Offer);

        let ack = server
            .process(&request_for(ip(10), Some(SERVER)), client())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.message_type, MessageType::Ack);
        assert_eq!(ack.message.yiaddr(), ip(10));
        assert_eq!(lease_at(&dt, ip(10)).unwrap().state, LeaseState::Ack);
        assert_eq!(dt.cache().local_for(IpAddr::V4(ip(10))), Some(IpAddr::V4(SERVER)));
    }

    #[tokio::test]
    async fn test_probe_skips_used_address() {
        let (server, dt) = server_with(Arc::new(StaticProbe::new([ip(10)])));
        let offer = server
            .process(&crate::packet::tests::discover(MAC), client())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(offer.message.yiaddr(), ip(11));
        assert!(!lease_at(&dt, ip(10)).unwrap().valid());
    }

    #[tokio::test]
    async fn test_request_naks_and_silences() {
        let (server, dt) = server();
        seed(&dt, |rt| {
            let mut other = Lease::new(ip(12), "MAC", "11:22:33:44:55:66");
            other.expire_time = chrono::Utc::now() + chrono::Duration::hours(1);
            rt.create(other).unwrap();
        });

        let reply = server
            .process(&request_for(ip(12), Some(SERVER)), client())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.message_type, MessageType::Nak);

        // Covered address without a lease
        let reply = server
            .process(&request_for(ip(15), Some(SERVER)), client())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.message_type, MessageType::Nak);

        // The same in INIT-REBOOT stays silent
        let reply = server.process(&request_for(ip(15), None), client()).await.unwrap();
        assert!(reply.is_none());

        // Another server's conversation
        let reply = server
            .process(&request_for(ip(12), Some(Ipv4Addr::new(10, 0, 0, 2))), client())
            .await
            .unwrap();
        assert!(reply.is_none());

        // Nobody covers this address
        let reply = server
            .process(&request_for(Ipv4Addr::new(172, 16, 0, 5), Some(SERVER)), client())
            .await
            .unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_pxe_boot_file_by_arch() {
        let (bios, _dt) = server();
        let offer = bios.process(&pxe_discover(MAC, 0), client()).await.unwrap().unwrap();
        assert!(offer.message.fname().unwrap_or_default().starts_with(b"lpxelinux.0"));
        assert_eq!(offer.message.siaddr(), SERVER);
        assert!(offer.message.sname().unwrap_or_default().starts_with(b"10.0.0.1"));

        let (efi, _dt) = server();
        let offer = efi.process(&pxe_discover(MAC, 9), client()).await.unwrap().unwrap();
        assert!(offer.message.fname().unwrap_or_default().starts_with(b"ipxe.efi"));

        let (arm, _dt) = server();
        let offer = arm.process(&pxe_discover(MAC, 11), client()).await.unwrap().unwrap();
        assert!(offer.message.fname().unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn test_machine_bootenv_controls_pxe() {
        let (server, dt) = server();
        dt.request_for(Prefix::Machines, Action::Create).do_(|rt| {
            let mut env = BootEnv::new("discovery");
            env.kernel = "vmlinuz".to_string();
            rt.create(env).unwrap();

            let mut m = Machine::new("node1");
            m.hardware_addrs = vec!["AA:BB:CC:00:00:01".to_string()];
            m.boot_env = "discovery".to_string();
            rt.create(m).unwrap();

            let mut squatter = Machine::new("node2");
            squatter.address = Some(ip(10));
            rt.create(squatter).unwrap();
        });

        let offer = server.process(&pxe_discover(MAC, 7), client()).await.unwrap().unwrap();
        assert_eq!(offer.message.yiaddr(), ip(10));
        assert!(offer.message.fname().unwrap_or_default().starts_with(b"ipxe.efi"));

        let machines = dt
            .request_for(Prefix::Machines, Action::Get)
            .do_(|rt| rt.items::<Machine>().unwrap());
        let node1 = machines.iter().find(|m| m.name == "node1").unwrap();
        let node2 = machines.iter().find(|m| m.name == "node2").unwrap();
        assert_eq!(node1.address, Some(ip(10)));
        assert_eq!(node2.address, None);

        // Local boot environments get no boot file
        dt.request_for(Prefix::Machines, Action::Update).do_(|rt| {
            let mut m = rt.find::<Machine>(&node1.uuid.to_string()).unwrap().unwrap();
            m.boot_env = "local".to_string();
            rt.save(m).unwrap();
        });
        let offer = server.process(&pxe_discover(MAC, 7), client()).await.unwrap().unwrap();
        assert!(offer.message.fname().unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn test_proxy_subnet_offer() {
        let dt = Arc::new(tracker());
        seed(&dt, |rt| {
            let mut sub = Subnet::new("proxy", "10.0.0.0/24", ip(10), ip(20));
            sub.proxy = true;
            rt.create(sub).unwrap();
        });
        let config = DhcpConfig::new(SERVER).with_network("10.0.0.1/24".parse().unwrap());
        let server = DhcpServer::new(config, Arc::clone(&dt), Arc::new(NoProbe));

        assert!(server
            .process(&crate::packet::tests::discover(MAC), client())
            .await
            .unwrap()
            .is_none());

        let offer = server.process(&pxe_discover(MAC, 0), client()).await.unwrap().unwrap();
        assert_eq!(offer.message.yiaddr(), Ipv4Addr::UNSPECIFIED);
        assert!(offer.message.flags().broadcast());
        let opts = raw_options(&offer.message);
        assert_eq!(opts.get(&OPT_VENDOR_CLASS), Some(&b"PXEClient".to_vec()));
        assert_eq!(opts.get(&OPT_VENDOR_SPECIFIC), Some(&vec![0x06, 0x01, 0x08, 0xff]));
        assert!(!opts.contains_key(&51));
        assert!(dt.request(&[Prefix::Leases]).do_(|rt| rt.items::<Lease>().unwrap().is_empty()));
    }

    #[tokio::test]
    async fn test_binl_request_acks() {
        let dt = Arc::new(tracker());
        seed(&dt, |rt| {
            rt.create(Reservation::new(ip(50), "MAC", "aa:bb:cc:00:00:01")).unwrap();
        });
        let config = DhcpConfig::new(SERVER)
            .with_network("10.0.0.1/24".parse().unwrap())
            .with_port(BINL_PORT);
        let server = DhcpServer::new(config, dt, Arc::new(NoProbe));

        let req = packet(MAC, MessageType::Request, |msg| {
            msg.set_ciaddr(ip(50));
            let opts = msg.opts_mut();
            opts.insert(DhcpOption::ClassIdentifier(b"PXEClient:Arch:00007".to_vec()));
            opts.insert(DhcpOption::ClientSystemArchitecture(7u16.into()));
            opts.insert(DhcpOption::ParameterRequestList(vec![
                dhcproto::v4::OptionCode::BootfileName,
            ]));
        });
        let src: SocketAddr = "10.0.0.50:4011".parse().unwrap();
        let ack = server.process(&req, src).await.unwrap().unwrap();
        assert_eq!(ack.message_type, MessageType::Ack);
        assert_eq!(ack.message.yiaddr(), ip(50));
        assert_eq!(ack.dest, src);
        assert!(ack.message.fname().unwrap_or_default().starts_with(b"ipxe.efi"));
    }

    #[tokio::test]
    async fn test_release_checks_owner() {
        let (server, dt) = server();
        server
            .process(&crate::packet::tests::discover(MAC), client())
            .await
            .unwrap();

        let spoofed = packet([1, 2, 3, 4, 5, 6], MessageType::Release, |msg| {
            msg.set_ciaddr(ip(10));
        });
        assert!(server.process(&spoofed, client()).await.unwrap().is_none());
        assert!(!lease_at(&dt, ip(10)).unwrap().expired());

        let release = packet(MAC, MessageType::Release, |msg| {
            msg.set_ciaddr(ip(10));
        });
        assert!(server.process(&release, client()).await.unwrap().is_none());
        assert!(lease_at(&dt, ip(10)).unwrap().expire_time <= chrono::Utc::now());
    }

    #[test]
    fn test_reply_dest() {
        let req = DhcpRequest::parse(&crate::packet::tests::discover(MAC)).unwrap();
        let reply = ReplyBuilder::new(&req, MessageType::Offer, SERVER).build();
        let renewing: SocketAddr = "10.0.0.10:68".parse().unwrap();
        assert_eq!(reply_dest(&req, &reply, renewing), renewing);
        assert_eq!(
            reply_dest(&req, &reply, client()),
            "255.255.255.255:68".parse::<SocketAddr>().unwrap()
        );

        let relayed = packet(MAC, MessageType::Discover, |msg| {
            msg.set_giaddr(Ipv4Addr::new(172, 16, 0, 1));
        });
        let req = DhcpRequest::parse(&relayed).unwrap();
        assert_eq!(
            reply_dest(&req, &reply, "172.16.0.1:67".parse().unwrap()),
            "172.16.0.1:67".parse::<SocketAddr>().unwrap()
        );
    }
}
