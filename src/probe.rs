use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dns_lookup::lookup_addr;
use parking_lot::RwLock;
use pnet::packet::icmp::destination_unreachable::DestinationUnreachablePacket;
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::{
    self as icmp_echo_request, EchoRequestPacket, MutableEchoRequestPacket,
};
use pnet::packet::icmp::time_exceeded::TimeExceededPacket;
use pnet::packet::icmp::{IcmpPacket, IcmpTypes, MutableIcmpPacket};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::{MutablePacket, Packet};
use pnet::util;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, warn};

use crate::error::{Result, TraceError};
use crate::source::{AddressFamily, HopStatsSource};

const ICMP_HEADER_SIZE: usize = 8;
const ICMP_PAYLOAD_SIZE: usize = 16;

/// Tuning for the ICMP engine.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Maximum TTL probed per round.
    pub max_hops: u8,
    /// Per-probe receive timeout.
    pub timeout: Duration,
    /// Pause between full rounds; the cancel flag is checked across it.
    pub round_pause: Duration,
    /// Reverse-resolve hop addresses to names.
    pub resolve_names: bool,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            max_hops: 30,
            timeout: Duration::from_millis(1000),
            round_pause: Duration::from_millis(1000),
            resolve_names: false,
        }
    }
}

/// Running aggregate for one hop. Written by the worker, read by the poll
/// thread through the accessors.
#[derive(Debug, Clone, Default)]
struct HopStats {
    addr: Option<IpAddr>,
    name: String,
    sent: u32,
    received: u32,
    last: u32,
    best: u32,
    worst: u32,
    total: u64,
}

impl HopStats {
    fn record_reply(&mut self, rtt_ms: u32) {
        if self.received == 0 || rtt_ms < self.best {
            self.best = rtt_ms;
        }
        if rtt_ms > self.worst {
            self.worst = rtt_ms;
        }
        self.last = rtt_ms;
        self.total += u64::from(rtt_ms);
        self.received += 1;
    }
}

/// IPv4 raw-socket ICMP probing engine.
///
/// One echo request per TTL per round; TimeExceeded identifies intermediate
/// hops, EchoReply from the target (or DestinationUnreachable) ends the
/// round's sweep. Raw sockets need elevated privileges; `initialized`
/// reports whether one could be opened at construction time.
pub struct IcmpProbeEngine {
    opts: ProbeOptions,
    hops: RwLock<Vec<HopStats>>,
    initialized: bool,
}

impl IcmpProbeEngine {
    pub fn new(opts: ProbeOptions) -> Self {
        let initialized = match Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)) {
            Ok(_) => true,
            Err(err) => {
                warn!(%err, "raw ICMP socket unavailable, engine disabled");
                false
            }
        };
        Self {
            opts,
            hops: RwLock::new(Vec::new()),
            initialized,
        }
    }

    fn open_socket(&self) -> std::io::Result<Socket> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        socket.set_read_timeout(Some(self.opts.timeout))?;
        Ok(socket)
    }

    /// Sends one echo request with the given TTL and classifies the answer.
    fn probe_hop(
        &self,
        socket: &Socket,
        target: Ipv4Addr,
        identifier: u16,
        ttl: u8,
    ) -> std::io::Result<HopReply> {
        socket.set_ttl(u32::from(ttl))?;

        let mut icmp_buf = vec![0u8; ICMP_HEADER_SIZE + ICMP_PAYLOAD_SIZE];
        let Some(mut icmp_packet) = MutableIcmpPacket::new(&mut icmp_buf) else {
            return Ok(HopReply::None);
        };
        icmp_packet.set_icmp_type(IcmpTypes::EchoRequest);
        icmp_packet.set_icmp_code(icmp_echo_request::IcmpCodes::NoCode);

        let Some(mut echo) = MutableEchoRequestPacket::new(icmp_packet.packet_mut()) else {
            return Ok(HopReply::None);
        };
        echo.set_identifier(identifier);
        echo.set_sequence_number(u16::from(ttl));
        let payload_bytes = u32::from(ttl).to_be_bytes();
        let n = ICMP_PAYLOAD_SIZE.min(payload_bytes.len());
        echo.payload_mut()[..n].copy_from_slice(&payload_bytes[..n]);

        let checksum = util::checksum(echo.packet(), 1);
        let Some(mut checksummed) = MutableIcmpPacket::new(echo.packet_mut()) else {
            return Ok(HopReply::None);
        };
        checksummed.set_checksum(checksum);

        let dest = SockAddr::from(SocketAddr::new(IpAddr::V4(target), 0));
        let send_time = Instant::now();
        socket.send_to(checksummed.packet(), &dest)?;

        let mut recv_buf = [MaybeUninit::uninit(); 2048];
        match socket.recv_from(&mut recv_buf) {
            Ok((bytes_read, responder)) => {
                let rtt_ms = send_time.elapsed().as_millis().min(u128::from(u32::MAX)) as u32;
                let Some(responder_ip) = responder.as_socket().map(|s| s.ip()) else {
                    return Ok(HopReply::None);
                };
                let buf: &[u8] = unsafe {
                    std::slice::from_raw_parts(recv_buf.as_ptr() as *const u8, bytes_read)
                };
                let Some(ipv4) = Ipv4Packet::new(buf) else {
                    return Ok(HopReply::None);
                };
                let Some(icmp) = IcmpPacket::new(ipv4.payload()) else {
                    return Ok(HopReply::None);
                };
                Ok(Self::classify(
                    &icmp,
                    target,
                    responder_ip,
                    identifier,
                    ttl,
                    rtt_ms,
                ))
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(HopReply::None)
            }
            Err(e) => Err(e),
        }
    }

    /// Maps a received ICMP packet to a reply for the probed hop. A raw
    /// socket receives every ICMP packet on the host, so the echo identifier
    /// and sequence number are matched before a reply is counted; packets
    /// belonging to other sessions classify as `None`.
    fn classify(
        icmp: &IcmpPacket<'_>,
        target: Ipv4Addr,
        responder: IpAddr,
        identifier: u16,
        ttl: u8,
        rtt_ms: u32,
    ) -> HopReply {
        match icmp.get_icmp_type() {
            IcmpTypes::TimeExceeded => {
                let ours = TimeExceededPacket::new(icmp.packet())
                    .is_some_and(|p| Self::inner_request_matches(p.payload(), identifier, ttl));
                if ours {
                    HopReply::Intermediate(responder, rtt_ms)
                } else {
                    HopReply::None
                }
            }
            IcmpTypes::EchoReply => {
                let ours = EchoReplyPacket::new(icmp.packet()).is_some_and(|p| {
                    p.get_identifier() == identifier && p.get_sequence_number() == u16::from(ttl)
                });
                if !ours {
                    debug!(hop = ttl, "echo reply from another session, ignored");
                    HopReply::None
                } else if responder == IpAddr::V4(target) {
                    HopReply::Target(responder, rtt_ms)
                } else {
                    HopReply::Intermediate(responder, rtt_ms)
                }
            }
            IcmpTypes::DestinationUnreachable => {
                let ours = DestinationUnreachablePacket::new(icmp.packet())
                    .is_some_and(|p| Self::inner_request_matches(p.payload(), identifier, ttl));
                if ours {
                    HopReply::Unreachable(responder, rtt_ms)
                } else {
                    HopReply::None
                }
            }
            other => {
                debug!(?other, hop = ttl, "unexpected ICMP type");
                HopReply::None
            }
        }
    }

    /// ICMP error payloads carry the original IPv4 header plus the first
    /// eight bytes of the datagram that triggered them; that prefix is the
    /// echo header holding our identifier and sequence.
    fn inner_request_matches(inner: &[u8], identifier: u16, ttl: u8) -> bool {
        let Some(ipv4) = Ipv4Packet::new(inner) else {
            return false;
        };
        let Some(echo) = EchoRequestPacket::new(ipv4.payload()) else {
            return false;
        };
        echo.get_identifier() == identifier && echo.get_sequence_number() == u16::from(ttl)
    }

    fn note_sent(&self, hop: usize) {
        let mut hops = self.hops.write();
        if hops.len() <= hop {
            hops.resize_with(hop + 1, HopStats::default);
        }
        hops[hop].sent += 1;
    }

    fn note_reply(&self, hop: usize, addr: IpAddr, rtt_ms: u32) {
        let name = {
            let hops = self.hops.read();
            let known = hops.get(hop).and_then(|h| h.addr) == Some(addr);
            if known { None } else { Some(self.display_name(addr)) }
        };
        // Reverse DNS happens outside the lock.
        let mut hops = self.hops.write();
        if let Some(stats) = hops.get_mut(hop) {
            stats.record_reply(rtt_ms);
            if let Some(name) = name {
                stats.addr = Some(addr);
                stats.name = name;
            }
        }
    }

    fn display_name(&self, addr: IpAddr) -> String {
        if self.opts.resolve_names {
            match lookup_addr(&addr) {
                Ok(hostname) => format!("{hostname} ({addr})"),
                Err(_) => addr.to_string(),
            }
        } else {
            addr.to_string()
        }
    }

    /// Trims stale entries once the path end is known for this round.
    fn clamp_path(&self, len: usize) {
        let mut hops = self.hops.write();
        if hops.len() > len {
            hops.truncate(len);
        }
    }
}

enum HopReply {
    Intermediate(IpAddr, u32),
    Target(IpAddr, u32),
    Unreachable(IpAddr, u32),
    None,
}

impl HopStatsSource for IcmpProbeEngine {
    fn initialized(&self) -> bool {
        self.initialized
    }

    fn supports_dual_stack(&self) -> bool {
        false
    }

    fn resolve_and_validate(&self, target: &str, family: AddressFamily) -> Result<IpAddr> {
        if family == AddressFamily::V6Only {
            return Err(TraceError::Resolution(
                "this engine probes IPv4 only".into(),
            ));
        }
        let addrs = (target, 0u16)
            .to_socket_addrs()
            .map_err(|e| TraceError::Resolution(format!("{target}: {e}")))?;
        addrs
            .map(|sa| sa.ip())
            .find(|ip| ip.is_ipv4())
            .ok_or_else(|| TraceError::Resolution(format!("{target}: no IPv4 address found")))
    }

    fn run_probe_cycle(&self, resolved: IpAddr, cancel: Arc<AtomicBool>) {
        let IpAddr::V4(target) = resolved else {
            warn!(%resolved, "refusing non-IPv4 target");
            return;
        };
        let socket = match self.open_socket() {
            Ok(s) => s,
            Err(err) => {
                warn!(%err, "failed to open raw socket for probe cycle");
                return;
            }
        };
        let identifier = std::process::id() as u16;
        self.hops.write().clear();

        // Path length shrinks to wherever the target first answered.
        let mut path_len = usize::from(self.opts.max_hops);

        while !cancel.load(Ordering::Relaxed) {
            for ttl in 1..=path_len.min(usize::from(u8::MAX)) {
                let hop = ttl - 1;
                self.note_sent(hop);
                match self.probe_hop(&socket, target, identifier, ttl as u8) {
                    Ok(HopReply::Intermediate(addr, rtt)) => self.note_reply(hop, addr, rtt),
                    Ok(HopReply::Target(addr, rtt)) | Ok(HopReply::Unreachable(addr, rtt)) => {
                        self.note_reply(hop, addr, rtt);
                        path_len = ttl;
                        self.clamp_path(path_len);
                        break;
                    }
                    Ok(HopReply::None) => {}
                    Err(err) => {
                        warn!(%err, hop = ttl, "probe send/receive failed");
                    }
                }
            }
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            std::thread::sleep(self.opts.round_pause);
        }
        debug!("probe cycle ended");
    }

    fn hop_count(&self) -> usize {
        self.hops.read().len()
    }

    fn hop_name(&self, i: usize) -> String {
        self.hops.read().get(i).map(|h| h.name.clone()).unwrap_or_default()
    }

    fn hop_address(&self, i: usize) -> Option<IpAddr> {
        self.hops.read().get(i).and_then(|h| h.addr)
    }

    fn hop_loss_percent(&self, i: usize) -> u32 {
        let hops = self.hops.read();
        match hops.get(i) {
            Some(h) if h.sent > 0 => (h.sent - h.received) * 100 / h.sent,
            _ => 0,
        }
    }

    fn hop_sent(&self, i: usize) -> u32 {
        self.hops.read().get(i).map(|h| h.sent).unwrap_or(0)
    }

    fn hop_received(&self, i: usize) -> u32 {
        self.hops.read().get(i).map(|h| h.received).unwrap_or(0)
    }

    fn hop_best(&self, i: usize) -> u32 {
        self.hops.read().get(i).map(|h| h.best).unwrap_or(0)
    }

    fn hop_avg(&self, i: usize) -> u32 {
        let hops = self.hops.read();
        match hops.get(i) {
            Some(h) if h.received > 0 => (h.total / u64::from(h.received)) as u32,
            _ => 0,
        }
    }

    fn hop_worst(&self, i: usize) -> u32 {
        self.hops.read().get(i).map(|h| h.worst).unwrap_or(0)
    }

    fn hop_last(&self, i: usize) -> u32 {
        self.hops.read().get(i).map(|h| h.last).unwrap_or(0)
    }
}
