//! ICMP echo over the tunnel interface: the initiator's verification probe
//! and the responder's answering side.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{Icmpv4Packet, Icmpv4Repr, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::engine::TunnelInterface;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_IDENT: u16 = 0x7274;
const PROBE_PAYLOAD: &[u8] = b"riptide probe";
const RESEND_INTERVAL: Duration = Duration::from_secs(1);
const HOP_LIMIT: u8 = 64;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no echo reply from {remote} within {waited:?}")]
    Timeout { remote: Ipv4Addr, waited: Duration },
    #[error("tunnel interface closed before a reply arrived")]
    InterfaceClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub remote: Ipv4Addr,
    pub rtt: Duration,
    /// Echo requests sent before the reply arrived.
    pub attempts: usize,
}

pub fn echo_request(src: Ipv4Addr, dst: Ipv4Addr, ident: u16, seq_no: u16, data: &[u8]) -> Bytes {
    emit(src, dst, &Icmpv4Repr::EchoRequest {
        ident,
        seq_no,
        data,
    })
}

/// The reply to `packet` if it is an echo request addressed to `local`.
pub fn echo_reply_for(packet: &[u8], local: Ipv4Addr) -> Option<Bytes> {
    let (ip, icmp) = parse_icmp(packet)?;
    let Icmpv4Repr::EchoRequest {
        ident,
        seq_no,
        data,
    } = icmp
    else {
        return None;
    };
    if Ipv4Addr::from(ip.dst_addr.0) != local {
        return None;
    }
    Some(emit(local, Ipv4Addr::from(ip.src_addr.0), &Icmpv4Repr::EchoReply {
        ident,
        seq_no,
        data,
    }))
}

/// Sequence number of `packet` if it is an echo reply from `remote` with
/// our identifier.
fn reply_sequence(packet: &[u8], remote: Ipv4Addr, expected_ident: u16) -> Option<u16> {
    let (ip, icmp) = parse_icmp(packet)?;
    match icmp {
        Icmpv4Repr::EchoReply { ident, seq_no, .. }
            if ident == expected_ident && Ipv4Addr::from(ip.src_addr.0) == remote =>
        {
            Some(seq_no)
        }
        _ => None,
    }
}

fn emit(src: Ipv4Addr, dst: Ipv4Addr, icmp: &Icmpv4Repr<'_>) -> Bytes {
    let caps = ChecksumCapabilities::default();
    let ip = Ipv4Repr {
        src_addr: Ipv4Address(src.octets()),
        dst_addr: Ipv4Address(dst.octets()),
        next_header: IpProtocol::Icmp,
        payload_len: icmp.buffer_len(),
        hop_limit: HOP_LIMIT,
    };
    let mut buf = vec![0u8; ip.buffer_len() + icmp.buffer_len()];
    let mut packet = Ipv4Packet::new_unchecked(&mut buf[..]);
    ip.emit(&mut packet, &caps);
    icmp.emit(&mut Icmpv4Packet::new_unchecked(packet.payload_mut()), &caps);
    Bytes::from(buf)
}

fn parse_icmp(packet: &[u8]) -> Option<(Ipv4Repr, Icmpv4Repr<'_>)> {
    let caps = ChecksumCapabilities::default();
    let ip_packet = Ipv4Packet::new_checked(packet).ok()?;
    let ip = Ipv4Repr::parse(&ip_packet, &caps).ok()?;
    if ip.next_header != IpProtocol::Icmp {
        return None;
    }
    let icmp_packet = Icmpv4Packet::new_checked(ip_packet.payload()).ok()?;
    let icmp = Icmpv4Repr::parse(&icmp_packet, &caps).ok()?;
    Some((ip, icmp))
}

/// Pings `remote` through `interface` until a reply arrives or `timeout`
/// passes. Requests are repeated every second in case one is lost while
/// the tunnel handshake completes.
pub async fn verify(
    interface: &TunnelInterface,
    remote: Ipv4Addr,
    timeout: Duration,
) -> Result<ProbeReport, ProbeError> {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut resend = tokio::time::interval(RESEND_INTERVAL);
    resend.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sent: HashMap<u16, Instant> = HashMap::new();
    let mut seq_no: u16 = 0;

    loop {
        tokio::select! {
            _ = &mut deadline => {
                return Err(ProbeError::Timeout {
                    remote,
                    waited: timeout,
                });
            }
            _ = resend.tick() => {
                seq_no = seq_no.wrapping_add(1);
                let request = echo_request(
                    interface.address(),
                    remote,
                    PROBE_IDENT,
                    seq_no,
                    PROBE_PAYLOAD,
                );
                interface
                    .send_packet(request)
                    .await
                    .map_err(|_| ProbeError::InterfaceClosed)?;
                sent.insert(seq_no, Instant::now());
                tracing::debug!(target = "bootstrap", %remote, seq_no, "echo request sent");
            }
            packet = interface.recv_packet() => {
                let packet = packet.ok_or(ProbeError::InterfaceClosed)?;
                let answered = reply_sequence(&packet, remote, PROBE_IDENT)
                    .and_then(|seq| sent.get(&seq));
                match answered {
                    Some(sent_at) => {
                        return Ok(ProbeReport {
                            remote,
                            rtt: sent_at.elapsed(),
                            attempts: sent.len(),
                        });
                    }
                    None => {
                        tracing::trace!(target = "bootstrap", len = packet.len(), "ignoring packet while probing");
                    }
                }
            }
        }
    }
}

/// Answers echo requests addressed to the interface until the interface
/// closes or the responder is dropped.
pub struct EchoResponder {
    task: JoinHandle<()>,
}

impl EchoResponder {
    pub fn spawn(interface: Arc<TunnelInterface>) -> Self {
        let task = tokio::spawn(async move {
            let local = interface.address();
            while let Some(packet) = interface.recv_packet().await {
                let Some(reply) = echo_reply_for(&packet, local) else {
                    tracing::trace!(target = "bootstrap", len = packet.len(), "not an echo request for us");
                    continue;
                };
                tracing::debug!(target = "bootstrap", "answering echo request");
                if interface.send_packet(reply).await.is_err() {
                    break;
                }
            }
            tracing::debug!(target = "bootstrap", "echo responder stopped");
        });
        Self { task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for EchoResponder {
    fn drop(&mut self) {
        self.task.abort();
    }
}
