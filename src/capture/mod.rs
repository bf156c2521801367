//! Packet acquisition and TCP slicing.
//!
//! The link-layer reader is an external collaborator: the core consumes only
//! TCP payload slices plus the connection 4-tuple this module extracts.

use anyhow::{Context, Result};
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use pcap::{Capture, Device};
use std::net::IpAddr;
use std::path::Path;
use std::time::SystemTime;

use crate::format::Direction;
use crate::reassembly::FlowKey;

/// Link-layer type of the capture, determines how to parse raw packet bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    LinuxSll,
    LinuxSll2,
    RawIp,
}

/// One TCP payload slice handed to the core.
#[derive(Debug)]
pub struct TcpSegment {
    pub key: FlowKey,
    pub payload: Vec<u8>,
}

impl TcpSegment {
    /// SEND if the segment travels towards the filter port, RECV otherwise.
    pub fn direction(&self, filter_port: u16) -> Direction {
        if self.key.dst_port == filter_port {
            Direction::Send
        } else {
            Direction::Recv
        }
    }
}

pub struct PacketData<'a> {
    pub data: &'a [u8],
    pub timestamp: SystemTime,
}

pub enum PacketSource {
    Live(Capture<pcap::Active>, LinkType),
    File(Capture<pcap::Offline>, LinkType),
}

impl PacketSource {
    pub fn link_type(&self) -> LinkType {
        match self {
            PacketSource::Live(_, lt) | PacketSource::File(_, lt) => *lt,
        }
    }

    pub fn live(
        interface: Option<&str>,
        snaplen: i32,
        promisc: bool,
        filter_port: u16,
    ) -> Result<Self> {
        let device = match interface {
            Some(name) => Device::list()?
                .into_iter()
                .find(|d| d.name == name)
                .context(format!("Interface '{}' not found", name))?,
            None => Device::lookup()?.context("No capture device found")?,
        };

        let mut cap = Capture::from_device(device)?
            .snaplen(snaplen)
            .promisc(promisc)
            .timeout(1000)
            .open()
            .context("Failed to open capture device")?;

        let filter = format!("tcp port {}", filter_port);
        cap.filter(&filter, true)
            .context(format!("Invalid BPF filter: {}", filter))?;

        let lt = link_type_from_pcap(cap.get_datalink());
        Ok(PacketSource::Live(cap, lt))
    }

    pub fn from_file(path: &Path, filter_port: u16) -> Result<Self> {
        let mut cap = Capture::from_file(path)
            .context(format!("Failed to open pcap file: {}", path.display()))?;

        let filter = format!("tcp port {}", filter_port);
        cap.filter(&filter, true)
            .context(format!("Invalid BPF filter: {}", filter))?;

        let lt = link_type_from_pcap(cap.get_datalink());
        Ok(PacketSource::File(cap, lt))
    }

    /// Iterate over packets, calling `f` for each one.
    /// Return `false` from `f` to stop capture.
    pub fn for_each_packet<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(PacketData) -> bool,
    {
        loop {
            let raw = match self {
                PacketSource::Live(cap, _) => cap.next_packet(),
                PacketSource::File(cap, _) => cap.next_packet(),
            };

            match raw {
                Ok(packet) => {
                    let ts = {
                        let tv = packet.header.ts;
                        let secs = (tv.tv_sec as i64).max(0) as u64;
                        // Clamp tv_usec to guard against malformed pcap files.
                        let usec = (tv.tv_usec as i64).clamp(0, 999_999) as u32;
                        std::time::UNIX_EPOCH + std::time::Duration::new(secs, usec * 1000)
                    };

                    let pkt = PacketData {
                        data: packet.data,
                        timestamp: ts,
                    };

                    if !f(pkt) {
                        break;
                    }
                }
                Err(pcap::Error::NoMorePackets) => break,
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }
}

pub fn list_interfaces() -> Result<()> {
    let devices = Device::list()?;
    for dev in devices {
        let desc = dev.desc.as_deref().unwrap_or("");
        let addrs: Vec<String> = dev.addresses.iter().map(|a| a.addr.to_string()).collect();
        println!("{:<16} {}  [{}]", dev.name, desc, addrs.join(", "));
    }
    Ok(())
}

fn link_type_from_pcap(dl: pcap::Linktype) -> LinkType {
    match dl.0 {
        1 => LinkType::Ethernet,     // DLT_EN10MB
        12 | 101 => LinkType::RawIp, // DLT_RAW
        113 => LinkType::LinuxSll,   // DLT_LINUX_SLL
        276 => LinkType::LinuxSll2,  // DLT_LINUX_SLL2
        _ => {
            eprintln!(
                "Warning: unsupported link type {} ({}), assuming Ethernet",
                dl.get_name().unwrap_or_default(),
                dl.0
            );
            LinkType::Ethernet
        }
    }
}

/// Slice raw packet bytes down to a TCP payload and its 4-tuple. Non-TCP
/// and unparseable packets return None.
pub fn parse_segment(data: &[u8], link_type: LinkType) -> Option<TcpSegment> {
    let sliced = match link_type {
        LinkType::Ethernet => SlicedPacket::from_ethernet(data).ok()?,
        LinkType::RawIp => SlicedPacket::from_ip(data).ok()?,
        LinkType::LinuxSll => {
            // Linux cooked capture v1: 16-byte header, then IP packet
            if data.len() < 16 {
                return None;
            }
            let proto = u16::from_be_bytes([data[14], data[15]]);
            match proto {
                0x0800 | 0x86DD => SlicedPacket::from_ip(&data[16..]).ok()?,
                _ => return None, // Not IP (e.g. ARP)
            }
        }
        LinkType::LinuxSll2 => {
            // Linux cooked capture v2: 20-byte header, then IP packet
            if data.len() < 20 {
                return None;
            }
            let proto = u16::from_be_bytes([data[0], data[1]]);
            match proto {
                0x0800 | 0x86DD => SlicedPacket::from_ip(&data[20..]).ok()?,
                _ => return None,
            }
        }
    };

    let (src_ip, dst_ip) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => (
            IpAddr::V4(ipv4.header().source_addr()),
            IpAddr::V4(ipv4.header().destination_addr()),
        ),
        Some(NetSlice::Ipv6(ipv6)) => (
            IpAddr::V6(ipv6.header().source_addr()),
            IpAddr::V6(ipv6.header().destination_addr()),
        ),
        _ => return None,
    };

    match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => Some(TcpSegment {
            key: FlowKey::new(src_ip, tcp.source_port(), dst_ip, tcp.destination_port()),
            payload: tcp.payload().to_vec(),
        }),
        _ => None,
    }
}
