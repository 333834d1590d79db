//! Ethernet MAC with descriptor-ring DMA and inline protocol services.
//!
//! TX and RX descriptor lists live in guest memory as 16-byte records
//! (status, size, buffer address, next pointer). Transmitted frames are
//! inspected by an embedded protocol module that answers ICMP echo, UDP
//! echo (port 7), DHCP (port 67) and TFTP (port 69) directly, synthesizing
//! reply frames into an RX FIFO that is drained through the RX ring.
//!
//! Registers:
//!   0x00 MACCR     MAC configuration
//!   0x04 MACSR     MAC status (reserved)
//!   0x08 MACA0HR   MAC address high
//!   0x0C MACA0LR   MAC address low
//!   0x10 DMAOMR    DMA operation mode
//!   0x14 DMASR     DMA status (write 1 to clear)
//!   0x18 DMATDLAR  TX descriptor list address
//!   0x1C DMARDLAR  RX descriptor list address
//!   0x20 DMATPDR   TX poll demand
//!   0x24 DMARPDR   RX poll demand
//!   0x28 DMACHTDR  Current TX descriptor (ro)
//!   0x2C DMACHRDR  Current RX descriptor (ro)

use crate::bus::{Bus, Device, Interrupt, Width};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Weak;

pub const ETH_IRQ: u32 = 26;

// MACCR bits
pub const MACCR_TE: u32 = 1 << 0;
pub const MACCR_RE: u32 = 1 << 1;

// DMAOMR bits
pub const DMAOMR_SR: u32 = 1 << 0;
pub const DMAOMR_ST: u32 = 1 << 1;

// DMASR bits
pub const DMASR_TS: u32 = 1 << 0;
pub const DMASR_RS: u32 = 1 << 1;
pub const DMASR_TU: u32 = 1 << 2;
pub const DMASR_RU: u32 = 1 << 3;
pub const DMASR_NIS: u32 = 1 << 4;
pub const DMASR_AIS: u32 = 1 << 5;

// TX descriptor status (TDES0)
pub const TDES0_OWN: u32 = 1 << 31;
pub const TDES0_IC: u32 = 1 << 30;
pub const TDES0_LS: u32 = 1 << 29;
pub const TDES0_FS: u32 = 1 << 28;
pub const TDES0_TCH: u32 = 1 << 20;

// RX descriptor status (RDES0) and control (RDES1)
pub const RDES0_OWN: u32 = 1 << 31;
pub const RDES0_FL_SHIFT: u32 = 16;
pub const RDES0_FL_MASK: u32 = 0x3FFF << 16;
pub const RDES0_LS: u32 = 1 << 9;
pub const RDES0_FS: u32 = 1 << 8;
pub const RDES1_RCH: u32 = 1 << 14;
pub const RDES1_RBS_MASK: u32 = 0x1FFF;

// Protocol constants
const ETHERTYPE_IP: u16 = 0x0800;
const IP_PROTO_ICMP: u8 = 1;
const IP_PROTO_UDP: u8 = 17;

const UDP_ECHO_PORT: u16 = 7;
const TFTP_PORT: u16 = 69;
const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

const TFTP_RRQ: u16 = 1;
const TFTP_WRQ: u16 = 2;
const TFTP_DATA: u16 = 3;
const TFTP_ACK: u16 = 4;
const TFTP_ERROR: u16 = 5;

const TFTP_ERR_NOT_FOUND: u16 = 1;
const TFTP_ERR_ACCESS: u16 = 2;
const TFTP_ERR_ILLEGAL_OP: u16 = 4;

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;

const DHCP_DISCOVER: u8 = 1;
const DHCP_OFFER: u8 = 2;
const DHCP_REQUEST: u8 = 3;
const DHCP_ACK: u8 = 5;

const DHCP_OPT_SUBNET: u8 = 1;
const DHCP_OPT_ROUTER: u8 = 3;
const DHCP_OPT_LEASE: u8 = 51;
const DHCP_OPT_MSGTYPE: u8 = 53;
const DHCP_OPT_SERVER: u8 = 54;
const DHCP_OPT_END: u8 = 255;

/// Virtual network identity.
pub const SERVER_IP: [u8; 4] = [10, 0, 0, 1];
pub const CLIENT_IP: [u8; 4] = [10, 0, 0, 2];
pub const SUBNET_MASK: [u8; 4] = [255, 255, 255, 0];
pub const SERVER_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

/// Per-client in-flight TFTP transfer, keyed by the client's ephemeral port.
struct TftpSession {
    client_ip: [u8; 4],
    client_mac: [u8; 6],
    /// true for RRQ (server sending), false for WRQ (server receiving)
    is_read: bool,
    block_num: u16,
    /// File content (RRQ) or accumulator (WRQ)
    data: Vec<u8>,
    filename: String,
    /// Read cursor into `data` for RRQ transfers
    offset: usize,
}

pub struct EthMac {
    maccr: u32,
    mac_addr_high: u32,
    mac_addr_low: u32,
    dmaomr: u32,
    dmasr: u32,
    tx_desc_list: u32,
    rx_desc_list: u32,
    current_tx_desc: u32,
    current_rx_desc: u32,
    tx_poll_pending: bool,
    rx_poll_pending: bool,

    rx_queue: VecDeque<Vec<u8>>,

    tftp_root: PathBuf,
    sessions: HashMap<u16, TftpSession>,

    bus: Weak<Bus>,
}

impl EthMac {
    pub fn new() -> Self {
        Self {
            maccr: 0,
            // default 00:02:03:04:05:06
            mac_addr_high: 0x0002,
            mac_addr_low: 0x0304_0506,
            dmaomr: 0,
            dmasr: 0,
            tx_desc_list: 0,
            rx_desc_list: 0,
            current_tx_desc: 0,
            current_rx_desc: 0,
            tx_poll_pending: false,
            rx_poll_pending: false,
            rx_queue: VecDeque::new(),
            tftp_root: PathBuf::new(),
            sessions: HashMap::new(),
            bus: Weak::new(),
        }
    }

    pub fn connect_bus(&mut self, bus: Weak<Bus>) {
        self.bus = bus;
    }

    pub fn set_tftp_root<P: Into<PathBuf>>(&mut self, root: P) {
        self.tftp_root = root.into();
    }

    pub fn mac_address(&self) -> [u8; 6] {
        [
            (self.mac_addr_high >> 8) as u8,
            self.mac_addr_high as u8,
            (self.mac_addr_low >> 24) as u8,
            (self.mac_addr_low >> 16) as u8,
            (self.mac_addr_low >> 8) as u8,
            self.mac_addr_low as u8,
        ]
    }

    // ---- Descriptor pipelines ------------------------------------------

    /// Process one TX descriptor; returns true when the descriptor asked
    /// for a completion interrupt.
    fn process_tx(&mut self, bus: &Bus) -> bool {
        if self.current_tx_desc == 0 {
            return false;
        }

        let tdes0 = bus.read32(self.current_tx_desc);
        let tdes1 = bus.read32(self.current_tx_desc + 4);
        let tdes2 = bus.read32(self.current_tx_desc + 8);
        let tdes3 = bus.read32(self.current_tx_desc + 12);

        if tdes0 & TDES0_OWN == 0 {
            self.dmasr |= DMASR_TU;
            return false;
        }

        let buf_size = tdes1 & 0x1FFF;
        let buf_addr = tdes2;

        let mut frame = Vec::with_capacity(buf_size as usize);
        for i in 0..buf_size {
            frame.push(bus.read8(buf_addr + i) as u8);
        }

        self.process_frame(&frame);

        // hand the descriptor back to the driver
        bus.write32(self.current_tx_desc, tdes0 & !TDES0_OWN);

        if tdes0 & TDES0_TCH != 0 {
            self.current_tx_desc = tdes3;
        } else {
            self.current_tx_desc += 16;
        }

        self.dmasr |= DMASR_TS | DMASR_NIS;
        tdes0 & TDES0_IC != 0
    }

    /// Deliver one queued frame into the current RX descriptor; returns
    /// true when a frame was delivered.
    fn process_rx(&mut self, bus: &Bus) -> bool {
        if self.rx_queue.is_empty() || self.current_rx_desc == 0 {
            return false;
        }

        let rdes0 = bus.read32(self.current_rx_desc);
        let rdes1 = bus.read32(self.current_rx_desc + 4);
        let rdes2 = bus.read32(self.current_rx_desc + 8);
        let rdes3 = bus.read32(self.current_rx_desc + 12);

        if rdes0 & RDES0_OWN == 0 {
            self.dmasr |= DMASR_RU;
            return false;
        }

        let buf_size = rdes1 & RDES1_RBS_MASK;
        let buf_addr = rdes2;

        let frame = self.rx_queue.pop_front().unwrap();
        let frame_len = (frame.len() as u32).min(buf_size);

        for i in 0..frame_len {
            bus.write8(buf_addr + i, frame[i as usize] as u32);
        }

        let mut status = rdes0 & !RDES0_OWN;
        status |= RDES0_FS | RDES0_LS;
        status = (status & !RDES0_FL_MASK) | (frame_len << RDES0_FL_SHIFT);
        bus.write32(self.current_rx_desc, status);

        if rdes1 & RDES1_RCH != 0 {
            self.current_rx_desc = rdes3;
        } else {
            self.current_rx_desc += 16;
        }

        self.dmasr |= DMASR_RS | DMASR_NIS;
        true
    }

    // ---- Protocol module -----------------------------------------------

    /// Inspect one transmitted frame and synthesize any reply into the
    /// RX FIFO.
    fn process_frame(&mut self, frame: &[u8]) {
        // minimum Ethernet + IP header
        if frame.len() < 34 {
            return;
        }
        let ethertype = be16(frame, 12);
        if ethertype != ETHERTYPE_IP {
            return;
        }

        match frame[23] {
            IP_PROTO_ICMP => self.process_icmp(frame),
            IP_PROTO_UDP => self.process_udp(frame),
            _ => {}
        }
    }

    fn process_icmp(&mut self, frame: &[u8]) {
        let icmp_offset = 14 + ((frame[14] & 0x0F) as usize) * 4;
        if frame.len() < icmp_offset + 8 {
            return;
        }
        if frame[icmp_offset] != ICMP_ECHO_REQUEST || frame[icmp_offset + 1] != 0 {
            return;
        }

        let mut reply = frame.to_vec();
        swap_range(&mut reply, 0, 6, 6); // MAC addresses
        swap_range(&mut reply, 26, 30, 4); // IP addresses
        reply[icmp_offset] = ICMP_ECHO_REPLY;
        recalc_icmp_checksum(&mut reply, icmp_offset);
        recalc_ip_checksum(&mut reply);
        self.rx_queue.push_back(reply);
    }

    fn process_udp(&mut self, frame: &[u8]) {
        if frame.len() < 42 {
            return;
        }
        let src_port = be16(frame, 34);
        let dst_port = be16(frame, 36);

        if dst_port == UDP_ECHO_PORT {
            self.process_udp_echo(frame);
        } else if dst_port == DHCP_SERVER_PORT {
            self.process_dhcp(frame);
        } else if dst_port == TFTP_PORT {
            if self.sessions.contains_key(&src_port) {
                self.process_tftp_transfer(frame, src_port);
            } else {
                self.process_tftp_initial(frame, src_port);
            }
        } else if self.sessions.contains_key(&src_port) {
            self.process_tftp_transfer(frame, src_port);
        }
    }

    fn process_udp_echo(&mut self, frame: &[u8]) {
        let mut reply = frame.to_vec();
        swap_range(&mut reply, 0, 6, 6); // MAC addresses
        swap_range(&mut reply, 26, 30, 4); // IP addresses
        swap_range(&mut reply, 34, 36, 2); // UDP ports
        reply[40] = 0; // UDP checksum is optional for IPv4
        reply[41] = 0;
        recalc_ip_checksum(&mut reply);
        self.rx_queue.push_back(reply);
    }

    fn process_dhcp(&mut self, frame: &[u8]) {
        // BOOTP header (236) + magic cookie after the UDP payload start
        if frame.len() < 278 {
            return;
        }
        let d = 42;

        // only BOOTREQUEST
        if frame[d] != 1 {
            return;
        }

        let xid = u32::from_be_bytes([frame[d + 4], frame[d + 5], frame[d + 6], frame[d + 7]]);
        let mut client_mac = [0u8; 6];
        client_mac.copy_from_slice(&frame[d + 28..d + 34]);

        // options begin after the 4-byte magic cookie at BOOTP offset 236
        let mut opt = d + 236 + 4;
        let mut msg_type = 0u8;
        while opt < frame.len() && frame[opt] != DHCP_OPT_END {
            let code = frame[opt];
            opt += 1;
            if code == 0 {
                continue; // pad
            }
            if opt >= frame.len() {
                break;
            }
            let len = frame[opt] as usize;
            opt += 1;
            if code == DHCP_OPT_MSGTYPE && len >= 1 && opt < frame.len() {
                msg_type = frame[opt];
            }
            opt += len;
        }

        match msg_type {
            DHCP_DISCOVER => self.send_dhcp_reply(xid, &client_mac, DHCP_OFFER),
            DHCP_REQUEST => self.send_dhcp_reply(xid, &client_mac, DHCP_ACK),
            _ => {}
        }
    }

    fn send_dhcp_reply(&mut self, xid: u32, client_mac: &[u8; 6], msg_type: u8) {
        // ETH(14) + IP(20) + UDP(8) + BOOTP(240) + options(32)
        let mut pkt = vec![0u8; 314];

        pkt[0..6].copy_from_slice(client_mac);
        pkt[6..12].copy_from_slice(&SERVER_MAC);
        put_be16(&mut pkt, 12, ETHERTYPE_IP);

        pkt[14] = 0x45;
        put_be16(&mut pkt, 16, 20 + 8 + 240 + 32);
        pkt[22] = 64; // TTL
        pkt[23] = IP_PROTO_UDP;
        pkt[26..30].copy_from_slice(&SERVER_IP);
        pkt[30..34].copy_from_slice(&CLIENT_IP);

        put_be16(&mut pkt, 34, DHCP_CLIENT_PORT);
        put_be16(&mut pkt, 36, DHCP_CLIENT_PORT);
        put_be16(&mut pkt, 38, 8 + 240 + 32);

        // BOOTP payload
        let d = 42;
        pkt[d] = 2; // BOOTREPLY
        pkt[d + 1] = 1; // htype Ethernet
        pkt[d + 2] = 6; // hlen
        put_be32(&mut pkt, d + 4, xid);
        pkt[d + 16..d + 20].copy_from_slice(&CLIENT_IP); // yiaddr
        pkt[d + 20..d + 24].copy_from_slice(&SERVER_IP); // siaddr
        pkt[d + 28..d + 34].copy_from_slice(client_mac); // chaddr

        // magic cookie
        pkt[d + 236..d + 240].copy_from_slice(&[99, 130, 83, 99]);

        let mut o = d + 240;
        pkt[o] = DHCP_OPT_MSGTYPE;
        pkt[o + 1] = 1;
        pkt[o + 2] = msg_type;
        o += 3;
        pkt[o] = DHCP_OPT_SERVER;
        pkt[o + 1] = 4;
        pkt[o + 2..o + 6].copy_from_slice(&SERVER_IP);
        o += 6;
        pkt[o] = DHCP_OPT_LEASE;
        pkt[o + 1] = 4;
        put_be32(&mut pkt, o + 2, 3600);
        o += 6;
        pkt[o] = DHCP_OPT_SUBNET;
        pkt[o + 1] = 4;
        pkt[o + 2..o + 6].copy_from_slice(&SUBNET_MASK);
        o += 6;
        pkt[o] = DHCP_OPT_ROUTER;
        pkt[o + 1] = 4;
        pkt[o + 2..o + 6].copy_from_slice(&SERVER_IP);
        o += 6;
        pkt[o] = DHCP_OPT_END;

        recalc_ip_checksum(&mut pkt);
        self.rx_queue.push_back(pkt);
    }

    // ---- TFTP ----------------------------------------------------------

    fn process_tftp_initial(&mut self, frame: &[u8], client_port: u16) {
        if self.tftp_root.as_os_str().is_empty() {
            return;
        }
        if frame.len() < 44 {
            return;
        }

        let mut client_mac = [0u8; 6];
        client_mac.copy_from_slice(&frame[6..12]);
        let mut client_ip = [0u8; 4];
        client_ip.copy_from_slice(&frame[26..30]);

        let opcode = be16(frame, 42);

        // null-terminated filename after the opcode
        let mut filename = String::new();
        let mut i = 44;
        while i < frame.len() && frame[i] != 0 {
            filename.push(frame[i] as char);
            i += 1;
        }

        if filename.is_empty() {
            let pkt = build_tftp_error(
                &client_mac,
                &client_ip,
                client_port,
                TFTP_ERR_ACCESS,
                "Empty filename",
            );
            self.rx_queue.push_back(pkt);
            return;
        }

        match opcode {
            TFTP_RRQ => self.handle_tftp_rrq(&client_mac, &client_ip, client_port, &filename),
            TFTP_WRQ => self.handle_tftp_wrq(&client_mac, &client_ip, client_port, &filename),
            _ => {
                let pkt = build_tftp_error(
                    &client_mac,
                    &client_ip,
                    client_port,
                    TFTP_ERR_ILLEGAL_OP,
                    "Invalid opcode",
                );
                self.rx_queue.push_back(pkt);
            }
        }
    }

    fn handle_tftp_rrq(
        &mut self,
        client_mac: &[u8; 6],
        client_ip: &[u8; 4],
        client_port: u16,
        filename: &str,
    ) {
        let data = if filename == "/.dir" || filename == ".dir" {
            self.dir_listing()
        } else {
            let safe_name = match sanitize_path(filename) {
                Some(name) => name,
                None => {
                    let pkt = build_tftp_error(
                        client_mac,
                        client_ip,
                        client_port,
                        TFTP_ERR_ACCESS,
                        "Invalid path",
                    );
                    self.rx_queue.push_back(pkt);
                    return;
                }
            };
            match std::fs::read(self.tftp_root.join(&safe_name)) {
                Ok(data) => data,
                Err(_) => {
                    let pkt = build_tftp_error(
                        client_mac,
                        client_ip,
                        client_port,
                        TFTP_ERR_NOT_FOUND,
                        "File not found",
                    );
                    self.rx_queue.push_back(pkt);
                    return;
                }
            }
        };

        let mut session = TftpSession {
            client_ip: *client_ip,
            client_mac: *client_mac,
            is_read: true,
            block_num: 0,
            data,
            filename: filename.to_string(),
            offset: 0,
        };
        let pkt = build_tftp_data_block(&mut session, client_port);
        self.rx_queue.push_back(pkt);
        self.sessions.insert(client_port, session);
    }

    fn handle_tftp_wrq(
        &mut self,
        client_mac: &[u8; 6],
        client_ip: &[u8; 4],
        client_port: u16,
        filename: &str,
    ) {
        let safe_name = match sanitize_path(filename) {
            Some(name) => name,
            None => {
                let pkt = build_tftp_error(
                    client_mac,
                    client_ip,
                    client_port,
                    TFTP_ERR_ACCESS,
                    "Invalid path",
                );
                self.rx_queue.push_back(pkt);
                return;
            }
        };

        let session = TftpSession {
            client_ip: *client_ip,
            client_mac: *client_mac,
            is_read: false,
            block_num: 0,
            data: Vec::new(),
            filename: safe_name,
            offset: 0,
        };
        let pkt = build_tftp_ack(&session, client_port, 0);
        self.rx_queue.push_back(pkt);
        self.sessions.insert(client_port, session);
    }

    fn process_tftp_transfer(&mut self, frame: &[u8], client_port: u16) {
        if frame.len() < 46 {
            return;
        }
        let Some(mut session) = self.sessions.remove(&client_port) else {
            return;
        };

        let opcode = be16(frame, 42);
        let block = be16(frame, 44);
        let mut done = false;

        if session.is_read && opcode == TFTP_ACK {
            if block == session.block_num {
                if session.offset >= session.data.len() {
                    done = true;
                } else {
                    let pkt = build_tftp_data_block(&mut session, client_port);
                    self.rx_queue.push_back(pkt);
                }
            }
        } else if !session.is_read && opcode == TFTP_DATA && block == session.block_num.wrapping_add(1)
        {
            session.block_num = block;
            let payload = &frame[46..];
            session.data.extend_from_slice(payload);

            let pkt = build_tftp_ack(&session, client_port, block);
            self.rx_queue.push_back(pkt);

            // a short block ends the transfer and flushes to disk
            if payload.len() < 512 {
                let full_path = self.tftp_root.join(&session.filename);
                if let Some(parent) = full_path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(err) = std::fs::write(&full_path, &session.data) {
                    log::warn!("tftp: failed to write {}: {err}", full_path.display());
                }
                done = true;
            }
        }

        if !done {
            self.sessions.insert(client_port, session);
        }
    }

    /// Synthesized listing for the reserved `/.dir` pseudo-file:
    /// one `relpath<TAB>size<LF>` line per regular file, recursively.
    fn dir_listing(&self) -> Vec<u8> {
        fn walk(root: &Path, dir: &Path, out: &mut String) {
            let Ok(entries) = std::fs::read_dir(dir) else {
                return;
            };
            let mut entries: Vec<_> = entries.flatten().collect();
            entries.sort_by_key(|e| e.path());
            for entry in entries {
                let path = entry.path();
                if path.is_dir() {
                    walk(root, &path, out);
                } else if let Ok(meta) = entry.metadata() {
                    if meta.is_file() {
                        if let Ok(rel) = path.strip_prefix(root) {
                            out.push_str(&format!("{}\t{}\n", rel.display(), meta.len()));
                        }
                    }
                }
            }
        }

        let mut listing = String::new();
        walk(&self.tftp_root, &self.tftp_root, &mut listing);
        listing.into_bytes()
    }
}

impl Default for EthMac {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for EthMac {
    fn read(&mut self, offset: u32, _width: Width) -> u32 {
        match offset & 0xFFF {
            0x00 => self.maccr,
            0x04 => 0,
            0x08 => self.mac_addr_high,
            0x0C => self.mac_addr_low,
            0x10 => self.dmaomr,
            0x14 => self.dmasr,
            0x18 => self.tx_desc_list,
            0x1C => self.rx_desc_list,
            0x28 => self.current_tx_desc,
            0x2C => self.current_rx_desc,
            _ => 0,
        }
    }

    fn write(&mut self, offset: u32, _width: Width, val: u32) {
        match offset & 0xFFF {
            0x00 => self.maccr = val,
            0x08 => self.mac_addr_high = val & 0xFFFF,
            0x0C => self.mac_addr_low = val,
            0x10 => self.dmaomr = val,
            0x14 => self.dmasr &= !(val & 0x3F),
            0x18 => {
                self.tx_desc_list = val;
                self.current_tx_desc = val;
            }
            0x1C => {
                self.rx_desc_list = val;
                self.current_rx_desc = val;
            }
            0x20 => self.tx_poll_pending = true,
            0x24 => self.rx_poll_pending = true,
            _ => {}
        }
    }

    fn tick(&mut self, _cycles: u64) -> Option<Interrupt> {
        let bus = self.bus.upgrade()?;
        let mut irq = false;

        if self.maccr & MACCR_TE != 0 && self.dmaomr & DMAOMR_ST != 0 && self.tx_poll_pending {
            irq |= self.process_tx(&bus);
            self.tx_poll_pending = false;
        }

        if self.maccr & MACCR_RE != 0 && self.dmaomr & DMAOMR_SR != 0 {
            if self.rx_poll_pending {
                self.rx_poll_pending = false;
            }
            irq |= self.process_rx(&bus);
        }

        irq.then_some(Interrupt { cause: ETH_IRQ })
    }
}

// ---- Frame helpers ------------------------------------------------------

fn be16(frame: &[u8], off: usize) -> u16 {
    (frame[off] as u16) << 8 | frame[off + 1] as u16
}

fn put_be16(frame: &mut [u8], off: usize, val: u16) {
    frame[off] = (val >> 8) as u8;
    frame[off + 1] = val as u8;
}

fn put_be32(frame: &mut [u8], off: usize, val: u32) {
    frame[off..off + 4].copy_from_slice(&val.to_be_bytes());
}

fn swap_range(frame: &mut [u8], a: usize, b: usize, len: usize) {
    for i in 0..len {
        frame.swap(a + i, b + i);
    }
}

/// One's-complement sum over `bytes`, folded to 16 bits and inverted.
fn checksum16(bytes: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut i = 0;
    while i < bytes.len() {
        let mut word = (bytes[i] as u32) << 8;
        if i + 1 < bytes.len() {
            word |= bytes[i + 1] as u32;
        }
        sum += word;
        i += 2;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn recalc_ip_checksum(frame: &mut [u8]) {
    let ihl = ((frame[14] & 0x0F) as usize) * 4;
    frame[24] = 0;
    frame[25] = 0;
    let sum = checksum16(&frame[14..14 + ihl]);
    put_be16(frame, 24, sum);
}

fn recalc_icmp_checksum(frame: &mut [u8], icmp_offset: usize) {
    frame[icmp_offset + 2] = 0;
    frame[icmp_offset + 3] = 0;
    let sum = checksum16(&frame[icmp_offset..]);
    put_be16(frame, icmp_offset + 2, sum);
}

/// Strip a leading slash and refuse any path containing "..".
fn sanitize_path(filename: &str) -> Option<String> {
    let name = filename.strip_prefix('/').unwrap_or(filename);
    if name.contains("..") {
        return None;
    }
    Some(name.to_string())
}

/// ETH + IP + UDP headers for a server->client packet with `payload_len`
/// UDP payload bytes; the caller fills the payload.
fn build_udp_frame(client_mac: &[u8; 6], client_ip: &[u8; 4], client_port: u16, payload_len: usize) -> Vec<u8> {
    let mut pkt = vec![0u8; 42 + payload_len];

    pkt[0..6].copy_from_slice(client_mac);
    pkt[6..12].copy_from_slice(&SERVER_MAC);
    put_be16(&mut pkt, 12, ETHERTYPE_IP);

    pkt[14] = 0x45;
    put_be16(&mut pkt, 16, (20 + 8 + payload_len) as u16);
    pkt[22] = 64; // TTL
    pkt[23] = IP_PROTO_UDP;
    pkt[26..30].copy_from_slice(&SERVER_IP);
    pkt[30..34].copy_from_slice(client_ip);

    put_be16(&mut pkt, 34, TFTP_PORT);
    put_be16(&mut pkt, 36, client_port);
    put_be16(&mut pkt, 38, (8 + payload_len) as u16);

    pkt
}

fn build_tftp_data_block(session: &mut TftpSession, client_port: u16) -> Vec<u8> {
    session.block_num = session.block_num.wrapping_add(1);

    let remaining = session.data.len() - session.offset;
    let block_size = remaining.min(512);

    let mut pkt = build_udp_frame(
        &session.client_mac,
        &session.client_ip,
        client_port,
        4 + block_size,
    );
    put_be16(&mut pkt, 42, TFTP_DATA);
    put_be16(&mut pkt, 44, session.block_num);
    pkt[46..46 + block_size]
        .copy_from_slice(&session.data[session.offset..session.offset + block_size]);
    session.offset += block_size;

    recalc_ip_checksum(&mut pkt);
    pkt
}

fn build_tftp_ack(session: &TftpSession, client_port: u16, block: u16) -> Vec<u8> {
    let mut pkt = build_udp_frame(&session.client_mac, &session.client_ip, client_port, 4);
    put_be16(&mut pkt, 42, TFTP_ACK);
    put_be16(&mut pkt, 44, block);
    recalc_ip_checksum(&mut pkt);
    pkt
}

fn build_tftp_error(
    client_mac: &[u8; 6],
    client_ip: &[u8; 4],
    client_port: u16,
    error_code: u16,
    msg: &str,
) -> Vec<u8> {
    let mut pkt = build_udp_frame(client_mac, client_ip, client_port, 4 + msg.len() + 1);
    put_be16(&mut pkt, 42, TFTP_ERROR);
    put_be16(&mut pkt, 44, error_code);
    pkt[46..46 + msg.len()].copy_from_slice(msg.as_bytes());
    // trailing NUL already zero
    recalc_ip_checksum(&mut pkt);
    pkt
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT_MAC: [u8; 6] = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];

    /// Client->server UDP frame with the given ports and payload.
    fn udp_frame(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; 42 + payload.len()];
        pkt[0..6].copy_from_slice(&SERVER_MAC);
        pkt[6..12].copy_from_slice(&CLIENT_MAC);
        put_be16(&mut pkt, 12, ETHERTYPE_IP);
        pkt[14] = 0x45;
        put_be16(&mut pkt, 16, (20 + 8 + payload.len()) as u16);
        pkt[22] = 64;
        pkt[23] = IP_PROTO_UDP;
        pkt[26..30].copy_from_slice(&CLIENT_IP);
        pkt[30..34].copy_from_slice(&SERVER_IP);
        put_be16(&mut pkt, 34, src_port);
        put_be16(&mut pkt, 36, dst_port);
        put_be16(&mut pkt, 38, (8 + payload.len()) as u16);
        put_be16(&mut pkt, 40, 0);
        pkt[42..].copy_from_slice(payload);
        recalc_ip_checksum(&mut pkt);
        pkt
    }

    fn icmp_echo_request(payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; 42 + payload.len()];
        pkt[0..6].copy_from_slice(&SERVER_MAC);
        pkt[6..12].copy_from_slice(&CLIENT_MAC);
        put_be16(&mut pkt, 12, ETHERTYPE_IP);
        pkt[14] = 0x45;
        put_be16(&mut pkt, 16, (20 + 8 + payload.len()) as u16);
        pkt[22] = 64;
        pkt[23] = IP_PROTO_ICMP;
        pkt[26..30].copy_from_slice(&CLIENT_IP);
        pkt[30..34].copy_from_slice(&SERVER_IP);
        pkt[34] = ICMP_ECHO_REQUEST;
        put_be16(&mut pkt, 38, 0x1234); // identifier
        put_be16(&mut pkt, 40, 1); // sequence
        pkt[42..].copy_from_slice(payload);
        recalc_icmp_checksum(&mut pkt, 34);
        recalc_ip_checksum(&mut pkt);
        pkt
    }

    fn temp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("mcu-vm-eth-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn icmp_echo_round_trip() {
        let mut eth = EthMac::new();
        eth.process_frame(&icmp_echo_request(b"ping payload"));

        assert_eq!(eth.rx_queue.len(), 1);
        let reply = eth.rx_queue.pop_front().unwrap();
        // MAC and IP swapped
        assert_eq!(&reply[0..6], &CLIENT_MAC);
        assert_eq!(&reply[6..12], &SERVER_MAC);
        assert_eq!(&reply[26..30], &SERVER_IP);
        assert_eq!(&reply[30..34], &CLIENT_IP);
        // echo reply with intact payload
        assert_eq!(reply[34], ICMP_ECHO_REPLY);
        assert_eq!(&reply[42..], b"ping payload");
        // recomputed checksums verify to zero
        assert_eq!(checksum16(&reply[34..]), 0);
        assert_eq!(checksum16(&reply[14..34]), 0);
    }

    #[test]
    fn udp_echo_swaps_ports_and_keeps_payload() {
        let mut eth = EthMac::new();
        eth.process_frame(&udp_frame(40000, UDP_ECHO_PORT, b"echo me"));

        let reply = eth.rx_queue.pop_front().unwrap();
        assert_eq!(be16(&reply, 34), UDP_ECHO_PORT);
        assert_eq!(be16(&reply, 36), 40000);
        assert_eq!(&reply[42..], b"echo me");
        assert_eq!(be16(&reply, 40), 0); // UDP checksum zeroed
        assert_eq!(checksum16(&reply[14..34]), 0);
    }

    fn find_dhcp_option(pkt: &[u8], code: u8) -> Option<&[u8]> {
        let mut o = 42 + 240;
        while o < pkt.len() && pkt[o] != DHCP_OPT_END {
            if pkt[o] == 0 {
                o += 1;
                continue;
            }
            let len = pkt[o + 1] as usize;
            if pkt[o] == code {
                return Some(&pkt[o + 2..o + 2 + len]);
            }
            o += 2 + len;
        }
        None
    }

    fn dhcp_request_frame(msg_type: u8, xid: u32) -> Vec<u8> {
        let mut bootp = vec![0u8; 240 + 8];
        bootp[0] = 1; // BOOTREQUEST
        bootp[1] = 1;
        bootp[2] = 6;
        put_be32(&mut bootp, 4, xid);
        bootp[28..34].copy_from_slice(&CLIENT_MAC);
        bootp[236..240].copy_from_slice(&[99, 130, 83, 99]);
        bootp[240] = DHCP_OPT_MSGTYPE;
        bootp[241] = 1;
        bootp[242] = msg_type;
        bootp[243] = DHCP_OPT_END;
        udp_frame(DHCP_CLIENT_PORT, DHCP_SERVER_PORT, &bootp)
    }

    #[test]
    fn dhcp_handshake() {
        let mut eth = EthMac::new();

        eth.process_frame(&dhcp_request_frame(DHCP_DISCOVER, 0xDEAD_BEEF));
        let offer = eth.rx_queue.pop_front().unwrap();
        assert_eq!(offer[42], 2); // BOOTREPLY
        assert_eq!(&offer[42 + 4..42 + 8], &0xDEAD_BEEFu32.to_be_bytes());
        assert_eq!(&offer[42 + 16..42 + 20], &CLIENT_IP); // yiaddr
        assert_eq!(find_dhcp_option(&offer, DHCP_OPT_MSGTYPE), Some(&[DHCP_OFFER][..]));
        assert_eq!(find_dhcp_option(&offer, DHCP_OPT_SUBNET), Some(&SUBNET_MASK[..]));
        assert_eq!(
            find_dhcp_option(&offer, DHCP_OPT_LEASE),
            Some(&3600u32.to_be_bytes()[..])
        );
        assert_eq!(checksum16(&offer[14..34]), 0);

        eth.process_frame(&dhcp_request_frame(DHCP_REQUEST, 0xDEAD_BEEF));
        let ack = eth.rx_queue.pop_front().unwrap();
        assert_eq!(find_dhcp_option(&ack, DHCP_OPT_MSGTYPE), Some(&[DHCP_ACK][..]));
    }

    fn tftp_rrq(port: u16, filename: &str) -> Vec<u8> {
        let mut payload = vec![0, TFTP_RRQ as u8];
        payload.extend_from_slice(filename.as_bytes());
        payload.push(0);
        payload.extend_from_slice(b"octet");
        payload.push(0);
        udp_frame(port, TFTP_PORT, &payload)
    }

    fn tftp_ack_frame(port: u16, block: u16) -> Vec<u8> {
        let payload = [0, TFTP_ACK as u8, (block >> 8) as u8, block as u8];
        udp_frame(port, TFTP_PORT, &payload)
    }

    #[test]
    fn tftp_read_reconstructs_file() {
        let root = temp_root("rrq");
        let content: Vec<u8> = (0..1300u32).map(|i| (i * 7) as u8).collect();
        std::fs::write(root.join("boot.bin"), &content).unwrap();

        let mut eth = EthMac::new();
        eth.set_tftp_root(&root);

        eth.process_frame(&tftp_rrq(51000, "boot.bin"));
        let mut received = Vec::new();
        let mut block = 1u16;
        loop {
            let pkt = eth.rx_queue.pop_front().expect("expected DATA block");
            assert_eq!(be16(&pkt, 42), TFTP_DATA);
            assert_eq!(be16(&pkt, 44), block);
            let payload = &pkt[46..];
            received.extend_from_slice(payload);
            eth.process_frame(&tftp_ack_frame(51000, block));
            if payload.len() < 512 {
                break;
            }
            block += 1;
        }

        assert_eq!(received, content);
        assert!(eth.sessions.is_empty());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn tftp_write_flushes_to_disk() {
        let root = temp_root("wrq");
        let mut eth = EthMac::new();
        eth.set_tftp_root(&root);

        let mut payload = vec![0, TFTP_WRQ as u8];
        payload.extend_from_slice(b"sub/dir/out.txt\0octet\0");
        eth.process_frame(&udp_frame(52000, TFTP_PORT, &payload));

        let ack0 = eth.rx_queue.pop_front().unwrap();
        assert_eq!(be16(&ack0, 42), TFTP_ACK);
        assert_eq!(be16(&ack0, 44), 0);

        // one short DATA block completes the transfer
        let mut data = vec![0, TFTP_DATA as u8, 0, 1];
        data.extend_from_slice(b"written via tftp");
        eth.process_frame(&udp_frame(52000, TFTP_PORT, &data));

        let ack1 = eth.rx_queue.pop_front().unwrap();
        assert_eq!(be16(&ack1, 44), 1);
        assert!(eth.sessions.is_empty());
        assert_eq!(
            std::fs::read(root.join("sub/dir/out.txt")).unwrap(),
            b"written via tftp"
        );
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn tftp_rejects_bad_paths_and_missing_files() {
        let root = temp_root("err");
        let mut eth = EthMac::new();
        eth.set_tftp_root(&root);

        eth.process_frame(&tftp_rrq(53000, "../etc/passwd"));
        let err = eth.rx_queue.pop_front().unwrap();
        assert_eq!(be16(&err, 42), TFTP_ERROR);
        assert_eq!(be16(&err, 44), TFTP_ERR_ACCESS);

        eth.process_frame(&tftp_rrq(53001, "no-such-file"));
        let err = eth.rx_queue.pop_front().unwrap();
        assert_eq!(be16(&err, 44), TFTP_ERR_NOT_FOUND);
        assert!(eth.sessions.is_empty());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn tftp_dir_listing() {
        let root = temp_root("dir");
        std::fs::create_dir_all(root.join("nested")).unwrap();
        std::fs::write(root.join("a.txt"), b"12345").unwrap();
        std::fs::write(root.join("nested/b.bin"), b"123").unwrap();

        let mut eth = EthMac::new();
        eth.set_tftp_root(&root);
        eth.process_frame(&tftp_rrq(54000, "/.dir"));

        let pkt = eth.rx_queue.pop_front().unwrap();
        assert_eq!(be16(&pkt, 42), TFTP_DATA);
        let listing = String::from_utf8(pkt[46..].to_vec()).unwrap();
        assert!(listing.contains("a.txt\t5\n"));
        assert!(listing.contains("nested/b.bin\t3\n"));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn tftp_write_accumulates_full_blocks() {
        let root = temp_root("wrq-multi");
        let mut eth = EthMac::new();
        eth.set_tftp_root(&root);

        let mut payload = vec![0, TFTP_WRQ as u8];
        payload.extend_from_slice(b"big.bin\0octet\0");
        eth.process_frame(&udp_frame(52100, TFTP_PORT, &payload));
        eth.rx_queue.pop_front().unwrap(); // ACK 0

        let content: Vec<u8> = (0..700u32).map(|i| i as u8).collect();

        let mut block1 = vec![0, TFTP_DATA as u8, 0, 1];
        block1.extend_from_slice(&content[..512]);
        eth.process_frame(&udp_frame(52100, TFTP_PORT, &block1));
        let ack = eth.rx_queue.pop_front().unwrap();
        assert_eq!(be16(&ack, 44), 1);
        // a full block keeps the session open
        assert!(eth.sessions.contains_key(&52100));

        // a repeated block 1 is ignored (no ACK, no double append)
        eth.process_frame(&udp_frame(52100, TFTP_PORT, &block1));
        assert!(eth.rx_queue.is_empty());

        let mut block2 = vec![0, TFTP_DATA as u8, 0, 2];
        block2.extend_from_slice(&content[512..]);
        eth.process_frame(&udp_frame(52100, TFTP_PORT, &block2));
        let ack = eth.rx_queue.pop_front().unwrap();
        assert_eq!(be16(&ack, 44), 2);

        assert!(eth.sessions.is_empty());
        assert_eq!(std::fs::read(root.join("big.bin")).unwrap(), content);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn dhcp_ignores_replies_and_unknown_types() {
        let mut eth = EthMac::new();

        // BOOTREPLY op is not ours to answer
        let mut reply = dhcp_request_frame(DHCP_DISCOVER, 1);
        reply[42] = 2;
        eth.process_frame(&reply);
        assert!(eth.rx_queue.is_empty());

        // DHCPDECLINE (4) gets no response either
        eth.process_frame(&dhcp_request_frame(4, 1));
        assert!(eth.rx_queue.is_empty());
    }

    #[test]
    fn mac_address_registers_assemble() {
        let mut eth = EthMac::new();
        assert_eq!(eth.mac_address(), [0x00, 0x02, 0x03, 0x04, 0x05, 0x06]);

        eth.write(0x08, Width::Word, 0xFFFF_1122);
        eth.write(0x0C, Width::Word, 0x3344_5566);
        // the high register keeps only 16 bits
        assert_eq!(eth.read(0x08, Width::Word), 0x1122);
        assert_eq!(eth.mac_address(), [0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    }

    #[test]
    fn dmasr_is_write_one_to_clear() {
        let mut eth = EthMac::new();
        eth.dmasr = DMASR_TS | DMASR_RS | DMASR_NIS;
        eth.write(0x14, Width::Word, DMASR_TS);
        assert_eq!(eth.read(0x14, Width::Word), DMASR_RS | DMASR_NIS);
        eth.write(0x14, Width::Word, 0x3F);
        assert_eq!(eth.read(0x14, Width::Word), 0);
    }

    #[test]
    fn descriptor_list_writes_reset_the_cursor() {
        let mut eth = EthMac::new();
        eth.write(0x18, Width::Word, 0x2000_0100);
        eth.write(0x1C, Width::Word, 0x2000_0200);
        assert_eq!(eth.read(0x28, Width::Word), 0x2000_0100);
        assert_eq!(eth.read(0x2C, Width::Word), 0x2000_0200);
    }

    #[test]
    fn non_ip_frames_are_ignored() {
        let mut eth = EthMac::new();
        let mut arp = vec![0u8; 60];
        put_be16(&mut arp, 12, 0x0806);
        eth.process_frame(&arp);
        assert!(eth.rx_queue.is_empty());
    }
}
