//! NFQUEUE client over a raw `NETLINK_NETFILTER` socket.
//!
//! Only the slice of the nfnetlink_queue protocol needed here is spoken:
//! binding a queue in copy-packet mode, receiving packet messages and sending
//! verdicts. Requires CAP_NET_ADMIN.

use std::{
    io::{self, Read},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::mpsc;

use super::{CapturedPacket, QueueError, Verdict, VerdictSink};

const NFNL_SUBSYS_QUEUE: u16 = 3;

const NFQNL_MSG_PACKET: u16 = 0;
const NFQNL_MSG_VERDICT: u16 = 1;
const NFQNL_MSG_CONFIG: u16 = 2;

const NFQNL_CFG_CMD_BIND: u8 = 1;
const NFQNL_CFG_CMD_UNBIND: u8 = 2;
const NFQNL_CFG_CMD_PF_BIND: u8 = 3;
const NFQNL_CFG_CMD_PF_UNBIND: u8 = 4;

const NFQNL_COPY_PACKET: u8 = 2;

const NFQA_PACKET_HDR: u16 = 1;
const NFQA_VERDICT_HDR: u16 = 2;
const NFQA_PAYLOAD: u16 = 10;

const NFQA_CFG_CMD: u16 = 1;
const NFQA_CFG_PARAMS: u16 = 2;
const NFQA_CFG_QUEUE_MAXLEN: u16 = 3;

const NLM_F_REQUEST: u16 = 1;
const NLM_F_ACK: u16 = 4;
const NLMSG_ERROR: u16 = 2;

const NLMSG_HDR_LEN: usize = 16;
const NFGENMSG_LEN: usize = 4;
/// Strips NLA_F_NESTED and NLA_F_NET_BYTEORDER from attribute types.
const NLA_TYPE_MASK: u16 = 0x3fff;

/// Room for the netlink header and packet metadata attributes around the copied payload.
const RECV_OVERHEAD: usize = 4096;
const SOCKET_RCVBUF: usize = 1024 * 1024;
/// Lets the reader thread notice a closed channel while the queue is idle.
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// A bound NFQUEUE.
pub struct NfQueue {
    socket: Socket,
    queue_num: u16,
    recv_buf_len: usize,
    seq: AtomicU32,
}

impl NfQueue {
    /// Binds queue `queue_num` in copy-packet mode.
    ///
    /// # Arguments
    /// * `queue_num` - Netfilter queue number the capture rules point at
    /// * `max_len` - Maximum number of packets the kernel keeps waiting for a verdict
    /// * `copy_range` - Number of packet bytes copied to user space
    pub fn open(queue_num: u16, max_len: u32, copy_range: u32) -> Result<Self, QueueError> {
        let socket = Socket::new(
            Domain::from(libc::AF_NETLINK),
            Type::RAW,
            Some(Protocol::from(libc::NETLINK_NETFILTER)),
        )?;
        socket.set_recv_buffer_size(SOCKET_RCVBUF)?;

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let rc = unsafe {
            libc::bind(
                std::os::fd::AsRawFd::as_raw_fd(&socket),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let queue = NfQueue {
            socket,
            queue_num,
            recv_buf_len: recv_buf_len(copy_range),
            seq: AtomicU32::new(0),
        };

        let af_inet = libc::AF_INET as u16;
        // Unbinding first clears a handler left over by a previous process.
        queue.config_request(0, &cmd_attr(NFQNL_CFG_CMD_PF_UNBIND, af_inet))?;
        queue.config_request(0, &cmd_attr(NFQNL_CFG_CMD_PF_BIND, af_inet))?;
        queue.config_request(queue_num, &cmd_attr(NFQNL_CFG_CMD_BIND, 0))?;

        let mut params = Vec::with_capacity(5);
        params.extend_from_slice(&copy_range.to_be_bytes());
        params.push(NFQNL_COPY_PACKET);
        queue.config_request(queue_num, &nlattr(NFQA_CFG_PARAMS, &params))?;
        queue.config_request(
            queue_num,
            &nlattr(NFQA_CFG_QUEUE_MAXLEN, &max_len.to_be_bytes()),
        )?;

        log::info!(
            "NFQUEUE {} bound (max_len={}, copy_range={})",
            queue_num,
            max_len,
            copy_range
        );
        Ok(queue)
    }

    /// Returns the bound queue number.
    pub fn queue_num(&self) -> u16 {
        self.queue_num
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn config_request(&self, res_id: u16, attrs: &[u8]) -> Result<(), QueueError> {
        let seq = self.next_seq();
        let msg = nlmsg(
            NFQNL_MSG_CONFIG,
            NLM_F_REQUEST | NLM_F_ACK,
            seq,
            res_id,
            attrs,
        );
        self.socket.send(&msg)?;
        self.recv_ack()
    }

    fn recv_ack(&self) -> Result<(), QueueError> {
        let mut buf = [0u8; 1024];
        let n = (&self.socket).read(&mut buf)?;
        let buf = &buf[..n];
        if buf.len() < NLMSG_HDR_LEN {
            return Err(QueueError::Malformed("short netlink ack"));
        }
        let msg_type = u16::from_ne_bytes([buf[4], buf[5]]);
        if msg_type == NLMSG_ERROR {
            let Some(code) = buf.get(16..20) else {
                return Err(QueueError::Malformed("short netlink error"));
            };
            let code = i32::from_ne_bytes([code[0], code[1], code[2], code[3]]);
            if code != 0 {
                return Err(QueueError::Netlink(code));
            }
        }
        Ok(())
    }

    /// Waits for the next batch of packets.
    ///
    /// Returns an empty batch when the read timeout elapses without traffic.
    pub fn recv(&self) -> Result<Vec<CapturedPacket>, QueueError> {
        let mut buf = vec![0u8; self.recv_buf_len];
        match (&self.socket).read(&mut buf) {
            Ok(n) => Ok(parse_messages(&buf[..n])),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Starts a reader thread forwarding captured packets into `tx`.
    ///
    /// The thread exits once the receiving side of `tx` is dropped, and with it
    /// the last reference to the queue, which unbinds it.
    pub fn spawn_reader(
        self: Arc<Self>,
        tx: mpsc::Sender<CapturedPacket>,
    ) -> io::Result<thread::JoinHandle<()>> {
        self.socket.set_read_timeout(Some(READ_TIMEOUT))?;
        thread::Builder::new()
            .name(format!("nfqueue-{}", self.queue_num))
            .spawn(move || {
                log::debug!("NFQUEUE {} reader started", self.queue_num);
                'outer: while !tx.is_closed() {
                    let batch = match self.recv() {
                        Ok(batch) => batch,
                        Err(e) if is_overrun(&e) => {
                            log::warn!("NFQUEUE {} overrun, kernel dropped messages", self.queue_num);
                            continue;
                        }
                        Err(e) => {
                            log::error!("NFQUEUE {} receive failed: {}", self.queue_num, e);
                            break;
                        }
                    };
                    for packet in batch {
                        if tx.blocking_send(packet).is_err() {
                            break 'outer;
                        }
                    }
                }
                log::debug!("NFQUEUE {} reader stopped", self.queue_num);
            })
    }
}

impl VerdictSink for NfQueue {
    fn set_verdict(&self, id: u32, verdict: Verdict) -> Result<(), QueueError> {
        let mut hdr = Vec::with_capacity(8);
        hdr.extend_from_slice(&(verdict as u32).to_be_bytes());
        hdr.extend_from_slice(&id.to_be_bytes());
        let msg = nlmsg(
            NFQNL_MSG_VERDICT,
            NLM_F_REQUEST,
            self.next_seq(),
            self.queue_num,
            &nlattr(NFQA_VERDICT_HDR, &hdr),
        );
        self.socket.send(&msg)?;
        Ok(())
    }
}

impl Drop for NfQueue {
    fn drop(&mut self) {
        let msg = nlmsg(
            NFQNL_MSG_CONFIG,
            NLM_F_REQUEST,
            self.next_seq(),
            self.queue_num,
            &cmd_attr(NFQNL_CFG_CMD_UNBIND, 0),
        );
        if let Err(e) = self.socket.send(&msg) {
            log::warn!("NFQUEUE {} unbind failed: {}", self.queue_num, e);
        } else {
            log::info!("NFQUEUE {} released", self.queue_num);
        }
    }
}

/// Builds an nfnetlink queue message: nlmsghdr + nfgenmsg + attributes.
fn nlmsg(msg: u16, flags: u16, seq: u32, res_id: u16, attrs: &[u8]) -> Vec<u8> {
    let len = NLMSG_HDR_LEN + NFGENMSG_LEN + attrs.len();
    let mut buf = Vec::with_capacity(len);
    buf.extend_from_slice(&(len as u32).to_ne_bytes());
    buf.extend_from_slice(&((NFNL_SUBSYS_QUEUE << 8) | msg).to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes()); // port id, kernel fills it
    buf.push(libc::AF_UNSPEC as u8);
    buf.push(0); // NFNETLINK_V0
    buf.extend_from_slice(&res_id.to_be_bytes());
    buf.extend_from_slice(attrs);
    buf
}

/// Builds a netlink attribute padded to 4 bytes.
fn nlattr(attr_type: u16, data: &[u8]) -> Vec<u8> {
    let len = 4 + data.len();
    let mut buf = Vec::with_capacity(align4(len));
    buf.extend_from_slice(&(len as u16).to_ne_bytes());
    buf.extend_from_slice(&attr_type.to_ne_bytes());
    buf.extend_from_slice(data);
    buf.resize(align4(len), 0);
    buf
}

fn cmd_attr(cmd: u8, pf: u16) -> Vec<u8> {
    let pf = pf.to_be_bytes();
    nlattr(NFQA_CFG_CMD, &[cmd, 0, pf[0], pf[1]])
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

fn recv_buf_len(copy_range: u32) -> usize {
    copy_range as usize + RECV_OVERHEAD
}

/// ENOBUFS: the socket buffer overflowed. The socket stays usable.
fn is_overrun(e: &QueueError) -> bool {
    matches!(e, QueueError::Io(e) if e.raw_os_error() == Some(libc::ENOBUFS))
}

/// Extracts every queued packet from a netlink datagram.
///
/// A malformed message is logged and skipped; packets parsed before and after
/// it are kept. A message cut short by the datagram end is parsed as far as
/// it goes, so its packet id (and with it a verdict) is not lost.
fn parse_messages(mut buf: &[u8]) -> Vec<CapturedPacket> {
    let mut packets = Vec::new();
    while buf.len() >= NLMSG_HDR_LEN {
        let len = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len < NLMSG_HDR_LEN {
            log::warn!("NFQUEUE message with bad length {}, dropping rest of batch", len);
            break;
        }
        let truncated = len > buf.len();
        let end = len.min(buf.len());
        let msg_type = u16::from_ne_bytes([buf[4], buf[5]]);
        let body = &buf[NLMSG_HDR_LEN..end];

        if msg_type == (NFNL_SUBSYS_QUEUE << 8) | NFQNL_MSG_PACKET {
            match parse_packet(body) {
                Ok(packet) => {
                    if truncated {
                        log::warn!("NFQUEUE packet {} truncated by receive buffer", packet.id);
                    }
                    packets.push(packet);
                }
                Err(e) => log::warn!("NFQUEUE packet message skipped: {}", e),
            }
        } else if msg_type == NLMSG_ERROR {
            if let Some(code) = body.get(0..4) {
                let code = i32::from_ne_bytes([code[0], code[1], code[2], code[3]]);
                if code != 0 {
                    log::warn!("NFQUEUE request rejected by kernel: {}", code);
                }
            }
        }

        if truncated {
            break;
        }
        buf = &buf[align4(len).min(buf.len())..];
    }
    packets
}

fn parse_packet(body: &[u8]) -> Result<CapturedPacket, QueueError> {
    let mut attrs = body
        .get(NFGENMSG_LEN..)
        .ok_or(QueueError::Malformed("missing nfgenmsg"))?;

    let mut id = None;
    let mut data = Vec::new();
    while attrs.len() >= 4 {
        let len = u16::from_ne_bytes([attrs[0], attrs[1]]) as usize;
        let attr_type = u16::from_ne_bytes([attrs[2], attrs[3]]) & NLA_TYPE_MASK;
        if len < 4 {
            break;
        }
        // A cut-off payload attribute still yields what was received.
        let value = &attrs[4..len.min(attrs.len())];
        match attr_type {
            NFQA_PACKET_HDR if value.len() >= 4 => {
                id = Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
            }
            NFQA_PAYLOAD => data = value.to_vec(),
            _ => {}
        }
        attrs = &attrs[align4(len).min(attrs.len())..];
    }

    let id = id.ok_or(QueueError::Malformed("packet without header"))?;
    Ok(CapturedPacket { id, data })
}
