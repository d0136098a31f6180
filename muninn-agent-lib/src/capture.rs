//! AF_PACKET packet source with a TPACKET_V3 mmap ring.
//!
//! The kernel writes captured frames into a shared memory ring grouped
//! into blocks; user space flips each block's status word back to the
//! kernel when it is done with it. Frames returned by
//! [`RingCapture::next_frame`] borrow the ring directly, so a frame is
//! valid only until the next call — the borrow checker enforces exactly
//! that lifetime.

use std::ffi::CString;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::filter::FilterProgram;

pub const DEFAULT_SNAPLEN: u32 = 65_535;

const PACKET_VERSION: libc::c_int = 10;
const PACKET_RX_RING: libc::c_int = 5;
const TPACKET_V3: libc::c_int = 2;

const TP_STATUS_KERNEL: u32 = 0;
const TP_STATUS_USER: u32 = 1;

const DEFAULT_BLOCK_SIZE: u32 = 1 << 20;
const BLOCK_COUNT: u32 = 64;
const POLL_TIMEOUT_MS: libc::c_int = 250;

/// Offset of `tpacket_hdr_v1` inside `tpacket_block_desc`
/// (after `version` and `offset_to_priv`).
const BLOCK_HDR_OFFSET: usize = 8;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("opening the packet socket requires CAP_NET_RAW or root: {0}")]
    PermissionDenied(#[source] io::Error),

    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("capture cancelled")]
    Cancelled,

    #[error("packet ring setup failed: {0}")]
    Setup(#[source] io::Error),

    #[error("installing the socket filter failed: {0}")]
    Filter(#[source] io::Error),

    #[error("polling the packet ring failed: {0}")]
    Poll(#[source] io::Error),
}

/// `struct tpacket_req3` from `<linux/if_packet.h>`.
#[repr(C)]
struct TpacketReq3 {
    tp_block_size: u32,
    tp_block_nr: u32,
    tp_frame_size: u32,
    tp_frame_nr: u32,
    tp_retire_blk_tov: u32,
    tp_sizeof_priv: u32,
    tp_feature_req_word: u32,
}

/// `struct tpacket_hdr_v1` — the live part of a block descriptor.
#[repr(C)]
struct TpacketHdrV1 {
    block_status: u32,
    num_pkts: u32,
    offset_to_first_pkt: u32,
    blk_len: u32,
    seq_num: u64,
    ts_first_pkt_sec: u32,
    ts_first_pkt_nsec: u32,
    ts_last_pkt_sec: u32,
    ts_last_pkt_nsec: u32,
}

/// Leading fields of `struct tpacket3_hdr`; the per-packet trailer
/// (rxhash, vlan) is not read.
#[repr(C)]
struct Tpacket3Hdr {
    tp_next_offset: u32,
    tp_sec: u32,
    tp_nsec: u32,
    tp_snaplen: u32,
    tp_len: u32,
    tp_status: u32,
    tp_mac: u16,
    tp_net: u16,
}

/// Capture metadata accompanying a frame.
#[derive(Debug, Clone, Copy)]
pub struct CaptureInfo {
    pub timestamp: DateTime<Utc>,
    /// Length of the frame on the wire (may exceed the captured bytes).
    pub wire_length: u64,
}

/// One captured frame, borrowed from the ring. Invalidated by the next
/// [`RingCapture::next_frame`] call.
#[derive(Debug)]
pub struct Frame<'a> {
    pub data: &'a [u8],
    pub info: CaptureInfo,
}

#[derive(Debug)]
struct BlockCursor {
    block: u32,
    next_offset: u32,
    remaining: u32,
}

/// A TPACKET_V3 receive ring bound to one interface (or all of them).
#[derive(Debug)]
pub struct RingCapture {
    fd: libc::c_int,
    ring: *mut u8,
    ring_len: usize,
    block_size: u32,
    block_nr: u32,
    next_block: u32,
    cursor: Option<BlockCursor>,
    closed: bool,
}

// The ring pointer is owned by this struct; the kernel side of the
// protocol is per-socket, so moving the whole capture across threads is
// sound. It is not Sync — next_frame requires &mut.
unsafe impl Send for RingCapture {}

/// Ring geometry derived from the snap length: frame size is the next
/// power of two clamped to [2048, 65536]; blocks are 1 MiB unless that
/// does not divide evenly, in which case 16 frames per block.
fn ring_layout(snaplen: u32) -> TpacketReq3 {
    let frame_size = snaplen.next_power_of_two().clamp(2048, 1 << 16);
    let mut block_size = DEFAULT_BLOCK_SIZE;
    if block_size % frame_size != 0 {
        block_size = frame_size * 16;
    }
    TpacketReq3 {
        tp_block_size: block_size,
        tp_block_nr: BLOCK_COUNT,
        tp_frame_size: frame_size,
        tp_frame_nr: block_size / frame_size * BLOCK_COUNT,
        tp_retire_blk_tov: POLL_TIMEOUT_MS as u32,
        tp_sizeof_priv: 0,
        tp_feature_req_word: 0,
    }
}

impl RingCapture {
    /// Open the ring on `interface`; `"any"` skips interface binding and
    /// captures on every device.
    pub fn open(interface: &str, snaplen: u32) -> Result<Self, CaptureError> {
        let ifindex = if interface == "any" {
            0
        } else {
            let name = CString::new(interface)
                .map_err(|_| CaptureError::InterfaceNotFound(interface.to_string()))?;
            let idx = unsafe { libc::if_nametoindex(name.as_ptr()) };
            if idx == 0 {
                return Err(CaptureError::InterfaceNotFound(interface.to_string()));
            }
            idx as libc::c_int
        };

        let protocol = (libc::ETH_P_ALL as u16).to_be() as libc::c_int;
        let fd = unsafe {
            libc::socket(libc::AF_PACKET, libc::SOCK_RAW | libc::SOCK_CLOEXEC, protocol)
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EPERM) | Some(libc::EACCES) => CaptureError::PermissionDenied(err),
                _ => CaptureError::Setup(err),
            });
        }

        let req = ring_layout(snaplen);
        let mut capture = RingCapture {
            fd,
            ring: std::ptr::null_mut(),
            ring_len: (req.tp_block_size * req.tp_block_nr) as usize,
            block_size: req.tp_block_size,
            block_nr: req.tp_block_nr,
            next_block: 0,
            cursor: None,
            closed: false,
        };
        // From here on, Drop closes the socket (and unmaps the ring once
        // it exists) on every error path.
        capture.setup_ring(&req)?;
        capture.bind(ifindex, interface)?;
        Ok(capture)
    }

    fn setup_ring(&mut self, req: &TpacketReq3) -> Result<(), CaptureError> {
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_PACKET,
                PACKET_VERSION,
                &TPACKET_V3 as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(CaptureError::Setup(io::Error::last_os_error()));
        }

        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_PACKET,
                PACKET_RX_RING,
                req as *const _ as *const libc::c_void,
                std::mem::size_of::<TpacketReq3>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(CaptureError::Setup(io::Error::last_os_error()));
        }

        let ring = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                self.ring_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                0,
            )
        };
        if ring == libc::MAP_FAILED {
            return Err(CaptureError::Setup(io::Error::last_os_error()));
        }
        self.ring = ring as *mut u8;
        Ok(())
    }

    fn bind(&mut self, ifindex: libc::c_int, interface: &str) -> Result<(), CaptureError> {
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
        addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        addr.sll_ifindex = ifindex;

        let rc = unsafe {
            libc::bind(
                self.fd,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENODEV) => CaptureError::InterfaceNotFound(interface.to_string()),
                Some(libc::EPERM) | Some(libc::EACCES) => CaptureError::PermissionDenied(err),
                _ => CaptureError::Setup(err),
            });
        }
        Ok(())
    }

    /// Install `program` as the socket's cBPF filter, atomically replacing
    /// any previous one. Frames already queued in the ring are unaffected.
    pub fn set_filter(&self, program: &FilterProgram) -> Result<(), CaptureError> {
        let prog = libc::sock_fprog {
            len: program.len() as libc::c_ushort,
            filter: program.instructions().as_ptr() as *mut libc::sock_filter,
        };
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &prog as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(CaptureError::Filter(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Block until the next frame arrives, the token is cancelled, or the
    /// socket fails. Poll timeouts are looped over internally — the caller
    /// never sees them.
    pub fn next_frame(&mut self, cancel: &CancellationToken) -> Result<Frame<'_>, CaptureError> {
        let (data_offset, captured_len, info) = loop {
            match self.cursor.take() {
                Some(cursor) if cursor.remaining == 0 => {
                    // Hand the drained block back to the kernel. Deferred
                    // until here so the previously returned frame stayed
                    // valid across the caller's borrow.
                    self.block_status(cursor.block)
                        .store(TP_STATUS_KERNEL, Ordering::Release);
                }
                Some(mut cursor) => {
                    let packet_offset = cursor.block as usize * self.block_size as usize
                        + cursor.next_offset as usize;
                    let hdr = unsafe {
                        std::ptr::read_unaligned(self.ring.add(packet_offset) as *const Tpacket3Hdr)
                    };
                    cursor.remaining -= 1;
                    cursor.next_offset += hdr.tp_next_offset;
                    self.cursor = Some(cursor);

                    let timestamp = DateTime::from_timestamp(hdr.tp_sec as i64, hdr.tp_nsec)
                        .unwrap_or_else(Utc::now);
                    break (
                        packet_offset + hdr.tp_mac as usize,
                        hdr.tp_snaplen as usize,
                        CaptureInfo {
                            timestamp,
                            wire_length: hdr.tp_len as u64,
                        },
                    );
                }
                None => self.acquire_block(cancel)?,
            }
        };

        let data = unsafe { std::slice::from_raw_parts(self.ring.add(data_offset), captured_len) };
        Ok(Frame { data, info })
    }

    /// Wait for the next ring block to be released to user space.
    fn acquire_block(&mut self, cancel: &CancellationToken) -> Result<(), CaptureError> {
        loop {
            if cancel.is_cancelled() {
                return Err(CaptureError::Cancelled);
            }

            if self.block_status(self.next_block).load(Ordering::Acquire) & TP_STATUS_USER != 0 {
                let hdr_offset =
                    self.next_block as usize * self.block_size as usize + BLOCK_HDR_OFFSET;
                let hdr = unsafe {
                    std::ptr::read_unaligned(self.ring.add(hdr_offset) as *const TpacketHdrV1)
                };
                self.cursor = Some(BlockCursor {
                    block: self.next_block,
                    next_offset: hdr.offset_to_first_pkt,
                    remaining: hdr.num_pkts,
                });
                self.next_block = (self.next_block + 1) % self.block_nr;
                return Ok(());
            }

            let mut pfd = libc::pollfd {
                fd: self.fd,
                events: libc::POLLIN | libc::POLLERR,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, POLL_TIMEOUT_MS) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(CaptureError::Poll(err));
            }
            // rc == 0 is the poll timeout: loop to re-check cancellation.
        }
    }

    /// The block's kernel/user status word, shared with the kernel.
    fn block_status(&self, block: u32) -> &AtomicU32 {
        let offset = block as usize * self.block_size as usize + BLOCK_HDR_OFFSET;
        unsafe { &*(self.ring.add(offset) as *const AtomicU32) }
    }

    /// Release the ring and socket. Idempotent; also runs on Drop.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if !self.ring.is_null() {
            unsafe {
                libc::munmap(self.ring as *mut libc::c_void, self.ring_len);
            }
            self.ring = std::ptr::null_mut();
        }
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl Drop for RingCapture {
    fn drop(&mut self) {
        self.close();
    }
}
