//! Kernel-assisted PID attribution.
//!
//! A tracepoint program — assembled at runtime from BTF-resolved field
//! offsets — watches `sock:inet_sock_set_state` for sockets entering
//! ESTABLISHED on the HTTP ports and records `(4-tuple → pid)` in a
//! shared LRU hash map, under both flow directions. User space probes
//! that map by flow tuple; a miss is reported as pid 0, never an error.
//!
//! Different kernel versions expose the tracepoint's port fields in
//! different byte orders, so the in-kernel filter matches both orderings
//! and the userspace lookup composes a network-order and a host-order
//! candidate key.

mod btf;
mod insn;
mod sys;

use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};

use thiserror::Error;
use tracing::debug;

pub use btf::BtfError;
pub use insn::InsnError;
pub use sys::ProgLoadError;

use insn::{helpers, ProgramBuilder, Reg, Size};

const TRACEPOINT_STRUCT: &str = "trace_event_raw_inet_sock_set_state";
const TRACEPOINT_CATEGORY: &str = "sock";
const TRACEPOINT_NAME: &str = "inet_sock_set_state";

const MAP_NAME: &str = "flow_pid_map";
const MAP_MAX_ENTRIES: u32 = 65_535;

const AF_INET: i32 = 2;
const TCP_ESTABLISHED: i32 = 1;

const HTTP_PORT_HOST: i32 = 80;
const HTTP_PORT_NET: i32 = 0x5000;
const ALT_PORT_HOST: i32 = 8080;
const ALT_PORT_NET: i32 = 0x901F;

// Stack layout inside the tracepoint program: 16-byte key below the
// 4-byte value, both relative to the frame pointer.
const KEY_OFFSET: i16 = -32;
const VALUE_OFFSET: i16 = -16;

#[derive(Debug, Error)]
pub enum PidMapError {
    #[error("raising the locked-memory limit failed: {0}")]
    Memlock(#[source] io::Error),

    #[error("kernel type info unavailable: {0}")]
    Btf(#[from] BtfError),

    #[error("creating {MAP_NAME} failed: {0}")]
    MapCreate(#[source] io::Error),

    #[error("assembling the tracepoint program failed: {0}")]
    Assemble(#[from] InsnError),

    #[error(transparent)]
    ProgLoad(#[from] ProgLoadError),

    #[error("tracepoint {TRACEPOINT_CATEGORY}:{TRACEPOINT_NAME} unavailable: {0}")]
    TracepointId(#[source] io::Error),

    #[error("attaching to {TRACEPOINT_CATEGORY}:{TRACEPOINT_NAME} failed: {0}")]
    Attach(#[source] io::Error),

    #[error("closing kernel handles failed: {0}")]
    Close(#[source] io::Error),
}

/// Key layout of `flow_pid_map`, shared with the tracepoint program.
/// IP words hold the four network-order address bytes read natively;
/// port fields carry whatever byte order the kernel exposed.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FlowMapKey {
    src_ip: u32,
    dst_ip: u32,
    src_port: u16,
    dst_port: u16,
    pad: u32,
}

/// Byte offsets of the tracepoint record fields, resolved from BTF.
#[derive(Debug, Clone, Copy)]
struct FieldOffsets {
    family: i16,
    newstate: i16,
    sport: i16,
    dport: i16,
    saddr: i16,
    daddr: i16,
}

/// Owns the kernel handles backing PID attribution. Dropping (or
/// [`close`](Self::close)-ing) detaches the tracepoint, then releases the
/// program, then the map — field order below is the teardown order.
pub struct PidResolver {
    event: OwnedFd,
    prog: OwnedFd,
    map: OwnedFd,
}

impl PidResolver {
    /// Load and attach the resolver. Every failure here is fatal to the
    /// resolver only; callers degrade to pid 0 attribution.
    pub fn new() -> Result<Self, PidMapError> {
        sys::raise_memlock_limit().map_err(PidMapError::Memlock)?;

        let btf = btf::Btf::from_sys_fs()?;
        let offsets = resolve_offsets(&btf)?;

        let map = sys::create_lru_hash(
            MAP_NAME,
            std::mem::size_of::<FlowMapKey>() as u32,
            std::mem::size_of::<u32>() as u32,
            MAP_MAX_ENTRIES,
        )
        .map_err(PidMapError::MapCreate)?;

        let program = build_program(map.as_raw_fd(), &offsets)?;
        let prog = sys::load_tracepoint_program(&program)?;

        let id = sys::tracepoint_id(TRACEPOINT_CATEGORY, TRACEPOINT_NAME)
            .map_err(PidMapError::TracepointId)?;
        let event =
            sys::attach_tracepoint(prog.as_raw_fd(), id).map_err(PidMapError::Attach)?;

        debug!(
            tracepoint = TRACEPOINT_NAME,
            insns = program.len(),
            ?offsets,
            "pid resolver attached"
        );
        Ok(Self { event, prog, map })
    }

    /// Best-effort PID for a flow; 0 on miss. The network-order key is
    /// probed first, then the host-order one.
    pub fn lookup(
        &self,
        src_ip: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
    ) -> u32 {
        let key_net = make_key_net(src_ip, src_port, dst_ip, dst_port);
        match sys::map_lookup::<FlowMapKey, u32>(self.map.as_raw_fd(), &key_net) {
            Ok(Some(pid)) => return pid,
            Ok(None) => {}
            Err(err) => debug!(%err, "flow map lookup failed"),
        }

        let key_host = make_key_host(src_ip, src_port, dst_ip, dst_port);
        match sys::map_lookup::<FlowMapKey, u32>(self.map.as_raw_fd(), &key_host) {
            Ok(Some(pid)) => pid,
            Ok(None) => 0,
            Err(err) => {
                debug!(%err, "flow map lookup failed");
                0
            }
        }
    }

    /// Tear down in attach-reverse order, reporting the first close error.
    /// Dropping the resolver does the same teardown, ignoring errors.
    pub fn close(self) -> Result<(), PidMapError> {
        let Self { event, prog, map } = self;
        let mut first_err = None;
        for fd in [event, prog, map] {
            let raw = fd.into_raw_fd();
            if unsafe { libc::close(raw) } != 0 && first_err.is_none() {
                first_err = Some(io::Error::last_os_error());
            }
        }
        match first_err {
            Some(err) => Err(PidMapError::Close(err)),
            None => Ok(()),
        }
    }
}

fn resolve_offsets(btf: &btf::Btf) -> Result<FieldOffsets, PidMapError> {
    let offsets = btf.struct_member_offsets(
        TRACEPOINT_STRUCT,
        &["family", "newstate", "sport", "dport", "saddr", "daddr"],
    )?;
    Ok(FieldOffsets {
        family: offsets[0] as i16,
        newstate: offsets[1] as i16,
        sport: offsets[2] as i16,
        dport: offsets[3] as i16,
        saddr: offsets[4] as i16,
        daddr: offsets[5] as i16,
    })
}

/// Store the 16-byte key at `KEY_OFFSET`: `{src word, dst word, src port,
/// dst port, zero pad}` from the given registers.
fn store_key(p: &mut ProgramBuilder, src_word: Reg, dst_word: Reg, src_port: Reg, dst_port: Reg) {
    p.store(Size::Word, Reg::R10, KEY_OFFSET, src_word);
    p.store(Size::Word, Reg::R10, KEY_OFFSET + 4, dst_word);
    p.store(Size::Half, Reg::R10, KEY_OFFSET + 8, src_port);
    p.store(Size::Half, Reg::R10, KEY_OFFSET + 10, dst_port);
    p.store_imm(Size::Word, Reg::R10, KEY_OFFSET + 12, 0);
}

/// `flow_pid_map[key @ fp-32] = value @ fp-16`.
fn emit_upsert(p: &mut ProgramBuilder, map_fd: RawFd) {
    p.load_map_fd(Reg::R1, map_fd);
    p.mov_reg(Reg::R2, Reg::R10);
    p.add_imm(Reg::R2, KEY_OFFSET as i32);
    p.mov_reg(Reg::R3, Reg::R10);
    p.add_imm(Reg::R3, VALUE_OFFSET as i32);
    p.mov_imm(Reg::R4, 0); // BPF_ANY
    p.call(helpers::MAP_UPDATE_ELEM);
}

/// Assemble the tracepoint program against the resolved field offsets.
fn build_program(map_fd: RawFd, off: &FieldOffsets) -> Result<Vec<insn::Insn>, InsnError> {
    let mut p = ProgramBuilder::new();
    let exit = p.new_label();
    let matched = p.new_label();

    // r6 = ctx; keep it across helper calls.
    p.mov_reg(Reg::R6, Reg::R1);

    p.load(Size::Half, Reg::R1, Reg::R6, off.family);
    p.jump_ne_imm(Reg::R1, AF_INET, exit);
    p.load(Size::Word, Reg::R1, Reg::R6, off.newstate);
    p.jump_ne_imm(Reg::R1, TCP_ESTABLISHED, exit);

    // Either port, in either byte order, on either side of the flow.
    p.load(Size::Half, Reg::R2, Reg::R6, off.sport);
    p.load(Size::Half, Reg::R3, Reg::R6, off.dport);
    for port in [HTTP_PORT_NET, HTTP_PORT_HOST, ALT_PORT_NET, ALT_PORT_HOST] {
        p.jump_eq_imm(Reg::R2, port, matched);
    }
    for port in [HTTP_PORT_NET, HTTP_PORT_HOST, ALT_PORT_NET, ALT_PORT_HOST] {
        p.jump_eq_imm(Reg::R3, port, matched);
    }
    p.jump(exit);

    p.bind(matched);
    p.load(Size::Word, Reg::R4, Reg::R6, off.saddr);
    p.load(Size::Word, Reg::R5, Reg::R6, off.daddr);
    store_key(&mut p, Reg::R4, Reg::R5, Reg::R2, Reg::R3);

    // value = tgid (upper half of pid_tgid)
    p.call(helpers::GET_CURRENT_PID_TGID);
    p.rsh_imm(Reg::R0, 32);
    p.store(Size::Word, Reg::R10, VALUE_OFFSET, Reg::R0);

    emit_upsert(&mut p, map_fd);

    // The helper call clobbered r1-r5; reload and upsert the reversed
    // key so lookups from either flow direction hit.
    p.load(Size::Half, Reg::R2, Reg::R6, off.sport);
    p.load(Size::Half, Reg::R3, Reg::R6, off.dport);
    p.load(Size::Word, Reg::R4, Reg::R6, off.saddr);
    p.load(Size::Word, Reg::R5, Reg::R6, off.daddr);
    store_key(&mut p, Reg::R5, Reg::R4, Reg::R3, Reg::R2);
    emit_upsert(&mut p, map_fd);

    p.bind(exit);
    p.mov_imm(Reg::R0, 0);
    p.exit();

    p.build()
}

/// Swap a 16-bit port between host and network byte order. Involution:
/// applying it twice returns the input.
fn to_net_port(port: u16) -> u16 {
    port.swap_bytes()
}

fn make_key(src_ip: Ipv4Addr, src_port: u16, dst_ip: Ipv4Addr, dst_port: u16) -> FlowMapKey {
    FlowMapKey {
        // Network-order address bytes, read as a native integer — the
        // same value the kernel program stored from the raw record.
        src_ip: u32::from_ne_bytes(src_ip.octets()),
        dst_ip: u32::from_ne_bytes(dst_ip.octets()),
        src_port,
        dst_port,
        pad: 0,
    }
}

/// Candidate key with ports in network byte order.
fn make_key_net(src_ip: Ipv4Addr, src_port: u16, dst_ip: Ipv4Addr, dst_port: u16) -> FlowMapKey {
    make_key(src_ip, to_net_port(src_port), dst_ip, to_net_port(dst_port))
}

/// Candidate key with ports in host byte order.
fn make_key_host(src_ip: Ipv4Addr, src_port: u16, dst_ip: Ipv4Addr, dst_port: u16) -> FlowMapKey {
    make_key(src_ip, src_port, dst_ip, dst_port)
}
