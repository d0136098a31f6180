//! Thin wrappers over the `bpf(2)` and `perf_event_open(2)` syscalls.
//!
//! `libc` exposes the syscall numbers but not the attribute unions, so the
//! per-command attribute structs are declared here with the kernel's
//! layout. Each wrapper passes only the prefix of `union bpf_attr` that
//! its command reads.

use std::ffi::CStr;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use thiserror::Error;

use super::insn::Insn;

const BPF_MAP_CREATE: libc::c_long = 0;
const BPF_MAP_LOOKUP_ELEM: libc::c_long = 1;
const BPF_PROG_LOAD: libc::c_long = 5;

const BPF_MAP_TYPE_LRU_HASH: u32 = 9;
const BPF_PROG_TYPE_TRACEPOINT: u32 = 5;

const BPF_OBJ_NAME_LEN: usize = 16;

const PERF_TYPE_TRACEPOINT: u32 = 2;
const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

// _IO('$', 0) and _IOW('$', 8, u32).
const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_EVENT_IOC_SET_BPF: libc::c_ulong = 0x4004_2408;

#[derive(Debug, Error)]
#[error("the eBPF verifier rejected the program: {err}{log}")]
pub struct ProgLoadError {
    #[source]
    pub err: io::Error,
    /// Verifier log (prefixed with a newline when non-empty).
    pub log: String,
}

/// Prefix of `union bpf_attr` used by BPF_MAP_CREATE.
#[repr(C)]
struct MapCreateAttr {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
    inner_map_fd: u32,
    numa_node: u32,
    map_name: [u8; BPF_OBJ_NAME_LEN],
}

/// Prefix of `union bpf_attr` used by BPF_MAP_LOOKUP_ELEM.
#[repr(C)]
struct MapLookupAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

/// Prefix of `union bpf_attr` used by BPF_PROG_LOAD.
#[repr(C)]
struct ProgLoadAttr {
    prog_type: u32,
    insn_cnt: u32,
    insns: u64,
    license: u64,
    log_level: u32,
    log_size: u32,
    log_buf: u64,
    kern_version: u32,
    prog_flags: u32,
    prog_name: [u8; BPF_OBJ_NAME_LEN],
    prog_ifindex: u32,
    expected_attach_type: u32,
}

/// Subset of `struct perf_event_attr` (PERF_ATTR_SIZE_VER5, 112 bytes).
#[repr(C)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    _reserved_2: u16,
}

fn bpf<T>(cmd: libc::c_long, attr: &mut T) -> libc::c_long {
    unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *mut T as *mut libc::c_void,
            std::mem::size_of::<T>() as u32,
        )
    }
}

/// Remove the locked-memory limit so map and program allocations are not
/// charged against the default (tiny) RLIMIT_MEMLOCK on pre-5.11 kernels.
pub fn raise_memlock_limit() -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &limit) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Create an LRU hash map; the kernel evicts the coldest entry on
/// overflow instead of failing the insert.
pub fn create_lru_hash(
    name: &str,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
) -> io::Result<OwnedFd> {
    let mut attr = MapCreateAttr {
        map_type: BPF_MAP_TYPE_LRU_HASH,
        key_size,
        value_size,
        max_entries,
        map_flags: 0,
        inner_map_fd: 0,
        numa_node: 0,
        map_name: [0; BPF_OBJ_NAME_LEN],
    };
    // Object names are informational; truncate to the kernel's limit,
    // keeping the trailing NUL.
    for (dst, src) in attr.map_name[..BPF_OBJ_NAME_LEN - 1]
        .iter_mut()
        .zip(name.bytes())
    {
        *dst = src;
    }

    let fd = bpf(BPF_MAP_CREATE, &mut attr);
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

/// Load `insns` as a tracepoint program under the GPL license.
///
/// On rejection the load is retried with a verifier log buffer so the
/// error carries the kernel's explanation.
pub fn load_tracepoint_program(insns: &[Insn]) -> Result<OwnedFd, ProgLoadError> {
    // Map helpers require a GPL-compatible license.
    static LICENSE: &CStr = c"GPL";

    let mut attr = ProgLoadAttr {
        prog_type: BPF_PROG_TYPE_TRACEPOINT,
        insn_cnt: insns.len() as u32,
        insns: insns.as_ptr() as u64,
        license: LICENSE.as_ptr() as u64,
        log_level: 0,
        log_size: 0,
        log_buf: 0,
        kern_version: 0,
        prog_flags: 0,
        prog_name: [0; BPF_OBJ_NAME_LEN],
        prog_ifindex: 0,
        expected_attach_type: 0,
    };

    let fd = bpf(BPF_PROG_LOAD, &mut attr);
    if fd >= 0 {
        return Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) });
    }

    // Reload with logging enabled to capture the verifier's complaint.
    let mut log_buf = vec![0u8; 64 * 1024];
    attr.log_level = 1;
    attr.log_size = log_buf.len() as u32;
    attr.log_buf = log_buf.as_mut_ptr() as u64;

    let fd = bpf(BPF_PROG_LOAD, &mut attr);
    if fd >= 0 {
        return Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) });
    }
    let err = io::Error::last_os_error();
    let nul = log_buf.iter().position(|&b| b == 0).unwrap_or(0);
    let log = String::from_utf8_lossy(&log_buf[..nul]).trim().to_string();
    let log = if log.is_empty() {
        String::new()
    } else {
        format!("\n{log}")
    };
    Err(ProgLoadError { err, log })
}

/// Look up `key` in the map; `Ok(None)` on a plain miss.
pub fn map_lookup<K: Copy, V: Copy + Default>(map_fd: RawFd, key: &K) -> io::Result<Option<V>> {
    let mut value = V::default();
    let mut attr = MapLookupAttr {
        map_fd: map_fd as u32,
        _pad: 0,
        key: key as *const K as u64,
        value: &mut value as *mut V as u64,
        flags: 0,
    };

    let rc = bpf(BPF_MAP_LOOKUP_ELEM, &mut attr);
    if rc == 0 {
        return Ok(Some(value));
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ENOENT) {
        return Ok(None);
    }
    Err(err)
}

/// Numeric id of `category:name` from tracefs, trying the modern mount
/// first and the debugfs location as fallback.
pub fn tracepoint_id(category: &str, name: &str) -> io::Result<u64> {
    for root in ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"] {
        let path = format!("{root}/events/{category}/{name}/id");
        let Ok(raw) = std::fs::read_to_string(&path) else {
            continue;
        };
        return raw.trim().parse::<u64>().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unparsable tracepoint id in {path}"),
            )
        });
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("tracepoint {category}:{name} not found in tracefs"),
    ))
}

/// Attach `prog_fd` to the tracepoint identified by `tracepoint_id` and
/// enable it. A single perf event suffices: the program hangs off the
/// tracepoint itself and fires on every CPU.
pub fn attach_tracepoint(prog_fd: RawFd, tracepoint_id: u64) -> io::Result<OwnedFd> {
    let mut attr: PerfEventAttr = unsafe { std::mem::zeroed() };
    attr.type_ = PERF_TYPE_TRACEPOINT;
    attr.size = std::mem::size_of::<PerfEventAttr>() as u32;
    attr.config = tracepoint_id;
    attr.sample_period = 1;
    attr.wakeup_events = 1;

    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            &attr as *const PerfEventAttr,
            -1 as libc::pid_t,
            0 as libc::c_int,
            -1 as libc::c_int,
            PERF_FLAG_FD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let event = unsafe { OwnedFd::from_raw_fd(fd as RawFd) };

    let raw = fd as libc::c_int;
    if unsafe { libc::ioctl(raw, PERF_EVENT_IOC_SET_BPF, prog_fd) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::ioctl(raw, PERF_EVENT_IOC_ENABLE, 0) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_layouts_match_kernel() {
        assert_eq!(std::mem::size_of::<MapCreateAttr>(), 44);
        assert_eq!(std::mem::size_of::<MapLookupAttr>(), 32);
        assert_eq!(std::mem::size_of::<ProgLoadAttr>(), 72);
        // PERF_ATTR_SIZE_VER5
        assert_eq!(std::mem::size_of::<PerfEventAttr>(), 112);
    }

    #[test]
    fn test_tracepoint_id_unknown_event() {
        let err = tracepoint_id("muninn", "no_such_event").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
