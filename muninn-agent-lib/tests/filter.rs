//! Executes the assembled socket filter in a tiny userspace cBPF
//! interpreter against synthetic frames, covering exactly the opcodes the
//! assembler emits.

use muninn_agent_lib::filter::{tcp_port80_filter, FilterProgram};

// Opcodes the port-80 filter uses.
const LD_ABS_H: u16 = 0x28;
const LD_ABS_B: u16 = 0x30;
const LDX_MSH_B: u16 = 0xb1;
const LD_IND_H: u16 = 0x48;
const JEQ_K: u16 = 0x15;
const RET_K: u16 = 0x06;

/// Run `program` over `frame` and return the filter verdict (bytes to
/// keep; 0 drops the frame). Out-of-bounds loads drop, as in the kernel.
fn run_cbpf(program: &FilterProgram, frame: &[u8]) -> u32 {
    let ins = program.instructions();
    let mut a: u32 = 0;
    let mut x: u32 = 0;
    let mut pc = 0usize;

    loop {
        assert!(pc < ins.len(), "fell off the end of the program");
        let i = ins[pc];
        pc += 1;
        match i.code {
            LD_ABS_H => {
                let off = i.k as usize;
                if off + 2 > frame.len() {
                    return 0;
                }
                a = u32::from(u16::from_be_bytes([frame[off], frame[off + 1]]));
            }
            LD_ABS_B => {
                let off = i.k as usize;
                if off >= frame.len() {
                    return 0;
                }
                a = u32::from(frame[off]);
            }
            LDX_MSH_B => {
                let off = i.k as usize;
                if off >= frame.len() {
                    return 0;
                }
                x = 4 * u32::from(frame[off] & 0x0f);
            }
            LD_IND_H => {
                let off = x as usize + i.k as usize;
                if off + 2 > frame.len() {
                    return 0;
                }
                a = u32::from(u16::from_be_bytes([frame[off], frame[off + 1]]));
            }
            JEQ_K => {
                pc += if a == i.k { i.jt as usize } else { i.jf as usize };
            }
            RET_K => return i.k,
            other => panic!("interpreter does not implement opcode {other:#x}"),
        }
    }
}

/// Ethernet + IPv4 + TCP frame with an optional IPv4 options block.
fn build_frame(ethertype: u16, proto: u8, src_port: u16, dst_port: u16, ip_options: usize) -> Vec<u8> {
    assert!(ip_options % 4 == 0 && ip_options <= 40);
    let ihl_words = (20 + ip_options) / 4;

    let mut frame = Vec::new();
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 2]); // dst mac
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]); // src mac
    frame.extend_from_slice(&ethertype.to_be_bytes());

    // IPv4 header.
    frame.push(0x40 | ihl_words as u8);
    frame.push(0); // dscp/ecn
    frame.extend_from_slice(&(((20 + ip_options + 20) as u16).to_be_bytes()));
    frame.extend_from_slice(&[0, 0, 0, 0]); // id, flags/frag
    frame.push(64); // ttl
    frame.push(proto);
    frame.extend_from_slice(&[0, 0]); // checksum (unchecked)
    frame.extend_from_slice(&[192, 168, 1, 10]);
    frame.extend_from_slice(&[10, 0, 0, 1]);
    frame.extend_from_slice(&vec![0u8; ip_options]);

    // TCP header (20 bytes, ports first).
    frame.extend_from_slice(&src_port.to_be_bytes());
    frame.extend_from_slice(&dst_port.to_be_bytes());
    frame.extend_from_slice(&[0u8; 16]);
    frame
}

#[test]
fn test_accepts_dst_port_80() {
    let prog = tcp_port80_filter();
    let frame = build_frame(0x0800, 6, 50000, 80, 0);
    assert_eq!(run_cbpf(&prog, &frame), 0xFFFF);
}

#[test]
fn test_accepts_src_port_80() {
    let prog = tcp_port80_filter();
    let frame = build_frame(0x0800, 6, 80, 50000, 0);
    assert_eq!(run_cbpf(&prog, &frame), 0xFFFF);
}

#[test]
fn test_drops_dst_port_443() {
    let prog = tcp_port80_filter();
    let frame = build_frame(0x0800, 6, 50000, 443, 0);
    assert_eq!(run_cbpf(&prog, &frame), 0);
}

#[test]
fn test_drops_non_ipv4_ethertype() {
    let prog = tcp_port80_filter();
    // Same shape, ARP ethertype.
    let frame = build_frame(0x0806, 6, 50000, 80, 0);
    assert_eq!(run_cbpf(&prog, &frame), 0);
}

#[test]
fn test_drops_udp() {
    let prog = tcp_port80_filter();
    let frame = build_frame(0x0800, 17, 50000, 80, 0);
    assert_eq!(run_cbpf(&prog, &frame), 0);
}

#[test]
fn test_handles_ipv4_options() {
    let prog = tcp_port80_filter();
    // 8 bytes of IP options shift the TCP header; the indexed load must
    // still find the ports.
    let frame = build_frame(0x0800, 6, 50000, 80, 8);
    assert_eq!(run_cbpf(&prog, &frame), 0xFFFF);

    let frame = build_frame(0x0800, 6, 50000, 443, 8);
    assert_eq!(run_cbpf(&prog, &frame), 0);
}

#[test]
fn test_drops_truncated_frame() {
    let prog = tcp_port80_filter();
    let frame = build_frame(0x0800, 6, 50000, 80, 0);
    // Cut inside the TCP ports.
    assert_eq!(run_cbpf(&prog, &frame[..35]), 0);
}
