//! Packet filters attached to the capture socket.
//!
//! Classic programs go in as `sock_fprog` arrays. Compiled (eBPF) programs are
//! loaded elsewhere, for example with aya, and attached by descriptor.

use std::os::fd::{AsRawFd, BorrowedFd};

use ringtap_common::{SockFilter, SOL_SOCKET, SO_ATTACH_BPF, SO_ATTACH_FILTER};

use crate::error::{Error, Result};
use crate::socket::SocketHandle;

/// `struct sock_fprog`.
#[repr(C)]
struct SockFprog {
    len: u16,
    filter: *const SockFilter,
}

pub(crate) fn attach_classic(socket: &SocketHandle, program: &[SockFilter]) -> Result<()> {
    let len = u16::try_from(program.len())
        .map_err(|_| Error::FilterTooLarge { len: program.len() })?;
    let fprog = SockFprog {
        len,
        filter: program.as_ptr(),
    };
    socket
        .setsockopt(SOL_SOCKET, SO_ATTACH_FILTER, &fprog)
        .map_err(|source| Error::Syscall {
            op: "setsockopt(SO_ATTACH_FILTER)",
            source,
        })
}

pub(crate) fn attach_ebpf(socket: &SocketHandle, program: BorrowedFd<'_>) -> Result<()> {
    let fd: i32 = program.as_raw_fd();
    socket
        .setsockopt(SOL_SOCKET, SO_ATTACH_BPF, &fd)
        .map_err(|source| Error::Syscall {
            op: "setsockopt(SO_ATTACH_BPF)",
            source,
        })
}

/// Parse the output of `tcpdump -ddd`: an instruction count on the first
/// line, then one `code jt jf k` line per instruction, all decimal.
pub fn parse_ddd(text: &str) -> Result<Vec<SockFilter>> {
    let mut lines = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty());

    let count: usize = lines
        .next()
        .ok_or_else(|| Error::config("empty filter program"))?
        .parse()
        .map_err(|_| Error::config("filter program must start with an instruction count"))?;

    let program = lines
        .enumerate()
        .map(|(i, line)| parse_instruction(line).ok_or_else(|| {
            Error::config(format!("bad filter instruction {}: {line:?}", i + 1))
        }))
        .collect::<Result<Vec<_>>>()?;

    if program.len() != count {
        return Err(Error::config(format!(
            "filter program declares {count} instructions but has {}",
            program.len()
        )));
    }
    Ok(program)
}

fn parse_instruction(line: &str) -> Option<SockFilter> {
    let mut fields = line.split_whitespace();
    let insn = SockFilter {
        code: fields.next()?.parse().ok()?,
        jt: fields.next()?.parse().ok()?,
        jf: fields.next()?.parse().ok()?,
        k: fields.next()?.parse().ok()?,
    };
    match fields.next() {
        Some(_) => None,
        None => Some(insn),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // tcpdump -ddd ip
    const IP_ONLY: &str = "4\n40 0 0 12\n21 0 1 2048\n6 0 0 262144\n6 0 0 0\n";

    #[test]
    fn test_parse_tcpdump_ddd() {
        let program = parse_ddd(IP_ONLY).unwrap();
        assert_eq!(program.len(), 4);
        assert_eq!(
            program[1],
            SockFilter {
                code: 21,
                jt: 0,
                jf: 1,
                k: 2048,
            }
        );
        assert_eq!(program[3].k, 0);
    }

    #[test]
    fn test_parse_tolerates_blank_lines_and_padding() {
        let program = parse_ddd("\n 1\n\n  6 0 0 65535  \n").unwrap();
        assert_eq!(program.len(), 1);
        assert_eq!(program[0].k, 65535);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_ddd("").is_err());
        assert!(parse_ddd("two\n6 0 0 0\n").is_err());
        assert!(parse_ddd("2\n6 0 0 0\n").is_err());
        assert!(parse_ddd("1\n6 0 0\n").is_err());
        assert!(parse_ddd("1\n6 0 0 0 9\n").is_err());
        assert!(parse_ddd("1\n6 0 300 0\n").is_err());
    }

    #[test]
    fn test_oversized_program_rejected_before_syscall() {
        let socket = SocketHandle::for_tests();
        let program = vec![SockFilter::default(); usize::from(u16::MAX) + 1];
        let err = attach_classic(&socket, &program).unwrap_err();
        assert!(matches!(err, Error::FilterTooLarge { len: 65536 }));
    }
}
