use std::mem::size_of;

pub const TASK_COMM_LEN: usize = 16;
pub const FILENAME_LEN: usize = 256;

// 与 ebpf/src/main.rs 中的结构保持一致

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawExecRecord {
    pub pid: u32,
    pub comm: [u8; TASK_COMM_LEN],
    pub filename: [u8; FILENAME_LEN],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawForkRecord {
    pub ts: u64,
    pub ppid: u32,
    pub pid: u32,
    pub parent_comm: [u8; TASK_COMM_LEN],
    pub comm: [u8; TASK_COMM_LEN],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawExitRecord {
    pub ts: u64,
    pub pid: u32,
    pub comm: [u8; TASK_COMM_LEN],
}

unsafe impl aya::Pod for RawExecRecord {}
unsafe impl aya::Pod for RawForkRecord {}
unsafe impl aya::Pod for RawExitRecord {}

/// A decoded process lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Fork {
        ts: u64,
        ppid: u32,
        pid: u32,
        parent_comm: String,
        comm: String,
    },
    Exec {
        pid: u32,
        comm: String,
        filename: String,
    },
    Exit {
        ts: u64,
        pid: u32,
        comm: String,
    },
}

impl ProcessEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessEvent::Fork { .. } => "fork",
            ProcessEvent::Exec { .. } => "exec",
            ProcessEvent::Exit { .. } => "exit",
        }
    }

    pub fn pid(&self) -> u32 {
        match self {
            ProcessEvent::Fork { pid, .. }
            | ProcessEvent::Exec { pid, .. }
            | ProcessEvent::Exit { pid, .. } => *pid,
        }
    }
}

impl From<RawForkRecord> for ProcessEvent {
    fn from(raw: RawForkRecord) -> Self {
        ProcessEvent::Fork {
            ts: raw.ts,
            ppid: raw.ppid,
            pid: raw.pid,
            parent_comm: c_str_lossy(&raw.parent_comm),
            comm: c_str_lossy(&raw.comm),
        }
    }
}

impl From<RawExecRecord> for ProcessEvent {
    fn from(raw: RawExecRecord) -> Self {
        ProcessEvent::Exec {
            pid: raw.pid,
            comm: c_str_lossy(&raw.comm),
            filename: c_str_lossy(&raw.filename),
        }
    }
}

impl From<RawExitRecord> for ProcessEvent {
    fn from(raw: RawExitRecord) -> Self {
        ProcessEvent::Exit {
            ts: raw.ts,
            pid: raw.pid,
            comm: c_str_lossy(&raw.comm),
        }
    }
}

pub fn decode_fork(buf: &[u8]) -> Option<ProcessEvent> {
    read_record::<RawForkRecord>(buf).map(ProcessEvent::from)
}

pub fn decode_exec(buf: &[u8]) -> Option<ProcessEvent> {
    read_record::<RawExecRecord>(buf).map(ProcessEvent::from)
}

pub fn decode_exit(buf: &[u8]) -> Option<ProcessEvent> {
    read_record::<RawExitRecord>(buf).map(ProcessEvent::from)
}

fn read_record<T: aya::Pod>(buf: &[u8]) -> Option<T> {
    if buf.len() < size_of::<T>() {
        return None;
    }
    // perf 缓冲区中的样本不保证对齐
    Some(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const T) })
}

/// Decodes a fixed-width NUL-padded string, replacing invalid UTF-8.
pub fn c_str_lossy(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comm(s: &[u8]) -> [u8; TASK_COMM_LEN] {
        let mut out = [0u8; TASK_COMM_LEN];
        out[..s.len()].copy_from_slice(s);
        out
    }

    #[test]
    fn record_sizes_match_kernel_layout() {
        assert_eq!(size_of::<RawExecRecord>(), 276);
        assert_eq!(size_of::<RawForkRecord>(), 48);
        assert_eq!(size_of::<RawExitRecord>(), 32);
    }

    #[test]
    fn decodes_fork_record_bytes() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&123_456u64.to_ne_bytes());
        buf.extend_from_slice(&1u32.to_ne_bytes());
        buf.extend_from_slice(&100u32.to_ne_bytes());
        buf.extend_from_slice(&comm(b"systemd"));
        buf.extend_from_slice(&comm(b"init_child"));

        assert_eq!(
            decode_fork(&buf),
            Some(ProcessEvent::Fork {
                ts: 123_456,
                ppid: 1,
                pid: 100,
                parent_comm: "systemd".to_string(),
                comm: "init_child".to_string(),
            })
        );
    }

    #[test]
    fn decodes_exec_with_full_width_filename() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&77u32.to_ne_bytes());
        buf.extend_from_slice(&comm(b"worker"));
        buf.extend_from_slice(&[b'a'; FILENAME_LEN]);

        match decode_exec(&buf) {
            Some(ProcessEvent::Exec { pid, comm, filename }) => {
                assert_eq!(pid, 77);
                assert_eq!(comm, "worker");
                assert_eq!(filename.len(), FILENAME_LEN);
            }
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn short_buffer_is_rejected() {
        let buf = [0u8; 10];
        assert_eq!(decode_exit(&buf), None);
        assert_eq!(decode_fork(&buf), None);
        assert_eq!(decode_exec(&buf), None);
    }

    #[test]
    fn invalid_bytes_are_replaced_not_fatal() {
        let raw = RawExitRecord {
            ts: 9,
            pid: 5,
            comm: comm(&[b'o', b'k', 0xff, 0xfe]),
        };
        assert_eq!(
            ProcessEvent::from(raw),
            ProcessEvent::Exit {
                ts: 9,
                pid: 5,
                comm: "ok\u{fffd}\u{fffd}".to_string(),
            }
        );
    }

    #[test]
    fn c_str_stops_at_first_nul() {
        assert_eq!(c_str_lossy(b"bash\0garbage"), "bash");
        assert_eq!(c_str_lossy(b"no-terminator"), "no-terminator");
        assert_eq!(c_str_lossy(b""), "");
    }
}
