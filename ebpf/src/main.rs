#![no_std]
#![no_main]

use aya_ebpf::{
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns,
        bpf_probe_read_user_str_bytes,
    },
    macros::{map, tracepoint},
    maps::PerfEventArray,
    programs::TracePointContext,
};
use aya_log_ebpf::debug;

const TASK_COMM_LEN: usize = 16;
const FILENAME_LEN: usize = 256;

// /sys/kernel/tracing/events/syscalls/sys_enter_execve/format
const EXECVE_FILENAME_OFFSET: usize = 16;
// /sys/kernel/tracing/events/syscalls/sys_enter_execveat/format
const EXECVEAT_FILENAME_OFFSET: usize = 24;
// /sys/kernel/tracing/events/sched/sched_process_fork/format
const FORK_PARENT_PID_OFFSET: usize = 24;
const FORK_CHILD_COMM_OFFSET: usize = 28;
const FORK_CHILD_PID_OFFSET: usize = 44;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ExecRecord {
    pub pid: u32,
    pub comm: [u8; TASK_COMM_LEN],
    pub filename: [u8; FILENAME_LEN],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ForkRecord {
    pub ts: u64,
    pub ppid: u32,
    pub pid: u32,
    pub parent_comm: [u8; TASK_COMM_LEN],
    pub comm: [u8; TASK_COMM_LEN],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ExitRecord {
    pub ts: u64,
    pub pid: u32,
    pub comm: [u8; TASK_COMM_LEN],
}

#[map]
static EXEC_EVENTS: PerfEventArray<ExecRecord> = PerfEventArray::new(0);

#[map]
static FORK_EVENTS: PerfEventArray<ForkRecord> = PerfEventArray::new(0);

#[map]
static EXIT_EVENTS: PerfEventArray<ExitRecord> = PerfEventArray::new(0);

#[tracepoint]
pub fn handle_execve(ctx: TracePointContext) -> u32 {
    match try_handle_exec(&ctx, EXECVE_FILENAME_OFFSET) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

#[tracepoint]
pub fn handle_execveat(ctx: TracePointContext) -> u32 {
    match try_handle_exec(&ctx, EXECVEAT_FILENAME_OFFSET) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

fn try_handle_exec(ctx: &TracePointContext, filename_offset: usize) -> Result<u32, i64> {
    let tgid = (bpf_get_current_pid_tgid() >> 32) as u32;

    let mut record = ExecRecord {
        pid: tgid,
        comm: bpf_get_current_comm()?,
        filename: [0u8; FILENAME_LEN],
    };

    let filename: *const u8 = unsafe { ctx.read_at(filename_offset)? };
    // 读取失败时保留空文件名，事件仍然上报
    let _ = unsafe { bpf_probe_read_user_str_bytes(filename, &mut record.filename) };

    debug!(ctx, "[EXEC] PID={}", tgid);

    EXEC_EVENTS.output(ctx, &record, 0);
    Ok(0)
}

#[tracepoint]
pub fn handle_fork(ctx: TracePointContext) -> u32 {
    match try_handle_fork(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

fn try_handle_fork(ctx: &TracePointContext) -> Result<u32, i64> {
    // sched_process_fork 在父进程上下文中触发
    let record = ForkRecord {
        ts: unsafe { bpf_ktime_get_ns() },
        ppid: unsafe { ctx.read_at::<u32>(FORK_PARENT_PID_OFFSET)? },
        pid: unsafe { ctx.read_at::<u32>(FORK_CHILD_PID_OFFSET)? },
        parent_comm: bpf_get_current_comm()?,
        comm: unsafe { ctx.read_at::<[u8; TASK_COMM_LEN]>(FORK_CHILD_COMM_OFFSET)? },
    };

    debug!(ctx, "[FORK] PPID={} PID={}", record.ppid, record.pid);

    FORK_EVENTS.output(ctx, &record, 0);
    Ok(0)
}

#[tracepoint]
pub fn handle_exit(ctx: TracePointContext) -> u32 {
    match try_handle_exit(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

fn try_handle_exit(ctx: &TracePointContext) -> Result<u32, i64> {
    // sched_process_exit 在退出的任务上下文中触发，pid 即 tid
    let pid = bpf_get_current_pid_tgid() as u32;

    let record = ExitRecord {
        ts: unsafe { bpf_ktime_get_ns() },
        pid,
        comm: bpf_get_current_comm()?,
    };

    debug!(ctx, "[EXIT] PID={}", pid);

    EXIT_EVENTS.output(ctx, &record, 0);
    Ok(0)
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
