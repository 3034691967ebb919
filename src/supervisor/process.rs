//! OS-facing process control: liveness probing and signal delivery.
//!
//! `ProcessControl` is the seam the stop algorithm runs against; the unix
//! implementation talks to the kernel through `nix` and reads the process
//! table through `sysinfo`.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use sysinfo::{ProcessStatus, System};

/// Where a signal goes: the whole process group led by `pid`, or `pid` alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTarget {
    Group(u32),
    Pid(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

impl StopSignal {
    fn as_nix(self) -> Signal {
        match self {
            Self::Terminate => Signal::SIGTERM,
            Self::Kill => Signal::SIGKILL,
        }
    }
}

pub trait ProcessControl: Send + Sync {
    /// Whether `pid` exists and is not a zombie. Ambiguous answers
    /// (permission denied) count as alive.
    fn is_alive(&self, pid: u32) -> bool;

    fn signal(&self, target: SignalTarget, signal: StopSignal) -> Result<(), Errno>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnixControl;

impl ProcessControl for UnixControl {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match signal::kill(Pid::from_raw(raw), None) {
            Ok(()) => !is_zombie(pid),
            // 권한이 없다는 것은 프로세스가 존재한다는 뜻
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn signal(&self, target: SignalTarget, signal: StopSignal) -> Result<(), Errno> {
        let sig = signal.as_nix();
        match target {
            SignalTarget::Group(pid) => {
                let raw = i32::try_from(pid).map_err(|_| Errno::EINVAL)?;
                tracing::debug!("Sending {:?} to process group {}", sig, pid);
                signal::killpg(Pid::from_raw(raw), sig)
            }
            SignalTarget::Pid(pid) => {
                let raw = i32::try_from(pid).map_err(|_| Errno::EINVAL)?;
                tracing::debug!("Sending {:?} to pid {}", sig, pid);
                signal::kill(Pid::from_raw(raw), sig)
            }
        }
    }
}

/// Zombies still answer the null signal but will never run again.
fn is_zombie(pid: u32) -> bool {
    let pid = sysinfo::Pid::from_u32(pid);
    let mut sys = System::new();
    if !sys.refresh_process(pid) {
        return false;
    }
    sys.process(pid)
        .map_or(false, |p| matches!(p.status(), ProcessStatus::Zombie))
}
