//! Child process groups
//!
//! Commands run as the leader of a new process group so that whatever they
//! fork can be killed along with them when a step is cancelled or times out.

use tokio::process::{Child, Command};
use tracing::debug;

/// Start the command in its own process group
pub fn isolate(cmd: &mut Command) -> &mut Command {
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

/// Kills the child's whole process group when dropped, unless disarmed.
///
/// Must be created before the child is reaped so its pid still names the group.
#[derive(Debug)]
pub struct GroupGuard {
    pgid: Option<u32>,
}

impl GroupGuard {
    pub fn new(child: &Child) -> Self {
        Self { pgid: child.id() }
    }

    /// The child exited on its own; leave the group alone
    pub fn disarm(mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            debug!(pgid, "killing process group");
            kill_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    if pgid <= 0 {
        return;
    }
    // SAFETY: plain syscall; a group that already exited yields ESRCH
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}
