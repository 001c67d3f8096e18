//! Lifecycle: remote-process spawn, environment bootstrap and teardown.
//!
//! The host creates the segment, forks the remote binary and passes the
//! segment name and accelerator-node selection through environment
//! variables. The remote calls [`attach_from_env`] as its first step,
//! which also honors the optional core-pinning knob.

use std::env;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{execv, fork, ForkResult, Pid};

use crate::config::PeerConfig;
use crate::error::{Error, Result};
use crate::peer::{BlockTransfer, Peer};

/// Environment variable carrying the segment name to the remote.
pub const ENV_SHM_SEGID: &str = "URPC_SHM_SEGID";
/// Accelerator node the remote runs on; consumed by the transfer engine.
pub const ENV_VE_NODE: &str = "VE_NODE_NUMBER";
/// Optional core to pin the remote's progress thread to.
pub const ENV_VE_CORE: &str = "URPC_VE_CORE";
/// Optional override for the remote binary path.
pub const ENV_VE_BIN: &str = "URPC_VE_BIN";

impl Peer {
    /// Fork and exec the remote binary with the bootstrap environment.
    ///
    /// Fails with `NotFound` when the binary does not exist. The child's
    /// path can be overridden at run time through `URPC_VE_BIN`.
    pub fn spawn_child(
        &mut self,
        binary: &Path,
        venode: i32,
        core: Option<usize>,
    ) -> Result<()> {
        if !binary.exists() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("remote binary {} not found", binary.display()),
            )));
        }

        match unsafe { fork() }.map_err(|e| Error::Io(io::Error::from_raw_os_error(e as i32)))? {
            ForkResult::Child => {
                env::set_var(ENV_SHM_SEGID, self.segment_name());
                env::set_var(ENV_VE_NODE, venode.to_string());
                if let Some(core) = core {
                    env::set_var(ENV_VE_CORE, core.to_string());
                }

                let path = env::var_os(ENV_VE_BIN)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| binary.to_path_buf());
                if let Ok(prog) = CString::new(path.as_os_str().as_bytes()) {
                    let _ = execv(&prog, &[prog.as_c_str()]);
                }
                // exec failed; nothing sensible to clean up in the child.
                unsafe { nix::libc::_exit(127) };
            }
            ForkResult::Parent { child } => {
                self.child = Some(child);
                Ok(())
            }
        }
    }

    /// Pid of the spawned remote process, if any.
    pub fn child_pid(&self) -> Option<Pid> {
        self.child
    }

    /// Forcibly terminate the remote process and reap it. A no-op when no
    /// child is tracked, so teardown stays idempotent.
    pub fn kill_child(&mut self) -> Result<()> {
        let Some(pid) = self.child.take() else {
            return Ok(());
        };
        kill(pid, Signal::SIGKILL)
            .map_err(|e| Error::Io(io::Error::from_raw_os_error(e as i32)))?;
        let _ = waitpid(pid, None);
        Ok(())
    }

    /// Tear the peer pair down.
    ///
    /// Asks the remote to exit and waits up to `timeout_us` for the
    /// acknowledgement; when none arrives the remote is forcibly
    /// terminated. Either way the segment name is detached afterwards.
    /// Calling this again (or after the pieces ran individually) is a
    /// no-op.
    pub fn teardown(&mut self, timeout_us: u64) -> Result<()> {
        if self.child.is_some() {
            let acked = matches!(self.request_shutdown(timeout_us), Ok(true));
            if acked {
                if let Some(pid) = self.child.take() {
                    let _ = waitpid(pid, None);
                }
            } else {
                self.kill_child()?;
            }
        }
        self.detach_name();
        Ok(())
    }
}

/// Remote-side bootstrap: read the environment prepared by the host,
/// optionally pin the current thread, and attach to the segment.
///
/// Pass a transfer engine to stage payloads through mirror memory; `None`
/// attaches with direct segment access.
pub fn attach_from_env(
    config: PeerConfig,
    dma: Option<Arc<dyn BlockTransfer>>,
) -> Result<Peer> {
    let name = env::var(ENV_SHM_SEGID).map_err(|_| Error::BadBootstrap(ENV_SHM_SEGID))?;

    if let Ok(core) = env::var(ENV_VE_CORE) {
        let id = core
            .parse::<usize>()
            .map_err(|_| Error::BadBootstrap(ENV_VE_CORE))?;
        core_affinity::set_for_current(core_affinity::CoreId { id });
    }
    if let Ok(node) = env::var(ENV_VE_NODE) {
        // The node selection belongs to the transfer engine; only reject
        // garbage here so a bad bootstrap fails loudly and early.
        node.parse::<i32>()
            .map_err(|_| Error::BadBootstrap(ENV_VE_NODE))?;
    }

    match dma {
        Some(dma) => Peer::attach_with_transfer(&name, config, dma),
        None => Peer::attach(&name, config),
    }
}
