//! SIGINT dump handler.
//!
//! On interrupt, print both summary structures through their lock-free
//! raw dump paths and exit. The handler deliberately takes no locks; the
//! output is an advisory diagnostic, not an invariant source.

use std::io::Write;
use std::sync::{Arc, OnceLock};

use crate::ctx::SchedCtx;

static DUMP_CTX: OnceLock<Arc<SchedCtx>> = OnceLock::new();

extern "C" fn on_sigint(_sig: libc::c_int) {
    if let Some(ctx) = DUMP_CTX.get() {
        let mut out: Vec<u8> = Vec::with_capacity(4096);
        let _ = writeln!(out, "\nEXITING!");
        let _ = writeln!(out, "----Push Data Structure----");
        let _ = ctx.push.dump_raw(&mut out);
        let _ = writeln!(out, "----Pull Data Structure----");
        let _ = ctx.pull.dump_raw(&mut out);
        unsafe {
            libc::write(
                libc::STDOUT_FILENO,
                out.as_ptr() as *const libc::c_void,
                out.len(),
            );
        }
    }
    unsafe { libc::_exit(130) }
}

/// Install the dump handler for this run's context. Later calls keep the
/// first context; there is one simulation per process.
pub fn install(ctx: Arc<SchedCtx>) {
    let _ = DUMP_CTX.set(ctx);
    let handler = on_sigint as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as usize);
    }
}
