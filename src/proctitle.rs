//! Process title, for operator visibility via `ps`/`top`/`htop`.
//!
//! The original service uses Python's `setproctitle`; no equivalent crate
//! appears anywhere in the reference pack. `libc` is already a dependency,
//! and `setproctitle`-family crates are themselves thin wrappers over the
//! same `prctl(PR_SET_NAME, ...)` primitive on Linux, so it is used
//! directly rather than adding a crate purely for this.
//!
//! `PR_SET_NAME` only sets the short name visible in `/proc/<pid>/comm` (and
//! hence `ps -o comm`, `top`, `htop`) — it is truncated to 15 bytes plus a
//! trailing NUL by the kernel. It does not rewrite `argv`, so `ps -o args`
//! still shows the original command line; this is an accepted limitation,
//! not a gap in the supervisor/worker distinction operators need day to day.
pub fn set_process_title(title: &str) {
    let mut buf = [0u8; 16];
    let bytes = title.as_bytes();
    let n = bytes.len().min(15);
    buf[..n].copy_from_slice(&bytes[..n]);
    unsafe {
        libc::prctl(libc::PR_SET_NAME, buf.as_ptr() as libc::c_ulong, 0, 0, 0);
    }
}
