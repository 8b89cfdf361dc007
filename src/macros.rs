/// Run a libc call and turn a `-1` return into the last OS error.
///
/// Grounded on `tokio-rs-mio`'s `sys/unix/mod.rs` `syscall!` helper; used
/// throughout the poller, waker, socket, and acceptor code to avoid
/// repeating the `if res == -1 { Err(..) }` dance around every FFI call.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}
