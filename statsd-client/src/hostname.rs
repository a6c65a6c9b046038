use std::io;

/// Token in a metric key that is replaced with the local hostname on the wire.
pub(crate) const HOST_TOKEN: &str = "%HOST%";

/// Returns the hostname of the local machine.
#[cfg(unix)]
pub(crate) fn local_hostname() -> io::Result<String> {
    // POSIX caps hostnames at 255 bytes, plus the terminating NUL.
    let mut buf = [0u8; 256];

    // SAFETY: `buf` is valid for writes of `buf.len()` bytes for the duration of the call.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..len].to_vec()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Returns the hostname of the local machine.
#[cfg(not(unix))]
pub(crate) fn local_hostname() -> io::Result<String> {
    std::env::var("COMPUTERNAME").map_err(|e| io::Error::new(io::ErrorKind::NotFound, e))
}
