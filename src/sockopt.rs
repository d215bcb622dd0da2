//! Socket option helpers.
//!
//! Connections multiplexed by the host are long-lived and mostly idle, so
//! both sides enable TCP keepalive right after `accept`/`connect`. Failures
//! here are logged and otherwise ignored; a socket without keepalive still
//! works, its death just takes longer to notice.

use std::io;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use std::os::unix::io::AsRawFd;

        fn set_opt(
            fd: libc::c_int,
            level: libc::c_int,
            name: libc::c_int,
            value: libc::c_int,
        ) -> io::Result<()> {
            let rc = unsafe {
                libc::setsockopt(
                    fd,
                    level,
                    name,
                    &value as *const libc::c_int as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }

        /// Enable keepalive probing on `sock`.
        ///
        /// On Linux the probe count and idle delay are tightened as well so
        /// a vanished peer is detected within seconds rather than the
        /// kernel-default hours.
        pub(crate) fn set_keepalive<S: AsRawFd>(sock: &S) -> io::Result<()> {
            let fd = sock.as_raw_fd();
            set_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;

            cfg_if::cfg_if! {
                if #[cfg(target_os = "linux")] {
                    set_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, 5)?;
                    set_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, 5)?;
                } else if #[cfg(target_os = "macos")] {
                    set_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPALIVE, 5)?;
                }
            }

            Ok(())
        }
    } else {
        /// Keepalive tuning is only wired up for unix targets.
        pub(crate) fn set_keepalive<S>(_sock: &S) -> io::Result<()> {
            Ok(())
        }
    }
}

#[cfg(all(test, unix))]
mod test {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    #[test]
    fn keepalive_applies_to_a_live_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        set_keepalive(&stream).unwrap();

        // read the flag back to confirm it stuck
        let mut value: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                stream.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_KEEPALIVE,
                &mut value as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        assert_eq!(rc, 0);
        assert_ne!(value, 0);
    }
}
