use std::io::{self, ErrorKind};
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, Duration};
use tracing::{error, warn};

use crate::Shutdown;

const MIN_ACCEPT_DELAY: Duration = Duration::from_millis(5);
const MAX_ACCEPT_DELAY: Duration = Duration::from_secs(1);

// ENFILE and EMFILE, descriptors may free up again
const TOO_MANY_FILES: [i32; 2] = [23, 24];

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
    ) || err
        .raw_os_error()
        .is_some_and(|code| TOO_MANY_FILES.contains(&code))
}

fn next_delay(delay: Duration) -> Duration {
    if delay.is_zero() {
        MIN_ACCEPT_DELAY
    } else {
        (delay * 2).min(MAX_ACCEPT_DELAY)
    }
}

/// Accepts the next socket, backing off on transient errors.
///
/// Returns `None` once shutdown is signalled or on a permanent accept error.
pub(crate) async fn accept(listener: &TcpListener, shutdown: &mut Shutdown) -> Option<(TcpStream, SocketAddr)> {
    let mut delay = Duration::ZERO;
    loop {
        let res = tokio::select! {
            _ = shutdown.recv() => return None,
            res = listener.accept() => res,
        };
        match res {
            Ok(accepted) => return Some(accepted),
            Err(err) if is_transient(&err) => {
                delay = next_delay(delay);
                warn!("accept error: {}; retrying in {:?}", err, delay);
                tokio::select! {
                    _ = shutdown.recv() => return None,
                    _ = time::sleep(delay) => {}
                }
            }
            Err(err) => {
                error!("accept error: {}", err);
                return None;
            }
        }
    }
}
