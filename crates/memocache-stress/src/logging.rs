use std::future::Future;
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::pin::Pin;

use anyhow::Result;
use memocache::config::{Logging, Metrics};
use memocache::{logging, metrics};

/// Sets up logging, either as configured or with all events going into a sink.
///
/// Must be called before any other threads are spawned.
pub fn init_logging(tracing: bool, config: &Logging) {
    if tracing {
        // we want all the tracing machinery to be active, but not spam the console,
        // so redirect everything into the void:
        logging::init_json_logging("INFO,memocache=TRACE", || NoopWriter);
    } else {
        // SAFETY: `main` calls this before the runtime starts its worker threads.
        unsafe { logging::init_logging(config) };
    }
}

/// Reports metrics to a local UDP socket that discards them.
///
/// The returned future drains the socket and must be spawned. Must be called from within a tokio
/// runtime.
pub fn init_metrics(config: &Metrics) -> Result<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let socket = UdpSocket::bind(addr)?;
    socket.set_nonblocking(true)?;
    let host = socket.local_addr()?;
    let socket = tokio::net::UdpSocket::from_std(socket)?;

    // have some default tags, just to be closer to the real world config
    let mut tags = config.custom_tags.clone();
    tags.entry("host".into()).or_insert_with(|| "stresstest".into());
    tags.entry("env".into()).or_insert_with(|| "stresstest".into());

    metrics::configure_statsd(&config.prefix, host, tags)?;

    Ok(Box::pin(async move {
        let mut buf = Vec::with_capacity(1024);
        loop {
            buf.clear();
            if socket.recv_buf(&mut buf).await.is_err() {
                break;
            }
        }
    }))
}

struct NoopWriter;
impl Write for NoopWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // try to prevent the compiler from optimizing away all the formatting code:
        let buf = std::hint::black_box(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
