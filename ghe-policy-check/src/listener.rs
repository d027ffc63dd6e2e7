use std::error::Error as StdError;
use std::net::SocketAddr;

use anyhow::Context as _;
use async_trait::async_trait;
use futures::TryFutureExt as _;
use policy_task::{ChildTask, ShutdownSignal, Task};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::Instrument as _;

use crate::PolicyState;

const HTTP_CONNECTION_MAX_DURATION: tokio::time::Duration = tokio::time::Duration::from_secs(10 * 60);

pub struct PolicyListener {
    addr: SocketAddr,
    listener: TcpListener,
    state: PolicyState,
}

impl PolicyListener {
    pub fn init_and_bind(addr: SocketAddr, state: PolicyState) -> anyhow::Result<Self> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4().context("failed to create IPv4 TCP socket")?
        } else {
            TcpSocket::new_v6().context("failed to created IPv6 TCP socket")?
        };
        socket.set_reuseaddr(true).context("failed to set SO_REUSEADDR")?;
        socket.bind(addr).context("failed to bind TCP socket")?;

        let listener = socket
            .listen(64)
            .context("failed to listen with the binded TCP socket")?;

        let addr = listener.local_addr().context("failed to read the local address")?;

        info!("Listening on http://{addr}");

        Ok(Self { addr, listener, state })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[instrument("listener", skip(self), fields(port = self.addr.port()))]
    pub async fn run(self) -> anyhow::Result<()> {
        run_http_listener(self.listener, self.state).await
    }
}

#[async_trait]
impl Task for PolicyListener {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "http listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown_signal.wait() => Ok(()),
        }
    }
}

async fn run_http_listener(listener: TcpListener, state: PolicyState) -> anyhow::Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let state = state.clone();

                let fut = tokio::time::timeout(HTTP_CONNECTION_MAX_DURATION, async move {
                    if let Err(e) = handle_http_peer(stream, state, peer_addr).await {
                        error!(error = format!("{e:#}"), "handle_http_peer failed");
                    }
                })
                .inspect_err(|error| debug!(%error, "Drop long-lived HTTP connection"))
                .instrument(info_span!("http", client = %peer_addr));

                ChildTask::spawn(fut).detach();
            }
            Err(error) => {
                error!(%error, "Failed to accept connection");
            }
        }
    }
}

/// Tells whether the peer simply went away.
fn is_benign_disconnect(error: &(dyn StdError + 'static)) -> bool {
    use std::io::ErrorKind::{BrokenPipe, ConnectionReset, UnexpectedEof};

    let mut cause = Some(error);

    while let Some(current) = cause {
        if let Some(hyper_err) = current.downcast_ref::<hyper::Error>()
            && (hyper_err.is_canceled() || hyper_err.is_incomplete_message())
        {
            return true;
        }

        if let Some(ioe) = current.downcast_ref::<std::io::Error>()
            && matches!(ioe.kind(), BrokenPipe | ConnectionReset | UnexpectedEof)
        {
            return true;
        }

        cause = current.source();
    }

    false
}

async fn handle_http_peer(io: TcpStream, state: PolicyState, peer_addr: SocketAddr) -> anyhow::Result<()> {
    use hyper::service::service_fn;
    use tower::Service as _;

    let service = service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
        // Router is always ready, no need to call `poll_ready`.
        crate::make_http_service(state.clone()).call(request)
    });

    let result = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
        .serve_connection(hyper_util::rt::TokioIo::new(io), service)
        .await;

    match result {
        Ok(()) => Ok(()),
        Err(error) if is_benign_disconnect(error.as_ref()) => {
            debug!(error = %error, %peer_addr, "Client disconnected");
            Ok(())
        }
        Err(error) => Err(anyhow::anyhow!(error).context("HTTP server")),
    }
}
