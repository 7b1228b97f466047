//! The per-session forward proxy (spec.md component C4).
//!
//! Unlike a credential-injecting MITM proxy, this proxy never needs to see
//! inside TLS: credentials reach the workload as mounted files (component
//! C3), so the proxy's only job is to be the one egress path a confined
//! workload is allowed to reach. It speaks plain HTTP `CONNECT` tunneling for
//! HTTPS targets and forwards plain HTTP requests directly.

use http_body_util::{BodyExt, Empty, combinators::BoxBody};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

/// Default port the forward proxy listens on inside its own container/pod,
/// and the port injected into `HTTP_PROXY`/`HTTPS_PROXY` (spec.md 4.4).
pub const PROXY_PORT: u16 = 3128;

type BoxedBody = BoxBody<Bytes, hyper::Error>;

fn empty_body() -> BoxedBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Run the forward proxy until `shutdown` resolves, accepting connections on
/// `addr`. Each accepted connection is served independently; a single failed
/// connection never brings the proxy down (the teacher's server-loop shape).
///
/// # Errors
/// Returns an error if the listener cannot be bound.
pub async fn serve(
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "forward proxy listening");

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => {
                tracing::info!("forward proxy shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to accept proxy connection");
                        continue;
                    }
                };
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(stream, peer).await {
                        tracing::debug!(%peer, error = %err, "proxy connection ended with error");
                    }
                });
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    http1::Builder::new()
        .serve_connection(io, service_fn(move |req| handle(req, peer)))
        .with_upgrades()
        .await?;
    Ok(())
}

async fn handle(req: Request<Incoming>, peer: SocketAddr) -> Result<Response<BoxedBody>, hyper::Error> {
    tracing::debug!(%peer, method = %req.method(), uri = %req.uri(), "proxy request");

    if req.method() == Method::CONNECT {
        return Ok(handle_connect(req));
    }

    match forward_plain(req).await {
        Ok(resp) => Ok(resp),
        Err(err) => {
            tracing::warn!(error = %err, "upstream forward failed");
            Ok(Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(empty_body())
                .unwrap_or_else(|_| Response::new(empty_body())))
        }
    }
}

fn handle_connect(req: Request<Incoming>) -> Response<BoxedBody> {
    let Some(authority) = req.uri().authority().map(ToString::to_string) else {
        return Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(empty_body())
            .unwrap_or_else(|_| Response::new(empty_body()));
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(err) = tunnel(upgraded, &authority).await {
                    tracing::debug!(%authority, error = %err, "tunnel closed with error");
                }
            }
            Err(err) => tracing::warn!(%authority, error = %err, "failed to upgrade CONNECT"),
        }
    });

    Response::new(empty_body())
}

async fn tunnel(upgraded: hyper::upgrade::Upgraded, authority: &str) -> anyhow::Result<()> {
    let mut server = TcpStream::connect(authority).await?;
    let mut client = TokioIo::new(upgraded);
    let (from_client, from_server) =
        tokio::io::copy_bidirectional(&mut client, &mut server).await?;
    tracing::debug!(authority, from_client, from_server, "tunnel closed");
    Ok(())
}

async fn forward_plain(req: Request<Incoming>) -> anyhow::Result<Response<BoxedBody>> {
    let host = req
        .uri()
        .host()
        .ok_or_else(|| anyhow::anyhow!("request URI has no host"))?
        .to_owned();
    let port = req.uri().port_u16().unwrap_or(80);

    let stream = TcpStream::connect((host.as_str(), port)).await?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            tracing::debug!(error = %err, "upstream connection closed");
        }
    });

    let response = sender.send_request(req).await?;
    Ok(response.map(|body| body.map_err(|err| err).boxed()))
}

#[cfg(test)]
mod tests {
    use super::PROXY_PORT;

    #[test]
    fn proxy_port_matches_the_injected_proxy_env_port() {
        assert_eq!(PROXY_PORT, 3128);
    }
}
