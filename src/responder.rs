//! Ephemeral HTTP-01 challenge responder
//!
//! A listener exists only for the duration of a single challenge attempt:
//! it is bound when the attempt starts and the port is released when the
//! attempt finishes. The certificate manager runs challenges one at a
//! time, so at most one listener is ever alive.

use crate::acme::http01_path;
use crate::error::Result;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ChallengeResponder {
    addr: SocketAddr,
}

impl ChallengeResponder {
    pub fn new(addr: SocketAddr) -> ChallengeResponder {
        ChallengeResponder { addr }
    }

    /// Bind the configured address and serve the token response until the
    /// returned handle is stopped.
    pub async fn serve(&self, token: &str, response: &str) -> Result<ResponderHandle> {
        let listener = TcpListener::bind(self.addr).await?;
        let addr = listener.local_addr()?;
        let path = Arc::new(http01_path(token));
        let body = Bytes::from(response.to_owned());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        debug!(addr = %addr, token, "challenge responder listening");
        let task = tokio::spawn(accept_loop(listener, path, body, shutdown_rx));

        Ok(ResponderHandle {
            addr,
            shutdown_tx,
            task: Some(task),
        })
    }
}

/// Keeps the listener alive; stopping (or dropping) it releases the port.
pub struct ResponderHandle {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ResponderHandle {
    /// Address actually bound, useful when the configured port is 0.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shut the listener down and wait for the accept loop to exit.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!(addr = %self.addr, "challenge responder stopped");
    }
}

impl Drop for ResponderHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    path: Arc<String>,
    body: Bytes,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "challenge connection accepted");
                        let path = Arc::clone(&path);
                        let body = body.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req: Request<Incoming>| {
                                let path = Arc::clone(&path);
                                let body = body.clone();
                                async move { respond(&req, &path, body) }
                            });
                            if let Err(err) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                debug!(error = %err, "challenge connection error");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to accept challenge connection");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

fn respond(
    req: &Request<Incoming>,
    path: &str,
    body: Bytes,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    if req.method() == Method::GET && req.uri().path() == path {
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain")
            .header(header::CONTENT_LENGTH, body.len())
            .body(Full::new(body))
            .expect("valid response builder"))
    } else {
        Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
            .expect("valid response builder"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut buf = String::new();
        stream.read_to_string(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_serves_token_response() {
        let responder = ChallengeResponder::new("127.0.0.1:0".parse().unwrap());
        let handle = responder.serve("tok123", "tok123.key-auth").await.unwrap();

        let reply = get(handle.addr(), "/.well-known/acme-challenge/tok123").await;
        assert!(reply.starts_with("HTTP/1.1 200"));
        assert!(reply.contains("content-length: 15"));
        assert!(reply.ends_with("tok123.key-auth"));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let responder = ChallengeResponder::new("127.0.0.1:0".parse().unwrap());
        let handle = responder.serve("tok123", "tok123.key-auth").await.unwrap();

        for path in ["/", "/.well-known/acme-challenge/other", "/health"] {
            let reply = get(handle.addr(), path).await;
            assert!(reply.starts_with("HTTP/1.1 404"), "{path}: {reply}");
        }

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_releases_port() {
        let responder = ChallengeResponder::new("127.0.0.1:0".parse().unwrap());
        let handle = responder.serve("a", "a.b").await.unwrap();
        let addr = handle.addr();
        handle.stop().await;

        // The port must be bindable again once stop returns.
        let rebound = TcpListener::bind(addr).await.unwrap();
        drop(rebound);
    }
}
