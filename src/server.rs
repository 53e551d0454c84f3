// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::RequestError;
use crate::http::read_request_head;
use crate::resource_manager::ResourceManagerClient;
use crate::upload::UploadManager;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{event, Level};

pub struct Server {
    listener: TcpListener,
    manager: Arc<UploadManager>,
    resources: ResourceManagerClient,
}

impl Server {
    pub async fn bind(
        addr: SocketAddr,
        manager: Arc<UploadManager>,
        resources: ResourceManagerClient,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            manager,
            resources,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts peers until `shutdown` resolves. Connections already being
    /// served are left to finish on their own.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    event!(Level::INFO, "Server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let manager = self.manager.clone();
                        let resources = self.resources.clone();
                        tokio::spawn(async move {
                            let _permit = match resources.acquire_connection().await {
                                Ok(p) => p,
                                Err(_) => {
                                    event!(Level::DEBUG, %peer, "Connection limit reached. Rejecting incoming peer.");
                                    return;
                                }
                            };
                            serve_connection(manager, stream, peer).await;
                        });
                    }
                    Err(e) => {
                        event!(Level::WARN, error = %e, "Failed to accept connection");
                    }
                }
            }
        }
    }
}

async fn serve_connection(manager: Arc<UploadManager>, stream: TcpStream, peer: SocketAddr) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut uploader = manager.new_uploader(peer);
    event!(Level::DEBUG, %peer, id = uploader.id(), "Upload connection opened");

    loop {
        let idle = manager.idle_timeout(&uploader);
        let head = match tokio::time::timeout(idle, read_request_head(&mut reader)).await {
            Err(_) => {
                event!(Level::DEBUG, %peer, "Connection idle, closing");
                break;
            }
            Ok(Ok(None)) => break,
            Ok(Ok(Some(head))) => head,
            Ok(Err(RequestError::Io(e))) => {
                event!(Level::DEBUG, %peer, error = %e, "Connection read failed");
                break;
            }
            Ok(Err(e)) => {
                event!(Level::DEBUG, %peer, error = %e, "Malformed request head");
                let response = manager.malformed(&mut uploader);
                let _ = manager.respond(&mut uploader, response, &mut write_half).await;
                break;
            }
        };

        let response = manager.handle_request(&mut uploader, &head).await;
        let close = response.should_close() || head.wants_close();
        if let Err(e) = manager.respond(&mut uploader, response, &mut write_half).await {
            event!(Level::DEBUG, %peer, error = %e, "Closing upload connection");
            break;
        }
        if close {
            break;
        }
    }

    manager.connection_closed(&mut uploader);
    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::resource_manager::{ResourceLimits, ResourceManager};
    use crate::storage::Library;
    use std::io::Write;
    use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
    use tokio::sync::oneshot;

    struct Running {
        addr: SocketAddr,
        content: Vec<u8>,
        stop: oneshot::Sender<()>,
        handle: tokio::task::JoinHandle<()>,
        _file: tempfile::NamedTempFile,
    }

    async fn start(max_connections: usize) -> Running {
        let content: Vec<u8> = (0..20_000u32).map(|i| (i % 199) as u8).collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&content).unwrap();

        let library = Library::load(&[file.path().to_path_buf()]).await;
        let (resources, client) = ResourceManager::new(ResourceLimits {
            max_connections,
            disk_read_permits: 2,
        });
        tokio::spawn(resources.run());

        let manager = Arc::new(UploadManager::new(
            &Settings::default(),
            Arc::new(library),
            client.clone(),
        ));
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), manager, client)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run(async {
            let _ = stopped.await;
        }));
        Running {
            addr,
            content,
            stop,
            handle,
            _file: file,
        }
    }

    async fn read_response<R: AsyncBufRead + Unpin>(reader: &mut R) -> (String, Vec<u8>) {
        let mut head = String::new();
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await.unwrap();
            assert!(n > 0, "connection closed inside a response head");
            if line == "\r\n" {
                break;
            }
            head.push_str(&line);
        }
        let len = head
            .lines()
            .find_map(|line| line.strip_prefix("Content-Length: "))
            .map(|value| value.trim().parse::<usize>().unwrap())
            .unwrap_or(0);
        let mut body = vec![0; len];
        reader.read_exact(&mut body).await.unwrap();
        (head, body)
    }

    #[tokio::test]
    async fn test_serves_successive_requests_on_one_connection() {
        let running = start(4).await;
        let name = running._file.path().file_name().unwrap().to_string_lossy().into_owned();
        let target = format!("/get/0/{}", urlencoding::encode(&name));

        let stream = TcpStream::connect(running.addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(format!("GET {} HTTP/1.1\r\nRange: bytes=0-9999\r\n\r\n", target).as_bytes())
            .await
            .unwrap();
        let (head, body) = read_response(&mut reader).await;
        assert!(head.starts_with("HTTP/1.1 206 Partial Content"));
        assert_eq!(body, &running.content[..10_000]);

        write_half
            .write_all(
                format!(
                    "GET {} HTTP/1.1\r\nRange: bytes=10000-\r\nConnection: close\r\n\r\n",
                    target
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        let (_, body) = read_response(&mut reader).await;
        assert_eq!(body, &running.content[10_000..]);

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        running.stop.send(()).unwrap();
        running.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_garbage_gets_400_and_close() {
        let running = start(4).await;
        let mut stream = TcpStream::connect(running.addr).await.unwrap();
        stream.write_all(b"BREW /pot HTTP/1.1\r\n\r\n").await.unwrap();

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(text.starts_with("HTTP/1.1 400 Bad Request"));
        assert!(text.contains("Connection: close"));
        assert!(text.ends_with("Malformed Request"));
    }

    #[tokio::test]
    async fn test_connection_limit_rejects_peers() {
        let running = start(0).await;
        let mut stream = TcpStream::connect(running.addr).await.unwrap();
        let _ = stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await;

        let mut raw = Vec::new();
        let _ = stream.read_to_end(&mut raw).await;
        assert!(raw.is_empty());
    }
}
