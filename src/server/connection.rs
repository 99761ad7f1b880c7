use super::RpcServer;
use crate::protocol::codec::{self, read_frame, write_frame};
use crate::protocol::RpcResponse;
use crate::Result;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::watch;

/// Service one client connection until it closes or the server shuts down.
pub(super) async fn serve(
    server: RpcServer,
    mut stream: TcpStream,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    // ---
    server.connection_opened();
    crate::log_debug!("{}: connection from {}", server.name(), peer);

    loop {
        // A connection accepted while shutting down never sees a change
        if *shutdown.borrow() {
            break;
        }

        let frame = tokio::select! {
            frame = read_frame(&mut stream, server.max_frame_size()) => frame,
            _ = shutdown.changed() => break,
        };

        match frame {
            Ok(Some(frame)) => {
                let processed = tokio::select! {
                    processed = process_frame(&server, &mut stream, peer, &frame) => processed,
                    _ = shutdown.changed() => {
                        crate::log_debug!("{}: abandoning request from {}", server.name(), peer);
                        break;
                    }
                };
                if let Err(e) = processed {
                    crate::log_debug!("{}: dropping {}: {}", server.name(), peer, e);
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                crate::log_debug!("{}: read from {} failed: {}", server.name(), peer, e);
                break;
            }
        }
    }

    // Dropping the stream closes the connection, so a waiting caller sees it lost
    drop(stream);
    server.connection_closed();
    crate::log_debug!("{}: connection from {} closed", server.name(), peer);
}

async fn process_frame(
    server: &RpcServer,
    stream: &mut TcpStream,
    peer: SocketAddr,
    frame: &[u8],
) -> Result<()> {
    // ---
    if let Some(agent) = codec::decode_hello(frame) {
        crate::log_info!("{}: {} connected with {}", server.name(), peer, agent);
        return Ok(());
    }

    let batch = codec::decode(frame);
    let mut responses: Vec<RpcResponse> = Vec::with_capacity(batch.requests.len());

    for err in &batch.errors {
        crate::log_warn!("{}: bad packet from {}: {}", server.name(), peer, err.reason);
        responses.push(err.to_response());
    }

    if !batch.responses.is_empty() {
        crate::log_debug!(
            "{}: ignoring {} unsolicited responses from {}",
            server.name(),
            batch.responses.len(),
            peer
        );
    }

    // Requests run one after another so responses keep request order
    for request in batch.requests {
        if let Some(response) = server.handle_request(request).await {
            responses.push(response);
        }
    }

    if responses.is_empty() {
        return Ok(());
    }

    let payload = codec::encode(&[], &responses)?;
    write_frame(stream, &payload).await
}
