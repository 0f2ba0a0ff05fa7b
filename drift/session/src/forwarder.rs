//! The Forwarder (spec §4.7): a local TCP listener that pipes each accepted
//! connection through the manager's `Tunnel` RPC to a pod IP:port.

use std::net::SocketAddr;

use drift_protocol::{pb, tunnel::TunnelFrame};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

/// Runs one local listener until `cancellation` fires. Not retried at this
/// level — spec §4.7: "the forwarder does not retry at the connection
/// level — the per-pod group is the retry unit", so a listener bind
/// failure propagates to the caller instead of looping internally.
pub async fn run(
    local_addr: SocketAddr,
    pod_ip: String,
    pod_port: u16,
    manager: pb::manager_client::ManagerClient<Channel>,
    cancellation: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(local_addr).await?;
    info!(%local_addr, %pod_ip, pod_port, "forwarder listening");

    let mut next_connection_id: u64 = 0;

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = cancellation.cancelled() => {
                debug!(%local_addr, "forwarder cancelled");
                return Ok(());
            }
        };

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(error) => {
                warn!(%local_addr, %error, "accept failed");
                continue;
            }
        };

        next_connection_id += 1;
        let connection_id = next_connection_id;
        let pod_ip = pod_ip.clone();
        let manager = manager.clone();
        let cancellation = cancellation.child_token();

        tokio::spawn(async move {
            debug!(%peer, connection_id, "forwarder accepted connection");
            if let Err(error) =
                pipe_connection(stream, connection_id, &pod_ip, pod_port, manager, cancellation).await
            {
                if !is_cancelled_error(&error) {
                    warn!(%peer, connection_id, %error, "forwarded connection ended with an error");
                }
            }
        });
    }
}

fn is_cancelled_error(error: &std::io::Error) -> bool {
    error.kind() == std::io::ErrorKind::Interrupted
}

/// Opens the manager's bidirectional `Tunnel` stream and pipes bytes both
/// directions between it and `stream` until either end closes.
async fn pipe_connection(
    mut stream: TcpStream,
    connection_id: u64,
    pod_ip: &str,
    pod_port: u16,
    mut manager: pb::manager_client::ManagerClient<Channel>,
    cancellation: CancellationToken,
) -> Result<(), std::io::Error> {
    let (to_manager_tx, to_manager_rx) = mpsc::channel::<pb::TunnelFrame>(32);

    // First frame on a fresh tunnel carries the destination; later frames on
    // the same connection id are just payload (spec §4.7, §6 "Tunnel").
    let open = TunnelFrame::data(connection_id, format!("{pod_ip}:{pod_port}").into_bytes());
    if to_manager_tx.send(open.into()).await.is_err() {
        return Ok(());
    }

    let outbound = tokio_stream::wrappers::ReceiverStream::new(to_manager_rx);
    let response = manager
        .tunnel(outbound)
        .await
        .map_err(|status| std::io::Error::other(status.to_string()))?;
    let mut inbound = response.into_inner();

    let mut read_buf = [0u8; 16 * 1024];
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => return Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "cancelled")),

            read = stream.read(&mut read_buf) => {
                let n = read?;
                if n == 0 {
                    let _ = to_manager_tx.send(TunnelFrame::close(connection_id).into()).await;
                    break;
                }
                let frame = TunnelFrame::data(connection_id, read_buf[..n].to_vec());
                if to_manager_tx.send(frame.into()).await.is_err() {
                    break;
                }
            }

            next = futures::StreamExt::next(&mut inbound) => {
                match next {
                    Some(Ok(frame)) => {
                        if frame.close {
                            break;
                        }
                        stream.write_all(&frame.payload).await?;
                    }
                    Some(Err(status)) => return Err(std::io::Error::other(status.to_string())),
                    None => break,
                }
            }
        }
    }

    let _ = stream.shutdown().await;
    Ok(())
}

impl From<TunnelFrame> for pb::TunnelFrame {
    fn from(frame: TunnelFrame) -> Self {
        Self {
            connection_id: frame.connection_id,
            payload: frame.payload,
            close: frame.close,
        }
    }
}
