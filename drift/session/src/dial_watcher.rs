//! Consumes `WatchDial` (spec §6: "streams dial requests that the client
//! fulfills by opening arbitrary TCP connections"). This is the reverse
//! direction of the forwarder: the manager asks the client to reach some
//! host:port on the client's behalf (used when a workload needs to call
//! back out to a service only the developer's workstation can see).

use drift_protocol::pb;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, warn};

/// Runs until the manager closes the `WatchDial` stream or `cancellation`
/// fires. Reconnection of the watch stream itself is the caller's concern
/// (spec §4.4 names the same backoff shape for every manager stream); this
/// function handles one stream lifetime.
pub async fn run(
    mut manager: pb::manager_client::ManagerClient<Channel>,
    session: pb::SessionInfo,
    cancellation: CancellationToken,
) -> Result<(), tonic::Status> {
    let mut stream = manager.watch_dial(session).await?.into_inner();

    loop {
        let next = tokio::select! {
            next = futures::StreamExt::next(&mut stream) => next,
            _ = cancellation.cancelled() => return Ok(()),
        };

        let request = match next {
            Some(Ok(request)) => request,
            Some(Err(status)) => return Err(status),
            None => return Ok(()),
        };

        let manager = manager.clone();
        let cancellation = cancellation.child_token();
        tokio::spawn(async move {
            if let Err(error) = fulfill(request.clone(), manager, cancellation).await {
                warn!(id = %request.id, host = %request.host, port = request.port, %error, "dial request failed");
            }
        });
    }
}

async fn fulfill(
    request: pb::DialRequest,
    mut manager: pb::manager_client::ManagerClient<Channel>,
    cancellation: CancellationToken,
) -> Result<(), std::io::Error> {
    let mut stream = TcpStream::connect((request.host.as_str(), request.port as u16)).await?;
    debug!(id = %request.id, host = %request.host, port = request.port, "dial fulfilled");

    let (to_manager_tx, to_manager_rx) = tokio::sync::mpsc::channel::<pb::TunnelFrame>(32);

    // The first frame on this fresh tunnel stream carries the dial id so the
    // manager can correlate it with the outstanding DialRequest.
    let header = pb::TunnelFrame {
        connection_id: 0,
        payload: request.id.clone().into_bytes(),
        close: false,
    };
    if to_manager_tx.send(header).await.is_err() {
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
            _ = cancellation.cancelled() => break,

            read = stream.read(&mut read_buf) => {
                let n = read?;
                if n == 0 {
                    let _ = to_manager_tx
                        .send(pb::TunnelFrame { connection_id: 0, payload: Vec::new(), close: true })
                        .await;
                    break;
                }
                let frame = pb::TunnelFrame {
                    connection_id: 0,
                    payload: read_buf[..n].to_vec(),
                    close: false,
                };
                if to_manager_tx.send(frame).await.is_err() {
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
