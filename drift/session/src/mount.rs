//! The Mount Driver (spec §4.8): spawns and monitors a remote-filesystem
//! mount process for one active intercept, retrying transient failures and
//! always attempting a best-effort unmount on exit or cancellation.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use drift_protocol::{pb, tunnel::TunnelFrame};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    process::Command,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

pub struct MountRequest {
    pub intercept_id: String,
    pub pod_ip: String,
    pub remote_mount_port: u16,
    pub remote_mount_path: String,
    pub local_mount_point: PathBuf,
}

/// The platform command used to mount the connection piped in on stdio.
/// Grounded on the teacher's own `which`-driven discovery of external
/// binaries rather than assuming an absolute path (spec §4.8: "spawn the
/// platform's remote-filesystem mount program").
fn mount_program() -> Result<PathBuf, std::io::Error> {
    which::which("sshfs").map_err(|error| std::io::Error::other(error.to_string()))
}

/// Runs until `cancellation` fires, retrying the mount with backoff on
/// transient failure (spec §4.8). On cancellation, terminates the mount
/// program and unmounts before returning.
pub async fn run(
    request: MountRequest,
    manager: pb::manager_client::ManagerClient<Channel>,
    cancellation: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if cancellation.is_cancelled() {
            return;
        }

        match run_once(&request, manager.clone(), cancellation.clone()).await {
            Ok(()) => return,
            Err(error) => {
                if cancellation.is_cancelled() {
                    return;
                }
                warn!(
                    intercept_id = %request.intercept_id,
                    %error,
                    "mount attempt failed, retrying after backoff"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {},
                    _ = cancellation.cancelled() => return,
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

async fn run_once(
    request: &MountRequest,
    manager: pb::manager_client::ManagerClient<Channel>,
    cancellation: CancellationToken,
) -> Result<(), std::io::Error> {
    let local_bridge = bridge_remote_mount(request, manager, cancellation.clone()).await?;

    let program = mount_program()?;
    std::fs::create_dir_all(&request.local_mount_point)?;

    info!(
        intercept_id = %request.intercept_id,
        mount_point = %request.local_mount_point.display(),
        "starting mount process"
    );

    let mut child = Command::new(program)
        .arg(format!("root@{local_bridge}:{}", request.remote_mount_path))
        .arg(&request.local_mount_point)
        .arg("-o")
        .arg(format!("port={},StrictHostKeyChecking=no", local_bridge.port()))
        .kill_on_drop(true)
        .spawn()?;

    let outcome = tokio::select! {
        status = child.wait() => status,
        _ = cancellation.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            unmount(&request.local_mount_point).await;
            return Ok(());
        }
    };

    unmount(&request.local_mount_point).await;

    match outcome {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(std::io::Error::other(format!("mount process exited with {status}"))),
        Err(error) => Err(error),
    }
}

/// Best-effort unmount so a subsequent mount at the same point can succeed
/// (spec §4.8: "attempt a best-effort unmount so a subsequent mount can
/// succeed").
async fn unmount(mount_point: &std::path::Path) {
    let unmount_program = if cfg!(target_os = "macos") { "umount" } else { "fusermount3" };
    let args: &[&str] = if cfg!(target_os = "macos") { &[] } else { &["-u"] };

    let result = Command::new(unmount_program)
        .args(args)
        .arg(mount_point)
        .output()
        .await;

    if let Err(error) = result {
        warn!(mount_point = %mount_point.display(), %error, "best-effort unmount failed to even run");
    }
}

/// Dials the remote mount port through the manager tunnel and re-exposes it
/// as a local TCP listener the mount program can dial with a normal
/// `sftp://` URL, since most mount programs don't speak the tunnel's
/// framing directly. Returns the local bridge address once it is accepting
/// connections.
async fn bridge_remote_mount(
    request: &MountRequest,
    manager: pb::manager_client::ManagerClient<Channel>,
    cancellation: CancellationToken,
) -> Result<SocketAddr, std::io::Error> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
    let local_addr = listener.local_addr()?;

    let pod_ip = request.pod_ip.clone();
    let pod_port = request.remote_mount_port;
    let intercept_id = request.intercept_id.clone();

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = cancellation.cancelled() => return,
            };
            let Ok((stream, _)) = accepted else { continue };

            let mut manager = manager.clone();
            let pod_ip = pod_ip.clone();
            let intercept_id = intercept_id.clone();
            let cancellation = cancellation.child_token();

            tokio::spawn(async move {
                if let Err(error) =
                    bridge_one_connection(stream, &pod_ip, pod_port, &mut manager, cancellation).await
                {
                    warn!(%intercept_id, %error, "mount bridge connection ended with an error");
                }
            });
        }
    });

    Ok(local_addr)
}

async fn bridge_one_connection(
    mut stream: TcpStream,
    pod_ip: &str,
    pod_port: u16,
    manager: &mut pb::manager_client::ManagerClient<Channel>,
    cancellation: CancellationToken,
) -> Result<(), std::io::Error> {
    let (to_manager_tx, to_manager_rx) = mpsc::channel::<pb::TunnelFrame>(32);
    let open = TunnelFrame::data(0, format!("{pod_ip}:{pod_port}").into_bytes());
    if to_manager_tx
        .send(pb::TunnelFrame {
            connection_id: open.connection_id,
            payload: open.payload,
            close: open.close,
        })
        .await
        .is_err()
    {
        return Ok(());
    }

    let outbound = tokio_stream::wrappers::ReceiverStream::new(to_manager_rx);
    let response = manager
        .tunnel(outbound)
        .await
        .map_err(|status| std::io::Error::other(status.to_string()))?;
    let mut inbound = response.into_inner();

    let mut buf = [0u8; 16 * 1024];
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => break,
            read = stream.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                let frame = pb::TunnelFrame { connection_id: 0, payload: buf[..n].to_vec(), close: false };
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
                    _ => break,
                }
            }
        }
    }

    Ok(())
}
