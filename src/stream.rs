use std::{panic::AssertUnwindSafe, time::Duration};
use futures::FutureExt;
use tokio::{
    io::AsyncReadExt,
    sync::{mpsc, oneshot},
    time::timeout
};
use tracing::error;

use crate::{
    client::{DataFrame, ErrFrame, SourceToken},
    server::Stream
};

/// Reads one source socket into the engine's data channel.
///
/// Every read gets a fresh deadline and a fresh buffer; the first
/// error, timeout or end of stream becomes an [`ErrFrame`] and ends the
/// task. The data channel is bounded, so a slow upstream makes this
/// task block on send, which stops the socket reads, which pushes the
/// pressure back to the network peer.
async fn read_into(mut stream: Stream, mount: String, token: SourceToken,
                   data_tx: mpsc::Sender<DataFrame>, err_tx: mpsc::Sender<ErrFrame>,
                   deadline: Duration, buffer_size: usize) {
    loop {
        let mut data = vec![0u8; buffer_size];

        let read = match timeout(deadline, stream.read(&mut data)).await {
            Ok(Ok(0)) => {
                let err = std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "reached end of connection"
                );
                _ = err_tx.send(ErrFrame { err, mount, token }).await;
                return;
            },
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                _ = err_tx.send(ErrFrame { err: e, mount, token }).await;
                return;
            },
            Err(e) => {
                _ = err_tx.send(ErrFrame { err: e.into(), mount, token }).await;
                return;
            }
        };

        data.truncate(read);
        if data_tx.send(DataFrame { data, mount: mount.clone(), token }).await.is_err() {
            // Engine is gone, nothing left to read for
            return;
        }
    }
}

/// Spawns the reader for an admitted source.
///
/// The kill channel is how the engine hangs up on a client: the reader
/// owns the socket, so dropping out of this task closes it. Panics are
/// contained and surface as a synthetic ErrFrame so one bad read can't
/// take the process down.
pub fn spawn_reader(stream: Stream, mount: String, token: SourceToken,
                    data_tx: mpsc::Sender<DataFrame>, err_tx: mpsc::Sender<ErrFrame>,
                    kill: oneshot::Receiver<()>,
                    deadline: Duration, buffer_size: usize) {
    tokio::spawn(async move {
        let fut = read_into(
            stream, mount.clone(), token,
            data_tx, err_tx.clone(),
            deadline, buffer_size
        );

        tokio::select! {
            ret = AssertUnwindSafe(fut).catch_unwind() => {
                if ret.is_err() {
                    error!("Reader for a source on {} panicked", mount);
                    let err = std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "source reader panicked"
                    );
                    _ = err_tx.send(ErrFrame { err, mount, token }).await;
                }
            },
            // Fires on both kill and engine teardown, either way the
            // socket must go
            _ = kill => ()
        }
    });
}
