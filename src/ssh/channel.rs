//! A single SSH channel exposed as a plain byte stream
//!
//! Once a channel is open the transport halves move into two tasks: the
//! inbound task turns `CHANNEL_DATA` into bytes on a duplex pipe, the
//! outbound task turns bytes from the pipe into `CHANNEL_DATA` while
//! honoring the peer's window. The caller gets the other end of the pipe
//! and relays it like any socket.

use crate::error::{Error, Result};
use std::time::Duration;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::transport::{PacketReader, PacketWriter};
use super::wire::{Reader, Writer, disconnect, msg, open_failure};

/// Window we advertise and replenish
pub const LOCAL_WINDOW: u32 = 2 * 1024 * 1024;

/// Largest `CHANNEL_DATA` payload we accept and send
pub const MAX_PACKET: u32 = 32 * 1024;

/// Buffer between the channel tasks and the caller
const PIPE_CAPACITY: usize = 64 * 1024;

/// How long to wait for the peer's `CHANNEL_CLOSE` after sending ours
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Channel numbers and the peer's flow-control parameters
#[derive(Debug, Clone, Copy)]
pub struct ChannelParams {
    pub local_id: u32,
    pub remote_id: u32,
    pub remote_window: u32,
    pub remote_max_packet: u32,
}

enum Ended {
    PeerClosed,
    LocalEof,
    InboundGone,
}

enum Control {
    /// Peer granted more window
    Grant(u32),
    /// Payload the inbound side needs sent
    Packet(Vec<u8>),
    /// Peer sent EOF or CLOSE
    PeerClosed,
}

/// Start the channel tasks and return the caller's end of the pipe
///
/// The returned handle finishes once both directions are done and the
/// transport write half has been shut down.
pub fn spawn<S>(
    reader: PacketReader<ReadHalf<S>>,
    writer: PacketWriter<WriteHalf<S>>,
    params: ChannelParams,
) -> (DuplexStream, JoinHandle<Result<()>>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (caller, pipe) = tokio::io::duplex(PIPE_CAPACITY);
    let (pipe_read, pipe_write) = tokio::io::split(pipe);
    let (ctrl_tx, ctrl_rx) = mpsc::channel(32);

    let inbound = tokio::spawn(inbound(reader, pipe_write, ctrl_tx, params));
    let outbound = tokio::spawn(outbound(writer, pipe_read, ctrl_rx, inbound, params));
    (caller, outbound)
}

async fn inbound<R, P>(
    mut reader: PacketReader<R>,
    mut pipe: P,
    ctrl: mpsc::Sender<Control>,
    params: ChannelParams,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    P: AsyncWrite + Unpin,
{
    let mut window = LOCAL_WINDOW;
    let mut consumed: u32 = 0;

    loop {
        let payload = reader.recv().await?;
        let mut r = Reader::new(&payload[1..]);

        match payload[0] {
            msg::CHANNEL_DATA | msg::CHANNEL_EXTENDED_DATA => {
                let _recipient = r.u32()?;
                let is_extended = payload[0] == msg::CHANNEL_EXTENDED_DATA;
                if is_extended {
                    let _data_type = r.u32()?;
                }
                let data = r.string()?;
                let len = data.len() as u32;
                if len > window {
                    return Err(Error::Protocol("peer exceeded channel window".to_string()));
                }
                window -= len;

                // Extended data (stderr) has no meaning for a TCP tunnel
                if !is_extended {
                    pipe.write_all(data).await?;
                    pipe.flush().await?;
                }

                consumed += len;
                if consumed >= LOCAL_WINDOW / 2 {
                    let adjust = Writer::new(msg::CHANNEL_WINDOW_ADJUST)
                        .u32(params.remote_id)
                        .u32(consumed)
                        .finish();
                    if ctrl.send(Control::Packet(adjust)).await.is_err() {
                        return Ok(());
                    }
                    window += consumed;
                    consumed = 0;
                }
            }
            msg::CHANNEL_WINDOW_ADJUST => {
                let _recipient = r.u32()?;
                let grant = r.u32()?;
                if ctrl.send(Control::Grant(grant)).await.is_err() {
                    return Ok(());
                }
            }
            msg::CHANNEL_EOF | msg::CHANNEL_CLOSE => {
                trace!(channel = params.local_id, msg = payload[0], "Peer closed channel");
                let _ = pipe.shutdown().await;
                let _ = ctrl.send(Control::PeerClosed).await;
                return Ok(());
            }
            msg::CHANNEL_REQUEST => {
                let _recipient = r.u32()?;
                let request = r.utf8()?.to_string();
                let want_reply = r.bool()?;
                trace!(request = %request, "Refusing channel request");
                if want_reply {
                    let reply = Writer::new(msg::CHANNEL_FAILURE)
                        .u32(params.remote_id)
                        .finish();
                    let _ = ctrl.send(Control::Packet(reply)).await;
                }
            }
            msg::CHANNEL_OPEN => {
                let _kind = r.utf8()?;
                let sender = r.u32()?;
                let reply = Writer::new(msg::CHANNEL_OPEN_FAILURE)
                    .u32(sender)
                    .u32(open_failure::ADMINISTRATIVELY_PROHIBITED)
                    .string("only one channel per connection")
                    .string("")
                    .finish();
                let _ = ctrl.send(Control::Packet(reply)).await;
            }
            msg::GLOBAL_REQUEST => {
                let _name = r.utf8()?;
                if r.bool()? {
                    let _ = ctrl
                        .send(Control::Packet(vec![msg::REQUEST_FAILURE]))
                        .await;
                }
            }
            msg::KEXINIT => {
                let bye = super::wire::disconnect_message(
                    disconnect::KEY_EXCHANGE_FAILED,
                    "re-keying is not supported",
                );
                let _ = ctrl.send(Control::Packet(bye)).await;
                return Err(Error::Protocol("peer requested re-key".to_string()));
            }
            msg::CHANNEL_SUCCESS | msg::CHANNEL_FAILURE => {}
            other => {
                trace!(msg = other, "Unimplemented SSH message");
                let reply = Writer::new(msg::UNIMPLEMENTED)
                    .u32(reader.last_sequence())
                    .finish();
                let _ = ctrl.send(Control::Packet(reply)).await;
            }
        }
    }
}

async fn outbound<W, P>(
    mut writer: PacketWriter<W>,
    mut pipe: P,
    mut ctrl: mpsc::Receiver<Control>,
    inbound: JoinHandle<Result<()>>,
    params: ChannelParams,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
    P: AsyncRead + Unpin,
{
    let chunk = params.remote_max_packet.clamp(1, MAX_PACKET) as usize;
    let mut buf = vec![0u8; chunk];
    let mut window = params.remote_window as u64;

    let result: Result<Ended> = loop {
        let limit = (window.min(chunk as u64)) as usize;
        tokio::select! {
            biased;
            ctrl_msg = ctrl.recv() => match ctrl_msg {
                Some(Control::Grant(n)) => window += n as u64,
                Some(Control::Packet(p)) => {
                    if let Err(e) = writer.send(&p).await {
                        break Err(e);
                    }
                }
                Some(Control::PeerClosed) => break Ok(Ended::PeerClosed),
                None => break Ok(Ended::InboundGone),
            },
            read = pipe.read(&mut buf[..limit]), if limit > 0 => match read {
                Ok(0) => break Ok(Ended::LocalEof),
                Ok(n) => {
                    let data = Writer::new(msg::CHANNEL_DATA)
                        .u32(params.remote_id)
                        .string(&buf[..n])
                        .finish();
                    if let Err(e) = writer.send(&data).await {
                        break Err(e);
                    }
                    window -= n as u64;
                }
                Err(e) => break Err(e.into()),
            },
        }
    };

    let close = Writer::new(msg::CHANNEL_CLOSE)
        .u32(params.remote_id)
        .finish();

    match result {
        Ok(Ended::PeerClosed) => {
            // Answer the peer's EOF/CLOSE with our own CLOSE
            let _ = writer.send(&close).await;
        }
        Ok(Ended::LocalEof) => {
            let eof = Writer::new(msg::CHANNEL_EOF).u32(params.remote_id).finish();
            let _ = writer.send(&eof).await;
            let _ = writer.send(&close).await;
        }
        Ok(Ended::InboundGone) | Err(_) => {}
    }

    // Keep serving control messages until the peer's CLOSE or the grace
    // period runs out
    let drain = async {
        while let Some(ctrl_msg) = ctrl.recv().await {
            match ctrl_msg {
                Control::Packet(p) => {
                    if writer.send(&p).await.is_err() {
                        break;
                    }
                }
                Control::PeerClosed => break,
                Control::Grant(_) => {}
            }
        }
    };
    if tokio::time::timeout(CLOSE_GRACE, drain).await.is_err() {
        debug!(channel = params.local_id, "Peer did not close channel in time");
    }
    inbound.abort();
    let inbound_result = inbound.await.unwrap_or(Ok(()));

    writer.shutdown().await;
    result.map(|_| ()).and(inbound_result)
}
