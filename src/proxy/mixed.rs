//! One port for SOCKS5 and HTTP: a leading 0x05 byte means SOCKS5

use crate::error::Result;
use crate::net::PrefixedStream;
use crate::protocol::socks5::VERSION as SOCKS5_VERSION;
use crate::session::{Protocol, ProxySession};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use super::{ProxyContext, http, socks5};

pub async fn serve<S>(ctx: &ProxyContext, mut stream: S, session: &mut ProxySession) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut first = [0u8; 1];
    let n = ctx.handshake(async { Ok(stream.read(&mut first).await?) }).await?;
    if n == 0 {
        return Ok(());
    }

    let stream = PrefixedStream::new(Bytes::copy_from_slice(&first), stream);
    if first[0] == SOCKS5_VERSION {
        session.identify(Protocol::Socks5)?;
        socks5::serve(ctx, stream, session).await
    } else {
        http::serve(ctx, stream, session).await
    }
}
