//! HTTP proxy listener: CONNECT tunnels and absolute-URI forwarding

use crate::auth::parse_basic;
use crate::error::{Error, Result};
use crate::net::{BoxStream, TargetAddr};
use crate::protocol::http::{
    BodyFraming, CONNECTION_ESTABLISHED, HttpConn, Request, Response, error_response,
};
use crate::session::{Protocol, ProxySession, SessionState};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::{ProxyContext, reach, relay_session};

/// Upstream connection kept for the next request to the same authority
struct Reusable {
    authority: String,
    conn: HttpConn<BoxStream>,
}

/// What to do with the client connection after one exchange
enum Next {
    KeepAlive,
    Close,
    /// `101 Switching Protocols`: the connection becomes a raw tunnel
    Upgrade,
}

pub async fn serve<S>(ctx: &ProxyContext, client: S, session: &mut ProxySession) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut conn = HttpConn::new(client).with_idle_timeout(ctx.relay.idle_timeout());
    let mut upstream: Option<Reusable> = None;
    let mut first = true;

    loop {
        // The first head is part of the handshake; later ones are keep-alive
        // idle time
        let wait = if first {
            ctx.handshake_timeout
        } else {
            ctx.relay.idle_timeout()
        };
        let head = match tokio::time::timeout(wait, conn.read_head()).await {
            Err(_) | Ok(Err(Error::IdleTimeout(_))) if first => {
                return Err(Error::HandshakeTimeout(wait));
            }
            Err(_) | Ok(Err(Error::IdleTimeout(_))) => return Ok(()),
            Ok(Ok(None)) => return Ok(()),
            Ok(Ok(Some(head))) => head,
            Ok(Err(e)) => {
                let _ = conn.write_all(&error_response(400)).await;
                return Err(e);
            }
        };

        let request = match Request::parse(&head) {
            Ok(r) => r,
            Err(e) => {
                conn.write_all(&error_response(400)).await?;
                return Err(e);
            }
        };
        trace!(session = session.id(), method = %request.method, target = %request.target, "HTTP request");

        if first && request.is_connect() {
            session.identify(Protocol::HttpsConnect)?;
        }
        reach(session, SessionState::Authenticating)?;
        let username = match request
            .header("proxy-authorization")
            .and_then(|h| ctx.credentials.verify_basic(h))
        {
            Some(user) => user,
            None => {
                let claimed = request
                    .header("proxy-authorization")
                    .and_then(parse_basic)
                    .map(|(user, _)| user);
                conn.write_all(&error_response(407)).await?;
                ctx.log_auth_failure(session, claimed.as_deref());
                return Err(Error::Auth(match claimed {
                    Some(user) => format!("invalid proxy credentials for user '{}'", user),
                    None => "missing proxy credentials".to_string(),
                }));
            }
        };
        session.set_username(&username);

        if request.is_connect() {
            return tunnel(ctx, conn, &request, session).await;
        }

        let (target, authority, path) = match request.absolute_target() {
            Ok(t) => t,
            Err(e) => {
                conn.write_all(&error_response(400)).await?;
                return Err(e);
            }
        };
        session.set_destination(target.clone());
        reach(session, SessionState::Connecting)?;

        let (mut server, reused) = match upstream.take() {
            Some(reused) if reused.authority.eq_ignore_ascii_case(&authority) => {
                trace!(session = session.id(), authority = %authority, "Reusing upstream connection");
                (reused.conn, true)
            }
            _ => match connect_origin(ctx, &target, first).await {
                Ok(server) => (server, false),
                Err(e) => {
                    conn.write_all(&error_response(gateway_status(&e))).await?;
                    return Err(e);
                }
            },
        };
        first = false;

        reach(session, SessionState::Relaying)?;
        let mut responded = false;
        let mut outcome =
            forward(&mut conn, &mut server, &request, &authority, &path, session, &mut responded).await;

        // The origin may have closed an idle keep-alive connection just as we
        // reused it. Bodyless requests get one more try on a fresh connection.
        if reused
            && !responded
            && matches!(outcome, Err(Error::Io(_)))
            && request.body_framing()? == BodyFraming::None
        {
            debug!(session = session.id(), authority = %authority, "Reused upstream connection failed, redialing");
            server = match connect_origin(ctx, &target, false).await {
                Ok(server) => server,
                Err(e) => {
                    conn.write_all(&error_response(gateway_status(&e))).await?;
                    return Err(e);
                }
            };
            outcome =
                forward(&mut conn, &mut server, &request, &authority, &path, session, &mut responded).await;
        }

        let next = match outcome {
            Ok(next) => next,
            Err(e) => {
                if !responded {
                    let _ = conn.write_all(&error_response(gateway_status(&e))).await;
                }
                return Err(e);
            }
        };

        match next {
            Next::KeepAlive => {
                upstream = Some(Reusable {
                    authority,
                    conn: server,
                });
            }
            Next::Close => return Ok(()),
            Next::Upgrade => return upgrade(ctx, conn, server, session).await,
        }
    }
}

/// 502 for unreachable destinations, 504 for timeouts
fn gateway_status(err: &Error) -> u16 {
    match err {
        Error::DialTimeout(_) | Error::HandshakeTimeout(_) | Error::IdleTimeout(_) => 504,
        _ => 502,
    }
}

/// Dial the origin; the first request of a connection still counts against
/// the handshake timeout
async fn connect_origin(
    ctx: &ProxyContext,
    target: &TargetAddr,
    first: bool,
) -> Result<HttpConn<BoxStream>> {
    let connected = if first {
        ctx.handshake(ctx.dialer.dial(target)).await?
    } else {
        ctx.dialer.dial(target).await?
    };
    Ok(HttpConn::new(connected.stream).with_idle_timeout(ctx.relay.idle_timeout()))
}

/// Forward one request and its response
async fn forward<C>(
    client: &mut HttpConn<C>,
    server: &mut HttpConn<BoxStream>,
    request: &Request,
    authority: &str,
    path: &str,
    session: &mut ProxySession,
    responded: &mut bool,
) -> Result<Next>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let head = request.to_origin_form(authority, path);
    server.write_all(&head).await?;
    session.add_up(head.len() as u64);
    let sent = client.copy_body(server.get_mut(), request.body_framing()?).await?;
    session.add_up(sent);

    loop {
        let head = server.read_head().await?.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{} closed the connection before responding", authority),
            )
        })?;
        let response = Response::parse(&head)?;
        client.write_all(&head).await?;
        *responded = true;
        session.add_down(head.len() as u64);

        if response.code == 101 {
            return Ok(Next::Upgrade);
        }
        if response.is_informational() {
            continue;
        }

        let framing = response.body_framing(&request.method)?;
        let received = server.copy_body(client.get_mut(), framing).await?;
        session.add_down(received);
        debug!(
            session = session.id(),
            method = %request.method,
            destination = %authority,
            status = response.code,
            "HTTP request forwarded"
        );

        let close = request.wants_close() || response.wants_close() || framing == BodyFraming::UntilEof;
        return Ok(if close { Next::Close } else { Next::KeepAlive });
    }
}

/// CONNECT: dial, answer 200 and relay raw bytes
async fn tunnel<C>(
    ctx: &ProxyContext,
    mut conn: HttpConn<C>,
    request: &Request,
    session: &mut ProxySession,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    let target: TargetAddr = match request.connect_target() {
        Ok(t) => t,
        Err(e) => {
            conn.write_all(&error_response(400)).await?;
            return Err(e);
        }
    };
    session.set_destination(target.clone());
    reach(session, SessionState::Connecting)?;

    let connected = match ctx.dialer.dial(&target).await {
        Ok(c) => c,
        Err(e) => {
            conn.write_all(&error_response(gateway_status(&e))).await?;
            return Err(e);
        }
    };
    conn.write_all(CONNECTION_ESTABLISHED).await?;
    debug!(session = session.id(), destination = %target, "CONNECT tunnel established");

    // Bytes pipelined after the CONNECT head go to the destination first
    let (client, pipelined) = conn.into_parts();
    let mut destination = connected.stream;
    if !pipelined.is_empty() {
        destination.write_all(&pipelined).await?;
        session.add_up(pipelined.len() as u64);
    }
    relay_session(ctx, session, client, destination).await
}

/// After `101 Switching Protocols` both sides speak something else
async fn upgrade<C>(
    ctx: &ProxyContext,
    client: HttpConn<C>,
    server: HttpConn<BoxStream>,
    session: &mut ProxySession,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client, client_buf) = client.into_parts();
    let (mut server, server_buf) = server.into_parts();
    // Bytes read past the heads belong to the other side
    if !server_buf.is_empty() {
        client.write_all(&server_buf).await?;
        session.add_down(server_buf.len() as u64);
    }
    if !client_buf.is_empty() {
        server.write_all(&client_buf).await?;
        session.add_up(client_buf.len() as u64);
    }
    relay_session(ctx, session, client, server).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credential, CredentialStore, encode_basic};
    use crate::net::Dialer;
    use crate::relay::Relay;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn ctx() -> ProxyContext {
        let store = CredentialStore::from_credentials(vec![Credential::new("khanh", "khanh")]);
        ProxyContext::new("http", Arc::new(store), Dialer::direct(Default::default()))
    }

    fn start() -> (DuplexStream, JoinHandle<(Result<()>, ProxySession)>) {
        start_with(ctx())
    }

    fn start_with(ctx: ProxyContext) -> (DuplexStream, JoinHandle<(Result<()>, ProxySession)>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(async move {
            let mut session =
                ProxySession::new(1, "http", Protocol::Http, "127.0.0.1:40000".parse().unwrap());
            let result = serve(&ctx, server, &mut session).await;
            (result, session)
        });
        (client, handle)
    }

    /// Origin that accepts one connection and hands it to `respond`
    async fn scripted_origin<F, Fut>(respond: F) -> SocketAddr
    where
        F: FnOnce(HttpConn<tokio::net::TcpStream>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            respond(HttpConn::new(stream)).await;
        });
        addr
    }

    fn auth() -> String {
        format!("Proxy-Authorization: {}\r\n", encode_basic("khanh", "khanh"))
    }

    /// Origin server answering every request with a fixed body and
    /// counting accepted connections
    async fn origin() -> (SocketAddr, Arc<std::sync::atomic::AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut conn = HttpConn::new(stream);
                    while let Ok(Some(head)) = conn.read_head().await {
                        let req = Request::parse(&head).unwrap();
                        let body = format!("path={}", req.target);
                        let resp = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                            body.len(),
                            body
                        );
                        if conn.write_all(resp.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (addr, accepted)
    }

    async fn read_response(client: &mut DuplexStream) -> (String, String) {
        let mut conn = HttpConn::new(client);
        let head = conn.read_head().await.unwrap().unwrap();
        let response = Response::parse(&head).unwrap();
        let mut body = Vec::new();
        conn.copy_body(&mut body, response.body_framing("GET").unwrap())
            .await
            .unwrap();
        (
            String::from_utf8(head.to_vec()).unwrap(),
            String::from_utf8(body).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_connect_without_auth_gets_407() {
        let (mut client, handle) = start();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"));
        assert!(text.contains("Proxy-Authenticate: Basic realm=\"authproxy\""));

        let (result, session) = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Auth(_))));
        assert_eq!(session.protocol(), Protocol::HttpsConnect);
    }

    #[tokio::test]
    async fn test_connect_with_pipelined_bytes() {
        let dest = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = dest.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = dest.accept().await.unwrap();
            let mut buf = [0u8; 5];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
        });

        let (mut client, handle) = start();
        let request = format!(
            "CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n{1}\r\nearly",
            dest_addr,
            auth()
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let mut established = vec![0u8; CONNECTION_ESTABLISHED.len()];
        client.read_exact(&mut established).await.unwrap();
        assert_eq!(established, CONNECTION_ESTABLISHED);
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"early");
        drop(client);

        let (result, session) = handle.await.unwrap();
        result.unwrap();
        assert_eq!(session.bytes_up(), 5);
        assert_eq!(session.username(), Some("khanh"));
    }

    #[tokio::test]
    async fn test_plain_get_keep_alive_reuses_upstream() {
        let (addr, accepted) = origin().await;
        let (mut client, handle) = start();

        for path in ["/one", "/two?x=1"] {
            let request = format!(
                "GET http://{0}{1} HTTP/1.1\r\nProxy-Connection: keep-alive\r\n{2}\r\n",
                addr,
                path,
                auth()
            );
            client.write_all(request.as_bytes()).await.unwrap();
            let (head, body) = read_response(&mut client).await;
            assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
            assert_eq!(body, format!("path={}", path));
        }
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 1);

        drop(client);
        let (result, session) = handle.await.unwrap();
        result.unwrap();
        assert_eq!(session.protocol(), Protocol::Http);
        assert!(session.bytes_down() > 0);
    }

    #[tokio::test]
    async fn test_each_request_is_authenticated() {
        let (addr, _) = origin().await;
        let (mut client, handle) = start();

        let request = format!("GET http://{}/ HTTP/1.1\r\n{}\r\n", addr, auth());
        client.write_all(request.as_bytes()).await.unwrap();
        let (head, _) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200"));

        let request = format!("GET http://{}/ HTTP/1.1\r\n\r\n", addr);
        client.write_all(request.as_bytes()).await.unwrap();
        let (head, _) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 407"));
        assert!(handle.await.unwrap().0.is_err());
    }

    #[tokio::test]
    async fn test_origin_form_request_is_bad_request() {
        let (mut client, handle) = start();
        let request = format!("GET /index.html HTTP/1.1\r\nHost: x\r\n{}\r\n", auth());
        client.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
        assert!(handle.await.unwrap().0.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_destination_is_bad_gateway() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = closed.local_addr().unwrap();
        drop(closed);

        let (mut client, handle) = start();
        let request = format!("GET http://{}/ HTTP/1.1\r\n{}\r\n", addr, auth());
        client.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(matches!(handle.await.unwrap().0, Err(Error::Dial { .. })));
    }

    #[tokio::test]
    async fn test_slow_response_body_outlasts_idle_timeout() {
        let addr = scripted_origin(|mut conn| async move {
            conn.read_head().await.unwrap().unwrap();
            conn.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n")
                .await
                .unwrap();
            for b in b"0123456789" {
                tokio::time::sleep(Duration::from_millis(100)).await;
                conn.write_all(&[*b]).await.unwrap();
            }
        })
        .await;

        let ctx = ctx().with_relay(Relay::new(Duration::from_millis(300)));
        let (mut client, handle) = start_with(ctx);
        let request = format!("GET http://{}/slow HTTP/1.1\r\n{}\r\n", addr, auth());
        client.write_all(request.as_bytes()).await.unwrap();
        let (head, body) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body, "0123456789");

        drop(client);
        let (result, session) = handle.await.unwrap();
        result.unwrap();
        assert!(session.bytes_down() >= 10);
    }

    #[tokio::test]
    async fn test_silent_origin_is_gateway_timeout() {
        let addr = scripted_origin(|mut conn| async move {
            conn.read_head().await.unwrap().unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;

        let ctx = ctx().with_relay(Relay::new(Duration::from_millis(200)));
        let (mut client, handle) = start_with(ctx);
        let request = format!("GET http://{}/ HTTP/1.1\r\n{}\r\n", addr, auth());
        client.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 504 Gateway Timeout\r\n"));
        assert!(matches!(handle.await.unwrap().0, Err(Error::IdleTimeout(_))));
    }

    #[tokio::test]
    async fn test_closed_keep_alive_upstream_is_redialed() {
        // Answers one request per connection, then hangs up without saying so
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let mut conn = HttpConn::new(stream);
                if let Ok(Some(_)) = conn.read_head().await {
                    let _ = conn
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                        .await;
                }
            }
        });

        let (mut client, handle) = start();
        for _ in 0..2 {
            let request = format!("GET http://{}/ HTTP/1.1\r\n{}\r\n", addr, auth());
            client.write_all(request.as_bytes()).await.unwrap();
            let (head, body) = read_response(&mut client).await;
            assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
            assert_eq!(body, "ok");
        }
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 2);

        drop(client);
        handle.await.unwrap().0.unwrap();
    }

    #[test]
    fn test_gateway_status() {
        assert_eq!(gateway_status(&Error::DialTimeout("x".into())), 504);
        assert_eq!(gateway_status(&Error::IdleTimeout(Duration::from_secs(1))), 504);
        assert_eq!(gateway_status(&Error::Resolve("x".into())), 502);
    }
}
