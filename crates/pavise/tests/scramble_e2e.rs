//! Scramble-layer tests: noise handshake on accept, obfuscated SOCKS.

#![allow(clippy::unwrap_used)]

use std::net::SocketAddr;

use clap::Parser;
use pavise::{cfg::ProxyArgs, Server, ServerHandle, ServerOptions};
use pavise_scramble::{noise_handshake, ScrambleStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// First bytes the listener routes directly; a scrambling client must
/// avoid them in its noise.
const LISTENER_PROTOCOL_BYTES: [u8; 6] = [0x04, 0x05, 0x16, b'G', b'P', b'C'];

/// Start a server from CLI-style arguments.
async fn start_server(extra_args: &[&str]) -> (SocketAddr, ServerHandle) {
    let mut argv = vec![
        "pavise".to_owned(),
        "--server_listen".to_owned(),
        "127.0.0.1:0".to_owned(),
    ];
    argv.extend(extra_args.iter().map(|s| (*s).to_owned()));

    let args = ProxyArgs::parse_from(argv);
    let options = ServerOptions::from_args(&args).unwrap();
    let server = Server::bind(options).await.unwrap();
    let addr = server.local_addrs()[0];
    let handle = server.handle();
    tokio::spawn(server.run());
    (addr, handle)
}

/// An echo server.
async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn scrambled_socks5_end_to_end() {
    let echo = start_echo().await;
    let (proxy, handle) = start_server(&["--scramble", "true"]).await;

    let tcp = TcpStream::connect(proxy).await.unwrap();
    let mut stream = ScrambleStream::new(tcp);
    let keys = noise_handshake(&mut stream, 0x0FFF, &LISTENER_PROTOCOL_BYTES)
        .await
        .unwrap();
    stream.install_keys(keys);

    // From here on it is ordinary SOCKS5, just unreadable on the wire.
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    stream.flush().await.unwrap();
    let mut method = [0_u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&echo.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();
    stream.flush().await.unwrap();
    let mut reply = [0_u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);

    stream.write_all(b"obfuscated payload").await.unwrap();
    stream.flush().await.unwrap();
    let mut echoed = [0_u8; 18];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"obfuscated payload");

    handle.close();
}

#[tokio::test]
async fn scrambled_listener_still_serves_plain_clients() {
    // The noise first-byte filter keeps the two kinds of client apart,
    // so enabling scramble must not break plain SOCKS.
    let echo = start_echo().await;
    let (proxy, handle) = start_server(&["--scramble", "true"]).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0_u8; 2];
    client.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&echo.port().to_be_bytes());
    client.write_all(&request).await.unwrap();
    let mut reply = [0_u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);

    client.write_all(b"plain").await.unwrap();
    let mut echoed = [0_u8; 5];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"plain");

    handle.close();
}

#[tokio::test]
async fn scrambled_chain_between_two_servers() {
    // Front and upstream both scramble; the front's connector performs
    // the client side of the noise handshake automatically.
    let echo = start_echo().await;
    let (upstream, upstream_handle) = start_server(&["--scramble", "true"]).await;
    let (front, front_handle) = start_server(&[
        "--scramble",
        "true",
        "--proxy_pass",
        &format!("socks5://127.0.0.1:{}", upstream.port()),
    ])
    .await;

    // Client side also scrambles toward the front.
    let tcp = TcpStream::connect(front).await.unwrap();
    let mut stream = ScrambleStream::new(tcp);
    let keys = noise_handshake(&mut stream, 0x0FFF, &LISTENER_PROTOCOL_BYTES)
        .await
        .unwrap();
    stream.install_keys(keys);

    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    stream.flush().await.unwrap();
    let mut method = [0_u8; 2];
    stream.read_exact(&mut method).await.unwrap();

    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&echo.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();
    stream.flush().await.unwrap();
    let mut reply = [0_u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);

    stream.write_all(b"noise all the way down").await.unwrap();
    stream.flush().await.unwrap();
    let mut echoed = [0_u8; 22];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"noise all the way down");

    front_handle.close();
    upstream_handle.close();
}
