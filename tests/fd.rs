#![deny(rust_2018_idioms)]

//! File-descriptor accounting. This lives in its own test binary so the
//! process-wide fd table is not disturbed by concurrently running tests.

mod support;

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time;

use spliced::{Proxy, ProxyConfig, ProxyHandle, ResolverBackend};
use support::{read_head, read_to_end, run_local};

fn count_fds() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

async fn wait_for_no_sessions(handle: &ProxyHandle) {
    for _ in 0..200 {
        if handle.session_count() == 0 {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("sessions never drained: {}", handle.dump());
}

#[test]
fn sessions_do_not_leak_file_descriptors() {
    run_local(async {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_port = origin.local_addr().unwrap().port();
        // the host is an IP literal, so no name server traffic happens
        let config = ProxyConfig {
            listen: vec!["127.0.0.1:0".parse().unwrap()],
            name_server: Some("127.0.0.1:1".parse().unwrap()),
            resolver: ResolverBackend::Stub,
            receive_timeout: Duration::from_secs(5),
            allow_headers: vec!["Host".into()],
            ..ProxyConfig::default()
        };
        let proxy = Proxy::bind(config).await.unwrap();
        let proxy_addr = proxy.local_addrs()[0];
        let handle = proxy.handle();
        tokio::task::spawn_local(async move {
            let _ = proxy.run().await;
        });

        tokio::task::spawn_local(async move {
            loop {
                let (mut stream, _) = origin.accept().await.unwrap();
                tokio::task::spawn_local(async move {
                    let _ = read_head(&mut stream).await;
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK")
                        .await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        let baseline = count_fds();
        for _ in 0..5 {
            let mut client = TcpStream::connect(proxy_addr).await.unwrap();
            client
                .write_all(
                    format!(
                        "GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n",
                        origin_port
                    )
                    .as_bytes(),
                )
                .await
                .unwrap();
            let response = read_to_end(&mut client).await;
            assert!(response.starts_with(b"HTTP/1.1 200 OK"));
        }
        wait_for_no_sessions(&handle).await;

        let mut fds = count_fds();
        for _ in 0..100 {
            if fds <= baseline {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
            fds = count_fds();
        }
        assert_eq!(fds, baseline, "leaked file descriptors");
    });
}
