//! A tiny echo server and a single client call against it.
//!
//! Run the server in one terminal and the client in another:
//!
//! ```sh
//! cargo run --example echo -- server 127.0.0.1:7871
//! cargo run --example echo -- client 127.0.0.1:7871
//! ```

use std::env;
use std::thread;
use std::time::Duration;

use rdma_rpc::rpc::{Client, Server};

const ECHO_RPC: u32 = 0;

fn run_server(addr: &str) -> anyhow::Result<()> {
    let (host, port) = addr.rsplit_once(':').expect("addr must be host:port");
    let server = Server::new(host, port.parse()?)?;
    server.register_handler(ECHO_RPC, |req: &[u8]| req.to_vec())?;

    // Runs until the process is killed; `Server::stop` is for an embedder
    // that wires up its own signal handler.
    server.run()?;
    Ok(())
}

fn run_client(addr: &str) -> anyhow::Result<()> {
    let (host, port) = addr.rsplit_once(':').expect("addr must be host:port");
    let client = Client::new()?;
    let conn = client.connect(host, port.parse()?)?;

    let req = b"hello from 0";
    let resp = client.call(conn, ECHO_RPC, req)?;
    assert_eq!(resp, req);
    println!("echoed {} bytes: {:?}", resp.len(), String::from_utf8_lossy(&resp));

    // Let the completion poller settle before tearing the connection down.
    thread::sleep(Duration::from_millis(10));
    client.disconnect(conn);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let mut args = env::args().skip(1);
    let mode = args.next().unwrap_or_else(|| "client".into());
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:7871".into());

    match mode.as_str() {
        "server" => run_server(&addr),
        "client" => run_client(&addr),
        other => anyhow::bail!("unknown mode {other:?}, expected \"server\" or \"client\""),
    }
}
