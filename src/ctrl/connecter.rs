use std::io::prelude::*;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

fn stream_write(stream: &mut &TcpStream, buf: &[u8]) -> Result<()> {
    stream.write_all(&buf.len().to_le_bytes())?;
    stream.write_all(buf)?;
    Ok(())
}

fn stream_read(stream: &mut &TcpStream) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; std::mem::size_of::<usize>()];
    stream.read_exact(&mut len_buf)?;
    let len = usize::from_le_bytes(len_buf);

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// Which side of a [`Connecter`] this process is on.
///
/// The active side initiated the TCP connection (the RPC client); the
/// passive side accepted it (the RPC server). The two sides must pick
/// opposite roles so that a send on one side always lines up with a
/// receive on the other — otherwise both ends would block reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Active,
    Passive,
}

/// A TCP control channel used to bootstrap one RDMA connection: exchange
/// queue-pair endpoints and remote memory handles before any verb is
/// posted. Stands in for the connection-manager's address/route
/// resolution and private-data payload.
pub struct Connecter {
    stream: TcpStream,
    role: Role,
}

impl Connecter {
    /// Connect to `addr`, retrying until the peer is listening. This process
    /// becomes the [`Role::Active`] side.
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = loop {
            match TcpStream::connect(addr) {
                Ok(stream) => break stream,
                Err(_) => std::thread::sleep(Duration::from_millis(100)),
            }
        };
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            role: Role::Active,
        })
    }

    /// Wrap an already-accepted stream. This process becomes the
    /// [`Role::Passive`] side.
    pub fn from_accepted(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            role: Role::Passive,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Exchange a JSON-serializable value with the peer: send ours, receive
    /// theirs. Ordering is fixed by [`Role`] so the two sides never both
    /// block on a read.
    pub fn exchange<T: Serialize + DeserializeOwned>(&self, local: &T) -> Result<T> {
        let payload = serde_json::to_vec(local).context("serialize handshake payload")?;
        let mut stream = &self.stream;

        let received = match self.role {
            Role::Active => {
                stream_write(&mut stream, &payload)?;
                stream_read(&mut stream)?
            }
            Role::Passive => {
                let buf = stream_read(&mut stream)?;
                stream_write(&mut stream, &payload)?;
                buf
            }
        };
        serde_json::from_slice(&received).context("deserialize handshake payload")
    }

    /// Send a JSON-serializable value without expecting a reply.
    pub fn send<T: Serialize>(&self, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        let mut stream = &self.stream;
        stream_write(&mut stream, &payload)
    }

    /// Receive a JSON-serializable value sent via [`Connecter::send`].
    pub fn recv<T: DeserializeOwned>(&self) -> Result<T> {
        let mut stream = &self.stream;
        let buf = stream_read(&mut stream)?;
        Ok(serde_json::from_slice(&buf)?)
    }
}
