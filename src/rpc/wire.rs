//! Framing for the master/worker protocol: length-delimited JSON envelopes
//! over a duplex TCP stream. The wire encoding itself is deliberately plain;
//! the contract lives in the method names and argument shapes (`proto`).

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::Result;

/// What a session is for. Workers are registered in the node table and may
/// be assigned work; clients only make calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    Worker,
    Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    /// First frame of every session: credentials and role.
    Login {
        key: String,
        secret: String,
        role: SessionRole,
    },
    LoginAck {
        accepted: bool,
    },
    /// A call expecting a reply with the same id.
    Call {
        id: u64,
        method: String,
        args: Value,
    },
    /// A one-way call; no reply is ever sent.
    Notify {
        method: String,
        args: Value,
    },
    Reply {
        id: u64,
        result: Value,
    },
    Error {
        id: u64,
        code: String,
        message: String,
    },
}

pub type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

pub fn frame(stream: TcpStream) -> FramedStream {
    Framed::new(stream, LengthDelimitedCodec::new())
}

pub async fn send(framed: &mut FramedStream, envelope: &Envelope) -> Result<()> {
    let bytes = serde_json::to_vec(envelope)?;
    framed.send(Bytes::from(bytes)).await?;
    Ok(())
}

/// Receive the next envelope, or `None` if the peer closed the stream.
pub async fn recv(framed: &mut FramedStream) -> Result<Option<Envelope>> {
    match framed.next().await {
        Some(frame) => {
            let bytes = frame?;
            Ok(Some(serde_json::from_slice(&bytes)?))
        }
        None => Ok(None),
    }
}
