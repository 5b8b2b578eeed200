use std::io::{self, Read};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound for a single protocol line, relay bytes never come this early.
pub const MAX_LINE_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientToServer {
	/// Client -> Server; first line on the service port.
	/// This connection becomes the control channel for the given listen port.
	Control { listen_port: u16 },
	/// Client -> Server; first line on the service port.
	/// This connection is the destination side of the pending socket part.
	Connect { listen_port: u16, socket_part_key: String },
	/// Client -> Server; control channel keep-alive.
	Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerToClient {
	/// Server -> Client; control channel.
	/// An external connection is waiting, the client should dial back with this key.
	ClientWait { socket_part_key: String },
}

/// Encodes a message as one newline terminated JSON line.
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<Vec<u8>> {
	let mut line = serde_json::to_vec(message)?;
	line.push(b'\n');
	Ok(line)
}

pub fn decode_line<'a, T: Deserialize<'a>>(line: &'a str) -> serde_json::Result<T> {
	serde_json::from_str(line.trim())
}

/// Reads one line byte by byte so that nothing after the newline is consumed.
pub async fn read_line<R>(reader: &mut R, max_len: usize) -> io::Result<String>
where
	R: AsyncRead + Unpin,
{
	let mut buf = Vec::with_capacity(128);
	loop {
		let mut byte = [0_u8; 1];
		let n = reader.read(&mut byte).await?;
		if !push_line_byte(&mut buf, &byte[..n], max_len)? {
			break;
		}
	}
	line_from_bytes(buf)
}

/// Blocking twin of [`read_line`], used by the control channel receive thread.
pub fn read_line_blocking<R: Read>(reader: &mut R, max_len: usize) -> io::Result<String> {
	let mut buf = Vec::with_capacity(128);
	loop {
		let mut byte = [0_u8; 1];
		let n = match reader.read(&mut byte) {
			Ok(n) => n,
			Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
			Err(e) => return Err(e),
		};
		if !push_line_byte(&mut buf, &byte[..n], max_len)? {
			break;
		}
	}
	line_from_bytes(buf)
}

/// Returns `false` once the line is complete.
fn push_line_byte(buf: &mut Vec<u8>, read: &[u8], max_len: usize) -> io::Result<bool> {
	let Some(&byte) = read.first() else {
		if buf.is_empty() {
			return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stream closed"));
		}
		return Ok(false);
	};
	if byte == b'\n' {
		return Ok(false);
	}
	if buf.len() >= max_len {
		return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
	}
	if byte != b'\r' {
		buf.push(byte);
	}
	Ok(true)
}

fn line_from_bytes(buf: Vec<u8>) -> io::Result<String> {
	String::from_utf8(buf).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid UTF-8"))
}
