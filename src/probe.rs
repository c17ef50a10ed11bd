use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};

use crate::codec::{self, ProtocolError, MAX_VARINT_LEN};
use crate::types::{Candidate, ProbeFailure, ProbeResult, StatusReport, StatusResponse};

/// Parameters shared by every probe of a scan.
#[derive(Debug, Clone, Copy)]
pub struct ProbeOptions {
    /// Deadline for connect, handshake and status round trip together.
    pub timeout: Duration,
    /// Protocol version announced in the handshake.
    pub protocol_version: i32,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1500),
            protocol_version: 47,
        }
    }
}

/// Run the handshake + status exchange against one candidate.
///
/// - The whole exchange is bounded by `opts.timeout` via `tokio::time::timeout`.
/// - Never returns an error: every failure is folded into `ProbeResult::Failed`.
/// - Touches no shared state; the connection is dropped before returning.
pub async fn probe(candidate: Candidate, opts: ProbeOptions) -> ProbeResult {
    match time::timeout(opts.timeout, exchange(candidate, opts.protocol_version)).await {
        Ok(Ok(report)) => ProbeResult::Responded(report),
        Ok(Err(failure)) => ProbeResult::Failed(failure),
        Err(_elapsed) => ProbeResult::Failed(ProbeFailure::Timeout),
    }
}

async fn exchange(candidate: Candidate, protocol_version: i32) -> Result<StatusReport, ProbeFailure> {
    let mut stream = TcpStream::connect(SocketAddr::V4(candidate.0))
        .await
        .map_err(|e| ProbeFailure::from_io(e, false))?;
    // Two small writes back to back; don't let Nagle hold the second one.
    let _ = stream.set_nodelay(true);

    let mut request =
        codec::handshake_packet(protocol_version, &candidate.ip().to_string(), candidate.port());
    request.extend_from_slice(&codec::status_request_packet());

    let start = Instant::now();
    stream
        .write_all(&request)
        .await
        .map_err(|e| ProbeFailure::from_io(e, true))?;
    let payload = read_frame(&mut stream).await?;
    let latency = start.elapsed();

    let json = codec::decode_status_payload(&payload)?;
    let status = StatusResponse::from_json(&json)?;
    Ok(StatusReport { status, latency })
}

/// Read one length-prefixed frame and return its payload (packet id + body).
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, ProbeFailure>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; MAX_VARINT_LEN];
    let mut used = 0;
    loop {
        let byte = reader
            .read_u8()
            .await
            .map_err(|e| ProbeFailure::from_io(e, true))?;
        prefix[used] = byte;
        used += 1;
        if byte & 0x80 == 0 {
            break;
        }
        if used == MAX_VARINT_LEN {
            return Err(ProtocolError::VarIntTooLong.into());
        }
    }

    let (len, _) = codec::decode_varint(&prefix[..used])?;
    let len = codec::checked_len(len)?;
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| ProbeFailure::from_io(e, true))?;
    Ok(payload)
}
