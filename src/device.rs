//! Raw TCP listener for scanning devices.
//!
//! A device opens a connection, identifies itself with a `HELLO` record and
//! then streams `;`-delimited samples. Every read is ingested as one batch
//! and answered with a single text line:
//!
//! ```text
//! -> HELLO,alice;
//! <- READY 6f1c...
//! -> 0,1000,50,0;90,2000,60,0;
//! <- ACK 91ab... 2 collecting
//! -> END;
//! <- ACK 91ab... 2 completed
//! ```
//!
//! Errors are answered with `ERR <kind> <message>`.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::IngestError;
use crate::ingest::{IngestOutcome, Ingestor};
use crate::models::MeasurementId;
use crate::reassembler::Reassembler;
use crate::session::IngestSession;

/// Largest fragment held back while waiting for a delimiter.
pub const MAX_FRAGMENT: usize = 1 << 20;

/// Record that finalizes the current measurement.
pub const END_MARKER: &str = "END";

/// Error reason recorded when a connection goes quiet.
pub const IDLE_REASON: &str = "idle timeout";

const READ_BUF: usize = 8 * 1024;

// ---

/// Parsed `HELLO,<owner>[,<form id>[,<measurement id>]]` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    // ---
    pub token: String,
    pub form_id: Option<Uuid>,
    pub resume: Option<MeasurementId>,
}

impl Handshake {
    // ---
    pub fn parse(record: &str) -> Option<Handshake> {
        // ---
        let mut fields = record.trim().split(',').map(str::trim);
        if fields.next()? != "HELLO" {
            return None;
        }
        let token = fields.next().filter(|t| !t.is_empty())?.to_string();
        let form_id = optional_uuid(fields.next())?;
        let resume = optional_uuid(fields.next())?;
        if fields.next().is_some() {
            return None;
        }

        Some(Handshake {
            token,
            form_id,
            resume,
        })
    }
}

/// `Some(None)` for an absent or empty field, `None` for a malformed one.
fn optional_uuid(field: Option<&str>) -> Option<Option<Uuid>> {
    match field {
        None | Some("") => Some(None),
        Some(raw) => Uuid::try_parse(raw).ok().map(Some),
    }
}

enum Ending {
    Closed,
    Idle,
}

/// Accept device connections until the listener fails.
pub async fn serve(listener: TcpListener, ingestor: Ingestor, idle: Duration) -> io::Result<()> {
    // ---
    info!("Device listener on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Device accept failed: {}", e);
                continue;
            }
        };

        let ingestor = ingestor.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer.ip().to_string(), ingestor, idle).await
            {
                warn!("Device connection {} ended with I/O error: {}", peer, e);
            }
        });
    }
}

/// Drive one device connection from handshake to close.
#[instrument(skip_all, fields(peer = %peer))]
pub async fn handle_connection<S>(
    mut stream: S,
    peer: String,
    ingestor: Ingestor,
    idle: Duration,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ---
    let mut buf = vec![0u8; READ_BUF];
    let mut reassembler = Reassembler::new();

    let (hello, rest) = loop {
        let n = match timeout(idle, stream.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => {
                debug!("No handshake within {:?}", idle);
                return Ok(());
            }
        };
        if n == 0 {
            return Ok(());
        }

        let mut records = reassembler.push(&buf[..n]);
        if let Some(first) = records.next() {
            break (first, records.collect::<Vec<_>>());
        }
        if reassembler.pending_len() > MAX_FRAGMENT {
            return write_line(&mut stream, "ERR oversized_record handshake too long").await;
        }
    };

    let Some(handshake) = Handshake::parse(&hello) else {
        return write_line(
            &mut stream,
            "ERR handshake expected HELLO,<owner>[,<form id>[,<measurement id>]]",
        )
        .await;
    };

    let owner = match ingestor.resolve(&handshake.token).await {
        Ok(owner) => owner,
        Err(e) => {
            warn!("Device handshake refused: {}", e);
            return write_line(&mut stream, &error_line(&e)).await;
        }
    };

    let mut session =
        IngestSession::with_reassembler(owner, peer.as_str(), reassembler).with_form(handshake.form_id);
    if let Some(id) = handshake.resume {
        session.resume(id);
    }
    info!("Device connected as owner {}", owner);
    write_line(&mut stream, &format!("READY {owner}")).await?;

    match pump(&mut stream, &mut session, &ingestor, rest, idle, &mut buf).await {
        Ok(Ending::Closed) => session.close(&ingestor).await,
        Ok(Ending::Idle) => {
            info!("Device idle for {:?}, dropping connection", idle);
            session.abandon(&ingestor, IDLE_REASON).await;
        }
        Err(e) => {
            session.close(&ingestor).await;
            return Err(e);
        }
    }

    Ok(())
}

async fn pump<S>(
    stream: &mut S,
    session: &mut IngestSession,
    ingestor: &Ingestor,
    first: Vec<String>,
    idle: Duration,
    buf: &mut [u8],
) -> io::Result<Ending>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ---
    dispatch(stream, session, ingestor, first).await?;

    loop {
        let n = match timeout(idle, stream.read(buf)).await {
            Ok(read) => read?,
            Err(_) => return Ok(Ending::Idle),
        };
        if n == 0 {
            return Ok(Ending::Closed);
        }

        let records = session.reassemble(&buf[..n]);
        if session.pending_len() > MAX_FRAGMENT {
            write_line(stream, "ERR oversized_record record exceeds 1 MiB without delimiter")
                .await?;
            return Ok(Ending::Closed);
        }
        dispatch(stream, session, ingestor, records).await?;
    }
}

/// Ingest one read's records, cutting the batch at every `END` marker.
async fn dispatch<S>(
    stream: &mut S,
    session: &mut IngestSession,
    ingestor: &Ingestor,
    records: Vec<String>,
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    // ---
    let mut batch = Vec::new();
    for record in records {
        if record.trim() == END_MARKER {
            let finished = std::mem::take(&mut batch);
            respond(stream, session.ingest_records(ingestor, finished, true).await).await?;
        } else {
            batch.push(record);
        }
    }

    if !batch.is_empty() {
        respond(stream, session.ingest_records(ingestor, batch, false).await).await?;
    }
    Ok(())
}

async fn respond<S>(
    stream: &mut S,
    result: Result<Option<IngestOutcome>, IngestError>,
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    // ---
    match result {
        Ok(Some(outcome)) => {
            let line = format!(
                "ACK {} {} {}",
                outcome.measurement_id, outcome.total_points, outcome.status
            );
            write_line(stream, &line).await
        }
        Ok(None) => Ok(()),
        Err(e) => {
            if let IngestError::Storage(_) = e {
                error!("Device batch not stored: {}", e);
            } else {
                debug!("Device batch refused: {}", e);
            }
            write_line(stream, &error_line(&e)).await
        }
    }
}

fn error_line(e: &IngestError) -> String {
    format!("ERR {} {}", e.kind(), e)
}

async fn write_line<S>(stream: &mut S, line: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    // ---
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await
}
