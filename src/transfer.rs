//! Archive and text framing shared by client and daemon
//!
//! Archive transfer layout:
//!
//! ```text
//! LENGTH (8, i64 LE) | PAYLOAD (LENGTH bytes) | MARKER (12, "Tar received")
//! ```
//!
//! A LENGTH at or below [`NO_ARCHIVE_THRESHOLD`] means "no archive": neither
//! payload nor marker follows. Plain text messages are unframed; the receiver
//! takes whatever a single bounded read returns.

use std::io;

use log::warn;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::archive::ArchiveBlob;
use crate::error::{Error, Result};
use crate::protocol::{
    COMPLETION_MARKER, INVALID_COMMAND, LENGTH_HEADER_LEN, MAX_ARCHIVE_SIZE, MAX_TEXT_LEN,
    NO_ARCHIVE_THRESHOLD,
};

const READ_CHUNK: usize = 256 * 1024;

/// Build the 8-byte length header
pub fn encode_length(len: i64) -> [u8; LENGTH_HEADER_LEN] {
    len.to_le_bytes()
}

/// Parse the 8-byte length header
pub fn decode_length(header: &[u8; LENGTH_HEADER_LEN]) -> i64 {
    i64::from_le_bytes(*header)
}

/// Whether a declared length carries a payload
pub fn declares_archive(len: i64) -> bool {
    len > NO_ARCHIVE_THRESHOLD
}

/// A received archive plus the completion marker text that followed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedArchive {
    pub blob: ArchiveBlob,
    pub marker: String,
}

/// Send an archive, or just the "no archive" header when the blob is empty or negligible
pub async fn send_archive<W>(writer: &mut W, blob: &ArchiveBlob) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = blob.len() as i64;
    writer.write_all(&encode_length(len)).await?;
    if declares_archive(len) {
        writer.write_all(blob.as_bytes()).await?;
        writer.write_all(COMPLETION_MARKER).await?;
    }
    writer.flush().await?;
    Ok(())
}

pub async fn send_no_archive<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    send_archive(writer, &ArchiveBlob::empty()).await
}

pub async fn receive_archive<R>(reader: &mut R) -> Result<Option<ReceivedArchive>>
where
    R: AsyncRead + Unpin,
{
    receive_archive_with(reader, |_, _| {}).await
}

/// Receive one archive transfer, reporting `(received, total)` bytes to `progress`.
///
/// Returns `None` when the header declares no archive.
pub async fn receive_archive_with<R, F>(reader: &mut R, mut progress: F) -> Result<Option<ReceivedArchive>>
where
    R: AsyncRead + Unpin,
    F: FnMut(u64, u64),
{
    let mut header = [0u8; LENGTH_HEADER_LEN];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| Error::framing("length header", e))?;

    // The daemon answered with its rejection text instead of a header
    let rejection = INVALID_COMMAND.as_bytes();
    if header[..] == rejection[..LENGTH_HEADER_LEN] {
        let mut rest = vec![0u8; rejection.len() - LENGTH_HEADER_LEN];
        reader
            .read_exact(&mut rest)
            .await
            .map_err(|e| Error::framing("rejection text", e))?;
        return Err(Error::ServerValidation);
    }

    let len = decode_length(&header);
    if !declares_archive(len) {
        return Ok(None);
    }
    if len > MAX_ARCHIVE_SIZE {
        return Err(Error::framing(
            "length header",
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("declared archive of {} bytes exceeds {} bytes", len, MAX_ARCHIVE_SIZE),
            ),
        ));
    }

    let len = len as usize;
    let mut payload = vec![0u8; len];
    let mut filled = 0usize;
    while filled < len {
        let end = (filled + READ_CHUNK).min(len);
        let n = reader
            .read(&mut payload[filled..end])
            .await
            .map_err(|e| Error::framing("archive payload", e))?;
        if n == 0 {
            return Err(Error::framing(
                "archive payload",
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("peer closed after {} of {} bytes", filled, len),
                ),
            ));
        }
        filled += n;
        progress(filled as u64, len as u64);
    }

    let mut marker = [0u8; COMPLETION_MARKER.len()];
    reader
        .read_exact(&mut marker)
        .await
        .map_err(|e| Error::framing("completion marker", e))?;
    if &marker != COMPLETION_MARKER {
        warn!("unexpected completion marker {:?}", String::from_utf8_lossy(&marker));
    }

    Ok(Some(ReceivedArchive {
        blob: ArchiveBlob::new(payload),
        marker: String::from_utf8_lossy(&marker).into_owned(),
    }))
}

pub async fn send_text<W>(writer: &mut W, text: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// One bounded read of a plain text message; a closed peer is a framing error
pub async fn read_text<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; MAX_TEXT_LEN];
    let n = reader
        .read(&mut buf)
        .await
        .map_err(|e| Error::framing("text response", e))?;
    if n == 0 {
        return Err(Error::framing(
            "text response",
            io::ErrorKind::UnexpectedEof.into(),
        ));
    }
    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}

/// Read one `\n`-terminated command line; `None` once the peer has closed
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = reader
        .take(MAX_TEXT_LEN as u64)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if n == MAX_TEXT_LEN && buf.last() != Some(&b'\n') {
        return Err(Error::framing(
            "command line",
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("command line exceeds {} bytes", MAX_TEXT_LEN),
            ),
        ));
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}
