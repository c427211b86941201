use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single RPC frame. A frame larger than this indicates a
/// corrupt stream or a peer speaking a different protocol.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame length {0} exceeds maximum of {MAX_FRAME_BYTES} bytes")]
    FrameTooLarge(usize),
    #[error("malformed frame body: {0}")]
    Malformed(#[from] prost::DecodeError),
    #[error("stream failure: {0}")]
    Io(#[from] std::io::Error),
}

pub async fn write_frame<M, W>(stream: &mut W, message: &M) -> Result<(), FrameError>
where
    M: Message,
    W: AsyncWrite + Unpin,
{
    let mut body = Vec::with_capacity(message.encoded_len());
    message
        .encode(&mut body)
        .map_err(|e| FrameError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    if body.len() > MAX_FRAME_BYTES {
        return Err(FrameError::FrameTooLarge(body.len()));
    }

    stream.write_u32(body.len() as u32).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame. `Ok(None)` means the peer closed the
/// connection cleanly between frames.
pub async fn read_frame<M, R>(stream: &mut R) -> Result<Option<M>, FrameError>
where
    M: Message + Default,
    R: AsyncRead + Unpin,
{
    let len = match stream.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(FrameError::Io(e)),
    };

    if len > MAX_FRAME_BYTES {
        return Err(FrameError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;

    let message = M::decode(body.as_slice())?;
    Ok(Some(message))
}
