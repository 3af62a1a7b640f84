//! Both halves of a rank-to-rank link.
//!
//! Every frame is a big-endian `u64` length followed by that many body bytes.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{Deserialize, FrameWord, Serialize};

type LenType = u64;
const LEN_SIZE: usize = size_of::<LenType>();

/// Frames longer than this are refused before allocating for them.
pub const MAX_FRAME_LEN: usize = 1 << 31;

/// The receiving half of a link.
pub struct LinkReceiver<R: AsyncRead + Unpin> {
    rx: R,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> LinkReceiver<R> {
    pub(crate) fn new(rx: R) -> Self {
        Self {
            rx,
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    /// Lowers (or raises) the largest frame this receiver accepts.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Waits for the next frame and decodes it.
    ///
    /// # Arguments
    /// * `buf` - Backing store of the frame body. The returned `T` borrows from it, and
    ///           it only ever grows so it can be reused across calls.
    ///
    /// # Returns
    /// The decoded value, `UnexpectedEof` if the other end went away or `InvalidData` if
    /// the frame is too long or malformed.
    pub async fn recv_into<'buf, T, W>(&mut self, buf: &'buf mut Vec<W>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
        W: FrameWord,
    {
        let mut len_buf = [0; LEN_SIZE];
        self.rx.read_exact(&mut len_buf).await?;

        let len = usize::try_from(LenType::from_be_bytes(len_buf))
            .ok()
            .filter(|&len| len <= self.max_frame_len)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame exceeds the {} byte limit", self.max_frame_len),
                )
            })?;

        let words = len.div_ceil(size_of::<W>());
        if buf.len() < words {
            buf.resize(words, W::zeroed());
        }

        let body = &mut bytemuck::cast_slice_mut::<W, u8>(buf)[..len];
        self.rx.read_exact(body).await?;

        T::deserialize(body)
    }
}

/// The sending half of a link.
pub struct LinkSender<W: AsyncWrite + Unpin> {
    tx: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> LinkSender<W> {
    pub(crate) fn new(tx: W) -> Self {
        Self {
            tx,
            buf: Vec::new(),
        }
    }

    /// Sends `msg` as a single frame and flushes the writer.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        let Self { tx, buf } = self;

        buf.clear();
        buf.extend_from_slice(&[0; LEN_SIZE]);
        let tail = msg.serialize(buf)?;

        let len = buf.len() - LEN_SIZE + tail.map_or(0, <[u8]>::len);
        buf[..LEN_SIZE].copy_from_slice(&(len as LenType).to_be_bytes());

        tx.write_all(buf).await?;
        if let Some(tail) = tail {
            tx.write_all(tail).await?;
        }
        tx.flush().await
    }
}
