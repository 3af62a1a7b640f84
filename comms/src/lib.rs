mod codec;
mod link;
pub mod msg;
pub mod specs;

use tokio::io::{AsyncRead, AsyncWrite};

pub use codec::{Deserialize, FrameWord, Serialize};
pub use link::{LinkReceiver, LinkSender, MAX_FRAME_LEN};

/// Creates both halves of a rank-to-rank link.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// The receiving and sending halves.
pub fn channel<R, W>(rx: R, tx: W) -> (LinkReceiver<R>, LinkSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (LinkReceiver::new(rx), LinkSender::new(tx))
}
