//! Framed bidirectional channel over any byte stream.
//!
//! Reads and writes are independently locked so one reader and one writer can be
//! active at the same time. Concurrent readers are serialized by the read lock;
//! callers that need fan-out (the worker) run a single pumping reader.
//!
//! `close()` is idempotent. It wakes any pending receive, and every later send or
//! receive fails with `ChannelError::Closed`.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::codec::{CodecError, JsonCodec};
use super::protocol::Frame;

pub type BoxReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// A value could not be encoded or decoded. The channel itself is still usable.
#[derive(Debug, Clone, thiserror::Error)]
#[error("serialization failed: {message}")]
pub struct SerializationError {
    message: String,
}

impl SerializationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for SerializationError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Closed locally; no further traffic is possible.
    #[error("channel closed")]
    Closed,
    /// The peer closed its end (EOF).
    #[error("channel closed by peer")]
    Disconnected,
    #[error("channel I/O failed: {0}")]
    Io(#[source] std::io::Error),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error("receive cancelled")]
    Cancelled,
}

impl ChannelError {
    /// Transport-level failures after which the channel should be considered dead.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Serialization(_) | Self::Cancelled)
    }
}

impl From<CodecError> for ChannelError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Self::Disconnected,
            CodecError::Io(e) => Self::Io(e),
            CodecError::Malformed(m) => Self::Malformed(m),
            CodecError::Encode(e) => Self::Serialization(e.into()),
        }
    }
}

pub struct Channel {
    reader: Mutex<FramedRead<BoxReader, JsonCodec<Frame>>>,
    writer: Mutex<FramedWrite<BoxWriter, JsonCodec<Frame>>>,
    closed: CancellationToken,
    broken: AtomicBool,
}

impl Channel {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Self::from_halves(Box::pin(read), Box::pin(write))
    }

    pub fn from_halves(reader: BoxReader, writer: BoxWriter) -> Self {
        Self::with_max_frame_length(reader, writer, super::codec::DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(reader: BoxReader, writer: BoxWriter, max: usize) -> Self {
        Self {
            reader: Mutex::new(FramedRead::new(reader, JsonCodec::with_max_frame_length(max))),
            writer: Mutex::new(FramedWrite::new(writer, JsonCodec::with_max_frame_length(max))),
            closed: CancellationToken::new(),
            broken: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.broken.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            tracing::trace!("Closing channel");
            self.closed.cancel();
        }
    }

    /// Serialize `value` and send it as a data frame.
    ///
    /// Serialization happens before anything is written, so a
    /// `SerializationError` leaves the stream untouched.
    pub async fn send<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), ChannelError> {
        let value = serde_json::to_value(value).map_err(SerializationError::from)?;
        self.send_frame(Frame::data(value)).await
    }

    pub async fn send_frame(&self, frame: Frame) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let mut writer = self.writer.lock().await;
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        writer.send(frame).await.map_err(|e| {
            let err = ChannelError::from(e);
            if err.is_fatal() {
                self.broken.store(true, Ordering::Release);
            }
            err
        })
    }

    /// Receive the next frame of any kind.
    pub async fn receive_frame(&self, cancel: &CancellationToken) -> Result<Frame, ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }

        let mut reader = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(ChannelError::Closed),
            _ = cancel.cancelled() => return Err(ChannelError::Cancelled),
            guard = self.reader.lock() => guard,
        };

        let next = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(ChannelError::Closed),
            _ = cancel.cancelled() => return Err(ChannelError::Cancelled),
            next = reader.next() => next,
        };

        match next {
            Some(Ok(Ok(frame))) => Ok(frame),
            Some(Ok(Err(e))) => Err(SerializationError::from(e).into()),
            Some(Err(e)) => {
                self.broken.store(true, Ordering::Release);
                Err(e.into())
            }
            None => {
                self.broken.store(true, Ordering::Release);
                Err(ChannelError::Disconnected)
            }
        }
    }

    /// Receive the next data frame and decode it as `T`.
    ///
    /// An exit frame is a protocol violation on this path.
    pub async fn receive<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
    ) -> Result<T, ChannelError> {
        match self.receive_frame(cancel).await? {
            Frame::Data { value } => {
                Ok(serde_json::from_value(value).map_err(SerializationError::from)?)
            }
            Frame::Exit { .. } => Err(ChannelError::Malformed(
                "unexpected exit frame on data path".to_string(),
            )),
        }
    }

    /// Flush and shut down the write half so the peer observes EOF.
    pub async fn shutdown(&self) -> Result<(), ChannelError> {
        let mut writer = self.writer.lock().await;
        let result = writer.close().await.map_err(ChannelError::from);
        self.close();
        result
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Two connected in-memory channels.
pub fn pair() -> (Channel, Channel) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (Channel::new(a), Channel::new(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serializer;
    use serde_json::json;
    use std::time::Duration;

    struct FileHandle;

    impl Serialize for FileHandle {
        fn serialize<S: Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("file handles cannot cross a channel"))
        }
    }

    #[tokio::test]
    async fn values_arrive_in_order() {
        let (a, b) = pair();
        let never = CancellationToken::new();

        for v in [json!(1), json!("two"), json!({"three": [3]}), json!(null)] {
            a.send(&v).await.unwrap();
        }

        assert_eq!(b.receive::<serde_json::Value>(&never).await.unwrap(), json!(1));
        assert_eq!(b.receive::<String>(&never).await.unwrap(), "two");
        assert_eq!(
            b.receive::<serde_json::Value>(&never).await.unwrap(),
            json!({"three": [3]})
        );
        assert_eq!(b.receive::<Option<i32>>(&never).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unserializable_value_does_not_poison_channel() {
        let (a, b) = pair();
        let never = CancellationToken::new();

        let err = a.send(&FileHandle).await.unwrap_err();
        assert!(matches!(err, ChannelError::Serialization(_)));
        assert!(!err.is_fatal());

        a.send(&"still fine").await.unwrap();
        assert_eq!(b.receive::<String>(&never).await.unwrap(), "still fine");
    }

    #[tokio::test]
    async fn decode_mismatch_is_a_serialization_error() {
        let (a, b) = pair();
        let never = CancellationToken::new();

        a.send(&"not a number").await.unwrap();
        a.send(&42).await.unwrap();

        let err = b.receive::<u32>(&never).await.unwrap_err();
        assert!(matches!(err, ChannelError::Serialization(_)));
        assert_eq!(b.receive::<u32>(&never).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn close_wakes_pending_receive() {
        let (a, _b) = pair();
        let a = std::sync::Arc::new(a);
        let never = CancellationToken::new();

        let reader = {
            let a = std::sync::Arc::clone(&a);
            tokio::spawn(async move { a.receive_frame(&never).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.close();
        a.close();

        let err = reader.await.unwrap().unwrap_err();
        assert!(matches!(err, ChannelError::Closed));
        assert!(matches!(a.send(&1).await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn peer_drop_is_disconnected() {
        let (a, b) = pair();
        drop(a);
        let err = b
            .receive_frame(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Disconnected));
        assert!(b.is_closed());
    }

    #[tokio::test]
    async fn cancelled_receive_keeps_channel_usable() {
        let (a, b) = pair();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = b.receive_frame(&cancel).await.unwrap_err();
        assert!(matches!(err, ChannelError::Cancelled));

        a.send(&"later").await.unwrap();
        let value: String = b.receive(&CancellationToken::new()).await.unwrap();
        assert_eq!(value, "later");
    }
}
