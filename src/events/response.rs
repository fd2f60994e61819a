//! Streaming response from the events endpoint.
//!
//! A background task reads the NDJSON body one line at a time and hands each
//! decoded [`Event`] to whichever consumer asks next, through a bounded
//! channel. The task is the only closer of that channel; [`Response::close`]
//! only signals it and waits for it to exit.

use std::io;
use std::sync::{Arc, Mutex};

use futures_util::{Stream, TryStreamExt};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::event::Event;
use crate::events::fetch::FetchError;

/// Events buffered between the decoder and consumers.
pub const DEFAULT_EVENT_BUFFER: usize = 10;
/// Response header carrying the server-side operation id.
pub const OPERATION_ID_HEADER: &str = "ua-operation-id";
/// Longest NDJSON line accepted before the stream is abandoned.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// Why an event stream stopped.
#[derive(Clone, Debug, Error)]
pub enum StreamError {
    /// The server closed the stream cleanly. Not a failure.
    #[error("end of event stream")]
    EndOfStream,

    /// An event envelope could not be decoded.
    #[error("failed to decode event: {0}")]
    Decode(Arc<serde_json::Error>),

    /// Reading the response body failed.
    #[error("failed to read event stream: {0}")]
    Io(Arc<io::Error>),

    /// A line exceeded the given byte limit without a newline.
    #[error("event line exceeds {0} bytes")]
    LineTooLong(usize),
}

impl StreamError {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }
}

/// Consumer handle for a response's events.
///
/// Clones share one channel: every event is delivered to exactly one
/// caller. `recv` returns `None` once the stream has terminated.
#[derive(Clone, Debug)]
pub struct Events {
    rx: Arc<AsyncMutex<mpsc::Receiver<Event>>>,
}

impl Events {
    pub async fn recv(&self) -> Option<Event> {
        self.rx.lock().await.recv().await
    }

    /// Adapts the handle into a [`Stream`] of events.
    pub fn into_stream(self) -> impl Stream<Item = Event> + Send + 'static {
        futures_util::stream::unfold(self, |events| async move {
            let event = events.recv().await?;
            Some((event, events))
        })
    }
}

/// Live event stream returned by [`fetch`](crate::events::fetch).
///
/// Drain [`Response::events`] until it ends, then consult
/// [`Response::err`]. Dropping the response closes the stream.
#[derive(Debug)]
pub struct Response {
    id: Option<String>,
    events: Events,
    terminal: Arc<Mutex<Option<StreamError>>>,
    cancel: CancellationToken,
    producer: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Response {
    /// Wraps an HTTP response from the events endpoint.
    ///
    /// Must be called within a Tokio runtime.
    pub fn from_http(response: reqwest::Response) -> Result<Self, FetchError> {
        Self::from_http_with_capacity(response, DEFAULT_EVENT_BUFFER)
    }

    /// Like [`Response::from_http`] with an explicit hand-off capacity
    /// (minimum 1).
    pub fn from_http_with_capacity(
        response: reqwest::Response,
        capacity: usize,
    ) -> Result<Self, FetchError> {
        match response.status() {
            StatusCode::OK => {}
            StatusCode::PAYMENT_REQUIRED => return Err(FetchError::RateLimited),
            status => return Err(FetchError::UnexpectedStatus(status)),
        }

        let id = response
            .headers()
            .get(OPERATION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = StreamReader::new(response.bytes_stream().map_err(io::Error::other));

        Ok(Self::spawn(id, body, capacity))
    }

    fn spawn<R>(id: Option<String>, reader: R, capacity: usize) -> Self
    where
        R: AsyncBufRead + Send + 'static,
    {
        Self::spawn_with_line_limit(id, reader, capacity, MAX_LINE_BYTES)
    }

    fn spawn_with_line_limit<R>(
        id: Option<String>,
        reader: R,
        capacity: usize,
        max_line: usize,
    ) -> Self
    where
        R: AsyncBufRead + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let terminal = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();

        let producer = tokio::spawn(produce(
            reader,
            max_line,
            tx,
            cancel.clone(),
            Arc::clone(&terminal),
        ));

        Self {
            id,
            events: Events {
                rx: Arc::new(AsyncMutex::new(rx)),
            },
            terminal,
            cancel,
            producer: AsyncMutex::new(Some(producer)),
        }
    }

    /// Operation id reported by the server, if any.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Returns a handle to the shared event channel.
    pub fn events(&self) -> Events {
        self.events.clone()
    }

    /// Receives the next event; `None` once the stream has terminated.
    pub async fn recv(&self) -> Option<Event> {
        self.events.recv().await
    }

    /// Error that ended the stream, if it has ended on its own.
    ///
    /// A clean end surfaces as [`StreamError::EndOfStream`]. Streams stopped
    /// by [`Response::close`] report `None`.
    pub fn err(&self) -> Option<StreamError> {
        self.terminal
            .lock()
            .map(|slot| slot.clone())
            .unwrap_or(None)
    }

    /// Closes the body and stops the decoder. Idempotent and safe to call
    /// concurrently; every caller returns after the decoder has exited and
    /// the body has been dropped.
    pub async fn close(&self) {
        self.cancel.cancel();

        let mut producer = self.producer.lock().await;
        if let Some(handle) = producer.take() {
            if let Err(err) = handle.await {
                warn!(event = "event_producer_failed", error = %err);
            }
        }
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn produce<R>(
    reader: R,
    max_line: usize,
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
    terminal: Arc<Mutex<Option<StreamError>>>,
) where
    R: AsyncBufRead + Send + 'static,
{
    let mut reader = Box::pin(reader);
    let mut line = Vec::new();
    let mut delivered: u64 = 0;
    let mut last_offset: Option<u64> = None;

    let outcome = loop {
        line.clear();
        let mut limited = (&mut reader).take(max_line as u64);
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break None,
            read = limited.read_until(b'\n', &mut line) => read,
        };
        match read {
            Ok(0) => break Some(StreamError::EndOfStream),
            Ok(_) => {}
            Err(err) => break Some(StreamError::Io(Arc::new(err))),
        }
        if line.len() >= max_line && line.last() != Some(&b'\n') {
            warn!(event = "event_line_too_long", delivered, max_line);
            break Some(StreamError::LineTooLong(max_line));
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let event: Event = match serde_json::from_slice(&line) {
            Ok(event) => event,
            Err(err) => {
                warn!(event = "event_decode_failed", delivered, error = %err);
                break Some(StreamError::Decode(Arc::new(err)));
            }
        };
        if let Some(last) = last_offset.filter(|last| event.offset < *last) {
            warn!(
                event = "event_offset_regressed",
                last,
                offset = event.offset
            );
        }
        last_offset = Some(event.offset);

        // A close that races the hand-off wins; the event is dropped.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break None,
            sent = tx.send(event) => {
                if sent.is_err() {
                    break None;
                }
            }
        }
        delivered += 1;
    };

    match outcome {
        Some(err) => {
            debug!(event = "event_stream_ended", delivered, reason = %err);
            if let Ok(mut slot) = terminal.lock() {
                *slot = Some(err);
            }
        }
        None => debug!(event = "event_stream_closed", delivered),
    }
}
