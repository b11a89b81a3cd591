//! Response body that reports when the connection has written it.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::response::Response;
use http_body::{Body as _, Frame, SizeHint};
use tokio::sync::oneshot;

/// Wrap `response` so that `sent` fires once its body has been handed to
/// the connection, or when the body is dropped unsent.
pub(crate) fn notify_when_sent(response: Response, sent: oneshot::Sender<()>) -> Response {
    response.map(|body| Body::new(AckBody::new(body, sent)))
}

/// Body wrapper behind [`notify_when_sent`].
///
/// After the inner body is exhausted it yields once more before reporting
/// the end of the stream, so the connection flushes what it has buffered
/// before the signal fires. No exact length is advertised, since a
/// length-delimited body is dropped without that last poll.
struct AckBody {
    inner: Body,
    inner_done: bool,
    sent: Option<oneshot::Sender<()>>,
}

impl AckBody {
    fn new(inner: Body, sent: oneshot::Sender<()>) -> Self {
        Self {
            inner,
            inner_done: false,
            sent: Some(sent),
        }
    }

    fn signal(&mut self) {
        if let Some(sent) = self.sent.take() {
            let _ = sent.send(());
        }
    }
}

impl http_body::Body for AckBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        if !this.inner_done {
            match Pin::new(&mut this.inner).poll_frame(cx) {
                Poll::Ready(Some(frame)) => return Poll::Ready(Some(frame)),
                Poll::Ready(None) => {
                    this.inner_done = true;
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                Poll::Pending => return Poll::Pending,
            }
        }

        this.signal();
        Poll::Ready(None)
    }

    fn is_end_stream(&self) -> bool {
        self.sent.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}

impl Drop for AckBody {
    fn drop(&mut self) {
        self.signal();
    }
}
