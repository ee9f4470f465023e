//! Body capture and truncation for logging. Grounded on
//! `agentgateway`'s `http::peekbody::{PartiallyBufferedBody, inspect_body}`
//! tee pattern: the forwarded body is always the full original; capture for
//! the log is a bounded side buffer that never affects what's sent onward.

use bytes::{Bytes, BytesMut};
use http_body::Body as HttpBody;
use http_body_util::BodyExt;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::client::Body;

/// A bounded capture of a request/response body, truncated to `max_bytes`
/// for the log while the real body keeps flowing to its destination
/// untouched.
#[derive(Clone)]
pub struct CapturedBody {
	pub bytes: BytesMut,
	pub truncated: bool,
	max_bytes: usize,
}

impl CapturedBody {
	fn new(max_bytes: usize) -> Self {
		CapturedBody { bytes: BytesMut::new(), truncated: false, max_bytes }
	}

	fn push(&mut self, chunk: &[u8]) {
		if self.bytes.len() >= self.max_bytes {
			if !chunk.is_empty() {
				self.truncated = true;
			}
			return;
		}
		let remaining = self.max_bytes - self.bytes.len();
		if chunk.len() > remaining {
			self.bytes.extend_from_slice(&chunk[..remaining]);
			self.truncated = true;
		} else {
			self.bytes.extend_from_slice(chunk);
		}
	}

	pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
		String::from_utf8_lossy(&self.bytes)
	}
}

pin_project! {
	/// Wraps a body, pushing every data frame into a shared capture buffer as
	/// it streams through, while still yielding every byte onward unchanged.
	pub struct TeeBody<B> {
		#[pin]
		inner: B,
		capture: Option<std::sync::Arc<parking_lot::Mutex<CapturedBody>>>,
	}
}

impl<B> HttpBody for TeeBody<B>
where
	B: HttpBody<Data = Bytes>,
{
	type Data = Bytes;
	type Error = B::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		let poll = this.inner.poll_frame(cx);
		if let Poll::Ready(Some(Ok(frame))) = &poll {
			if let Some(data) = frame.data_ref() {
				if let Some(capture) = this.capture {
					capture.lock().push(data);
				}
			}
		}
		poll
	}
}

/// Splits a body into (a) the same body, instrumented to tee into a bounded
/// capture buffer, and (b) a handle to read that buffer back out once the
/// body has finished streaming. The instrumented body is what gets forwarded
/// — capture never changes what the destination receives.
pub fn inspect_body(body: Body, max_bytes: usize) -> (Body, std::sync::Arc<parking_lot::Mutex<CapturedBody>>) {
	let capture = std::sync::Arc::new(parking_lot::Mutex::new(CapturedBody::new(max_bytes)));
	let tee = TeeBody { inner: body, capture: Some(capture.clone()) };
	(tee.boxed(), capture)
}

/// Content type is text-like if it starts with `text/`, or is one of the
/// listed structured types. Case-insensitive; the
/// `Content-Type` header's parameters (e.g. `; charset=utf-8`) are ignored.
pub fn is_text_like(content_type: &str) -> bool {
	let base = content_type.split(';').next().unwrap_or("").trim().to_lowercase();
	base.starts_with("text/")
		|| matches!(
			base.as_str(),
			"application/json" | "application/xml" | "application/x-www-form-urlencoded" | "application/javascript"
		)
}
