use crate::constants::REQUEST_ID_HEADER;
use crate::streaming::OutboundFrame;
use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use std::panic;
use std::time::Instant;
use tracing::{error, info};
use tracing::{info_span, Instrument};
use uuid::Uuid;

/// Sets up a global panic hook that logs panics using tracing before the
/// default hook runs.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = match panic_info.location() {
            Some(l) => format!("{}:{}:{}", l.file(), l.line(), l.column()),
            None => "unknown location".to_string(),
        };

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Tags every request with an id, reusing the caller's `x-request-id` when it
/// sends one, and echoes it on the response.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = match req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .filter(|s| !s.is_empty())
    {
        Some(id) => id.to_string(),
        None => Uuid::new_v4().to_string(),
    };
    if let Ok(val) = request_id.parse() {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path()
    );
    let mut response = next.run(req).instrument(span).await;
    if let Ok(val) = request_id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    response
}

/// Per-relay counters, logged once the upstream is done.
pub struct StreamMetric {
    stream_id: String,
    started: Instant,
    first_frame_ms: Option<u128>,
    pub frames: usize,
    pub dropped: usize,
    pub text_chars: usize,
}

impl StreamMetric {
    pub fn new(stream_id: &str) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            started: Instant::now(),
            first_frame_ms: None,
            frames: 0,
            dropped: 0,
            text_chars: 0,
        }
    }

    pub fn record_frame(&mut self, frame: &OutboundFrame) {
        if self.first_frame_ms.is_none() {
            self.first_frame_ms = Some(self.started.elapsed().as_millis());
        }
        self.frames += 1;
        if let OutboundFrame::Data(text) = frame {
            self.text_chars += text.chars().count();
        }
    }

    pub fn record_dropped(&mut self) {
        self.dropped += 1;
    }

    pub fn log_summary(&self) {
        let first = match self.first_frame_ms {
            Some(ms) => format!("{}ms", ms),
            None => "-".to_string(),
        };
        info!(
            target: "flight_recorder",
            "[STREAM END] Stream: {} | Frames: {} | Dropped: {} | Text: {} chars | First frame: {} | Total: {}ms",
            crate::str_utils::prefix_chars(&self.stream_id, 8),
            self.frames,
            self.dropped,
            self.text_chars,
            first,
            crate::types::LatencyMs::from(self.started.elapsed())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_counts_text_and_drops() {
        let mut metric = StreamMetric::new("0123456789");
        assert_eq!(metric.first_frame_ms, None);
        metric.record_frame(&OutboundFrame::Data("héllo".into()));
        metric.record_frame(&OutboundFrame::Structured(serde_json::json!({"a": 1})));
        metric.record_dropped();
        assert_eq!(metric.frames, 2);
        assert_eq!(metric.dropped, 1);
        assert_eq!(metric.text_chars, 5);
        assert!(metric.first_frame_ms.is_some());
    }
}
