//! Frame writer for the long-lived GET response a channel streams arrays on.
//!
//! The back channel holds the sending half of a bounded frame queue whose
//! receiving half is the HTTP response body. The Go-style `wait()` contract
//! is realized by the streaming body itself: the response stays open exactly
//! until [`BackChannel::discard`] drops the sender and the body stream runs
//! dry.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::Error;

/// Frames buffered towards the response body before a send fails.
pub(crate) const FRAME_BUFFER: usize = 128;

/// A chunked back channel is rotated once this many payload bytes went out,
/// forcing the client to reconnect and acknowledge.
const MAX_REUSE_BYTES: usize = 10 * 1024;

/// Size of the one-time comment block that convinces IE to start
/// interpreting the iframe document incrementally.
const HTML_PADDING_BYTES: usize = 1024;

const HTML_HEAD: &str = "<html><body>\n";
const HTML_DONE: &str = "<script>try{parent.d()}catch(e){}</script>\n";

/// Framing variant negotiated from the bind request's `TYPE` parameter.
pub(crate) enum Framing {
    /// Length-prefixed frames for XHR streaming clients.
    Xhr,
    /// Script-tag frames for the IE ≤ 9 iframe transport.
    Html { domain: String, padding_sent: bool },
}

pub(crate) struct BackChannel {
    rid: String,
    chunked: bool,
    bytes_sent: usize,
    failed: bool,
    framing: Framing,
    frames: mpsc::Sender<Bytes>,
}

impl BackChannel {
    /// Creates a back channel and the frame stream that becomes the HTTP
    /// response body. Starts out non-chunked.
    pub(crate) fn new(rid: String, framing: Framing) -> (BackChannel, mpsc::Receiver<Bytes>) {
        let (frames, rx) = mpsc::channel(FRAME_BUFFER);
        (
            BackChannel {
                rid,
                chunked: false,
                bytes_sent: 0,
                failed: false,
                framing,
                frames,
            },
            rx,
        )
    }

    pub(crate) fn request_id(&self) -> &str {
        &self.rid
    }

    pub(crate) fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub(crate) fn set_chunked(&mut self, chunked: bool) {
        self.chunked = chunked;
    }

    /// A non-chunked back channel is single shot; a chunked one is reused
    /// until the payload budget is spent or a write failed.
    pub(crate) fn is_reusable(&self) -> bool {
        self.chunked && self.bytes_sent < MAX_REUSE_BYTES && !self.failed
    }

    /// Encodes `payload` as one frame and hands it to the response body.
    /// Any failure marks the back channel permanently unreusable; the
    /// protocol recovers by retransmitting on the next attach.
    pub(crate) fn send(&mut self, payload: &[u8]) -> Result<(), Error> {
        let frame = match &mut self.framing {
            Framing::Xhr => {
                let mut frame = Vec::with_capacity(payload.len() + 12);
                frame.extend_from_slice(format!("{}\n", payload.len()).as_bytes());
                frame.extend_from_slice(payload);
                frame
            }
            Framing::Html {
                domain,
                padding_sent,
            } => {
                let mut frame = String::new();
                if !*padding_sent {
                    frame.push_str(HTML_HEAD);
                    frame.push_str(&html_domain_script(domain));
                }
                frame.push_str(&html_rpc_script(&String::from_utf8_lossy(payload)));
                if !*padding_sent {
                    frame.push_str(&html_padding());
                    *padding_sent = true;
                }
                frame.into_bytes()
            }
        };

        match self.frames.try_send(Bytes::from(frame)) {
            Ok(()) => {
                self.bytes_sent += payload.len();
                Ok(())
            }
            Err(_) => {
                tracing::debug!(rid = %self.rid, "back channel frame queue full or gone");
                self.failed = true;
                Err(Error::BackChannelWrite)
            }
        }
    }

    /// Releases the response. Taking `self` makes the call once-only; the
    /// drop impl appends the HTML trailer and closes the frame stream.
    pub(crate) fn discard(self) {
        tracing::debug!(rid = %self.rid, "back channel discarded");
    }
}

impl Drop for BackChannel {
    fn drop(&mut self) {
        if matches!(self.framing, Framing::Html { .. }) {
            let _ = self.frames.try_send(Bytes::from_static(HTML_DONE.as_bytes()));
        }
    }
}

pub(crate) fn html_head() -> &'static str {
    HTML_HEAD
}

pub(crate) fn html_done() -> &'static str {
    HTML_DONE
}

pub(crate) fn html_domain_script(domain: &str) -> String {
    format!(
        "<script>try{{document.domain='{}'}}catch(e){{}}</script>\n",
        js_string_escape(domain)
    )
}

pub(crate) fn html_rpc_script(payload: &str) -> String {
    format!(
        "<script>try{{parent.m('{}')}}catch(e){{}}</script>\n",
        js_string_escape(payload)
    )
}

pub(crate) fn html_padding() -> String {
    format!("/*{}*/\n", " ".repeat(HTML_PADDING_BYTES - 4))
}

fn js_string_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\'' => escaped.push_str("\\'"),
            '"' => escaped.push_str("\\\""),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xhr_frames_are_length_prefixed() {
        let (mut bc, mut rx) = BackChannel::new("rid".into(), Framing::Xhr);
        bc.send(b"[[1,[\"hi\"]]]").unwrap();

        let frame = rx.try_recv().unwrap();
        assert_eq!(&frame[..], b"12\n[[1,[\"hi\"]]]");
    }

    #[test]
    fn html_first_frame_carries_prologue_and_padding() {
        let (mut bc, mut rx) = BackChannel::new(
            "rid".into(),
            Framing::Html {
                domain: "example.com".into(),
                padding_sent: false,
            },
        );

        bc.send(b"[[1,[\"hi\"]]]").unwrap();
        let first = String::from_utf8(rx.try_recv().unwrap().to_vec()).unwrap();
        assert!(first.starts_with("<html><body>\n"));
        assert!(first.contains("document.domain='example.com'"));
        assert!(first.contains("parent.m('[[1,[\\\"hi\\\"]]]')"));
        assert!(first.contains("/*"));
        assert!(first.len() > HTML_PADDING_BYTES);

        bc.send(b"[[2,[\"ho\"]]]").unwrap();
        let second = String::from_utf8(rx.try_recv().unwrap().to_vec()).unwrap();
        assert!(second.starts_with("<script>try{parent.m("));
        assert!(!second.contains("<html>"));
        assert!(!second.contains("/*"));
    }

    #[test]
    fn html_discard_appends_trailer() {
        let (bc, mut rx) = BackChannel::new(
            "rid".into(),
            Framing::Html {
                domain: String::new(),
                padding_sent: false,
            },
        );
        bc.discard();

        let trailer = rx.try_recv().unwrap();
        assert_eq!(&trailer[..], HTML_DONE.as_bytes());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn non_chunked_is_never_reusable() {
        let (bc, _rx) = BackChannel::new("rid".into(), Framing::Xhr);
        assert!(!bc.is_reusable());
    }

    #[test]
    fn chunked_is_reusable_until_the_byte_budget_is_spent() {
        let (mut bc, _rx) = BackChannel::new("rid".into(), Framing::Xhr);
        bc.set_chunked(true);
        assert!(bc.is_reusable());

        let payload = vec![b'x'; MAX_REUSE_BYTES - 1];
        bc.send(&payload).unwrap();
        assert!(bc.is_reusable());

        bc.send(b"x").unwrap();
        assert!(!bc.is_reusable());
    }

    #[test]
    fn dropped_body_marks_the_back_channel_failed() {
        let (mut bc, rx) = BackChannel::new("rid".into(), Framing::Xhr);
        bc.set_chunked(true);
        drop(rx);

        assert!(bc.send(b"data").is_err());
        assert!(!bc.is_reusable());
    }
}
