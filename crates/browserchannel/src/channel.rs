//! Per-session state machine.
//!
//! Every session is driven by one worker task that owns all mutable state
//! and serializes operations through a queue, selecting over the queue and
//! the protocol timers. Handles are cheap clones that submit operations;
//! `state` round-trips a oneshot reply. Nothing outside the worker ever
//! observes partial state, and timer handling never races an operation.

use std::{collections::VecDeque, pin::Pin, sync::Arc, time::Duration};

use serde_json::Value;
use tokio::{
    sync::{Mutex, mpsc, oneshot},
    time::{Instant, Interval, Sleep, interval_at, sleep},
};

use crate::{
    Error,
    back_channel::BackChannel,
    map_queue::{MAP_QUEUE_CAPACITY, Map, MapQueue},
    session_id::SessionId,
};

/// Server→client message: a JSON-serializable sequence of values. Each array
/// is assigned a 1-based monotonically increasing id when queued.
pub type Array = Vec<Value>;

/// Protocol version number sent in the handshake array.
const PROTOCOL_VERSION: u8 = 8;

/// Unacknowledged arrays buffered before the back channel is rotated to
/// force acknowledgments out of the client.
const MAX_OUTGOING_ARRAYS: usize = 100;

/// Sentinel reported as the outstanding-bytes field of the state triple.
/// Browser clients only distinguish zero from non-zero.
const OUTSTANDING_SENTINEL: i64 = 15;

const OP_BUFFER: usize = 32;
const MAP_BUFFER: usize = 100;

/// Timer durations for one session. The defaults are the protocol values;
/// tests compress them to keep wall-clock time down.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// How long a session survives without an attached back channel before
    /// it is closed.
    pub reopen: Duration,
    /// Lifetime of a single back channel before it is rotated.
    pub back_channel_expiration: Duration,
    /// Interval between keep-alive `["noop"]` arrays on an attached back
    /// channel.
    pub heartbeat: Duration,
    /// How long to wait for an acknowledgment after a flush before assuming
    /// the back channel died.
    pub ack: Duration,
}

impl Default for Timeouts {
    fn default() -> Timeouts {
        Timeouts {
            reopen: Duration::from_secs(20),
            back_channel_expiration: Duration::from_secs(60),
            heartbeat: Duration::from_secs(30),
            ack: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Init,
    Ready,
    Closed,
}

/// Consistent view of the worker state at one point in time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StateSnapshot {
    pub(crate) phase: Phase,
    pub(crate) back_channel: bool,
    pub(crate) last_sent_array_id: i64,
    pub(crate) outstanding: bool,
}

impl StateSnapshot {
    /// The `[has_back_channel, last_sent_array_id, outstanding]` triple
    /// returned on forward-channel responses.
    pub(crate) fn to_wire(self) -> [i64; 3] {
        [
            i64::from(self.back_channel),
            self.last_sent_array_id,
            if self.outstanding {
                OUTSTANDING_SENTINEL
            } else {
                0
            },
        ]
    }
}

enum Op {
    SendArray(Array),
    ReceiveMaps { offset: usize, maps: Vec<Map> },
    Acknowledge(i64),
    SetBackChannel(BackChannel),
    GetState(oneshot::Sender<StateSnapshot>),
    Close,
}

/// Cloneable handle to one browser channel session.
///
/// The handler submits protocol operations through it; the application uses
/// [`Channel::send_array`] and [`Channel::read_map`]. All operations are
/// serialized by the session's worker task.
#[derive(Clone)]
pub struct Channel {
    sid: SessionId,
    version: Arc<str>,
    ops: mpsc::Sender<Op>,
    maps: Arc<Mutex<mpsc::Receiver<Map>>>,
}

impl Channel {
    pub fn session_id(&self) -> SessionId {
        self.sid
    }

    /// The client's `VER` string from the bind request that created the
    /// session.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Queues an array for delivery to the client without ever blocking the
    /// caller. A saturated operation queue drops the array and returns
    /// [`Error::QueueFull`]; a closed session returns [`Error::Closed`].
    pub fn send_array(&self, array: Array) -> Result<(), Error> {
        self.ops
            .try_send(Op::SendArray(array))
            .map_err(|error| match error {
                mpsc::error::TrySendError::Full(_) => Error::QueueFull,
                mpsc::error::TrySendError::Closed(_) => Error::Closed,
            })
    }

    /// Waits for the next client map, in client-offset order. Returns `None`
    /// once the session is closed and all buffered maps were drained.
    pub async fn read_map(&self) -> Option<Map> {
        self.maps.lock().await.recv().await
    }

    /// Closes the session from the server side. A final `["stop"]` array is
    /// delivered if a back channel is attached.
    pub async fn close(&self) {
        let _ = self.ops.send(Op::Close).await;
    }

    pub(crate) async fn receive_maps(&self, offset: usize, maps: Vec<Map>) {
        let _ = self.ops.send(Op::ReceiveMaps { offset, maps }).await;
    }

    pub(crate) async fn acknowledge(&self, aid: i64) {
        let _ = self.ops.send(Op::Acknowledge(aid)).await;
    }

    /// Hands a freshly arrived back channel to the worker. If the worker is
    /// already gone the writer is discarded here so the HTTP response still
    /// completes.
    pub(crate) async fn set_back_channel(&self, back_channel: BackChannel) {
        if let Err(mpsc::error::SendError(Op::SetBackChannel(back_channel))) =
            self.ops.send(Op::SetBackChannel(back_channel)).await
        {
            back_channel.discard();
        }
    }

    /// Snapshot used in forward-response payloads. `None` when the session
    /// is already closed.
    pub(crate) async fn state(&self) -> Option<StateSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.ops.send(Op::GetState(tx)).await.ok()?;
        rx.await.ok()
    }
}

/// Spawns the worker task for a new session and returns its handle.
pub(crate) fn spawn(
    sid: SessionId,
    version: String,
    host_prefix: String,
    timeouts: Timeouts,
    gc: mpsc::UnboundedSender<SessionId>,
) -> Channel {
    let (op_tx, op_rx) = mpsc::channel(OP_BUFFER);
    let (map_tx, map_rx) = mpsc::channel(MAP_BUFFER);

    let worker = ChannelWorker {
        sid,
        host_prefix,
        timeouts,
        phase: Phase::Init,
        back_channel: None,
        maps: MapQueue::new(MAP_QUEUE_CAPACITY),
        outgoing: VecDeque::new(),
        last_array_id: 0,
        last_sent_array_id: 0,
        ops: op_rx,
        map_tx,
        gc,
        ack_timeout: None,
        reopen_timeout: None,
        back_channel_expiration: None,
        heartbeat: None,
    };
    tokio::spawn(worker.run());

    Channel {
        sid,
        version: version.into(),
        ops: op_tx,
        maps: Arc::new(Mutex::new(map_rx)),
    }
}

struct OutgoingArray {
    id: i64,
    elements: Array,
}

struct ChannelWorker {
    sid: SessionId,
    host_prefix: String,
    timeouts: Timeouts,

    phase: Phase,
    back_channel: Option<BackChannel>,
    maps: MapQueue,
    outgoing: VecDeque<OutgoingArray>,
    last_array_id: i64,
    last_sent_array_id: i64,

    ops: mpsc::Receiver<Op>,
    map_tx: mpsc::Sender<Map>,
    gc: mpsc::UnboundedSender<SessionId>,

    ack_timeout: Option<Pin<Box<Sleep>>>,
    reopen_timeout: Option<Pin<Box<Sleep>>>,
    back_channel_expiration: Option<Pin<Box<Sleep>>>,
    heartbeat: Option<Interval>,
}

/// Resolves when the timer is armed and elapsed; pends forever otherwise so
/// the select arm stays quiet.
async fn armed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn ticked(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl ChannelWorker {
    async fn run(mut self) {
        // A session that never attaches a back channel must still expire.
        self.arm_reopen_timeout();

        while self.phase != Phase::Closed {
            tokio::select! {
                op = self.ops.recv() => match op {
                    Some(op) => self.handle_op(op).await,
                    None => break,
                },
                _ = armed(&mut self.ack_timeout) => {
                    tracing::debug!(sid = %self.sid, "ack timeout");
                    self.ack_timeout = None;
                    self.clear_back_channel(false);
                }
                _ = armed(&mut self.reopen_timeout) => {
                    tracing::debug!(sid = %self.sid, "back channel was not reopened in time");
                    self.reopen_timeout = None;
                    self.close();
                }
                _ = armed(&mut self.back_channel_expiration) => {
                    tracing::debug!(sid = %self.sid, "back channel expired");
                    self.back_channel_expiration = None;
                    self.clear_back_channel(false);
                }
                _ = ticked(&mut self.heartbeat) => {
                    tracing::trace!(sid = %self.sid, "heartbeat");
                    self.queue_array(noop_array());
                    self.flush();
                }
            }
        }
    }

    async fn handle_op(&mut self, op: Op) {
        match op {
            Op::SendArray(array) => {
                self.queue_array(array);
                self.flush();
            }
            Op::ReceiveMaps { offset, maps } => self.receive_maps(offset, maps).await,
            Op::Acknowledge(aid) => self.acknowledge(aid),
            Op::SetBackChannel(back_channel) => self.set_back_channel(back_channel),
            Op::GetState(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Op::Close => self.close(),
        }
    }

    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            phase: self.phase,
            back_channel: self.back_channel.is_some(),
            last_sent_array_id: self.last_sent_array_id,
            outstanding: !self.outgoing.is_empty(),
        }
    }

    async fn receive_maps(&mut self, offset: usize, maps: Vec<Map>) {
        if maps.is_empty() {
            return;
        }
        tracing::debug!(sid = %self.sid, offset, count = maps.len(), "receive maps");
        self.maps.enqueue(offset, maps);
        while let Some(map) = self.maps.dequeue() {
            if self.map_tx.send(map).await.is_err() {
                break;
            }
        }
    }

    fn queue_array(&mut self, elements: Array) {
        self.last_array_id += 1;
        self.outgoing.push_back(OutgoingArray {
            id: self.last_array_id,
            elements,
        });
    }

    fn acknowledge(&mut self, aid: i64) {
        tracing::debug!(sid = %self.sid, aid, "acknowledge");
        while self.outgoing.front().is_some_and(|array| array.id <= aid) {
            self.outgoing.pop_front();
        }
        if self.outgoing.is_empty() {
            self.ack_timeout = None;
        }
    }

    fn set_back_channel(&mut self, back_channel: BackChannel) {
        if self.phase == Phase::Closed {
            back_channel.discard();
            return;
        }

        tracing::debug!(
            sid = %self.sid,
            rid = back_channel.request_id(),
            chunked = back_channel.is_chunked(),
            "set back channel"
        );

        if self.phase == Phase::Init {
            self.queue_array(vec![
                Value::from("c"),
                Value::from(self.sid.to_string()),
                Value::from(self.host_prefix.clone()),
                Value::from(PROTOCOL_VERSION),
            ]);
            self.phase = Phase::Ready;
        } else if self.back_channel.is_some() {
            // The replacing stream must carry at least one frame so the
            // client sees it alive.
            self.queue_array(noop_array());
        }

        if self.back_channel.is_some() {
            tracing::debug!(sid = %self.sid, "dropping back channel to set new one");
            self.clear_back_channel(false);
        }

        self.reopen_timeout = None;
        self.back_channel_expiration = Some(Box::pin(sleep(
            self.timeouts.back_channel_expiration,
        )));
        self.heartbeat = Some(interval_at(
            Instant::now() + self.timeouts.heartbeat,
            self.timeouts.heartbeat,
        ));
        self.back_channel = Some(back_channel);

        // The previous back channel may have died with frames in flight but
        // without acks; rewind so every unacknowledged array is resent.
        if let Some(first) = self.outgoing.front() {
            self.last_sent_array_id = first.id - 1;
        }

        self.flush();
    }

    fn flush(&mut self) {
        let unsent = (self.last_array_id - self.last_sent_array_id).max(0) as usize;
        if unsent == 0 || self.back_channel.is_none() {
            return;
        }

        // A client may ack arrays that were never flushed; never slice past
        // the front of the buffer.
        let start = self.outgoing.len().saturating_sub(unsent);
        let payload = wire_frame(self.outgoing.iter().skip(start));
        if let Some(back_channel) = self.back_channel.as_mut() {
            if back_channel.send(&payload).is_err() {
                tracing::debug!(sid = %self.sid, "back channel write failed");
            }
        }
        self.last_sent_array_id = self.last_array_id;
        self.reset_ack_timeout();

        if !self.can_reuse_back_channel() {
            tracing::debug!(sid = %self.sid, "discarding back channel");
            self.clear_back_channel(false);
        }
    }

    fn can_reuse_back_channel(&self) -> bool {
        self.back_channel
            .as_ref()
            .is_some_and(BackChannel::is_reusable)
            && self.outgoing.len() < MAX_OUTGOING_ARRAYS
    }

    fn close(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }

        tracing::debug!(sid = %self.sid, "closing channel");

        // Deliver a final stop array on an attached back channel; the body
        // stream drains frames buffered before the writer closes.
        if self.back_channel.is_some() {
            self.queue_array(stop_array());
            self.flush();
        }

        self.clear_back_channel(true);
        self.phase = Phase::Closed;
        let _ = self.gc.send(self.sid);
    }

    /// Drops the writer and, unless the session itself is going away, arms
    /// the reopen timeout the client has to beat with a fresh back channel.
    fn clear_back_channel(&mut self, permanent: bool) {
        let Some(back_channel) = self.back_channel.take() else {
            return;
        };

        tracing::debug!(
            sid = %self.sid,
            rid = back_channel.request_id(),
            "clear back channel"
        );

        self.ack_timeout = None;
        self.back_channel_expiration = None;
        self.heartbeat = None;
        back_channel.discard();

        if !permanent {
            self.arm_reopen_timeout();
        }
    }

    fn reset_ack_timeout(&mut self) {
        self.ack_timeout = Some(Box::pin(sleep(self.timeouts.ack)));
    }

    fn arm_reopen_timeout(&mut self) {
        self.reopen_timeout = Some(Box::pin(sleep(self.timeouts.reopen)));
    }
}

impl Drop for ChannelWorker {
    fn drop(&mut self) {
        // Covers worker death through handle drop as well as normal close;
        // duplicate gc notices are tolerated by the reaper.
        if self.phase != Phase::Closed {
            let _ = self.gc.send(self.sid);
        }
    }
}

fn noop_array() -> Array {
    vec![Value::from("noop")]
}

fn stop_array() -> Array {
    vec![Value::from("stop")]
}

/// Serializes outgoing arrays as the wire frame `[[id, elements], ...]`.
fn wire_frame<'a>(arrays: impl Iterator<Item = &'a OutgoingArray>) -> Vec<u8> {
    let frame: Vec<(i64, &Array)> = arrays.map(|array| (array.id, &array.elements)).collect();
    serde_json::to_vec(&frame).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::{Value, json};
    use tokio::{sync::mpsc, time::Duration};

    use super::*;
    use crate::back_channel::Framing;

    fn short_timeouts() -> Timeouts {
        Timeouts {
            reopen: Duration::from_millis(200),
            back_channel_expiration: Duration::from_millis(500),
            heartbeat: Duration::from_millis(100),
            ack: Duration::from_millis(300),
        }
    }

    struct Fixture {
        channel: Channel,
        gc_rx: mpsc::UnboundedReceiver<SessionId>,
    }

    fn fixture(timeouts: Timeouts) -> Fixture {
        let (gc_tx, gc_rx) = mpsc::unbounded_channel();
        let channel = spawn(
            SessionId::random(),
            "8".to_string(),
            "bc".to_string(),
            timeouts,
            gc_tx,
        );
        Fixture { channel, gc_rx }
    }

    fn xhr_back_channel(chunked: bool) -> (BackChannel, mpsc::Receiver<Bytes>) {
        let (mut bc, rx) = BackChannel::new("rid".into(), Framing::Xhr);
        bc.set_chunked(chunked);
        (bc, rx)
    }

    /// Parses an XHR `<len>\n<json>` frame.
    fn parse_frame(frame: &[u8]) -> Value {
        let text = std::str::from_utf8(frame).unwrap();
        let (len, json) = text.split_once('\n').unwrap();
        assert_eq!(len.parse::<usize>().unwrap(), json.len());
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn first_attach_delivers_the_handshake() {
        let f = fixture(Timeouts::default());
        let (bc, mut frames) = xhr_back_channel(true);

        f.channel.set_back_channel(bc).await;

        let frame = parse_frame(&frames.recv().await.unwrap());
        let sid = f.channel.session_id().to_string();
        assert_eq!(frame, json!([[1, ["c", sid, "bc", 8]]]));
    }

    #[tokio::test]
    async fn arrays_flow_in_order_with_increasing_ids() {
        let f = fixture(Timeouts::default());
        let (bc, mut frames) = xhr_back_channel(true);
        f.channel.set_back_channel(bc).await;
        frames.recv().await.unwrap(); // handshake
        f.channel.acknowledge(1).await;

        f.channel.send_array(vec![json!("hello")]).unwrap();
        f.channel.send_array(vec![json!("world")]).unwrap();

        assert_eq!(
            parse_frame(&frames.recv().await.unwrap()),
            json!([[2, ["hello"]]])
        );
        assert_eq!(
            parse_frame(&frames.recv().await.unwrap()),
            json!([[3, ["world"]]])
        );
    }

    #[tokio::test]
    async fn reattach_rewinds_and_retransmits_unacked_arrays() {
        let f = fixture(Timeouts::default());
        let (bc, mut frames) = xhr_back_channel(true);
        f.channel.set_back_channel(bc).await;
        frames.recv().await.unwrap();
        f.channel.acknowledge(1).await;

        f.channel.send_array(vec![json!("hello")]).unwrap();
        f.channel.send_array(vec![json!("world")]).unwrap();
        frames.recv().await.unwrap();
        frames.recv().await.unwrap();

        // The client vanished without acking; a new back channel arrives.
        let (bc, mut frames) = xhr_back_channel(true);
        f.channel.set_back_channel(bc).await;

        let frame = parse_frame(&frames.recv().await.unwrap());
        assert_eq!(
            frame,
            json!([[2, ["hello"]], [3, ["world"]], [4, ["noop"]]])
        );
    }

    #[tokio::test]
    async fn acknowledged_arrays_are_not_retransmitted() {
        let f = fixture(Timeouts::default());
        let (bc, mut frames) = xhr_back_channel(true);
        f.channel.set_back_channel(bc).await;
        frames.recv().await.unwrap();

        f.channel.send_array(vec![json!("hello")]).unwrap();
        f.channel.send_array(vec![json!("world")]).unwrap();
        frames.recv().await.unwrap();
        frames.recv().await.unwrap();
        f.channel.acknowledge(2).await;

        let (bc, mut frames) = xhr_back_channel(true);
        f.channel.set_back_channel(bc).await;

        let frame = parse_frame(&frames.recv().await.unwrap());
        assert_eq!(frame, json!([[3, ["world"]], [4, ["noop"]]]));
    }

    #[tokio::test]
    async fn state_reports_the_wire_triple() {
        let f = fixture(Timeouts::default());

        let state = f.channel.state().await.unwrap();
        assert_eq!(state.to_wire(), [0, 0, 0]);

        let (bc, mut frames) = xhr_back_channel(true);
        f.channel.set_back_channel(bc).await;
        frames.recv().await.unwrap();

        let state = f.channel.state().await.unwrap();
        assert_eq!(state.to_wire(), [1, 1, 15]);

        f.channel.acknowledge(1).await;
        let state = f.channel.state().await.unwrap();
        assert_eq!(state.to_wire(), [1, 1, 0]);
    }

    #[tokio::test]
    async fn maps_drain_in_offset_order_across_gaps() {
        let f = fixture(Timeouts::default());

        let batch =
            |i: &str| vec![Map::from([("index".to_string(), i.to_string())])];
        f.channel.receive_maps(1, batch("1")).await;
        f.channel.receive_maps(0, batch("0")).await;

        assert_eq!(f.channel.read_map().await.unwrap()["index"], "0");
        assert_eq!(f.channel.read_map().await.unwrap()["index"], "1");
    }

    #[tokio::test]
    async fn close_delivers_stop_and_ends_the_map_stream() {
        let mut f = fixture(Timeouts::default());
        let (bc, mut frames) = xhr_back_channel(true);
        f.channel.set_back_channel(bc).await;
        frames.recv().await.unwrap();

        f.channel.close().await;

        let frame = parse_frame(&frames.recv().await.unwrap());
        assert_eq!(frame, json!([[2, ["stop"]]]));
        assert!(frames.recv().await.is_none());
        assert!(f.channel.read_map().await.is_none());
        assert_eq!(f.gc_rx.recv().await, Some(f.channel.session_id()));
    }

    #[tokio::test]
    async fn attach_after_close_is_discarded_immediately() {
        let f = fixture(Timeouts::default());
        f.channel.close().await;

        let (bc, mut frames) = xhr_back_channel(true);
        f.channel.set_back_channel(bc).await;
        assert!(frames.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_sends_noops_while_attached() {
        let f = fixture(Timeouts::default());
        let (bc, mut frames) = xhr_back_channel(true);
        f.channel.set_back_channel(bc).await;
        frames.recv().await.unwrap();

        let frame = parse_frame(&frames.recv().await.unwrap());
        assert_eq!(frame, json!([[2, ["noop"]]]));
    }

    #[tokio::test(start_paused = true)]
    async fn reopen_timeout_closes_an_unattached_session() {
        let mut f = fixture(Timeouts::default());

        assert_eq!(f.gc_rx.recv().await, Some(f.channel.session_id()));
        assert!(f.channel.read_map().await.is_none());
    }

    #[tokio::test]
    async fn non_chunked_back_channel_is_single_shot() {
        let f = fixture(short_timeouts());
        let (bc, mut frames) = xhr_back_channel(false);
        f.channel.set_back_channel(bc).await;

        frames.recv().await.unwrap();
        // The writer is rotated right after the first flush.
        assert!(frames.recv().await.is_none());

        let state = f.channel.state().await.unwrap();
        assert_eq!(state.to_wire()[0], 0);
    }

    #[tokio::test]
    async fn buffer_over_capacity_forces_rotation() {
        let f = fixture(Timeouts::default());
        let (bc, mut frames) = xhr_back_channel(true);
        f.channel.set_back_channel(bc).await;
        frames.recv().await.unwrap();

        for i in 0..99 {
            f.channel.send_array(vec![json!(i)]).unwrap();
            // Let the worker drain the operation queue between sends.
            tokio::task::yield_now().await;
        }

        // Drain everything the back channel carried before it was dropped.
        let mut last = Value::Null;
        while let Some(frame) = frames.recv().await {
            last = parse_frame(&frame);
        }
        let sent = last.as_array().unwrap().last().unwrap().clone();
        assert_eq!(sent[0], json!(100));

        let state = f.channel.state().await.unwrap();
        assert!(!state.back_channel);
        assert!(state.outstanding);
    }
}
