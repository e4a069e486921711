//! The JPIP session: channel negotiation, request correlation,
//! response ingestion and reconnection.
//!
//! The session is a poll-style state machine. The embedder pulls
//! [`TransportRequest`]s from [`Session::next_request`], performs the
//! transport round trip, and reports the outcome through
//! [`Session::handle_response`]. No operation blocks.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, warn};

use crate::databin::{append_and_notify, DatabinsSaver};
use crate::error::JpipError;
use crate::protocol::channel::Channel;
use crate::protocol::message::{EndOfResponse, MessageHeaderParser, ParsedItem};
use crate::protocol::request::{
    FetchWindow, QueryBuilder, RequestDescriptor, RequestId, WaitBehavior,
};
use crate::JpipConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Ready,
    Reconnecting,
    Closed,
    Failed,
}

/// A request ready to be performed by the embedder's transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub id: RequestId,
    pub descriptor: RequestDescriptor,
}

/// What the transport produced: the response body plus the two JPIP
/// control headers.
#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub body: Vec<u8>,
    /// `JPIP-tid` header: identifies the image target.
    pub target_id: Option<String>,
    /// `JPIP-cnew` header: new channel parameters (`cid=...,...`).
    pub new_channel: Option<String>,
}

/// Transport-level failure (network error, timeout, HTTP error status).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    pub reason: String,
}

/// Progress reported to a fetch's callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    /// A response for this fetch was ingested. `server_complete` is true
    /// when the server declared the requested window fully served.
    Completed { server_complete: bool },
    Failed(JpipError),
    /// The dedicated channel did not survive a reconnect; the fetch must
    /// be reissued via [`Session::move_fetch`].
    ChannelLost,
}

pub type FetchCallback = Box<dyn FnMut(FetchEvent)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchStatus {
    Active,
    Done,
    Stopped,
    /// Dedicated fetch whose channel binding was lost by a reconnect.
    NeedsMove,
}

struct FetchState {
    window: FetchWindow,
    wait: WaitBehavior,
    dedicated: bool,
    channel: usize,
    status: FetchStatus,
    callback: FetchCallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    OpenChannel,
    Fetch(FetchHandle),
}

struct PendingRequest {
    kind: RequestKind,
    channel: usize,
}

pub struct Session {
    config: JpipConfig,
    state: SessionState,
    target_id: Option<String>,
    channels: Vec<Channel>,
    saver: Rc<RefCell<DatabinsSaver>>,
    fetches: HashMap<u64, FetchState>,
    requests: HashMap<RequestId, PendingRequest>,
    next_request: u64,
    next_fetch: u64,
    next_qid: u64,
    reconnect_attempts: u32,
}

impl Session {
    pub fn new(config: JpipConfig) -> Self {
        let pooled = Channel::new(config.max_requests_waiting_for_response_in_channel, false);
        Self {
            config,
            state: SessionState::Opening,
            target_id: None,
            channels: vec![pooled],
            saver: Rc::new(RefCell::new(DatabinsSaver::new())),
            fetches: HashMap::new(),
            requests: HashMap::new(),
            next_request: 0,
            next_fetch: 0,
            next_qid: 0,
            reconnect_attempts: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn target_id(&self) -> Option<&str> {
        self.target_id.as_deref()
    }

    /// The databin store this session fills. Shared with the quality
    /// engine and the writers.
    pub fn saver(&self) -> Rc<RefCell<DatabinsSaver>> {
        Rc::clone(&self.saver)
    }

    /// Negotiates the target id and first channel.
    pub fn open(&mut self) -> Result<(), JpipError> {
        if self.state != SessionState::Opening {
            return Err(JpipError::SessionAlreadyOpen);
        }
        self.enqueue(0, RequestKind::OpenChannel);
        Ok(())
    }

    /// Issues a window fetch on a pooled channel. The callback fires on
    /// completion, failure, or (dedicated only) channel loss.
    pub fn fetch(
        &mut self,
        window: FetchWindow,
        wait: WaitBehavior,
        callback: FetchCallback,
    ) -> Result<FetchHandle, JpipError> {
        self.ensure_active()?;
        let channel = self.pick_pooled_channel();
        let handle = self.alloc_fetch(window, wait, false, channel, callback);
        self.enqueue(channel, RequestKind::Fetch(handle));
        Ok(handle)
    }

    /// Issues a fetch on its own dedicated (movable) channel; follow
    /// viewport changes with [`Session::move_fetch`].
    pub fn dedicated_fetch(
        &mut self,
        window: FetchWindow,
        wait: WaitBehavior,
        callback: FetchCallback,
    ) -> Result<FetchHandle, JpipError> {
        self.ensure_active()?;
        self.channels.push(Channel::new(
            self.config.max_requests_waiting_for_response_in_channel,
            true,
        ));
        let channel = self.channels.len() - 1;
        let handle = self.alloc_fetch(window, wait, true, channel, callback);
        self.enqueue(channel, RequestKind::Fetch(handle));
        Ok(handle)
    }

    /// Retargets a dedicated fetch to a new window. Also the only way to
    /// revive it after a reconnect invalidated its channel binding.
    pub fn move_fetch(&mut self, handle: FetchHandle, window: FetchWindow) -> Result<(), JpipError> {
        self.ensure_active()?;
        let fetch = self
            .fetches
            .get_mut(&handle.0)
            .ok_or(JpipError::Internal("unknown fetch handle"))?;
        if !fetch.dedicated {
            return Err(JpipError::FetchNotMovable);
        }
        if fetch.status == FetchStatus::Stopped {
            return Err(JpipError::FetchStopped);
        }
        fetch.window = window;
        fetch.status = FetchStatus::Active;
        let channel = fetch.channel;
        self.enqueue(channel, RequestKind::Fetch(handle));
        Ok(())
    }

    /// Re-issues a dedicated fetch's current window. Fails with
    /// [`JpipError::FetchNeedsMove`] after a reconnect: the channel
    /// binding did not survive and the caller must use `move_fetch`.
    pub fn resume_fetch(&mut self, handle: FetchHandle) -> Result<(), JpipError> {
        self.ensure_active()?;
        let fetch = self
            .fetches
            .get_mut(&handle.0)
            .ok_or(JpipError::Internal("unknown fetch handle"))?;
        if !fetch.dedicated {
            return Err(JpipError::FetchNotMovable);
        }
        match fetch.status {
            FetchStatus::Stopped => return Err(JpipError::FetchStopped),
            FetchStatus::NeedsMove => return Err(JpipError::FetchNeedsMove),
            FetchStatus::Active | FetchStatus::Done => {}
        }
        fetch.status = FetchStatus::Active;
        let channel = fetch.channel;
        self.enqueue(channel, RequestKind::Fetch(handle));
        Ok(())
    }

    /// Cancels a fetch, best-effort: a queued request is withdrawn, an
    /// in-flight response is still accepted into the store but no longer
    /// reported. Reusing the handle afterwards is a usage error.
    pub fn stop_fetch(&mut self, handle: FetchHandle) -> Result<(), JpipError> {
        let fetch = self
            .fetches
            .get_mut(&handle.0)
            .ok_or(JpipError::Internal("unknown fetch handle"))?;
        if fetch.status == FetchStatus::Stopped {
            return Err(JpipError::FetchStopped);
        }
        fetch.status = FetchStatus::Stopped;
        let channel = fetch.channel;
        let withdrawn: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, p)| p.kind == RequestKind::Fetch(handle))
            .map(|(id, _)| *id)
            .collect();
        for id in withdrawn {
            if self.channels[channel].dequeue(id) {
                self.requests.remove(&id);
            }
        }
        Ok(())
    }

    /// Closes the session. Returns a best-effort channel-close request
    /// the embedder may still send.
    pub fn close(&mut self) -> Option<TransportRequest> {
        if matches!(self.state, SessionState::Closed | SessionState::Failed) {
            return None;
        }
        let cid = self.channels[0].channel_id().map(str::to_owned);
        let close = cid.map(|cid| TransportRequest {
            id: self.alloc_request_id(),
            descriptor: QueryBuilder::new()
                .field("cclose", "*")
                .field("cid", cid)
                .build(),
        });
        self.state = SessionState::Closed;
        self.requests.clear();
        for channel in &mut self.channels {
            channel.reset_for_reconnect();
        }
        close
    }

    /// Next request ready for the transport, if any. While the session
    /// is negotiating (opening or reconnecting) only the negotiation
    /// request is released; fetches stay queued.
    pub fn next_request(&mut self) -> Option<TransportRequest> {
        if matches!(self.state, SessionState::Closed | SessionState::Failed) {
            return None;
        }
        let negotiating = matches!(
            self.state,
            SessionState::Opening | SessionState::Reconnecting
        );
        for idx in 0..self.channels.len() {
            let head = {
                let channel = &self.channels[idx];
                channel.pending().first().copied()
            };
            let Some(head) = head else { continue };
            let kind = self.requests.get(&head).map(|p| p.kind);
            if negotiating && !matches!(kind, Some(RequestKind::OpenChannel)) {
                continue;
            }
            if let Some(id) = self.channels[idx].try_release() {
                let descriptor = self.build_descriptor(id);
                return Some(TransportRequest { id, descriptor });
            }
        }
        None
    }

    /// Reports the outcome of a transport round trip.
    ///
    /// Parse errors in the response body are returned to the driver;
    /// per-fetch protocol violations are reported through the fetch
    /// callback and leave the session usable.
    pub fn handle_response(
        &mut self,
        id: RequestId,
        result: Result<TransportResponse, TransportFailure>,
    ) -> Result<(), JpipError> {
        let pending = self
            .requests
            .remove(&id)
            .ok_or(JpipError::Internal("response for unknown request id"))?;
        self.channels[pending.channel].complete(id);

        let response = match result {
            Ok(response) => response,
            Err(failure) => {
                warn!("transport failure for request {id:?}: {}", failure.reason);
                self.begin_reconnect(Some(pending));
                return Ok(());
            }
        };

        if let Some(tid) = response.target_id {
            if self.target_id.as_deref().is_some_and(|t| t != tid) {
                warn!("server changed target id from {:?}", self.target_id);
            }
            self.target_id = Some(tid);
        }
        if let Some(spec) = response.new_channel.as_deref() {
            if let Some(cid) = parse_channel_spec(spec) {
                self.channels[pending.channel].set_channel_id(cid);
            }
        }

        let eor = match self.ingest_body(&response.body) {
            Ok(eor) => eor,
            Err(err) => {
                if let RequestKind::Fetch(handle) = pending.kind {
                    self.fire(handle, FetchEvent::Failed(err.clone()));
                }
                return Err(err);
            }
        };

        match pending.kind {
            RequestKind::OpenChannel => self.finish_negotiation(pending.channel),
            RequestKind::Fetch(handle) => self.finish_fetch(handle, eor),
        }
        Ok(())
    }

    fn finish_negotiation(&mut self, channel: usize) {
        if self.channels[channel].is_open() {
            debug!(
                "channel negotiated: cid={:?} tid={:?}",
                self.channels[channel].channel_id(),
                self.target_id
            );
            self.state = SessionState::Ready;
            self.reconnect_attempts = 0;
        } else {
            warn!("negotiation response carried no channel id");
            self.begin_reconnect(None);
        }
    }

    fn finish_fetch(&mut self, handle: FetchHandle, eor: Option<EndOfResponse>) {
        let Some(fetch) = self.fetches.get_mut(&handle.0) else {
            return;
        };
        if fetch.status == FetchStatus::Stopped {
            // Bytes already accepted into the store; nothing to report.
            return;
        }
        let server_complete = eor.as_ref().is_some_and(|e| e.code.declares_complete());
        if !fetch.dedicated {
            fetch.status = FetchStatus::Done;
        }

        // A server claiming the window is fully served must at minimum
        // have delivered the whole main header.
        if server_complete && !self.saver.borrow().main_header().borrow().is_fully_loaded() {
            self.fire(handle, FetchEvent::Failed(JpipError::ResponseIncomplete));
            return;
        }
        self.fire(handle, FetchEvent::Completed { server_complete });
    }

    /// Starts renegotiation after a transport failure. `failed` is the
    /// request whose round trip died: it never got an answer, so it
    /// counts as still pending and is re-issued (pooled) or surfaced as
    /// a lost channel binding (dedicated) like any interrupted request.
    fn begin_reconnect(&mut self, failed: Option<PendingRequest>) {
        if matches!(self.state, SessionState::Closed | SessionState::Failed) {
            return;
        }
        self.reconnect_attempts += 1;
        if self.reconnect_attempts > self.config.max_reconnect_attempts {
            self.fail_session();
            return;
        }
        debug!(
            "reconnecting (attempt {}/{})",
            self.reconnect_attempts, self.config.max_reconnect_attempts
        );
        self.state = SessionState::Reconnecting;

        let mut to_reissue = Vec::new();
        for channel in &mut self.channels {
            to_reissue.extend(channel.reset_for_reconnect());
        }
        let mut interrupted: Vec<PendingRequest> = Vec::new();
        interrupted.extend(failed);
        for id in to_reissue {
            if let Some(pending) = self.requests.remove(&id) {
                interrupted.push(pending);
            }
        }
        // Negotiation must reach the transport ahead of any re-issued
        // fetch, so it goes to the pooled queue first.
        self.enqueue(0, RequestKind::OpenChannel);
        for pending in interrupted {
            match pending.kind {
                RequestKind::OpenChannel => {}
                RequestKind::Fetch(handle) => {
                    let Some(fetch) = self.fetches.get_mut(&handle.0) else {
                        continue;
                    };
                    match (fetch.dedicated, fetch.status) {
                        (_, FetchStatus::Stopped) => {}
                        (true, _) => {
                            // Channel binding does not survive the
                            // reconnect; the caller must move the fetch.
                            fetch.status = FetchStatus::NeedsMove;
                            self.fire(handle, FetchEvent::ChannelLost);
                        }
                        (false, _) => {
                            // Re-issue still-pending requests on the
                            // pooled channel once renegotiated.
                            if let Some(fetch) = self.fetches.get_mut(&handle.0) {
                                fetch.channel = 0;
                            }
                            self.enqueue(0, RequestKind::Fetch(handle));
                        }
                    }
                }
            }
        }
    }

    fn fail_session(&mut self) {
        warn!("session failed after {} reconnect attempts", self.reconnect_attempts);
        self.state = SessionState::Failed;
        self.requests.clear();
        let handles: Vec<u64> = self
            .fetches
            .iter()
            .filter(|(_, f)| matches!(f.status, FetchStatus::Active | FetchStatus::NeedsMove))
            .map(|(h, _)| *h)
            .collect();
        for handle in handles {
            self.fire(FetchHandle(handle), FetchEvent::Failed(JpipError::SessionFailed));
        }
    }

    fn ingest_body(&mut self, body: &[u8]) -> Result<Option<EndOfResponse>, JpipError> {
        let mut parser = MessageHeaderParser::new();
        let mut pos = 0;
        while pos < body.len() {
            match parser.parse(body, pos)? {
                None => {
                    warn!("response body ends mid-message header");
                    return Ok(None);
                }
                Some(ParsedItem::Header { header, next_pos }) => {
                    let body_end = next_pos + header.body_length;
                    if body_end > body.len() {
                        warn!("response body ends mid-message body");
                        return Ok(None);
                    }
                    // Resolve under a short borrow, then append so any
                    // listeners run with the saver released.
                    let bin = self.saver.borrow_mut().databin_for(&header)?;
                    if let Some(bin) = bin {
                        append_and_notify(
                            &bin,
                            header.body_offset,
                            &body[next_pos..body_end],
                            header.is_last_in_databin,
                        )?;
                    }
                    pos = body_end;
                }
                Some(ParsedItem::EndOfResponse { eor, next_pos }) => {
                    if next_pos < body.len() {
                        warn!("{} trailing bytes after end-of-response", body.len() - next_pos);
                    }
                    return Ok(Some(eor));
                }
            }
        }
        Ok(None)
    }

    fn ensure_active(&self) -> Result<(), JpipError> {
        match self.state {
            SessionState::Closed => Err(JpipError::SessionClosed),
            SessionState::Failed => Err(JpipError::SessionFailed),
            _ => Ok(()),
        }
    }

    fn pick_pooled_channel(&mut self) -> usize {
        let pooled: Vec<usize> = (0..self.channels.len())
            .filter(|&i| !self.channels[i].is_dedicated())
            .collect();
        let best = pooled
            .iter()
            .copied()
            .min_by_key(|&i| self.channels[i].load())
            .unwrap_or(0);
        if self.channels[best].load() > 0 && pooled.len() < self.config.max_channels_in_session {
            self.channels.push(Channel::new(
                self.config.max_requests_waiting_for_response_in_channel,
                false,
            ));
            return self.channels.len() - 1;
        }
        best
    }

    fn alloc_fetch(
        &mut self,
        window: FetchWindow,
        wait: WaitBehavior,
        dedicated: bool,
        channel: usize,
        callback: FetchCallback,
    ) -> FetchHandle {
        let handle = FetchHandle(self.next_fetch);
        self.next_fetch += 1;
        self.fetches.insert(
            handle.0,
            FetchState {
                window,
                wait,
                dedicated,
                channel,
                status: FetchStatus::Active,
                callback,
            },
        );
        handle
    }

    fn alloc_request_id(&mut self) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        id
    }

    fn enqueue(&mut self, channel: usize, kind: RequestKind) -> RequestId {
        let id = self.alloc_request_id();
        self.requests.insert(id, PendingRequest { kind, channel });
        self.channels[channel].enqueue(id);
        id
    }

    fn build_descriptor(&mut self, id: RequestId) -> RequestDescriptor {
        let pending = &self.requests[&id];
        let channel = pending.channel;
        let kind = pending.kind;
        let qid = self.next_qid;
        self.next_qid += 1;

        match kind {
            RequestKind::OpenChannel => {
                let mut builder = QueryBuilder::new()
                    .field("cnew", "http")
                    .field("type", "jpp-stream");
                if let Some(tid) = &self.target_id {
                    builder = builder.field("tid", tid.as_str());
                }
                builder.build()
            }
            RequestKind::Fetch(handle) => {
                let fetch = &self.fetches[&handle.0];
                let mut builder = QueryBuilder::new();
                match self.channels[channel].channel_id() {
                    Some(cid) => builder = builder.field("cid", cid),
                    None => {
                        // Unopened channel: piggyback creation on this
                        // request, binding it to an existing channel when
                        // one is open.
                        if let Some(cid) = self.channels[0].channel_id() {
                            builder = builder.field("cid", cid);
                        }
                        builder = builder.field("cnew", "http");
                    }
                }
                let mut window = fetch.window;
                if matches!(fetch.wait, WaitBehavior::WaitForLayers(_)) {
                    // The wait clause carries the layer bound.
                    window.max_quality_layers = None;
                }
                builder
                    .window(&window)
                    .wait(fetch.wait)
                    .field("qid", qid)
                    .build()
            }
        }
    }

    fn fire(&mut self, handle: FetchHandle, event: FetchEvent) {
        if let Some(fetch) = self.fetches.get_mut(&handle.0) {
            (fetch.callback)(event);
        }
    }
}

fn parse_channel_spec(spec: &str) -> Option<String> {
    for item in spec.split(',') {
        let item = item.trim();
        if let Some(cid) = item.strip_prefix("cid=") {
            return Some(cid.to_owned());
        }
    }
    // A bare channel id with no key=value syntax.
    if !spec.contains('=') && !spec.is_empty() {
        return Some(spec.trim().to_owned());
    }
    None
}
