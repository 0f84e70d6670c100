// ============================================================================
// Loopback Runtime
// ============================================================================
//
// In-process implementation of the native call surface for one local rank
// inside a virtual world. Messages the local rank sends to itself are
// matched against its own receives; traffic to and from the other virtual
// ranks is driven explicitly through `inject` and `settle`.
//
// Small sends (<= eager_limit) are copied and complete immediately. Larger
// sends keep pointing at the caller's buffer until a receive matches them
// (self) or they are settled (remote), which is what makes the buffer
// ownership discipline observable in tests.
//
// ============================================================================

use super::{ANY_SOURCE, ANY_TAG, NativeRuntime, WaitStatus};
use crate::core::{BindingError, NativeHandle, Result, ThreadSupportLevel};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

const WORLD: u64 = 1;
const SELF: u64 = 2;
const FIRST_DYNAMIC: u64 = 16;

const IDENT: i32 = 0;
const CONGRUENT: i32 = 1;
const SIMILAR: i32 = 2;
const UNEQUAL: i32 = 3;

/// Loopback runtime configuration
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Number of ranks in the virtual world
    pub world_size: i32,

    /// Rank of the local process
    pub rank: i32,

    /// Highest thread level the runtime will grant
    pub max_level: ThreadSupportLevel,

    /// Sends up to this many bytes complete immediately
    pub eager_limit: usize,

    /// Raw level code returned from `init_thread` regardless of the request
    pub granted_override: Option<i32>,

    /// Make `init_thread` fail with this message
    pub init_failure: Option<String>,
}

impl LoopbackConfig {
    pub fn new(world_size: i32, rank: i32) -> Self {
        Self {
            world_size,
            rank,
            max_level: ThreadSupportLevel::Multiple,
            eager_limit: 64,
            granted_override: None,
            init_failure: None,
        }
    }

    /// Set the highest level granted
    pub fn max_level(mut self, level: ThreadSupportLevel) -> Self {
        self.max_level = level;
        self
    }

    /// Set the eager send limit
    pub fn eager_limit(mut self, limit: usize) -> Self {
        self.eager_limit = limit;
        self
    }

    /// Always grant this raw code
    pub fn granted_override(mut self, code: i32) -> Self {
        self.granted_override = Some(code);
        self
    }

    /// Fail initialization
    pub fn init_failure(mut self, message: &str) -> Self {
        self.init_failure = Some(message.to_string());
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.world_size <= 0 {
            return Err("world_size must be > 0".to_string());
        }

        if self.rank < 0 || self.rank >= self.world_size {
            return Err(format!(
                "rank {} is outside a world of size {}",
                self.rank, self.world_size
            ));
        }

        Ok(())
    }
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self::new(4, 0)
    }
}

#[derive(Debug, Clone, Copy)]
struct SendBuf {
    ptr: *const u8,
    len: usize,
}

#[derive(Debug, Clone, Copy)]
struct RecvBuf {
    ptr: *mut u8,
    capacity: usize,
}

// The pointers are only dereferenced under the state mutex, and the caller
// of isend/irecv guarantees they stay valid until the request finishes.
unsafe impl Send for SendBuf {}
unsafe impl Send for RecvBuf {}

#[derive(Debug)]
enum Payload {
    Copied(Vec<u8>),
    Borrowed { buf: SendBuf, request: u64 },
}

#[derive(Debug)]
struct Envelope {
    comm: u64,
    source: i32,
    tag: i32,
    payload: Payload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Pending,
    Done,
    Cancelled,
}

#[derive(Debug)]
enum RequestOp {
    Send { outbound: bool },
    Recv {
        comm: u64,
        source: i32,
        tag: i32,
        buf: RecvBuf,
    },
}

#[derive(Debug)]
struct LoopRequest {
    op: RequestOp,
    state: RequestState,
    received: usize,
}

#[derive(Debug, Default)]
struct LoopbackState {
    initialized: bool,
    next_handle: u64,
    comms: HashMap<u64, Vec<i32>>,
    groups: HashMap<u64, Vec<i32>>,
    requests: HashMap<u64, LoopRequest>,
    unexpected: VecDeque<Envelope>,
    posted: Vec<u64>,
    frees: HashMap<u64, usize>,
    finalize_calls: usize,
}

impl LoopbackState {
    fn fresh_handle(&mut self) -> u64 {
        let id = self.next_handle;
        self.next_handle += 1;
        id
    }

    fn comm_members(&self, comm: NativeHandle) -> Result<&Vec<i32>> {
        self.comms
            .get(&comm.0)
            .ok_or_else(|| BindingError::Runtime(format!("invalid communicator {}", comm)))
    }

    fn group_members(&self, group: NativeHandle) -> Result<&Vec<i32>> {
        self.groups
            .get(&group.0)
            .ok_or_else(|| BindingError::Runtime(format!("invalid group {}", group)))
    }

    fn take_posted(&mut self, comm: u64, source: i32, tag: i32) -> Option<u64> {
        let requests = &self.requests;
        let pos = self.posted.iter().position(|id| match requests.get(id) {
            Some(LoopRequest {
                op:
                    RequestOp::Recv {
                        comm: c,
                        source: s,
                        tag: t,
                        ..
                    },
                ..
            }) => *c == comm && matches(*s, *t, source, tag),
            _ => false,
        })?;
        Some(self.posted.remove(pos))
    }

    fn take_unexpected(&mut self, comm: u64, source: i32, tag: i32) -> Option<Envelope> {
        let pos = self
            .unexpected
            .iter()
            .position(|e| e.comm == comm && matches(source, tag, e.source, e.tag))?;
        self.unexpected.remove(pos)
    }

    fn finish_recv(&mut self, recv: u64, bytes: *const u8, len: usize) {
        if let Some(req) = self.requests.get_mut(&recv) {
            if let RequestOp::Recv { buf, .. } = req.op {
                // SAFETY: irecv's caller keeps `buf` valid until completion
                req.received = unsafe { copy_into(buf, bytes, len) };
                req.state = RequestState::Done;
            }
        }
    }

    fn mark(&mut self, request: u64, state: RequestState) {
        if let Some(req) = self.requests.get_mut(&request) {
            req.state = state;
        }
    }
}

fn matches(want_source: i32, want_tag: i32, source: i32, tag: i32) -> bool {
    (want_source == ANY_SOURCE || want_source == source) && (want_tag == ANY_TAG || want_tag == tag)
}

/// # Safety
/// `buf` must be valid for `buf.capacity` writes and `bytes` for `len` reads.
unsafe fn copy_into(buf: RecvBuf, bytes: *const u8, len: usize) -> usize {
    let n = len.min(buf.capacity);
    if n > 0 {
        unsafe { std::ptr::copy_nonoverlapping(bytes, buf.ptr, n) };
    }
    n
}

fn compare_members(a: &[i32], b: &[i32], same_order: i32) -> i32 {
    if a == b {
        return same_order;
    }

    let mut left = a.to_vec();
    let mut right = b.to_vec();
    left.sort_unstable();
    right.sort_unstable();
    if left == right { SIMILAR } else { UNEQUAL }
}

/// Counts concurrent entries into the runtime for the lifetime of a call
struct CallProbe<'a> {
    in_flight: &'a AtomicUsize,
}

impl<'a> CallProbe<'a> {
    fn enter(in_flight: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { in_flight }
    }
}

impl Drop for CallProbe<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-process native runtime
pub struct LoopbackRuntime {
    config: LoopbackConfig,
    state: Mutex<LoopbackState>,
    progress: Condvar,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl LoopbackRuntime {
    pub fn new(config: LoopbackConfig) -> Result<Self> {
        config.validate().map_err(BindingError::Runtime)?;

        let mut state = LoopbackState {
            next_handle: FIRST_DYNAMIC,
            ..LoopbackState::default()
        };
        state.comms.insert(WORLD, (0..config.world_size).collect());
        state.comms.insert(SELF, vec![config.rank]);

        Ok(Self {
            config,
            state: Mutex::new(state),
            progress: Condvar::new(),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    fn probe(&self) -> CallProbe<'_> {
        CallProbe::enter(&self.in_flight, &self.peak_in_flight)
    }

    fn lock(&self) -> Result<MutexGuard<'_, LoopbackState>> {
        Ok(self.state.lock()?)
    }

    fn local_rank(&self, members: &[i32]) -> Option<i32> {
        members
            .iter()
            .position(|r| *r == self.config.rank)
            .map(|p| p as i32)
    }

    /// Deliver a message from virtual rank `source` (comm-local) to the local rank
    ///
    /// Returns true if a posted receive matched immediately; otherwise the
    /// message waits in the unexpected queue.
    pub fn inject(&self, comm: NativeHandle, source: i32, tag: i32, bytes: &[u8]) -> Result<bool> {
        let mut state = self.lock()?;
        let size = state.comm_members(comm)?.len() as i32;
        if source < 0 || source >= size {
            return Err(BindingError::Runtime(format!(
                "source {} outside communicator of size {}",
                source, size
            )));
        }

        let matched = match state.take_posted(comm.0, source, tag) {
            Some(recv) => {
                state.finish_recv(recv, bytes.as_ptr(), bytes.len());
                true
            }
            None => {
                state.unexpected.push_back(Envelope {
                    comm: comm.0,
                    source,
                    tag,
                    payload: Payload::Copied(bytes.to_vec()),
                });
                false
            }
        };

        drop(state);
        self.progress.notify_all();
        Ok(matched)
    }

    /// Finish one outstanding send to a remote virtual rank
    pub fn settle(&self, request: NativeHandle) -> Result<bool> {
        let mut state = self.lock()?;
        let settled = match state.requests.get_mut(&request.0) {
            Some(req) => match req.op {
                RequestOp::Send { outbound: true } if req.state == RequestState::Pending => {
                    req.state = RequestState::Done;
                    true
                }
                _ => false,
            },
            None => false,
        };

        drop(state);
        if settled {
            self.progress.notify_all();
        }
        Ok(settled)
    }

    /// Finish every outstanding send to a remote virtual rank
    pub fn settle_outbound(&self) -> Result<usize> {
        let mut state = self.lock()?;
        let mut settled = 0;
        for req in state.requests.values_mut() {
            if matches!(req.op, RequestOp::Send { outbound: true })
                && req.state == RequestState::Pending
            {
                req.state = RequestState::Done;
                settled += 1;
            }
        }

        drop(state);
        self.progress.notify_all();
        Ok(settled)
    }

    /// Bytes delivered into a finished receive
    pub fn received_len(&self, request: NativeHandle) -> Result<usize> {
        let state = self.lock()?;
        state
            .requests
            .get(&request.0)
            .map(|r| r.received)
            .ok_or_else(|| BindingError::Runtime(format!("unknown request {}", request)))
    }

    /// How many times `handle` was freed
    pub fn free_count(&self, handle: NativeHandle) -> usize {
        self.lock()
            .map(|s| s.frees.get(&handle.0).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Requests the runtime still holds state for, finished or not
    pub fn request_count(&self) -> usize {
        self.lock().map(|s| s.requests.len()).unwrap_or(0)
    }

    pub fn finalize_count(&self) -> usize {
        self.lock().map(|s| s.finalize_calls).unwrap_or(0)
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().map(|s| s.initialized).unwrap_or(false)
    }

    /// Highest number of threads observed inside the runtime at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn reset_peak_concurrency(&self) {
        self.peak_in_flight.store(0, Ordering::SeqCst);
    }

    fn free(&self, handle: NativeHandle, groups: bool) -> Result<()> {
        let _probe = self.probe();
        if handle.0 == WORLD || handle.0 == SELF {
            return Err(BindingError::Runtime(format!(
                "predefined communicator {} cannot be freed",
                handle
            )));
        }

        let mut state = self.lock()?;
        let removed = if groups {
            state.groups.remove(&handle.0).is_some()
        } else {
            state.comms.remove(&handle.0).is_some()
        };
        if !removed {
            return Err(BindingError::Runtime(format!("invalid handle {}", handle)));
        }

        *state.frees.entry(handle.0).or_insert(0) += 1;
        Ok(())
    }
}

impl NativeRuntime for LoopbackRuntime {
    fn init_thread(&self, requested: i32) -> Result<i32> {
        let _probe = self.probe();
        if let Some(message) = &self.config.init_failure {
            return Err(BindingError::Runtime(message.clone()));
        }

        let mut state = self.lock()?;
        if state.initialized {
            return Err(BindingError::Runtime("init_thread called twice".into()));
        }
        state.initialized = true;

        if let Some(code) = self.config.granted_override {
            return Ok(code);
        }
        Ok(requested.min(self.config.max_level.raw()))
    }

    fn finalize(&self) -> Result<()> {
        let _probe = self.probe();
        let mut state = self.lock()?;
        if !state.initialized {
            return Err(BindingError::Runtime("finalize without init".into()));
        }
        state.initialized = false;
        state.finalize_calls += 1;

        // Requests do not outlive the runtime epoch that issued them
        state.requests.clear();
        state.posted.clear();
        state.unexpected.clear();
        Ok(())
    }

    fn comm_world(&self) -> NativeHandle {
        NativeHandle(WORLD)
    }

    fn comm_self(&self) -> NativeHandle {
        NativeHandle(SELF)
    }

    fn comm_rank(&self, comm: NativeHandle) -> Result<i32> {
        let _probe = self.probe();
        let state = self.lock()?;
        let members = state.comm_members(comm)?;
        self.local_rank(members)
            .ok_or_else(|| BindingError::Runtime(format!("not a member of {}", comm)))
    }

    fn comm_size(&self, comm: NativeHandle) -> Result<i32> {
        let _probe = self.probe();
        let state = self.lock()?;
        Ok(state.comm_members(comm)?.len() as i32)
    }

    fn comm_compare(&self, a: NativeHandle, b: NativeHandle) -> Result<i32> {
        let _probe = self.probe();
        let state = self.lock()?;
        let left = state.comm_members(a)?;
        let right = state.comm_members(b)?;
        if a == b {
            return Ok(IDENT);
        }
        Ok(compare_members(left, right, CONGRUENT))
    }

    fn comm_dup(&self, comm: NativeHandle) -> Result<NativeHandle> {
        let _probe = self.probe();
        let mut state = self.lock()?;
        let members = state.comm_members(comm)?.clone();
        let id = state.fresh_handle();
        state.comms.insert(id, members);
        Ok(NativeHandle(id))
    }

    fn comm_group(&self, comm: NativeHandle) -> Result<NativeHandle> {
        let _probe = self.probe();
        let mut state = self.lock()?;
        let members = state.comm_members(comm)?.clone();
        let id = state.fresh_handle();
        state.groups.insert(id, members);
        Ok(NativeHandle(id))
    }

    fn comm_create(&self, comm: NativeHandle, group: NativeHandle) -> Result<Option<NativeHandle>> {
        let _probe = self.probe();
        let mut state = self.lock()?;
        let parent = state.comm_members(comm)?;
        let members = state.group_members(group)?.clone();
        if let Some(outsider) = members.iter().find(|r| !parent.contains(r)) {
            return Err(BindingError::Runtime(format!(
                "rank {} of group {} is not in communicator {}",
                outsider, group, comm
            )));
        }

        if self.local_rank(&members).is_none() {
            return Ok(None);
        }

        let id = state.fresh_handle();
        state.comms.insert(id, members);
        Ok(Some(NativeHandle(id)))
    }

    fn comm_free(&self, comm: NativeHandle) -> Result<()> {
        self.free(comm, false)
    }

    fn group_incl(&self, group: NativeHandle, ranks: &[i32]) -> Result<NativeHandle> {
        let _probe = self.probe();
        let mut state = self.lock()?;
        let members = state.group_members(group)?;

        let mut selected = Vec::with_capacity(ranks.len());
        for &rank in ranks {
            let member = usize::try_from(rank)
                .ok()
                .and_then(|r| members.get(r))
                .ok_or_else(|| {
                    BindingError::Runtime(format!("rank {} outside group {}", rank, group))
                })?;
            if selected.contains(member) {
                return Err(BindingError::Runtime(format!(
                    "rank {} listed twice",
                    rank
                )));
            }
            selected.push(*member);
        }

        let id = state.fresh_handle();
        state.groups.insert(id, selected);
        Ok(NativeHandle(id))
    }

    fn group_compare(&self, a: NativeHandle, b: NativeHandle) -> Result<i32> {
        let _probe = self.probe();
        let state = self.lock()?;
        let left = state.group_members(a)?;
        let right = state.group_members(b)?;
        // Groups with the same members in the same order are identical
        Ok(compare_members(left, right, IDENT))
    }

    fn group_free(&self, group: NativeHandle) -> Result<()> {
        self.free(group, true)
    }

    unsafe fn isend(
        &self,
        comm: NativeHandle,
        dest: i32,
        tag: i32,
        buf: *const u8,
        len: usize,
    ) -> Result<NativeHandle> {
        let _probe = self.probe();
        let mut state = self.lock()?;
        let members = state.comm_members(comm)?.clone();
        let dest_world = usize::try_from(dest)
            .ok()
            .and_then(|d| members.get(d))
            .copied()
            .ok_or_else(|| {
                BindingError::Runtime(format!("destination {} outside {}", dest, comm))
            })?;
        let source = self
            .local_rank(&members)
            .ok_or_else(|| BindingError::Runtime(format!("not a member of {}", comm)))?;

        let id = state.fresh_handle();
        let eager = len <= self.config.eager_limit;

        let (op, request_state) = if dest_world != self.config.rank {
            let request_state = if eager {
                RequestState::Done
            } else {
                RequestState::Pending
            };
            (RequestOp::Send { outbound: true }, request_state)
        } else if let Some(recv) = state.take_posted(comm.0, source, tag) {
            state.finish_recv(recv, buf, len);
            (RequestOp::Send { outbound: false }, RequestState::Done)
        } else if eager {
            // SAFETY: isend's caller guarantees `buf` is readable for `len` bytes
            let bytes = unsafe { std::slice::from_raw_parts(buf, len) }.to_vec();
            state.unexpected.push_back(Envelope {
                comm: comm.0,
                source,
                tag,
                payload: Payload::Copied(bytes),
            });
            (RequestOp::Send { outbound: false }, RequestState::Done)
        } else {
            state.unexpected.push_back(Envelope {
                comm: comm.0,
                source,
                tag,
                payload: Payload::Borrowed {
                    buf: SendBuf { ptr: buf, len },
                    request: id,
                },
            });
            (RequestOp::Send { outbound: false }, RequestState::Pending)
        };

        state.requests.insert(
            id,
            LoopRequest {
                op,
                state: request_state,
                received: 0,
            },
        );

        drop(state);
        self.progress.notify_all();
        Ok(NativeHandle(id))
    }

    unsafe fn irecv(
        &self,
        comm: NativeHandle,
        source: i32,
        tag: i32,
        buf: *mut u8,
        capacity: usize,
    ) -> Result<NativeHandle> {
        let _probe = self.probe();
        let mut state = self.lock()?;
        let size = state.comm_members(comm)?.len() as i32;
        if source != ANY_SOURCE && (source < 0 || source >= size) {
            return Err(BindingError::Runtime(format!(
                "source {} outside communicator of size {}",
                source, size
            )));
        }

        let id = state.fresh_handle();
        let recv_buf = RecvBuf { ptr: buf, capacity };
        state.requests.insert(
            id,
            LoopRequest {
                op: RequestOp::Recv {
                    comm: comm.0,
                    source,
                    tag,
                    buf: recv_buf,
                },
                state: RequestState::Pending,
                received: 0,
            },
        );

        match state.take_unexpected(comm.0, source, tag) {
            Some(envelope) => match envelope.payload {
                Payload::Copied(bytes) => state.finish_recv(id, bytes.as_ptr(), bytes.len()),
                Payload::Borrowed { buf: send, request } => {
                    state.finish_recv(id, send.ptr, send.len);
                    state.mark(request, RequestState::Done);
                }
            },
            None => state.posted.push(id),
        }

        drop(state);
        self.progress.notify_all();
        Ok(NativeHandle(id))
    }

    fn wait(&self, request: NativeHandle, deadline: Option<Instant>) -> Result<WaitStatus> {
        let _probe = self.probe();
        let mut state = self.lock()?;
        loop {
            match state.requests.get(&request.0).map(|r| r.state) {
                None => {
                    return Err(BindingError::Runtime(format!("unknown request {}", request)));
                }
                Some(RequestState::Done) => return Ok(WaitStatus::Completed),
                Some(RequestState::Cancelled) => return Ok(WaitStatus::Cancelled),
                Some(RequestState::Pending) => {}
            }

            match deadline {
                None => state = self.progress.wait(state)?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(WaitStatus::TimedOut);
                    }
                    state = self.progress.wait_timeout(state, deadline - now)?.0;
                }
            }
        }
    }

    fn cancel(&self, request: NativeHandle) -> Result<bool> {
        let _probe = self.probe();
        let mut state = self.lock()?;
        let pending = match state.requests.get(&request.0) {
            Some(req) => req.state == RequestState::Pending,
            None => {
                return Err(BindingError::Runtime(format!("unknown request {}", request)));
            }
        };
        if !pending {
            return Ok(false);
        }

        state.posted.retain(|id| *id != request.0);
        state.unexpected.retain(|e| {
            !matches!(e.payload, Payload::Borrowed { request: r, .. } if r == request.0)
        });
        state.mark(request.0, RequestState::Cancelled);

        drop(state);
        self.progress.notify_all();
        Ok(true)
    }
}
