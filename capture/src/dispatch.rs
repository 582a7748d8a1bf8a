use std::collections::HashMap;
use std::time::{Duration, Instant};

use protocol::{LockKind, Query, Record, Welcome};
use tracing::debug;

use crate::error::StreamFailure;
use crate::interner::{SrcLocRef, StringRef};
use crate::model::{
    CrashEvent, FrameEvent, GpuContext, GpuSlot, GpuSlotTarget, GpuZone, GpuZoneRef, LockEvent,
    LockEventKind, LockMap, MemEvent, MessageData, PlotItem, TraceModel, Zone, ZoneRef,
};

/// Resolution of a free record whose pointer has no active allocation.
/// Tolerating is the default for on-demand sessions, where the matching
/// allocation may predate the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemFreePolicy {
    Tolerate,
    Fail,
}

const PLOT_MERGE_DEBOUNCE: Duration = Duration::from_millis(100);

/// Where the next callstack record for a thread attaches.
#[derive(Debug, Clone, Copy)]
enum AwaitCallstack {
    Zone(ZoneRef),
    Gpu(GpuZoneRef),
    Crash,
}

/// The per-record transition function over the trace model. One instance
/// per session; the session write-locks it for the duration of a block.
pub struct Ingest {
    pub model: TraceModel,
    policy: MemFreePolicy,
    terminate: bool,
    crashed: bool,
    outbox: Vec<Query>,
    replenish: usize,
    awaiting_callstack: HashMap<u16, AwaitCallstack>,
    pending_memory_callstack: Option<crate::interner::CallstackId>,
    /// Inline source locations by transfer token, live-session only.
    payload_src_locs: HashMap<u64, u32>,
    /// Frame-symbol transfer in progress: token and records remaining.
    frame_fill: Option<(u64, u8)>,
    postpone_stamp: Option<Instant>,
}

impl Ingest {
    pub fn new(policy: MemFreePolicy) -> Self {
        Ingest {
            model: TraceModel::new(),
            policy,
            terminate: false,
            crashed: false,
            outbox: Vec::new(),
            replenish: 0,
            awaiting_callstack: HashMap::new(),
            pending_memory_callstack: None,
            payload_src_locs: HashMap::new(),
            frame_fill: None,
            postpone_stamp: None,
        }
    }

    /// Applies the handshake payload: session metadata plus the initial
    /// frame of the default frame set.
    pub fn apply_welcome(&mut self, welcome: &Welcome, frame_offset: u64) {
        self.model.timer_mul = welcome.timer_mul;
        self.model.epoch = welcome.epoch;
        self.model.on_demand = welcome.on_demand;
        self.model.program_name = welcome.program_name.clone();
        self.model.host_info = welcome.host_info.clone();
        self.model.frame_offset = frame_offset;
        self.model.frame_sets[0].frames.push(FrameEvent {
            start: welcome.init_begin,
            end: Some(welcome.init_end),
        });
        self.model.observe_time(welcome.init_end);
    }

    pub fn terminated(&self) -> bool {
        self.terminate
    }

    pub fn crashed(&self) -> bool {
        self.crashed
    }

    /// Queries accumulated since the last drain.
    pub fn take_queries(&mut self) -> Vec<Query> {
        std::mem::take(&mut self.outbox)
    }

    /// Credits returned by resolution records since the last drain.
    pub fn take_replenish(&mut self) -> usize {
        std::mem::take(&mut self.replenish)
    }

    /// True once the stream may complete: no outstanding resolutions, no
    /// partial frame transfer, no postponed plot data, and every zone
    /// stack empty unless the client crashed.
    pub fn quiescent(&self) -> bool {
        self.model.strings.pending_total() == 0
            && self.frame_fill.is_none()
            && self.model.plots.iter().all(|p| p.postponed.is_empty())
            && (self.crashed || self.model.threads.iter().all(|t| t.stack.is_empty()))
    }

    fn query(&mut self, q: Option<Query>) {
        if let Some(q) = q {
            self.outbox.push(q);
        }
    }

    /// Registers a thread, requesting its name on first sight.
    fn notice_thread(&mut self, id: u64) -> u16 {
        let known = self.model.find_thread(id).is_some();
        let t = self.model.compress_thread(id);
        if !known {
            let q = self.model.strings.need_thread_name(id);
            self.query(q);
        }
        t
    }

    fn known_src_loc(&mut self, token: u64) -> SrcLocRef {
        let (idx, q) = self.model.strings.shrink_src_loc(token);
        self.query(q);
        SrcLocRef::Known(idx)
    }

    fn string_ref(token: u64) -> StringRef {
        if token == 0 {
            StringRef::None
        } else {
            StringRef::Ptr(token)
        }
    }

    pub fn process(&mut self, record: Record) -> Result<(), StreamFailure> {
        use Record::*;
        match record {
            ZoneBegin { thread, time, src_loc, cpu } => {
                let loc = self.known_src_loc(src_loc);
                self.zone_begin(thread, time, loc, cpu, false);
            }
            ZoneBeginCallstack { thread, time, src_loc, cpu } => {
                let loc = self.known_src_loc(src_loc);
                self.zone_begin(thread, time, loc, cpu, true);
            }
            ZoneBeginAllocSrcLoc { thread, time, src_loc, cpu } => {
                let loc = self.payload_src_loc(src_loc)?;
                self.zone_begin(thread, time, loc, cpu, false);
            }
            ZoneBeginAllocSrcLocCallstack { thread, time, src_loc, cpu } => {
                let loc = self.payload_src_loc(src_loc)?;
                self.zone_begin(thread, time, loc, cpu, true);
            }
            ZoneEnd { thread, time, cpu } => self.zone_end(thread, time, cpu)?,
            ZoneValidation { thread, id } => {
                let t = self.notice_thread(thread);
                self.model.thread_mut(t).next_zone_id = id;
            }
            ZoneText { thread, text } => self.zone_attach(thread, text, false)?,
            ZoneName { thread, text } => self.zone_attach(thread, text, true)?,
            FrameMark { name, time } => self.frame_mark(name, time, FrameMarkKind::Continuous)?,
            FrameMarkStart { name, time } => self.frame_mark(name, time, FrameMarkKind::Start)?,
            FrameMarkEnd { name, time } => self.frame_mark(name, time, FrameMarkKind::End)?,
            LockAnnounce { id, time, src_loc, kind } => {
                let loc = self.known_src_loc(src_loc);
                let lock = self.lock_entry(id, kind);
                lock.src_loc = loc;
                lock.kind = kind;
                lock.valid = true;
                lock.announce = Some(time);
                self.model.observe_time(time);
            }
            LockTerminate { id, time, kind } => {
                let lock = self.lock_entry(id, kind);
                lock.terminate = Some(time);
                self.model.observe_time(time);
            }
            LockWait { id, thread, time, kind } => {
                self.lock_event_lenient(id, thread, time, kind, LockEventKind::Wait);
            }
            LockObtain { id, thread, time } => {
                self.lock_event(id, thread, time, LockEventKind::Obtain)?
            }
            LockRelease { id, thread, time } => {
                self.lock_event(id, thread, time, LockEventKind::Release)?
            }
            LockSharedWait { id, thread, time } => {
                self.lock_event_lenient(id, thread, time, LockKind::Shared, LockEventKind::WaitShared);
            }
            LockSharedObtain { id, thread, time } => {
                self.lock_event(id, thread, time, LockEventKind::ObtainShared)?
            }
            LockSharedRelease { id, thread, time } => {
                self.lock_event(id, thread, time, LockEventKind::ReleaseShared)?
            }
            LockMark { id, thread, src_loc } => self.lock_mark(id, thread, src_loc)?,
            PlotData { name, time, value } => self.plot_data(name, time, value),
            Message { thread, time, text } => self.message(thread, time, text, 0),
            MessageLiteral { thread, time, text } => {
                let q = self.model.strings.need_string(text);
                self.query(q);
                self.message(thread, time, text, 0);
            }
            MessageColor { thread, time, text, color } => self.message(thread, time, text, color),
            MessageLiteralColor { thread, time, text, color } => {
                let q = self.model.strings.need_string(text);
                self.query(q);
                self.message(thread, time, text, color);
            }
            GpuNewContext { context, thread, cpu_time, gpu_time, period } => {
                let t = self.notice_thread(thread);
                let diff = cpu_time - (gpu_time as f64 * period as f64) as i64;
                self.model
                    .gpu_contexts
                    .entry(context)
                    .or_insert_with(|| GpuContext::new(t, period, diff));
                self.model.observe_time(cpu_time);
            }
            GpuZoneBegin { context, thread, cpu_time, src_loc, query_id } => {
                let loc = self.known_src_loc(src_loc);
                self.gpu_zone_begin(context, thread, cpu_time, loc, query_id, false)?;
            }
            GpuZoneBeginCallstack { context, thread, cpu_time, src_loc, query_id } => {
                let loc = self.known_src_loc(src_loc);
                self.gpu_zone_begin(context, thread, cpu_time, loc, query_id, true)?;
            }
            GpuZoneEnd { context, cpu_time, query_id } => {
                self.gpu_zone_end(context, cpu_time, query_id)?
            }
            GpuTime { context, query_id, gpu_time } => {
                self.gpu_time(context, query_id, gpu_time)?
            }
            MemAlloc { thread, time, ptr, size } => {
                self.mem_alloc(thread, time, ptr, size, false)?
            }
            MemAllocCallstack { thread, time, ptr, size } => {
                self.mem_alloc(thread, time, ptr, size, true)?
            }
            MemFree { thread, time, ptr } => self.mem_free(thread, time, ptr, false)?,
            MemFreeCallstack { thread, time, ptr } => self.mem_free(thread, time, ptr, true)?,
            Callstack { thread, ptr } | CallstackAlloc { thread, ptr } => {
                self.attach_callstack(thread, ptr)?
            }
            CallstackMemory { ptr } => {
                let id = self
                    .model
                    .strings
                    .callstack_for_ptr(ptr)
                    .ok_or(StreamFailure::CallstackDesync)?;
                self.pending_memory_callstack = Some(id);
            }
            CallstackPayload { ptr, frames } => {
                let mut queries = Vec::new();
                self.model.strings.add_callstack(ptr, frames, &mut queries);
                self.outbox.extend(queries);
            }
            CallstackAllocPayload { ptr, frames, sites } => {
                let mut combined = Vec::with_capacity(sites.len() + frames.len());
                for site in &sites {
                    combined.push(self.model.strings.synthetic_frame(site));
                }
                combined.extend(frames);
                let mut queries = Vec::new();
                self.model.strings.add_callstack(ptr, combined, &mut queries);
                self.outbox.extend(queries);
            }
            CallstackFrameSize { ptr, count } => {
                self.model.strings.begin_frame_fill(ptr);
                self.frame_fill = (count > 0).then_some((ptr, count));
                self.replenish += 1;
            }
            CallstackFrame { name, file, line } => {
                let Some((token, remaining)) = self.frame_fill else {
                    return Err(StreamFailure::CallstackDesync);
                };
                let name = self.model.strings.intern(&name);
                let file = self.model.strings.intern(&file);
                self.model
                    .strings
                    .push_frame_data(token, crate::interner::FrameData { name, file, line });
                self.frame_fill = (remaining > 1).then_some((token, remaining - 1));
            }
            SourceLocation { ptr, name, function, file, line, color } => {
                for token in [name, function, file] {
                    if token != 0 {
                        let q = self.model.strings.need_string(token);
                        self.query(q);
                    }
                }
                self.model.strings.resolve_src_loc(
                    ptr,
                    crate::interner::SourceLocation {
                        name: Self::string_ref(name),
                        function: Self::string_ref(function),
                        file: Self::string_ref(file),
                        line,
                        color,
                    },
                );
                self.replenish += 1;
            }
            SourceLocationPayload { ptr, line, color, name, function, file } => {
                let loc = crate::interner::SourceLocation {
                    name: self.intern_opt(&name),
                    function: self.intern_opt(&function),
                    file: self.intern_opt(&file),
                    line,
                    color,
                };
                let idx = self.model.strings.add_payload_src_loc(loc);
                self.payload_src_locs.insert(ptr, idx);
            }
            StringData { ptr, text } => {
                self.model.strings.resolve_string(ptr, &text);
                self.replenish += 1;
            }
            ThreadName { thread, name } => {
                let t = self.notice_thread(thread);
                let idx = self.model.strings.intern(&name);
                self.model.thread_mut(t).name = StringRef::Idx(idx);
                self.model.strings.resolve_thread_name(thread);
                self.replenish += 1;
            }
            PlotName { name, text } => {
                self.model.strings.resolve_string(name, &text);
                self.model.strings.resolve_plot_name(name);
                self.replenish += 1;
            }
            FrameName { name, text } => {
                self.model.strings.resolve_string(name, &text);
                self.model.strings.resolve_frame_name(name);
                self.replenish += 1;
            }
            CustomStringData { ptr, text } => {
                self.model.strings.store_custom_string(ptr, &text);
            }
            Crash { thread, time } => {
                let t = self.notice_thread(thread);
                self.crashed = true;
                self.model.observe_time(time);
                self.model.crash.get_or_insert(CrashEvent {
                    thread: t,
                    time,
                    message: StringRef::None,
                    callstack: None,
                });
            }
            CrashReport { thread, time, text } => {
                let t = self.notice_thread(thread);
                let q = self.model.strings.need_string(text);
                self.query(q);
                self.crashed = true;
                self.model.observe_time(time);
                self.model.crash = Some(CrashEvent {
                    thread: t,
                    time,
                    message: Self::string_ref(text),
                    callstack: None,
                });
                self.awaiting_callstack.insert(t, AwaitCallstack::Crash);
            }
            SysTimeReport { time, usage } => {
                self.model.sys_time.push((time, usage));
            }
            Terminate => {
                debug!("terminate requested by client");
                self.terminate = true;
            }
            KeepAlive => {}
        }
        Ok(())
    }

    fn intern_opt(&mut self, s: &str) -> StringRef {
        if s.is_empty() {
            StringRef::None
        } else {
            StringRef::Idx(self.model.strings.intern(s))
        }
    }

    fn payload_src_loc(&self, token: u64) -> Result<SrcLocRef, StreamFailure> {
        self.payload_src_locs
            .get(&token)
            .map(|&idx| SrcLocRef::Payload(idx))
            .ok_or(StreamFailure::UnknownSourceLocationPayload { token })
    }

    fn zone_begin(
        &mut self,
        thread: u64,
        time: i64,
        src_loc: SrcLocRef,
        cpu: i16,
        expects_callstack: bool,
    ) {
        let t = self.notice_thread(thread);
        self.model.observe_time(time);
        let zone = self.model.new_zone(Zone {
            start: time,
            end: None,
            cpu_start: cpu,
            cpu_end: -1,
            src_loc,
            text: StringRef::None,
            name: StringRef::None,
            callstack: None,
            children: None,
        });
        let parent = {
            let td = self.model.thread_mut(t);
            let id = td.next_zone_id;
            td.next_zone_id = 0;
            td.zone_id_stack.push(id);
            let parent = td.stack.last().copied();
            td.stack.push(zone);
            if parent.is_none() {
                td.timeline.push(zone);
            }
            parent
        };
        if let Some(parent) = parent {
            self.model.add_zone_child(parent, zone);
        }
        if expects_callstack {
            self.awaiting_callstack.insert(t, AwaitCallstack::Zone(zone));
        }
    }

    fn zone_end(&mut self, thread: u64, time: i64, cpu: i16) -> Result<(), StreamFailure> {
        let t = self
            .model
            .find_thread(thread)
            .ok_or(StreamFailure::ZoneEndMismatch { thread })?;
        let (zone, id) = {
            let td = self.model.thread_mut(t);
            let zone = td.stack.pop().ok_or(StreamFailure::ZoneEndMismatch { thread })?;
            let id = td.zone_id_stack.pop().unwrap_or(0);
            (zone, id)
        };
        let expected_id = self.model.thread(t).next_zone_id;
        if id != expected_id {
            return Err(StreamFailure::ZoneIdMismatch {
                thread,
                expected: id,
                found: expected_id,
            });
        }
        self.model.thread_mut(t).next_zone_id = 0;
        let z = &mut self.model.zones[zone.0 as usize];
        z.end = Some(time.max(z.start));
        z.cpu_end = cpu;
        self.model.observe_time(time);
        Ok(())
    }

    /// Attaches a custom string to the innermost open zone, as text or as
    /// the zone-name override.
    fn zone_attach(&mut self, thread: u64, text: u64, as_name: bool) -> Result<(), StreamFailure> {
        let failure = if as_name {
            StreamFailure::ZoneNameMismatch { thread }
        } else {
            StreamFailure::ZoneTextMismatch { thread }
        };
        let t = self.model.find_thread(thread).ok_or(failure)?;
        let zone = {
            let td = self.model.thread_mut(t);
            let zone = *td.stack.last().ok_or(failure)?;
            if td.next_zone_id != 0 && td.zone_id_stack.last() != Some(&td.next_zone_id) {
                return Err(failure);
            }
            td.next_zone_id = 0;
            zone
        };
        let z = &mut self.model.zones[zone.0 as usize];
        if as_name {
            z.name = StringRef::Ptr(text);
        } else {
            z.text = StringRef::Ptr(text);
        }
        Ok(())
    }

    fn frame_mark(&mut self, name: u64, time: i64, kind: FrameMarkKind) -> Result<(), StreamFailure> {
        if name != 0 {
            let q = self.model.strings.need_frame_name(name);
            self.query(q);
        }
        let continuous = matches!(kind, FrameMarkKind::Continuous);
        let set = self.model.frame_set(name, continuous);
        let frames = &mut self.model.frame_sets[set as usize].frames;
        match kind {
            FrameMarkKind::Continuous => {
                if let Some(last) = frames.last_mut() {
                    if last.end.is_none() {
                        last.end = Some(time);
                    }
                }
                frames.push(FrameEvent { start: time, end: None });
            }
            FrameMarkKind::Start => {
                frames.push(FrameEvent { start: time, end: None });
            }
            FrameMarkKind::End => {
                let open = frames.last_mut().filter(|f| f.end.is_none());
                match open {
                    Some(f) => f.end = Some(time),
                    None => return Err(StreamFailure::FrameEndMismatch),
                }
            }
        }
        self.model.observe_time(time);
        Ok(())
    }

    fn lock_entry(&mut self, id: u32, kind: LockKind) -> &mut LockMap {
        self.model.locks.entry(id).or_insert_with(|| LockMap {
            src_loc: SrcLocRef::Known(0),
            kind,
            announce: None,
            terminate: None,
            valid: false,
            is_contended: false,
            timeline: Vec::new(),
            thread_list: Vec::new(),
        })
    }

    /// Wait events may precede the announce; they create an invalid
    /// placeholder filled in when the announce arrives.
    fn lock_event_lenient(
        &mut self,
        id: u32,
        thread: u64,
        time: i64,
        kind: LockKind,
        event: LockEventKind,
    ) {
        let t = self.notice_thread(thread);
        self.lock_entry(id, kind);
        self.insert_lock_event(id, t, time, event);
    }

    fn lock_event(
        &mut self,
        id: u32,
        thread: u64,
        time: i64,
        event: LockEventKind,
    ) -> Result<(), StreamFailure> {
        if !self.model.locks.contains_key(&id) {
            return Err(StreamFailure::UnknownLock { id });
        }
        let t = self.notice_thread(thread);
        self.insert_lock_event(id, t, time, event);
        Ok(())
    }

    fn insert_lock_event(&mut self, id: u32, thread: u16, time: i64, kind: LockEventKind) {
        self.model.observe_time(time);
        let lock = self.model.locks.get_mut(&id).unwrap();
        let event = LockEvent {
            time,
            thread,
            kind,
            src_loc: None,
            lock_count: 0,
            locking_thread: 0,
            wait_list: 0,
            wait_shared: 0,
            shared_list: 0,
        };
        // Sorted insertion; late events land before the tail.
        let mut pos = lock.timeline.len();
        while pos > 0 && lock.timeline[pos - 1].time > time {
            pos -= 1;
        }
        lock.timeline.insert(pos, event);
        update_lock_state(lock, pos);
    }

    fn lock_mark(&mut self, id: u32, thread: u64, src_loc: u64) -> Result<(), StreamFailure> {
        let loc = self.known_src_loc(src_loc);
        let t = self.notice_thread(thread);
        let lock = self
            .model
            .locks
            .get_mut(&id)
            .ok_or(StreamFailure::UnknownLock { id })?;
        // Attaches to this thread's most recent wait or obtain.
        for event in lock.timeline.iter_mut().rev() {
            if event.thread == t
                && matches!(
                    event.kind,
                    LockEventKind::Wait
                        | LockEventKind::WaitShared
                        | LockEventKind::Obtain
                        | LockEventKind::ObtainShared
                )
            {
                event.src_loc = Some(loc);
                break;
            }
        }
        Ok(())
    }

    fn plot_data(&mut self, name: u64, time: i64, value: f64) {
        let q = self.model.strings.need_plot_name(name);
        self.query(q);
        self.model.observe_time(time);
        let idx = self.model.plot(name);
        let series = &mut self.model.plots[idx as usize];
        series.min = series.min.min(value);
        series.max = series.max.max(value);
        let item = PlotItem { time, value };
        if series.data.last().map_or(true, |last| last.time <= time) {
            series.data.push(item);
        } else {
            series.postponed.push(item);
            self.postpone_stamp = Some(Instant::now());
        }
    }

    /// Merges postponed plot samples back into the series once the
    /// debounce window has passed, or immediately when forced.
    pub fn flush_postponed(&mut self, force: bool) {
        let due = match self.postpone_stamp {
            None => return,
            Some(stamp) => force || stamp.elapsed() >= PLOT_MERGE_DEBOUNCE,
        };
        if !due {
            return;
        }
        self.postpone_stamp = None;
        for series in &mut self.model.plots {
            if series.postponed.is_empty() {
                continue;
            }
            series.data.append(&mut series.postponed);
            series.data.sort_by_key(|item| item.time);
        }
    }

    fn message(&mut self, thread: u64, time: i64, text: u64, color: u32) {
        let t = self.notice_thread(thread);
        self.model.observe_time(time);
        self.model.insert_message(MessageData {
            time,
            text: Self::string_ref(text),
            color,
            thread: t,
        });
    }

    fn gpu_zone_begin(
        &mut self,
        context: u8,
        thread: u64,
        cpu_time: i64,
        src_loc: SrcLocRef,
        query_id: u16,
        expects_callstack: bool,
    ) -> Result<(), StreamFailure> {
        let t = self.notice_thread(thread);
        {
            let ctx = self
                .model
                .gpu_contexts
                .get(&context)
                .ok_or(StreamFailure::UnknownGpuContext { context })?;
            let slot = ctx
                .query_slots
                .get(query_id as usize)
                .ok_or(StreamFailure::GpuQuerySlot { context, query_id })?;
            if slot.is_some() {
                return Err(StreamFailure::GpuQuerySlot { context, query_id });
            }
        }
        self.model.observe_time(cpu_time);
        let zone = self.model.new_gpu_zone(GpuZone {
            cpu_start: cpu_time,
            cpu_end: None,
            gpu_start: None,
            gpu_end: None,
            src_loc,
            callstack: None,
            thread: t,
            children: None,
        });
        let parent = {
            let ctx = self.model.gpu_contexts.get_mut(&context).unwrap();
            let parent = ctx.stack.last().copied();
            ctx.stack.push(zone);
            if parent.is_none() {
                ctx.timeline.push(zone);
            }
            ctx.query_slots[query_id as usize] = Some(GpuSlot {
                zone,
                target: GpuSlotTarget::Start,
            });
            parent
        };
        if let Some(parent) = parent {
            self.model.add_gpu_child(parent, zone);
        }
        if expects_callstack {
            self.awaiting_callstack.insert(t, AwaitCallstack::Gpu(zone));
        }
        Ok(())
    }

    fn gpu_zone_end(
        &mut self,
        context: u8,
        cpu_time: i64,
        query_id: u16,
    ) -> Result<(), StreamFailure> {
        self.model.observe_time(cpu_time);
        let ctx = self
            .model
            .gpu_contexts
            .get_mut(&context)
            .ok_or(StreamFailure::UnknownGpuContext { context })?;
        let zone = ctx
            .stack
            .pop()
            .ok_or(StreamFailure::GpuZoneEndMismatch { context })?;
        let slot = ctx
            .query_slots
            .get_mut(query_id as usize)
            .ok_or(StreamFailure::GpuQuerySlot { context, query_id })?;
        if slot.is_some() {
            return Err(StreamFailure::GpuQuerySlot { context, query_id });
        }
        *slot = Some(GpuSlot {
            zone,
            target: GpuSlotTarget::End,
        });
        self.model.gpu_zones[zone.0 as usize].cpu_end = Some(cpu_time);
        Ok(())
    }

    fn gpu_time(&mut self, context: u8, query_id: u16, gpu_time: i64) -> Result<(), StreamFailure> {
        let ctx = self
            .model
            .gpu_contexts
            .get_mut(&context)
            .ok_or(StreamFailure::UnknownGpuContext { context })?;
        let slot = ctx
            .query_slots
            .get_mut(query_id as usize)
            .ok_or(StreamFailure::GpuQuerySlot { context, query_id })?
            .take()
            .ok_or(StreamFailure::GpuQuerySlot { context, query_id })?;
        let rebased = ctx.rebase(gpu_time);
        let zone = &mut self.model.gpu_zones[slot.zone.0 as usize];
        match slot.target {
            GpuSlotTarget::Start => zone.gpu_start = Some(rebased),
            GpuSlotTarget::End => {
                zone.gpu_end = Some(rebased);
                // Some drivers deliver reversed timestamps.
                if let (Some(start), Some(end)) = (zone.gpu_start, zone.gpu_end) {
                    if end < start {
                        zone.gpu_start = Some(end);
                        zone.gpu_end = Some(start);
                    }
                }
            }
        }
        self.model.observe_time(rebased);
        Ok(())
    }

    fn mem_alloc(
        &mut self,
        thread: u64,
        time: i64,
        ptr: u64,
        size: u64,
        with_callstack: bool,
    ) -> Result<(), StreamFailure> {
        let t = self.notice_thread(thread);
        if self.model.memory.active.contains_key(&ptr) {
            return Err(StreamFailure::DoubleAlloc { ptr });
        }
        let callstack = if with_callstack {
            Some(
                self.pending_memory_callstack
                    .take()
                    .ok_or(StreamFailure::CallstackDesync)?,
            )
        } else {
            None
        };
        self.model.observe_time(time);
        let mem = &mut self.model.memory;
        let idx = mem.events.len() as u32;
        mem.events.push(MemEvent {
            ptr,
            size,
            alloc_time: time,
            alloc_thread: t,
            free_time: None,
            free_thread: None,
            callstack_alloc: callstack,
            callstack_free: None,
        });
        mem.active.insert(ptr, idx);
        mem.usage += size;
        mem.low = mem.low.min(ptr);
        mem.high = mem.high.max(ptr + size);
        Ok(())
    }

    fn mem_free(
        &mut self,
        thread: u64,
        time: i64,
        ptr: u64,
        with_callstack: bool,
    ) -> Result<(), StreamFailure> {
        let t = self.notice_thread(thread);
        let callstack = if with_callstack {
            Some(
                self.pending_memory_callstack
                    .take()
                    .ok_or(StreamFailure::CallstackDesync)?,
            )
        } else {
            None
        };
        let mem = &mut self.model.memory;
        let Some(idx) = mem.active.remove(&ptr) else {
            return match self.policy {
                MemFreePolicy::Tolerate => Ok(()),
                MemFreePolicy::Fail => Err(StreamFailure::FreeWithoutAlloc { thread, ptr }),
            };
        };
        self.model.observe_time(time);
        let mem = &mut self.model.memory;
        let event = &mut mem.events[idx as usize];
        event.free_time = Some(time);
        event.free_thread = Some(t);
        event.callstack_free = callstack;
        mem.usage = mem.usage.saturating_sub(event.size);
        mem.frees.push(idx);
        Ok(())
    }

    fn attach_callstack(&mut self, thread: u64, ptr: u64) -> Result<(), StreamFailure> {
        let t = self
            .model
            .find_thread(thread)
            .ok_or(StreamFailure::CallstackDesync)?;
        let id = self
            .model
            .strings
            .callstack_for_ptr(ptr)
            .ok_or(StreamFailure::CallstackDesync)?;
        match self.awaiting_callstack.remove(&t) {
            Some(AwaitCallstack::Zone(zone)) => {
                self.model.zones[zone.0 as usize].callstack = Some(id);
            }
            Some(AwaitCallstack::Gpu(zone)) => {
                self.model.gpu_zones[zone.0 as usize].callstack = Some(id);
            }
            Some(AwaitCallstack::Crash) => {
                if let Some(crash) = &mut self.model.crash {
                    crash.callstack = Some(id);
                }
            }
            None => return Err(StreamFailure::CallstackDesync),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum FrameMarkKind {
    Continuous,
    Start,
    End,
}

/// Recomputes the derived lock state from `from` to the end of the
/// timeline. Only the tail past an insertion point ever changes.
pub(crate) fn update_lock_state(lock: &mut LockMap, from: usize) {
    let (mut count, mut locking, mut wait, mut wait_shared, mut shared) = if from == 0 {
        (0u8, 0u16, 0u64, 0u64, 0u64)
    } else {
        let p = &lock.timeline[from - 1];
        (p.lock_count, p.locking_thread, p.wait_list, p.wait_shared, p.shared_list)
    };
    let mut contended = false;
    for i in from..lock.timeline.len() {
        let thread = lock.timeline[i].thread;
        let kind = lock.timeline[i].kind;
        let bit = lock.thread_bit(thread).map_or(0, |b| 1u64 << b);
        match kind {
            LockEventKind::Wait => wait |= bit,
            LockEventKind::Obtain => {
                wait &= !bit;
                debug_assert!(count < u8::MAX);
                count = count.saturating_add(1);
                locking = thread;
            }
            LockEventKind::Release => {
                debug_assert!(count > 0);
                count = count.saturating_sub(1);
            }
            LockEventKind::WaitShared => wait_shared |= bit,
            LockEventKind::ObtainShared => {
                wait_shared &= !bit;
                shared |= bit;
            }
            LockEventKind::ReleaseShared => shared &= !bit,
        }
        let event = &mut lock.timeline[i];
        event.lock_count = count;
        event.locking_thread = locking;
        event.wait_list = wait;
        event.wait_shared = wait_shared;
        event.shared_list = shared;
        if (count > 0 || shared != 0) && (wait != 0 || wait_shared != 0) {
            contended = true;
        }
    }
    if contended {
        lock.is_contended = true;
    }
}
