use std::io::Read;

use protocol::LockKind;

use crate::dispatch::update_lock_state;
use crate::error::{CaptureError, Result};
use crate::interner::{CallstackId, FrameData, SourceLocation, SrcLocRef, StringIdx, StringRef};
use crate::model::{
    CrashEvent, FrameEvent, GpuContext, GpuZone, GpuZoneRef, LockEvent, LockEventKind, LockMap,
    MemEvent, MessageData, PlotItem, TraceModel, Zone, ZoneRef,
};

use super::format::{read_header, read_varint, ReadLeExt, V0_1_0, V0_1_5, V0_2_0};

/// Per-version decoding rules. One impl per readable format; every version
/// converges on the same section loader below.
trait CaptureReader {
    /// Decodes one timestamp against the stream's running reference.
    fn time(&self, r: &mut dyn Read, reference: &mut i64) -> Result<i64>;
    /// Decodes a plain signed scalar (the memory free offset).
    fn scalar(&self, r: &mut dyn Read) -> Result<i64>;
    fn zone_names(&self) -> bool;
    fn zone_cpu(&self) -> bool;
    fn message_color(&self) -> bool;
    fn frame_offset(&self) -> bool;
}

/// Counts come straight from the file, so preallocation is capped; a
/// corrupt count fails on read, not on a giant upfront allocation.
const PREALLOC_LIMIT: usize = 4096;

struct ReaderV010;
struct ReaderV015;
struct ReaderV020;

impl CaptureReader for ReaderV010 {
    fn time(&self, r: &mut dyn Read, _reference: &mut i64) -> Result<i64> {
        r.read_i64_le()
    }
    fn scalar(&self, r: &mut dyn Read) -> Result<i64> {
        r.read_i64_le()
    }
    fn zone_names(&self) -> bool {
        false
    }
    fn zone_cpu(&self) -> bool {
        false
    }
    fn message_color(&self) -> bool {
        false
    }
    fn frame_offset(&self) -> bool {
        false
    }
}

impl CaptureReader for ReaderV015 {
    fn time(&self, r: &mut dyn Read, reference: &mut i64) -> Result<i64> {
        let t = *reference + r.read_i64_le()?;
        *reference = t;
        Ok(t)
    }
    fn scalar(&self, r: &mut dyn Read) -> Result<i64> {
        r.read_i64_le()
    }
    fn zone_names(&self) -> bool {
        true
    }
    fn zone_cpu(&self) -> bool {
        false
    }
    fn message_color(&self) -> bool {
        true
    }
    fn frame_offset(&self) -> bool {
        true
    }
}

impl CaptureReader for ReaderV020 {
    fn time(&self, r: &mut dyn Read, reference: &mut i64) -> Result<i64> {
        let t = *reference + read_varint(r)?;
        *reference = t;
        Ok(t)
    }
    fn scalar(&self, r: &mut dyn Read) -> Result<i64> {
        read_varint(r)
    }
    fn zone_names(&self) -> bool {
        true
    }
    fn zone_cpu(&self) -> bool {
        true
    }
    fn message_color(&self) -> bool {
        true
    }
    fn frame_offset(&self) -> bool {
        true
    }
}

/// Loads a capture file. The version check happens before any model is
/// built, so a rejected file leaves no partial state.
pub fn load_capture<R: Read>(r: &mut R) -> Result<TraceModel> {
    let version = read_header(r)?;
    let fmt: &dyn CaptureReader = match version {
        V0_1_0 => &ReaderV010,
        V0_1_5 => &ReaderV015,
        V0_2_0 => &ReaderV020,
        v => return Err(CaptureError::UnsupportedVersion(v.major, v.minor, v.patch)),
    };
    let mut d = Deserializer {
        r,
        fmt,
        model: TraceModel::new(),
        hwm: RefHighWater::default(),
    };
    d.scalars()?;
    d.crash()?;
    d.frame_sets()?;
    d.strings()?;
    d.threads()?;
    d.source_locations()?;
    d.locks()?;
    d.messages()?;
    d.zone_timelines()?;
    d.gpu()?;
    d.plots()?;
    d.memory()?;
    d.callstacks()?;
    d.validate()?;
    Ok(d.model)
}

/// Highest index seen per cross-reference kind. The referenced sections
/// are loaded after some of their users, so ranges are checked once at
/// the end of the load.
#[derive(Default)]
struct RefHighWater {
    string: Option<u32>,
    known_loc: Option<u32>,
    payload_loc: Option<u32>,
    callstack: Option<u32>,
}

impl RefHighWater {
    fn note(slot: &mut Option<u32>, v: u32) {
        *slot = Some(slot.map_or(v, |m| m.max(v)));
    }
}

struct Deserializer<'a, R: Read> {
    r: &'a mut R,
    fmt: &'a dyn CaptureReader,
    model: TraceModel,
    hwm: RefHighWater,
}

impl<R: Read> Deserializer<'_, R> {
    fn time(&mut self, reference: &mut i64) -> Result<i64> {
        self.fmt.time(&mut *self.r, reference)
    }

    fn opt_time(&mut self, reference: &mut i64) -> Result<Option<i64>> {
        match self.r.read_u8_le()? {
            0 => Ok(None),
            _ => Ok(Some(self.time(reference)?)),
        }
    }

    fn opt_abs_time(&mut self) -> Result<Option<i64>> {
        match self.r.read_u8_le()? {
            0 => Ok(None),
            _ => Ok(Some(self.r.read_i64_le()?)),
        }
    }

    fn string_ref(&mut self) -> Result<StringRef> {
        match self.r.read_u8_le()? {
            0 => Ok(StringRef::None),
            1 => Ok(StringRef::Ptr(self.r.read_u64_le()?)),
            2 => {
                let idx = self.r.read_u32_le()?;
                RefHighWater::note(&mut self.hwm.string, idx);
                Ok(StringRef::Idx(StringIdx(idx)))
            }
            _ => Err(CaptureError::Corrupt("bad string reference tag")),
        }
    }

    fn src_loc_ref(&mut self) -> Result<SrcLocRef> {
        match self.r.read_u8_le()? {
            0 => {
                let idx = self.r.read_u32_le()?;
                RefHighWater::note(&mut self.hwm.known_loc, idx);
                Ok(SrcLocRef::Known(idx))
            }
            1 => {
                let idx = self.r.read_u32_le()?;
                RefHighWater::note(&mut self.hwm.payload_loc, idx);
                Ok(SrcLocRef::Payload(idx))
            }
            _ => Err(CaptureError::Corrupt("bad source location tag")),
        }
    }

    fn opt_callstack(&mut self) -> Result<Option<CallstackId>> {
        match self.r.read_u8_le()? {
            0 => Ok(None),
            _ => {
                let id = self.r.read_u32_le()?;
                RefHighWater::note(&mut self.hwm.callstack, id);
                Ok(Some(CallstackId(id)))
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let strings = &self.model.strings;
        let in_range =
            |hwm: Option<u32>, len: usize| hwm.map_or(true, |m| (m as usize) < len);
        if !in_range(self.hwm.string, strings.table().len()) {
            return Err(CaptureError::Corrupt("string index out of range"));
        }
        if !in_range(self.hwm.known_loc, strings.known_src_locs().len())
            || !in_range(self.hwm.payload_loc, strings.payload_src_locs().len())
        {
            return Err(CaptureError::Corrupt("source location out of range"));
        }
        if !in_range(self.hwm.callstack, strings.callstacks().len()) {
            return Err(CaptureError::Corrupt("callstack id out of range"));
        }
        Ok(())
    }

    fn source_location(&mut self) -> Result<SourceLocation> {
        Ok(SourceLocation {
            name: self.string_ref()?,
            function: self.string_ref()?,
            file: self.string_ref()?,
            line: self.r.read_u32_le()?,
            color: self.r.read_u32_le()?,
        })
    }

    fn scalars(&mut self) -> Result<()> {
        self.model.timer_mul = self.r.read_f64_le()?;
        self.model.last_time = self.r.read_i64_le()?;
        self.model.epoch = self.r.read_u64_le()?;
        self.model.on_demand = self.r.read_u8_le()? != 0;
        if self.fmt.frame_offset() {
            self.model.frame_offset = self.r.read_u64_le()?;
        }
        self.model.capture_name = self.r.read_str_le()?;
        self.model.program_name = self.r.read_str_le()?;
        self.model.host_info = self.r.read_str_le()?;
        Ok(())
    }

    fn crash(&mut self) -> Result<()> {
        if self.r.read_u8_le()? != 0 {
            self.model.crash = Some(CrashEvent {
                thread: self.r.read_u16_le()?,
                time: self.r.read_i64_le()?,
                message: self.string_ref()?,
                callstack: self.opt_callstack()?,
            });
        }
        Ok(())
    }

    fn frame_sets(&mut self) -> Result<()> {
        let count = self.r.read_count_le()?;
        for _ in 0..count {
            let name = self.r.read_u64_le()?;
            let continuous = self.r.read_u8_le()? != 0;
            let set = self.model.frame_set(name, continuous);
            let frames = self.r.read_count_le()?;
            for _ in 0..frames {
                let start = self.r.read_i64_le()?;
                let end = self.opt_abs_time()?;
                self.model.frame_sets[set as usize]
                    .frames
                    .push(FrameEvent { start, end });
            }
        }
        Ok(())
    }

    fn strings(&mut self) -> Result<()> {
        let count = self.r.read_count_le()?;
        for i in 0..count {
            let s = self.r.read_str_le()?;
            let idx = self.model.strings.intern(&s);
            if idx.0 as usize != i {
                return Err(CaptureError::Corrupt("string table has duplicates"));
            }
        }
        let tokens = self.r.read_count_le()?;
        for _ in 0..tokens {
            let token = self.r.read_u64_le()?;
            let idx = self.r.read_u32_le()?;
            if idx as usize >= count {
                return Err(CaptureError::Corrupt("string token out of range"));
            }
            self.model.strings.load_string_token(token, StringIdx(idx));
        }
        Ok(())
    }

    fn threads(&mut self) -> Result<()> {
        let count = self.r.read_count_le()?;
        for _ in 0..count {
            let id = self.r.read_u64_le()?;
            let name = self.string_ref()?;
            let t = self.model.compress_thread(id);
            self.model.thread_mut(t).name = name;
        }
        Ok(())
    }

    fn source_locations(&mut self) -> Result<()> {
        let known = self.r.read_count_le()?;
        for _ in 0..known {
            let token = self.r.read_u64_le()?;
            let loc = self.source_location()?;
            self.model.strings.load_known_src_loc(token, loc);
        }
        let payload = self.r.read_count_le()?;
        for _ in 0..payload {
            let loc = self.source_location()?;
            self.model.strings.add_payload_src_loc(loc);
        }
        Ok(())
    }

    fn locks(&mut self) -> Result<()> {
        let count = self.r.read_count_le()?;
        for _ in 0..count {
            let id = self.r.read_u32_le()?;
            let src_loc = self.src_loc_ref()?;
            let kind = match self.r.read_u8_le()? {
                0 => LockKind::Exclusive,
                1 => LockKind::Shared,
                _ => return Err(CaptureError::Corrupt("bad lock kind")),
            };
            let announce = self.opt_abs_time()?;
            let terminate = self.opt_abs_time()?;
            let valid = self.r.read_u8_le()? != 0;
            let threads = self.r.read_count_le()?;
            let mut thread_list = Vec::with_capacity(threads.min(PREALLOC_LIMIT));
            for _ in 0..threads {
                thread_list.push(self.r.read_u16_le()?);
            }
            let mut reference = announce.unwrap_or(0);
            let events = self.r.read_count_le()?;
            let mut timeline = Vec::with_capacity(events.min(PREALLOC_LIMIT));
            for _ in 0..events {
                let time = self.time(&mut reference)?;
                let thread = self.r.read_u16_le()?;
                let kind = match self.r.read_u8_le()? {
                    0 => LockEventKind::Wait,
                    1 => LockEventKind::Obtain,
                    2 => LockEventKind::Release,
                    3 => LockEventKind::WaitShared,
                    4 => LockEventKind::ObtainShared,
                    5 => LockEventKind::ReleaseShared,
                    _ => return Err(CaptureError::Corrupt("bad lock event kind")),
                };
                let src_loc = match self.r.read_u8_le()? {
                    0 => None,
                    _ => Some(self.src_loc_ref()?),
                };
                timeline.push(LockEvent {
                    time,
                    thread,
                    kind,
                    src_loc,
                    lock_count: 0,
                    locking_thread: 0,
                    wait_list: 0,
                    wait_shared: 0,
                    shared_list: 0,
                });
            }
            let mut lock = LockMap {
                src_loc,
                kind,
                announce,
                terminate,
                valid,
                is_contended: false,
                timeline,
                thread_list,
            };
            // Derived state is not persisted; rebuild it in one pass.
            update_lock_state(&mut lock, 0);
            self.model.locks.insert(id, lock);
        }
        Ok(())
    }

    fn messages(&mut self) -> Result<()> {
        let count = self.r.read_count_le()?;
        let mut reference = 0i64;
        for _ in 0..count {
            let time = self.time(&mut reference)?;
            let thread = self.r.read_u16_le()?;
            let text = self.string_ref()?;
            let color = if self.fmt.message_color() {
                self.r.read_u32_le()?
            } else {
                0
            };
            if thread as usize >= self.model.threads.len() {
                return Err(CaptureError::Corrupt("message thread out of range"));
            }
            self.model.insert_message(MessageData { time, text, color, thread });
        }
        Ok(())
    }

    fn zone_timelines(&mut self) -> Result<()> {
        for t in 0..self.model.threads.len() {
            let mut reference = 0i64;
            let roots = self.r.read_count_le()?;
            for _ in 0..roots {
                let root = self.zone(&mut reference)?;
                self.model.threads[t].timeline.push(root);
            }
        }
        Ok(())
    }

    fn zone(&mut self, reference: &mut i64) -> Result<ZoneRef> {
        let start = self.time(reference)?;
        let end = self.opt_time(reference)?;
        let (cpu_start, cpu_end) = if self.fmt.zone_cpu() {
            (self.r.read_i16_le()?, self.r.read_i16_le()?)
        } else {
            (-1, -1)
        };
        let src_loc = self.src_loc_ref()?;
        let text = self.string_ref()?;
        let name = if self.fmt.zone_names() {
            self.string_ref()?
        } else {
            StringRef::None
        };
        let callstack = self.opt_callstack()?;
        let zone = self.model.new_zone(Zone {
            start,
            end,
            cpu_start,
            cpu_end,
            src_loc,
            text,
            name,
            callstack,
            children: None,
        });
        let children = self.r.read_count_le()?;
        for _ in 0..children {
            let child = self.zone(reference)?;
            self.model.add_zone_child(zone, child);
        }
        Ok(zone)
    }

    fn gpu(&mut self) -> Result<()> {
        let count = self.r.read_count_le()?;
        for _ in 0..count {
            let id = self.r.read_u8_le()?;
            let thread = self.r.read_u16_le()?;
            let period = self.r.read_f32_le()?;
            let time_diff = self.r.read_i64_le()?;
            self.model
                .gpu_contexts
                .insert(id, GpuContext::new(thread, period, time_diff));
            let mut cpu = 0i64;
            let mut gpu = 0i64;
            let roots = self.r.read_count_le()?;
            for _ in 0..roots {
                let root = self.gpu_zone(&mut cpu, &mut gpu)?;
                self.model
                    .gpu_contexts
                    .get_mut(&id)
                    .unwrap()
                    .timeline
                    .push(root);
            }
        }
        Ok(())
    }

    fn gpu_zone(&mut self, cpu: &mut i64, gpu: &mut i64) -> Result<GpuZoneRef> {
        let cpu_start = self.time(cpu)?;
        let cpu_end = self.opt_time(cpu)?;
        let gpu_start = self.opt_time(gpu)?;
        let gpu_end = self.opt_time(gpu)?;
        let src_loc = self.src_loc_ref()?;
        let thread = self.r.read_u16_le()?;
        let callstack = self.opt_callstack()?;
        let zone = self.model.new_gpu_zone(GpuZone {
            cpu_start,
            cpu_end,
            gpu_start,
            gpu_end,
            src_loc,
            callstack,
            thread,
            children: None,
        });
        let children = self.r.read_count_le()?;
        for _ in 0..children {
            let child = self.gpu_zone(cpu, gpu)?;
            self.model.add_gpu_child(zone, child);
        }
        Ok(zone)
    }

    fn plots(&mut self) -> Result<()> {
        let count = self.r.read_count_le()?;
        for _ in 0..count {
            let name = self.r.read_u64_le()?;
            let min = self.r.read_f64_le()?;
            let max = self.r.read_f64_le()?;
            let idx = self.model.plot(name);
            let series = &mut self.model.plots[idx as usize];
            series.min = min;
            series.max = max;
            let items = self.r.read_count_le()?;
            let mut reference = 0i64;
            for _ in 0..items {
                let time = self.time(&mut reference)?;
                let value = self.r.read_f64_le()?;
                self.model.plots[idx as usize]
                    .data
                    .push(PlotItem { time, value });
            }
        }
        Ok(())
    }

    fn memory(&mut self) -> Result<()> {
        let count = self.r.read_count_le()?;
        let mut reference = 0i64;
        for _ in 0..count {
            let ptr = self.r.read_u64_le()?;
            let size = self.r.read_u64_le()?;
            let alloc_time = self.time(&mut reference)?;
            let alloc_thread = self.r.read_u16_le()?;
            let offset = self.fmt.scalar(&mut *self.r)?;
            let (free_time, free_thread) = if offset < 0 {
                (None, None)
            } else {
                (Some(alloc_time + offset), Some(self.r.read_u16_le()?))
            };
            let callstack_alloc = self.opt_callstack()?;
            let callstack_free = self.opt_callstack()?;
            let mem = &mut self.model.memory;
            let idx = mem.events.len() as u32;
            mem.events.push(MemEvent {
                ptr,
                size,
                alloc_time,
                alloc_thread,
                free_time,
                free_thread,
                callstack_alloc,
                callstack_free,
            });
            if free_time.is_none() {
                mem.active.insert(ptr, idx);
                mem.usage += size;
            }
            mem.low = mem.low.min(ptr);
            mem.high = mem.high.max(ptr + size);
        }
        // Free order is time order.
        let mut frees: Vec<u32> = (0..self.model.memory.events.len() as u32)
            .filter(|&i| self.model.memory.events[i as usize].free_time.is_some())
            .collect();
        frees.sort_by_key(|&i| self.model.memory.events[i as usize].free_time);
        self.model.memory.frees = frees;
        Ok(())
    }

    fn callstacks(&mut self) -> Result<()> {
        let count = self.r.read_count_le()?;
        for _ in 0..count {
            let frames = self.r.read_count_le()?;
            let mut stack = Vec::with_capacity(frames.min(PREALLOC_LIMIT));
            for _ in 0..frames {
                stack.push(self.r.read_u64_le()?);
            }
            self.model.strings.load_callstack(stack);
        }
        let symbols = self.r.read_count_le()?;
        for _ in 0..symbols {
            let token = self.r.read_u64_le()?;
            let frames = self.r.read_count_le()?;
            let mut data = Vec::with_capacity(frames.min(PREALLOC_LIMIT));
            for _ in 0..frames {
                let name = self.r.read_u32_le()?;
                let file = self.r.read_u32_le()?;
                RefHighWater::note(&mut self.hwm.string, name);
                RefHighWater::note(&mut self.hwm.string, file);
                data.push(FrameData {
                    name: StringIdx(name),
                    file: StringIdx(file),
                    line: self.r.read_u32_le()?,
                });
            }
            self.model.strings.load_frame_symbols(token, data);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::format::MAGIC;
    use super::super::writer::{write_capture, write_capture_versioned};
    use super::*;
    use crate::dispatch::{Ingest, MemFreePolicy};
    use protocol::{AllocSite, Record, Welcome};

    /// A session touching every subsystem.
    fn rich_model() -> TraceModel {
        let mut ing = Ingest::new(MemFreePolicy::Fail);
        ing.apply_welcome(
            &Welcome {
                timer_mul: 1.5,
                init_begin: 0,
                init_end: 50,
                epoch: 1_700_000_000,
                on_demand: false,
                program_name: "game".into(),
                host_info: "linux".into(),
            },
            0,
        );
        let records = vec![
            Record::ZoneBegin { thread: 1, time: 100, src_loc: 0xa, cpu: 2 },
            Record::CustomStringData { ptr: 0x90, text: "level 3".into() },
            Record::ZoneText { thread: 1, text: 0x90 },
            Record::ZoneBegin { thread: 1, time: 110, src_loc: 0xb, cpu: 2 },
            Record::ZoneEnd { thread: 1, time: 140, cpu: 2 },
            Record::ZoneEnd { thread: 1, time: 200, cpu: 3 },
            Record::FrameMark { name: 0, time: 210 },
            Record::LockAnnounce { id: 1, time: 90, src_loc: 0xa, kind: protocol::LockKind::Exclusive },
            Record::LockObtain { id: 1, thread: 1, time: 120 },
            Record::LockWait { id: 1, thread: 2, time: 125, kind: protocol::LockKind::Exclusive },
            Record::LockRelease { id: 1, thread: 1, time: 130 },
            Record::LockObtain { id: 1, thread: 2, time: 131 },
            Record::LockRelease { id: 1, thread: 2, time: 135 },
            Record::MessageLiteralColor { thread: 1, time: 150, text: 0x40, color: 0xff00ff },
            Record::PlotData { name: 0x50, time: 100, value: 1.5 },
            Record::PlotData { name: 0x50, time: 200, value: 2.5 },
            Record::GpuNewContext { context: 0, thread: 1, cpu_time: 100, gpu_time: 0, period: 1.0 },
            Record::GpuZoneBegin { context: 0, thread: 1, cpu_time: 110, src_loc: 0xa, query_id: 0 },
            Record::GpuZoneEnd { context: 0, cpu_time: 120, query_id: 1 },
            Record::GpuTime { context: 0, query_id: 0, gpu_time: 12 },
            Record::GpuTime { context: 0, query_id: 1, gpu_time: 22 },
            Record::CallstackPayload { ptr: 0x60, frames: vec![500, 600] },
            Record::CallstackMemory { ptr: 0x60 },
            Record::MemAllocCallstack { thread: 1, time: 160, ptr: 0x1000, size: 64 },
            Record::MemFree { thread: 1, time: 170, ptr: 0x1000 },
            Record::MemAlloc { thread: 2, time: 180, ptr: 0x2000, size: 32 },
            Record::CallstackAllocPayload {
                ptr: 0x61,
                frames: vec![500],
                sites: vec![AllocSite { name: "Pool".into(), file: "pool.cpp".into(), line: 4 }],
            },
            // Resolutions.
            Record::SourceLocation { ptr: 0xa, name: 0, function: 0x20, file: 0x21, line: 10, color: 0 },
            Record::SourceLocation { ptr: 0xb, name: 0, function: 0x22, file: 0x21, line: 20, color: 0 },
            Record::StringData { ptr: 0x20, text: "update".into() },
            Record::StringData { ptr: 0x21, text: "scene.cpp".into() },
            Record::StringData { ptr: 0x22, text: "render".into() },
            Record::StringData { ptr: 0x40, text: "loaded".into() },
            Record::PlotName { name: 0x50, text: "fps".into() },
            Record::ThreadName { thread: 1, name: "main".into() },
            Record::ThreadName { thread: 2, name: "worker".into() },
            Record::CallstackFrameSize { ptr: 500, count: 1 },
            Record::CallstackFrame { name: "f".into(), file: "f.cpp".into(), line: 1 },
            Record::CallstackFrameSize { ptr: 600, count: 1 },
            Record::CallstackFrame { name: "g".into(), file: "g.cpp".into(), line: 2 },
        ];
        for r in records {
            ing.process(r).unwrap();
        }
        ing.flush_postponed(true);
        assert!(ing.quiescent());
        let mut model = ing.model;
        model.capture_name = "session one".into();
        model
    }

    fn zone_shape(model: &TraceModel, t: u16) -> Vec<(i64, Option<i64>, usize)> {
        fn walk(
            model: &TraceModel,
            zone: ZoneRef,
            depth: usize,
            out: &mut Vec<(i64, Option<i64>, usize)>,
        ) {
            let z = &model.zones[zone.0 as usize];
            out.push((z.start, z.end, depth));
            for &c in model.zone_children(zone) {
                walk(model, c, depth + 1, out);
            }
        }
        let mut out = Vec::new();
        for &root in &model.thread(t).timeline {
            walk(model, root, 0, &mut out);
        }
        out
    }

    #[test]
    fn current_version_roundtrip() {
        let model = rich_model();
        let mut buf = Vec::new();
        write_capture(&model, &mut buf).unwrap();
        let loaded = load_capture(&mut buf.as_slice()).unwrap();

        assert_eq!(loaded.timer_mul, model.timer_mul);
        assert_eq!(loaded.last_time, model.last_time);
        assert_eq!(loaded.epoch, model.epoch);
        assert_eq!(loaded.capture_name, "session one");
        assert_eq!(loaded.program_name, "game");

        assert_eq!(loaded.threads.len(), model.threads.len());
        for t in 0..model.threads.len() as u16 {
            assert_eq!(loaded.thread(t).id, model.thread(t).id);
            assert_eq!(
                loaded.strings.resolve(loaded.thread(t).name),
                model.strings.resolve(model.thread(t).name)
            );
            assert_eq!(zone_shape(&loaded, t), zone_shape(&model, t));
        }

        // Zone text survives through the literal-string map.
        let root = loaded.thread(0).timeline[0];
        assert_eq!(
            loaded.strings.resolve(loaded.zones[root.0 as usize].text),
            Some("level 3")
        );
        let rz = &loaded.zones[root.0 as usize];
        assert_eq!((rz.cpu_start, rz.cpu_end), (2, 3));

        let lock = &loaded.locks[&1];
        let orig = &model.locks[&1];
        assert!(lock.is_contended);
        assert_eq!(lock.announce, orig.announce);
        assert_eq!(
            lock.timeline.iter().map(|e| (e.time, e.lock_count)).collect::<Vec<_>>(),
            orig.timeline.iter().map(|e| (e.time, e.lock_count)).collect::<Vec<_>>()
        );

        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.messages[0].color, 0xff00ff);
        assert_eq!(
            loaded.strings.resolve(loaded.messages[0].text),
            Some("loaded")
        );

        assert_eq!(loaded.plots.len(), 1);
        assert_eq!(loaded.plots[0].data.len(), 2);
        assert_eq!(loaded.plots[0].max, 2.5);
        assert_eq!(loaded.strings.resolve(StringRef::Ptr(0x50)), Some("fps"));

        let gpu = &loaded.gpu_contexts[&0];
        assert_eq!(gpu.timeline.len(), 1);
        let gz = &loaded.gpu_zones[gpu.timeline[0].0 as usize];
        assert_eq!((gz.gpu_start, gz.gpu_end), (Some(112), Some(122)));

        assert_eq!(loaded.memory.events.len(), 2);
        assert_eq!(loaded.memory.usage, 32);
        assert_eq!(loaded.memory.frees, vec![0]);
        assert_eq!(loaded.memory.active.len(), 1);
        assert!(loaded.memory.events[0].callstack_alloc.is_some());

        assert_eq!(loaded.strings.callstacks().len(), model.strings.callstacks().len());
        let id = loaded.memory.events[0].callstack_alloc.unwrap();
        assert_eq!(loaded.strings.callstack(id), &[500, 600]);
        assert_eq!(loaded.strings.frame_data(500).unwrap().len(), 1);

        assert_eq!(loaded.frame_sets[0].frames.len(), model.frame_sets[0].frames.len());
        assert_eq!(loaded.crash.is_some(), model.crash.is_some());
    }

    #[test]
    fn historical_versions_load_into_the_same_shape() {
        let model = rich_model();
        for version in [V0_1_0, V0_1_5] {
            let mut buf = Vec::new();
            write_capture_versioned(&model, &mut buf, version).unwrap();
            let loaded = load_capture(&mut buf.as_slice()).unwrap();
            for t in 0..model.threads.len() as u16 {
                assert_eq!(zone_shape(&loaded, t), zone_shape(&model, t));
            }
            assert_eq!(loaded.memory.usage, model.memory.usage);
            assert_eq!(loaded.locks[&1].is_contended, model.locks[&1].is_contended);
        }
    }

    #[test]
    fn oldest_version_drops_color_and_names() {
        let model = rich_model();
        let mut buf = Vec::new();
        write_capture_versioned(&model, &mut buf, V0_1_0).unwrap();
        let loaded = load_capture(&mut buf.as_slice()).unwrap();
        assert_eq!(loaded.messages[0].color, 0);
        assert_eq!(loaded.frame_offset, 0);
        let root = loaded.thread(0).timeline[0];
        assert_eq!(loaded.zones[root.0 as usize].name, StringRef::None);
        assert_eq!(loaded.zones[root.0 as usize].cpu_start, -1);
    }

    #[test]
    fn partial_capture_keeps_postponed_plot_samples() {
        let mut ing = Ingest::new(MemFreePolicy::Fail);
        ing.apply_welcome(
            &Welcome {
                timer_mul: 1.0,
                init_begin: 0,
                init_end: 5,
                epoch: 0,
                on_demand: false,
                program_name: "game".into(),
                host_info: "linux".into(),
            },
            0,
        );
        for (time, value) in [(10, 1.0), (30, 3.0), (20, 2.0)] {
            ing.process(Record::PlotData { name: 0x50, time, value }).unwrap();
        }
        // The out-of-order sample is still sitting in the postponed buffer,
        // as it would be when a session ends without a terminate.
        assert!(!ing.model.plots[0].postponed.is_empty());

        let mut buf = Vec::new();
        write_capture(&ing.model, &mut buf).unwrap();
        let loaded = load_capture(&mut buf.as_slice()).unwrap();
        let samples: Vec<_> = loaded.plots[0]
            .data
            .iter()
            .map(|item| (item.time, item.value))
            .collect();
        assert_eq!(samples, vec![(10, 1.0), (20, 2.0), (30, 3.0)]);
    }

    fn single_zone_model(mutate: impl FnOnce(&mut Zone)) -> TraceModel {
        let mut model = TraceModel::new();
        model.strings.load_known_src_loc(
            0xa,
            SourceLocation {
                name: StringRef::None,
                function: StringRef::None,
                file: StringRef::None,
                line: 1,
                color: 0,
            },
        );
        let t = model.compress_thread(7);
        let zone = model.new_zone(Zone {
            start: 1,
            end: Some(2),
            cpu_start: -1,
            cpu_end: -1,
            src_loc: SrcLocRef::Known(0),
            text: StringRef::None,
            name: StringRef::None,
            callstack: None,
            children: None,
        });
        model.thread_mut(t).timeline.push(zone);
        mutate(&mut model.zones[zone.0 as usize]);
        model
    }

    #[test]
    fn dangling_cross_references_are_rejected() {
        let cases: [(fn(&mut Zone), &str); 3] = [
            (|z| z.callstack = Some(CallstackId(9)), "callstack"),
            (|z| z.text = StringRef::Idx(StringIdx(5)), "string"),
            (|z| z.src_loc = SrcLocRef::Known(3), "source location"),
        ];
        for (mutate, what) in cases {
            let model = single_zone_model(mutate);
            let mut buf = Vec::new();
            write_capture(&model, &mut buf).unwrap();
            let err = load_capture(&mut buf.as_slice()).unwrap_err();
            assert!(matches!(err, CaptureError::Corrupt(_)), "{what}: {err}");
        }
    }

    #[test]
    fn newer_version_is_rejected_before_loading() {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&[9, 0, 0]);
        buf.extend_from_slice(&[0u8; 64]);
        let err = load_capture(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, CaptureError::UnsupportedVersion(9, 0, 0)));
    }

    #[test]
    fn truncated_file_is_an_error() {
        let model = rich_model();
        let mut buf = Vec::new();
        write_capture(&model, &mut buf).unwrap();
        buf.truncate(buf.len() / 2);
        assert!(load_capture(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn statistics_match_across_save_and_load() {
        let model = rich_model();
        let mut buf = Vec::new();
        write_capture(&model, &mut buf).unwrap();
        let loaded = load_capture(&mut buf.as_slice()).unwrap();
        let a = crate::stats::build_statistics(&model);
        let b = crate::stats::build_statistics(&loaded);
        assert_eq!(a.by_src_loc.len(), b.by_src_loc.len());
        for (loc, stats) in &a.by_src_loc {
            let other = &b.by_src_loc[loc];
            assert_eq!(stats.count, other.count);
            assert_eq!(stats.total, other.total);
            assert_eq!(stats.self_total, other.self_total);
        }
    }
}
