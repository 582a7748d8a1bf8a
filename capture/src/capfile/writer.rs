use std::io::Write;

use crate::error::Result;
use crate::interner::{CallstackId, SrcLocRef, StringRef};
use crate::model::{GpuZoneRef, PlotItem, TraceModel, ZoneRef};

use super::format::{
    write_header, write_varint, Version, WriteLeExt, CURRENT, V0_1_5, V0_2_0,
};

/// Serializes a quiescent model in the current format.
pub fn write_capture<W: Write>(model: &TraceModel, w: &mut W) -> Result<()> {
    write_capture_versioned(model, w, CURRENT)
}

/// Historical formats are writable for compatibility tests only; real
/// captures always use the current version.
pub(crate) fn write_capture_versioned<W: Write>(
    model: &TraceModel,
    w: &mut W,
    version: Version,
) -> Result<()> {
    write_header(w, version)?;
    let mut s = Serializer { w, version };
    s.scalars(model)?;
    s.crash(model)?;
    s.frame_sets(model)?;
    s.strings(model)?;
    s.threads(model)?;
    s.source_locations(model)?;
    s.locks(model)?;
    s.messages(model)?;
    s.zone_timelines(model)?;
    s.gpu(model)?;
    s.plots(model)?;
    s.memory(model)?;
    s.callstacks(model)?;
    Ok(())
}

/// Running time reference for one stream.
struct TimeRef(i64);

impl TimeRef {
    fn new() -> Self {
        TimeRef(0)
    }
}

struct Serializer<'a, W: Write> {
    w: &'a mut W,
    version: Version,
}

impl<W: Write> Serializer<'_, W> {
    fn time(&mut self, r: &mut TimeRef, t: i64) -> Result<()> {
        if self.version >= V0_2_0 {
            write_varint(self.w, t - r.0)?;
            r.0 = t;
        } else if self.version >= V0_1_5 {
            self.w.write_i64_le(t - r.0)?;
            r.0 = t;
        } else {
            self.w.write_i64_le(t)?;
        }
        Ok(())
    }

    fn opt_time(&mut self, r: &mut TimeRef, t: Option<i64>) -> Result<()> {
        match t {
            Some(t) => {
                self.w.write_u8_le(1)?;
                self.time(r, t)
            }
            None => Ok(self.w.write_u8_le(0)?),
        }
    }

    fn string_ref(&mut self, s: StringRef) -> Result<()> {
        match s {
            StringRef::None => self.w.write_u8_le(0)?,
            StringRef::Ptr(token) => {
                self.w.write_u8_le(1)?;
                self.w.write_u64_le(token)?;
            }
            StringRef::Idx(idx) => {
                self.w.write_u8_le(2)?;
                self.w.write_u32_le(idx.0)?;
            }
        }
        Ok(())
    }

    fn src_loc_ref(&mut self, s: SrcLocRef) -> Result<()> {
        match s {
            SrcLocRef::Known(idx) => {
                self.w.write_u8_le(0)?;
                self.w.write_u32_le(idx)?;
            }
            SrcLocRef::Payload(idx) => {
                self.w.write_u8_le(1)?;
                self.w.write_u32_le(idx)?;
            }
        }
        Ok(())
    }

    fn opt_callstack(&mut self, c: Option<CallstackId>) -> Result<()> {
        match c {
            Some(id) => {
                self.w.write_u8_le(1)?;
                self.w.write_u32_le(id.0)?;
            }
            None => self.w.write_u8_le(0)?,
        }
        Ok(())
    }

    fn scalars(&mut self, model: &TraceModel) -> Result<()> {
        self.w.write_f64_le(model.timer_mul)?;
        self.w.write_i64_le(model.last_time)?;
        self.w.write_u64_le(model.epoch)?;
        self.w.write_u8_le(model.on_demand as u8)?;
        if self.version >= V0_1_5 {
            self.w.write_u64_le(model.frame_offset)?;
        }
        self.w.write_str_le(&model.capture_name)?;
        self.w.write_str_le(&model.program_name)?;
        self.w.write_str_le(&model.host_info)?;
        Ok(())
    }

    fn crash(&mut self, model: &TraceModel) -> Result<()> {
        match &model.crash {
            Some(c) => {
                self.w.write_u8_le(1)?;
                self.w.write_u16_le(c.thread)?;
                self.w.write_i64_le(c.time)?;
                self.string_ref(c.message)?;
                self.opt_callstack(c.callstack)?;
            }
            None => self.w.write_u8_le(0)?,
        }
        Ok(())
    }

    fn frame_sets(&mut self, model: &TraceModel) -> Result<()> {
        self.w.write_u32_le(model.frame_sets.len() as u32)?;
        for set in &model.frame_sets {
            self.w.write_u64_le(set.name)?;
            self.w.write_u8_le(set.continuous as u8)?;
            self.w.write_u32_le(set.frames.len() as u32)?;
            for frame in &set.frames {
                self.w.write_i64_le(frame.start)?;
                match frame.end {
                    Some(end) => {
                        self.w.write_u8_le(1)?;
                        self.w.write_i64_le(end)?;
                    }
                    None => self.w.write_u8_le(0)?,
                }
            }
        }
        Ok(())
    }

    fn strings(&mut self, model: &TraceModel) -> Result<()> {
        let table = model.strings.table();
        self.w.write_u32_le(table.len() as u32)?;
        for s in table {
            self.w.write_str_le(s)?;
        }
        let mut tokens: Vec<_> = model.strings.string_tokens().collect();
        tokens.sort_by_key(|&(t, _)| t);
        self.w.write_u32_le(tokens.len() as u32)?;
        for (token, idx) in tokens {
            self.w.write_u64_le(token)?;
            self.w.write_u32_le(idx.0)?;
        }
        Ok(())
    }

    fn threads(&mut self, model: &TraceModel) -> Result<()> {
        self.w.write_u32_le(model.threads.len() as u32)?;
        for thread in &model.threads {
            self.w.write_u64_le(thread.id)?;
            self.string_ref(thread.name)?;
        }
        Ok(())
    }

    fn source_locations(&mut self, model: &TraceModel) -> Result<()> {
        let expand = model.strings.src_loc_expand();
        let known = model.strings.known_src_locs();
        self.w.write_u32_le(known.len() as u32)?;
        for (token, loc) in expand.iter().zip(known) {
            self.w.write_u64_le(*token)?;
            self.string_ref(loc.name)?;
            self.string_ref(loc.function)?;
            self.string_ref(loc.file)?;
            self.w.write_u32_le(loc.line)?;
            self.w.write_u32_le(loc.color)?;
        }
        let payload = model.strings.payload_src_locs();
        self.w.write_u32_le(payload.len() as u32)?;
        for loc in payload {
            self.string_ref(loc.name)?;
            self.string_ref(loc.function)?;
            self.string_ref(loc.file)?;
            self.w.write_u32_le(loc.line)?;
            self.w.write_u32_le(loc.color)?;
        }
        Ok(())
    }

    fn locks(&mut self, model: &TraceModel) -> Result<()> {
        let mut ids: Vec<_> = model.locks.keys().copied().collect();
        ids.sort_unstable();
        self.w.write_u32_le(ids.len() as u32)?;
        for id in ids {
            let lock = &model.locks[&id];
            self.w.write_u32_le(id)?;
            self.src_loc_ref(lock.src_loc)?;
            self.w.write_u8_le(match lock.kind {
                protocol::LockKind::Exclusive => 0,
                protocol::LockKind::Shared => 1,
            })?;
            self.opt_abs_time(lock.announce)?;
            self.opt_abs_time(lock.terminate)?;
            self.w.write_u8_le(lock.valid as u8)?;
            self.w.write_u32_le(lock.thread_list.len() as u32)?;
            for &t in &lock.thread_list {
                self.w.write_u16_le(t)?;
            }
            // The lock stream's reference starts at the announce time.
            let mut r = TimeRef(lock.announce.unwrap_or(0));
            self.w.write_u32_le(lock.timeline.len() as u32)?;
            for event in &lock.timeline {
                self.time(&mut r, event.time)?;
                self.w.write_u16_le(event.thread)?;
                self.w.write_u8_le(event.kind as u8)?;
                match event.src_loc {
                    Some(loc) => {
                        self.w.write_u8_le(1)?;
                        self.src_loc_ref(loc)?;
                    }
                    None => self.w.write_u8_le(0)?,
                }
            }
        }
        Ok(())
    }

    fn opt_abs_time(&mut self, t: Option<i64>) -> Result<()> {
        match t {
            Some(t) => {
                self.w.write_u8_le(1)?;
                self.w.write_i64_le(t)?;
            }
            None => self.w.write_u8_le(0)?,
        }
        Ok(())
    }

    fn messages(&mut self, model: &TraceModel) -> Result<()> {
        let mut r = TimeRef::new();
        self.w.write_u32_le(model.message_order.len() as u32)?;
        for &idx in &model.message_order {
            let msg = &model.messages[idx as usize];
            self.time(&mut r, msg.time)?;
            self.w.write_u16_le(msg.thread)?;
            self.string_ref(msg.text)?;
            if self.version >= V0_1_5 {
                self.w.write_u32_le(msg.color)?;
            }
        }
        Ok(())
    }

    fn zone_timelines(&mut self, model: &TraceModel) -> Result<()> {
        for thread in &model.threads {
            let mut r = TimeRef::new();
            self.w.write_u32_le(thread.timeline.len() as u32)?;
            for &zone in &thread.timeline {
                self.zone(model, zone, &mut r)?;
            }
        }
        Ok(())
    }

    fn zone(&mut self, model: &TraceModel, zone: ZoneRef, r: &mut TimeRef) -> Result<()> {
        let z = &model.zones[zone.0 as usize];
        self.time(r, z.start)?;
        self.opt_time(r, z.end)?;
        if self.version >= V0_2_0 {
            self.w.write_i16_le(z.cpu_start)?;
            self.w.write_i16_le(z.cpu_end)?;
        }
        self.src_loc_ref(z.src_loc)?;
        self.string_ref(z.text)?;
        if self.version >= V0_1_5 {
            self.string_ref(z.name)?;
        }
        self.opt_callstack(z.callstack)?;
        let children = model.zone_children(zone);
        self.w.write_u32_le(children.len() as u32)?;
        for &child in children {
            self.zone(model, child, r)?;
        }
        Ok(())
    }

    fn gpu(&mut self, model: &TraceModel) -> Result<()> {
        let mut ids: Vec<_> = model.gpu_contexts.keys().copied().collect();
        ids.sort_unstable();
        self.w.write_u32_le(ids.len() as u32)?;
        for id in ids {
            let ctx = &model.gpu_contexts[&id];
            self.w.write_u8_le(id)?;
            self.w.write_u16_le(ctx.thread)?;
            self.w.write_f32_le(ctx.period)?;
            self.w.write_i64_le(ctx.time_diff)?;
            let mut cpu = TimeRef::new();
            let mut gpu = TimeRef::new();
            self.w.write_u32_le(ctx.timeline.len() as u32)?;
            for &zone in &ctx.timeline {
                self.gpu_zone(model, zone, &mut cpu, &mut gpu)?;
            }
        }
        Ok(())
    }

    fn gpu_zone(
        &mut self,
        model: &TraceModel,
        zone: GpuZoneRef,
        cpu: &mut TimeRef,
        gpu: &mut TimeRef,
    ) -> Result<()> {
        let z = &model.gpu_zones[zone.0 as usize];
        self.time(cpu, z.cpu_start)?;
        self.opt_time(cpu, z.cpu_end)?;
        self.opt_time(gpu, z.gpu_start)?;
        self.opt_time(gpu, z.gpu_end)?;
        self.src_loc_ref(z.src_loc)?;
        self.w.write_u16_le(z.thread)?;
        self.opt_callstack(z.callstack)?;
        let children = model.gpu_zone_children(zone);
        self.w.write_u32_le(children.len() as u32)?;
        for &child in children {
            self.gpu_zone(model, child, cpu, gpu)?;
        }
        Ok(())
    }

    fn plots(&mut self, model: &TraceModel) -> Result<()> {
        self.w.write_u32_le(model.plots.len() as u32)?;
        for plot in &model.plots {
            self.w.write_u64_le(plot.name)?;
            self.w.write_f64_le(plot.min)?;
            self.w.write_f64_le(plot.max)?;
            // A partial capture may still hold out-of-order samples in the
            // postponed buffer; fold them in so nothing is lost.
            let mut merged: Vec<PlotItem>;
            let data: &[PlotItem] = if plot.postponed.is_empty() {
                &plot.data
            } else {
                merged = plot.data.clone();
                merged.extend_from_slice(&plot.postponed);
                merged.sort_by_key(|item| item.time);
                &merged
            };
            let mut r = TimeRef::new();
            self.w.write_u32_le(data.len() as u32)?;
            for item in data {
                self.time(&mut r, item.time)?;
                self.w.write_f64_le(item.value)?;
            }
        }
        Ok(())
    }

    fn memory(&mut self, model: &TraceModel) -> Result<()> {
        let mem = &model.memory;
        let mut r = TimeRef::new();
        self.w.write_u32_le(mem.events.len() as u32)?;
        for event in &mem.events {
            self.w.write_u64_le(event.ptr)?;
            self.w.write_u64_le(event.size)?;
            self.time(&mut r, event.alloc_time)?;
            self.w.write_u16_le(event.alloc_thread)?;
            // Free time as offset from the allocation, -1 for still live.
            let offset = event.free_time.map_or(-1, |t| t - event.alloc_time);
            if self.version >= V0_2_0 {
                write_varint(self.w, offset)?;
            } else {
                self.w.write_i64_le(offset)?;
            }
            if event.free_time.is_some() {
                self.w.write_u16_le(event.free_thread.unwrap_or(0))?;
            }
            self.opt_callstack(event.callstack_alloc)?;
            self.opt_callstack(event.callstack_free)?;
        }
        Ok(())
    }

    fn callstacks(&mut self, model: &TraceModel) -> Result<()> {
        let stacks = model.strings.callstacks();
        self.w.write_u32_le(stacks.len() as u32)?;
        for frames in stacks {
            self.w.write_u32_le(frames.len() as u32)?;
            for &frame in frames {
                self.w.write_u64_le(frame)?;
            }
        }
        let mut symbols: Vec<_> = model.strings.frame_tokens().collect();
        symbols.sort_by_key(|&(t, _)| t);
        self.w.write_u32_le(symbols.len() as u32)?;
        for (token, data) in symbols {
            self.w.write_u64_le(token)?;
            self.w.write_u32_le(data.len() as u32)?;
            for frame in data {
                self.w.write_u32_le(frame.name.0)?;
                self.w.write_u32_le(frame.file.0)?;
                self.w.write_u32_le(frame.line)?;
            }
        }
        Ok(())
    }
}
