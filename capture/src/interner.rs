use std::collections::{HashMap, HashSet};

use protocol::{AllocSite, Query, QueryKind};

/// Index into the content-addressed string table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StringIdx(pub u32);

/// A string field as stored on events: either an unresolved client-side
/// token or an interned index. Tokens resolve through the interner maps,
/// so resolution never rewrites events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringRef {
    None,
    Ptr(u64),
    Idx(StringIdx),
}

/// Reference to a source location: announced by the client and queried
/// (`Known`), or carried inline by the stream (`Payload`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SrcLocRef {
    Known(u32),
    Payload(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    pub name: StringRef,
    pub function: StringRef,
    pub file: StringRef,
    pub line: u32,
    pub color: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallstackId(pub u32);

/// One resolved symbol for a callstack frame address. Inlining expands a
/// single address into several frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameData {
    pub name: StringIdx,
    pub file: StringIdx,
    pub line: u32,
}

/// Content-addressed storage for strings, source locations, callstacks and
/// frame symbols, plus the pending-resolution bookkeeping that gates the
/// terminate drain.
#[derive(Debug)]
pub struct Interner {
    table: Vec<String>,
    lookup: HashMap<String, StringIdx>,

    strings: HashMap<u64, StringIdx>,
    pending_strings: HashSet<u64>,
    pending_thread_names: HashSet<u64>,

    src_loc_shrink: HashMap<u64, u32>,
    src_loc_expand: Vec<u64>,
    src_locs: Vec<SourceLocation>,
    pending_src_locs: HashSet<u64>,

    payload_src_locs: Vec<SourceLocation>,
    payload_lookup: HashMap<SourceLocation, u32>,

    pending_plot_names: HashSet<u64>,
    pending_frame_names: HashSet<u64>,

    callstacks: Vec<Vec<u64>>,
    callstack_lookup: HashMap<Vec<u64>, CallstackId>,
    callstack_by_ptr: HashMap<u64, CallstackId>,

    frames: HashMap<u64, Vec<FrameData>>,
    pending_frames: HashSet<u64>,
    synthetic_frames: HashMap<(StringIdx, StringIdx, u32), u64>,
    next_synthetic: u64,
}

impl Interner {
    pub fn new() -> Self {
        Interner {
            table: Vec::new(),
            lookup: HashMap::new(),
            strings: HashMap::new(),
            pending_strings: HashSet::new(),
            pending_thread_names: HashSet::new(),
            src_loc_shrink: HashMap::new(),
            src_loc_expand: Vec::new(),
            src_locs: Vec::new(),
            pending_src_locs: HashSet::new(),
            payload_src_locs: Vec::new(),
            payload_lookup: HashMap::new(),
            pending_plot_names: HashSet::new(),
            pending_frame_names: HashSet::new(),
            callstacks: Vec::new(),
            callstack_lookup: HashMap::new(),
            callstack_by_ptr: HashMap::new(),
            frames: HashMap::new(),
            pending_frames: HashSet::new(),
            synthetic_frames: HashMap::new(),
            // Synthetic ids grow downward, never colliding with client
            // frame addresses.
            next_synthetic: u64::MAX,
        }
    }

    pub fn intern(&mut self, s: &str) -> StringIdx {
        if let Some(&idx) = self.lookup.get(s) {
            return idx;
        }
        let idx = StringIdx(self.table.len() as u32);
        self.table.push(s.to_owned());
        self.lookup.insert(s.to_owned(), idx);
        idx
    }

    pub fn get(&self, idx: StringIdx) -> &str {
        &self.table[idx.0 as usize]
    }

    pub fn string_count(&self) -> usize {
        self.table.len()
    }

    pub fn table(&self) -> &[String] {
        &self.table
    }

    /// Resolves a string reference for display, if the interner has it.
    pub fn resolve(&self, r: StringRef) -> Option<&str> {
        match r {
            StringRef::None => None,
            StringRef::Idx(idx) => Some(self.get(idx)),
            StringRef::Ptr(token) => self.strings.get(&token).map(|&idx| self.get(idx)),
        }
    }

    // String tokens.

    /// Marks a literal-string token as referenced. Returns the query to
    /// emit on first sight.
    pub fn need_string(&mut self, token: u64) -> Option<Query> {
        if self.strings.contains_key(&token) || !self.pending_strings.insert(token) {
            return None;
        }
        Some(Query { kind: QueryKind::String, token })
    }

    pub fn resolve_string(&mut self, token: u64, text: &str) {
        let idx = self.intern(text);
        self.strings.insert(token, idx);
        self.pending_strings.remove(&token);
    }

    pub fn string_idx(&self, token: u64) -> Option<StringIdx> {
        self.strings.get(&token).copied()
    }

    pub fn string_tokens(&self) -> impl Iterator<Item = (u64, StringIdx)> + '_ {
        self.strings.iter().map(|(&t, &i)| (t, i))
    }

    /// Custom strings arrive unsolicited and are consumed by the next
    /// zone-text or zone-name record referencing the token.
    pub fn store_custom_string(&mut self, token: u64, text: &str) {
        let idx = self.intern(text);
        self.strings.insert(token, idx);
    }

    // Thread names.

    pub fn need_thread_name(&mut self, token: u64) -> Option<Query> {
        if !self.pending_thread_names.insert(token) {
            return None;
        }
        Some(Query { kind: QueryKind::ThreadName, token })
    }

    pub fn resolve_thread_name(&mut self, token: u64) {
        self.pending_thread_names.remove(&token);
    }

    // Known source locations: token shrunk to a dense index at first sight.

    pub fn shrink_src_loc(&mut self, token: u64) -> (u32, Option<Query>) {
        if let Some(&idx) = self.src_loc_shrink.get(&token) {
            return (idx, None);
        }
        let idx = self.src_loc_expand.len() as u32;
        self.src_loc_shrink.insert(token, idx);
        self.src_loc_expand.push(token);
        self.src_locs.push(SourceLocation {
            name: StringRef::None,
            function: StringRef::None,
            file: StringRef::None,
            line: 0,
            color: 0,
        });
        self.pending_src_locs.insert(token);
        (idx, Some(Query { kind: QueryKind::SourceLocation, token }))
    }

    pub fn resolve_src_loc(&mut self, token: u64, loc: SourceLocation) {
        if let Some(&idx) = self.src_loc_shrink.get(&token) {
            self.src_locs[idx as usize] = loc;
            self.pending_src_locs.remove(&token);
        }
    }

    pub fn known_src_loc(&self, idx: u32) -> &SourceLocation {
        &self.src_locs[idx as usize]
    }

    pub fn known_src_locs(&self) -> &[SourceLocation] {
        &self.src_locs
    }

    pub fn src_loc_expand(&self) -> &[u64] {
        &self.src_loc_expand
    }

    /// Inline source locations are content addressed; identical payloads
    /// collapse to one entry.
    pub fn add_payload_src_loc(&mut self, loc: SourceLocation) -> u32 {
        if let Some(&idx) = self.payload_lookup.get(&loc) {
            return idx;
        }
        let idx = self.payload_src_locs.len() as u32;
        self.payload_src_locs.push(loc);
        self.payload_lookup.insert(loc, idx);
        idx
    }

    pub fn payload_src_loc(&self, idx: u32) -> &SourceLocation {
        &self.payload_src_locs[idx as usize]
    }

    pub fn payload_src_locs(&self) -> &[SourceLocation] {
        &self.payload_src_locs
    }

    pub fn src_loc(&self, r: SrcLocRef) -> &SourceLocation {
        match r {
            SrcLocRef::Known(idx) => self.known_src_loc(idx),
            SrcLocRef::Payload(idx) => self.payload_src_loc(idx),
        }
    }

    // Plot and frame-set names.

    pub fn need_plot_name(&mut self, token: u64) -> Option<Query> {
        if !self.pending_plot_names.insert(token) {
            return None;
        }
        Some(Query { kind: QueryKind::PlotName, token })
    }

    pub fn resolve_plot_name(&mut self, token: u64) {
        self.pending_plot_names.remove(&token);
    }

    pub fn need_frame_name(&mut self, token: u64) -> Option<Query> {
        if !self.pending_frame_names.insert(token) {
            return None;
        }
        Some(Query { kind: QueryKind::FrameName, token })
    }

    pub fn resolve_frame_name(&mut self, token: u64) {
        self.pending_frame_names.remove(&token);
    }

    // Callstacks.

    /// Stores a callstack payload under its transfer token, content
    /// addressing the frame list. Returns the id plus one query per frame
    /// address seen for the first time.
    pub fn add_callstack(&mut self, ptr: u64, frames: Vec<u64>, queries: &mut Vec<Query>) -> CallstackId {
        for &frame in &frames {
            if !self.frames.contains_key(&frame) && self.pending_frames.insert(frame) {
                queries.push(Query { kind: QueryKind::CallstackFrame, token: frame });
            }
        }
        let id = if let Some(&id) = self.callstack_lookup.get(&frames) {
            id
        } else {
            let id = CallstackId(self.callstacks.len() as u32);
            self.callstack_lookup.insert(frames.clone(), id);
            self.callstacks.push(frames);
            id
        };
        self.callstack_by_ptr.insert(ptr, id);
        id
    }

    pub fn callstack_for_ptr(&self, ptr: u64) -> Option<CallstackId> {
        self.callstack_by_ptr.get(&ptr).copied()
    }

    pub fn callstack(&self, id: CallstackId) -> &[u64] {
        &self.callstacks[id.0 as usize]
    }

    pub fn callstacks(&self) -> &[Vec<u64>] {
        &self.callstacks
    }

    /// Allocation-site frames carried inline by the payload get synthetic
    /// frame ids, content addressed on (name, file, line).
    pub fn synthetic_frame(&mut self, site: &AllocSite) -> u64 {
        let name = self.intern(&site.name);
        let file = self.intern(&site.file);
        let key = (name, file, site.line);
        if let Some(&id) = self.synthetic_frames.get(&key) {
            return id;
        }
        let id = self.next_synthetic;
        self.next_synthetic -= 1;
        self.synthetic_frames.insert(key, id);
        self.frames
            .insert(id, vec![FrameData { name, file, line: site.line }]);
        id
    }

    pub fn begin_frame_fill(&mut self, token: u64) {
        self.pending_frames.remove(&token);
        self.frames.entry(token).or_default();
    }

    pub fn push_frame_data(&mut self, token: u64, data: FrameData) {
        self.frames.entry(token).or_default().push(data);
    }

    pub fn frame_data(&self, token: u64) -> Option<&[FrameData]> {
        self.frames.get(&token).map(|v| v.as_slice())
    }

    pub fn frame_tokens(&self) -> impl Iterator<Item = (u64, &[FrameData])> {
        self.frames.iter().map(|(&t, v)| (t, v.as_slice()))
    }

    // Capture-file loading: these rebuild resolved state without touching
    // the pending sets.

    pub(crate) fn load_string_token(&mut self, token: u64, idx: StringIdx) {
        self.strings.insert(token, idx);
    }

    pub(crate) fn load_known_src_loc(&mut self, token: u64, loc: SourceLocation) {
        let idx = self.src_loc_expand.len() as u32;
        self.src_loc_shrink.insert(token, idx);
        self.src_loc_expand.push(token);
        self.src_locs.push(loc);
    }

    pub(crate) fn load_callstack(&mut self, frames: Vec<u64>) -> CallstackId {
        if let Some(&id) = self.callstack_lookup.get(&frames) {
            return id;
        }
        let id = CallstackId(self.callstacks.len() as u32);
        self.callstack_lookup.insert(frames.clone(), id);
        self.callstacks.push(frames);
        id
    }

    pub(crate) fn load_frame_symbols(&mut self, token: u64, data: Vec<FrameData>) {
        self.frames.insert(token, data);
    }

    /// Outstanding resolutions of every kind. The session may not complete
    /// a terminate drain while this is nonzero.
    pub fn pending_total(&self) -> usize {
        self.pending_strings.len()
            + self.pending_thread_names.len()
            + self.pending_src_locs.len()
            + self.pending_plot_names.len()
            + self.pending_frame_names.len()
            + self.pending_frames.len()
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_content_addressed() {
        let mut i = Interner::new();
        let a = i.intern("render");
        let b = i.intern("update");
        let c = i.intern("render");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(i.get(a), "render");
        assert_eq!(i.string_count(), 2);
    }

    #[test]
    fn string_token_queried_exactly_once() {
        let mut i = Interner::new();
        assert!(i.need_string(0x10).is_some());
        assert!(i.need_string(0x10).is_none());
        assert_eq!(i.pending_total(), 1);
        i.resolve_string(0x10, "message text");
        assert_eq!(i.pending_total(), 0);
        assert!(i.need_string(0x10).is_none());
        assert_eq!(i.resolve(StringRef::Ptr(0x10)), Some("message text"));
    }

    #[test]
    fn equal_callstacks_collapse_to_one_id() {
        let mut i = Interner::new();
        let mut q = Vec::new();
        let a = i.add_callstack(0x1, vec![10, 20, 30], &mut q);
        let b = i.add_callstack(0x2, vec![10, 20, 30], &mut q);
        assert_eq!(a, b);
        assert_eq!(i.callstacks().len(), 1);
        // One frame query per unique address.
        assert_eq!(q.len(), 3);
        let c = i.add_callstack(0x3, vec![10, 40], &mut q);
        assert_ne!(a, c);
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn payload_src_locs_deduplicate() {
        let mut i = Interner::new();
        let name = i.intern("scripted");
        let file = i.intern("game.lua");
        let loc = SourceLocation {
            name: StringRef::Idx(name),
            function: StringRef::None,
            file: StringRef::Idx(file),
            line: 12,
            color: 0,
        };
        assert_eq!(i.add_payload_src_loc(loc), i.add_payload_src_loc(loc));
        assert_eq!(i.payload_src_locs().len(), 1);
    }

    #[test]
    fn synthetic_frames_content_addressed() {
        let mut i = Interner::new();
        let site = AllocSite { name: "alloc".into(), file: "pool.cpp".into(), line: 7 };
        let a = i.synthetic_frame(&site);
        let b = i.synthetic_frame(&site);
        assert_eq!(a, b);
        assert!(i.frame_data(a).is_some());
    }
}
