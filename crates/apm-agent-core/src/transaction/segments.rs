//! Segment bookkeeping for an in-flight transaction.
//!
//! Segments form a tree rooted at the transaction itself. The arena stores
//! them flat with parent links by index, plus a stack of open segments so
//! the "current" span is always the most recently started one still
//! running. Nothing is pruned here; span materialization decides later
//! which segments become events.

use crate::attributes::AttributeStore;

/// Opaque handle to a started segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentToken(pub(crate) usize);

/// Span classification recorded on segment events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SpanCategory {
    #[default]
    Generic,
    Http,
    Datastore,
}

impl SpanCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SpanCategory::Generic => "generic",
            SpanCategory::Http => "http",
            SpanCategory::Datastore => "datastore",
        }
    }
}

#[derive(Debug)]
pub struct Segment {
    pub guid: u64,
    pub name: String,
    pub category: SpanCategory,
    pub parent: Option<usize>,
    pub start_ms: u64,
    pub duration_ms: Option<u64>,
    pub always_keep: bool,
    pub attributes: AttributeStore,
}

/// Flat segment tree with an open-segment stack.
///
/// Index 0 is always the transaction's root segment. It opens with the
/// transaction and only [`SegmentArena::finish_open`] closes it, so the
/// open stack stays non-empty for the whole recording window.
#[derive(Debug)]
pub struct SegmentArena {
    segments: Vec<Segment>,
    open: Vec<usize>,
}

impl SegmentArena {
    #[must_use]
    pub fn new(root_guid: u64, name: &str, start_ms: u64) -> SegmentArena {
        SegmentArena {
            segments: vec![Segment {
                guid: root_guid,
                name: name.to_string(),
                category: SpanCategory::Generic,
                parent: None,
                start_ms,
                duration_ms: None,
                always_keep: false,
                attributes: AttributeStore::new(),
            }],
            open: vec![0],
        }
    }

    /// Opens a new segment as a child of the current one.
    pub fn start(
        &mut self,
        guid: u64,
        name: &str,
        category: SpanCategory,
        now_ms: u64,
    ) -> SegmentToken {
        let parent = self.open.last().copied();
        let index = self.segments.len();
        self.segments.push(Segment {
            guid,
            name: name.to_string(),
            category,
            parent,
            start_ms: now_ms,
            duration_ms: None,
            always_keep: false,
            attributes: AttributeStore::new(),
        });
        self.open.push(index);
        SegmentToken(index)
    }

    /// Closes a segment. Returns false when it was already closed.
    ///
    /// Segments may end out of order; only the matching open-stack entry is
    /// removed, and descendants still running keep their original parent
    /// links.
    pub fn end(&mut self, token: SegmentToken, now_ms: u64) -> bool {
        let Some(segment) = self.segments.get_mut(token.0) else {
            return false;
        };
        if segment.duration_ms.is_some() {
            return false;
        }
        segment.duration_ms = Some(now_ms.saturating_sub(segment.start_ms));
        self.open.retain(|&index| index != token.0);
        true
    }

    /// Guid of the most recently started segment still running.
    #[must_use]
    pub fn current_guid(&self) -> Option<u64> {
        self.open.last().map(|&index| self.segments[index].guid)
    }

    /// Attribute store of the current segment.
    pub fn current_attributes_mut(&mut self) -> Option<&mut AttributeStore> {
        let index = *self.open.last()?;
        Some(&mut self.segments[index].attributes)
    }

    /// Flags the current segment so span sampling never drops it.
    pub fn mark_always_keep_current(&mut self) {
        if let Some(&index) = self.open.last() {
            self.segments[index].always_keep = true;
        }
    }

    /// Closes every segment still open, root included. Runs at transaction
    /// end so abandoned segments get a duration instead of dangling.
    pub fn finish_open(&mut self, now_ms: u64) {
        for index in std::mem::take(&mut self.open) {
            let segment = &mut self.segments[index];
            if segment.duration_ms.is_none() {
                segment.duration_ms = Some(now_ms.saturating_sub(segment.start_ms));
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
}
