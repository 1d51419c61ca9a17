//! Byte ranges over blobs and the sparse data that covers them.

use std::fmt;
use std::str::FromStr;

use veld_core::Chunk;

/// A half-open `[start, end)` interval of blob offsets. `end == None`
/// means OPEN: through end-of-blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: u64,
    pub end: Option<u64>,
}

impl Range {
    pub fn to(start: u64, end: u64) -> Self {
        Range {
            start,
            end: Some(end),
        }
    }

    /// From `start` through end-of-blob.
    pub fn open(start: u64) -> Self {
        Range { start, end: None }
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    pub fn len(&self) -> Option<u64> {
        self.end.map(|e| e.saturating_sub(self.start))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    fn end_or_max(&self) -> u64 {
        self.end.unwrap_or(u64::MAX)
    }

    pub fn overlaps(&self, other: &Range) -> bool {
        self.start < other.end_or_max() && other.start < self.end_or_max()
    }

    /// Whether every offset of `other` lies inside `self`.
    pub fn contains(&self, other: &Range) -> bool {
        other.start >= self.start && other.end_or_max() <= self.end_or_max()
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}-{}", self.start, end),
            None => write!(f, "{}-", self.start),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid range: expected start-end or start-")]
pub struct InvalidRange;

impl FromStr for Range {
    type Err = InvalidRange;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s.split_once('-').ok_or(InvalidRange)?;
        let start = start.parse().map_err(|_| InvalidRange)?;
        let end = if end.is_empty() {
            None
        } else {
            Some(end.parse().map_err(|_| InvalidRange)?)
        };
        if let Some(e) = end {
            if e < start {
                return Err(InvalidRange);
            }
        }
        Ok(Range { start, end })
    }
}

/// One contiguous run of known bytes.
#[derive(Debug, Clone)]
pub struct DenseData {
    pub start: u64,
    pub bytes: Chunk,
}

impl DenseData {
    pub fn new(start: u64, bytes: Chunk) -> Self {
        DenseData { start, bytes }
    }

    pub fn end(&self) -> u64 {
        self.start + self.bytes.len() as u64
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The leading `limit` bytes of this run.
    pub fn prefix(&self, limit: u64) -> DenseData {
        if self.len() <= limit {
            self.clone()
        } else {
            DenseData {
                start: self.start,
                bytes: self.bytes.slice(0..limit as usize),
            }
        }
    }
}

/// The known parts of a blob: non-overlapping runs sorted by start
/// offset. Runs that touch are merged on insertion, so coverage of a
/// closed range is always witnessed by a single run.
#[derive(Debug, Clone, Default)]
pub struct SparseData {
    runs: Vec<DenseData>,
    total_len: Option<u64>,
}

impl SparseData {
    pub fn new() -> Self {
        SparseData::default()
    }

    pub fn from_dense(data: DenseData) -> Self {
        let mut sparse = SparseData::new();
        sparse.insert(data);
        sparse
    }

    pub fn runs(&self) -> &[DenseData] {
        &self.runs
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Total bytes held across all runs.
    pub fn size_bytes(&self) -> u64 {
        self.runs.iter().map(DenseData::len).sum()
    }

    /// Blob length, once some populate step has reported it.
    pub fn total_len(&self) -> Option<u64> {
        self.total_len
    }

    pub fn set_total_len(&mut self, len: u64) {
        self.total_len = Some(self.total_len.map_or(len, |t| t.max(len)));
    }

    /// Insert a run, merging with any runs it overlaps or touches.
    /// Overlapping offsets take the incoming bytes; blobs are
    /// content-addressed, so overlaps are byte-identical anyway.
    pub fn insert(&mut self, data: DenseData) {
        if data.is_empty() {
            return;
        }
        let (start, end) = (data.start, data.end());
        let mut lo = 0;
        while lo < self.runs.len() && self.runs[lo].end() < start {
            lo += 1;
        }
        let mut hi = lo;
        while hi < self.runs.len() && self.runs[hi].start <= end {
            hi += 1;
        }
        if lo == hi {
            self.runs.insert(lo, data);
            return;
        }
        let new_start = start.min(self.runs[lo].start);
        let new_end = end.max(self.runs[hi - 1].end());
        let mut buf = vec![0u8; (new_end - new_start) as usize];
        for run in &self.runs[lo..hi] {
            let off = (run.start - new_start) as usize;
            buf[off..off + run.bytes.len()].copy_from_slice(&run.bytes);
        }
        let off = (start - new_start) as usize;
        buf[off..off + data.bytes.len()].copy_from_slice(&data.bytes);
        self.runs
            .splice(lo..hi, [DenseData::new(new_start, Chunk::from_vec(buf))]);
    }

    pub fn merge_from(&mut self, other: &SparseData) {
        for run in &other.runs {
            self.insert(run.clone());
        }
        if let Some(t) = other.total_len {
            self.set_total_len(t);
        }
    }

    /// Resolve an OPEN end against the known blob length.
    fn resolve(&self, range: &Range) -> Option<(u64, u64)> {
        match range.end {
            Some(end) => Some((range.start, end)),
            None => self.total_len.map(|t| (range.start, t.max(range.start))),
        }
    }

    /// Whether every byte of `range` is known. An OPEN range needs the
    /// blob length to have been reported.
    pub fn covers(&self, range: &Range) -> bool {
        let Some((start, end)) = self.resolve(range) else {
            return false;
        };
        if start >= end {
            return true;
        }
        self.runs
            .iter()
            .any(|r| r.start <= start && r.end() >= end)
    }

    /// The bytes of `range`, if covered.
    pub fn read(&self, range: &Range) -> Option<Chunk> {
        let (start, end) = self.resolve(range)?;
        if start >= end {
            return Some(Chunk::default());
        }
        self.runs
            .iter()
            .find(|r| r.start <= start && r.end() >= end)
            .map(|r| {
                r.bytes
                    .slice((start - r.start) as usize..(end - r.start) as usize)
            })
    }

    /// The intersection of the known runs with `range`. Storage is shared
    /// with `self`, not copied.
    pub fn clipped(&self, range: &Range) -> SparseData {
        let mut out = SparseData {
            runs: Vec::new(),
            total_len: self.total_len,
        };
        let Some((start, end)) = self.resolve(range) else {
            return out;
        };
        for run in &self.runs {
            let s = run.start.max(start);
            let e = run.end().min(end);
            if s < e {
                out.runs.push(DenseData::new(
                    s,
                    run.bytes
                        .slice((s - run.start) as usize..(e - run.start) as usize),
                ));
            }
        }
        out
    }
}

/// Interval bookkeeping without the bytes — the disk tier's index of
/// which ranges a blob file holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeList {
    spans: Vec<(u64, u64)>,
}

impl RangeList {
    pub fn new() -> Self {
        RangeList::default()
    }

    pub fn spans(&self) -> &[(u64, u64)] {
        &self.spans
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn insert(&mut self, start: u64, end: u64) {
        if end <= start {
            return;
        }
        let mut lo = 0;
        while lo < self.spans.len() && self.spans[lo].1 < start {
            lo += 1;
        }
        let mut hi = lo;
        while hi < self.spans.len() && self.spans[hi].0 <= end {
            hi += 1;
        }
        if lo == hi {
            self.spans.insert(lo, (start, end));
            return;
        }
        let new_start = start.min(self.spans[lo].0);
        let new_end = end.max(self.spans[hi - 1].1);
        self.spans.splice(lo..hi, [(new_start, new_end)]);
    }

    pub fn covers(&self, range: &Range, total_len: Option<u64>) -> bool {
        let (start, end) = match range.end {
            Some(end) => (range.start, end),
            None => match total_len {
                Some(t) => (range.start, t.max(range.start)),
                None => return false,
            },
        };
        if start >= end {
            return true;
        }
        self.spans.iter().any(|&(s, e)| s <= start && e >= end)
    }
}
