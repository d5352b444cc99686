//! Range-confined pattern scanning.
//!
//! Scans run over the classified ranges of a [`ModuleMap`] one candidate
//! start per byte. A match must lie entirely inside the contiguous range it
//! starts in; scanning never reads across a range boundary. Results come
//! back in ascending address order and overlapping matches are all
//! reported.

use memchr::{memchr_iter, memmem};

use crate::memory::{MemoryRange, ModuleMap};
use crate::pattern::PatternElement;

/// One located occurrence of a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub addr: usize,
    pub len: usize,
}

impl Match {
    /// First address past the matched bytes.
    pub fn end(&self) -> usize {
        self.addr + self.len
    }
}

/// Pattern scanner over a module's classified ranges.
pub struct Scanner<'m> {
    map: &'m ModuleMap,
}

impl<'m> Scanner<'m> {
    pub fn new(map: &'m ModuleMap) -> Self {
        Self { map }
    }

    /// All occurrences of `pattern` across `ranges`, capped at
    /// `max_matches` (0 means unbounded). The scan stops as soon as the
    /// cap is reached.
    pub fn find(
        &self,
        pattern: &[PatternElement],
        ranges: &[MemoryRange],
        max_matches: usize,
    ) -> Vec<Match> {
        let mut matches = Vec::new();
        for range in ranges {
            let capped =
                self.scan_span(pattern, *range, range.end(), max_matches, &mut matches);
            if capped {
                break;
            }
        }
        matches
    }

    /// First occurrence of `pattern` across `ranges`.
    pub fn find_first(
        &self,
        pattern: &[PatternElement],
        ranges: &[MemoryRange],
    ) -> Option<Match> {
        self.find(pattern, ranges, 1).into_iter().next()
    }

    /// Occurrences in executable ranges only.
    pub fn find_in_code(&self, pattern: &[PatternElement], max_matches: usize) -> Vec<Match> {
        self.find(pattern, self.map.code(), max_matches)
    }

    pub fn find_first_in_code(&self, pattern: &[PatternElement]) -> Option<Match> {
        self.find_first(pattern, self.map.code())
    }

    /// First occurrence in read-only data ranges only.
    pub fn find_first_in_rdata(&self, pattern: &[PatternElement]) -> Option<Match> {
        self.find_first(pattern, self.map.rdata())
    }

    /// First occurrence starting within `len` bytes of `start`.
    ///
    /// `start` must lie in a code range. The window bounds where a match
    /// may begin; the matched bytes may run on to the end of the
    /// containing range.
    pub fn find_in_window(
        &self,
        start: usize,
        len: usize,
        pattern: &[PatternElement],
    ) -> Option<Match> {
        let range = self.map.code_range_containing(start)?;
        let window_end = range.end().min(start.saturating_add(len));
        let window = MemoryRange::new(start, window_end - start);
        let mut matches = Vec::new();
        self.scan_span(pattern, window, range.end(), 1, &mut matches);
        matches.into_iter().next()
    }

    /// Scan for matches starting inside `span`, with all reads bounded by
    /// `limit`. Returns true once `max_matches` is reached.
    fn scan_span(
        &self,
        pattern: &[PatternElement],
        span: MemoryRange,
        limit: usize,
        max_matches: usize,
        out: &mut Vec<Match>,
    ) -> bool {
        if pattern.is_empty() || span.len == 0 {
            return false;
        }
        // SAFETY: span and limit lie inside a readable map range.
        let haystack =
            unsafe { std::slice::from_raw_parts(span.base as *const u8, limit - span.base) };

        let mut run = |starts: &mut dyn Iterator<Item = usize>| -> bool {
            for offset in starts {
                if offset >= span.len {
                    break;
                }
                let addr = span.base + offset;
                if let Some(len) = match_at(self.map, pattern, addr, limit) {
                    out.push(Match { addr, len });
                    if max_matches != 0 && out.len() >= max_matches {
                        return true;
                    }
                }
            }
            false
        };

        // Patterns with a pinned first byte get a memchr prefilter; the
        // prefilter only proposes starts and never changes the match set.
        match &pattern[0] {
            PatternElement::Bytes(bytes) if bytes.len() > 1 => {
                // memmem yields non-overlapping hits, so re-seek one byte
                // past each hit to keep overlapping starts in play.
                let finder = memmem::Finder::new(bytes.as_slice());
                let mut next = 0;
                run(&mut std::iter::from_fn(|| {
                    let hit = next + finder.find(haystack.get(next..)?)?;
                    next = hit + 1;
                    Some(hit)
                }))
            }
            head => match head.lead_byte() {
                Some(lead) => run(&mut memchr_iter(lead, haystack)),
                None => run(&mut (0..span.len)),
            },
        }
    }
}

/// Match `pattern` at exactly `addr`, returning the consumed byte count.
/// Every read stays below `limit`.
///
/// Ranged wildcards try their shortest width first and grow only when the
/// rest of the pattern cannot match, so the overall result is
/// deterministic.
fn match_at(
    map: &ModuleMap,
    pattern: &[PatternElement],
    addr: usize,
    limit: usize,
) -> Option<usize> {
    let Some((head, rest)) = pattern.split_first() else {
        return Some(0);
    };
    if let PatternElement::AnyRange(min, max) = head {
        for skip in *min..=*max {
            let next = addr.checked_add(skip)?;
            if next > limit {
                break;
            }
            if let Some(tail) = match_at(map, rest, next, limit) {
                return Some(skip + tail);
            }
        }
        return None;
    }
    let size = head.size_required();
    if addr.checked_add(size)? > limit {
        return None;
    }
    // SAFETY: addr + size bounds-checked against the readable range.
    if !unsafe { head.matches_at(map, addr) } {
        return None;
    }
    match_at(map, rest, addr + size, limit).map(|tail| size + tail)
}
