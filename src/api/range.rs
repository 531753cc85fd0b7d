/// One satisfiable byte range: inclusive start/end offsets into a file of
/// known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Outcome of parsing a Range header against a file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    /// No Range header: serve the whole file with 200.
    Full,
    /// A single satisfiable range: serve 206.
    Partial(ByteRange),
    /// Present but malformed or unsatisfiable: 416.
    Unsatisfiable,
}

/// Parse a `Range: bytes=...` header per the subset the gateway supports:
/// `bytes=a-b`, `bytes=a-`, and `bytes=-N`. Multi-range requests are treated
/// as unsatisfiable rather than multiplexed.
pub fn parse_range(header: Option<&str>, size: u64) -> RangeOutcome {
    let Some(raw) = header else {
        return RangeOutcome::Full;
    };
    // A unit other than bytes is ignored, not refused.
    let Some(spec) = raw.trim().strip_prefix("bytes=") else {
        return RangeOutcome::Full;
    };
    if spec.contains(',') {
        return RangeOutcome::Unsatisfiable;
    }
    let Some((start_raw, end_raw)) = spec.split_once('-') else {
        return RangeOutcome::Unsatisfiable;
    };

    if size == 0 {
        return RangeOutcome::Unsatisfiable;
    }

    // Suffix form: last N bytes.
    if start_raw.is_empty() {
        let Ok(suffix_len) = end_raw.parse::<u64>() else {
            return RangeOutcome::Unsatisfiable;
        };
        if suffix_len == 0 {
            return RangeOutcome::Unsatisfiable;
        }
        let len = suffix_len.min(size);
        return RangeOutcome::Partial(ByteRange {
            start: size - len,
            end: size - 1,
        });
    }

    let Ok(start) = start_raw.parse::<u64>() else {
        return RangeOutcome::Unsatisfiable;
    };
    if start >= size {
        return RangeOutcome::Unsatisfiable;
    }

    let end = if end_raw.is_empty() {
        size - 1
    } else {
        match end_raw.parse::<u64>() {
            Ok(end) => end.min(size - 1),
            Err(_) => return RangeOutcome::Unsatisfiable,
        }
    };
    if end < start {
        return RangeOutcome::Unsatisfiable;
    }
    RangeOutcome::Partial(ByteRange { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_range_is_inclusive() {
        let outcome = parse_range(Some("bytes=0-99"), 256);
        assert_eq!(outcome, RangeOutcome::Partial(ByteRange { start: 0, end: 99 }));
        if let RangeOutcome::Partial(range) = outcome {
            assert_eq!(range.len(), 100);
        }
    }

    #[test]
    fn open_range_runs_to_end_of_file() {
        assert_eq!(
            parse_range(Some("bytes=200-"), 256),
            RangeOutcome::Partial(ByteRange { start: 200, end: 255 })
        );
    }

    #[test]
    fn suffix_range_takes_last_n_bytes() {
        assert_eq!(
            parse_range(Some("bytes=-50"), 256),
            RangeOutcome::Partial(ByteRange { start: 206, end: 255 })
        );
        // Suffix longer than the file clamps to the whole file.
        assert_eq!(
            parse_range(Some("bytes=-1000"), 256),
            RangeOutcome::Partial(ByteRange { start: 0, end: 255 })
        );
    }

    #[test]
    fn end_past_eof_clamps() {
        assert_eq!(
            parse_range(Some("bytes=100-999"), 256),
            RangeOutcome::Partial(ByteRange { start: 100, end: 255 })
        );
    }

    #[test]
    fn absent_header_serves_full_body() {
        assert_eq!(parse_range(None, 256), RangeOutcome::Full);
    }

    #[test]
    fn malformed_and_unsatisfiable_forms_are_416() {
        for header in [
            "bytes=",
            "bytes=abc-def",
            "bytes=500-",
            "bytes=10-5",
            "bytes=-0",
            "bytes=0-10,20-30",
        ] {
            assert_eq!(
                parse_range(Some(header), 256),
                RangeOutcome::Unsatisfiable,
                "{header}"
            );
        }
    }

    #[test]
    fn foreign_range_units_are_ignored() {
        assert_eq!(parse_range(Some("items=0-10"), 256), RangeOutcome::Full);
    }
}
