//! Scan verdicts.

/// Outcome of one REQMOD exchange. Produced exactly once per scan attempt.
#[derive(Clone, Debug)]
pub enum IcapVerdict {
    /// The scanner answered 204; the content needs no modification.
    Clean,
    /// The scanner rejected the content (or answered something other than
    /// 204/100).
    Blocked {
        http_code: u16,
        message: String,
        /// The scanner hit its own file-size cap rather than finding a
        /// threat; subject to the configured limits-exceeded behaviour.
        is_size_limit: bool,
        raw_headers: Vec<String>,
    },
    /// The response could not be parsed as ICAP at all.
    ProtocolError { detail: String },
}

impl IcapVerdict {
    pub fn is_clean(&self) -> bool {
        matches!(self, IcapVerdict::Clean)
    }
}
