//! Typed, negotiated option record (§3 "Options record", §4.2).

use crate::packet::TransferMode;

pub const DEFAULT_BLKSIZE: u16 = 512;
pub const DEFAULT_TIMEOUT: u16 = 10;
pub const DEFAULT_WINDOWSIZE: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Read,
    Write,
}

/// One negotiated option plus whether the peer actually offered it —
/// an OACK must only echo options the peer sent (§8 property 3).
#[derive(Debug, Clone, Copy)]
pub struct Negotiated<T> {
    pub value: T,
    pub was_set: bool,
}

impl<T> Negotiated<T> {
    fn default_with(value: T) -> Self {
        Self {
            value,
            was_set: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TftpOptions {
    pub request_type: RequestType,
    pub filename: String,
    pub mode: TransferMode,
    pub blksize: Negotiated<u16>,
    pub timeout: Negotiated<u16>,
    pub tsize: Negotiated<u64>,
    pub windowsize: Negotiated<u16>,
}

impl TftpOptions {
    pub fn new(request_type: RequestType, filename: String, mode: TransferMode) -> Self {
        Self {
            request_type,
            filename,
            mode,
            blksize: Negotiated::default_with(DEFAULT_BLKSIZE),
            timeout: Negotiated::default_with(DEFAULT_TIMEOUT),
            tsize: Negotiated::default_with(0),
            windowsize: Negotiated::default_with(DEFAULT_WINDOWSIZE),
        }
    }

    /// Applies the peer's raw `(name, value)` option pairs, validating and
    /// clamping per §3's ranges. Options failing validation are silently
    /// dropped (§4.2) rather than rejecting the whole request. Returns
    /// whether at least one option was accepted (controls `ack_options`
    /// entry in §4.5's state machine).
    pub fn negotiate(&mut self, raw: &[(String, String)]) -> bool {
        let mut accepted = false;
        for (name, value) in raw {
            let name = name.to_ascii_lowercase();
            match name.as_str() {
                "blksize" => {
                    if let Ok(v) = value.parse::<i64>()
                        && (1..=65500).contains(&v)
                    {
                        self.blksize = Negotiated {
                            value: v as u16,
                            was_set: true,
                        };
                        accepted = true;
                    }
                }
                "timeout" => {
                    if let Ok(v) = value.parse::<i64>()
                        && (1..=3600).contains(&v)
                    {
                        self.timeout = Negotiated {
                            value: v as u16,
                            was_set: true,
                        };
                        accepted = true;
                    }
                }
                "tsize" => {
                    if let Ok(v) = value.parse::<i64>()
                        && v >= 0
                    {
                        self.tsize = Negotiated {
                            value: v as u64,
                            was_set: true,
                        };
                        accepted = true;
                    }
                }
                "windowsize" => {
                    if let Ok(v) = value.parse::<i64>()
                        && v >= 1
                    {
                        self.windowsize = Negotiated {
                            value: v as u16,
                            was_set: true,
                        };
                        accepted = true;
                    }
                }
                _ => {
                    // Unknown options are logged by the caller and ignored.
                }
            }
        }
        accepted
    }

    /// Options the peer offered and we accepted, in the form the OACK
    /// packet needs (§4.1's "echoed for those the implementation chose to
    /// honor").
    pub fn accepted_options(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if self.blksize.was_set {
            out.push(("blksize".to_string(), self.blksize.value.to_string()));
        }
        if self.timeout.was_set {
            out.push(("timeout".to_string(), self.timeout.value.to_string()));
        }
        if self.tsize.was_set {
            out.push(("tsize".to_string(), self.tsize.value.to_string()));
        }
        if self.windowsize.was_set {
            out.push(("windowsize".to_string(), self.windowsize.value.to_string()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> TftpOptions {
        TftpOptions::new(RequestType::Read, "f".to_string(), TransferMode::Octet)
    }

    #[test]
    fn accepts_valid_blksize() {
        let mut o = opts();
        let accepted = o.negotiate(&[("blksize".to_string(), "1024".to_string())]);
        assert!(accepted);
        assert_eq!(o.blksize.value, 1024);
        assert!(o.blksize.was_set);
    }

    #[test]
    fn drops_blksize_below_range() {
        let mut o = opts();
        let accepted = o.negotiate(&[("blksize".to_string(), "0".to_string())]);
        assert!(!accepted);
        assert!(!o.blksize.was_set);
        assert_eq!(o.blksize.value, DEFAULT_BLKSIZE);
    }

    #[test]
    fn drops_blksize_above_range() {
        let mut o = opts();
        assert!(!o.negotiate(&[("blksize".to_string(), "65501".to_string())]));
    }

    #[test]
    fn drops_timeout_out_of_range() {
        let mut o = opts();
        assert!(!o.negotiate(&[("timeout".to_string(), "3601".to_string())]));
        assert!(!o.negotiate(&[("timeout".to_string(), "0".to_string())]));
    }

    #[test]
    fn accepts_windowsize_one_and_above() {
        let mut o = opts();
        assert!(o.negotiate(&[("windowsize".to_string(), "1".to_string())]));
        assert!(!o.negotiate(&[("windowsize".to_string(), "0".to_string())]));
    }

    #[test]
    fn ignores_unknown_option_without_failing() {
        let mut o = opts();
        let accepted = o.negotiate(&[("frobnicate".to_string(), "yes".to_string())]);
        assert!(!accepted);
    }

    #[test]
    fn option_names_are_case_insensitive() {
        let mut o = opts();
        assert!(o.negotiate(&[("BLKSIZE".to_string(), "1024".to_string())]));
    }

    #[test]
    fn accepted_options_only_lists_was_set() {
        let mut o = opts();
        o.negotiate(&[("blksize".to_string(), "1024".to_string())]);
        let accepted = o.accepted_options();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].0, "blksize");
    }
}
