//! Decoded value schemas for the recognised databases
//!
//! The stores keep fixed-layout records written with the host's native
//! integer and float representation (cross-platform transport is not
//! supported; the portable dump mode exists for that). Each schema pairs
//! an encode with a size-checked decode; decoders return `None` on a size
//! mismatch so that callers can fall back to raw printing.

/// Quality-of-connection statistics for one observation channel
///
/// `q` is the latest measurement, `expect` and `var` are its
/// exponentially-weighted running average and variance, `dq` the delta
/// against the previous measurement.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct QPoint {
    pub q: f64,
    pub expect: f64,
    pub var: f64,
    pub dq: f64,
}

impl QPoint {
    /// Encoded size in bytes
    pub const SIZE: usize = 32;

    /// A point with no history: expectation equals the measurement
    pub fn definite(q: f64) -> QPoint {
        QPoint {
            q,
            expect: q,
            var: 0.0,
            dq: 0.0,
        }
    }

    /// Fold a new measurement into the running average.
    ///
    /// `alpha` is the smoothing factor (weight of the new measurement).
    /// The variance is measured against the previous expectation, so a
    /// first real measurement after [`QPoint::definite`] carries its full
    /// squared deviation.
    pub fn average(self, new_q: f64, alpha: f64) -> QPoint {
        QPoint {
            q: new_q,
            expect: alpha * new_q + (1.0 - alpha) * self.expect,
            var: alpha * (new_q - self.expect) * (new_q - self.expect) + (1.0 - alpha) * self.var,
            dq: new_q - self.q,
        }
    }

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.q.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.expect.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.var.to_ne_bytes());
        buf[24..32].copy_from_slice(&self.dq.to_ne_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<QPoint> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        Some(QPoint {
            q: f64::from_ne_bytes(bytes[0..8].try_into().ok()?),
            expect: f64::from_ne_bytes(bytes[8..16].try_into().ok()?),
            var: f64::from_ne_bytes(bytes[16..24].try_into().ok()?),
            dq: f64::from_ne_bytes(bytes[24..32].try_into().ok()?),
        })
    }
}

/// A `q[io]<hostkey>` lastseen quality entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyHostSeen {
    /// When the peer was last seen (seconds since the epoch)
    pub lastseen: i64,
    pub q: QPoint,
}

impl KeyHostSeen {
    pub const SIZE: usize = 8 + QPoint::SIZE;

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.lastseen.to_ne_bytes());
        buf[8..].copy_from_slice(&self.q.to_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<KeyHostSeen> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        Some(KeyHostSeen {
            lastseen: i64::from_ne_bytes(bytes[0..8].try_into().ok()?),
            q: QPoint::from_bytes(&bytes[8..])?,
        })
    }
}

/// A promise-lock entry in the locks database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockData {
    pub pid: i64,
    pub time: i64,
    pub process_start_time: i64,
}

impl LockData {
    pub const SIZE: usize = 24;

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.pid.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.time.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.process_start_time.to_ne_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<LockData> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        Some(LockData {
            pid: i64::from_ne_bytes(bytes[0..8].try_into().ok()?),
            time: i64::from_ne_bytes(bytes[8..16].try_into().ok()?),
            process_start_time: i64::from_ne_bytes(bytes[16..24].try_into().ok()?),
        })
    }
}

/// Monitoring averages: one [`QPoint`] per observable channel
#[derive(Debug, Clone, PartialEq)]
pub struct Averages {
    pub last_seen: i64,
    pub q: Vec<QPoint>,
}

impl Averages {
    /// Encoded size: timestamp plus the fixed observable count
    pub const SIZE: usize = 8 + crate::observables::OBSERVABLES * QPoint::SIZE;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.last_seen.to_ne_bytes());
        for i in 0..crate::observables::OBSERVABLES {
            let point = self.q.get(i).copied().unwrap_or_default();
            buf.extend_from_slice(&point.to_bytes());
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Averages> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        let last_seen = i64::from_ne_bytes(bytes[0..8].try_into().ok()?);
        let mut q = Vec::with_capacity(crate::observables::OBSERVABLES);
        for chunk in bytes[8..].chunks_exact(QPoint::SIZE) {
            q.push(QPoint::from_bytes(chunk)?);
        }
        Some(Averages { last_seen, q })
    }
}

/// Expiry policy of a persistent class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassStatePolicy {
    Reset,
    Preserve,
}

impl ClassStatePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ClassStatePolicy::Reset => "RESET",
            ClassStatePolicy::Preserve => "PRESERVE",
        }
    }

    fn from_raw(raw: u32) -> Option<ClassStatePolicy> {
        match raw {
            0 => Some(ClassStatePolicy::Reset),
            1 => Some(ClassStatePolicy::Preserve),
            _ => None,
        }
    }
}

/// A persistent class record: fixed header plus a variable-length,
/// NUL-terminated tag string.
///
/// The tail is kept as owned data, not a C-style flexible array; the
/// decoder verifies NUL termination and bounds before exposing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentClassInfo {
    /// Expiry time (seconds since the epoch)
    pub expires: u32,
    pub policy: ClassStatePolicy,
    pub tags: String,
}

impl PersistentClassInfo {
    /// Size of the fixed header preceding the tag string
    pub const HEADER_SIZE: usize = 8;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::HEADER_SIZE + self.tags.len() + 1);
        buf.extend_from_slice(&self.expires.to_ne_bytes());
        let policy: u32 = match self.policy {
            ClassStatePolicy::Reset => 0,
            ClassStatePolicy::Preserve => 1,
        };
        buf.extend_from_slice(&policy.to_ne_bytes());
        buf.extend_from_slice(self.tags.as_bytes());
        buf.push(0);
        buf
    }

    /// Decode a record. The total length must exceed the fixed header and
    /// the tag suffix must contain a NUL terminator.
    pub fn from_bytes(bytes: &[u8]) -> Option<PersistentClassInfo> {
        if bytes.len() <= Self::HEADER_SIZE {
            return None;
        }
        let expires = u32::from_ne_bytes(bytes[0..4].try_into().ok()?);
        let policy = ClassStatePolicy::from_raw(u32::from_ne_bytes(bytes[4..8].try_into().ok()?))?;
        let tail = &bytes[Self::HEADER_SIZE..];
        let nul = tail.iter().position(|&b| b == 0)?;
        let tags = std::str::from_utf8(&tail[..nul]).ok()?.to_string();
        Some(PersistentClassInfo {
            expires,
            policy,
            tags,
        })
    }
}
