//! Collective communication between the workers of one query.
//!
//! Every operator calls collectives in the same order on every rank; a call
//! blocks until all ranks have contributed. Any transport failure (a peer that
//! went away, a timeout) is reported as [`TesseraError::Collective`] and is
//! fatal for the query.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;

use tessera_common::{Result, TesseraError};
use tracing::debug;

/// Point-to-point exchange primitive every collective is built from.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Send `outgoing[r]` to rank `r` and return what every rank sent to this
    /// one, indexed by source rank. `outgoing.len()` must equal `size()`.
    fn exchange(&self, outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>>;
}

/// Associative operator of an exclusive scan or all-reduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Prod,
    Min,
    Max,
}

/// Fixed-width value that collectives can reduce.
pub trait ScanValue: Copy + Send + 'static {
    const WIDTH: usize;

    fn identity(op: ReduceOp) -> Self;
    fn reduce(op: ReduceOp, a: Self, b: Self) -> Self;
    fn write(self, out: &mut Vec<u8>);
    fn read(bytes: &[u8]) -> Self;
}

macro_rules! impl_scan_value {
    ($t:ty, $zero:expr, $one:expr, $min:expr, $max:expr, $add:expr, $mul:expr) => {
        impl ScanValue for $t {
            const WIDTH: usize = std::mem::size_of::<$t>();

            fn identity(op: ReduceOp) -> Self {
                match op {
                    ReduceOp::Sum => $zero,
                    ReduceOp::Prod => $one,
                    ReduceOp::Min => $max,
                    ReduceOp::Max => $min,
                }
            }

            fn reduce(op: ReduceOp, a: Self, b: Self) -> Self {
                match op {
                    ReduceOp::Sum => $add(a, b),
                    ReduceOp::Prod => $mul(a, b),
                    ReduceOp::Min => {
                        if b < a {
                            b
                        } else {
                            a
                        }
                    }
                    ReduceOp::Max => {
                        if b > a {
                            b
                        } else {
                            a
                        }
                    }
                }
            }

            fn write(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(&bytes[..std::mem::size_of::<$t>()]);
                <$t>::from_le_bytes(buf)
            }
        }
    };
}

// Integer scans wrap on overflow, matching groupby's integer sums.
impl_scan_value!(i64, 0, 1, i64::MIN, i64::MAX, i64::wrapping_add, i64::wrapping_mul);
impl_scan_value!(
    f64,
    0.0,
    1.0,
    f64::NEG_INFINITY,
    f64::INFINITY,
    |a: f64, b: f64| a + b,
    |a: f64, b: f64| a * b
);
impl_scan_value!(u8, 0, 1, u8::MIN, u8::MAX, u8::wrapping_add, u8::wrapping_mul);

/// Higher-level collectives derived from [`Collective::exchange`].
pub trait CollectiveExt: Collective {
    /// Variable-size all-to-all: per-target byte counts are exchanged first,
    /// then the payloads, which are checked against the announced counts.
    fn all_to_all(&self, outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        if outgoing.len() != self.size() {
            return Err(TesseraError::Collective(format!(
                "all_to_all expects {} buffers, got {}",
                self.size(),
                outgoing.len()
            )));
        }
        let counts = outgoing
            .iter()
            .map(|b| (b.len() as u64).to_le_bytes().to_vec())
            .collect::<Vec<_>>();
        let expected = self
            .exchange(counts)?
            .iter()
            .map(|b| read_u64(b))
            .collect::<Result<Vec<_>>>()?;
        let sent = outgoing.iter().map(Vec::len).sum::<usize>();
        let incoming = self.exchange(outgoing)?;
        for (src, (buf, want)) in incoming.iter().zip(&expected).enumerate() {
            if buf.len() as u64 != *want {
                return Err(TesseraError::Collective(format!(
                    "rank {src} announced {want} bytes but sent {}",
                    buf.len()
                )));
            }
        }
        debug!(
            rank = self.rank(),
            sent_bytes = sent,
            received_bytes = expected.iter().sum::<u64>(),
            "all_to_all"
        );
        Ok(incoming)
    }

    /// Every rank receives `root`'s payload; other ranks' `data` is ignored.
    fn broadcast(&self, root: usize, data: Vec<u8>) -> Result<Vec<u8>> {
        let size = self.size();
        if root >= size {
            return Err(TesseraError::Collective(format!(
                "broadcast root {root} out of range for {size} ranks"
            )));
        }
        let outgoing = if self.rank() == root {
            vec![data; size]
        } else {
            vec![Vec::new(); size]
        };
        let mut incoming = self.all_to_all(outgoing)?;
        Ok(std::mem::take(&mut incoming[root]))
    }

    /// Payload of every rank, indexed by rank.
    fn all_gather(&self, data: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        self.all_to_all(vec![data; self.size()])
    }

    /// Element-wise exclusive prefix scan; rank 0 receives the identity.
    fn exscan<T: ScanValue>(&self, values: &[T], op: ReduceOp) -> Result<Vec<T>> {
        let gathered = self.all_gather(encode_values(values))?;
        let mut acc = vec![T::identity(op); values.len()];
        for bytes in &gathered[..self.rank()] {
            let theirs = decode_values::<T>(bytes, values.len())?;
            for (a, b) in acc.iter_mut().zip(theirs) {
                *a = T::reduce(op, *a, b);
            }
        }
        Ok(acc)
    }

    /// Element-wise reduction over all ranks, result on every rank.
    fn allreduce<T: ScanValue>(&self, values: &[T], op: ReduceOp) -> Result<Vec<T>> {
        let gathered = self.all_gather(encode_values(values))?;
        let mut acc = vec![T::identity(op); values.len()];
        for bytes in &gathered {
            let theirs = decode_values::<T>(bytes, values.len())?;
            for (a, b) in acc.iter_mut().zip(theirs) {
                *a = T::reduce(op, *a, b);
            }
        }
        Ok(acc)
    }

    fn all_and(&self, flag: bool) -> Result<bool> {
        Ok(self.allreduce(&[u8::from(flag)], ReduceOp::Min)?[0] == 1)
    }

    fn any_or(&self, flag: bool) -> Result<bool> {
        Ok(self.allreduce(&[u8::from(flag)], ReduceOp::Max)?[0] == 1)
    }

    fn barrier(&self) -> Result<()> {
        self.exchange(vec![Vec::new(); self.size()]).map(|_| ())
    }
}

impl<C: Collective + ?Sized> CollectiveExt for C {}

fn read_u64(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| {
        TesseraError::Collective(format!("malformed count of {} bytes", bytes.len()))
    })?;
    Ok(u64::from_le_bytes(arr))
}

fn encode_values<T: ScanValue>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * T::WIDTH);
    for v in values {
        v.write(&mut out);
    }
    out
}

fn decode_values<T: ScanValue>(bytes: &[u8], expected: usize) -> Result<Vec<T>> {
    if bytes.len() != expected * T::WIDTH {
        return Err(TesseraError::Collective(format!(
            "scan length mismatch: expected {expected} values, got {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes.chunks_exact(T::WIDTH).map(T::read).collect())
}

/// Single-process provider: a rank that never takes part in collectives.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn exchange(&self, outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        if outgoing.len() != 1 {
            return Err(TesseraError::Collective(format!(
                "single process exchange expects 1 buffer, got {}",
                outgoing.len()
            )));
        }
        Ok(outgoing)
    }
}

/// In-process collective group; one [`LocalCollective`] endpoint per worker
/// thread, connected pairwise by FIFO channels.
pub struct LocalCollectiveGroup;

impl LocalCollectiveGroup {
    /// Create `size` connected endpoints, index = rank.
    pub fn create(size: usize) -> Vec<LocalCollective> {
        Self::create_with_timeout(size, None)
    }

    /// Like [`Self::create`]; a receive waiting longer than `timeout` fails.
    pub fn create_with_timeout(size: usize, timeout: Option<Duration>) -> Vec<LocalCollective> {
        // channels[dst][src]
        let mut senders: Vec<Vec<Option<Sender<Vec<u8>>>>> = (0..size)
            .map(|_| (0..size).map(|_| None).collect())
            .collect();
        let mut receivers: Vec<Vec<Option<Receiver<Vec<u8>>>>> = (0..size)
            .map(|_| (0..size).map(|_| None).collect())
            .collect();
        for dst in 0..size {
            for src in 0..size {
                let (tx, rx) = mpsc::channel();
                senders[src][dst] = Some(tx);
                receivers[dst][src] = Some(rx);
            }
        }
        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (tx, rx))| LocalCollective {
                rank,
                size,
                timeout,
                senders: tx.into_iter().flatten().collect(),
                receivers: Mutex::new(rx.into_iter().flatten().collect()),
            })
            .collect()
    }
}

/// One rank's endpoint in a [`LocalCollectiveGroup`]. Dropping it (including
/// while unwinding from a panic) makes every pending and later collective on
/// the other ranks fail.
pub struct LocalCollective {
    rank: usize,
    size: usize,
    timeout: Option<Duration>,
    senders: Vec<Sender<Vec<u8>>>,
    receivers: Mutex<Vec<Receiver<Vec<u8>>>>,
}

impl std::fmt::Debug for LocalCollective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCollective")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn exchange(&self, outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        if outgoing.len() != self.size {
            return Err(TesseraError::Collective(format!(
                "exchange expects {} buffers, got {}",
                self.size,
                outgoing.len()
            )));
        }
        let receivers = self
            .receivers
            .lock()
            .map_err(|_| TesseraError::Collective("collective endpoint poisoned".to_string()))?;
        for (dst, (tx, buf)) in self.senders.iter().zip(outgoing).enumerate() {
            tx.send(buf).map_err(|_| {
                TesseraError::Collective(format!(
                    "rank {} lost connection to rank {dst}",
                    self.rank
                ))
            })?;
        }
        let mut incoming = Vec::with_capacity(self.size);
        for (src, rx) in receivers.iter().enumerate() {
            let buf = match self.timeout {
                None => rx.recv().map_err(|_| {
                    TesseraError::Collective(format!(
                        "rank {} lost connection to rank {src}",
                        self.rank
                    ))
                })?,
                Some(t) => rx.recv_timeout(t).map_err(|e| match e {
                    RecvTimeoutError::Timeout => TesseraError::Collective(format!(
                        "rank {} timed out waiting for rank {src}",
                        self.rank
                    )),
                    RecvTimeoutError::Disconnected => TesseraError::Collective(format!(
                        "rank {} lost connection to rank {src}",
                        self.rank
                    )),
                })?,
            };
            incoming.push(buf);
        }
        Ok(incoming)
    }
}
